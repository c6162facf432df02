//! Training objectives. Each returns the mean loss over the batch together
//! with its gradient w.r.t. the scores it consumed.

use crate::error::{Result, TowerError};
use crate::utils::{log_sum_exp, sigmoid, softplus};
use nalgebra::{DMatrix, DVector};

/// In-batch softmax cross-entropy over a square `B × B` score matrix whose
/// diagonal holds the positives.
pub fn in_batch_softmax(scores: &DMatrix<f32>) -> Result<(f32, DMatrix<f32>)> {
    let batch = scores.nrows();
    if scores.ncols() != batch {
        return Err(TowerError::DimensionMismatch {
            context: "in-batch softmax scores",
            expected: batch,
            actual: scores.ncols(),
        });
    }
    if batch < 2 {
        return Err(TowerError::EmptyBatch { size: batch });
    }

    let scale = 1.0 / batch as f32;
    let mut total = 0.0;
    let mut grad = DMatrix::zeros(batch, batch);

    for (r, row) in scores.row_iter().enumerate() {
        let logits: Vec<f32> = row.iter().copied().collect();
        let lse = log_sum_exp(&logits);
        total += lse - logits[r];

        for (c, &logit) in logits.iter().enumerate() {
            let p = (logit - lse).exp();
            let target = if c == r { 1.0 } else { 0.0 };
            grad[(r, c)] = (p - target) * scale;
        }
    }

    Ok((total * scale, grad))
}

/// Gradients of [`pairwise`] w.r.t. the positive and negative scores.
#[derive(Debug, Clone, PartialEq)]
pub struct PairwiseGradient {
    pub positive: DVector<f32>,
    pub negative: DVector<f32>,
}

/// BPR loss: mean of `softplus(neg - pos)`.
pub fn pairwise(positive: &DVector<f32>, negative: &DVector<f32>) -> Result<(f32, PairwiseGradient)> {
    let batch = positive.len();
    if negative.len() != batch {
        return Err(TowerError::DimensionMismatch {
            context: "pairwise scores",
            expected: batch,
            actual: negative.len(),
        });
    }
    if batch == 0 {
        return Err(TowerError::EmptyBatch { size: 0 });
    }

    let scale = 1.0 / batch as f32;
    let mut total = 0.0;
    let mut grad_pos = DVector::zeros(batch);
    let mut grad_neg = DVector::zeros(batch);

    for k in 0..batch {
        let margin = negative[k] - positive[k];
        total += softplus(margin);
        let slope = sigmoid(margin) * scale;
        grad_pos[k] = -slope;
        grad_neg[k] = slope;
    }

    Ok((
        total * scale,
        PairwiseGradient {
            positive: grad_pos,
            negative: grad_neg,
        },
    ))
}
