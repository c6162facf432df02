use crate::error::{Result, TowerError};
use nalgebra::{DMatrix, DVector};

fn check_widths(users: &DMatrix<f32>, items: &DMatrix<f32>) -> Result<()> {
    if users.ncols() != items.ncols() {
        return Err(TowerError::DimensionMismatch {
            context: "score",
            expected: users.ncols(),
            actual: items.ncols(),
        });
    }
    Ok(())
}

/// All pairwise dot products: `users · itemsᵀ`, shaped `num_users × num_items`.
pub fn score_matrix(users: &DMatrix<f32>, items: &DMatrix<f32>) -> Result<DMatrix<f32>> {
    check_widths(users, items)?;
    Ok(users * items.transpose())
}

/// Row-aligned dot products for matched `(user, item)` pairs.
pub fn aligned_scores(users: &DMatrix<f32>, items: &DMatrix<f32>) -> Result<DVector<f32>> {
    check_widths(users, items)?;
    if users.nrows() != items.nrows() {
        return Err(TowerError::DimensionMismatch {
            context: "aligned score rows",
            expected: users.nrows(),
            actual: items.nrows(),
        });
    }
    Ok(DVector::from_iterator(
        users.nrows(),
        users
            .row_iter()
            .zip(items.row_iter())
            .map(|(u, i)| u.dot(&i)),
    ))
}

/// Scores a single representation against every row of `items`.
pub fn score_against(user: &[f32], items: &DMatrix<f32>) -> Result<Vec<f32>> {
    if user.len() != items.ncols() {
        return Err(TowerError::DimensionMismatch {
            context: "score",
            expected: user.len(),
            actual: items.ncols(),
        });
    }
    Ok(items
        .row_iter()
        .map(|row| row.iter().zip(user).map(|(a, b)| a * b).sum())
        .collect())
}
