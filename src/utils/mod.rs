use crate::models::{Interaction, TrainingPair};
use std::cmp::Ordering;
use std::collections::HashMap;

pub mod metrics;
pub mod validation;

pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `ln(1 + e^x)` without overflow for large `x`.
pub fn softplus(x: f32) -> f32 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

pub fn log_sum_exp(values: &[f32]) -> f32 {
    let max = values.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|&v| (v - max).exp()).sum::<f32>().ln()
}

/// Orders by score descending, then index ascending. NaN sorts last, and
/// `-0.0` ties with `0.0`.
fn rank_order(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    match (a.1.is_nan(), b.1.is_nan()) {
        (true, true) => a.0.cmp(&b.0),
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => b.1
            .partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then(a.0.cmp(&b.0)),
    }
}

/// Indices of the `k` largest scores, in descending score order with ties
/// broken by ascending index.
pub fn top_k_indices(scores: &[f32], k: usize) -> Vec<usize> {
    top_k_scored(scores.iter().copied().enumerate(), k)
        .into_iter()
        .map(|(i, _)| i)
        .collect()
}

/// Same as [`top_k_indices`] over explicit `(index, score)` candidates.
pub fn top_k_scored<I>(candidates: I, k: usize) -> Vec<(usize, f32)>
where
    I: IntoIterator<Item = (usize, f32)>,
{
    let mut indexed: Vec<(usize, f32)> = candidates.into_iter().collect();
    if k == 0 || indexed.is_empty() {
        return Vec::new();
    }

    if k < indexed.len() {
        indexed.select_nth_unstable_by(k - 1, rank_order);
        indexed.truncate(k);
    }
    indexed.sort_by(rank_order);
    indexed
}

/// Holds out each user's most recent interaction for evaluation. Users with a
/// single interaction keep it in the training side. Records without a
/// timestamp count as older than any timestamped record; among equal
/// timestamps the later record wins.
pub fn leave_one_out_split(interactions: &[Interaction]) -> (Vec<TrainingPair>, Vec<TrainingPair>) {
    let mut latest: HashMap<usize, (usize, Option<i64>)> = HashMap::new();
    let mut counts: HashMap<usize, usize> = HashMap::new();

    for (position, interaction) in interactions.iter().enumerate() {
        *counts.entry(interaction.user).or_insert(0) += 1;
        let entry = latest
            .entry(interaction.user)
            .or_insert((position, interaction.timestamp));
        if interaction.timestamp >= entry.1 {
            *entry = (position, interaction.timestamp);
        }
    }

    let mut train = Vec::with_capacity(interactions.len());
    let mut test = Vec::new();

    for (position, interaction) in interactions.iter().enumerate() {
        let held_out = counts[&interaction.user] > 1 && latest[&interaction.user].0 == position;
        if held_out {
            test.push(TrainingPair::from(interaction));
        } else {
            train.push(TrainingPair::from(interaction));
        }
    }

    (train, test)
}

/// Per-user sorted, deduplicated item lists.
pub fn seen_items(pairs: &[TrainingPair], num_users: usize) -> Vec<Vec<usize>> {
    let mut seen = vec![Vec::new(); num_users];
    for pair in pairs {
        if let Some(items) = seen.get_mut(pair.user) {
            items.push(pair.item);
        }
    }
    for items in seen.iter_mut() {
        items.sort_unstable();
        items.dedup();
    }
    seen
}
