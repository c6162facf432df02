use crate::config::NegativeSampling;
use crate::models::TrainingPair;
use crate::utils::seen_items;
use rand::Rng;

/// Draws one negative item per positive pair for the pairwise objective.
#[derive(Debug, Clone)]
pub struct NegativeSampler {
    policy: NegativeSampling,
    num_items: usize,
    /// Sorted, deduplicated items per user; empty under `Uniform`.
    seen: Vec<Vec<usize>>,
}

impl NegativeSampler {
    pub fn new(policy: NegativeSampling, interactions: &[TrainingPair], num_users: usize, num_items: usize) -> Self {
        let seen = match policy {
            NegativeSampling::ExcludeSeen => seen_items(interactions, num_users),
            NegativeSampling::Uniform => Vec::new(),
        };
        Self {
            policy,
            num_items,
            seen,
        }
    }

    pub fn policy(&self) -> NegativeSampling {
        self.policy
    }

    fn seen_by(&self, user: usize) -> &[usize] {
        self.seen.get(user).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns `None` when the user has no eligible negative left.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, user: usize) -> Option<usize> {
        if self.num_items == 0 {
            return None;
        }
        match self.policy {
            NegativeSampling::Uniform => Some(rng.gen_range(0..self.num_items)),
            NegativeSampling::ExcludeSeen => {
                let seen = self.seen_by(user);
                let eligible = self.num_items.saturating_sub(seen.len());
                if eligible == 0 {
                    return None;
                }
                // Map a uniform rank among unseen items back to its index by
                // skipping over every seen item at or below it.
                let mut candidate = rng.gen_range(0..eligible);
                for &item in seen {
                    if item <= candidate {
                        candidate += 1;
                    } else {
                        break;
                    }
                }
                Some(candidate)
            }
        }
    }

    /// One negative per pair, aligned with `batch`. Pairs whose user has no
    /// eligible negative get `None`.
    pub fn sample_batch<R: Rng + ?Sized>(&self, rng: &mut R, batch: &[TrainingPair]) -> Vec<Option<usize>> {
        batch.iter().map(|pair| self.sample(rng, pair.user)).collect()
    }
}
