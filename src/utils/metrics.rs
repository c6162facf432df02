use crate::algorithms::{Retriever, TwoTowerModel};
use crate::error::Result;
use crate::models::TrainingPair;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::info;

/// Ranking quality averaged over evaluated users.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendationMetrics {
    pub precision_at_k: f64,
    pub recall_at_k: f64,
    pub f1_score: f64,
    pub hit_rate_at_k: f64,
    pub ndcg_at_k: f64,
    pub map_score: f64,
    /// Fraction of the catalog appearing in at least one list.
    pub coverage: f64,
    pub users_evaluated: usize,
}

/// Binary-relevance ranking metrics at a fixed cutoff.
#[derive(Debug, Clone)]
pub struct MetricsCalculator {
    k: usize,
}

impl MetricsCalculator {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    fn hits(&self, recommended: &[usize], relevant: &HashSet<usize>) -> usize {
        recommended
            .iter()
            .take(self.k)
            .filter(|item| relevant.contains(*item))
            .count()
    }

    pub fn calculate_precision_at_k(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        if recommended.is_empty() || self.k == 0 {
            return 0.0;
        }
        self.hits(recommended, relevant) as f64 / self.k.min(recommended.len()) as f64
    }

    pub fn calculate_recall_at_k(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        if relevant.is_empty() {
            return 0.0;
        }
        self.hits(recommended, relevant) as f64 / relevant.len() as f64
    }

    pub fn calculate_hit_rate_at_k(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        if self.hits(recommended, relevant) > 0 {
            1.0
        } else {
            0.0
        }
    }

    pub fn calculate_f1_score(&self, precision: f64, recall: f64) -> f64 {
        if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        }
    }

    /// Rank `i` (zero-based) is discounted by `log2(i + 2)`.
    pub fn calculate_ndcg_at_k(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        let dcg: f64 = recommended
            .iter()
            .take(self.k)
            .enumerate()
            .filter(|(_, item)| relevant.contains(*item))
            .map(|(i, _)| discount(i))
            .sum();
        let idcg: f64 = (0..relevant.len().min(self.k)).map(discount).sum();

        if idcg == 0.0 {
            0.0
        } else {
            dcg / idcg
        }
    }

    pub fn calculate_average_precision(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        if relevant.is_empty() {
            return 0.0;
        }

        let mut relevant_found = 0;
        let mut precision_sum = 0.0;
        for (i, item) in recommended.iter().take(self.k).enumerate() {
            if relevant.contains(item) {
                relevant_found += 1;
                precision_sum += relevant_found as f64 / (i + 1) as f64;
            }
        }

        precision_sum / relevant.len().min(self.k) as f64
    }
}

fn discount(rank: usize) -> f64 {
    1.0 / ((rank + 2) as f64).log2()
}

/// Scores every user that has held-out items: their training items are
/// excluded from retrieval and the held-out items count as relevant.
pub fn evaluate(
    model: &TwoTowerModel,
    retriever: &Retriever,
    train: &[TrainingPair],
    test: &[TrainingPair],
    k: usize,
) -> Result<RecommendationMetrics> {
    let calculator = MetricsCalculator::new(k);

    let mut relevant: BTreeMap<usize, HashSet<usize>> = BTreeMap::new();
    for pair in test {
        relevant.entry(pair.user).or_default().insert(pair.item);
    }
    let mut seen: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for pair in train {
        seen.entry(pair.user).or_default().push(pair.item);
    }

    let mut metrics = RecommendationMetrics::default();
    let mut covered: HashSet<usize> = HashSet::new();

    for (user, relevant_items) in &relevant {
        let exclude = seen.get(user).map(Vec::as_slice).unwrap_or(&[]);
        let recommended: Vec<usize> = retriever
            .recommend_excluding(model, *user, k, exclude)?
            .into_iter()
            .map(|r| r.item)
            .collect();

        let precision = calculator.calculate_precision_at_k(&recommended, relevant_items);
        let recall = calculator.calculate_recall_at_k(&recommended, relevant_items);
        metrics.precision_at_k += precision;
        metrics.recall_at_k += recall;
        metrics.f1_score += calculator.calculate_f1_score(precision, recall);
        metrics.hit_rate_at_k += calculator.calculate_hit_rate_at_k(&recommended, relevant_items);
        metrics.ndcg_at_k += calculator.calculate_ndcg_at_k(&recommended, relevant_items);
        metrics.map_score += calculator.calculate_average_precision(&recommended, relevant_items);
        covered.extend(recommended);
        metrics.users_evaluated += 1;
    }

    if metrics.users_evaluated > 0 {
        let n = metrics.users_evaluated as f64;
        metrics.precision_at_k /= n;
        metrics.recall_at_k /= n;
        metrics.f1_score /= n;
        metrics.hit_rate_at_k /= n;
        metrics.ndcg_at_k /= n;
        metrics.map_score /= n;
    }
    metrics.coverage = covered.len() as f64 / model.num_items().max(1) as f64;

    info!(
        "Evaluated {} users at k={}: hit rate {:.4}, NDCG {:.4}, recall {:.4}",
        metrics.users_evaluated, k, metrics.hit_rate_at_k, metrics.ndcg_at_k, metrics.recall_at_k
    );
    Ok(metrics)
}
