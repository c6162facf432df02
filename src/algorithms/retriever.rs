use super::scoring::score_against;
use super::TwoTowerModel;
use crate::config::RetrievalConfig;
use crate::error::{Result, Table};
use crate::models::Recommendation;
use crate::utils::top_k_scored;
use rayon::prelude::*;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Chunked top-K retrieval over the whole item catalog. Item representations
/// are computed `chunk_size` rows at a time so peak memory stays bounded;
/// chunks are scored in parallel.
#[derive(Debug, Clone, Copy)]
pub struct Retriever {
    chunk_size: usize,
}

impl Retriever {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self::new(config.chunk_size)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Score of `user` against every item, indexed by item.
    pub fn score_all(&self, model: &TwoTowerModel, user: usize) -> Result<Vec<f32>> {
        model.store().check_index(Table::User, user)?;
        let user_rep = model.user_representation(user)?;
        let items: Vec<usize> = (0..model.num_items()).collect();

        let chunks = items
            .par_chunks(self.chunk_size)
            .map(|chunk| {
                let reps = model.item_representations(chunk)?;
                score_against(&user_rep, &reps)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(chunks.concat())
    }

    /// Raw id-embedding dot products, skipping both towers.
    pub fn base_scores(&self, model: &TwoTowerModel, user: usize) -> Result<Vec<f32>> {
        let store = model.store();
        let user_row = store.lookup(Table::User, &[user])?;
        let user_base: Vec<f32> = user_row.row(0).iter().copied().collect();
        let items: Vec<usize> = (0..store.num_items()).collect();

        let chunks = items
            .par_chunks(self.chunk_size)
            .map(|chunk| {
                let rows = store.lookup(Table::Item, chunk)?;
                score_against(&user_base, &rows)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(chunks.concat())
    }

    pub fn recommend(&self, model: &TwoTowerModel, user: usize, k: usize) -> Result<Vec<Recommendation>> {
        self.recommend_excluding(model, user, k, &[])
    }

    /// Like [`Retriever::recommend`], never returning any item in `exclude`.
    pub fn recommend_excluding(
        &self,
        model: &TwoTowerModel,
        user: usize,
        k: usize,
        exclude: &[usize],
    ) -> Result<Vec<Recommendation>> {
        let scores = self.score_all(model, user)?;
        let excluded: HashSet<usize> = exclude.iter().copied().collect();
        let candidates = scores
            .into_iter()
            .enumerate()
            .filter(|(item, _)| !excluded.contains(item));

        let ranked = top_k_scored(candidates, k);
        debug!(
            "Retrieved {} of {} items for user {} ({} excluded)",
            ranked.len(),
            model.num_items(),
            user,
            excluded.len()
        );
        Ok(ranked
            .into_iter()
            .map(|(item, score)| Recommendation { item, score })
            .collect())
    }

    /// Item indices in descending score order, ties by ascending index.
    /// Empty when `user` is out of range or `k` is zero.
    pub fn top_k(&self, model: &TwoTowerModel, user: usize, k: usize) -> Vec<usize> {
        self.top_k_excluding(model, user, k, &[])
    }

    pub fn top_k_excluding(&self, model: &TwoTowerModel, user: usize, k: usize, exclude: &[usize]) -> Vec<usize> {
        if k == 0 {
            return Vec::new();
        }
        match self.recommend_excluding(model, user, k, exclude) {
            Ok(recommendations) => recommendations.into_iter().map(|r| r.item).collect(),
            Err(e) => {
                warn!("No recommendations for user {}: {}", user, e);
                Vec::new()
            }
        }
    }
}

impl Default for Retriever {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::{EmbeddingStore, Tower};
    use crate::config::ModelConfig;
    use crate::error::TowerError;
    use nalgebra::DMatrix;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn fixed_model() -> TwoTowerModel {
        let users = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let items = DMatrix::from_row_slice(
            5,
            2,
            &[
                0.5, 0.0, //
                2.0, 0.0, //
                -1.0, 0.0, //
                2.0, 1.0, //
                0.0, 3.0,
            ],
        );
        let store = EmbeddingStore::from_tables(users, items, Tower::Identity, Tower::Identity).unwrap();
        TwoTowerModel::from_store(ModelConfig::baseline(2), store).unwrap()
    }

    #[test]
    fn test_score_all_matches_dot_products() {
        let model = fixed_model();
        let scores = Retriever::new(2).score_all(&model, 0).unwrap();
        assert_eq!(scores, vec![0.5, 2.0, -1.0, 2.0, 0.0]);
    }

    #[test]
    fn test_chunk_size_does_not_change_result() {
        let config = ModelConfig::default();
        let model = TwoTowerModel::new(&config, 3, 37, &mut StdRng::seed_from_u64(11)).unwrap();
        let reference = Retriever::new(1000).score_all(&model, 1).unwrap();
        for chunk_size in [1, 3, 8, 36, 37] {
            let scores = Retriever::new(chunk_size).score_all(&model, 1).unwrap();
            assert_eq!(scores.len(), 37);
            for (a, b) in scores.iter().zip(&reference) {
                assert!((a - b).abs() < 1e-5);
            }
        }
        assert_eq!(Retriever::new(1).top_k(&model, 1, 5), Retriever::new(64).top_k(&model, 1, 5));
    }

    #[test]
    fn test_top_k_orders_by_score_then_index() {
        let model = fixed_model();
        let retriever = Retriever::new(2);
        // items 1 and 3 tie at 2.0 for user 0
        assert_eq!(retriever.top_k(&model, 0, 3), vec![1, 3, 0]);
        assert_eq!(retriever.top_k(&model, 1, 2), vec![4, 3]);
    }

    #[test]
    fn test_zero_user_vector_ranks_items_by_index() {
        let users = DMatrix::from_row_slice(1, 2, &[0.0, 0.0]);
        let items = DMatrix::from_row_slice(3, 2, &[-1.0, -1.0, 1.0, 1.0, -2.0, -3.0]);
        let store = EmbeddingStore::from_tables(users, items, Tower::Identity, Tower::Identity).unwrap();
        let model = TwoTowerModel::from_store(ModelConfig::baseline(2), store).unwrap();

        let retriever = Retriever::new(2);
        assert!(retriever.score_all(&model, 0).unwrap().iter().all(|s| *s == 0.0));
        assert_eq!(retriever.top_k(&model, 0, 3), vec![0, 1, 2]);
        assert_eq!(retriever.top_k(&model, 0, 1), vec![0]);
    }

    #[test]
    fn test_top_k_caps_at_catalog_size() {
        let model = fixed_model();
        let top = Retriever::new(4).top_k(&model, 0, 50);
        assert_eq!(top.len(), 5);
        let mut unique = top.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn test_invalid_requests_return_empty() {
        let model = fixed_model();
        let retriever = Retriever::default();
        assert!(retriever.top_k(&model, 0, 0).is_empty());
        assert!(retriever.top_k(&model, 9, 3).is_empty());
        assert!(matches!(
            retriever.recommend(&model, 9, 3),
            Err(TowerError::IndexOutOfBounds { table: Table::User, index: 9, len: 2 })
        ));
    }

    #[test]
    fn test_excluded_items_are_skipped() {
        let model = fixed_model();
        let retriever = Retriever::new(3);
        assert_eq!(retriever.top_k_excluding(&model, 0, 2, &[1, 7]), vec![3, 0]);

        let recs = retriever.recommend_excluding(&model, 1, 1, &[4]).unwrap();
        assert_eq!(recs, vec![Recommendation { item: 3, score: 1.0 }]);
    }

    #[test]
    fn test_base_scores_skip_the_towers() {
        let config = ModelConfig {
            embedding_dim: 3,
            base_dim: 2,
            ..ModelConfig::default()
        };
        let model = TwoTowerModel::new(&config, 2, 4, &mut StdRng::seed_from_u64(3)).unwrap();
        let retriever = Retriever::new(3);
        let base = retriever.base_scores(&model, 1).unwrap();

        let table = model.store().table(Table::User);
        let items = model.store().table(Table::Item);
        for (item, score) in base.iter().enumerate() {
            let expected = table.row(1).dot(&items.row(item));
            assert!((score - expected).abs() < 1e-6);
        }
        assert_eq!(retriever.score_all(&model, 1).unwrap().len(), 4);
    }
}
