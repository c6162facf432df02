pub mod embedding;
pub mod initializer;
pub mod loss;
pub mod optimizer;
pub mod retriever;
pub mod sampler;
pub mod scoring;
pub mod tower;
pub mod trainer;

pub use embedding::{EmbeddingStore, Gradients, ParamKey};
pub use optimizer::{Adam, Optimizer, SGD};
pub use retriever::Retriever;
pub use sampler::NegativeSampler;
pub use tower::{Activation, DenseLayer, Tower};
pub use trainer::{StopHandle, Trainer};

use crate::config::{LossKind, ModelConfig};
use crate::error::{Result, Table, TowerError};
use crate::models::TrainingPair;
use crate::utils::validation::validate_model_config;
use nalgebra::DMatrix;
use rand::Rng;
use tracing::info;

/// A dual-embedding retrieval model: per-user and per-item id embeddings,
/// each mapped through its own tower into a shared representation space.
#[derive(Debug, Clone)]
pub struct TwoTowerModel {
    config: ModelConfig,
    store: EmbeddingStore,
    /// Non-trainable side features appended to each item's base embedding.
    item_features: Option<DMatrix<f32>>,
}

impl TwoTowerModel {
    pub fn new<R: Rng + ?Sized>(config: &ModelConfig, num_users: usize, num_items: usize, rng: &mut R) -> Result<Self> {
        validate_model_config(config)?;
        if num_users == 0 || num_items == 0 {
            return Err(TowerError::config(format!(
                "model needs at least one user and one item (got {num_users} users, {num_items} items)"
            )));
        }

        let (user_tower, item_tower) = if config.deep {
            (
                Tower::multilayer(rng, config.base_dim, &config.user_hidden_layers, config.embedding_dim)?,
                Tower::multilayer(
                    rng,
                    config.item_input_dim(),
                    &config.item_hidden_layers,
                    config.embedding_dim,
                )?,
            )
        } else {
            (Tower::Identity, Tower::Identity)
        };

        let store = EmbeddingStore::new(
            rng,
            num_users,
            num_items,
            config.base_dim,
            config.init_std,
            user_tower,
            item_tower,
        );

        info!(
            "Built two-tower model: {} users, {} items, base_dim={}, embedding_dim={}, deep={}, {} parameters",
            num_users,
            num_items,
            config.base_dim,
            config.embedding_dim,
            config.deep,
            store.parameter_count()
        );

        Self::from_store(config.clone(), store)
    }

    /// Wraps an existing store, checking that its towers agree with `config`.
    pub fn from_store(config: ModelConfig, store: EmbeddingStore) -> Result<Self> {
        validate_model_config(&config)?;
        if store.base_dim() != config.base_dim {
            return Err(TowerError::config(format!(
                "store base dimension {} does not match configured {}",
                store.base_dim(),
                config.base_dim
            )));
        }

        let user_out = store.tower(Table::User).output_dim(config.base_dim);
        let item_out = store.tower(Table::Item).output_dim(config.item_input_dim());
        for (side, out) in [("user", user_out), ("item", item_out)] {
            if out != config.embedding_dim {
                return Err(TowerError::config(format!(
                    "{side} tower produces {out}-dimensional representations, expected {}",
                    config.embedding_dim
                )));
            }
        }
        for (side, table, expected) in [
            ("user", Table::User, config.base_dim),
            ("item", Table::Item, config.item_input_dim()),
        ] {
            if let Some(input) = store.tower(table).input_dim() {
                if input != expected {
                    return Err(TowerError::config(format!(
                        "{side} tower expects {input} inputs, but receives {expected}"
                    )));
                }
            }
        }

        let item_features =
            (config.item_feature_dim > 0).then(|| DMatrix::zeros(store.num_items(), config.item_feature_dim));

        Ok(Self {
            config,
            store,
            item_features,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    pub fn num_users(&self) -> usize {
        self.store.num_users()
    }

    pub fn num_items(&self) -> usize {
        self.store.num_items()
    }

    pub fn embedding_dim(&self) -> usize {
        self.config.embedding_dim
    }

    /// Replaces the item side features; shape must be `num_items × item_feature_dim`.
    pub fn set_item_features(&mut self, features: DMatrix<f32>) -> Result<()> {
        let expected = (self.num_items(), self.config.item_feature_dim);
        if self.config.item_feature_dim == 0 {
            return Err(TowerError::config("model was built without item features"));
        }
        if features.ncols() != expected.1 {
            return Err(TowerError::DimensionMismatch {
                context: "item feature columns",
                expected: expected.1,
                actual: features.ncols(),
            });
        }
        if features.nrows() != expected.0 {
            return Err(TowerError::DimensionMismatch {
                context: "item feature rows",
                expected: expected.0,
                actual: features.nrows(),
            });
        }
        if features.iter().any(|v| !v.is_finite()) {
            return Err(TowerError::config("item features must be finite"));
        }
        self.item_features = Some(features);
        Ok(())
    }

    pub fn item_features(&self) -> Option<&DMatrix<f32>> {
        self.item_features.as_ref()
    }

    /// Item tower input: base embedding followed by the side features.
    fn item_inputs(&self, indices: &[usize]) -> Result<DMatrix<f32>> {
        let base = self.store.lookup(Table::Item, indices)?;
        let Some(features) = &self.item_features else {
            return Ok(base);
        };
        let base_dim = base.ncols();
        Ok(DMatrix::from_fn(indices.len(), base_dim + features.ncols(), |r, c| {
            if c < base_dim {
                base[(r, c)]
            } else {
                features[(indices[r], c - base_dim)]
            }
        }))
    }

    pub fn user_representations(&self, indices: &[usize]) -> Result<DMatrix<f32>> {
        let base = self.store.lookup(Table::User, indices)?;
        self.store
            .tower(Table::User)
            .transform(base, self.config.normalize, self.config.epsilon)
    }

    pub fn item_representations(&self, indices: &[usize]) -> Result<DMatrix<f32>> {
        let inputs = self.item_inputs(indices)?;
        self.store
            .tower(Table::Item)
            .transform(inputs, self.config.normalize, self.config.epsilon)
    }

    pub fn user_representation(&self, user: usize) -> Result<Vec<f32>> {
        let reps = self.user_representations(&[user])?;
        Ok(reps.row(0).iter().copied().collect())
    }

    /// Mean batch loss, discarding the gradients.
    pub fn batch_loss(&self, batch: &[TrainingPair], negatives: Option<&[usize]>, loss: LossKind) -> Result<f32> {
        self.loss_and_gradients(batch, negatives, loss).map(|(value, _)| value)
    }

    /// Forward pass through lookup, towers, scoring and the chosen objective,
    /// then the matching backward pass. `negatives` must be aligned with
    /// `batch` for the pairwise objective and is ignored otherwise.
    pub fn loss_and_gradients(
        &self,
        batch: &[TrainingPair],
        negatives: Option<&[usize]>,
        loss: LossKind,
    ) -> Result<(f32, Gradients)> {
        let users: Vec<usize> = batch.iter().map(|p| p.user).collect();
        let positives: Vec<usize> = batch.iter().map(|p| p.item).collect();
        let normalize = self.config.normalize;
        let epsilon = self.config.epsilon;
        let user_tower = self.store.tower(Table::User);
        let item_tower = self.store.tower(Table::Item);

        if batch.is_empty() || (loss == LossKind::InBatchSoftmax && batch.len() < 2) {
            return Err(TowerError::EmptyBatch { size: batch.len() });
        }

        let user_pass = user_tower.forward(self.store.lookup(Table::User, &users)?, normalize, epsilon)?;
        let u = &user_pass.output;

        let (value, items, d_users, d_items) = match loss {
            LossKind::InBatchSoftmax => {
                let item_pass = item_tower.forward(self.item_inputs(&positives)?, normalize, epsilon)?;
                let scores = scoring::score_matrix(u, &item_pass.output)?;
                let (value, d_scores) = loss::in_batch_softmax(&scores)?;

                let d_users = &d_scores * &item_pass.output;
                let d_items = d_scores.tr_mul(u);
                (value, (positives, item_pass), d_users, d_items)
            }
            LossKind::Pairwise => {
                let negatives = negatives.ok_or_else(|| TowerError::config("pairwise loss needs sampled negatives"))?;
                if negatives.len() != batch.len() {
                    return Err(TowerError::DimensionMismatch {
                        context: "negatives per batch",
                        expected: batch.len(),
                        actual: negatives.len(),
                    });
                }

                // Positives and negatives go through the item tower as one
                // 2B-row batch: rows [0, B) positive, [B, 2B) negative.
                let n = batch.len();
                let mut item_indices = positives;
                item_indices.extend_from_slice(negatives);
                let item_pass = item_tower.forward(self.item_inputs(&item_indices)?, normalize, epsilon)?;
                let reps = &item_pass.output;
                let pos_reps = reps.rows(0, n).into_owned();
                let neg_reps = reps.rows(n, n).into_owned();

                let pos = scoring::aligned_scores(u, &pos_reps)?;
                let neg = scoring::aligned_scores(u, &neg_reps)?;
                let (value, grad) = loss::pairwise(&pos, &neg)?;

                let dim = u.ncols();
                let d_users = DMatrix::from_fn(n, dim, |k, c| {
                    grad.positive[k] * pos_reps[(k, c)] + grad.negative[k] * neg_reps[(k, c)]
                });
                let d_items = DMatrix::from_fn(2 * n, dim, |k, c| {
                    if k < n {
                        grad.positive[k] * u[(k, c)]
                    } else {
                        grad.negative[k - n] * u[(k - n, c)]
                    }
                });
                (value, (item_indices, item_pass), d_users, d_items)
            }
        };

        let (item_indices, item_pass) = items;
        let mut gradients = self.store.zero_gradients();

        let (d_user_base, user_layers) = user_tower.backward(&user_pass, &d_users);
        let (d_item_inputs, item_layers) = item_tower.backward(&item_pass, &d_items);

        gradients.user_tower = user_layers;
        gradients.item_tower = item_layers;
        gradients.scatter_add(Table::User, &users, &d_user_base);
        // Only the leading base_dim columns belong to the trainable table;
        // side-feature columns are dropped.
        gradients.scatter_add(Table::Item, &item_indices, &d_item_inputs);

        Ok((value, gradients))
    }

    /// Single mutation point for all trainable parameters.
    pub fn apply_gradients(&mut self, gradients: &Gradients, optimizer: &mut dyn Optimizer) -> Result<()> {
        self.store.apply(gradients, optimizer)
    }
}
