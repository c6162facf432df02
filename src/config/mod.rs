use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Dimension of the final user/item representations.
    pub embedding_dim: usize,
    /// Dimension of the trainable id embeddings fed into each tower.
    pub base_dim: usize,
    /// Multilayer towers when true, identity towers otherwise.
    pub deep: bool,
    pub user_hidden_layers: Vec<usize>,
    pub item_hidden_layers: Vec<usize>,
    pub normalize: bool,
    /// Width of the optional per-item side features (e.g. genre flags).
    pub item_feature_dim: usize,
    pub init_std: f32,
    /// Floor applied to vector norms before dividing.
    pub epsilon: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LossKind {
    InBatchSoftmax,
    Pairwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegativeSampling {
    /// Draw negatives only among items the user never interacted with.
    ExcludeSeen,
    /// Draw negatives uniformly over the whole catalog.
    Uniform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub loss: LossKind,
    pub negative_sampling: NegativeSampling,
    pub optimizer: OptimizerKind,
    pub beta1: f64,
    pub beta2: f64,
    pub adam_epsilon: f64,
    pub shuffle: bool,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub chunk_size: usize,
    pub top_k: usize,
    pub exclude_seen: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 32,
            base_dim: 32,
            deep: true,
            user_hidden_layers: vec![64],
            item_hidden_layers: vec![64],
            normalize: true,
            item_feature_dim: 0,
            init_std: 0.05,
            epsilon: 1e-6,
        }
    }
}

impl ModelConfig {
    /// Identity towers over `dim`-wide embeddings.
    pub fn baseline(dim: usize) -> Self {
        Self {
            embedding_dim: dim,
            base_dim: dim,
            deep: false,
            user_hidden_layers: Vec::new(),
            item_hidden_layers: Vec::new(),
            normalize: false,
            ..Self::default()
        }
    }

    /// Same hidden layer sizes for both towers.
    pub fn with_hidden_layers(mut self, sizes: Vec<usize>) -> Self {
        self.user_hidden_layers = sizes.clone();
        self.item_hidden_layers = sizes;
        self
    }

    pub fn item_input_dim(&self) -> usize {
        self.base_dim + self.item_feature_dim
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 6,
            batch_size: 256,
            learning_rate: 0.005,
            loss: LossKind::InBatchSoftmax,
            negative_sampling: NegativeSampling::ExcludeSeen,
            optimizer: OptimizerKind::Adam,
            beta1: 0.9,
            beta2: 0.999,
            adam_epsilon: 1e-8,
            shuffle: true,
            seed: None,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            top_k: 10,
            exclude_seen: true,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TOWERREC").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        crate::utils::validation::validate_config(self)
    }
}
