use serde::{Deserialize, Serialize};

/// One observed positive (user, item) interaction, by dense row index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrainingPair {
    pub user: usize,
    pub item: usize,
}

/// A raw interaction record as delivered by the ingestion layer. Indices are
/// already resolved to dense, zero-based rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub user: usize,
    pub item: usize,
    pub rating: Option<f32>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub item: usize,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingState {
    Idle,
    Running,
    Failed(String),
}

/// Emitted after every optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub epoch: usize,
    pub batch: usize,
    pub total_batches: usize,
    pub loss: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub epochs_completed: usize,
    pub steps: usize,
    pub skipped_batches: usize,
    /// Mean batch loss per completed epoch.
    pub epoch_losses: Vec<f32>,
    pub last_loss: Option<f32>,
    pub stopped: bool,
}

impl TrainingPair {
    pub fn new(user: usize, item: usize) -> Self {
        Self { user, item }
    }
}

impl From<&Interaction> for TrainingPair {
    fn from(interaction: &Interaction) -> Self {
        Self::new(interaction.user, interaction.item)
    }
}

impl Interaction {
    pub fn new(user: usize, item: usize) -> Self {
        Self {
            user,
            item,
            rating: None,
            timestamp: None,
        }
    }

    pub fn with_rating(mut self, rating: f32) -> Self {
        self.rating = Some(rating);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

impl TrainingReport {
    pub fn final_epoch_loss(&self) -> Option<f32> {
        self.epoch_losses.last().copied()
    }
}
