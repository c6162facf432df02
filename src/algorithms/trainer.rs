use super::initializer::rng_from_seed;
use super::optimizer::{self, Optimizer};
use super::sampler::NegativeSampler;
use super::TwoTowerModel;
use crate::config::{LossKind, TrainingConfig};
use crate::error::{Result, TowerError};
use crate::models::{Progress, TrainingPair, TrainingReport, TrainingState};
use crate::utils::validation::{validate_pairs, validate_training_config};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Cooperative cancellation flag, checked between batches. A stop requested
/// before `start` ends that run before its first batch; the flag clears when
/// a run returns.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

type ProgressCallback = Box<dyn FnMut(&Progress) + Send>;

/// Minibatch training loop. The model is borrowed mutably for the whole run,
/// so nothing can read it mid-step.
pub struct Trainer {
    config: TrainingConfig,
    optimizer: Box<dyn Optimizer>,
    sampler: NegativeSampler,
    rng: StdRng,
    state: TrainingState,
    stop: StopHandle,
    progress: Option<ProgressCallback>,
}

impl Trainer {
    /// `interactions` is the full positive log, used to decide which items
    /// count as seen when sampling negatives.
    pub fn new(config: TrainingConfig, interactions: &[TrainingPair], num_users: usize, num_items: usize) -> Result<Self> {
        validate_training_config(&config)?;
        validate_pairs(interactions, num_users, num_items)?;
        let sampler = NegativeSampler::new(config.negative_sampling, interactions, num_users, num_items);
        Ok(Self {
            optimizer: optimizer::from_config(&config),
            rng: rng_from_seed(config.seed),
            sampler,
            config,
            state: TrainingState::Idle,
            stop: StopHandle::default(),
            progress: None,
        })
    }

    pub fn for_model(config: TrainingConfig, model: &TwoTowerModel, interactions: &[TrainingPair]) -> Result<Self> {
        Self::new(config, interactions, model.num_users(), model.num_items())
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn on_progress<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut(&Progress) + Send + 'static,
    {
        self.progress = Some(Box::new(callback));
        self
    }

    /// One forward/backward pass and one optimizer step over `batch`.
    /// Returns the batch loss computed before the update.
    pub fn train_step(&mut self, model: &mut TwoTowerModel, batch: &[TrainingPair]) -> Result<f32> {
        if batch.is_empty() {
            return Err(TowerError::EmptyBatch { size: 0 });
        }

        let (loss, gradients) = match self.config.loss {
            LossKind::InBatchSoftmax => model.loss_and_gradients(batch, None, LossKind::InBatchSoftmax)?,
            LossKind::Pairwise => {
                let sampled = self.sampler.sample_batch(&mut self.rng, batch);
                let (kept, negatives): (Vec<TrainingPair>, Vec<usize>) = batch
                    .iter()
                    .zip(sampled)
                    .filter_map(|(pair, negative)| negative.map(|n| (*pair, n)))
                    .unzip();
                if kept.len() < batch.len() {
                    warn!(
                        "Dropped {} pairs whose users have no eligible negative item",
                        batch.len() - kept.len()
                    );
                }
                if kept.is_empty() {
                    return Err(TowerError::EmptyBatch { size: 0 });
                }
                model.loss_and_gradients(&kept, Some(&negatives), LossKind::Pairwise)?
            }
        };

        if !loss.is_finite() || !gradients.is_finite() {
            return Err(TowerError::NonFiniteLoss(loss));
        }

        model.apply_gradients(&gradients, self.optimizer.as_mut())?;
        Ok(loss)
    }

    /// Trains with the configured schedule.
    pub fn fit(&mut self, model: &mut TwoTowerModel, pairs: &[TrainingPair]) -> Result<TrainingReport> {
        let TrainingConfig {
            epochs,
            batch_size,
            learning_rate,
            ..
        } = self.config;
        self.start(model, pairs, epochs, batch_size, learning_rate)
    }

    pub fn start(
        &mut self,
        model: &mut TwoTowerModel,
        pairs: &[TrainingPair],
        epochs: usize,
        batch_size: usize,
        learning_rate: f64,
    ) -> Result<TrainingReport> {
        if epochs == 0 || batch_size == 0 || !(learning_rate > 0.0) {
            return Err(TowerError::config(format!(
                "epochs ({epochs}), batch size ({batch_size}) and learning rate ({learning_rate}) must be positive"
            )));
        }
        validate_pairs(pairs, model.num_users(), model.num_items())?;

        self.config.epochs = epochs;
        self.config.batch_size = batch_size;
        self.config.learning_rate = learning_rate;
        self.optimizer.set_learning_rate(learning_rate);
        self.state = TrainingState::Running;

        let result = self.run(model, pairs);
        self.stop.reset();
        self.state = match &result {
            Ok(_) => TrainingState::Idle,
            Err(e) => {
                error!("Training failed: {}", e);
                TrainingState::Failed(e.to_string())
            }
        };
        result
    }

    fn run(&mut self, model: &mut TwoTowerModel, pairs: &[TrainingPair]) -> Result<TrainingReport> {
        let epochs = self.config.epochs;
        let batch_size = self.config.batch_size;
        let total_batches = pairs.len().div_ceil(batch_size);
        let mut order = pairs.to_vec();
        let mut report = TrainingReport::default();

        info!(
            "Training started: {} pairs, {} epochs, batch size {}, {:?} loss",
            pairs.len(),
            epochs,
            batch_size,
            self.config.loss
        );

        for epoch in 0..epochs {
            let started = Instant::now();
            if self.config.shuffle {
                order.shuffle(&mut self.rng);
            }

            let mut epoch_loss = 0.0f32;
            let mut epoch_steps = 0usize;

            for (batch_index, batch) in order.chunks(batch_size).enumerate() {
                if self.stop.is_stopped() {
                    info!("Training stopped at epoch {} batch {}", epoch + 1, batch_index);
                    report.stopped = true;
                    return Ok(report);
                }

                match self.train_step(model, batch) {
                    Ok(loss) => {
                        epoch_loss += loss;
                        epoch_steps += 1;
                        report.steps += 1;
                        report.last_loss = Some(loss);

                        let progress = Progress {
                            epoch,
                            batch: batch_index,
                            total_batches,
                            loss,
                        };
                        debug!(
                            "epoch {}/{} batch {}/{} loss={:.4}",
                            epoch + 1,
                            epochs,
                            batch_index + 1,
                            total_batches,
                            loss
                        );
                        if let Some(callback) = self.progress.as_mut() {
                            callback(&progress);
                        }
                    }
                    Err(e) if e.is_batch_local() => {
                        warn!("Skipping batch {} of epoch {}: {}", batch_index, epoch + 1, e);
                        report.skipped_batches += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            if epoch_steps > 0 {
                let mean = epoch_loss / epoch_steps as f32;
                report.epoch_losses.push(mean);
                info!(
                    "Epoch {}/{} finished in {:?}: mean loss {:.4} over {} steps",
                    epoch + 1,
                    epochs,
                    started.elapsed(),
                    mean,
                    epoch_steps
                );
            } else {
                warn!("Epoch {}/{} produced no training steps", epoch + 1, epochs);
            }
            report.epochs_completed += 1;
        }

        info!("Training finished after {} steps", report.steps);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, NegativeSampling};
    use crate::error::Table;
    use rand::SeedableRng;
    use std::sync::Mutex;

    fn model(seed: u64) -> TwoTowerModel {
        let config = ModelConfig {
            embedding_dim: 4,
            base_dim: 4,
            deep: true,
            user_hidden_layers: vec![8],
            item_hidden_layers: vec![8],
            normalize: true,
            ..ModelConfig::default()
        };
        TwoTowerModel::new(&config, 4, 6, &mut StdRng::seed_from_u64(seed)).unwrap()
    }

    fn training_config(loss: LossKind) -> TrainingConfig {
        TrainingConfig {
            epochs: 3,
            batch_size: 4,
            learning_rate: 0.01,
            loss,
            shuffle: true,
            seed: Some(99),
            ..TrainingConfig::default()
        }
    }

    fn pairs() -> Vec<TrainingPair> {
        vec![
            TrainingPair::new(0, 0),
            TrainingPair::new(1, 1),
            TrainingPair::new(2, 2),
            TrainingPair::new(3, 3),
            TrainingPair::new(0, 4),
            TrainingPair::new(1, 5),
            TrainingPair::new(2, 0),
            TrainingPair::new(3, 1),
        ]
    }

    #[test]
    fn test_train_step_changes_parameters_and_returns_finite_loss() {
        let mut model = model(1);
        let before = model.store().clone();
        let mut trainer = Trainer::for_model(training_config(LossKind::InBatchSoftmax), &model, &pairs()).unwrap();
        let loss = trainer.train_step(&mut model, &pairs()[..4]).unwrap();
        assert!(loss.is_finite() && loss > 0.0);
        assert_ne!(model.store(), &before);
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let mut model = model(1);
        let mut trainer = Trainer::for_model(training_config(LossKind::Pairwise), &model, &pairs()).unwrap();
        assert!(matches!(
            trainer.train_step(&mut model, &[]),
            Err(TowerError::EmptyBatch { size: 0 })
        ));
    }

    #[test]
    fn test_fit_reports_every_epoch_and_returns_to_idle() {
        let mut model = model(2);
        let mut trainer = Trainer::for_model(training_config(LossKind::InBatchSoftmax), &model, &pairs()).unwrap();
        let report = trainer.fit(&mut model, &pairs()).unwrap();
        assert_eq!(report.epochs_completed, 3);
        assert_eq!(report.steps, 6);
        assert_eq!(report.epoch_losses.len(), 3);
        assert!(!report.stopped);
        assert_eq!(trainer.state(), &TrainingState::Idle);
    }

    #[test]
    fn test_single_pair_tail_batch_is_skipped_for_in_batch_loss() {
        let mut model = model(3);
        let mut trainer = Trainer::for_model(training_config(LossKind::InBatchSoftmax), &model, &pairs()).unwrap();
        let mut data = pairs();
        data.push(TrainingPair::new(0, 5));
        let report = trainer.start(&mut model, &data, 1, 4, 0.01).unwrap();
        assert_eq!(report.steps, 2);
        assert_eq!(report.skipped_batches, 1);
    }

    #[test]
    fn test_progress_callback_sees_every_step() {
        let mut model = model(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut trainer = Trainer::for_model(training_config(LossKind::Pairwise), &model, &pairs()).unwrap();
        trainer.on_progress(move |p| sink.lock().unwrap().push(*p));
        trainer.fit(&mut model, &pairs()).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0].total_batches, 2);
        assert_eq!(seen[5].epoch, 2);
        assert!(seen.iter().all(|p| p.loss.is_finite() && p.loss >= 0.0));
    }

    #[test]
    fn test_stop_request_halts_at_next_batch() {
        let mut model = model(5);
        let mut trainer = Trainer::for_model(training_config(LossKind::Pairwise), &model, &pairs()).unwrap();
        let handle = trainer.stop_handle();
        trainer.on_progress(move |_| handle.stop());
        let report = trainer.fit(&mut model, &pairs()).unwrap();
        assert!(report.stopped);
        assert_eq!(report.steps, 1);
        assert_eq!(trainer.state(), &TrainingState::Idle);
    }

    #[test]
    fn test_invalid_pairs_prevent_training() {
        let mut model = model(6);
        let before = model.store().clone();
        let mut trainer = Trainer::for_model(training_config(LossKind::Pairwise), &model, &pairs()).unwrap();
        let bad = vec![TrainingPair::new(0, 1), TrainingPair::new(9, 1)];
        assert!(matches!(
            trainer.fit(&mut model, &bad),
            Err(TowerError::IndexOutOfBounds { table: Table::User, .. })
        ));
        assert_eq!(model.store(), &before);
        assert_eq!(trainer.state(), &TrainingState::Idle);
    }

    #[test]
    fn test_out_of_range_interactions_are_rejected_at_construction() {
        let config = training_config(LossKind::Pairwise);
        assert!(matches!(
            Trainer::new(config.clone(), &[TrainingPair::new(0, 9)], 4, 6),
            Err(TowerError::IndexOutOfBounds { table: Table::Item, index: 9, len: 6 })
        ));
        assert!(matches!(
            Trainer::new(config, &[TrainingPair::new(4, 0)], 4, 6),
            Err(TowerError::IndexOutOfBounds { table: Table::User, index: 4, len: 4 })
        ));
    }

    #[test]
    fn test_stop_before_start_ends_run_immediately() {
        let mut model = model(8);
        let before = model.store().clone();
        let mut trainer = Trainer::for_model(training_config(LossKind::Pairwise), &model, &pairs()).unwrap();

        trainer.stop_handle().stop();
        let report = trainer.fit(&mut model, &pairs()).unwrap();
        assert!(report.stopped);
        assert_eq!(report.steps, 0);
        assert_eq!(model.store(), &before);
        assert_eq!(trainer.state(), &TrainingState::Idle);

        let report = trainer.fit(&mut model, &pairs()).unwrap();
        assert!(!report.stopped);
        assert_eq!(report.epochs_completed, 3);
    }

    #[test]
    fn test_invalid_schedule_is_a_configuration_error() {
        let mut model = model(7);
        let mut trainer = Trainer::for_model(training_config(LossKind::Pairwise), &model, &pairs()).unwrap();
        assert!(matches!(
            trainer.start(&mut model, &pairs(), 0, 4, 0.01),
            Err(TowerError::Configuration(_))
        ));
        assert!(trainer.start(&mut model, &pairs(), 1, 4, 0.0).is_err());
    }

    #[test]
    fn test_pairwise_drops_users_without_negatives() {
        let config = ModelConfig::baseline(2);
        let mut model = TwoTowerModel::new(&config, 1, 2, &mut StdRng::seed_from_u64(8)).unwrap();
        let everything = vec![TrainingPair::new(0, 0), TrainingPair::new(0, 1)];
        let mut trainer = Trainer::for_model(
            TrainingConfig {
                negative_sampling: NegativeSampling::ExcludeSeen,
                ..training_config(LossKind::Pairwise)
            },
            &model,
            &everything,
        )
        .unwrap();
        assert!(matches!(
            trainer.train_step(&mut model, &everything),
            Err(TowerError::EmptyBatch { .. })
        ));
    }

    #[test]
    fn test_training_lowers_in_batch_loss() {
        let mut model = model(9);
        let eval = pairs();
        let before = model.batch_loss(&eval, None, LossKind::InBatchSoftmax).unwrap();
        let mut trainer = Trainer::for_model(
            TrainingConfig {
                epochs: 60,
                learning_rate: 0.02,
                ..training_config(LossKind::InBatchSoftmax)
            },
            &model,
            &eval,
        )
        .unwrap();
        trainer.fit(&mut model, &eval).unwrap();
        let after = model.batch_loss(&eval, None, LossKind::InBatchSoftmax).unwrap();
        assert!(after < before, "loss went from {before} to {after}");
    }
}
