use crate::config::{Config, ModelConfig, RetrievalConfig, TrainingConfig};
use crate::error::{Result, Table, TowerError};
use crate::models::{Interaction, TrainingPair};

pub fn validate_config(config: &Config) -> Result<()> {
    validate_model_config(&config.model)?;
    validate_training_config(&config.training)?;
    validate_retrieval_config(&config.retrieval)?;
    Ok(())
}

pub fn validate_model_config(config: &ModelConfig) -> Result<()> {
    if config.embedding_dim == 0 {
        return Err(TowerError::config("Embedding dimension must be greater than 0"));
    }

    if config.base_dim == 0 {
        return Err(TowerError::config("Base dimension must be greater than 0"));
    }

    if config.deep {
        for (side, layers) in [("user", &config.user_hidden_layers), ("item", &config.item_hidden_layers)] {
            if layers.contains(&0) {
                return Err(TowerError::config(format!("{side} tower hidden layer sizes must be positive")));
            }
        }
    } else {
        // Identity towers pass the id embedding straight through
        if config.embedding_dim != config.base_dim {
            return Err(TowerError::config(format!(
                "Baseline towers need embedding_dim == base_dim (got {} and {})",
                config.embedding_dim, config.base_dim
            )));
        }
        if config.item_feature_dim > 0 {
            return Err(TowerError::config("Item side features require the deep item tower"));
        }
    }

    if !(config.init_std > 0.0) || !config.init_std.is_finite() {
        return Err(TowerError::config("Initialization std must be a positive finite number"));
    }

    if !(config.epsilon > 0.0) {
        return Err(TowerError::config("Normalization epsilon must be positive"));
    }

    Ok(())
}

pub fn validate_training_config(config: &TrainingConfig) -> Result<()> {
    if config.epochs == 0 {
        return Err(TowerError::config("Number of epochs must be greater than 0"));
    }

    if config.batch_size == 0 {
        return Err(TowerError::config("Batch size cannot be zero"));
    }

    if !(config.learning_rate > 0.0) || !config.learning_rate.is_finite() {
        return Err(TowerError::config("Learning rate must be a positive finite number"));
    }

    for (name, beta) in [("beta1", config.beta1), ("beta2", config.beta2)] {
        if !(0.0..1.0).contains(&beta) {
            return Err(TowerError::config(format!("{name} must be in [0, 1), got {beta}")));
        }
    }

    if !(config.adam_epsilon > 0.0) {
        return Err(TowerError::config("Adam epsilon must be positive"));
    }

    Ok(())
}

pub fn validate_retrieval_config(config: &RetrievalConfig) -> Result<()> {
    if config.chunk_size == 0 {
        return Err(TowerError::config("Retrieval chunk size must be greater than 0"));
    }

    if config.top_k == 0 {
        return Err(TowerError::config("Number of recommendations must be greater than 0"));
    }

    Ok(())
}

/// Every pair must reference an existing user row and item row.
pub fn validate_pairs(pairs: &[TrainingPair], num_users: usize, num_items: usize) -> Result<()> {
    for pair in pairs {
        if pair.user >= num_users {
            return Err(TowerError::IndexOutOfBounds {
                table: Table::User,
                index: pair.user,
                len: num_users,
            });
        }
        if pair.item >= num_items {
            return Err(TowerError::IndexOutOfBounds {
                table: Table::Item,
                index: pair.item,
                len: num_items,
            });
        }
    }
    Ok(())
}

pub fn validate_interaction(interaction: &Interaction, num_users: usize, num_items: usize) -> Result<()> {
    validate_pairs(&[TrainingPair::from(interaction)], num_users, num_items)?;

    if let Some(rating) = interaction.rating {
        if !rating.is_finite() {
            return Err(TowerError::config(format!(
                "Interaction ({}, {}) has a non-finite rating",
                interaction.user, interaction.item
            )));
        }
    }

    Ok(())
}
