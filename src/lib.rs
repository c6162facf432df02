pub mod algorithms;
pub mod config;
pub mod error;
pub mod models;
pub mod utils;

pub use algorithms::{Retriever, Trainer, TwoTowerModel};
pub use config::Config;
pub use error::{Result, Table, TowerError};
pub use models::*;

pub fn init_tracing() {
    // A subscriber may already be installed by the host process or a test.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
