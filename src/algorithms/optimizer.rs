use super::embedding::ParamKey;
use crate::config::{OptimizerKind, TrainingConfig};
use std::collections::HashMap;

/// Updates parameter arrays in place from their gradients. One optimizer step
/// is `begin_step` followed by one `update` per parameter.
pub trait Optimizer: Send + Sync {
    fn begin_step(&mut self);
    fn update(&mut self, key: ParamKey, params: &mut [f32], gradients: &[f32]);
    fn set_learning_rate(&mut self, learning_rate: f64);
    fn reset(&mut self);
}

pub fn from_config(config: &TrainingConfig) -> Box<dyn Optimizer> {
    match config.optimizer {
        OptimizerKind::Adam => Box::new(Adam::new(
            config.learning_rate,
            config.beta1,
            config.beta2,
            config.adam_epsilon,
        )),
        OptimizerKind::Sgd => Box::new(SGD::new(config.learning_rate)),
    }
}

#[derive(Debug, Clone)]
pub struct SGD {
    learning_rate: f64,
}

impl SGD {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for SGD {
    fn begin_step(&mut self) {}

    fn update(&mut self, _key: ParamKey, params: &mut [f32], gradients: &[f32]) {
        let lr = self.learning_rate as f32;
        for (p, g) in params.iter_mut().zip(gradients) {
            *p -= lr * g;
        }
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    fn reset(&mut self) {
        // SGD doesn't maintain state
    }
}

#[derive(Debug, Clone)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    t: i32,
    moments: HashMap<ParamKey, Moments>,
}

impl Adam {
    pub fn new(learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            t: 0,
            moments: HashMap::new(),
        }
    }

    pub fn with_learning_rate(learning_rate: f64) -> Self {
        Self::new(learning_rate, 0.9, 0.999, 1e-8)
    }

    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::with_learning_rate(0.001)
    }
}

impl Optimizer for Adam {
    fn begin_step(&mut self) {
        self.t += 1;
    }

    fn update(&mut self, key: ParamKey, params: &mut [f32], gradients: &[f32]) {
        let t = self.t.max(1);
        let beta1 = self.beta1 as f32;
        let beta2 = self.beta2 as f32;
        let epsilon = self.epsilon as f32;
        let lr = self.learning_rate as f32;

        let moments = self.moments.entry(key).or_insert_with(|| Moments {
            m: vec![0.0; params.len()],
            v: vec![0.0; params.len()],
        });

        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);

        for (((p, &g), m), v) in params
            .iter_mut()
            .zip(gradients)
            .zip(moments.m.iter_mut())
            .zip(moments.v.iter_mut())
        {
            // Update biased first and second moment estimates
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;

            let m_hat = *m / bias1;
            let v_hat = *v / bias2;
            *p -= lr * m_hat / (v_hat.sqrt() + epsilon);
        }
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    fn reset(&mut self) {
        self.t = 0;
        self.moments.clear();
    }
}
