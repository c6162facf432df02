use nalgebra::{DMatrix, RowDVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;

/// Standard normal sample via Box-Muller.
pub fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    // u1 must stay away from zero for the log.
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

pub fn normal<R: Rng + ?Sized>(rng: &mut R, size: usize, mean: f32, std_dev: f32) -> Vec<f32> {
    (0..size)
        .map(|_| standard_normal(rng) * std_dev + mean)
        .collect()
}

/// Std used for a dense layer's weights: `sqrt(2 / (fan_in + fan_out))`.
pub fn variance_scaled_std(fan_in: usize, fan_out: usize) -> f32 {
    (2.0 / (fan_in + fan_out) as f32).sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitializationMethod {
    Normal { mean: f32, std_dev: f32 },
    /// Gaussian with `variance_scaled_std(rows, cols)`.
    VarianceScaledNormal,
    Zeros,
}

impl InitializationMethod {
    pub fn initialize_matrix<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        rows: usize,
        cols: usize,
    ) -> DMatrix<f32> {
        match *self {
            InitializationMethod::Normal { mean, std_dev } => {
                DMatrix::from_fn(rows, cols, |_, _| standard_normal(rng) * std_dev + mean)
            }
            InitializationMethod::VarianceScaledNormal => {
                let std_dev = variance_scaled_std(rows, cols);
                DMatrix::from_fn(rows, cols, |_, _| standard_normal(rng) * std_dev)
            }
            InitializationMethod::Zeros => DMatrix::zeros(rows, cols),
        }
    }

    pub fn initialize_row<R: Rng + ?Sized>(&self, rng: &mut R, size: usize) -> RowDVector<f32> {
        let matrix = self.initialize_matrix(rng, 1, size);
        RowDVector::from_iterator(size, matrix.iter().copied())
    }
}

/// Seeded when a seed is configured, entropy-backed otherwise.
pub fn rng_from_seed(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_statistics() {
        let mut rng = StdRng::seed_from_u64(7);
        let samples = normal(&mut rng, 20_000, 0.0, 0.05);
        let mean = samples.iter().sum::<f32>() / samples.len() as f32;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / samples.len() as f32;
        assert!(mean.abs() < 0.002);
        assert!((var.sqrt() - 0.05).abs() < 0.003);
    }

    #[test]
    fn test_variance_scaled_std() {
        assert!((variance_scaled_std(32, 32) - (2.0f32 / 64.0).sqrt()).abs() < 1e-7);
    }

    #[test]
    fn test_seeded_initialization_is_reproducible() {
        let method = InitializationMethod::VarianceScaledNormal;
        let a = method.initialize_matrix(&mut StdRng::seed_from_u64(42), 3, 5);
        let b = method.initialize_matrix(&mut StdRng::seed_from_u64(42), 3, 5);
        assert_eq!(a, b);
        assert_eq!(a.shape(), (3, 5));
    }

    #[test]
    fn test_zeros() {
        let mut rng = StdRng::seed_from_u64(1);
        let bias = InitializationMethod::Zeros.initialize_row(&mut rng, 4);
        assert_eq!(bias.len(), 4);
        assert!(bias.iter().all(|&x| x == 0.0));
    }
}
