//! Synthetic Weight Generators
//!
//! Deterministic weight generation for reproducible test fixtures.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Deterministic weight generator for reproducible tests
///
/// Every call with the same seed and shape yields the same values.
///
/// # Example
///
/// ```rust
/// use traducir::testing::generators::SyntheticWeightGenerator;
///
/// let gen = SyntheticWeightGenerator::new(42);
/// let weights = gen.generate_f32(&[64, 64]);
/// assert_eq!(weights.len(), 64 * 64);
/// assert_eq!(weights, gen.generate_f32(&[64, 64]));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SyntheticWeightGenerator {
    seed: u64,
}

impl SyntheticWeightGenerator {
    /// Create generator with specific seed
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Generator for a different tensor derived from the same base seed
    #[must_use]
    pub fn derive(&self, salt: u64) -> Self {
        Self {
            seed: self
                .seed
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(salt),
        }
    }

    /// Generate F32 weights with Xavier initialization scale
    ///
    /// Scale = 1 / sqrt(fan_in) where fan_in is the first dimension
    #[must_use]
    pub fn generate_f32(&self, shape: &[usize]) -> Vec<f32> {
        let fan_in = shape.first().copied().unwrap_or(1).max(1);
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (fan_in as f32).sqrt();
        self.generate_f32_scaled(shape, scale)
    }

    /// Generate F32 weights uniformly in `[-scale, scale)`
    #[must_use]
    pub fn generate_f32_scaled(&self, shape: &[usize], scale: f32) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let n: usize = shape.iter().product();

        (0..n).map(|_| rng.gen_range(-scale..scale)).collect()
    }
}

/// Row-major `[rows, cols]` matrix with ones on the main diagonal
#[must_use]
pub fn identity_like(rows: usize, cols: usize) -> Vec<f32> {
    let mut data = vec![0.0; rows * cols];
    for i in 0..rows.min(cols) {
        data[i * cols + i] = 1.0;
    }
    data
}

/// Signed one-hot token table `[vocab, hidden]`
///
/// Row `t` is `±e[t % hidden]`, positive for the first `hidden` rows and
/// negative for the next `hidden`. For `vocab <= 2 * hidden` every row is the
/// unique maximizer of its own dot product, which makes the logit arg-max
/// controllable from the decoder output.
#[must_use]
pub fn signed_one_hot(vocab: usize, hidden: usize) -> Vec<f32> {
    let mut data = vec![0.0; vocab * hidden];
    for t in 0..vocab {
        let sign = if (t / hidden) % 2 == 0 { 1.0 } else { -1.0 };
        data[t * hidden + t % hidden] = sign;
    }
    data
}

/// Positional table `[rows, hidden]` with a small ramp per row
#[must_use]
pub fn position_ramp(rows: usize, hidden: usize) -> Vec<f32> {
    let mut data = vec![0.0; rows * hidden];
    for p in 0..rows {
        #[allow(clippy::cast_precision_loss)]
        let value = 0.1 * p as f32;
        data[p * hidden + p % hidden] = value;
    }
    data
}
