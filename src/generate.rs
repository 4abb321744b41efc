//! Token selection
//!
//! Turns the logits of one decode step into the next token. Policies sit
//! behind [`TokenSampler`]:
//!
//! - [`GreedySampler`]: arg-max, the default
//! - [`WeightedRandomSampler`]: draw from `softmax(logits)` with a seeded RNG

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TraducirError};
use crate::layers::{argmax, softmax};

/// Next-token selection policy
pub trait TokenSampler: Send {
    /// Short policy name for logs and traces
    fn name(&self) -> &'static str;

    /// Pick a token id from one step's logits
    ///
    /// # Errors
    ///
    /// Returns error if the logits are empty
    fn select(&mut self, logits: &[f32]) -> Result<u32>;
}

/// Arg-max selection
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedySampler;

impl TokenSampler for GreedySampler {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn select(&mut self, logits: &[f32]) -> Result<u32> {
        sample_greedy(logits)
    }
}

/// Random selection weighted by `softmax(logits)`
#[derive(Debug, Clone)]
pub struct WeightedRandomSampler {
    rng: StdRng,
}

impl WeightedRandomSampler {
    /// Create a sampler with a fixed seed
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl TokenSampler for WeightedRandomSampler {
    fn name(&self) -> &'static str {
        "weighted_random"
    }

    fn select(&mut self, logits: &[f32]) -> Result<u32> {
        let probs = softmax(logits)?;
        let rng_value: f32 = self.rng.gen_range(0.0..1.0);
        token_id(sample_from_distribution(&probs, rng_value))
    }
}

/// Index of the largest logit as a token id
///
/// # Errors
///
/// Returns error if the logits are empty
pub fn sample_greedy(logits: &[f32]) -> Result<u32> {
    token_id(argmax(logits)?)
}

/// Pick an index from a probability vector
///
/// Walks the cumulative distribution and returns the first index whose
/// cumulative mass exceeds `rng_value * total`. Falls back to the last index
/// when rounding leaves the draw past the end.
#[must_use]
pub fn sample_from_distribution(probs: &[f32], rng_value: f32) -> usize {
    let total: f32 = probs.iter().sum();
    let target = rng_value * total;

    let mut cumulative = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if target < cumulative {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}

fn token_id(index: usize) -> Result<u32> {
    u32::try_from(index).map_err(|_| {
        TraducirError::InferenceError(format!("Token index {index} exceeds u32 range"))
    })
}

/// Which selection policy to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    /// Arg-max
    #[default]
    Greedy,
    /// Softmax-weighted random draw
    WeightedRandom {
        /// RNG seed
        seed: u64,
    },
}

impl SamplerKind {
    /// Instantiate the sampler
    #[must_use]
    pub fn build(self) -> Box<dyn TokenSampler> {
        match self {
            Self::Greedy => Box::new(GreedySampler),
            Self::WeightedRandom { seed } => Box::new(WeightedRandomSampler::new(seed)),
        }
    }
}

/// Decode loop parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum decode steps; `None` uses the model's context size. Values
    /// above the context size are capped to it.
    pub max_positions: Option<usize>,
    /// Selection policy
    pub sampler: SamplerKind,
}

impl GenerationConfig {
    /// Greedy decoding up to the context size
    #[must_use]
    pub fn greedy() -> Self {
        Self::default()
    }

    /// Set the step limit
    #[must_use]
    pub fn with_max_positions(mut self, max_positions: usize) -> Self {
        self.max_positions = Some(max_positions);
        self
    }

    /// Set the selection policy
    #[must_use]
    pub fn with_sampler(mut self, sampler: SamplerKind) -> Self {
        self.sampler = sampler;
        self
    }

    /// Effective step limit for a model with `context_size` positions
    #[must_use]
    pub fn step_limit(&self, context_size: usize) -> usize {
        self.max_positions
            .map_or(context_size, |m| m.min(context_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greedy_picks_max() {
        let mut sampler = GreedySampler;
        assert_eq!(sampler.select(&[0.1, 3.0, -1.0]).expect("select"), 1);
        assert!(sampler.select(&[]).is_err());
        assert_eq!(sampler.name(), "greedy");
    }

    #[test]
    fn test_distribution_boundaries() {
        let probs = [0.25, 0.5, 0.25];
        assert_eq!(sample_from_distribution(&probs, 0.0), 0);
        assert_eq!(sample_from_distribution(&probs, 0.3), 1);
        assert_eq!(sample_from_distribution(&probs, 0.74), 1);
        assert_eq!(sample_from_distribution(&probs, 0.8), 2);
        assert_eq!(sample_from_distribution(&probs, 1.0), 2);
    }

    #[test]
    fn test_distribution_skips_zero_mass() {
        let probs = [0.0, 1.0, 0.0];
        for r in [0.0, 0.5, 0.99] {
            assert_eq!(sample_from_distribution(&probs, r), 1);
        }
    }

    #[test]
    fn test_weighted_random_is_reproducible() {
        let logits = [0.5, 0.4, 0.3, 0.2, 0.1];
        let mut a = WeightedRandomSampler::new(42);
        let mut b = WeightedRandomSampler::new(42);
        for _ in 0..20 {
            assert_eq!(
                a.select(&logits).expect("select"),
                b.select(&logits).expect("select")
            );
        }
    }

    #[test]
    fn test_weighted_random_follows_dominant_logit() {
        let mut sampler = WeightedRandomSampler::new(7);
        for _ in 0..20 {
            assert_eq!(sampler.select(&[0.0, 50.0, 0.0]).expect("select"), 1);
        }
    }

    #[test]
    fn test_step_limit() {
        assert_eq!(GenerationConfig::greedy().step_limit(5), 5);
        assert_eq!(GenerationConfig::greedy().with_max_positions(3).step_limit(5), 3);
        assert_eq!(GenerationConfig::greedy().with_max_positions(9).step_limit(5), 5);
    }

    #[test]
    fn test_sampler_kind_build() {
        assert_eq!(SamplerKind::default().build().name(), "greedy");
        assert_eq!(
            SamplerKind::WeightedRandom { seed: 1 }.build().name(),
            "weighted_random"
        );
    }
}
