//! Multi-head attention
//!
//! Scores are `dot(q_h, k_h) / score_divisor` where the divisor is an integer
//! model hyperparameter, not `sqrt(head_dim)`. Keys and values are read from
//! an [`AttentionCache`] the caller owns.

use super::{merge_heads, softmax, split_heads, AttentionCache, Linear};
use crate::config::{ModelSettings, Stack};
use crate::error::{Result, TraducirError};
use crate::store::{names, ParameterStore};

/// Multi-head attention with query/key/value/output projections
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    /// Query projection `[hidden, hidden]`
    query: Linear,
    /// Key projection `[hidden, hidden]`
    key: Linear,
    /// Value projection `[hidden, hidden]`
    value: Linear,
    /// Output projection `[hidden, hidden]`
    projection: Linear,
    /// Number of heads
    head_count: usize,
    /// Attention score divisor
    score_divisor: f32,
}

impl MultiHeadAttention {
    /// Create attention from its four projections
    ///
    /// # Arguments
    ///
    /// * `query`, `key`, `value`, `projection` - Square `[hidden, hidden]` projections
    /// * `head_count` - Number of heads, must divide `hidden`
    /// * `score_divisor` - Integer divisor applied to every score
    ///
    /// # Errors
    ///
    /// Returns error if a projection is not `[hidden, hidden]`, `head_count`
    /// is zero or doesn't divide `hidden`, or `score_divisor` is zero
    pub fn new(
        query: Linear,
        key: Linear,
        value: Linear,
        projection: Linear,
        head_count: usize,
        score_divisor: u32,
    ) -> Result<Self> {
        let hidden = query.in_features();
        for (name, linear) in [
            ("query", &query),
            ("key", &key),
            ("value", &value),
            ("projection", &projection),
        ] {
            if linear.in_features() != hidden || linear.out_features() != hidden {
                return Err(TraducirError::InvalidShape {
                    reason: format!(
                        "Attention {name} projection is [{}, {}], expected [{hidden}, {hidden}]",
                        linear.in_features(),
                        linear.out_features()
                    ),
                });
            }
        }
        if head_count == 0 || hidden % head_count != 0 {
            return Err(TraducirError::InvalidShape {
                reason: format!("hidden size {hidden} is not divisible by {head_count} heads"),
            });
        }
        if score_divisor == 0 {
            return Err(TraducirError::InvalidShape {
                reason: "score_divisor must be > 0".to_string(),
            });
        }

        #[allow(clippy::cast_precision_loss)]
        let score_divisor = score_divisor as f32;

        Ok(Self {
            query,
            key,
            value,
            projection,
            head_count,
            score_divisor,
        })
    }

    /// Load the four projections of one layer
    ///
    /// `cross` selects the decoder cross-attention tensors
    /// (`att.query.encoder.w`, ...). Bias flags apply to both variants.
    ///
    /// # Errors
    ///
    /// Returns error if a required tensor is missing or has the wrong size
    pub fn load<S: ParameterStore + ?Sized>(
        store: &S,
        settings: &ModelSettings,
        stack: Stack,
        index: usize,
        cross: bool,
    ) -> Result<Self> {
        let hidden = settings.hidden_size;
        let bias = settings.bias;
        let linear = |kind: &str, has_bias: bool| {
            Linear::load(
                store,
                &names::attention(stack, index, kind, cross, "w"),
                &names::attention(stack, index, kind, cross, "b"),
                hidden,
                hidden,
                has_bias,
            )
        };

        Self::new(
            linear("query", bias.query)?,
            linear("key", bias.key)?,
            linear("value", bias.value)?,
            linear("proj", bias.projection)?,
            settings.head_count(stack),
            settings.score_dividend(stack),
        )
    }

    /// Number of heads
    #[must_use]
    pub fn head_count(&self) -> usize {
        self.head_count
    }

    /// Width of one head
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.hidden_size() / self.head_count
    }

    /// Width of the hidden state
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.query.in_features()
    }

    /// Project a hidden state to its query vector
    ///
    /// # Errors
    ///
    /// Returns error if the hidden width doesn't match
    pub fn query(&self, hidden: &[f32]) -> Result<Vec<f32>> {
        self.query.forward(hidden)
    }

    /// Project a hidden state to key and value and append them to `cache`
    ///
    /// # Errors
    ///
    /// Returns error on width mismatch or a full cache
    pub fn store_key_value(&self, cache: &mut AttentionCache, hidden: &[f32]) -> Result<()> {
        let (key, value) = self.key_value(hidden)?;
        cache.append(&key, &value)
    }

    /// Project a hidden state to key and value
    ///
    /// # Errors
    ///
    /// Returns error if the hidden width doesn't match
    pub fn key_value(&self, hidden: &[f32]) -> Result<(Vec<f32>, Vec<f32>)> {
        Ok((self.key.forward(hidden)?, self.value.forward(hidden)?))
    }

    /// Attend a projected query over every entry of `cache`
    ///
    /// Per head: score each cached key, softmax, weighted sum of cached
    /// values. Heads are merged in order and passed through the output
    /// projection.
    ///
    /// # Errors
    ///
    /// Returns error if the cache is empty or its head layout differs from
    /// this attention's
    pub fn attend(&self, query: &[f32], cache: &AttentionCache) -> Result<Vec<f32>> {
        if cache.is_empty() {
            return Err(TraducirError::InferenceError(
                "Attention over an empty cache".to_string(),
            ));
        }
        if cache.head_count() != self.head_count || cache.head_dim() != self.head_dim() {
            return Err(TraducirError::InvalidShape {
                reason: format!(
                    "Cache layout {}x{} doesn't match attention {}x{}",
                    cache.head_count(),
                    cache.head_dim(),
                    self.head_count,
                    self.head_dim()
                ),
            });
        }

        let queries = split_heads(query, self.head_count)?;
        let mut sums = Vec::with_capacity(self.head_count);

        for (head, q) in queries.iter().enumerate() {
            let scores: Vec<f32> = (0..cache.len())
                .map(|pos| super::dot(q, cache.key(pos, head)) / self.score_divisor)
                .collect();
            let weights = softmax(&scores)?;

            let mut sum = vec![0.0; self.head_dim()];
            for (pos, &w) in weights.iter().enumerate() {
                for (s, &v) in sum.iter_mut().zip(cache.value(pos, head)) {
                    *s += v * w;
                }
            }
            sums.push(sum);
        }

        self.projection.forward(&merge_heads(&sums))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Matrix;

    fn identity_linear(n: usize) -> Linear {
        Linear::new(Matrix::identity(n, n).expect("matrix"), None).expect("linear")
    }

    fn identity_attention(hidden: usize, heads: usize) -> MultiHeadAttention {
        MultiHeadAttention::new(
            identity_linear(hidden),
            identity_linear(hidden),
            identity_linear(hidden),
            identity_linear(hidden),
            heads,
            1,
        )
        .expect("attention")
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let result = MultiHeadAttention::new(
            identity_linear(4),
            identity_linear(4),
            identity_linear(4),
            identity_linear(4),
            3,
            1,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_non_square_projection_rejected() {
        let wide = Linear::new(Matrix::zeros(4, 8).expect("matrix"), None).expect("linear");
        let result = MultiHeadAttention::new(
            identity_linear(4),
            wide,
            identity_linear(4),
            identity_linear(4),
            2,
            1,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_single_entry_returns_value() {
        let attn = identity_attention(4, 2);
        let mut cache = AttentionCache::new(2, 2, 4).expect("cache");
        let hidden = [1.0, 2.0, 3.0, 4.0];
        attn.store_key_value(&mut cache, &hidden).expect("store");

        // one entry: softmax weight 1, output is the value itself
        let out = attn.attend(&hidden, &cache).expect("attend");
        for (o, h) in out.iter().zip(hidden) {
            assert!((o - h).abs() < 1e-6);
        }
    }

    #[test]
    fn test_equal_scores_average_values() {
        let attn = identity_attention(2, 1);
        let mut cache = AttentionCache::new(1, 2, 4).expect("cache");
        attn.store_key_value(&mut cache, &[1.0, 0.0]).expect("store");
        attn.store_key_value(&mut cache, &[0.0, 1.0]).expect("store");

        // equal dot products with both keys
        let out = attn.attend(&[1.0, 1.0], &cache).expect("attend");
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_divisor_flattens_distribution() {
        let sharp = identity_attention(2, 1);
        let flat = MultiHeadAttention::new(
            identity_linear(2),
            identity_linear(2),
            identity_linear(2),
            identity_linear(2),
            1,
            8,
        )
        .expect("attention");

        let mut cache = AttentionCache::new(1, 2, 4).expect("cache");
        sharp.store_key_value(&mut cache, &[4.0, 0.0]).expect("store");
        sharp.store_key_value(&mut cache, &[0.0, 4.0]).expect("store");

        let q = [1.0, 0.0];
        let a = sharp.attend(&q, &cache).expect("attend");
        let b = flat.attend(&q, &cache).expect("attend");
        // larger divisor moves weight toward the lower-scoring entry
        assert!(b[1] > a[1]);
    }

    #[test]
    fn test_attend_empty_cache_error() {
        let attn = identity_attention(4, 2);
        let cache = AttentionCache::new(2, 2, 4).expect("cache");
        assert!(attn.attend(&[0.0; 4], &cache).is_err());
    }
}
