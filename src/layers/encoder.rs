//! Transformer encoder layer
//!
//! Bidirectional self-attention followed by a feed-forward network, each
//! wrapped in residual-add + normalization (post-norm). Every position is
//! primed into the layer's cache before any position is executed, so each
//! position attends to the whole input.

use rayon::prelude::*;

use super::{add, AttentionCache, FeedForward, LayerNorm, MultiHeadAttention};
use crate::config::{ModelSettings, Stack};
use crate::error::Result;
use crate::store::{names, ParameterStore};

/// One encoder block
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    attention: MultiHeadAttention,
    attention_norm: LayerNorm,
    feed_forward: FeedForward,
    feed_forward_norm: LayerNorm,
}

impl EncoderLayer {
    /// Assemble a layer from its parts
    #[must_use]
    pub fn new(
        attention: MultiHeadAttention,
        attention_norm: LayerNorm,
        feed_forward: FeedForward,
        feed_forward_norm: LayerNorm,
    ) -> Self {
        Self {
            attention,
            attention_norm,
            feed_forward,
            feed_forward_norm,
        }
    }

    /// Load encoder layer `index` (zero-based) from a store
    ///
    /// # Errors
    ///
    /// Returns error if a required tensor is missing or has the wrong size
    pub fn load<S: ParameterStore + ?Sized>(
        store: &S,
        settings: &ModelSettings,
        index: usize,
    ) -> Result<Self> {
        let stack = Stack::Encoder;
        let hidden = settings.hidden_size;
        Ok(Self::new(
            MultiHeadAttention::load(store, settings, stack, index, false)?,
            LayerNorm::load(
                store,
                &names::layer(stack, index, "att.norm.w"),
                &names::layer(stack, index, "att.norm.b"),
                hidden,
                settings.epsilon,
            )?,
            FeedForward::load(store, settings, stack, index)?,
            LayerNorm::load(
                store,
                &names::layer(stack, index, "mlp.norm.w"),
                &names::layer(stack, index, "mlp.norm.b"),
                hidden,
                settings.epsilon,
            )?,
        ))
    }

    /// Create an empty cache sized for this layer
    ///
    /// # Errors
    ///
    /// Returns error if `capacity` is zero
    pub fn new_cache(&self, capacity: usize) -> Result<AttentionCache> {
        AttentionCache::new(
            self.attention.head_count(),
            self.attention.head_dim(),
            capacity,
        )
    }

    /// Project one position to key/value and append it to the cache
    ///
    /// # Errors
    ///
    /// Returns error on width mismatch or a full cache
    pub fn prime(&self, cache: &mut AttentionCache, hidden: &[f32]) -> Result<()> {
        self.attention.store_key_value(cache, hidden)
    }

    /// Run one position through the block
    ///
    /// Self-attention over every primed position, `+ residual`, normalize;
    /// feed-forward, `+` the attention block output, normalize.
    ///
    /// # Errors
    ///
    /// Returns error on width mismatch or an empty cache
    pub fn execute(
        &self,
        cache: &AttentionCache,
        hidden: &[f32],
        residual: &[f32],
    ) -> Result<Vec<f32>> {
        let query = self.attention.query(hidden)?;
        let attended = self.attention.attend(&query, cache)?;
        let attention_out = self.attention_norm.forward(&add(&attended, residual)?)?;

        let mlp = self.feed_forward.forward(&attention_out)?;
        self.feed_forward_norm.forward(&add(&mlp, &attention_out)?)
    }

    /// Run a whole sequence through the layer
    ///
    /// Primes every position, executes every position, then clears the
    /// cache. Each phase runs in parallel across positions. The cache is
    /// cleared on error as well.
    ///
    /// # Errors
    ///
    /// Returns error on width mismatch or if the sequence exceeds the cache
    /// capacity
    pub fn forward(&self, cache: &mut AttentionCache, states: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        let result = self.forward_primed(cache, states);
        cache.clear();
        result
    }

    fn forward_primed(
        &self,
        cache: &mut AttentionCache,
        states: &[Vec<f32>],
    ) -> Result<Vec<Vec<f32>>> {
        let entries = states
            .par_iter()
            .map(|h| self.attention.key_value(h))
            .collect::<Result<Vec<_>>>()?;
        for (key, value) in &entries {
            cache.append(key, value)?;
        }

        let cache = &*cache;
        states
            .par_iter()
            .map(|h| self.execute(cache, h, h))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Linear;
    use crate::tensor::Matrix;

    fn identity_linear(n: usize) -> Linear {
        Linear::new(Matrix::identity(n, n).expect("matrix"), None).expect("linear")
    }

    fn unit_norm(n: usize) -> LayerNorm {
        LayerNorm::new(vec![1.0; n], vec![0.0; n], 1e-5).expect("norm")
    }

    fn identity_layer() -> EncoderLayer {
        let attention = MultiHeadAttention::new(
            identity_linear(4),
            identity_linear(4),
            identity_linear(4),
            identity_linear(4),
            2,
            1,
        )
        .expect("attention");
        let ff = FeedForward::new(
            Linear::new(Matrix::identity(4, 16).expect("m"), None).expect("l1"),
            Linear::new(Matrix::identity(16, 4).expect("m"), None).expect("l2"),
        )
        .expect("ff");
        EncoderLayer::new(attention, unit_norm(4), ff, unit_norm(4))
    }

    #[test]
    fn test_prime_then_execute() {
        let layer = identity_layer();
        let mut cache = layer.new_cache(4).expect("cache");
        let h = vec![1.0, -1.0, 2.0, 0.5];

        layer.prime(&mut cache, &h).expect("prime");
        assert_eq!(cache.len(), 1);

        let out = layer.execute(&cache, &h, &h).expect("execute");
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_forward_clears_cache() {
        let layer = identity_layer();
        let mut cache = layer.new_cache(4).expect("cache");
        let states = vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]];

        let out = layer.forward(&mut cache, &states).expect("forward");
        assert_eq!(out.len(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_forward_matches_stepwise() {
        let layer = identity_layer();
        let states = vec![
            vec![1.0, 0.0, 2.0, 0.0],
            vec![0.0, 1.0, 0.0, -1.0],
            vec![0.5, 0.5, 0.5, 0.5],
        ];

        let mut cache = layer.new_cache(4).expect("cache");
        let batched = layer.forward(&mut cache, &states).expect("forward");

        for h in &states {
            layer.prime(&mut cache, h).expect("prime");
        }
        for (h, expected) in states.iter().zip(&batched) {
            let out = layer.execute(&cache, h, h).expect("execute");
            assert_eq!(&out, expected);
        }
    }

    #[test]
    fn test_forward_overflow_clears_cache() {
        let layer = identity_layer();
        let mut cache = layer.new_cache(1).expect("cache");
        let states = vec![vec![0.0; 4], vec![1.0; 4]];

        assert!(layer.forward(&mut cache, &states).is_err());
        assert!(cache.is_empty());
    }
}
