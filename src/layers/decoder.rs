//! Transformer decoder layer
//!
//! Three post-norm residual blocks per step: causal self-attention,
//! cross-attention against the encoder outputs, and feed-forward.
//!
//! Causality needs no mask: decoding is strictly sequential, so when step
//! `k` runs the self cache holds exactly positions `0..=k`.

use rayon::prelude::*;

use super::{add, DecoderCache, FeedForward, LayerNorm, MultiHeadAttention};
use crate::config::{ModelSettings, Stack};
use crate::error::Result;
use crate::store::{names, ParameterStore};

/// One decoder block
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    self_attention: MultiHeadAttention,
    self_attention_norm: LayerNorm,
    cross_attention: MultiHeadAttention,
    cross_attention_norm: LayerNorm,
    feed_forward: FeedForward,
    feed_forward_norm: LayerNorm,
}

impl DecoderLayer {
    /// Assemble a layer from its parts
    #[must_use]
    pub fn new(
        self_attention: (MultiHeadAttention, LayerNorm),
        cross_attention: (MultiHeadAttention, LayerNorm),
        feed_forward: (FeedForward, LayerNorm),
    ) -> Self {
        Self {
            self_attention: self_attention.0,
            self_attention_norm: self_attention.1,
            cross_attention: cross_attention.0,
            cross_attention_norm: cross_attention.1,
            feed_forward: feed_forward.0,
            feed_forward_norm: feed_forward.1,
        }
    }

    /// Load decoder layer `index` (zero-based) from a store
    ///
    /// # Errors
    ///
    /// Returns error if a required tensor is missing or has the wrong size
    pub fn load<S: ParameterStore + ?Sized>(
        store: &S,
        settings: &ModelSettings,
        index: usize,
    ) -> Result<Self> {
        let stack = Stack::Decoder;
        let hidden = settings.hidden_size;
        let eps = settings.epsilon;
        let attention_norm = |cross: bool| {
            LayerNorm::load(
                store,
                &names::attention(stack, index, "norm", cross, "w"),
                &names::attention(stack, index, "norm", cross, "b"),
                hidden,
                eps,
            )
        };

        Ok(Self::new(
            (
                MultiHeadAttention::load(store, settings, stack, index, false)?,
                attention_norm(false)?,
            ),
            (
                MultiHeadAttention::load(store, settings, stack, index, true)?,
                attention_norm(true)?,
            ),
            (
                FeedForward::load(store, settings, stack, index)?,
                LayerNorm::load(
                    store,
                    &names::layer(stack, index, "mlp.norm.w"),
                    &names::layer(stack, index, "mlp.norm.b"),
                    hidden,
                    eps,
                )?,
            ),
        ))
    }

    /// Create empty caches sized for this layer
    ///
    /// # Errors
    ///
    /// Returns error if `capacity` is zero
    pub fn new_cache(&self, capacity: usize) -> Result<DecoderCache> {
        DecoderCache::new(
            self.self_attention.head_count(),
            self.self_attention.head_dim(),
            capacity,
        )
    }

    /// Fill the cross-attention cache from the encoder outputs
    ///
    /// Projections run in parallel; entries are appended in position order.
    ///
    /// # Errors
    ///
    /// Returns error on width mismatch or if the outputs exceed the cache
    /// capacity
    pub fn prime_cross(&self, cache: &mut DecoderCache, encoder_outputs: &[Vec<f32>]) -> Result<()> {
        let entries = encoder_outputs
            .par_iter()
            .map(|h| self.cross_attention.key_value(h))
            .collect::<Result<Vec<_>>>()?;
        for (key, value) in &entries {
            cache.cross_attn.append(key, value)?;
        }
        Ok(())
    }

    /// Run one decode step through the block
    ///
    /// Appends this step's key/value to the self cache before scoring, so
    /// the new position attends to itself.
    ///
    /// # Errors
    ///
    /// Returns error on width mismatch, a full self cache, or an unprimed
    /// cross cache
    pub fn execute(&self, cache: &mut DecoderCache, hidden: &[f32]) -> Result<Vec<f32>> {
        // causal self-attention
        let query = self.self_attention.query(hidden)?;
        self.self_attention
            .store_key_value(&mut cache.self_attn, hidden)?;
        let attended = self.self_attention.attend(&query, &cache.self_attn)?;
        let self_out = self.self_attention_norm.forward(&add(&attended, hidden)?)?;

        // cross-attention
        let query = self.cross_attention.query(&self_out)?;
        let attended = self.cross_attention.attend(&query, &cache.cross_attn)?;
        let cross_out = self
            .cross_attention_norm
            .forward(&add(&attended, &self_out)?)?;

        let mlp = self.feed_forward.forward(&cross_out)?;
        self.feed_forward_norm.forward(&add(&mlp, &cross_out)?)
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

    fn attention() -> MultiHeadAttention {
        MultiHeadAttention::new(
            identity_linear(4),
            identity_linear(4),
            identity_linear(4),
            identity_linear(4),
            2,
            1,
        )
        .expect("attention")
    }

    fn identity_layer() -> DecoderLayer {
        let ff = FeedForward::new(
            Linear::new(Matrix::identity(4, 16).expect("m"), None).expect("l1"),
            Linear::new(Matrix::identity(16, 4).expect("m"), None).expect("l2"),
        )
        .expect("ff");
        DecoderLayer::new(
            (attention(), unit_norm(4)),
            (attention(), unit_norm(4)),
            (ff, unit_norm(4)),
        )
    }

    #[test]
    fn test_self_cache_grows_per_step() {
        let layer = identity_layer();
        let mut cache = layer.new_cache(5).expect("cache");
        let outputs = vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 0.0, 1.0, 0.0]];
        layer.prime_cross(&mut cache, &outputs).expect("prime");

        let mut h = vec![0.5, -0.5, 1.0, 0.0];
        for step in 1..=3 {
            h = layer.execute(&mut cache, &h).expect("execute");
            assert_eq!(cache.self_attn.len(), step);
            assert_eq!(cache.cross_attn.len(), 2);
        }
    }

    #[test]
    fn test_execute_without_cross_priming_fails() {
        let layer = identity_layer();
        let mut cache = layer.new_cache(5).expect("cache");
        assert!(layer.execute(&mut cache, &[1.0, 0.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn test_step_ignores_future_entries() {
        // a step's output depends only on entries 0..=k: running the same
        // prefix in a fresh cache gives the same result
        let layer = identity_layer();
        let outputs = vec![vec![1.0, 2.0, 3.0, 4.0]];
        let inputs = [vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]];

        let mut long = layer.new_cache(5).expect("cache");
        layer.prime_cross(&mut long, &outputs).expect("prime");
        let first = layer.execute(&mut long, &inputs[0]).expect("execute");
        let _ = layer.execute(&mut long, &inputs[1]).expect("execute");

        let mut short = layer.new_cache(5).expect("cache");
        layer.prime_cross(&mut short, &outputs).expect("prime");
        let again = layer.execute(&mut short, &inputs[0]).expect("execute");
        assert_eq!(first, again);
    }
}
