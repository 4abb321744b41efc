//! Neural network layers for encoder-decoder transformers
//!
//! Implements the building blocks of a translation model:
//! - Vector primitives (projection, head split/merge, arg-max)
//! - Activations (softmax, GELU)
//! - Layer normalization and linear projection
//! - Multi-head attention with session-scoped key/value caches
//! - Encoder and decoder layers
//! - Token and positional embeddings
//!
//! All computation is single-sequence `f32` on slices. Layers hold only
//! immutable weights; per-request state lives in [`AttentionCache`] and
//! [`DecoderCache`] values owned by the caller.
//!
//! ## Example
//!
//! ```rust,ignore
//! use traducir::layers::LayerNorm;
//!
//! let norm = LayerNorm::new(vec![1.0; 512], vec![0.0; 512], 1e-5)?;
//! let normalized = norm.forward(&hidden)?;
//! ```
//!
//! ## Tensor Naming
//!
//! Layers load their weights through a
//! [`ParameterStore`](crate::store::ParameterStore) using layer-indexed
//! paths (see [`crate::store::names`]):
//!
//! - `encoders/encoder{n}/att.query.w` - Encoder self-attention query
//! - `decoders/decoder{n}/att.query.encoder.w` - Decoder cross-attention query
//! - `{encoders,decoders}/{encoder,decoder}{n}/mlp.layer1.w` - Feed-forward up projection

use crate::{
    config::{ModelSettings, Stack},
    error::{Result, TraducirError},
    store::{names, ParameterStore},
    tensor::Matrix,
};

mod ops;
pub use ops::{add, add_assign, argmax, dot, merge_heads, project, project_transposed, scale, split_heads};
mod cache;
pub use cache::{AttentionCache, DecoderCache};
mod attention;
pub use attention::MultiHeadAttention;
mod encoder;
pub use encoder::EncoderLayer;
mod decoder;
pub use decoder::DecoderLayer;
mod embedding;
pub use embedding::Embeddings;

/// Apply softmax to a score vector
///
/// Softmax: `y[i] = exp(x[i]) / sum(exp(x[j]))`
///
/// Exponentials and the sum are computed in `f64` and the ratios narrowed
/// back to `f32`. The maximum is NOT subtracted first, so scores above
/// roughly 709 overflow to `inf` and produce `NaN` probabilities.
///
/// # Errors
///
/// Returns error if input is empty
///
/// # Examples
///
/// ```
/// use traducir::layers::softmax;
///
/// let probs = softmax(&[1.0, 2.0, 3.0]).unwrap();
/// let total: f32 = probs.iter().sum();
/// assert!((total - 1.0).abs() < 1e-6);
/// ```
pub fn softmax(scores: &[f32]) -> Result<Vec<f32>> {
    if scores.is_empty() {
        return Err(TraducirError::InvalidShape {
            reason: "Cannot apply softmax to empty vector".to_string(),
        });
    }

    let exp_vals: Vec<f64> = scores.iter().map(|&s| f64::from(s).exp()).collect();
    let total: f64 = exp_vals.iter().sum();

    #[allow(clippy::cast_possible_truncation)]
    let probs = exp_vals.iter().map(|&e| (e / total) as f32).collect();
    Ok(probs)
}

/// GELU activation (tanh approximation)
///
/// `y = 0.5 * x * (1 + tanh(sqrt(2/π) * (x + 0.044715 * x³)))`
#[must_use]
pub fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
}

/// Layer normalization
///
/// Normalizes a hidden state across its features:
/// ```text
/// y = (x - mean(x)) / sqrt(variance(x) + eps) * gamma + beta
/// ```
///
/// # References
///
/// Layer Normalization: <https://arxiv.org/abs/1607.06450>
#[derive(Debug, Clone)]
pub struct LayerNorm {
    /// Epsilon for numerical stability
    eps: f32,
    /// Scale parameter (gamma)
    weight: Vec<f32>,
    /// Shift parameter (beta)
    bias: Vec<f32>,
}

impl LayerNorm {
    /// Create a normalization from trained parameters
    ///
    /// # Arguments
    ///
    /// * `weight` - Scale vector (gamma)
    /// * `bias` - Shift vector (beta), same length as `weight`
    /// * `eps` - Added to the variance before the square root
    ///
    /// # Errors
    ///
    /// Returns error if the vectors are empty or differ in length
    pub fn new(weight: Vec<f32>, bias: Vec<f32>, eps: f32) -> Result<Self> {
        if weight.is_empty() {
            return Err(TraducirError::InvalidShape {
                reason: "normalized_shape must be > 0".to_string(),
            });
        }
        if weight.len() != bias.len() {
            return Err(TraducirError::InvalidShape {
                reason: format!(
                    "LayerNorm weight length {} doesn't match bias length {}",
                    weight.len(),
                    bias.len()
                ),
            });
        }

        Ok(Self { eps, weight, bias })
    }

    /// Load weight and bias vectors of length `len` from a store
    ///
    /// # Errors
    ///
    /// Returns error if either tensor is missing or has the wrong size
    pub fn load<S: ParameterStore + ?Sized>(
        store: &S,
        weight_name: &str,
        bias_name: &str,
        len: usize,
        eps: f32,
    ) -> Result<Self> {
        Self::new(
            store.load_vector(weight_name, len)?,
            store.load_vector(bias_name, len)?,
            eps,
        )
    }

    /// Forward pass through layer normalization
    ///
    /// # Errors
    ///
    /// Returns error if the input length doesn't match `normalized_shape`
    pub fn forward(&self, input: &[f32]) -> Result<Vec<f32>> {
        let n = self.weight.len();
        if input.len() != n {
            return Err(TraducirError::InvalidShape {
                reason: format!(
                    "Input length {} doesn't match normalized_shape {n}",
                    input.len()
                ),
            });
        }

        #[allow(clippy::cast_precision_loss)]
        let mean: f32 = input.iter().sum::<f32>() / n as f32;

        #[allow(clippy::cast_precision_loss)]
        let variance: f32 = input
            .iter()
            .map(|&x| {
                let diff = x - mean;
                diff * diff
            })
            .sum::<f32>()
            / n as f32;

        let denom = (variance + self.eps).sqrt();
        Ok(input
            .iter()
            .zip(self.weight.iter().zip(&self.bias))
            .map(|(&x, (&w, &b))| (x - mean) / denom * w + b)
            .collect())
    }

    /// Get the normalized shape
    #[must_use]
    pub fn normalized_shape(&self) -> usize {
        self.weight.len()
    }

    /// Get epsilon value
    #[must_use]
    pub fn eps(&self) -> f32 {
        self.eps
    }
}

/// Linear transformation layer
///
/// Applies `y = x * W + b` where `W` is `[in_features × out_features]` and
/// the bias is optional.
#[derive(Debug, Clone)]
pub struct Linear {
    /// Weight matrix `[in_features, out_features]`
    weight: Matrix,
    /// Bias vector `[out_features]`, absent when the model has none
    bias: Option<Vec<f32>>,
}

impl Linear {
    /// Create a linear layer from trained parameters
    ///
    /// # Errors
    ///
    /// Returns error if the bias length doesn't match `out_features`
    pub fn new(weight: Matrix, bias: Option<Vec<f32>>) -> Result<Self> {
        if let Some(b) = &bias {
            if b.len() != weight.cols() {
                return Err(TraducirError::InvalidShape {
                    reason: format!(
                        "Bias length {} doesn't match out_features {}",
                        b.len(),
                        weight.cols()
                    ),
                });
            }
        }
        Ok(Self { weight, bias })
    }

    /// Load a `[rows, cols]` weight and an optional `[cols]` bias
    ///
    /// # Errors
    ///
    /// Returns error if a required tensor is missing or has the wrong size
    pub fn load<S: ParameterStore + ?Sized>(
        store: &S,
        weight_name: &str,
        bias_name: &str,
        rows: usize,
        cols: usize,
        has_bias: bool,
    ) -> Result<Self> {
        let weight = store.load_matrix(weight_name, rows, cols)?;
        let bias = store.load_optional_vector(bias_name, cols, has_bias)?;
        Self::new(weight, bias)
    }

    /// Forward pass: project one row vector
    ///
    /// # Errors
    ///
    /// Returns error if the input length doesn't match `in_features`
    pub fn forward(&self, input: &[f32]) -> Result<Vec<f32>> {
        project(input, &self.weight, self.bias.as_deref())
    }

    /// Input width
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight.rows()
    }

    /// Output width
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight.cols()
    }

    /// Whether the layer adds a bias
    #[must_use]
    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }
}

/// Position-wise feed-forward network
///
/// `hidden -> 4 × hidden` with GELU, then back to `hidden` without
/// activation. Residual and normalization are applied by the owning layer.
#[derive(Debug, Clone)]
pub struct FeedForward {
    /// Expansion layer
    layer1: Linear,
    /// Contraction layer
    layer2: Linear,
}

impl FeedForward {
    /// Create a feed-forward network
    ///
    /// # Errors
    ///
    /// Returns error if `layer1` output width doesn't match `layer2` input
    /// width, or `layer2` doesn't map back to `layer1` input width
    pub fn new(layer1: Linear, layer2: Linear) -> Result<Self> {
        if layer1.out_features() != layer2.in_features()
            || layer2.out_features() != layer1.in_features()
        {
            return Err(TraducirError::InvalidShape {
                reason: format!(
                    "Feed-forward layers don't chain: [{} -> {}] then [{} -> {}]",
                    layer1.in_features(),
                    layer1.out_features(),
                    layer2.in_features(),
                    layer2.out_features()
                ),
            });
        }
        Ok(Self { layer1, layer2 })
    }

    /// Load `mlp.layer1` and `mlp.layer2` of one layer
    ///
    /// # Errors
    ///
    /// Returns error if a required tensor is missing or has the wrong size
    pub fn load<S: ParameterStore + ?Sized>(
        store: &S,
        settings: &ModelSettings,
        stack: Stack,
        index: usize,
    ) -> Result<Self> {
        let hidden = settings.hidden_size;
        let wide = settings.feed_forward_size();
        let layer1 = Linear::load(
            store,
            &names::layer(stack, index, "mlp.layer1.w"),
            &names::layer(stack, index, "mlp.layer1.b"),
            hidden,
            wide,
            settings.bias.mlp_layer1,
        )?;
        let layer2 = Linear::load(
            store,
            &names::layer(stack, index, "mlp.layer2.w"),
            &names::layer(stack, index, "mlp.layer2.b"),
            wide,
            hidden,
            settings.bias.mlp_layer2,
        )?;
        Self::new(layer1, layer2)
    }

    /// Forward pass
    ///
    /// # Errors
    ///
    /// Returns error if the input width doesn't match
    pub fn forward(&self, input: &[f32]) -> Result<Vec<f32>> {
        let mut hidden = self.layer1.forward(input)?;
        for value in &mut hidden {
            *value = gelu(*value);
        }
        self.layer2.forward(&hidden)
    }

    /// Width of the hidden layer
    #[must_use]
    pub fn intermediate_size(&self) -> usize {
        self.layer1.out_features()
    }
}

#[cfg(test)]
mod tests;
