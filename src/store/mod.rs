//! Parameter storage
//!
//! Trained tensors are resolved by name to a matrix of a declared
//! `[rows, cols]` shape or a vector of a declared length. Three backends:
//!
//! - [`DirectoryStore`]: one raw little-endian `f32` file per tensor
//! - [`SafetensorsStore`]: a single `model.safetensors` container
//! - [`MemoryStore`]: in-memory map for tests and synthetic models
//!
//! Tensor names are built by [`names`].

use std::path::Path;

use crate::error::Result;
use crate::tensor::Matrix;

mod directory;
pub use directory::DirectoryStore;
mod memory;
pub use memory::MemoryStore;
mod safetensors;
pub use safetensors::{SafetensorsStore, SAFETENSORS_FILE};

/// Source of named model parameters
pub trait ParameterStore {
    /// Load a `[rows × cols]` matrix
    ///
    /// # Errors
    ///
    /// - `MissingParameter` if the tensor doesn't exist
    /// - `TensorShapeMismatch` if its size or shape differs
    fn load_matrix(&self, name: &str, rows: usize, cols: usize) -> Result<Matrix>;

    /// Load a vector of `len` values
    ///
    /// # Errors
    ///
    /// - `MissingParameter` if the tensor doesn't exist
    /// - `TensorShapeMismatch` if its size or shape differs
    fn load_vector(&self, name: &str, len: usize) -> Result<Vec<f32>>;

    /// Load a vector the model may not have
    ///
    /// Returns `Ok(None)` without touching storage when `present` is false.
    ///
    /// # Errors
    ///
    /// Same as [`ParameterStore::load_vector`] when `present` is true.
    fn load_optional_vector(
        &self,
        name: &str,
        len: usize,
        present: bool,
    ) -> Result<Option<Vec<f32>>> {
        if present {
            self.load_vector(name, len).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Whether a tensor with this name exists
    fn contains(&self, name: &str) -> bool;
}

/// Open the store for a model directory
///
/// Uses [`SafetensorsStore`] when the directory holds a
/// `model.safetensors`, otherwise [`DirectoryStore`].
///
/// # Errors
///
/// Returns error if the safetensors container can't be read or parsed.
pub fn open_store(dir: impl AsRef<Path>) -> Result<Box<dyn ParameterStore>> {
    let dir = dir.as_ref();
    let container = dir.join(SAFETENSORS_FILE);
    if container.is_file() {
        Ok(Box::new(SafetensorsStore::open(&container)?))
    } else {
        Ok(Box::new(DirectoryStore::new(dir)))
    }
}

/// Tensor naming scheme
///
/// Layer indices passed to these functions are zero-based; stored names
/// number layers from 1.
pub mod names {
    use crate::config::Stack;

    /// Token embedding table, shared by both stacks
    pub const TOKEN_EMBEDDINGS: &str = "encoders/input/wte";

    fn root(stack: Stack) -> &'static str {
        match stack {
            Stack::Encoder => "encoders",
            Stack::Decoder => "decoders",
        }
    }

    /// Positional embedding table of a stack
    #[must_use]
    pub fn position_embeddings(stack: Stack) -> String {
        format!("{}/input/wpe", root(stack))
    }

    /// Input normalization of a stack, `part` is `w` or `b`
    #[must_use]
    pub fn input_norm(stack: Stack, part: &str) -> String {
        format!("{}/input/norm.{part}", root(stack))
    }

    /// Final normalization of a stack, `part` is `w` or `b`
    #[must_use]
    pub fn output_norm(stack: Stack, part: &str) -> String {
        format!("{}/output/norm.{part}", root(stack))
    }

    /// Tensor of one layer, e.g. `layer(Stack::Decoder, 0, "mlp.layer1.w")`
    /// is `decoders/decoder1/mlp.layer1.w`
    #[must_use]
    pub fn layer(stack: Stack, index: usize, tensor: &str) -> String {
        format!("{}/{}{}/{tensor}", root(stack), stack.name(), index + 1)
    }

    /// Attention tensor of one layer
    ///
    /// `kind` is `query`, `key`, `value`, `proj` or `norm`; `part` is `w` or
    /// `b`. Cross attention inserts the `.encoder` infix:
    /// `att.query.encoder.w`.
    #[must_use]
    pub fn attention(stack: Stack, index: usize, kind: &str, cross: bool, part: &str) -> String {
        if cross {
            layer(stack, index, &format!("att.{kind}.encoder.{part}"))
        } else {
            layer(stack, index, &format!("att.{kind}.{part}"))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_layer_names_are_one_based() {
            assert_eq!(
                layer(Stack::Encoder, 0, "mlp.layer1.w"),
                "encoders/encoder1/mlp.layer1.w"
            );
            assert_eq!(
                layer(Stack::Decoder, 5, "mlp.norm.b"),
                "decoders/decoder6/mlp.norm.b"
            );
        }

        #[test]
        fn test_cross_attention_infix() {
            assert_eq!(
                attention(Stack::Decoder, 0, "query", true, "w"),
                "decoders/decoder1/att.query.encoder.w"
            );
            assert_eq!(
                attention(Stack::Decoder, 1, "norm", false, "b"),
                "decoders/decoder2/att.norm.b"
            );
        }

        #[test]
        fn test_stack_level_names() {
            assert_eq!(position_embeddings(Stack::Decoder), "decoders/input/wpe");
            assert_eq!(input_norm(Stack::Encoder, "w"), "encoders/input/norm.w");
            assert_eq!(output_norm(Stack::Decoder, "b"), "decoders/output/norm.b");
        }
    }
}
