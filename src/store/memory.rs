//! In-memory parameter store

use std::collections::HashMap;

use super::ParameterStore;
use crate::error::{Result, TraducirError};
use crate::tensor::Matrix;

/// Parameter store holding flat tensors in a map
///
/// Used by tests, benchmarks and [`crate::testing`] synthetic models.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tensors: HashMap<String, Vec<f32>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tensor
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f32>) {
        self.tensors.insert(name.into(), values);
    }

    /// Insert or replace a matrix tensor
    pub fn insert_matrix(&mut self, name: impl Into<String>, matrix: &Matrix) {
        self.insert(name, matrix.data().to_vec());
    }

    /// Remove a tensor, returning it if present
    pub fn remove(&mut self, name: &str) -> Option<Vec<f32>> {
        self.tensors.remove(name)
    }

    /// Mutable access to a stored tensor
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Vec<f32>> {
        self.tensors.get_mut(name)
    }

    /// Number of stored tensors
    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Iterate over stored tensor names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Iterate over `(name, values)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.tensors
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    fn get(&self, name: &str, expected: usize, shape: Vec<usize>) -> Result<Vec<f32>> {
        let values = self
            .tensors
            .get(name)
            .ok_or_else(|| TraducirError::MissingParameter {
                name: name.to_string(),
            })?;
        if values.len() != expected {
            return Err(TraducirError::TensorShapeMismatch {
                name: name.to_string(),
                expected: shape,
                actual: vec![values.len()],
            });
        }
        Ok(values.clone())
    }
}

impl ParameterStore for MemoryStore {
    fn load_matrix(&self, name: &str, rows: usize, cols: usize) -> Result<Matrix> {
        let data = self.get(name, rows * cols, vec![rows, cols])?;
        Matrix::from_vec(rows, cols, data)
    }

    fn load_vector(&self, name: &str, len: usize) -> Result<Vec<f32>> {
        self.get(name, len, vec![len])
    }

    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }
}
