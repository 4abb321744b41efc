//! Directory of raw tensor files
//!
//! Each tensor `name` lives at `<root>/<name>` as a headerless sequence of
//! little-endian `f32` values. Files are memory-mapped while read.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::ParameterStore;
use crate::error::{Result, TraducirError};
use crate::tensor::Matrix;

/// Parameter store backed by one raw file per tensor
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Create a store rooted at a model directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read a tensor file, requiring exactly `expected` values
    fn read_values(&self, name: &str, expected: usize, shape: Vec<usize>) -> Result<Vec<f32>> {
        let path = self.root.join(name);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TraducirError::MissingParameter {
                    name: name.to_string(),
                }
            } else {
                TraducirError::IoError {
                    message: format!("Cannot open {}: {e}", path.display()),
                }
            }
        })?;

        let len = file
            .metadata()
            .map_err(|e| TraducirError::IoError {
                message: format!("Cannot stat {}: {e}", path.display()),
            })?
            .len();
        if len == 0 {
            return Err(TraducirError::TensorShapeMismatch {
                name: name.to_string(),
                expected: shape,
                actual: vec![0],
            });
        }

        // SAFETY: the file is opened read-only and not modified while mapped
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| TraducirError::IoError {
            message: format!("Cannot map {}: {e}", path.display()),
        })?;

        if mmap.len() % 4 != 0 || mmap.len() / 4 != expected {
            return Err(TraducirError::TensorShapeMismatch {
                name: name.to_string(),
                expected: shape,
                actual: vec![mmap.len() / 4],
            });
        }

        Ok(mmap
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }
}

impl ParameterStore for DirectoryStore {
    fn load_matrix(&self, name: &str, rows: usize, cols: usize) -> Result<Matrix> {
        let data = self.read_values(name, rows * cols, vec![rows, cols])?;
        Matrix::from_vec(rows, cols, data)
    }

    fn load_vector(&self, name: &str, len: usize) -> Result<Vec<f32>> {
        self.read_values(name, len, vec![len])
    }

    fn contains(&self, name: &str) -> bool {
        self.root.join(name).is_file()
    }
}
