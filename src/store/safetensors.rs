//! Single-file safetensors parameter store

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use super::ParameterStore;
use crate::error::{Result, TraducirError};
use crate::safetensors::Container;
use crate::tensor::Matrix;

/// File name of the container inside a model directory
pub const SAFETENSORS_FILE: &str = "model.safetensors";

/// Parameter store backed by a safetensors container
///
/// Tensor names inside the container follow [`super::names`]. `F32`, `F16`
/// and `BF16` tensors are accepted and widened to `f32`. The file stays
/// memory-mapped for the lifetime of the store.
#[derive(Debug)]
pub struct SafetensorsStore<B = Mmap> {
    container: Container<B>,
}

impl SafetensorsStore {
    /// Map and parse a container
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file can't be read, or a parse error.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| TraducirError::IoError {
            message: format!("Cannot open {}: {e}", path.display()),
        })?;

        // SAFETY: Memory mapping is safe as long as the file isn't modified
        // while mapped. We only read from the mapping.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| TraducirError::IoError {
                message: format!("Cannot map {}: {e}", path.display()),
            })?
        };

        Ok(Self::from_container(Container::parse(mmap)?))
    }
}

impl<B: AsRef<[u8]>> SafetensorsStore<B> {
    /// Wrap an already parsed container
    #[must_use]
    pub fn from_container(container: Container<B>) -> Self {
        Self { container }
    }

    /// Number of tensors in the container
    #[must_use]
    pub fn len(&self) -> usize {
        self.container.len()
    }

    /// Whether the container holds no tensors
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.container.is_empty()
    }

    fn load(&self, name: &str, shape: &[usize]) -> Result<Vec<f32>> {
        let info = self
            .container
            .entry(name)
            .ok_or_else(|| TraducirError::MissingParameter {
                name: name.to_string(),
            })?;

        if info.shape != shape {
            return Err(TraducirError::TensorShapeMismatch {
                name: name.to_string(),
                expected: shape.to_vec(),
                actual: info.shape.clone(),
            });
        }

        self.container.read_f32(name)
    }
}

impl<B: AsRef<[u8]>> ParameterStore for SafetensorsStore<B> {
    fn load_matrix(&self, name: &str, rows: usize, cols: usize) -> Result<Matrix> {
        let data = self.load(name, &[rows, cols])?;
        Matrix::from_vec(rows, cols, data)
    }

    fn load_vector(&self, name: &str, len: usize) -> Result<Vec<f32>> {
        self.load(name, &[len])
    }

    fn contains(&self, name: &str) -> bool {
        self.container.entry(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_container(path: &Path) {
        let json = r#"{
            "encoders/input/wte":{"dtype":"F32","shape":[2,2],"data_offsets":[0,16]},
            "decoders/output/norm.b":{"dtype":"F16","shape":[2],"data_offsets":[16,20]}
        }"#;
        let mut data = Vec::new();
        data.extend_from_slice(&(json.len() as u64).to_le_bytes());
        data.extend_from_slice(json.as_bytes());
        for v in [1.0f32, 2.0, 3.0, 4.0] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        for v in [0.5f32, -1.0] {
            data.extend_from_slice(&half::f16::from_f32(v).to_le_bytes());
        }
        std::fs::write(path, data).expect("write");
    }

    #[test]
    fn test_open_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SAFETENSORS_FILE);
        write_container(&path);

        let store = SafetensorsStore::open(&path).expect("open");
        assert_eq!(store.len(), 2);

        let wte = store.load_matrix("encoders/input/wte", 2, 2).expect("matrix");
        assert_eq!(wte.row(1), &[3.0, 4.0]);
        let bias = store.load_vector("decoders/output/norm.b", 2).expect("vector");
        assert_eq!(bias, vec![0.5, -1.0]);
    }

    #[test]
    fn test_declared_shape_must_match() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SAFETENSORS_FILE);
        write_container(&path);
        let store = SafetensorsStore::open(&path).expect("open");

        let err = store.load_matrix("encoders/input/wte", 1, 4).unwrap_err();
        assert!(matches!(err, TraducirError::TensorShapeMismatch { .. }));
        assert!(matches!(
            store.load_vector("missing", 2).unwrap_err(),
            TraducirError::MissingParameter { .. }
        ));
    }

    #[test]
    fn test_store_over_in_memory_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SAFETENSORS_FILE);
        write_container(&path);
        let bytes = std::fs::read(&path).expect("read");

        let store = SafetensorsStore::from_container(Container::parse(bytes).expect("parse"));
        let mapped = SafetensorsStore::open(&path).expect("open");
        assert_eq!(
            store.load_matrix("encoders/input/wte", 2, 2).expect("matrix"),
            mapped.load_matrix("encoders/input/wte", 2, 2).expect("matrix")
        );
    }

    #[test]
    fn test_open_store_prefers_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_container(&dir.path().join(SAFETENSORS_FILE));

        let store = super::super::open_store(dir.path()).expect("store");
        assert!(store.contains("encoders/input/wte"));
    }
}
