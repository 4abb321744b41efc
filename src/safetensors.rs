//! Safetensors container parsing
//!
//! Layout: <https://github.com/huggingface/safetensors>
//!
//! ```text
//! u64 LE header length │ JSON header │ tensor bytes
//!
//! header = { "__metadata__": {..}?, "<name>": { dtype, shape, data_offsets }, ... }
//! ```
//!
//! Offsets are relative to the start of the tensor bytes. Only the float
//! dtypes are readable; other dtypes parse but are rejected on read.
//!
//! A [`Container`] keeps the buffer it was parsed from, so a memory map is
//! read in place and tensors are only copied when widened to `f32`.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Result, TraducirError};

const LENGTH_PREFIX: usize = 8;
const METADATA_KEY: &str = "__metadata__";

/// Element type of a stored tensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dtype {
    /// IEEE 754 single precision
    F32,
    /// IEEE 754 half precision
    F16,
    /// bfloat16
    BF16,
    /// Any other dtype name found in the header
    Other(String),
}

impl Dtype {
    fn parse(name: &str) -> Self {
        match name {
            "F32" => Self::F32,
            "F16" => Self::F16,
            "BF16" => Self::BF16,
            other => Self::Other(other.to_string()),
        }
    }

    /// Bytes per element of a readable dtype
    #[must_use]
    pub fn width(&self) -> Option<usize> {
        match self {
            Self::F32 => Some(4),
            Self::F16 | Self::BF16 => Some(2),
            Self::Other(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct HeaderEntry {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

/// Header entry of one tensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorEntry {
    /// Element type
    pub dtype: Dtype,
    /// Declared dimensions
    pub shape: Vec<usize>,
    /// `[start, end)` within the tensor bytes
    pub range: [usize; 2],
}

impl TensorEntry {
    /// Number of elements the shape declares
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// A parsed safetensors file over its backing buffer
#[derive(Debug, Clone)]
pub struct Container<B = Vec<u8>> {
    entries: HashMap<String, TensorEntry>,
    metadata: HashMap<String, String>,
    file: B,
    data_start: usize,
}

impl<B: AsRef<[u8]>> Container<B> {
    /// Parse a whole file, keeping `file` as the tensor source
    ///
    /// # Errors
    ///
    /// Returns `FormatError` for a truncated file, a header that isn't the
    /// expected JSON, or a tensor range outside the data section.
    pub fn parse(file: B) -> Result<Self> {
        let (entries, metadata, data_start) = parse_header(file.as_ref())?;
        Ok(Self {
            entries,
            metadata,
            file,
            data_start,
        })
    }

    fn data(&self) -> &[u8] {
        &self.file.as_ref()[self.data_start..]
    }

    /// Header entry of a tensor
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&TensorEntry> {
        self.entries.get(name)
    }

    /// Number of tensors
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the file holds no tensors
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Free-form `__metadata__` strings
    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Read a tensor, widening half-precision values to `f32`
    ///
    /// # Errors
    ///
    /// - `MissingParameter` if there is no such tensor
    /// - `UnsupportedOperation` for a non-float dtype
    /// - `DataShapeMismatch` if the byte range doesn't hold the declared shape
    pub fn read_f32(&self, name: &str) -> Result<Vec<f32>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| TraducirError::MissingParameter {
                name: name.to_string(),
            })?;
        let width = entry
            .dtype
            .width()
            .ok_or_else(|| TraducirError::UnsupportedOperation {
                operation: "read_f32".to_string(),
                reason: format!("'{name}' has dtype {:?}", entry.dtype),
            })?;

        let [start, end] = entry.range;
        let raw = &self.data()[start..end];
        let expected = entry.element_count() * width;
        if raw.len() != expected {
            return Err(TraducirError::DataShapeMismatch {
                data_size: raw.len(),
                shape: entry.shape.clone(),
                expected,
            });
        }

        let values = match entry.dtype {
            Dtype::F16 => raw
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            Dtype::BF16 => raw
                .chunks_exact(2)
                .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            _ => raw
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        };
        Ok(values)
    }
}

type Header = (HashMap<String, TensorEntry>, HashMap<String, String>, usize);

/// Split a file into tensor entries, metadata and the data section offset
fn parse_header(file: &[u8]) -> Result<Header> {
    let prefix = file
        .get(..LENGTH_PREFIX)
        .and_then(|p| <[u8; LENGTH_PREFIX]>::try_from(p).ok())
        .ok_or_else(|| format_error("file is shorter than the length prefix".to_string()))?;
    let header_len = usize::try_from(u64::from_le_bytes(prefix))
        .map_err(|_| format_error("header length overflows usize".to_string()))?;

    let rest = &file[LENGTH_PREFIX..];
    if header_len > rest.len() {
        return Err(format_error(format!(
            "header of {header_len} bytes runs past the end of a {} byte file",
            file.len()
        )));
    }
    let (header, bytes) = rest.split_at(header_len);

    let mut raw: HashMap<String, serde_json::Value> =
        serde_json::from_slice(header).map_err(|e| format_error(format!("header: {e}")))?;

    let metadata = match raw.remove(METADATA_KEY) {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| format_error(format!("{METADATA_KEY}: {e}")))?,
        None => HashMap::new(),
    };

    let mut entries = HashMap::with_capacity(raw.len());
    for (name, value) in raw {
        let entry: HeaderEntry =
            serde_json::from_value(value).map_err(|e| format_error(format!("'{name}': {e}")))?;
        let [start, end] = entry.data_offsets;
        if start > end || end > bytes.len() {
            return Err(format_error(format!(
                "'{name}' range [{start}, {end}) is outside the {} byte data section",
                bytes.len()
            )));
        }
        entries.insert(
            name,
            TensorEntry {
                dtype: Dtype::parse(&entry.dtype),
                shape: entry.shape,
                range: entry.data_offsets,
            },
        );
    }

    Ok((entries, metadata, LENGTH_PREFIX + header_len))
}

fn format_error(reason: String) -> TraducirError {
    TraducirError::FormatError {
        reason: format!("safetensors {reason}"),
    }
}
