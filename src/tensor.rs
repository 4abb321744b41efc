//! Dense f32 matrix
//!
//! Weight matrices and embedding tables are stored as a row-major
//! `[rows × cols]` buffer. A projection multiplies a row vector by the matrix
//! (`[rows] × [rows × cols] -> [cols]`), so `rows` is the input width and
//! `cols` the output width.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TraducirError};

/// Row-major `[rows × cols]` matrix of f32 values
///
/// # Examples
///
/// ```
/// use traducir::Matrix;
///
/// let m = Matrix::from_vec(2, 3, vec![
///     1.0, 2.0, 3.0,
///     4.0, 5.0, 6.0,
/// ]).unwrap();
///
/// assert_eq!(m.rows(), 2);
/// assert_eq!(m.cols(), 3);
/// assert_eq!(m.row(1), &[4.0, 5.0, 6.0]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    /// Flattened data in row-major order
    data: Vec<f32>,
}

impl Matrix {
    /// Create a matrix from flattened row-major data
    ///
    /// # Errors
    ///
    /// Returns `Err` if either dimension is zero or the data length is not
    /// `rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(TraducirError::InvalidShape {
                reason: format!("Matrix dimensions cannot be zero ({rows}x{cols})"),
            });
        }

        let expected = rows * cols;
        if data.len() != expected {
            return Err(TraducirError::DataShapeMismatch {
                data_size: data.len(),
                shape: vec![rows, cols],
                expected,
            });
        }

        Ok(Self { rows, cols, data })
    }

    /// Create a zero-filled matrix
    ///
    /// # Errors
    ///
    /// Returns `Err` if either dimension is zero.
    pub fn zeros(rows: usize, cols: usize) -> Result<Self> {
        Self::from_vec(rows, cols, vec![0.0; rows * cols])
    }

    /// Create a matrix with ones on the main diagonal
    ///
    /// Non-square shapes get ones at `(i, i)` for `i < min(rows, cols)`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if either dimension is zero.
    pub fn identity(rows: usize, cols: usize) -> Result<Self> {
        let mut m = Self::zeros(rows, cols)?;
        for i in 0..rows.min(cols) {
            m.data[i * cols + i] = 1.0;
        }
        Ok(m)
    }

    /// Number of rows (input width of a projection)
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns (output width of a projection)
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Shape as `[rows, cols]`
    #[must_use]
    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    /// Borrow one row
    ///
    /// # Panics
    ///
    /// Panics if `index >= rows`. Callers validate token ids and positions
    /// before lookup.
    #[must_use]
    pub fn row(&self, index: usize) -> &[f32] {
        let start = index * self.cols;
        &self.data[start..start + self.cols]
    }

    /// Borrow one row, or `None` when out of range
    #[must_use]
    pub fn get_row(&self, index: usize) -> Option<&[f32]> {
        (index < self.rows).then(|| self.row(index))
    }

    /// Iterate over rows in order
    pub fn iter_rows(&self) -> std::slice::ChunksExact<'_, f32> {
        self.data.chunks_exact(self.cols)
    }

    /// Borrow the flattened data
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access to the flattened data
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Total number of elements
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Matrix({}x{})", self.rows, self.cols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_matrix() {
        let m = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(m.shape(), [2, 3]);
        assert_eq!(m.size(), 6);
        assert_eq!(m.row(0), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_zero_dimension_error() {
        let result = Matrix::from_vec(2, 0, vec![]);
        assert!(matches!(
            result.unwrap_err(),
            TraducirError::InvalidShape { .. }
        ));
    }

    #[test]
    fn test_size_mismatch_error() {
        let result = Matrix::from_vec(2, 3, vec![1.0, 2.0]);
        assert!(matches!(
            result.unwrap_err(),
            TraducirError::DataShapeMismatch { expected: 6, .. }
        ));
    }

    #[test]
    fn test_identity_rectangular() {
        let m = Matrix::identity(2, 4).unwrap();
        assert_eq!(m.row(0), &[1.0, 0.0, 0.0, 0.0]);
        assert_eq!(m.row(1), &[0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_get_row_out_of_range() {
        let m = Matrix::zeros(2, 2).unwrap();
        assert!(m.get_row(1).is_some());
        assert!(m.get_row(2).is_none());
    }

    #[test]
    fn test_iter_rows() {
        let m = Matrix::from_vec(3, 1, vec![1.0, 2.0, 3.0]).unwrap();
        let rows: Vec<f32> = m.iter_rows().map(|r| r[0]).collect();
        assert_eq!(rows, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_display() {
        let m = Matrix::zeros(4, 16).unwrap();
        assert_eq!(format!("{m}"), "Matrix(4x16)");
    }
}
