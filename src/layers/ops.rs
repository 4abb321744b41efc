//! Vector primitives
//!
//! Pure functions over `f32` slices used by every layer: dot product,
//! elementwise add, scalar scale, head split/merge and top-1 selection.

use rayon::prelude::*;

use crate::error::{Result, TraducirError};
use crate::tensor::Matrix;

/// Output widths at or above this size use the parallel projection path
const PARALLEL_THRESHOLD: usize = 256;

/// Columns (or rows for the transposed product) handled per rayon task
const CHUNK_SIZE: usize = 64;

/// Dot product of two equal-length vectors
///
/// Extra elements of the longer slice are ignored; callers pass equal
/// lengths.
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Elementwise sum `a + b`
///
/// # Errors
///
/// Returns `InvalidShape` if the lengths differ.
pub fn add(a: &[f32], b: &[f32]) -> Result<Vec<f32>> {
    if a.len() != b.len() {
        return Err(TraducirError::InvalidShape {
            reason: format!("Cannot add vectors of length {} and {}", a.len(), b.len()),
        });
    }
    Ok(a.iter().zip(b).map(|(x, y)| x + y).collect())
}

/// Add `b` into `a` in place
///
/// # Errors
///
/// Returns `InvalidShape` if the lengths differ.
pub fn add_assign(a: &mut [f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(TraducirError::InvalidShape {
            reason: format!("Cannot add vectors of length {} and {}", a.len(), b.len()),
        });
    }
    for (x, y) in a.iter_mut().zip(b) {
        *x += y;
    }
    Ok(())
}

/// Multiply every element by `factor`
#[must_use]
pub fn scale(values: &[f32], factor: f32) -> Vec<f32> {
    values.iter().map(|v| v * factor).collect()
}

/// Split a vector into `head_count` contiguous slices of equal width
///
/// # Errors
///
/// Returns `InvalidShape` if `head_count` is zero or does not divide the
/// vector length.
pub fn split_heads(values: &[f32], head_count: usize) -> Result<Vec<Vec<f32>>> {
    if head_count == 0 || values.len() % head_count != 0 {
        return Err(TraducirError::InvalidShape {
            reason: format!(
                "Cannot split a vector of length {} into {head_count} heads",
                values.len()
            ),
        });
    }

    let head_dim = values.len() / head_count;
    Ok(values.chunks_exact(head_dim).map(<[f32]>::to_vec).collect())
}

/// Concatenate head slices in head order
#[must_use]
pub fn merge_heads(heads: &[Vec<f32>]) -> Vec<f32> {
    heads.concat()
}

/// Index of a maximal value
///
/// Linear scan; the first maximal index wins on ties. NaN values are never
/// selected unless every value is NaN, in which case index 0 is returned.
///
/// # Errors
///
/// Returns `InvalidShape` for an empty slice.
pub fn argmax(values: &[f32]) -> Result<usize> {
    if values.is_empty() {
        return Err(TraducirError::InvalidShape {
            reason: "Cannot select the maximum of an empty vector".to_string(),
        });
    }

    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    Ok(best)
}

/// Project a row vector through a `[rows × cols]` matrix
///
/// Computes `vector × weights` and adds `bias` when present. The output has
/// `cols` elements.
///
/// # Errors
///
/// Returns `InvalidShape` if the vector length is not `rows` or the bias
/// length is not `cols`.
pub fn project(vector: &[f32], weights: &Matrix, bias: Option<&[f32]>) -> Result<Vec<f32>> {
    let (rows, cols) = (weights.rows(), weights.cols());
    if vector.len() != rows {
        return Err(TraducirError::InvalidShape {
            reason: format!(
                "Vector length {} doesn't match projection input width {rows}",
                vector.len()
            ),
        });
    }
    if let Some(b) = bias {
        if b.len() != cols {
            return Err(TraducirError::InvalidShape {
                reason: format!(
                    "Bias length {} doesn't match projection output width {cols}",
                    b.len()
                ),
            });
        }
    }

    let mut output = match bias {
        Some(b) => b.to_vec(),
        None => vec![0.0; cols],
    };
    let data = weights.data();

    if cols < PARALLEL_THRESHOLD {
        for (i, &v) in vector.iter().enumerate() {
            let row = &data[i * cols..(i + 1) * cols];
            for (out, &w) in output.iter_mut().zip(row) {
                *out += v * w;
            }
        }
    } else {
        output
            .par_chunks_mut(CHUNK_SIZE)
            .enumerate()
            .for_each(|(chunk_idx, chunk)| {
                let start = chunk_idx * CHUNK_SIZE;
                for (i, &v) in vector.iter().enumerate() {
                    let row = &data[i * cols + start..i * cols + start + chunk.len()];
                    for (out, &w) in chunk.iter_mut().zip(row) {
                        *out += v * w;
                    }
                }
            });
    }

    Ok(output)
}

/// Multiply a vector by the transpose of a `[rows × cols]` matrix
///
/// `output[r] = dot(vector, weights.row(r))`. Used to turn a decoder hidden
/// state into vocabulary logits against the token embedding table.
///
/// # Errors
///
/// Returns `InvalidShape` if the vector length is not `cols`.
pub fn project_transposed(vector: &[f32], weights: &Matrix) -> Result<Vec<f32>> {
    if vector.len() != weights.cols() {
        return Err(TraducirError::InvalidShape {
            reason: format!(
                "Vector length {} doesn't match table width {}",
                vector.len(),
                weights.cols()
            ),
        });
    }

    if weights.rows() < PARALLEL_THRESHOLD {
        Ok(weights.iter_rows().map(|row| dot(vector, row)).collect())
    } else {
        Ok((0..weights.rows())
            .into_par_iter()
            .with_min_len(CHUNK_SIZE)
            .map(|r| dot(vector, weights.row(r)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot() {
        assert_eq!(dot(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
        assert_eq!(dot(&[], &[]), 0.0);
    }

    #[test]
    fn test_add_length_mismatch() {
        assert!(add(&[1.0], &[1.0, 2.0]).is_err());
        assert_eq!(add(&[1.0, 2.0], &[3.0, 4.0]).expect("add"), vec![4.0, 6.0]);
    }

    #[test]
    fn test_scale() {
        assert_eq!(scale(&[1.0, -2.0], 0.5), vec![0.5, -1.0]);
    }

    #[test]
    fn test_split_and_merge_heads() {
        let v = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let heads = split_heads(&v, 3).expect("split");
        assert_eq!(heads, vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]);
        assert_eq!(merge_heads(&heads), v);
    }

    #[test]
    fn test_split_heads_indivisible() {
        assert!(split_heads(&[1.0, 2.0, 3.0], 2).is_err());
        assert!(split_heads(&[1.0, 2.0], 0).is_err());
    }

    #[test]
    fn test_argmax_first_maximum_wins() {
        assert_eq!(argmax(&[0.1, 0.9, 0.9, 0.2]).expect("argmax"), 1);
        assert_eq!(argmax(&[-3.0, -1.0, -2.0]).expect("argmax"), 1);
        assert!(argmax(&[]).is_err());
    }

    #[test]
    fn test_project_with_and_without_bias() {
        // [2 × 3]
        let w = Matrix::from_vec(2, 3, vec![1.0, 0.0, 2.0, 0.0, 1.0, 3.0]).expect("matrix");
        let out = project(&[1.0, 2.0], &w, None).expect("project");
        assert_eq!(out, vec![1.0, 2.0, 8.0]);

        let out = project(&[1.0, 2.0], &w, Some(&[1.0, 1.0, 1.0])).expect("project");
        assert_eq!(out, vec![2.0, 3.0, 9.0]);
    }

    #[test]
    fn test_project_shape_errors() {
        let w = Matrix::zeros(2, 3).expect("matrix");
        assert!(project(&[1.0], &w, None).is_err());
        assert!(project(&[1.0, 1.0], &w, Some(&[0.0])).is_err());
    }

    #[test]
    fn test_project_parallel_matches_sequential() {
        let rows = 3;
        let cols = PARALLEL_THRESHOLD + 17;
        let data: Vec<f32> = (0..rows * cols).map(|i| (i % 7) as f32 - 3.0).collect();
        let w = Matrix::from_vec(rows, cols, data).expect("matrix");
        let v = [0.5, -1.0, 2.0];

        let out = project(&v, &w, None).expect("project");
        for (j, &o) in out.iter().enumerate() {
            let expected: f32 = (0..rows).map(|i| v[i] * w.row(i)[j]).sum();
            assert!((o - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_project_transposed() {
        let table = Matrix::from_vec(3, 2, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).expect("matrix");
        let logits = project_transposed(&[2.0, 3.0], &table).expect("logits");
        assert_eq!(logits, vec![2.0, 3.0, 5.0]);
        assert!(project_transposed(&[1.0], &table).is_err());
    }
}
