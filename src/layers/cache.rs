//! Session-scoped key/value caches
//!
//! Caches are owned by a [`Session`](crate::model::Session), never by the
//! layers: a layer reads and appends to the cache it is handed, and the
//! session clears every cache in bulk when a request ends.

use crate::error::{Result, TraducirError};

/// Per-position attention keys and values for one layer
///
/// Each entry holds `head_count` contiguous sub-vectors of `head_dim`
/// values, stored flat as `[position][head][head_dim]`. Entries are appended
/// in strict position order and only removed by [`AttentionCache::clear`].
#[derive(Debug, Clone)]
pub struct AttentionCache {
    /// Number of attention heads
    head_count: usize,
    /// Width of one head
    head_dim: usize,
    /// Maximum number of entries
    capacity: usize,
    /// Number of entries currently held
    len: usize,
    /// Cached keys, `[capacity * head_count * head_dim]` once full
    keys: Vec<f32>,
    /// Cached values, same layout as `keys`
    values: Vec<f32>,
}

impl AttentionCache {
    /// Create an empty cache
    ///
    /// # Arguments
    ///
    /// * `head_count` - Attention heads per entry
    /// * `head_dim` - Width of one head
    /// * `capacity` - Maximum number of positions
    ///
    /// # Errors
    ///
    /// Returns error if any dimension is zero
    pub fn new(head_count: usize, head_dim: usize, capacity: usize) -> Result<Self> {
        if head_count == 0 || head_dim == 0 || capacity == 0 {
            return Err(TraducirError::InvalidShape {
                reason: format!(
                    "Attention cache dimensions must be > 0 (heads {head_count}, head_dim {head_dim}, capacity {capacity})"
                ),
            });
        }

        Ok(Self {
            head_count,
            head_dim,
            capacity,
            len: 0,
            keys: Vec::new(),
            values: Vec::new(),
        })
    }

    /// Append one position
    ///
    /// `key` and `value` are full-width projections; head `h` occupies
    /// `[h * head_dim, (h + 1) * head_dim)`.
    ///
    /// # Errors
    ///
    /// - `InvalidShape` if either vector is not `head_count * head_dim` wide
    /// - `ContextLimitExceeded` if the cache is full
    pub fn append(&mut self, key: &[f32], value: &[f32]) -> Result<()> {
        let width = self.width();
        if key.len() != width || value.len() != width {
            return Err(TraducirError::InvalidShape {
                reason: format!(
                    "Cache entry width mismatch: key {}, value {}, expected {width}",
                    key.len(),
                    value.len()
                ),
            });
        }
        if self.len == self.capacity {
            return Err(TraducirError::ContextLimitExceeded {
                provided: self.len + 1,
                maximum: self.capacity,
            });
        }

        self.keys.extend_from_slice(key);
        self.values.extend_from_slice(value);
        self.len += 1;
        Ok(())
    }

    /// Key sub-vector of one head at one position
    ///
    /// # Panics
    ///
    /// Panics if `position >= len()` or `head >= head_count`.
    #[must_use]
    pub fn key(&self, position: usize, head: usize) -> &[f32] {
        let start = self.offset(position, head);
        &self.keys[start..start + self.head_dim]
    }

    /// Value sub-vector of one head at one position
    ///
    /// # Panics
    ///
    /// Panics if `position >= len()` or `head >= head_count`.
    #[must_use]
    pub fn value(&self, position: usize, head: usize) -> &[f32] {
        let start = self.offset(position, head);
        &self.values[start..start + self.head_dim]
    }

    /// Number of cached positions
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the cache holds no positions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of positions
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of heads per entry
    #[must_use]
    pub fn head_count(&self) -> usize {
        self.head_count
    }

    /// Width of one head
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.keys.clear();
        self.values.clear();
        self.len = 0;
    }

    fn width(&self) -> usize {
        self.head_count * self.head_dim
    }

    fn offset(&self, position: usize, head: usize) -> usize {
        assert!(position < self.len, "cache position {position} out of range");
        assert!(head < self.head_count, "cache head {head} out of range");
        position * self.width() + head * self.head_dim
    }
}

/// Caches of one decoder layer
#[derive(Debug, Clone)]
pub struct DecoderCache {
    /// Causal self-attention entries, one per decode step
    pub self_attn: AttentionCache,
    /// Cross-attention entries, one per encoder output
    pub cross_attn: AttentionCache,
}

impl DecoderCache {
    /// Create empty decoder caches
    ///
    /// # Errors
    ///
    /// Returns error if any dimension is zero
    pub fn new(head_count: usize, head_dim: usize, capacity: usize) -> Result<Self> {
        Ok(Self {
            self_attn: AttentionCache::new(head_count, head_dim, capacity)?,
            cross_attn: AttentionCache::new(head_count, head_dim, capacity)?,
        })
    }

    /// Empty both caches
    pub fn clear(&mut self) {
        self.self_attn.clear();
        self.cross_attn.clear();
    }

    /// Whether both caches are empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.self_attn.is_empty() && self.cross_attn.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_zero_dims() {
        assert!(AttentionCache::new(0, 2, 4).is_err());
        assert!(AttentionCache::new(2, 0, 4).is_err());
        assert!(AttentionCache::new(2, 2, 0).is_err());
    }

    #[test]
    fn test_append_and_read_heads() {
        let mut cache = AttentionCache::new(2, 2, 3).expect("cache");
        cache
            .append(&[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0])
            .expect("append");
        cache
            .append(&[9.0, 10.0, 11.0, 12.0], &[0.0; 4])
            .expect("append");

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.key(0, 1), &[3.0, 4.0]);
        assert_eq!(cache.value(0, 0), &[5.0, 6.0]);
        assert_eq!(cache.key(1, 0), &[9.0, 10.0]);
    }

    #[test]
    fn test_append_width_mismatch() {
        let mut cache = AttentionCache::new(2, 2, 3).expect("cache");
        assert!(cache.append(&[1.0; 3], &[1.0; 4]).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_enforced() {
        let mut cache = AttentionCache::new(1, 1, 2).expect("cache");
        cache.append(&[1.0], &[1.0]).expect("append");
        cache.append(&[2.0], &[2.0]).expect("append");
        let err = cache.append(&[3.0], &[3.0]).unwrap_err();
        assert!(matches!(
            err,
            TraducirError::ContextLimitExceeded {
                provided: 3,
                maximum: 2
            }
        ));
    }

    #[test]
    fn test_clear_empties_cache() {
        let mut cache = DecoderCache::new(1, 2, 4).expect("cache");
        cache.self_attn.append(&[1.0, 1.0], &[1.0, 1.0]).expect("append");
        cache.cross_attn.append(&[1.0, 1.0], &[1.0, 1.0]).expect("append");
        assert!(!cache.is_empty());

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.self_attn.capacity(), 4);
    }
}
