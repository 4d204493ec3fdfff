//! Self-attention key/value cache for autoregressive decoders.

use crate::error::{BackendError, PreconditionError, Result};
use ndarray::{Array4, ArrayView4};

/// Preallocated self-attention K/V cache `[layers, 1, capacity, hidden]`.
///
/// The decoder writes positions `[valid_len, valid_len + fed)` on each step
/// and returns the whole buffer; the cache only accepts a replacement of the
/// same shape and advances `valid_len` by the number of tokens fed. Writing
/// past `capacity` is rejected before the decoder runs.
#[derive(Clone, Debug)]
pub struct KvCache {
    keys: Array4<f32>,
    values: Array4<f32>,
    valid_len: usize,
}

impl KvCache {
    /// Zeroed cache for `layers` decoder layers.
    pub fn new(layers: usize, capacity: usize, hidden: usize) -> Self {
        let shape = (layers, 1, capacity, hidden);
        Self {
            keys: Array4::zeros(shape),
            values: Array4::zeros(shape),
            valid_len: 0,
        }
    }

    /// Cache shape as passed to the decoder.
    pub fn shape(&self) -> [usize; 4] {
        let dim = self.keys.dim();
        [dim.0, dim.1, dim.2, dim.3]
    }

    /// Positions holding valid entries; equal to the decoder offset.
    pub fn valid_len(&self) -> usize {
        self.valid_len
    }

    /// Maximum number of positions.
    pub fn capacity(&self) -> usize {
        self.keys.dim().2
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.valid_len
    }

    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    pub fn keys(&self) -> ArrayView4<'_, f32> {
        self.keys.view()
    }

    pub fn values(&self) -> ArrayView4<'_, f32> {
        self.values.view()
    }

    /// Fail unless `requested` more positions fit.
    pub fn check_room(&self, requested: usize) -> std::result::Result<(), PreconditionError> {
        if requested > self.remaining() {
            return Err(PreconditionError::ContextOverflow {
                offset: self.valid_len,
                requested,
                capacity: self.capacity(),
            });
        }
        Ok(())
    }

    /// Replace the cache with decoder output after feeding `fed` tokens.
    ///
    /// Nothing changes when the room check or a shape check fails.
    pub fn advance(&mut self, keys: Array4<f32>, values: Array4<f32>, fed: usize) -> Result<()> {
        self.check_room(fed)?;

        let expected = self.shape();
        for (name, array) in [("self_k_cache", &keys), ("self_v_cache", &values)] {
            if array.shape() != expected {
                return Err(BackendError::ShapeMismatch {
                    name: name.to_string(),
                    expected: expected.to_vec(),
                    got: array.shape().to_vec(),
                }
                .into());
            }
        }

        self.keys = keys;
        self.values = values;
        self.valid_len += fed;
        Ok(())
    }

    /// Zero the cache and rewind to offset 0.
    pub fn clear(&mut self) {
        self.keys.fill(0.0);
        self.values.fill(0.0);
        self.valid_len = 0;
    }
}
