//! Per-stream feature frame buffer.

use ndarray::{Array2, ArrayView2};

/// Log-energy value used for padding frames (`ln(1e-10)`).
pub const LOG_ZERO_PADDING: f32 = -23.025_85;

/// Append-only accumulator of fixed-dimension feature frames.
///
/// Frames are stored row-major in a single vector. Consumed frames are
/// dropped from the front lazily, so both `push` and consumption are
/// amortized O(1) per frame.
#[derive(Clone, Debug)]
pub struct FeatureBuffer {
    dim: usize,
    data: Vec<f32>,
    /// Row index in `data` of the first pending frame
    head: usize,
    /// Frames consumed since creation
    consumed: usize,
}

impl FeatureBuffer {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
            head: 0,
            consumed: 0,
        }
    }

    /// Feature dimension of every frame.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of pending (not yet consumed) frames.
    pub fn len(&self) -> usize {
        self.data.len() / self.dim.max(1) - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of frames consumed since creation.
    ///
    /// This is also the absolute index of the first pending frame.
    pub fn num_consumed(&self) -> usize {
        self.consumed
    }

    /// Append frames. The caller guarantees `frames.ncols() == self.dim()`.
    pub fn push(&mut self, frames: ArrayView2<f32>) {
        debug_assert_eq!(frames.ncols(), self.dim);
        self.data.extend(frames.iter().copied());
    }

    /// Append `count` copies of a constant frame.
    pub fn pad(&mut self, count: usize, value: f32) {
        self.data.extend(std::iter::repeat_n(value, count * self.dim));
    }

    /// Copy of the first `count` pending frames.
    fn copy_front(&self, count: usize) -> Array2<f32> {
        let start = self.head * self.dim;
        Array2::from_shape_fn((count, self.dim), |(row, col)| {
            self.data[start + row * self.dim + col]
        })
    }

    /// Copy of all pending frames.
    pub fn pending(&self) -> Array2<f32> {
        self.copy_front(self.len())
    }

    /// Copy of the next `window` frames without consuming them.
    pub fn peek_ready(&self, window: usize) -> Option<Array2<f32>> {
        (self.len() >= window).then(|| self.copy_front(window))
    }

    /// Drop `count` frames from the front (at most all pending frames).
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.len());
        self.head += count;
        self.consumed += count;

        if self.head > 0 && self.head * 2 >= self.data.len() / self.dim.max(1) {
            self.data.drain(..self.head * self.dim);
            self.head = 0;
        }
    }

    /// Remove and return the next window, keeping its last `window - shift`
    /// frames for the next call.
    ///
    /// Returns `None` while fewer than `window` frames are pending.
    pub fn take_ready(&mut self, window: usize, shift: usize) -> Option<Array2<f32>> {
        let chunk = self.peek_ready(window)?;
        self.consume(shift.min(window));
        Some(chunk)
    }

    /// Remove and return every pending frame.
    pub fn drain_all(&mut self) -> Array2<f32> {
        let frames = self.pending();
        self.consume(frames.nrows());
        frames
    }
}
