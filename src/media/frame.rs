//! Fixed-capacity linear PCM frame handed to the pump once per audio tick.
//!
//! The call pipeline owns the frame; the pump only borrows it for the duration
//! of a tick and may overwrite its contents in place.  The capacity never
//! changes after construction, so a substituted frame can never grow past the
//! size the codec negotiated.
//!
//! # Example
//!
//! ```rust
//! use external_dsp::media::AudioFrame;
//!
//! let mut frame = AudioFrame::new(4);
//! assert_eq!(frame.fill(&[1, 2, 3, 4, 5, 6]), 4); // extra bytes are dropped
//! assert_eq!(frame.data(), &[1, 2, 3, 4]);
//! ```

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Which leg of the call a frame belongs to.
///
/// Substitution is symmetric: the pump treats both directions identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Audio read from the remote party.
    Read,
    /// Audio about to be written to the remote party.
    Write,
}

// ---------------------------------------------------------------------------
// AudioFrame
// ---------------------------------------------------------------------------

/// A mutable byte buffer of fixed capacity plus an occupied length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    buf: Box<[u8]>,
    /// Number of valid bytes at the front of `buf` (≤ capacity).
    len: usize,
}

impl AudioFrame {
    /// Create an empty frame able to hold `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "AudioFrame capacity must be > 0");
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Create a frame whose capacity and contents are exactly `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut frame = Self::new(bytes.len().max(1));
        frame.fill(bytes);
        frame
    }

    /// Copy as much of `bytes` as fits and return the new occupied length.
    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.buf.len());
        self.buf[..n].copy_from_slice(&bytes[..n]);
        self.len = n;
        n
    }

    /// The occupied portion of the frame.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The whole backing buffer, used as the destination of a substitution read.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Set the occupied length after writing into [`buffer_mut`](Self::buffer_mut).
    ///
    /// Lengths beyond the capacity are clamped.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.buf.len());
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
