//! Call-side media types: the frame the pump rewrites and the codec geometry
//! that sizes it.
//!
//! Frames arrive already decoded to signed 16-bit linear PCM; nothing in this
//! crate encodes or decodes audio.

pub mod format;
pub mod frame;

pub use format::{CodecFormat, BYTES_PER_SAMPLE};
pub use frame::{AudioFrame, Direction};
