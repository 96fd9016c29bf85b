//! Negotiated audio geometry of a call's read codec.

use serde::{Deserialize, Serialize};

/// Bytes per sample of signed 16-bit linear PCM.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Sample rate, channel count and packetisation interval of decoded call audio.
///
/// The pump never chooses these: they are read from the call's active codec
/// when an attachment is armed.  The frame size derived from them bounds every
/// substitution read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecFormat {
    /// Samples per second per channel (e.g. 8 000 for G.711).
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Packetisation interval in milliseconds.
    pub ptime_ms: u32,
}

impl CodecFormat {
    pub fn new(sample_rate: u32, channels: u16, ptime_ms: u32) -> Self {
        Self {
            sample_rate,
            channels,
            ptime_ms,
        }
    }

    /// Samples per channel carried by one frame.
    ///
    /// ```
    /// use external_dsp::media::CodecFormat;
    ///
    /// assert_eq!(CodecFormat::new(8_000, 1, 20).samples_per_frame(), 160);
    /// assert_eq!(CodecFormat::new(48_000, 2, 20).samples_per_frame(), 960);
    /// ```
    pub fn samples_per_frame(&self) -> usize {
        self.sample_rate as usize * self.ptime_ms as usize / 1_000
    }

    /// Size in bytes of one frame of interleaved 16-bit PCM.
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * self.channels as usize * BYTES_PER_SAMPLE
    }

    /// The tick interval of the media clock.
    pub fn ptime(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ptime_ms as u64)
    }
}

impl Default for CodecFormat {
    /// Narrowband mono at 20 ms, i.e. 320-byte frames.
    fn default() -> Self {
        Self::new(8_000, 1, 20)
    }
}
