//! Errors raised by the external DSP subsystem.

use thiserror::Error;

/// All errors that can arise while arming, pumping or tearing down an
/// external DSP attachment.
///
/// Only [`SpawnFailed`](DspError::SpawnFailed),
/// [`ResourceExhausted`](DspError::ResourceExhausted),
/// [`DuplicateAttachment`](DspError::DuplicateAttachment) and
/// [`NotAttached`](DspError::NotAttached) ever reach a caller.
/// [`BrokenPipe`](DspError::BrokenPipe) is reported in the frame tick's
/// [`TickReport`](super::TickReport) and handled by the attachment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DspError {
    /// The OS refused to create the DSP process.
    #[error("Failed to run external DSP {executable}: {reason}")]
    SpawnFailed { executable: String, reason: String },

    /// A pipe pair could not be allocated (descriptor limit, memory).
    #[error("Cannot allocate DSP pipes: {0}")]
    ResourceExhausted(String),

    /// The DSP process stopped reading its audio input.
    #[error("Lost connection to external DSP {0}")]
    BrokenPipe(String),

    /// The call already has an armed or degraded attachment.
    #[error("Cannot run 2 times at once on session {0}")]
    DuplicateAttachment(String),

    /// The call has no attachment to act on.
    #[error("No external DSP running on session {0}")]
    NotAttached(String),
}
