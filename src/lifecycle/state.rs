//! Attachment state machine.

use serde::Serialize;

/// States of one external DSP attachment.
///
/// ```text
/// Unarmed ──start──▶ Armed ──stop / call end──────────────▶ Terminated
///                      └──audio-in broken──▶ Degraded ──teardown──┘
/// ```
///
/// There is no edge back from `Degraded` or `Terminated` to `Armed`: a DSP
/// process that dies is not restarted; a new explicit start replaces the
/// terminated attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpState {
    /// Attachment created, nothing spawned yet.
    Unarmed,
    /// Process running, frames are being pumped.
    Armed,
    /// Audio-in broke; teardown is in progress.
    Degraded,
    /// Pipes released and process reaped.  Frames pass through untouched.
    Terminated,
}

impl PumpState {
    /// `true` while the attachment occupies its call (blocks a second start).
    ///
    /// ```
    /// use external_dsp::lifecycle::PumpState;
    ///
    /// assert!(!PumpState::Unarmed.is_active());
    /// assert!(PumpState::Armed.is_active());
    /// assert!(PumpState::Degraded.is_active());
    /// assert!(!PumpState::Terminated.is_active());
    /// ```
    pub fn is_active(&self) -> bool {
        matches!(self, PumpState::Armed | PumpState::Degraded)
    }

    pub fn label(&self) -> &'static str {
        match self {
            PumpState::Unarmed => "unarmed",
            PumpState::Armed => "armed",
            PumpState::Degraded => "degraded",
            PumpState::Terminated => "terminated",
        }
    }
}

impl Default for PumpState {
    fn default() -> Self {
        PumpState::Unarmed
    }
}

impl std::fmt::Display for PumpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
