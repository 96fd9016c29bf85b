//! Per-tick frame substitution.
//!
//! # Tick
//!
//! ```text
//! frame ──write──▶ audio-in            (blocking; EPIPE ⇒ input lost)
//!                  poll(audio-out, diag-out, 0 ms)
//!       ◀──read─── audio-out ≤ capacity (frame.len = bytes read)
//!                  diag-out  ≤ scratch  ──▶ log
//! ```
//!
//! The poll never waits: a tick only harvests what the DSP process has
//! already produced, so a slow process delays substitution by whole ticks
//! instead of stretching the tick itself.  The write end stays blocking; a
//! process that stops draining audio-in without closing it can still stall
//! the tick once the pipe buffer fills.

use std::io;
use std::time::Duration;

use super::channels::PipeChannelSet;
use super::error::DspError;
use crate::media::AudioFrame;

/// Default size of the diagnostics scratch buffer.
pub const DEFAULT_DIAGNOSTICS_BYTES: usize = 1024;

// ---------------------------------------------------------------------------
// TickReport
// ---------------------------------------------------------------------------

/// What happened during one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Bytes substituted into the frame, if audio-out was read this tick.
    /// `Some(0)` is a valid "no output" substitution.
    pub substituted: Option<usize>,
    /// Diagnostic text harvested this tick, already forwarded to the log.
    pub diagnostics: Option<String>,
    /// Set to [`DspError::BrokenPipe`] when the DSP process closed its audio
    /// input; the attachment must be torn down before the tick returns to
    /// the call pipeline.
    pub input_error: Option<DspError>,
}

impl TickReport {
    pub fn input_lost(&self) -> bool {
        self.input_error.is_some()
    }
}

// ---------------------------------------------------------------------------
// FramePump
// ---------------------------------------------------------------------------

/// Moves one frame per tick through the DSP process.
#[derive(Debug)]
pub struct FramePump {
    /// Executable name used to tag log lines.
    name: String,
    scratch: Vec<u8>,
}

impl FramePump {
    pub fn new(name: impl Into<String>, diagnostics_bytes: usize) -> Self {
        Self {
            name: name.into(),
            scratch: vec![0u8; diagnostics_bytes.max(1)],
        }
    }

    /// Run one tick against `channels`, rewriting `frame` in place.
    ///
    /// Never fails: every I/O problem is logged and reflected in the report.
    pub fn tick(
        &mut self,
        channels: &mut PipeChannelSet,
        mut frame: Option<&mut AudioFrame>,
    ) -> TickReport {
        let mut report = TickReport::default();

        // ── 1. Frame → audio-in ──────────────────────────────────────────
        match frame.as_deref() {
            Some(f) if channels.is_audio_in_open() && !f.is_empty() => {
                if let Err(e) = channels.write_audio(f.data()) {
                    if e.kind() == io::ErrorKind::BrokenPipe {
                        log::error!("{}: lost connection to DSP, removing attachment", self.name);
                        channels.mark_audio_in_closed();
                        report.input_error = Some(DspError::BrokenPipe(self.name.clone()));
                    } else {
                        log::warn!("{}: audio write failed: {e}", self.name);
                    }
                }
            }
            Some(_) => {}
            None => log::debug!("{}: got no frame from channel", self.name),
        }

        // ── 2. Harvest audio-out / diagnostics-out ───────────────────────
        let ready = match channels.poll_readable(Duration::ZERO) {
            Ok(ready) => ready,
            Err(e) => {
                log::warn!("{}: poll failed: {e}", self.name);
                return report;
            }
        };

        if ready.audio_out {
            if let Some(f) = frame.as_deref_mut() {
                match channels.read_audio(f.buffer_mut()) {
                    Ok(n) => {
                        f.set_len(n);
                        report.substituted = Some(n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => log::warn!("{}: audio read failed: {e}", self.name),
                }
            }
        }

        if ready.diagnostics {
            match channels.read_diagnostics(&mut self.scratch) {
                Ok(0) => {}
                Ok(n) => {
                    let text = String::from_utf8_lossy(&self.scratch[..n]);
                    let text = text.trim_end();
                    log::debug!("{}: {}", self.name, text);
                    report.diagnostics = Some(text.to_string());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => log::warn!("{}: diagnostics read failed: {e}", self.name),
            }
        }

        if !ready.any() {
            log::trace!("{}: returned nothing", self.name);
        }

        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
