//! One call's external DSP attachment: the pipes, the process and the pump,
//! moved through [`PumpState`] together.

use std::process::ExitStatus;

use serde::Serialize;

use super::state::PumpState;
use crate::dsp::{
    DspError, DspProcess, DspProcessConfig, FramePump, PipeChannelSet, SubprocessSupervisor,
    TickReport,
};
use crate::media::{AudioFrame, CodecFormat};

// ---------------------------------------------------------------------------
// AttachmentStatus
// ---------------------------------------------------------------------------

/// Point-in-time view of an attachment, for the console `status` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttachmentStatus {
    pub session_id: String,
    pub state: PumpState,
    pub pid: Option<u32>,
    pub dsp: DspProcessConfig,
    pub format: CodecFormat,
    pub ticks: u64,
    pub substituted_ticks: u64,
    /// Exit code once reaped; `None` while running or when killed by signal.
    pub exit_code: Option<i32>,
}

// ---------------------------------------------------------------------------
// Attachment
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Attachment {
    session_id: String,
    config: DspProcessConfig,
    format: CodecFormat,
    state: PumpState,
    channels: Option<PipeChannelSet>,
    process: Option<DspProcess>,
    pump: FramePump,
    ticks: u64,
    substituted_ticks: u64,
    exit_status: Option<ExitStatus>,
}

impl Attachment {
    pub fn new(
        session_id: impl Into<String>,
        config: DspProcessConfig,
        format: CodecFormat,
        diagnostics_bytes: usize,
    ) -> Self {
        let pump = FramePump::new(config.name(), diagnostics_bytes);
        Self {
            session_id: session_id.into(),
            config,
            format,
            state: PumpState::Unarmed,
            channels: None,
            process: None,
            pump,
            ticks: 0,
            substituted_ticks: 0,
            exit_status: None,
        }
    }

    /// `Unarmed → Armed`: open the pipes and spawn the DSP process.
    ///
    /// On failure nothing is left allocated and the state stays `Unarmed`.
    /// Arming an attachment that is not `Unarmed` does nothing.
    pub fn arm(&mut self, supervisor: &SubprocessSupervisor) -> Result<(), DspError> {
        if self.state != PumpState::Unarmed {
            return Ok(());
        }

        log::debug!(
            "Initializing External DSP for {} ({} Hz, {} ch, {} byte frames)",
            self.session_id,
            self.format.sample_rate,
            self.format.channels,
            self.format.frame_bytes()
        );

        let mut channels = PipeChannelSet::open()?;
        let process = supervisor.spawn(&self.config, &mut channels, &self.format)?;

        log::info!(
            "{}: external DSP {} armed (PID={})",
            self.session_id,
            self.config.name(),
            process.pid()
        );

        self.channels = Some(channels);
        self.process = Some(process);
        self.state = PumpState::Armed;
        Ok(())
    }

    /// Run one substitution tick.  Outside `Armed` the frame is untouched.
    ///
    /// A broken audio-in tears the attachment down before returning, so the
    /// call keeps running without DSP from the very next tick.
    pub fn process_frame(&mut self, frame: Option<&mut AudioFrame>) -> TickReport {
        if self.state != PumpState::Armed {
            return TickReport::default();
        }
        let Some(channels) = self.channels.as_mut() else {
            return TickReport::default();
        };

        let report = self.pump.tick(channels, frame);
        self.ticks += 1;
        if report.substituted.is_some() {
            self.substituted_ticks += 1;
        }

        if let Some(e) = &report.input_error {
            self.state = PumpState::Degraded;
            log::warn!("{}: {e}, tearing down", self.session_id);
            self.teardown();
        }

        report
    }

    /// Close all host pipe ends, kill and reap the process.  Idempotent.
    ///
    /// Returns the exit status recorded at the (single) reap.
    pub fn teardown(&mut self) -> Option<ExitStatus> {
        if self.state == PumpState::Terminated {
            return self.exit_status;
        }

        log::debug!("Destroying External DSP for {}", self.session_id);

        if let Some(channels) = self.channels.as_mut() {
            channels.close_host_ends();
        }
        self.channels = None;

        if let Some(mut process) = self.process.take() {
            self.exit_status = process.terminate();
        }

        self.state = PumpState::Terminated;
        self.exit_status
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(DspProcess::pid)
    }

    pub fn config(&self) -> &DspProcessConfig {
        &self.config
    }

    pub fn status(&self) -> AttachmentStatus {
        AttachmentStatus {
            session_id: self.session_id.clone(),
            state: self.state,
            pid: self.pid(),
            dsp: self.config.clone(),
            format: self.format,
            ticks: self.ticks,
            substituted_ticks: self.substituted_ticks,
            exit_code: self.exit_status.and_then(|s| s.code()),
        }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
