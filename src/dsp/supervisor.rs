//! Spawning, killing and reaping the external DSP process.
//!
//! # Parent-death signal
//!
//! On Linux the child asks the kernel for `SIGKILL` when its parent dies, so a
//! crashed host never leaves orphaned DSP processes behind.  The kernel ties
//! that request to the *thread* that forked, so attachments must be started
//! from a thread that lives as long as the host (the console's main thread, a
//! call's media thread), never from a short-lived blocking-pool thread.

use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

use serde::Serialize;

use super::channels::PipeChannelSet;
use super::error::DspError;
use crate::media::CodecFormat;

// ---------------------------------------------------------------------------
// DspProcessConfig
// ---------------------------------------------------------------------------

/// Executable and arguments of the DSP process, fixed for the attachment's
/// lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DspProcessConfig {
    pub executable: PathBuf,
    pub arguments: Vec<String>,
}

impl DspProcessConfig {
    pub fn new(executable: impl Into<PathBuf>, arguments: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            arguments,
        }
    }

    /// The executable as it appears in log lines.
    pub fn name(&self) -> String {
        self.executable.display().to_string()
    }
}

// ---------------------------------------------------------------------------
// DspProcess
// ---------------------------------------------------------------------------

/// Handle to a running DSP process.  Valid from spawn until reaped.
#[derive(Debug)]
pub struct DspProcess {
    child: Child,
    name: String,
    reaped: bool,
    exit_status: Option<ExitStatus>,
}

impl DspProcess {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped
    }

    /// `SIGKILL` the process and block until it is reaped.
    ///
    /// Safe to call any number of times: later calls return the status
    /// recorded by the first.  A process that already exited is simply
    /// reaped.  Failures are logged, never returned.
    pub fn terminate(&mut self) -> Option<ExitStatus> {
        if self.reaped {
            return self.exit_status;
        }
        self.reaped = true;

        if let Err(e) = self.child.kill() {
            log::debug!("{}: kill PID={} failed: {e}", self.name, self.child.id());
        }

        match self.child.wait() {
            Ok(status) => {
                log::debug!(
                    "Stopped External DSP {} PID={} with status={}",
                    self.name,
                    self.child.id(),
                    status
                );
                self.exit_status = Some(status);
            }
            Err(e) => {
                log::warn!("{}: failed to reap PID={}: {e}", self.name, self.child.id());
            }
        }
        self.exit_status
    }
}

impl Drop for DspProcess {
    fn drop(&mut self) {
        if !self.reaped {
            self.terminate();
        }
    }
}

// ---------------------------------------------------------------------------
// SubprocessSupervisor
// ---------------------------------------------------------------------------

/// Spawns DSP processes wired to a [`PipeChannelSet`].
#[derive(Debug, Clone)]
pub struct SubprocessSupervisor {
    /// Pass the call's audio geometry to the child as `DSP_*` variables.
    export_format_env: bool,
}

impl SubprocessSupervisor {
    pub fn new(export_format_env: bool) -> Self {
        Self { export_format_env }
    }

    /// Start `config.executable` with stdin/stdout/stderr bound to the
    /// process ends of `channels`.
    ///
    /// On success the host copies of the process ends are already closed.
    ///
    /// # Errors
    ///
    /// [`DspError::SpawnFailed`] when the process cannot be created or its
    /// image cannot be executed.
    pub fn spawn(
        &self,
        config: &DspProcessConfig,
        channels: &mut PipeChannelSet,
        format: &CodecFormat,
    ) -> Result<DspProcess, DspError> {
        let name = config.name();
        let failed = |reason: String| DspError::SpawnFailed {
            executable: name.clone(),
            reason,
        };

        let ends = channels
            .take_process_ends()
            .ok_or_else(|| failed("pipes already bound to another process".into()))?;

        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.arguments)
            .stdin(Stdio::from(ends.audio_in))
            .stdout(Stdio::from(ends.audio_out))
            .stderr(Stdio::from(ends.diagnostics));

        if self.export_format_env {
            cmd.env("DSP_SAMPLE_RATE", format.sample_rate.to_string())
                .env("DSP_CHANNELS", format.channels.to_string())
                .env("DSP_FRAME_BYTES", format.frame_bytes().to_string());
        }

        request_parent_death_signal(&mut cmd);

        let spawned = cmd.spawn();
        // `cmd` owns the host copies of the process ends until dropped.
        drop(cmd);

        let child = spawned.map_err(|e| {
            log::error!("Failed to run External DSP {name}: {e}");
            failed(e.to_string())
        })?;

        log::debug!("Started External DSP {} PID={}", name, child.id());

        Ok(DspProcess {
            child,
            name,
            reaped: false,
            exit_status: None,
        })
    }
}

impl Default for SubprocessSupervisor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(target_os = "linux")]
fn request_parent_death_signal(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    let parent = std::process::id() as libc::pid_t;

    // SAFETY: the closure runs between fork and exec and only calls the
    // async-signal-safe `prctl` and `getppid`; it allocates nothing.
    unsafe {
        cmd.pre_exec(move || {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                return Err(io::Error::last_os_error());
            }
            // The host died before the request was registered.
            if libc::getppid() != parent {
                return Err(io::Error::from_raw_os_error(libc::ESRCH));
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn request_parent_death_signal(_cmd: &mut Command) {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
