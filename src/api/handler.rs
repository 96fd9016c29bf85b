//! Command surfaces of the external DSP: the `process_audio` API command,
//! the `process_audio_start` dialplan application and console completion.
//!
//! Every surface resolves the call through a [`SessionLocator`] and then
//! drives the shared [`LifecycleController`]; nothing here touches pipes or
//! processes directly.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::command::{split_args, Action, ApiCommand, ApiError, API_SYNTAX};
use super::session::SessionLocator;
use crate::dsp::{DspError, DspProcessConfig};
use crate::lifecycle::LifecycleController;

/// Name the API command is registered under.
pub const API_NAME: &str = "process_audio";
/// Name of the dialplan application.
pub const APP_NAME: &str = "process_audio_start";

// ---------------------------------------------------------------------------
// ApiResponse
// ---------------------------------------------------------------------------

/// Reply to one API command, rendered as `+OK` / `-ERR` / `-USAGE` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiResponse {
    Ok,
    Err(String),
    /// An error that is followed by the usage line.
    Usage(String),
}

impl ApiResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, ApiResponse::Ok)
    }
}

impl fmt::Display for ApiResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiResponse::Ok => writeln!(f, "+OK Success"),
            ApiResponse::Err(msg) => writeln!(f, "-ERR {msg}"),
            ApiResponse::Usage(msg) => {
                writeln!(f, "-ERR {msg}")?;
                writeln!(f, "-USAGE: {API_SYNTAX}")
            }
        }
    }
}

impl From<ApiError> for ApiResponse {
    fn from(e: ApiError) -> Self {
        ApiResponse::Usage(e.to_string())
    }
}

impl From<DspError> for ApiResponse {
    fn from(e: DspError) -> Self {
        match e {
            DspError::DuplicateAttachment(_) => {
                ApiResponse::Err("Cannot run 2 times at once on the same channel!".into())
            }
            DspError::NotAttached(_) => {
                ApiResponse::Err("No external DSP running on this session!".into())
            }
            other => ApiResponse::Err(format!("Failure! {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

/// Why a `process_audio_start` invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppError {
    #[error("Cannot locate session {0}!")]
    SessionNotFound(String),

    #[error(transparent)]
    Command(#[from] ApiError),

    #[error(transparent)]
    Dsp(#[from] DspError),
}

// ---------------------------------------------------------------------------
// ApiHandler
// ---------------------------------------------------------------------------

pub struct ApiHandler {
    controller: Arc<LifecycleController>,
    sessions: Arc<dyn SessionLocator>,
    /// Process started when a start request names no executable.
    default_process: Option<DspProcessConfig>,
}

impl ApiHandler {
    pub fn new(controller: Arc<LifecycleController>, sessions: Arc<dyn SessionLocator>) -> Self {
        Self {
            controller,
            sessions,
            default_process: None,
        }
    }

    pub fn with_default_process(mut self, dsp: Option<DspProcessConfig>) -> Self {
        self.default_process = dsp;
        self
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    /// Execute one `process_audio` command line.
    pub fn execute(&self, line: &str) -> ApiResponse {
        let cmd = match ApiCommand::parse(line) {
            Ok(cmd) => cmd,
            Err(e) => return e.into(),
        };

        let Some(session) = self.sessions.locate(&cmd.session_id) else {
            return ApiResponse::Err("Cannot locate session!".into());
        };

        let result = match cmd.action {
            Action::Stop => self.controller.stop(session.id()).map(|_| ()),
            Action::Start(dsp) => {
                let Some(dsp) = dsp.or_else(|| self.default_process.clone()) else {
                    return ApiError::MissingExecutable.into();
                };
                self.controller.start(session.id(), dsp, session.read_format())
            }
        };

        match result {
            Ok(()) => ApiResponse::Ok,
            Err(e) => {
                log::debug!("{API_NAME} {line}: {e}");
                e.into()
            }
        }
    }

    /// Run the `process_audio_start` application on `session_id`.
    ///
    /// `data` is either `stop` or `<path> [args...]`; an empty `data` starts
    /// the configured default process.  A start on a call that already has
    /// an active attachment is refused with a warning.
    pub fn run_app(&self, session_id: &str, data: &str) -> Result<(), AppError> {
        let session = self
            .sessions
            .locate(session_id)
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))?;

        if data.trim().eq_ignore_ascii_case("stop") {
            self.controller.stop(session_id)?;
            return Ok(());
        }

        let mut tokens = split_args(data)?.into_iter();
        let dsp = match tokens.next() {
            Some(exe) => DspProcessConfig::new(exe, tokens.collect()),
            None => self
                .default_process
                .clone()
                .ok_or(ApiError::MissingExecutable)?,
        };

        self.controller.start(session_id, dsp, session.read_format())?;
        Ok(())
    }

    /// Console tab-completion candidates for a partially typed command line.
    ///
    /// The first token completes to live session identifiers, the second to
    /// `start` / `stop`.
    pub fn complete(&self, partial: &str) -> Vec<String> {
        let mut words: Vec<&str> = partial.split_whitespace().collect();
        let fresh_word = partial.is_empty() || partial.ends_with(char::is_whitespace);
        let prefix = if fresh_word { "" } else { words.pop().unwrap_or("") };

        let candidates: Vec<String> = match words.len() {
            0 => self.sessions.session_ids(),
            1 => vec!["start".into(), "stop".into()],
            _ => Vec::new(),
        };

        candidates
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
