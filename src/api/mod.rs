//! Command surfaces for attaching an external DSP to a call.
//!
//! ```text
//! "process_audio <uuid> start /path/to/dsp args…"
//!        │
//!        ▼
//! ApiCommand::parse ──▶ SessionLocator::locate ──▶ LifecycleController
//!        │                                            start / stop
//!        ▼
//! ApiResponse  "+OK Success" | "-ERR …" [+ "-USAGE: …"]
//! ```

pub mod command;
pub mod handler;
pub mod session;

pub use command::{split_args, Action, ApiCommand, ApiError, API_SYNTAX};
pub use handler::{ApiHandler, ApiResponse, AppError, API_NAME, APP_NAME};
pub use session::{CallSession, SessionLocator, SessionTable, StaticSession};
