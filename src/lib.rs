//! Real-time substitution of call audio by an external DSP process.
//!
//! Each frame of a call is written to a spawned process's stdin, and whatever
//! the process has already written to its stdout replaces the frame before it
//! continues down the call's media path.  The process's stderr is forwarded
//! to the host log.
//!
//! | Module                   | Concern                                        |
//! |--------------------------|------------------------------------------------|
//! | [`media`]                | `AudioFrame`, negotiated `CodecFormat`         |
//! | [`dsp`]                  | pipes, process spawn/kill, per-tick pump       |
//! | [`lifecycle`]            | per-call attachment state machine              |
//! | [`api`]                  | `process_audio` command, dialplan app, completion |
//! | [`config`]               | `settings.toml`                                |
//!
//! Unix only: the pump is built on pipes, `poll(2)` and signals.

pub mod api;
pub mod config;
pub mod dsp;
pub mod lifecycle;
pub mod media;
