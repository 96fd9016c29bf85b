//! Attachment lifecycle: which calls have an external DSP, and in what state.
//!
//! # Architecture
//!
//! ```text
//! call pipeline ── MediaEvent ──▶ LifecycleController
//!                                   │  HashMap<session id, Attachment>
//!                                   ▼
//!                                 Attachment ── PumpState
//!                                   ├─ PipeChannelSet
//!                                   ├─ DspProcess
//!                                   └─ FramePump
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use external_dsp::dsp::DspProcessConfig;
//! use external_dsp::lifecycle::{LifecycleController, PumpState};
//! use external_dsp::media::{AudioFrame, CodecFormat, Direction};
//!
//! let controller = LifecycleController::default();
//! let format = CodecFormat::default();
//!
//! controller
//!     .start("call-1", DspProcessConfig::new("/usr/local/bin/denoise", vec![]), format)
//!     .unwrap();
//! assert_eq!(controller.state("call-1"), PumpState::Armed);
//!
//! // Once per media tick:
//! let mut frame = AudioFrame::new(format.frame_bytes());
//! controller.process_frame("call-1", Direction::Read, Some(&mut frame));
//!
//! controller.stop("call-1").unwrap();
//! ```

pub mod attachment;
pub mod controller;
pub mod state;

pub use attachment::{Attachment, AttachmentStatus};
pub use controller::{LifecycleController, MediaEvent};
pub use state::PumpState;
