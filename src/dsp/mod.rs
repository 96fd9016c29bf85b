//! The external DSP core: pipes, process supervision and the per-tick pump.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      one attachment                        │
//! │                                                           │
//! │  PipeChannelSet ──process ends──▶ SubprocessSupervisor     │
//! │   (3 pipes)                        spawn → DspProcess      │
//! │        │                                  │                │
//! │        ▼                                  ▼                │
//! │  FramePump::tick(frame)            terminate(): kill+reap  │
//! │   write → poll(0) → read                                  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The types here know nothing about calls or sessions; the
//! [`lifecycle`](crate::lifecycle) module decides when each one runs.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use external_dsp::dsp::{DspProcessConfig, FramePump, PipeChannelSet, SubprocessSupervisor};
//! use external_dsp::media::{AudioFrame, CodecFormat};
//!
//! let format = CodecFormat::default();
//! let config = DspProcessConfig::new("/usr/bin/cat", vec![]);
//!
//! let mut channels = PipeChannelSet::open().unwrap();
//! let mut process = SubprocessSupervisor::default()
//!     .spawn(&config, &mut channels, &format)
//!     .unwrap();
//!
//! let mut pump = FramePump::new(config.name(), 1024);
//! let mut frame = AudioFrame::from_bytes(&vec![0u8; format.frame_bytes()]);
//! let report = pump.tick(&mut channels, Some(&mut frame));
//! println!("substituted: {:?}", report.substituted);
//!
//! channels.close_host_ends();
//! process.terminate();
//! ```

pub mod channels;
pub mod error;
pub mod pump;
pub mod supervisor;

pub use channels::{PipeChannelSet, ProcessEnds, Readiness};
pub use error::DspError;
pub use pump::{FramePump, TickReport, DEFAULT_DIAGNOSTICS_BYTES};
pub use supervisor::{DspProcess, DspProcessConfig, SubprocessSupervisor};
