//! Session-keyed owner of every external DSP attachment.
//!
//! [`LifecycleController`] is the only entry point the call pipeline uses.
//! It keeps one [`Attachment`] per call-session identifier and routes the
//! pipeline's four media events to it:
//!
//! | Event                          | Effect                                   |
//! |--------------------------------|------------------------------------------|
//! | [`MediaEvent::Init`]           | open pipes, spawn process (`→ Armed`)     |
//! | [`MediaEvent::FrameReady`]     | observed only, no substitution            |
//! | [`MediaEvent::FrameForOutput`] | one pump tick, frame rewritten in place   |
//! | [`MediaEvent::Close`]          | close pipes, kill + reap (`→ Terminated`) |
//!
//! # Locking
//!
//! The session map and each attachment have their own `Mutex`.  Frame ticks
//! only hold the map lock long enough to clone the attachment handle, so a
//! tick blocked on a stalled DSP process never holds up other calls' ticks.
//! Start, stop and ticks for the *same* call serialise on the attachment
//! lock.  Start never waits on an attachment lock and spawns outside the map
//! lock; a start on a call whose tick is stuck is refused as a duplicate.

use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, TryLockError};

use super::attachment::{Attachment, AttachmentStatus};
use super::state::PumpState;
use crate::config::DspSettings;
use crate::dsp::{DspError, DspProcessConfig, SubprocessSupervisor, TickReport};
use crate::media::{AudioFrame, CodecFormat, Direction};

/// Handle to one call's attachment, shared between the map and in-flight
/// ticks.
type SharedAttachment = Arc<Mutex<Attachment>>;

// ---------------------------------------------------------------------------
// MediaEvent
// ---------------------------------------------------------------------------

/// Events the call's media pipeline delivers for an attached session.
#[derive(Debug)]
pub enum MediaEvent<'a> {
    /// The attachment was added to the media path.
    Init,
    /// A frame passed by in `Direction`; read-only tap.
    FrameReady(Direction),
    /// A frame may be replaced before it continues in `Direction`.
    FrameForOutput(Direction, Option<&'a mut AudioFrame>),
    /// The attachment was removed or the call ended.
    Close,
}

// ---------------------------------------------------------------------------
// LifecycleController
// ---------------------------------------------------------------------------

/// `true` if the slot holding `attachment` is taken.  An attachment whose
/// lock is held has a tick or teardown in flight and counts as taken; this
/// never blocks, so it is safe under the map lock.
fn occupies_slot(attachment: &SharedAttachment) -> bool {
    match attachment.try_lock() {
        Ok(attachment) => attachment.state().is_active(),
        Err(TryLockError::WouldBlock) => true,
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().state().is_active(),
    }
}

#[derive(Debug)]
pub struct LifecycleController {
    attachments: Mutex<HashMap<String, SharedAttachment>>,
    supervisor: SubprocessSupervisor,
    diagnostics_bytes: usize,
}

impl LifecycleController {
    pub fn new(supervisor: SubprocessSupervisor, diagnostics_bytes: usize) -> Self {
        Self {
            attachments: Mutex::new(HashMap::new()),
            supervisor,
            diagnostics_bytes,
        }
    }

    pub fn from_settings(settings: &DspSettings) -> Self {
        Self::new(
            SubprocessSupervisor::new(settings.export_format_env),
            settings.diagnostics_buffer_bytes,
        )
    }

    // -----------------------------------------------------------------------
    // Control path
    // -----------------------------------------------------------------------

    /// Attach a DSP process to `session_id`.
    ///
    /// # Errors
    ///
    /// - [`DspError::DuplicateAttachment`] if the call already has an armed
    ///   or degraded attachment; that attachment is left untouched.
    /// - [`DspError::ResourceExhausted`] / [`DspError::SpawnFailed`] if arming
    ///   fails; no attachment is recorded.
    ///
    /// A terminated attachment still sitting in the slot is replaced.
    pub fn start(
        &self,
        session_id: &str,
        config: DspProcessConfig,
        format: CodecFormat,
    ) -> Result<(), DspError> {
        let duplicate = || {
            log::warn!("{session_id}: cannot run 2 times at once on the same channel");
            Err(DspError::DuplicateAttachment(session_id.to_string()))
        };

        if self.lookup(session_id).is_some_and(|a| occupies_slot(&a)) {
            return duplicate();
        }

        // Spawning happens outside the map lock.
        let attachment = Arc::new(Mutex::new(Attachment::new(
            session_id,
            config,
            format,
            self.diagnostics_bytes,
        )));
        self.dispatch(&attachment, MediaEvent::Init)?;

        let replaced = {
            let mut map = self.attachments.lock().unwrap();
            if map.get(session_id).is_some_and(occupies_slot) {
                None
            } else {
                Some(map.insert(session_id.to_string(), attachment))
            }
        };

        match replaced {
            // Lost a race with a concurrent start; ours is torn down on drop.
            None => duplicate(),
            Some(Some(old)) => {
                log::debug!("{session_id}: replaced {} attachment", old.lock().unwrap().state());
                Ok(())
            }
            Some(None) => Ok(()),
        }
    }

    /// Detach and tear down the DSP process of `session_id`.
    ///
    /// Returns the exit status from the reap, which may have happened earlier
    /// if the attachment had already degraded.
    ///
    /// # Errors
    ///
    /// [`DspError::NotAttached`] if the call has no attachment; a second stop
    /// therefore fails without touching any process.
    pub fn stop(&self, session_id: &str) -> Result<Option<ExitStatus>, DspError> {
        let attachment = self
            .attachments
            .lock()
            .unwrap()
            .remove(session_id)
            .ok_or_else(|| DspError::NotAttached(session_id.to_string()))?;

        let status = attachment.lock().unwrap().teardown();
        log::info!("{session_id}: external DSP stopped");
        Ok(status)
    }

    /// The call is going away: tear down its attachment if there is one.
    pub fn call_ended(&self, session_id: &str) {
        match self.stop(session_id) {
            Ok(_) => log::debug!("{session_id}: attachment closed with the call"),
            Err(DspError::NotAttached(_)) => {}
            Err(e) => log::warn!("{session_id}: teardown at call end failed: {e}"),
        }
    }

    /// Tear down every attachment (host shutdown).
    pub fn shutdown(&self) {
        let drained: Vec<(String, SharedAttachment)> =
            self.attachments.lock().unwrap().drain().collect();

        for (session_id, attachment) in drained {
            if let Err(e) = self.dispatch(&attachment, MediaEvent::Close) {
                log::warn!("{session_id}: teardown at shutdown failed: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Media path
    // -----------------------------------------------------------------------

    /// Deliver a media event for `session_id`.
    ///
    /// Returns the attachment state after the event, or `None` when the call
    /// has no attachment (the event is ignored and frames pass through).
    pub fn handle(
        &self,
        session_id: &str,
        event: MediaEvent<'_>,
    ) -> Result<Option<PumpState>, DspError> {
        let Some(attachment) = self.lookup(session_id) else {
            return Ok(None);
        };
        self.dispatch(&attachment, event)?;
        let state = attachment.lock().unwrap().state();
        Ok(Some(state))
    }

    /// Frame-ready-for-output shortcut used on every tick.
    ///
    /// `None` means the call has no attachment and the frame was not touched.
    pub fn process_frame(
        &self,
        session_id: &str,
        direction: Direction,
        frame: Option<&mut AudioFrame>,
    ) -> Option<TickReport> {
        let attachment = self.lookup(session_id)?;
        log::trace!("{session_id}: {direction:?} frame");
        let report = attachment.lock().unwrap().process_frame(frame);
        Some(report)
    }

    fn dispatch(&self, attachment: &SharedAttachment, event: MediaEvent<'_>) -> Result<(), DspError> {
        let mut attachment = attachment.lock().unwrap();
        match event {
            MediaEvent::Init => attachment.arm(&self.supervisor)?,
            MediaEvent::FrameReady(direction) => {
                log::trace!("{}: {direction:?} frame observed", attachment.session_id());
            }
            MediaEvent::FrameForOutput(_, frame) => {
                attachment.process_frame(frame);
            }
            MediaEvent::Close => {
                attachment.teardown();
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    fn lookup(&self, session_id: &str) -> Option<SharedAttachment> {
        self.attachments.lock().unwrap().get(session_id).cloned()
    }

    /// State of the call's attachment; `Unarmed` when there is none.
    pub fn state(&self, session_id: &str) -> PumpState {
        self.lookup(session_id)
            .map(|a| a.lock().unwrap().state())
            .unwrap_or_default()
    }

    /// `true` if the call has an attachment in any state.
    pub fn is_attached(&self, session_id: &str) -> bool {
        self.attachments.lock().unwrap().contains_key(session_id)
    }

    pub fn pid(&self, session_id: &str) -> Option<u32> {
        self.lookup(session_id).and_then(|a| a.lock().unwrap().pid())
    }

    /// Snapshot of all attachments, sorted by session identifier.
    pub fn status(&self) -> Vec<AttachmentStatus> {
        let handles: Vec<SharedAttachment> =
            self.attachments.lock().unwrap().values().cloned().collect();
        let mut statuses: Vec<AttachmentStatus> = handles
            .iter()
            .map(|a| a.lock().unwrap().status())
            .collect();
        statuses.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        statuses
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::from_settings(&DspSettings::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn cat() -> DspProcessConfig {
        DspProcessConfig::new("/bin/cat", vec![])
    }

    fn sh(script: &str) -> DspProcessConfig {
        DspProcessConfig::new("/bin/sh", vec!["-c".into(), script.into()])
    }

    fn frame_of(byte: u8) -> AudioFrame {
        AudioFrame::from_bytes(&vec![byte; CodecFormat::default().frame_bytes()])
    }

    /// `true` once `pid` no longer names a live (or zombie) process.
    fn process_gone(pid: u32) -> bool {
        // SAFETY: signal 0 only checks for existence.
        unsafe { libc::kill(pid as libc::pid_t, 0) != 0 }
    }

    // ---- start ------------------------------------------------------------

    #[test]
    fn start_reaches_armed_with_one_process() {
        let ctl = LifecycleController::default();
        ctl.start("call-1", cat(), CodecFormat::default()).unwrap();

        assert_eq!(ctl.state("call-1"), PumpState::Armed);
        assert!(ctl.pid("call-1").is_some());
        assert_eq!(ctl.status().len(), 1);
        ctl.shutdown();
    }

    #[test]
    fn spawn_failure_leaves_no_attachment() {
        let ctl = LifecycleController::default();
        let err = ctl
            .start(
                "call-1",
                DspProcessConfig::new("/nonexistent/dsp", vec![]),
                CodecFormat::default(),
            )
            .unwrap_err();

        assert!(matches!(err, DspError::SpawnFailed { .. }));
        assert!(!ctl.is_attached("call-1"));
        assert_eq!(ctl.state("call-1"), PumpState::Unarmed);
    }

    #[test]
    fn second_start_is_rejected_and_first_untouched() {
        let ctl = LifecycleController::default();
        ctl.start("call-1", cat(), CodecFormat::default()).unwrap();
        let pid = ctl.pid("call-1");

        let err = ctl
            .start("call-1", sh("cat"), CodecFormat::default())
            .unwrap_err();

        assert_eq!(err, DspError::DuplicateAttachment("call-1".into()));
        assert_eq!(ctl.pid("call-1"), pid);
        assert_eq!(ctl.state("call-1"), PumpState::Armed);
        ctl.shutdown();
    }

    #[test]
    fn attachments_are_per_call() {
        let ctl = LifecycleController::default();
        ctl.start("call-1", cat(), CodecFormat::default()).unwrap();
        ctl.start("call-2", cat(), CodecFormat::default()).unwrap();

        assert_ne!(ctl.pid("call-1"), ctl.pid("call-2"));
        ctl.stop("call-1").unwrap();
        assert_eq!(ctl.state("call-2"), PumpState::Armed);
        ctl.shutdown();
    }

    #[test]
    fn start_on_stalled_call_leaves_other_calls_running() {
        let ctl = Arc::new(LifecycleController::default());
        ctl.start("call-a", sh("exec sleep 30"), CodecFormat::default()).unwrap();
        ctl.start("call-b", cat(), CodecFormat::default()).unwrap();
        let stalled_pid = ctl.pid("call-a").unwrap();

        // call-a never reads: a 1 MiB frame blocks its tick in the write.
        let ticker = {
            let ctl = Arc::clone(&ctl);
            std::thread::spawn(move || {
                let mut big = AudioFrame::from_bytes(&vec![0u8; 1 << 20]);
                ctl.process_frame("call-a", Direction::Read, Some(&mut big))
            })
        };
        std::thread::sleep(Duration::from_millis(200));

        let (tx, rx) = mpsc::channel();
        {
            let ctl = Arc::clone(&ctl);
            std::thread::spawn(move || {
                let restart = ctl.start("call-a", cat(), CodecFormat::default());
                tx.send(restart).ok();
            });
        }
        let restart = rx.recv_timeout(Duration::from_secs(2)).expect("start blocked");
        assert_eq!(restart, Err(DspError::DuplicateAttachment("call-a".into())));

        let (tx, rx) = mpsc::channel();
        {
            let ctl = Arc::clone(&ctl);
            std::thread::spawn(move || {
                let mut frame = frame_of(1);
                let report = ctl.process_frame("call-b", Direction::Read, Some(&mut frame));
                tx.send(report.is_some()).ok();
            });
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(true));
        assert!(ctl.is_attached("call-b"));

        // Killing the stalled process breaks the blocked write.
        // SAFETY: plain kill(2) on a child we spawned.
        unsafe { libc::kill(stalled_pid as libc::pid_t, libc::SIGKILL) };
        let report = ticker.join().unwrap().expect("call-a attached");
        assert!(report.input_lost());
        assert_eq!(ctl.state("call-a"), PumpState::Terminated);
        ctl.shutdown();
    }

    // ---- stop -------------------------------------------------------------

    #[test]
    fn stop_twice_succeeds_once() {
        let ctl = LifecycleController::default();
        ctl.start("call-1", sh("sleep 30"), CodecFormat::default()).unwrap();
        let pid = ctl.pid("call-1").unwrap();

        let started = Instant::now();
        assert!(ctl.stop("call-1").is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(process_gone(pid));

        assert_eq!(
            ctl.stop("call-1").unwrap_err(),
            DspError::NotAttached("call-1".into())
        );
    }

    #[test]
    fn frames_pass_through_after_stop() {
        let ctl = LifecycleController::default();
        ctl.start("call-1", cat(), CodecFormat::default()).unwrap();
        ctl.stop("call-1").unwrap();

        let mut frame = frame_of(7);
        assert!(ctl
            .process_frame("call-1", Direction::Read, Some(&mut frame))
            .is_none());
        assert_eq!(frame, frame_of(7));
    }

    #[test]
    fn call_end_tears_down_silently() {
        let ctl = LifecycleController::default();
        ctl.start("call-1", cat(), CodecFormat::default()).unwrap();
        let pid = ctl.pid("call-1").unwrap();

        ctl.call_ended("call-1");
        ctl.call_ended("call-1");

        assert!(!ctl.is_attached("call-1"));
        assert!(process_gone(pid));
    }

    // ---- broken pipe --------------------------------------------------------

    #[test]
    fn dead_process_terminates_attachment_within_the_tick() {
        let ctl = LifecycleController::default();
        ctl.start("call-1", sh("exit 0"), CodecFormat::default()).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let mut frame = frame_of(1);
        let report = ctl
            .process_frame("call-1", Direction::Write, Some(&mut frame))
            .expect("attached");

        assert!(report.input_lost());
        assert_eq!(ctl.state("call-1"), PumpState::Terminated);

        // Still occupies the slot until stopped; stop performs no new reap.
        assert!(ctl.stop("call-1").is_ok());
        assert!(ctl.stop("call-1").is_err());
    }

    #[test]
    fn start_replaces_terminated_attachment() {
        let ctl = LifecycleController::default();
        ctl.start("call-1", sh("exit 0"), CodecFormat::default()).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let mut frame = frame_of(1);
        ctl.process_frame("call-1", Direction::Read, Some(&mut frame));
        assert_eq!(ctl.state("call-1"), PumpState::Terminated);

        ctl.start("call-1", cat(), CodecFormat::default()).unwrap();
        assert_eq!(ctl.state("call-1"), PumpState::Armed);
        ctl.shutdown();
    }

    // ---- media events -------------------------------------------------------

    #[test]
    fn events_for_unknown_session_are_ignored() {
        let ctl = LifecycleController::default();
        let mut frame = frame_of(4);
        let state = ctl
            .handle(
                "nobody",
                MediaEvent::FrameForOutput(Direction::Read, Some(&mut frame)),
            )
            .unwrap();

        assert_eq!(state, None);
        assert_eq!(frame, frame_of(4));
    }

    #[test]
    fn frame_ready_never_substitutes() {
        let ctl = LifecycleController::default();
        ctl.start("call-1", sh("yes"), CodecFormat::default()).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let state = ctl
            .handle("call-1", MediaEvent::FrameReady(Direction::Read))
            .unwrap();
        assert_eq!(state, Some(PumpState::Armed));
        assert_eq!(ctl.status()[0].ticks, 0);
        ctl.shutdown();
    }

    #[test]
    fn close_event_terminates() {
        let ctl = LifecycleController::default();
        ctl.start("call-1", cat(), CodecFormat::default()).unwrap();

        let state = ctl.handle("call-1", MediaEvent::Close).unwrap();
        assert_eq!(state, Some(PumpState::Terminated));
        ctl.shutdown();
    }

    #[test]
    fn substituted_frames_never_exceed_capacity() {
        let ctl = LifecycleController::default();
        // `yes` floods audio-out far faster than one frame per tick.
        ctl.start("call-1", sh("yes"), CodecFormat::default()).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        for _ in 0..10 {
            let mut frame = frame_of(0);
            let report = ctl
                .process_frame("call-1", Direction::Read, Some(&mut frame))
                .unwrap();
            assert!(frame.len() <= frame.capacity());
            if let Some(n) = report.substituted {
                assert_eq!(frame.len(), n);
            } else {
                assert_eq!(frame.len(), frame.capacity());
            }
        }
        ctl.shutdown();
    }

    // ---- end to end -----------------------------------------------------------

    #[test]
    fn echo_process_returns_frames_one_tick_late() {
        let ctl = LifecycleController::default();
        ctl.start("call-1", cat(), CodecFormat::default()).unwrap();

        let sent: Vec<AudioFrame> = (1..=8u8).map(frame_of).collect();
        let mut returned: Vec<AudioFrame> = Vec::new();

        for original in &sent {
            let mut frame = original.clone();
            let report = ctl
                .process_frame("call-1", Direction::Read, Some(&mut frame))
                .unwrap();
            if report.substituted.is_some() {
                returned.push(frame);
            }
            // One media interval for the echo to come back.
            std::thread::sleep(Duration::from_millis(40));
        }

        // Every tick after the first hands back the previous tick's frame.
        assert!(returned.len() >= sent.len() - 1, "got {}", returned.len());
        assert_eq!(&returned[..], &sent[..returned.len()]);

        let pid = ctl.pid("call-1").unwrap();
        ctl.stop("call-1").unwrap();
        assert!(process_gone(pid));

        let mut frame = frame_of(42);
        assert!(ctl
            .process_frame("call-1", Direction::Read, Some(&mut frame))
            .is_none());
        assert_eq!(frame, frame_of(42));
    }

    #[test]
    fn status_snapshot_serializes() {
        let ctl = LifecycleController::default();
        ctl.start("call-b", cat(), CodecFormat::default()).unwrap();
        ctl.start("call-a", cat(), CodecFormat::default()).unwrap();

        let status = ctl.status();
        assert_eq!(status[0].session_id, "call-a");
        assert_eq!(status[1].session_id, "call-b");

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json[0]["state"], "armed");
        assert_eq!(json[0]["format"]["sample_rate"], 8000);
        ctl.shutdown();
    }
}
