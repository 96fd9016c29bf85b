//! The three pipes connecting the host to one DSP process.
//!
//! ```text
//!            host end                       process end
//! audio-in   write ───────────────────────▶ read   (child stdin)
//! audio-out  read  ◀─────────────────────── write  (child stdout)
//! diag-out   read  ◀─────────────────────── write  (child stderr)
//! ```
//!
//! Host ends live in `Option<File>`: `None` is the closed sentinel, so every
//! descriptor is either open and usable or explicitly gone, and closing is
//! idempotent.  Process ends are handed over exactly once through
//! [`PipeChannelSet::take_process_ends`] and dropped by the host right after
//! the spawn.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use super::error::DspError;

// ---------------------------------------------------------------------------
// Pipe allocation
// ---------------------------------------------------------------------------

/// Allocate one pipe, returning `(read_end, write_end)`.
///
/// Both ends are close-on-exec.  The child's copies are created by `dup2`
/// onto its standard streams, which clears the flag on the duplicates only;
/// host ends therefore never leak into DSP processes spawned for other calls.
fn pipe_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1, -1];

    // SAFETY: `fds` is a valid two-element array for the kernel to fill.
    #[cfg(target_os = "linux")]
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    // SAFETY: as above.
    #[cfg(not(target_os = "linux"))]
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };

    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: both descriptors were just returned by the kernel and nothing
    // else owns them.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    #[cfg(not(target_os = "linux"))]
    {
        set_cloexec(&read)?;
        set_cloexec(&write)?;
    }

    Ok((read, write))
}

#[cfg(not(target_os = "linux"))]
fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: `fd` is a valid open descriptor for the duration of the call.
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Make writes to a pipe whose reader is gone fail with `EPIPE` instead of
/// killing the host.  A `SIGPIPE` handler the host installed itself is left
/// alone; only the default disposition is replaced.
fn ignore_sigpipe() {
    // SAFETY: a null `act` only queries the current disposition into
    // `current`, which the kernel fully initialises.
    let current = unsafe {
        let mut current: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(libc::SIGPIPE, std::ptr::null(), &mut current) != 0 {
            return;
        }
        current
    };
    if current.sa_sigaction == libc::SIG_DFL {
        // SAFETY: installing SIG_IGN has no handler code to run.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    }
}

// ---------------------------------------------------------------------------
// ProcessEnds
// ---------------------------------------------------------------------------

/// Pipe ends destined for the DSP process's standard streams.
#[derive(Debug)]
pub struct ProcessEnds {
    /// Read end of audio-in; becomes the child's stdin.
    pub audio_in: OwnedFd,
    /// Write end of audio-out; becomes the child's stdout.
    pub audio_out: OwnedFd,
    /// Write end of diagnostics-out; becomes the child's stderr.
    pub diagnostics: OwnedFd,
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// Result of one poll over the host-owned read ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub audio_out: bool,
    pub diagnostics: bool,
}

impl Readiness {
    pub fn any(&self) -> bool {
        self.audio_out || self.diagnostics
    }
}

// ---------------------------------------------------------------------------
// PipeChannelSet
// ---------------------------------------------------------------------------

/// Owns both ends of the audio-in, audio-out and diagnostics-out pipes.
#[derive(Debug)]
pub struct PipeChannelSet {
    audio_in: Option<File>,
    audio_out: Option<File>,
    diagnostics: Option<File>,
    process_ends: Option<ProcessEnds>,
}

impl PipeChannelSet {
    /// Allocate all three pipes.
    ///
    /// Also switches `SIGPIPE` from its default to ignored, so a DSP process
    /// that exits surfaces as a write error on audio-in.
    ///
    /// # Errors
    ///
    /// Returns [`DspError::ResourceExhausted`] if any pipe cannot be created.
    /// Pipes allocated before the failure are closed as the partially built
    /// ends go out of scope.
    pub fn open() -> Result<Self, DspError> {
        let exhausted = |e: io::Error| DspError::ResourceExhausted(e.to_string());
        ignore_sigpipe();

        let (in_read, in_write) = pipe_pair().map_err(exhausted)?;
        let (out_read, out_write) = pipe_pair().map_err(exhausted)?;
        let (diag_read, diag_write) = pipe_pair().map_err(exhausted)?;

        log::debug!(
            "dsp: opened pipes in={} out={} diag={}",
            in_write.as_raw_fd(),
            out_read.as_raw_fd(),
            diag_read.as_raw_fd()
        );

        Ok(Self {
            audio_in: Some(File::from(in_write)),
            audio_out: Some(File::from(out_read)),
            diagnostics: Some(File::from(diag_read)),
            process_ends: Some(ProcessEnds {
                audio_in: in_read,
                audio_out: out_write,
                diagnostics: diag_write,
            }),
        })
    }

    /// Hand the process-side ends to the spawner.  Returns `None` after the
    /// first call.
    pub fn take_process_ends(&mut self) -> Option<ProcessEnds> {
        self.process_ends.take()
    }

    /// Write one frame's bytes to audio-in, blocking while the pipe is full.
    ///
    /// A closed reader surfaces as [`io::ErrorKind::BrokenPipe`]; `SIGPIPE`
    /// is ignored from [`open`](Self::open) on, so the write returns `EPIPE`
    /// rather than killing the host.
    pub fn write_audio(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.audio_in.as_mut() {
            Some(pipe) => pipe.write_all(bytes),
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }

    /// Read whatever audio the process has produced, up to `buf.len()` bytes.
    pub fn read_audio(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.audio_out.as_mut() {
            Some(pipe) => pipe.read(buf),
            None => Ok(0),
        }
    }

    /// Read diagnostic output, up to `buf.len()` bytes.
    pub fn read_diagnostics(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.diagnostics.as_mut() {
            Some(pipe) => pipe.read(buf),
            None => Ok(0),
        }
    }

    /// Report which host read ends have data, waiting at most `timeout`.
    ///
    /// A zero timeout checks the descriptors and returns immediately; the
    /// frame tick only ever polls that way.  An interrupted poll reports
    /// nothing ready.
    pub fn poll_readable(&self, timeout: Duration) -> io::Result<Readiness> {
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(2);
        let mut slots: Vec<bool> = Vec::with_capacity(2); // true = audio-out

        for (pipe, is_audio) in [(&self.audio_out, true), (&self.diagnostics, false)] {
            if let Some(pipe) = pipe {
                fds.push(libc::pollfd {
                    fd: pipe.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                });
                slots.push(is_audio);
            }
        }

        if fds.is_empty() {
            return Ok(Readiness::default());
        }

        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: `fds` points to `fds.len()` initialised pollfd structs whose
        // descriptors stay open for the duration of the call.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Readiness::default());
            }
            return Err(err);
        }

        let mut readiness = Readiness::default();
        if ready > 0 {
            for (pfd, is_audio) in fds.iter().zip(slots) {
                if pfd.revents & libc::POLLIN != 0 {
                    if is_audio {
                        readiness.audio_out = true;
                    } else {
                        readiness.diagnostics = true;
                    }
                }
            }
        }
        Ok(readiness)
    }

    pub fn is_audio_in_open(&self) -> bool {
        self.audio_in.is_some()
    }

    /// Close audio-in after the process stopped reading it.
    pub fn mark_audio_in_closed(&mut self) {
        self.audio_in = None;
    }

    /// Close every host-owned descriptor still open, plus any process ends
    /// that were never handed over.
    ///
    /// Returns `true` if anything was actually closed, so callers can tell a
    /// redundant teardown apart from the first one.
    pub fn close_host_ends(&mut self) -> bool {
        let was_open = self.audio_in.is_some()
            || self.audio_out.is_some()
            || self.diagnostics.is_some()
            || self.process_ends.is_some();

        self.audio_in = None;
        self.audio_out = None;
        self.diagnostics = None;
        self.process_ends = None;

        was_open
    }

    /// `true` once every host-owned end has been released.
    pub fn is_closed(&self) -> bool {
        self.audio_in.is_none() && self.audio_out.is_none() && self.diagnostics.is_none()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Open a channel set and detach the process ends as plain files so tests
    /// can play the part of the DSP process.
    fn open_with_peer() -> (PipeChannelSet, File, File, File) {
        let mut set = PipeChannelSet::open().expect("open pipes");
        let ends = set.take_process_ends().expect("process ends");
        (
            set,
            File::from(ends.audio_in),
            File::from(ends.audio_out),
            File::from(ends.diagnostics),
        )
    }

    #[test]
    fn fresh_set_polls_nothing_ready() {
        let (set, _stdin, _stdout, _stderr) = open_with_peer();
        let ready = set.poll_readable(Duration::ZERO).expect("poll");
        assert_eq!(ready, Readiness::default());
        assert!(!ready.any());
    }

    #[test]
    fn audio_written_by_peer_is_readable() {
        let (mut set, _stdin, mut stdout, _stderr) = open_with_peer();
        stdout.write_all(&[1, 2, 3, 4]).unwrap();

        let ready = set.poll_readable(Duration::from_millis(100)).expect("poll");
        assert!(ready.audio_out);
        assert!(!ready.diagnostics);

        let mut buf = [0u8; 16];
        assert_eq!(set.read_audio(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn diagnostics_written_by_peer_are_readable() {
        let (mut set, _stdin, _stdout, mut stderr) = open_with_peer();
        stderr.write_all(b"warming up").unwrap();

        let ready = set.poll_readable(Duration::from_millis(100)).expect("poll");
        assert!(ready.diagnostics);
        assert!(!ready.audio_out);

        let mut buf = [0u8; 64];
        let n = set.read_diagnostics(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"warming up");
    }

    #[test]
    fn audio_in_reaches_peer() {
        let (mut set, mut stdin, _stdout, _stderr) = open_with_peer();
        set.write_audio(&[7, 7, 7]).unwrap();

        let mut buf = [0u8; 3];
        stdin.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [7, 7, 7]);
    }

    #[test]
    fn write_after_peer_closed_is_broken_pipe() {
        let (mut set, stdin, _stdout, _stderr) = open_with_peer();
        drop(stdin);

        let err = set.write_audio(&[0u8; 32]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn process_ends_are_taken_once() {
        let mut set = PipeChannelSet::open().unwrap();
        assert!(set.take_process_ends().is_some());
        assert!(set.take_process_ends().is_none());
    }

    #[test]
    fn close_host_ends_is_idempotent() {
        let (mut set, _stdin, _stdout, _stderr) = open_with_peer();
        assert!(set.close_host_ends());
        assert!(set.is_closed());
        assert!(!set.close_host_ends());
        assert!(!set.is_audio_in_open());
    }

    #[test]
    fn closed_set_reads_nothing() {
        let (mut set, _stdin, mut stdout, _stderr) = open_with_peer();
        stdout.write_all(&[1]).unwrap();
        set.close_host_ends();

        let ready = set.poll_readable(Duration::ZERO).unwrap();
        assert!(!ready.any());
        let mut buf = [0u8; 4];
        assert_eq!(set.read_audio(&mut buf).unwrap(), 0);
        assert_eq!(
            set.write_audio(&[1]).unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }

    #[test]
    fn marking_audio_in_closed_keeps_read_ends() {
        let (mut set, _stdin, _stdout, _stderr) = open_with_peer();
        set.mark_audio_in_closed();
        assert!(!set.is_audio_in_open());
        assert!(!set.is_closed());
    }

    // ---- process-wide state -------------------------------------------------

    /// Marks a re-run of this test binary that executes a single test which
    /// changes process-wide state (signal dispositions, descriptor limits).
    const ISOLATED_ENV: &str = "EXTERNAL_DSP_ISOLATED_TEST";

    fn isolated(test: &str) -> bool {
        std::env::var(ISOLATED_ENV).as_deref() == Ok(test)
    }

    /// Re-run this test binary with only `test` selected and assert it passed.
    fn run_isolated(test: &str) {
        let out = std::process::Command::new(std::env::current_exe().unwrap())
            .args([test, "--exact", "--test-threads=1"])
            .env(ISOLATED_ENV, test)
            .output()
            .unwrap();
        let stdout = String::from_utf8_lossy(&out.stdout);
        assert!(
            out.status.success(),
            "{test} failed ({}):\n{stdout}{}",
            out.status,
            String::from_utf8_lossy(&out.stderr)
        );
        assert!(stdout.contains("1 passed"), "{test} did not run:\n{stdout}");
    }

    const DEFAULT_SIGPIPE_TEST: &str = "dsp::channels::tests::write_to_exited_reader_with_default_sigpipe";

    #[test]
    fn write_to_exited_reader_with_default_sigpipe() {
        if !isolated(DEFAULT_SIGPIPE_TEST) {
            return;
        }
        // SAFETY: this process runs no other test.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_DFL) };

        let (mut set, stdin, _stdout, _stderr) = open_with_peer();
        drop(stdin);
        let err = set.write_audio(&[0u8; 320]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn host_with_default_sigpipe_survives_exited_reader() {
        run_isolated(DEFAULT_SIGPIPE_TEST);
    }

    #[cfg(target_os = "linux")]
    fn open_descriptors() -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = std::fs::read_dir("/proc/self/fd")
            .unwrap()
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect();
        fds.sort_unstable();
        fds
    }

    #[cfg(target_os = "linux")]
    const DESCRIPTOR_LIMIT_TEST: &str = "dsp::channels::tests::open_at_descriptor_limit_releases_pipes";

    #[cfg(target_os = "linux")]
    #[test]
    fn open_at_descriptor_limit_releases_pipes() {
        if !isolated(DESCRIPTOR_LIMIT_TEST) {
            return;
        }

        // Lowest limit leaving three free descriptor numbers: enough for the
        // first pipe, not for all three.
        let used = open_descriptors();
        let mut limit = 0usize;
        while limit - used.iter().filter(|&&fd| (fd as usize) < limit).count() < 3 {
            limit += 1;
        }

        let mut rl = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `rl` is a valid rlimit for the kernel to read and fill.
        unsafe {
            assert_eq!(libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl), 0);
            rl.rlim_cur = limit as libc::rlim_t;
            assert_eq!(libc::setrlimit(libc::RLIMIT_NOFILE, &rl), 0);
        }

        let before = open_descriptors();
        let err = PipeChannelSet::open().unwrap_err();
        assert!(matches!(err, DspError::ResourceExhausted(_)), "{err:?}");
        assert_eq!(open_descriptors(), before);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_open_releases_earlier_pipes() {
        run_isolated(DESCRIPTOR_LIMIT_TEST);
    }
}
