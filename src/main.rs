//! Console host for external DSP attachments.
//!
//! # Startup sequence
//!
//! 1. Load [`AppConfig`] from disk (returns default on first run).
//! 2. Initialise logging with the configured filter.
//! 3. Create the [`LifecycleController`] and the session table.
//! 4. Start the simulated calls: one media thread each, ticking at ptime
//!    with a synthetic tone.
//! 5. Read `process_audio` commands from stdin on the main thread until
//!    `quit`, EOF or Ctrl-C.
//! 6. Hang up every call and tear down every attachment.
//!
//! Commands are executed on the main thread on purpose: the parent-death
//! signal requested by each DSP process is bound to the thread that spawned
//! it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, BufReader};

use external_dsp::{
    api::{ApiHandler, SessionTable, StaticSession, API_NAME, APP_NAME},
    config::AppConfig,
    lifecycle::LifecycleController,
    media::{AudioFrame, CodecFormat, Direction},
};

const HELP: &str = "\
commands:
  <uuid> start <path> [args...]   attach an external DSP to a call
  <uuid> start                    attach the configured default DSP
  <uuid> stop                     detach it
  process_audio_start <uuid> [path args... | stop]
                                  same, as the dialplan application
  calls                           list simulated calls
  status                          attachment snapshot (JSON)
  complete <partial>              completion candidates
  help | quit";

// ---------------------------------------------------------------------------
// Synthetic call audio
// ---------------------------------------------------------------------------

/// Sine tone rendered as interleaved little-endian i16 frames.
struct ToneGenerator {
    phase: f32,
    step: f32,
    channels: usize,
}

impl ToneGenerator {
    fn new(freq_hz: f32, format: &CodecFormat) -> Self {
        Self {
            phase: 0.0,
            step: std::f32::consts::TAU * freq_hz / format.sample_rate.max(1) as f32,
            channels: format.channels.max(1) as usize,
        }
    }

    fn fill(&mut self, frame: &mut AudioFrame) {
        let buf = frame.buffer_mut();
        let bytes_per_block = 2 * self.channels;
        let blocks = buf.len() / bytes_per_block;

        for block in buf.chunks_exact_mut(bytes_per_block) {
            let sample = (self.phase.sin() * i16::MAX as f32 * 0.25) as i16;
            for ch in block.chunks_exact_mut(2) {
                ch.copy_from_slice(&sample.to_le_bytes());
            }
            self.phase = (self.phase + self.step) % std::f32::consts::TAU;
        }
        frame.set_len(blocks * bytes_per_block);
    }
}

// ---------------------------------------------------------------------------
// Simulated calls
// ---------------------------------------------------------------------------

struct SimulatedCall {
    id: String,
    hangup: Arc<AtomicBool>,
    media: JoinHandle<()>,
}

/// Spawn the media thread of one call.  It ticks once per ptime, hands every
/// frame to the controller and closes the attachment when the call hangs up.
fn start_call(
    id: String,
    format: CodecFormat,
    tone_hz: f32,
    controller: Arc<LifecycleController>,
) -> std::io::Result<SimulatedCall> {
    let hangup = Arc::new(AtomicBool::new(false));
    let thread_hangup = Arc::clone(&hangup);
    let thread_id = id.clone();

    let media = std::thread::Builder::new()
        .name(format!("media-{id}"))
        .spawn(move || {
            let mut tone = ToneGenerator::new(tone_hz, &format);
            let mut frame = AudioFrame::new(format.frame_bytes().max(1));
            let mut substituted: u64 = 0;
            let mut next_tick = Instant::now();

            while !thread_hangup.load(Ordering::Relaxed) {
                tone.fill(&mut frame);
                if let Some(report) =
                    controller.process_frame(&thread_id, Direction::Read, Some(&mut frame))
                {
                    if report.substituted.is_some() {
                        substituted += 1;
                    }
                }

                next_tick += format.ptime();
                let now = Instant::now();
                if next_tick > now {
                    std::thread::sleep(next_tick - now);
                } else {
                    // Overran the tick; resynchronise rather than burst.
                    next_tick = now;
                }
            }

            controller.call_ended(&thread_id);
            log::info!("{thread_id}: hung up ({substituted} frames substituted)");
        })?;

    Ok(SimulatedCall { id, hangup, media })
}

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

/// Execute one console line.  Returns `false` when the console should exit.
fn handle_line(line: &str, handler: &ApiHandler, calls: &[SimulatedCall]) -> bool {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix(APP_NAME) {
        let rest = rest.trim_start();
        let (session_id, data) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        match handler.run_app(session_id, data) {
            Ok(()) => println!("+OK Success"),
            Err(e) => println!("-ERR {e}"),
        }
        return true;
    }

    let line = line.strip_prefix(API_NAME).map(str::trim_start).unwrap_or(line);

    match line {
        "" => {}
        "quit" | "exit" => return false,
        "help" => println!("{HELP}"),
        "calls" => {
            for call in calls {
                println!("{}", call.id);
            }
        }
        "status" => match serde_json::to_string_pretty(&handler.controller().status()) {
            Ok(json) => println!("{json}"),
            Err(e) => println!("-ERR {e}"),
        },
        _ => {
            if let Some(partial) = line.strip_prefix("complete") {
                println!("{}", handler.complete(partial.trim_start()).join(" "));
            } else {
                print!("{}", handler.execute(line));
            }
        }
    }
    true
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // 1. Configuration
    let (config, config_err) = match AppConfig::load() {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };

    // 2. Logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.console.log_filter.as_str()),
    )
    .init();
    log::info!("external DSP console starting up");
    if let Some(e) = config_err {
        log::warn!("Failed to load config ({e}); using defaults");
    }

    // 3. Controller + sessions
    let controller = Arc::new(LifecycleController::from_settings(&config.dsp));
    let sessions = Arc::new(SessionTable::new());
    let handler = ApiHandler::new(Arc::clone(&controller), sessions.clone())
        .with_default_process(config.dsp.default_process());

    // 4. Simulated calls
    let format = config.media.codec_format();
    let mut calls = Vec::with_capacity(config.console.demo_calls);
    for n in 1..=config.console.demo_calls {
        let id = format!("call-{n}");
        sessions.insert(Arc::new(StaticSession::new(id.clone(), format)));
        calls.push(start_call(
            id,
            format,
            config.console.tone_hz,
            Arc::clone(&controller),
        )?);
    }
    log::info!(
        "{} simulated call(s), {} Hz / {} ch / {} ms",
        calls.len(),
        format.sample_rate,
        format.channels,
        format.ptime_ms
    );
    println!("{HELP}");

    // 5. Command loop
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_line(&line, &handler, &calls) {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted");
                break;
            }
        }
    }

    // 6. Hang up
    for call in &calls {
        call.hangup.store(true, Ordering::Relaxed);
    }
    for call in calls {
        sessions.remove(&call.id);
        if call.media.join().is_err() {
            log::warn!("{}: media thread panicked", call.id);
        }
    }
    controller.shutdown();
    log::info!("external DSP console stopped");
    Ok(())
}
