//! Host settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files.  Missing keys fall back
//! to their defaults, so a partial `settings.toml` is valid.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;
use crate::dsp::{DspProcessConfig, DEFAULT_DIAGNOSTICS_BYTES};
use crate::media::CodecFormat;

// ---------------------------------------------------------------------------
// MediaSettings
// ---------------------------------------------------------------------------

/// Codec geometry given to the console's simulated calls.
///
/// Real calls report their own negotiated format; these values only stand in
/// for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaSettings {
    /// Samples per second per channel.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Packetisation interval in milliseconds; also the media tick.
    pub ptime_ms: u32,
}

impl MediaSettings {
    pub fn codec_format(&self) -> CodecFormat {
        CodecFormat::new(self.sample_rate, self.channels, self.ptime_ms)
    }
}

impl Default for MediaSettings {
    fn default() -> Self {
        let fmt = CodecFormat::default();
        Self {
            sample_rate: fmt.sample_rate,
            channels: fmt.channels,
            ptime_ms: fmt.ptime_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// DspSettings
// ---------------------------------------------------------------------------

/// Settings for spawning and pumping external DSP processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DspSettings {
    /// Size of the per-tick diagnostics scratch buffer in bytes.
    pub diagnostics_buffer_bytes: usize,
    /// Export `DSP_SAMPLE_RATE`, `DSP_CHANNELS` and `DSP_FRAME_BYTES` to the
    /// child process.
    pub export_format_env: bool,
    /// Executable used by the console's `start` shorthand when no path is
    /// given.  `None` disables the shorthand.
    pub default_executable: Option<PathBuf>,
    /// Arguments passed with [`default_executable`](Self::default_executable).
    pub default_arguments: Vec<String>,
}

impl DspSettings {
    /// The configured default DSP process, if any.
    pub fn default_process(&self) -> Option<DspProcessConfig> {
        self.default_executable
            .as_ref()
            .map(|exe| DspProcessConfig::new(exe.clone(), self.default_arguments.clone()))
    }
}

impl Default for DspSettings {
    fn default() -> Self {
        Self {
            diagnostics_buffer_bytes: DEFAULT_DIAGNOSTICS_BYTES,
            export_format_env: true,
            default_executable: None,
            default_arguments: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// ConsoleSettings
// ---------------------------------------------------------------------------

/// Settings for the interactive console binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSettings {
    /// Number of simulated calls created at startup.
    pub demo_calls: usize,
    /// `env_logger` filter used when `RUST_LOG` is not set.
    pub log_filter: String,
    /// Frequency of the synthetic tone played on simulated calls, in Hz.
    pub tone_hz: f32,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            demo_calls: 1,
            log_filter: "info".into(),
            tone_hz: 440.0,
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level host configuration, serialised as `settings.toml`.
///
/// ```rust,no_run
/// use external_dsp::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
/// println!("{} byte frames", config.media.codec_format().frame_bytes());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub media: MediaSettings,
    pub dsp: DspSettings,
    pub console: ConsoleSettings,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
