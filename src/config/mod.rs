//! Pipeline configuration file support

pub mod args;

use crate::audio::Codec;
use crate::patch::SessionConfig;
use crate::sync::{RegisterPaths, SyncThresholds};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up next to the executable
pub const LOCAL_CONFIG_NAME: &str = "tunerpath.toml";

/// Pipeline configuration loaded from TOML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Ring buffer size in milliseconds
    pub ring_buffer_ms: u32,

    /// Bytes read from the tuner per iteration
    pub read_chunk_bytes: usize,

    /// Elementary stream codec (empty = detect from burst stream)
    pub codec: String,

    /// Decoder capability for AC-3 / E-AC-3
    pub dolby_decoder: String,

    /// Decoder capability for DTS
    pub dts_decoder: String,

    /// Render re-packaged bitstream instead of decoded PCM
    pub raw_passthrough: bool,

    /// Drift below this many 90 kHz ticks is ignored
    pub soft_threshold: u64,

    /// Drift at or above this many ticks is a discontinuity
    pub discontinuity_threshold: u64,

    /// Periods without sync before falling back to PCM
    pub hysteresis_periods: usize,

    /// Producer wait when the ring buffer is full
    pub write_timeout_ms: u64,

    /// Wait for video before starting audio (0 = don't wait)
    pub av_start_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log file path (empty = no file logging)
    pub log_file: String,

    /// Clock register locations
    pub clock: ClockConfig,
}

/// Clock register locations, empty entries use the standard name in `register_dir`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Directory holding the registers (empty = in-memory clock)
    pub register_dir: String,
    pub play_pts: String,
    pub video_pts: String,
    pub first_checkin_apts: String,
    pub lookup_request: String,
    pub lookup_result: String,
    pub event: String,
}

impl ClockConfig {
    /// Resolve register paths, `None` when no registers are configured
    pub fn register_paths(&self) -> Option<RegisterPaths> {
        if self.register_dir.is_empty() {
            return None;
        }
        let mut paths = RegisterPaths::in_dir(&self.register_dir);
        let overrides = [
            (&self.play_pts, &mut paths.play_pts),
            (&self.video_pts, &mut paths.video_pts),
            (&self.first_checkin_apts, &mut paths.first_checkin_apts),
            (&self.lookup_request, &mut paths.lookup_request),
            (&self.lookup_result, &mut paths.lookup_result),
            (&self.event, &mut paths.event),
        ];
        for (value, path) in overrides {
            if !value.is_empty() {
                *path = PathBuf::from(value);
            }
        }
        Some(paths)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            ring_buffer_ms: session.ring_buffer_ms,
            read_chunk_bytes: session.read_chunk_bytes,
            codec: String::new(),
            dolby_decoder: session.dolby_decoder,
            dts_decoder: session.dts_decoder,
            raw_passthrough: false,
            soft_threshold: session.thresholds.soft,
            discontinuity_threshold: session.thresholds.discontinuity,
            hysteresis_periods: session.hysteresis_periods,
            write_timeout_ms: 1000,
            av_start_timeout_ms: 0,
            log_level: "info".to_string(),
            log_file: String::new(),
            clock: ClockConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })
    }

    /// Load configuration from default locations
    ///
    /// Searches in order:
    /// 1. Same directory as executable: tunerpath.toml
    /// 2. User config directory: tunerpath/config.toml
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let config_path = exe_dir.join(LOCAL_CONFIG_NAME);
                if config_path.exists() {
                    return Self::load(&config_path);
                }
            }
        }

        if let Some(config_path) = Self::user_config_path() {
            if config_path.exists() {
                return Self::load(&config_path);
            }
        }

        Ok(Self::default())
    }

    /// Per-user config file location
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tunerpath").join("config.toml"))
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_string_lossy().to_string(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })
    }

    /// Convert to the runtime session configuration
    pub fn to_session_config(&self) -> Result<SessionConfig, ConfigError> {
        let codec = parse_codec(&self.codec)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown codec '{}'", self.codec)))?;

        let config = SessionConfig {
            ring_buffer_ms: self.ring_buffer_ms,
            read_chunk_bytes: self.read_chunk_bytes,
            codec,
            dolby_decoder: self.dolby_decoder.clone(),
            dts_decoder: self.dts_decoder.clone(),
            raw_passthrough: self.raw_passthrough,
            thresholds: SyncThresholds {
                soft: self.soft_threshold,
                discontinuity: self.discontinuity_threshold,
            },
            hysteresis_periods: self.hysteresis_periods,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            av_start_timeout: if self.av_start_timeout_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(self.av_start_timeout_ms))
            },
        };
        config
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }

    /// Generate a sample configuration file content
    pub fn sample_config() -> String {
        r#"# tunerpath pipeline configuration

# Ring buffer size in milliseconds of 48 kHz stereo output (default: 500)
ring_buffer_ms = 500

# Bytes read from the tuner per iteration (default: 4096)
read_chunk_bytes = 4096

# Elementary stream codec: ac3, eac3, dts, dtshd, pcm
# Empty = detect from the burst-wrapped stream
codec = ""

# Decoder capabilities by family (unknown names fall back to pass-through)
dolby_decoder = "passthrough"
dts_decoder = "passthrough"

# Render re-packaged bitstream instead of decoded PCM
raw_passthrough = false

# PTS drift thresholds in 90 kHz ticks
soft_threshold = 900
discontinuity_threshold = 27000

# Periods without sync before reverting to PCM
hysteresis_periods = 2

# Wait budget when the ring buffer is full
write_timeout_ms = 1000

# Wait for video before starting audio (0 = don't wait)
av_start_timeout_ms = 0

# Log level: trace, debug, info, warn, error (default: info)
log_level = "info"

# Log file path (empty = no file logging)
log_file = ""

[clock]
# Directory of text clock registers (empty = in-memory clock)
# Example: register_dir = "/sys/class/tsync"
register_dir = ""
"#
        .to_string()
    }
}

/// Parse a codec name, `Some(None)` for auto-detection
pub fn parse_codec(name: &str) -> Option<Option<Codec>> {
    let codec = match name.trim().to_ascii_lowercase().as_str() {
        "" | "auto" => return Some(None),
        "pcm" => Codec::Pcm,
        "ac3" | "ac-3" => Codec::Ac3,
        "eac3" | "e-ac-3" | "ddp" => Codec::Eac3,
        "dts" => Codec::Dts,
        "dtshd" | "dts-hd" => Codec::DtsHd,
        _ => return None,
    };
    Some(Some(codec))
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file
    Io {
        path: String,
        source: std::io::Error,
    },
    /// Error parsing TOML
    Parse {
        path: String,
        source: toml::de::Error,
    },
    /// Error serializing config
    Serialize(toml::ser::Error),
    /// Values that parse but make no sense together
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "Failed to read config file '{}': {}", path, source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Failed to parse config file '{}': {}", path, source)
            }
            ConfigError::Serialize(e) => write!(f, "Failed to serialize config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Serialize(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_matches_default() {
        let parsed: PipelineConfig = toml::from_str(&PipelineConfig::sample_config()).unwrap();
        assert_eq!(parsed, PipelineConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = PipelineConfig {
            codec: "eac3".to_string(),
            raw_passthrough: true,
            soft_threshold: 450,
            ..PipelineConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "codec = \"dts\"\n[clock]\nregister_dir = \"/tmp/regs\"\n").unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.ring_buffer_ms, 500);
        assert_eq!(config.clock.register_dir, "/tmp/regs");

        let session = config.to_session_config().unwrap();
        assert_eq!(session.codec, Some(Codec::Dts));
        assert_eq!(session.thresholds, SyncThresholds::default());
    }

    #[test]
    fn test_invalid_values() {
        let config = PipelineConfig {
            codec: "mp3".to_string(),
            ..PipelineConfig::default()
        };
        assert!(matches!(config.to_session_config(), Err(ConfigError::Invalid(_))));

        let config = PipelineConfig {
            soft_threshold: 30_000,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.to_session_config(), Err(ConfigError::Invalid(_))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "ring_buffer_ms = \"lots\"").unwrap();
        assert!(matches!(PipelineConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_register_paths() {
        assert!(ClockConfig::default().register_paths().is_none());

        let clock = ClockConfig {
            register_dir: "/sys/class/tsync".to_string(),
            event: "/sys/class/tsync/event_custom".to_string(),
            ..ClockConfig::default()
        };
        let paths = clock.register_paths().unwrap();
        assert_eq!(paths.play_pts, PathBuf::from("/sys/class/tsync/pts_audio"));
        assert_eq!(paths.event, PathBuf::from("/sys/class/tsync/event_custom"));
    }

    #[test]
    fn test_parse_codec_names() {
        assert_eq!(parse_codec(""), Some(None));
        assert_eq!(parse_codec("E-AC-3"), Some(Some(Codec::Eac3)));
        assert_eq!(parse_codec("dtshd"), Some(Some(Codec::DtsHd)));
        assert_eq!(parse_codec("flac"), None);
    }
}
