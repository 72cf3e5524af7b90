//! Unified error types for tunerpath

use thiserror::Error;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PatchError {
    /// Not enough bytes buffered to complete a header or frame
    #[error("Need more data: have {have} bytes, need {need}")]
    NeedMoreData { have: usize, need: usize },

    /// Sync word did not match any known codec
    #[error("Invalid sync word: {0:#06x}")]
    InvalidSync(u32),

    /// Sample rate code is reserved or unsupported
    #[error("Invalid sample rate code: {0}")]
    InvalidSampleRate(u8),

    /// Frame size code out of range or computed size too small
    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(u32),

    /// Bitstream id or stream type not handled by this pipeline
    #[error("Unsupported stream: {0}")]
    UnsupportedStream(String),

    /// Decoder capability name is not registered
    #[error("Decoder capability not found: {0}")]
    CapabilityNotFound(String),

    /// Decoder engine refused to initialize
    #[error("Decoder '{engine}' init failed: {message}")]
    EngineInit { engine: String, message: String },

    /// Decoder engine failed mid-stream
    #[error("Decoder '{engine}' process failed: {message}")]
    EngineProcess { engine: String, message: String },

    /// Clock register could not be read or parsed
    #[error("Clock register '{register}' read failed: {message}")]
    ClockRead { register: String, message: String },

    /// Clock register could not be written
    #[error("Clock register '{register}' write failed: {message}")]
    ClockWrite { register: String, message: String },

    /// Sample rate converter could not be built or failed mid-stream
    #[error("Resampling failed: {0}")]
    Resample(String),

    /// Failed to spawn a session thread
    #[error("Failed to spawn {0} thread")]
    ThreadSpawn(&'static str),

    /// Session not initialized
    #[error("Patch session not initialized")]
    NotInitialized,

    /// Session already running
    #[error("Patch session already running")]
    AlreadyRunning,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying I/O error from a source or sink
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PatchError>;

impl PatchError {
    /// Create an engine init error with context
    pub fn engine_init(engine: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EngineInit {
            engine: engine.into(),
            message: message.into(),
        }
    }

    /// Create an engine process error with context
    pub fn engine_process(engine: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EngineProcess {
            engine: engine.into(),
            message: message.into(),
        }
    }

    /// Data errors that are recovered by caching and retrying on the next read
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PatchError::NeedMoreData { .. }
                | PatchError::InvalidSync(_)
                | PatchError::InvalidSampleRate(_)
                | PatchError::InvalidFrameSize(_)
                | PatchError::UnsupportedStream(_)
        )
    }

    /// Check if this error is recoverable (session continues in a degraded mode)
    pub fn is_recoverable(&self) -> bool {
        self.is_transient()
            || matches!(
                self,
                PatchError::CapabilityNotFound(_)
                    | PatchError::EngineInit { .. }
                    | PatchError::EngineProcess { .. }
                    | PatchError::Resample(_)
                    | PatchError::ClockRead { .. }
                    | PatchError::ClockWrite { .. }
            )
    }
}
