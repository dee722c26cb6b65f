//! Engine error taxonomy.
//!
//! End of stream is deliberately absent: decoders report it as `Ok(None)`.

/// Errors surfaced by the playback engine
#[derive(Debug)]
pub enum EngineError {
    /// Container could not be opened, has no video stream, or codec setup failed
    MediaOpen(String),
    /// Mid-stream decode failure; codec state is unknown afterwards
    Decode(String),
    /// GPU presentation failed (recovered internally by CPU fallback)
    PresentationDegraded(String),
    /// Operation on a decoder or clock that is closed
    NotOpen,
    /// Audio track or device failure
    Audio(String),
    /// Config file could not be parsed or written
    Config(String),
    Io(std::io::Error),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::MediaOpen(e) => write!(f, "Media open error: {}", e),
            EngineError::Decode(e) => write!(f, "Decode error: {}", e),
            EngineError::PresentationDegraded(e) => write!(f, "Presentation degraded: {}", e),
            EngineError::NotOpen => write!(f, "Media not open"),
            EngineError::Audio(e) => write!(f, "Audio error: {}", e),
            EngineError::Config(e) => write!(f, "Config error: {}", e),
            EngineError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
