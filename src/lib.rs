//! cuepoint - frame-accurate video playback with burned-in subtitles
//!
//! Re-exports all modules for use by the binary and embedding hosts.

// Core engine (decode, clocks, cache, sync, presentation, events)
pub mod core;

pub mod cli;
pub mod config;
pub mod entities;
pub mod error;
pub mod paths;

// Re-export commonly used types from core
pub use self::core::events::{channel, EngineEvent, EventReceiver, EventSender};
pub use self::core::player::{PlaybackState, Player};
pub use self::core::subtitles::{SubtitleCompositor, SubtitleSource};
pub use self::core::sync_engine::SyncEngine;

pub use config::{EngineConfig, PresenterBackend};
pub use entities::{DecodedFrame, FrameBuffer, MediaInfo, SubtitleMask};
pub use error::{EngineError, Result};
