//! Core engine modules - decode, clocks, cache, sync, presentation, events
//!
//! These modules form the playback engine, independent of any window layer.

pub mod audio;
#[cfg(feature = "audio-device")]
pub mod audio_device;
pub mod blend;
pub mod decode_ahead;
pub mod decoder;
pub mod events;
pub mod frame_cache;
pub mod keyframes;
pub mod pattern;
pub mod player;
pub mod presenter;
pub mod subtitles;
pub mod sync_engine;

// Re-exports for convenience
pub use audio::{AudioClock, AudioSink, ClockHandle, MasterClock, NullSink, WallClock};
#[cfg(feature = "audio-device")]
pub use audio_device::CpalSink;
pub use decoder::{DecoderOptions, DecoderState, FrameSource, VideoDecoder};
pub use events::{EngineEvent, EventReceiver, EventSender};
pub use frame_cache::{CacheStats, FrameCache};
pub use keyframes::KeyframeIndex;
pub use pattern::PatternSource;
pub use player::{PlaybackState, Player};
pub use presenter::{Presenter, SurfaceImage};
pub use subtitles::{NoSubtitles, SubtitleCompositor, SubtitleSource};
pub use sync_engine::{DecodeStatus, SyncEngine};
