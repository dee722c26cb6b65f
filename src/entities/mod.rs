//! Entities - plain data types passed between engine stages.
//!
//! No threading or I/O lives here; see `core` for the engine itself.

pub mod frame;
pub mod mask;
pub mod media;

pub use frame::{DecodedFrame, FrameBuffer, PixelFormat, BYTES_PER_PIXEL};
pub use mask::SubtitleMask;
pub use media::MediaInfo;
