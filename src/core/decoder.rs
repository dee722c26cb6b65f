//! Video decoder - pull-based FFmpeg decoding into a persistent BGRA frame.
//!
//! State machine: `Closed -> Opened -> (Seeking | Decoding) -> Closed`.
//! Nothing here knows about wall-clock time; the sync engine pulls frames.
//!
//! All methods take `&mut self`, and the engine keeps the decoder behind one
//! mutex, so the codec library is never entered from two threads at once.

use log::{debug, trace, warn};
use playa_ffmpeg as ffmpeg;
use std::path::{Path, PathBuf};
use std::sync::Once;

use super::keyframes::{self, KeyframeIndex};
use crate::config::EngineConfig;
use crate::entities::{DecodedFrame, MediaInfo, BYTES_PER_PIXEL};
use crate::error::{EngineError, Result};
use crate::paths::PathConfig;

static FFMPEG_LOG_INIT: Once = Once::new();

/// Silence FFmpeg's stderr chatter (once per process)
pub(crate) fn init_ffmpeg_logging() {
    FFMPEG_LOG_INIT.call_once(|| unsafe {
        ffmpeg::ffi::av_log_set_level(ffmpeg::ffi::AV_LOG_QUIET);
    });
}

/// Lifecycle of a frame source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Closed,
    Opened,
    Seeking,
    Decoding,
}

/// Pull-based producer of BGRA frames.
///
/// `Ok(None)` from the decode calls means end of stream, never an error.
pub trait FrameSource: Send {
    fn info(&self) -> MediaInfo;

    fn state(&self) -> DecoderState;

    /// Coarse seek to the nearest keyframe <= `position`, then flush.
    /// The next decoded frame may land before `position`.
    fn seek(&mut self, position: f64) -> Result<()>;

    /// Seek via the keyframe index and decode forward, discarding frames,
    /// until one with `pts >= target` is produced. Returns its pts.
    fn seek_and_decode_to(&mut self, target: f64) -> Result<Option<f64>>;

    /// Decode the next frame into `frame()`; returns its pts
    fn try_decode_next(&mut self) -> Result<Option<f64>>;

    /// Last decoded frame (persistent buffer, overwritten on each decode)
    fn frame(&self) -> &DecodedFrame;

    fn close(&mut self);
}

/// Open-time knobs for `VideoDecoder`
#[derive(Debug, Clone, Default)]
pub struct DecoderOptions {
    /// FFmpeg frame threads (0 = auto)
    pub threads: usize,
    /// Where to persist keyframe indexes; `None` disables persistence
    pub keyframe_dir: Option<PathBuf>,
    pub use_keyframe_index: bool,
}

impl DecoderOptions {
    pub fn from_config(config: &EngineConfig, paths: &PathConfig) -> Self {
        Self {
            threads: config.decoder_threads,
            keyframe_dir: Some(config.keyframe_dir(paths)),
            use_keyframe_index: config.use_keyframe_index,
        }
    }
}

// Per-open FFmpeg state; dropped as a unit on close
struct Session {
    input: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_idx: usize,
    /// Stream time base as (num, den)
    time_base: (i32, i32),
    decoded: ffmpeg::frame::Video,
    /// Persistent conversion target, allocated by the scaler on first use
    converted: ffmpeg::frame::Video,
    /// Demuxer exhausted and EOF sent to the codec
    drained: bool,
}

/// FFmpeg-backed `FrameSource`
pub struct VideoDecoder {
    path: PathBuf,
    session: Option<Session>,
    info: MediaInfo,
    keyframes: Option<KeyframeIndex>,
    frame: DecodedFrame,
    state: DecoderState,
    last_pts: Option<f64>,
}

// SAFETY: the raw FFmpeg contexts are only touched through `&mut self`, and
// the sync engine serializes every call behind its decoder gate.
unsafe impl Send for VideoDecoder {}

impl VideoDecoder {
    /// Open container, pick the best video stream, set up codec and scaler.
    ///
    /// Fails with `MediaOpen` when there is no video stream or the codec
    /// cannot be opened.
    pub fn open(path: &Path, options: &DecoderOptions) -> Result<Self> {
        init_ffmpeg_logging();

        let input = ffmpeg::format::input(path)
            .map_err(|e| EngineError::MediaOpen(format!("Failed to open {}: {}", path.display(), e)))?;

        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| EngineError::MediaOpen("No video stream found".to_string()))?;
        let stream_idx = stream.index();
        let tb = stream.time_base();
        let time_base = (tb.numerator(), tb.denominator());

        let mut decoder_ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| EngineError::MediaOpen(format!("Failed to create decoder context: {}", e)))?;

        // Frame threading; 0 lets FFmpeg pick the core count
        unsafe {
            (*decoder_ctx.as_mut_ptr()).thread_type = ffmpeg::ffi::FF_THREAD_FRAME;
            (*decoder_ctx.as_mut_ptr()).thread_count = options.threads as i32;
        }

        let decoder = decoder_ctx
            .decoder()
            .video()
            .map_err(|e| EngineError::MediaOpen(format!("Failed to create video decoder: {}", e)))?;

        let width = decoder.width();
        let height = decoder.height();
        if width == 0 || height == 0 {
            return Err(EngineError::MediaOpen(format!("Invalid video size {}x{}", width, height)));
        }

        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            width,
            height,
            ffmpeg::format::Pixel::BGRA,
            width,
            height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| EngineError::MediaOpen(format!("Failed to create scaler: {}", e)))?;

        let fps = rational_to_f64(stream.avg_frame_rate().numerator(), stream.avg_frame_rate().denominator())
            .or_else(|| rational_to_f64(stream.rate().numerator(), stream.rate().denominator()))
            .unwrap_or(0.0);
        let duration = media_duration(input.duration(), stream.duration(), time_base);

        let info = MediaInfo {
            width: width as usize,
            height: height as usize,
            duration,
            fps,
        };
        debug!(
            "Opened {}: {}x{} {:.3}fps {:.3}s (stream {})",
            path.display(),
            info.width,
            info.height,
            info.fps,
            info.duration,
            stream_idx
        );

        let mut this = Self {
            path: path.to_path_buf(),
            session: Some(Session {
                input,
                decoder,
                scaler,
                stream_idx,
                time_base,
                decoded: ffmpeg::frame::Video::empty(),
                converted: ffmpeg::frame::Video::empty(),
                drained: false,
            }),
            info,
            keyframes: None,
            frame: DecodedFrame::new(info.width, info.height),
            state: DecoderState::Opened,
            last_pts: None,
        };

        if options.use_keyframe_index {
            if let Err(e) = this.build_keyframe_index(options.keyframe_dir.as_deref()) {
                // Precise seeks fall back to the container's own keyframe search
                warn!("Keyframe index unavailable for {}: {}", path.display(), e);
            }
        }
        Ok(this)
    }

    /// Load or scan the keyframe index for the open file
    pub fn build_keyframe_index(&mut self, cache_dir: Option<&Path>) -> Result<()> {
        let index = keyframes::build_keyframe_index(&self.path, cache_dir)?;
        self.keyframes = Some(index);
        Ok(())
    }

    pub fn keyframes(&self) -> Option<&KeyframeIndex> {
        self.keyframes.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn seek_stream(&mut self, ts: i64) -> Result<()> {
        let session = self.session.as_mut().ok_or(EngineError::NotOpen)?;
        let ret = unsafe {
            ffmpeg::ffi::av_seek_frame(
                session.input.as_mut_ptr(),
                session.stream_idx as i32,
                ts,
                ffmpeg::ffi::AVSEEK_FLAG_BACKWARD,
            )
        };
        if ret < 0 {
            return Err(EngineError::Decode(format!("Seek to ts {} failed (ret={})", ts, ret)));
        }
        session.decoder.flush();
        session.drained = false;
        self.state = DecoderState::Seeking;
        self.last_pts = None;
        Ok(())
    }

    fn time_base(&self) -> Result<(i32, i32)> {
        Ok(self.session.as_ref().ok_or(EngineError::NotOpen)?.time_base)
    }
}

impl FrameSource for VideoDecoder {
    fn info(&self) -> MediaInfo {
        self.info
    }

    fn state(&self) -> DecoderState {
        self.state
    }

    fn seek(&mut self, position: f64) -> Result<()> {
        let ts = seconds_to_ts(position.max(0.0), self.time_base()?);
        trace!("Coarse seek to {:.3}s (ts {})", position, ts);
        self.seek_stream(ts)
    }

    fn seek_and_decode_to(&mut self, target: f64) -> Result<Option<f64>> {
        let target = target.max(0.0);
        let ts = seconds_to_ts(target, self.time_base()?);
        let seek_ts = self
            .keyframes
            .as_ref()
            .and_then(|k| k.seek_target(ts))
            .unwrap_or(ts);
        trace!("Precise seek to {:.3}s via keyframe ts {}", target, seek_ts);
        self.seek_stream(seek_ts)?;

        // Half a frame of slack absorbs time-base rounding
        let slack = 0.5 / self.info.effective_fps();
        let mut discarded = 0usize;
        loop {
            match self.try_decode_next()? {
                Some(pts) if pts + slack >= target => {
                    trace!("Reached {:.3}s after discarding {} frames", pts, discarded);
                    return Ok(Some(pts));
                }
                Some(_) => discarded += 1,
                None => return Ok(None),
            }
        }
    }

    fn try_decode_next(&mut self) -> Result<Option<f64>> {
        let session = self.session.as_mut().ok_or(EngineError::NotOpen)?;
        loop {
            match session.decoder.receive_frame(&mut session.decoded) {
                Ok(()) => {
                    let pts = session
                        .decoded
                        .timestamp()
                        .or(session.decoded.pts())
                        .map(|ts| ts_to_seconds(ts, session.time_base))
                        .unwrap_or_else(|| match self.last_pts {
                            Some(last) => last + self.info.frame_interval(),
                            None => 0.0,
                        });

                    session
                        .scaler
                        .run(&session.decoded, &mut session.converted)
                        .map_err(|e| EngineError::Decode(format!("Failed to convert frame: {}", e)))?;
                    copy_converted(&session.converted, &mut self.frame);
                    self.frame.pts = pts;
                    self.last_pts = Some(pts);
                    self.state = DecoderState::Decoding;
                    return Ok(Some(pts));
                }
                Err(ffmpeg::Error::Eof) => {
                    self.state = DecoderState::Decoding;
                    return Ok(None);
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                    if session.drained {
                        return Ok(None);
                    }
                    let mut fed = false;
                    for (stream, packet) in session.input.packets() {
                        if stream.index() != session.stream_idx {
                            continue;
                        }
                        session
                            .decoder
                            .send_packet(&packet)
                            .map_err(|e| EngineError::Decode(format!("Failed to send packet: {}", e)))?;
                        fed = true;
                        break;
                    }
                    if !fed {
                        // Flush the codec's delayed frames
                        session
                            .decoder
                            .send_eof()
                            .map_err(|e| EngineError::Decode(format!("Failed to send EOF: {}", e)))?;
                        session.drained = true;
                    }
                }
                Err(e) => return Err(EngineError::Decode(format!("Decode failed: {}", e))),
            }
        }
    }

    fn frame(&self) -> &DecodedFrame {
        &self.frame
    }

    fn close(&mut self) {
        if self.session.take().is_some() {
            debug!("Closed {}", self.path.display());
        }
        self.state = DecoderState::Closed;
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        self.close();
    }
}

/// Copy scaler output into the persistent frame, dropping FFmpeg's row padding
fn copy_converted(converted: &ffmpeg::frame::Video, out: &mut DecodedFrame) {
    let data = converted.data(0);
    let src_stride = converted.stride(0);
    let rows = out.height.min(converted.height() as usize);
    let row_bytes = out.width.min(converted.width() as usize) * BYTES_PER_PIXEL;
    for y in 0..rows {
        let src = y * src_stride;
        let dst = y * out.stride;
        out.pixels[dst..dst + row_bytes].copy_from_slice(&data[src..src + row_bytes]);
    }
}

fn rational_to_f64(num: i32, den: i32) -> Option<f64> {
    if num > 0 && den > 0 {
        Some(num as f64 / den as f64)
    } else {
        None
    }
}

/// Container duration (AV_TIME_BASE units) first, then stream duration, else 0
fn media_duration(container: i64, stream: i64, time_base: (i32, i32)) -> f64 {
    if container > 0 {
        return container as f64 / ffmpeg::ffi::AV_TIME_BASE as f64;
    }
    if stream > 0 {
        return ts_to_seconds(stream, time_base);
    }
    0.0
}

/// Stream timestamp -> seconds
pub fn ts_to_seconds(ts: i64, time_base: (i32, i32)) -> f64 {
    let (num, den) = time_base;
    if den == 0 {
        return 0.0;
    }
    ts as f64 * num as f64 / den as f64
}

/// Seconds -> stream timestamp (rounded to nearest tick)
pub fn seconds_to_ts(seconds: f64, time_base: (i32, i32)) -> i64 {
    let (num, den) = time_base;
    if num == 0 {
        return 0;
    }
    (seconds * den as f64 / num as f64).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_conversion() {
        let tb = (1, 90_000);
        assert_eq!(seconds_to_ts(1.0, tb), 90_000);
        assert_eq!(ts_to_seconds(45_000, tb), 0.5);
        let tb = (1001, 30_000);
        let ts = seconds_to_ts(10.0, tb);
        assert!((ts_to_seconds(ts, tb) - 10.0).abs() < 1001.0 / 30_000.0);
        assert_eq!(ts_to_seconds(5, (1, 0)), 0.0);
    }

    #[test]
    fn test_duration_preference() {
        // Container wins over stream
        assert_eq!(media_duration(2_000_000, 900, (1, 90)), 2.0);
        // Stream used when container unknown
        assert_eq!(media_duration(i64::MIN, 900, (1, 90)), 10.0);
        assert_eq!(media_duration(0, 0, (1, 90)), 0.0);
    }

    #[test]
    fn test_rational_fps() {
        assert_eq!(rational_to_f64(30, 1), Some(30.0));
        assert_eq!(rational_to_f64(0, 1), None);
        assert_eq!(rational_to_f64(25, 0), None);
    }

    #[test]
    fn test_open_missing_file_is_media_open_error() {
        let path = std::env::temp_dir().join(format!("cuepoint_missing_{}.mp4", uuid::Uuid::new_v4()));
        let result = VideoDecoder::open(&path, &DecoderOptions::default());
        assert!(matches!(result, Err(EngineError::MediaOpen(_))));
    }
}
