//! Synthetic frame source: one solid colour per frame index.
//!
//! Deterministic stand-in for `VideoDecoder` used by tests and the demo binary
//! when no media file is at hand. Every trait call bumps a shared counter so
//! callers can assert how much decoder work an operation caused.

use log::trace;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::decoder::{DecoderState, FrameSource};
use crate::entities::{DecodedFrame, MediaInfo};
use crate::error::{EngineError, Result};

/// Test-pattern `FrameSource`
pub struct PatternSource {
    info: MediaInfo,
    frame: DecodedFrame,
    /// Index of the frame the next decode produces
    next_index: i64,
    total_frames: i64,
    /// Keyframe every `gop` frames
    gop: i64,
    state: DecoderState,
    calls: Arc<AtomicUsize>,
    decoded: Arc<AtomicUsize>,
    decode_delay: Option<Duration>,
    fail_at: Option<i64>,
    /// From this frame index on, frames come out at the new size
    resize_at: Option<(i64, usize, usize)>,
}

impl PatternSource {
    pub fn new(width: usize, height: usize, fps: f64, duration: f64) -> Self {
        let total_frames = if fps > 0.0 {
            (duration * fps + 1e-6).floor() as i64
        } else {
            0
        };
        Self {
            info: MediaInfo { width, height, duration, fps },
            frame: DecodedFrame::new(width, height),
            next_index: 0,
            total_frames,
            gop: 30,
            state: DecoderState::Opened,
            calls: Arc::new(AtomicUsize::new(0)),
            decoded: Arc::new(AtomicUsize::new(0)),
            decode_delay: None,
            fail_at: None,
            resize_at: None,
        }
    }

    pub fn with_gop(mut self, gop: i64) -> Self {
        self.gop = gop.max(1);
        self
    }

    /// Sleep this long per decoded frame (simulates an expensive codec)
    pub fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = Some(delay);
        self
    }

    /// Fail with `Decode` when asked to produce frame `index`
    pub fn with_decode_error_at(mut self, index: i64) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Switch to `width`x`height` frames from frame `index` on (mid-stream resolution change)
    pub fn with_resize_at(mut self, index: i64, width: usize, height: usize) -> Self {
        self.resize_at = Some((index, width, height));
        self
    }

    /// Trait calls made so far (shared, survives moving the source into an engine)
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    /// Frames produced so far, including ones discarded during precise seeks
    pub fn decode_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.decoded)
    }

    pub fn total_frames(&self) -> i64 {
        self.total_frames
    }

    /// BGRA colour of frame `index`
    pub fn color_for(index: i64) -> [u8; 4] {
        let i = index as u64;
        [
            ((i * 7 + 16) % 256) as u8,
            ((i * 13 + 32) % 256) as u8,
            ((i * 29 + 64) % 256) as u8,
            255,
        ]
    }

    /// pts of frame `index`
    pub fn pts_for(&self, index: i64) -> f64 {
        index as f64 / self.info.fps
    }

    fn count_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == DecoderState::Closed {
            Err(EngineError::NotOpen)
        } else {
            Ok(())
        }
    }

    fn keyframe_at_or_before(&self, position: f64) -> i64 {
        let index = (position.max(0.0) * self.info.fps + 1e-6).floor() as i64;
        let index = index.min(self.total_frames.saturating_sub(1)).max(0);
        index - index % self.gop
    }

    fn decode_one(&mut self) -> Result<Option<f64>> {
        if self.next_index >= self.total_frames {
            return Ok(None);
        }
        if self.fail_at == Some(self.next_index) {
            return Err(EngineError::Decode(format!("Injected failure at frame {}", self.next_index)));
        }
        if let Some(delay) = self.decode_delay {
            std::thread::sleep(delay);
        }
        let index = self.next_index;
        let (width, height) = match self.resize_at {
            Some((from, w, h)) if index >= from => (w, h),
            _ => (self.info.width, self.info.height),
        };
        if (self.frame.width, self.frame.height) != (width, height) {
            self.frame = DecodedFrame::new(width, height);
        }
        self.frame.fill(Self::color_for(index));
        self.frame.pts = self.pts_for(index);
        self.next_index += 1;
        self.state = DecoderState::Decoding;
        self.decoded.fetch_add(1, Ordering::Relaxed);
        Ok(Some(self.frame.pts))
    }
}

impl FrameSource for PatternSource {
    fn info(&self) -> MediaInfo {
        self.info
    }

    fn state(&self) -> DecoderState {
        self.state
    }

    fn seek(&mut self, position: f64) -> Result<()> {
        self.count_call();
        self.ensure_open()?;
        self.next_index = self.keyframe_at_or_before(position);
        self.state = DecoderState::Seeking;
        trace!("Pattern seek {:.3}s -> frame {}", position, self.next_index);
        Ok(())
    }

    fn seek_and_decode_to(&mut self, target: f64) -> Result<Option<f64>> {
        self.count_call();
        self.ensure_open()?;
        self.next_index = self.keyframe_at_or_before(target);
        self.state = DecoderState::Seeking;
        let slack = 0.5 / self.info.effective_fps();
        loop {
            match self.decode_one()? {
                Some(pts) if pts + slack >= target => return Ok(Some(pts)),
                Some(_) => {}
                None => return Ok(None),
            }
        }
    }

    fn try_decode_next(&mut self) -> Result<Option<f64>> {
        self.count_call();
        self.ensure_open()?;
        self.decode_one()
    }

    fn frame(&self) -> &DecodedFrame {
        &self.frame
    }

    fn close(&mut self) {
        self.state = DecoderState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_in_order_until_end() {
        let mut src = PatternSource::new(2, 2, 10.0, 0.5);
        assert_eq!(src.total_frames(), 5);
        let mut seen = Vec::new();
        while let Some(pts) = src.try_decode_next().unwrap() {
            seen.push(pts);
        }
        assert_eq!(seen, vec![0.0, 0.1, 0.2, 0.3, 0.4]);
        assert_eq!(src.try_decode_next().unwrap(), None);
    }

    #[test]
    fn test_frame_colour_matches_index() {
        let mut src = PatternSource::new(2, 2, 30.0, 1.0);
        src.try_decode_next().unwrap();
        src.try_decode_next().unwrap();
        assert_eq!(&src.frame().pixels[0..4], &PatternSource::color_for(1));
    }

    #[test]
    fn test_seek_lands_on_keyframe() {
        let mut src = PatternSource::new(2, 2, 30.0, 10.0).with_gop(30);
        src.seek(2.5).unwrap();
        // Frame 75 -> keyframe 60
        assert_eq!(src.try_decode_next().unwrap(), Some(2.0));
    }

    #[test]
    fn test_seek_and_decode_to_is_exact() {
        let mut src = PatternSource::new(2, 2, 30.0, 10.0);
        let pts = src.seek_and_decode_to(5.5).unwrap().unwrap();
        assert!((pts - 5.5).abs() < 1e-9);
        assert_eq!(&src.frame().pixels[0..4], &PatternSource::color_for(165));
        // One trait call; keyframe 150 through 165 decoded
        assert_eq!(src.call_counter().load(Ordering::Relaxed), 1);
        assert_eq!(src.decode_counter().load(Ordering::Relaxed), 16);
    }

    #[test]
    fn test_resize_applies_from_index_and_after_seek_back() {
        let mut src = PatternSource::new(4, 2, 30.0, 1.0).with_resize_at(2, 6, 3);
        src.try_decode_next().unwrap();
        src.try_decode_next().unwrap();
        assert_eq!((src.frame().width, src.frame().height), (4, 2));
        src.try_decode_next().unwrap();
        assert_eq!((src.frame().width, src.frame().height), (6, 3));
        assert_eq!(src.frame().pixels.len(), 6 * 3 * 4);
        src.seek(0.0).unwrap();
        src.try_decode_next().unwrap();
        assert_eq!((src.frame().width, src.frame().height), (4, 2));
    }

    #[test]
    fn test_injected_failure_and_close() {
        let mut src = PatternSource::new(2, 2, 30.0, 1.0).with_decode_error_at(1);
        assert!(src.try_decode_next().unwrap().is_some());
        assert!(matches!(src.try_decode_next(), Err(EngineError::Decode(_))));
        src.close();
        assert!(matches!(src.try_decode_next(), Err(EngineError::NotOpen)));
    }
}
