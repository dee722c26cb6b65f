//! Sync engine - keeps video frames in step with the master clock.
//!
//! Owns the decoder, the two frame slots, the composited buffer, the scrub
//! cache and the presenter, and ties them together:
//!
//! ```text
//! render_at(T):  clamp T -> post decode-ahead(T + lookahead) -> pick slot
//!                -> copy to composited -> blend subtitle masks
//!                -> presenter.upload(generation) -> PositionChanged(T)
//! seek_to(X):    pause worker -> gate -> cache hit? copy : precise seek
//!                -> render_at(X) -> resume worker
//! ```
//!
//! # Locks
//!
//! - decoder gate: every call into the `FrameSource` (open, seek, decode, close)
//! - slots: previous/current/composited, held only for copies and blends
//!
//! Always gate before slots. `render_at` takes only the slots lock, so it
//! never waits on a decode in progress beyond one frame copy.
//!
//! # Slot selection
//!
//! After a decode step `previous <= horizon <= current`. Rendering at T uses
//! `previous` when `current.pts > T` (decode ran ahead of the clock) and
//! `current` otherwise.
//!
//! # Generation
//!
//! Bumped whenever the slot buffers are reallocated (load, resolution change,
//! unload). Every upload carries it; the presenter drops uploads whose
//! generation no longer matches.

use log::{debug, error, info, trace, warn};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use super::blend::blend_masks;
use super::decode_ahead::{DecodeAhead, DecodeAheadTarget, StepOutcome};
use super::decoder::{DecoderOptions, FrameSource, VideoDecoder};
use super::events::{EngineEvent, EventSender};
use super::frame_cache::{CacheStats, FrameCache};
use super::presenter::{CorruptionProbe, Presenter, SharedTexture};
use super::subtitles::{NoSubtitles, SubtitleSource};
use crate::config::{EngineConfig, PresenterBackend};
use crate::entities::{DecodedFrame, FrameBuffer, MediaInfo};
use crate::error::{EngineError, Result};

/// Outcome of `ensure_decoded_up_to`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// Current slot is at or past the target
    Ready,
    /// Stream ended before reaching the target
    Ended,
}

/// Previous/current frame pair plus the composited output
struct FrameSlots {
    previous: FrameBuffer,
    current: FrameBuffer,
    composited: FrameBuffer,
    /// pts of the slot last copied into `composited`
    shown: Option<f64>,
}

impl FrameSlots {
    fn new(width: usize, height: usize) -> Self {
        Self {
            previous: FrameBuffer::new(width, height),
            current: FrameBuffer::new(width, height),
            composited: FrameBuffer::new(width, height),
            shown: None,
        }
    }

    fn size(&self) -> (usize, usize) {
        (self.current.width(), self.current.height())
    }

    /// Swap the slots (no copy), then write the new frame into `current`
    fn advance(&mut self, frame: &DecodedFrame) {
        std::mem::swap(&mut self.previous, &mut self.current);
        self.current.copy_from_decoded(frame);
    }

    /// Same frame in both slots (seek, first frame)
    fn fill_both(&mut self, frame: &DecodedFrame) {
        self.current.copy_from_decoded(frame);
        self.previous.copy_from(&self.current);
    }

    fn fill_both_bytes(&mut self, bytes: &[u8], pts: f64) {
        self.current.copy_from_bytes(bytes, pts);
        self.previous.copy_from(&self.current);
    }

    /// End of stream: keep showing the last frame, both stamped with duration
    fn mark_ended(&mut self, duration: f64) {
        self.previous.copy_from(&self.current);
        self.previous.pts = Some(duration);
        self.current.pts = Some(duration);
    }

    /// Show `previous` at `t`? Only when decode ran past `t` and it holds a frame.
    fn prefers_previous(&self, t: f64) -> bool {
        matches!((self.current.pts, self.previous.pts), (Some(cur), Some(_)) if cur > t)
    }

    /// pts of the slot a render at `t` would show
    fn pts_at(&self, t: f64) -> Option<f64> {
        if self.prefers_previous(t) { self.previous.pts } else { self.current.pts }
    }
}

/// State shared between the render path and the decode-ahead worker
struct EngineShared {
    gate: Mutex<Option<Box<dyn FrameSource>>>,
    slots: Mutex<FrameSlots>,
    cache: FrameCache,
    info: RwLock<MediaInfo>,
    generation: Arc<AtomicU64>,
    ended: AtomicBool,
    failed: AtomicBool,
    last_error: Mutex<Option<String>>,
    /// Decoder position no longer follows `current` (cache-hit seek)
    reposition: AtomicBool,
    events: EventSender,
}

impl EngineShared {
    fn info(&self) -> MediaInfo {
        *self.info.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_gate(&self) -> std::sync::MutexGuard<'_, Option<Box<dyn FrameSource>>> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, FrameSlots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_failure(&self, e: &EngineError) {
        error!("Decode failed, stopping decode for this session: {}", e);
        self.failed.store(true, Ordering::Release);
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(e.to_string());
    }

    /// Decode the frame after `current` once the decoder was left elsewhere
    fn reposition(&self, src: &mut dyn FrameSource, current: Option<f64>) -> Result<Option<f64>> {
        let info = self.info();
        let target = current.map_or(0.0, |pts| pts + info.frame_interval());
        match src.seek_and_decode_to(target) {
            Ok(pts) => Ok(pts),
            Err(e) => {
                warn!("Precise reposition to {:.3}s failed ({}), using coarse seek", target, e);
                src.seek(target)?;
                src.try_decode_next()
            }
        }
    }

    /// Fire MediaEnded once per load/seek; call with no locks held
    fn notify_ended(&self, first: bool) {
        if first {
            info!("Media ended");
            self.events.send(EngineEvent::MediaEnded);
        }
    }

    /// One decode step toward `target`
    fn step_to(&self, target: f64) -> Result<StepOutcome> {
        if self.failed.load(Ordering::Acquire) {
            return Ok(StepOutcome::Failed);
        }
        if self.ended.load(Ordering::Acquire) {
            return Ok(StepOutcome::Ended);
        }

        let mut gate = self.lock_gate();
        let Some(src) = gate.as_mut() else {
            return Ok(StepOutcome::Unavailable);
        };

        let current = self.lock_slots().current.pts;
        if let Some(cur) = current {
            if cur >= target {
                return Ok(StepOutcome::Bracketed { ahead: cur - target });
            }
        }

        let result = if self.reposition.swap(false, Ordering::AcqRel) {
            self.reposition(src.as_mut(), current)
        } else {
            src.try_decode_next()
        };

        match result {
            Ok(Some(pts)) => {
                let frame = src.frame();
                let mut slots = self.lock_slots();
                if slots.size() != (frame.width, frame.height) {
                    self.reallocate(&mut slots, frame.width, frame.height);
                }
                slots.advance(frame);
                trace!("Decoded {:.3}s (target {:.3}s)", pts, target);
                Ok(StepOutcome::Decoded)
            }
            Ok(None) => {
                let duration = self.info().duration;
                self.lock_slots().mark_ended(duration);
                let first = !self.ended.swap(true, Ordering::AcqRel);
                drop(gate);
                self.notify_ended(first);
                Ok(StepOutcome::Ended)
            }
            Err(e) => {
                drop(gate);
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Resolution changed mid-stream: new buffers, new generation, cold cache
    fn reallocate(&self, slots: &mut FrameSlots, width: usize, height: usize) {
        info!("Resolution change {:?} -> {}x{}", slots.size(), width, height);
        *slots = FrameSlots::new(width, height);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.cache.clear();
        let mut info = self.info.write().unwrap_or_else(|e| e.into_inner());
        info.width = width;
        info.height = height;
    }
}

impl DecodeAheadTarget for EngineShared {
    fn step(&self, horizon: f64) -> StepOutcome {
        self.step_to(horizon).unwrap_or(StepOutcome::Failed)
    }
}

/// Playback synchronization and compositing engine
pub struct SyncEngine {
    shared: Arc<EngineShared>,
    worker: DecodeAhead,
    presenter: Arc<Presenter>,
    subtitles: Mutex<Box<dyn SubtitleSource>>,
    lookahead: f64,
}

impl SyncEngine {
    /// Engine with a CPU presenter
    pub fn new(config: &EngineConfig, events: EventSender) -> Result<Self> {
        if config.backend == PresenterBackend::Gpu {
            warn!("GPU presentation needs a shared texture; using CPU path");
        }
        Self::build(config, events, |generation| Presenter::cpu(generation))
    }

    /// Engine presenting into a GPU shared texture (CPU fallback built in)
    pub fn with_texture(config: &EngineConfig, events: EventSender, texture: Box<dyn SharedTexture>) -> Result<Self> {
        let probe = CorruptionProbe::from_config(config);
        Self::build(config, events, move |generation| Presenter::gpu(texture, probe, generation))
    }

    fn build(
        config: &EngineConfig,
        events: EventSender,
        presenter: impl FnOnce(Arc<AtomicU64>) -> Presenter,
    ) -> Result<Self> {
        config.validate()?;
        let generation = Arc::new(AtomicU64::new(0));
        let presenter = Arc::new(presenter(Arc::clone(&generation)));
        let shared = Arc::new(EngineShared {
            gate: Mutex::new(None),
            slots: Mutex::new(FrameSlots::new(0, 0)),
            cache: FrameCache::new(config.cache_capacity),
            info: RwLock::new(MediaInfo::default()),
            generation,
            ended: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            last_error: Mutex::new(None),
            reposition: AtomicBool::new(false),
            events,
        });
        let target: Arc<dyn DecodeAheadTarget> = shared.clone();
        let worker = DecodeAhead::spawn(target, config.backoff())?;
        debug!(
            "SyncEngine created: cache={} lookahead={}ms backoff={}ms",
            config.cache_capacity, config.lookahead_ms, config.backoff_ms
        );
        Ok(Self {
            shared,
            worker,
            presenter,
            subtitles: Mutex::new(Box::new(NoSubtitles)),
            lookahead: config.lookahead().as_secs_f64(),
        })
    }

    /// Open a media file with FFmpeg and load it
    pub fn load_file(&self, path: &Path, options: &DecoderOptions) -> Result<MediaInfo> {
        let decoder = VideoDecoder::open(path, options)?;
        self.load(Box::new(decoder))
    }

    /// Replace the current media. Buffers are reallocated once here and the
    /// first frame is decoded into both slots.
    pub fn load(&self, source: Box<dyn FrameSource>) -> Result<MediaInfo> {
        self.worker.pause();
        self.worker.cancel();

        let result = self.load_locked(source);

        self.worker.resume();
        result
    }

    fn load_locked(&self, mut source: Box<dyn FrameSource>) -> Result<MediaInfo> {
        let mut gate = self.shared.lock_gate();
        if let Some(mut old) = gate.take() {
            old.close();
        }

        let info = source.info();
        let first = source.try_decode_next()?;
        let Some(first_pts) = first else {
            return Err(EngineError::MediaOpen("Media has no decodable frames".to_string()));
        };

        {
            let mut slots = self.shared.lock_slots();
            *slots = FrameSlots::new(info.width, info.height);
            self.shared.generation.fetch_add(1, Ordering::AcqRel);
            slots.fill_both(source.frame());
        }
        *self.shared.info.write().unwrap_or_else(|e| e.into_inner()) = info;
        self.shared.cache.clear();
        self.shared.ended.store(false, Ordering::Release);
        self.shared.failed.store(false, Ordering::Release);
        self.shared.reposition.store(false, Ordering::Release);
        *self.shared.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *gate = Some(source);

        info!(
            "Loaded media {}x{} {:.3}fps {:.3}s, first frame at {:.3}s",
            info.width, info.height, info.fps, info.duration, first_pts
        );
        Ok(info)
    }

    /// Close the decoder and release the buffers
    pub fn unload(&self) {
        self.worker.pause();
        self.worker.cancel();
        {
            let mut gate = self.shared.lock_gate();
            if let Some(mut src) = gate.take() {
                src.close();
            }
            let mut slots = self.shared.lock_slots();
            *slots = FrameSlots::new(0, 0);
            self.shared.generation.fetch_add(1, Ordering::AcqRel);
        }
        *self.shared.info.write().unwrap_or_else(|e| e.into_inner()) = MediaInfo::default();
        self.shared.cache.clear();
        self.worker.resume();
        debug!("Media unloaded");
    }

    pub fn set_subtitles(&self, source: Box<dyn SubtitleSource>) {
        *self.subtitles.lock().unwrap_or_else(|e| e.into_inner()) = source;
    }

    pub fn clear_subtitles(&self) {
        self.set_subtitles(Box::new(NoSubtitles));
    }

    /// Decode forward until `current.pts >= target` or end of stream.
    ///
    /// Synchronous; the render path never calls this.
    pub fn ensure_decoded_up_to(&self, target: f64) -> Result<DecodeStatus> {
        loop {
            match self.shared.step_to(target)? {
                StepOutcome::Decoded => continue,
                StepOutcome::Bracketed { .. } => return Ok(DecodeStatus::Ready),
                StepOutcome::Ended => return Ok(DecodeStatus::Ended),
                StepOutcome::Failed => {
                    let msg = self.last_error().unwrap_or_else(|| "decoder failed".to_string());
                    return Err(EngineError::Decode(msg));
                }
                StepOutcome::Unavailable => return Err(EngineError::NotOpen),
            }
        }
    }

    /// Composite and present the frame for master time `t`. Never blocks on
    /// the decoder. Returns the clamped time.
    pub fn render_at(&self, t: f64) -> f64 {
        let info = self.shared.info();
        let t = info.clamp_time(t);
        self.worker.request(t, self.lookahead);

        if info.width == 0 || info.height == 0 {
            trace!("render_at({:.3}) with no media", t);
            return t;
        }

        let masks = self
            .subtitles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .masks_at(t, info.width, info.height);

        {
            let mut slots = self.shared.lock_slots();
            let generation = self.shared.generation.load(Ordering::Acquire);
            let use_previous = slots.prefers_previous(t);
            let FrameSlots { previous, current, composited, shown } = &mut *slots;
            let src = if use_previous { &*previous } else { &*current };
            composited.copy_from(src);
            *shown = composited.pts;
            blend_masks(composited, &masks);
            self.presenter.upload(
                composited.pixels(),
                composited.width(),
                composited.height(),
                composited.stride(),
                generation,
            );
        }

        self.shared.events.send(EngineEvent::PositionChanged(t));
        t
    }

    /// Jump to `position`. May block briefly on a decode; returns the clamped
    /// position that was rendered.
    pub fn seek_to(&self, position: f64) -> Result<f64> {
        self.worker.pause();
        self.worker.cancel();
        let result = self.seek_locked(position);
        self.worker.resume();
        let pos = result?;
        self.render_at(pos);
        Ok(pos)
    }

    fn seek_locked(&self, position: f64) -> Result<f64> {
        let info = self.shared.info();
        let pos = info.clamp_time(position);
        let key = info.frame_index(pos);

        let mut gate = self.shared.lock_gate();
        let src = gate.as_mut().ok_or(EngineError::NotOpen)?;
        self.shared.ended.store(false, Ordering::Release);
        self.shared.failed.store(false, Ordering::Release);

        if let Some(entry) = self.shared.cache.get(key) {
            let mut slots = self.shared.lock_slots();
            if slots.pts_at(pos).is_some_and(|pts| (pts - entry.pts).abs() < 1e-9) {
                // Slots already bracket pos on the cached frame; decoder stays where it is
                trace!("Seek {:.3}s: cache hit, slots already on frame {}", pos, key);
                return Ok(pos);
            }
            slots.fill_both_bytes(&entry.pixels, entry.pts);
            self.shared.reposition.store(true, Ordering::Release);
            trace!("Seek {:.3}s: cache hit (frame {})", pos, key);
            return Ok(pos);
        }

        let decoded = match src.seek_and_decode_to(pos) {
            Ok(pts) => pts,
            Err(e) => {
                warn!("Precise seek to {:.3}s failed ({}), using coarse seek", pos, e);
                src.seek(pos)?;
                src.try_decode_next()?
            }
        };
        self.shared.reposition.store(false, Ordering::Release);

        match decoded {
            Some(pts) => {
                let mut slots = self.shared.lock_slots();
                let frame = src.frame();
                if slots.size() != (frame.width, frame.height) {
                    self.shared.reallocate(&mut slots, frame.width, frame.height);
                }
                slots.fill_both(frame);
                self.shared.cache.put(key, pts, slots.current.pixels().to_vec());
                trace!("Seek {:.3}s: decoded {:.3}s, cached as frame {}", pos, pts, key);
            }
            None => {
                self.shared.lock_slots().mark_ended(info.duration);
                let first = !self.shared.ended.swap(true, Ordering::AcqRel);
                drop(gate);
                self.shared.notify_ended(first);
            }
        }
        Ok(pos)
    }

    /// Master clock speed for decode-ahead extrapolation (0 when paused)
    pub fn set_clock_rate(&self, rate: f64) {
        self.worker.set_rate(rate);
    }

    /// Stop decode-ahead work for the outstanding request
    pub fn cancel_decode_ahead(&self) {
        self.worker.cancel();
    }

    /// Wait for the decode-ahead worker to settle (paused clock only)
    pub fn wait_decode_idle(&self, timeout: Duration) -> bool {
        self.worker.wait_idle(timeout)
    }

    pub fn info(&self) -> MediaInfo {
        self.shared.info()
    }

    pub fn presenter(&self) -> &Arc<Presenter> {
        &self.presenter
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    pub fn is_ended(&self) -> bool {
        self.shared.ended.load(Ordering::Acquire)
    }

    pub fn is_loaded(&self) -> bool {
        self.shared.lock_gate().is_some()
    }

    /// Message of the decode failure that stopped this session, if any
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn cache_stats(&self) -> &CacheStats {
        self.shared.cache.stats()
    }

    pub fn cache_len(&self) -> usize {
        self.shared.cache.len()
    }

    /// (previous, current) slot pts
    pub fn slot_pts(&self) -> (Option<f64>, Option<f64>) {
        let slots = self.shared.lock_slots();
        (slots.previous.pts, slots.current.pts)
    }

    /// pts of the frame in the last composited buffer
    pub fn shown_pts(&self) -> Option<f64> {
        self.shared.lock_slots().shown
    }

    /// Copy of the composited buffer (after subtitle blend)
    pub fn composited(&self) -> FrameBuffer {
        self.shared.lock_slots().composited.clone()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.unload();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{channel, EventReceiver};
    use crate::core::pattern::PatternSource;
    use crate::entities::SubtitleMask;
    use std::sync::atomic::AtomicUsize;

    fn engine(capacity: usize) -> (SyncEngine, EventReceiver) {
        let (tx, rx) = channel(1024);
        let config = EngineConfig { cache_capacity: capacity, ..Default::default() };
        (SyncEngine::new(&config, tx).unwrap(), rx)
    }

    fn load_pattern(engine: &SyncEngine) -> Arc<AtomicUsize> {
        let src = PatternSource::new(8, 4, 30.0, 10.0);
        let calls = src.call_counter();
        engine.load(Box::new(src)).unwrap();
        calls
    }

    fn color_of(buf: &FrameBuffer) -> [u8; 4] {
        let mut px = [0u8; 4];
        px.copy_from_slice(&buf.pixels()[0..4]);
        px
    }

    #[test]
    fn test_load_fills_both_slots() {
        let (engine, _rx) = engine(8);
        load_pattern(&engine);
        assert_eq!(engine.slot_pts(), (Some(0.0), Some(0.0)));
        assert_eq!(engine.info().fps, 30.0);
        assert_eq!(engine.generation(), 1);
    }

    #[test]
    fn test_ensure_decoded_brackets_target() {
        let (engine, _rx) = engine(8);
        load_pattern(&engine);
        engine.worker.pause();
        assert_eq!(engine.ensure_decoded_up_to(2.0).unwrap(), DecodeStatus::Ready);
        let (prev, cur) = engine.slot_pts();
        assert!(prev.unwrap() < 2.0);
        assert!((cur.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_render_selects_greatest_pts_not_after_t() {
        let (engine, _rx) = engine(8);
        load_pattern(&engine);
        engine.worker.pause();
        // Decode to the first frame >= 2.01 (frame 61 at 2.0333)
        engine.ensure_decoded_up_to(2.01).unwrap();
        engine.render_at(2.01);
        let shown = engine.shown_pts().unwrap();
        assert!((shown - 2.0).abs() < 1e-9);
        assert_eq!(color_of(&engine.composited()), PatternSource::color_for(60));
    }

    #[test]
    fn test_render_never_decodes_synchronously() {
        let (engine, rx) = engine(8);
        let calls = load_pattern(&engine);
        engine.worker.pause();
        let before = calls.load(Ordering::Relaxed);
        engine.render_at(5.0);
        assert_eq!(calls.load(Ordering::Relaxed), before);
        assert_eq!(rx.poll(), vec![EngineEvent::PositionChanged(5.0)]);
    }

    #[test]
    fn test_decode_ahead_catches_up_after_render() {
        let (engine, _rx) = engine(8);
        load_pattern(&engine);
        engine.render_at(3.0);
        assert!(engine.wait_decode_idle(Duration::from_secs(5)));
        engine.render_at(3.0);
        assert!((engine.shown_pts().unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_seek_twice_second_is_free() {
        let (engine, _rx) = engine(8);
        let calls = load_pattern(&engine);
        engine.seek_to(4.0).unwrap();
        assert!(engine.wait_decode_idle(Duration::from_secs(5)));
        let first = engine.composited();
        let before = calls.load(Ordering::Relaxed);

        engine.seek_to(4.0).unwrap();
        assert!(engine.wait_decode_idle(Duration::from_secs(5)));
        assert_eq!(calls.load(Ordering::Relaxed), before);
        assert_eq!(engine.composited().pixels(), first.pixels());
        assert_eq!(engine.cache_stats().hits(), 1);
    }

    #[test]
    fn test_seek_between_frames_twice_is_free() {
        let (engine, _rx) = engine(8);
        let calls = load_pattern(&engine);
        // 4.01 sits between frame 120 (4.0) and 121 (4.033)
        engine.seek_to(4.01).unwrap();
        assert!(engine.wait_decode_idle(Duration::from_secs(5)));
        let first = engine.composited();
        let slots = engine.slot_pts();
        let before = calls.load(Ordering::Relaxed);

        engine.seek_to(4.01).unwrap();
        assert!(engine.wait_decode_idle(Duration::from_secs(5)));
        assert_eq!(calls.load(Ordering::Relaxed), before);
        assert_eq!(engine.slot_pts(), slots);
        assert_eq!(engine.composited().pixels(), first.pixels());
        assert_eq!(color_of(&first), PatternSource::color_for(120));
    }

    #[test]
    fn test_seek_drops_pending_decode_ahead() {
        let (engine, _rx) = engine(8);
        let src = PatternSource::new(8, 4, 30.0, 10.0).with_decode_delay(Duration::from_millis(2));
        engine.load(Box::new(src)).unwrap();
        // Worker heads for 9s, a few hundred frames away
        engine.render_at(9.0);
        engine.seek_to(1.0).unwrap();
        assert!(engine.wait_decode_idle(Duration::from_secs(5)));
        // A step already waiting on the gate may add one frame, never more
        let (prev, cur) = engine.slot_pts();
        assert!((prev.unwrap() - 1.0).abs() < 1e-9);
        assert!(cur.unwrap() <= 31.0 / 30.0 + 1e-9);
        assert_eq!(color_of(&engine.composited()), PatternSource::color_for(30));
    }

    #[test]
    fn test_resolution_change_mid_stream() {
        let (engine, _rx) = engine(8);
        // Frames from 2.0s on are 6x3
        let src = PatternSource::new(4, 2, 30.0, 10.0).with_resize_at(60, 6, 3);
        engine.load(Box::new(src)).unwrap();
        assert_eq!(engine.generation(), 1);
        engine.seek_to(1.0).unwrap();
        engine.worker.pause();
        assert_eq!(engine.cache_len(), 1);

        // Upload from seek_to still pending with the old generation
        assert_eq!(engine.ensure_decoded_up_to(2.5).unwrap(), DecodeStatus::Ready);
        assert_eq!(engine.generation(), 2);
        assert!(!engine.presenter().run_pending());
        assert_eq!(engine.presenter().stats().stale(), 1);
        let info = engine.info();
        assert_eq!((info.width, info.height), (6, 3));
        assert_eq!(engine.cache_len(), 0);

        engine.render_at(2.5);
        let out = engine.composited();
        assert_eq!((out.width(), out.height()), (6, 3));
        assert_eq!(color_of(&out), PatternSource::color_for(75));
        assert!(engine.presenter().run_pending());
    }

    #[test]
    fn test_seek_past_end_clamps() {
        let (engine, _rx) = engine(8);
        load_pattern(&engine);
        let pos = engine.seek_to(10.0).unwrap();
        assert!((pos - (10.0 - 1.0 / 30.0)).abs() < 1e-9);
        assert_eq!(color_of(&engine.composited()), PatternSource::color_for(299));
    }

    #[test]
    fn test_end_of_stream_fires_once() {
        let (engine, rx) = engine(8);
        load_pattern(&engine);
        engine.worker.pause();
        engine.seek_to(9.9).unwrap();
        engine.worker.pause();
        assert_eq!(engine.ensure_decoded_up_to(20.0).unwrap(), DecodeStatus::Ended);
        assert_eq!(engine.ensure_decoded_up_to(20.0).unwrap(), DecodeStatus::Ended);
        assert!(engine.is_ended());
        assert_eq!(engine.slot_pts(), (Some(10.0), Some(10.0)));
        let ended = rx.poll().into_iter().filter(|e| *e == EngineEvent::MediaEnded).count();
        assert_eq!(ended, 1);
        // Last frame stays visible
        engine.render_at(9.95);
        assert_eq!(color_of(&engine.composited()), PatternSource::color_for(299));
    }

    #[test]
    fn test_cache_hit_seek_repositions_decoder() {
        let (engine, _rx) = engine(8);
        load_pattern(&engine);
        engine.seek_to(1.0).unwrap();
        engine.seek_to(6.0).unwrap();
        engine.seek_to(1.0).unwrap();
        engine.worker.pause();
        // Decoder was left at 6s; next decode must continue from 1s
        engine.ensure_decoded_up_to(1.05).unwrap();
        let (prev, cur) = engine.slot_pts();
        assert!((prev.unwrap() - 1.0).abs() < 1e-9);
        assert!((cur.unwrap() - (31.0 / 30.0)).abs() < 1e-9);
    }

    #[test]
    fn test_decode_error_is_surfaced() {
        let (engine, _rx) = engine(8);
        engine.load(Box::new(PatternSource::new(4, 4, 30.0, 10.0).with_decode_error_at(3))).unwrap();
        engine.worker.pause();
        assert!(matches!(engine.ensure_decoded_up_to(1.0), Err(EngineError::Decode(_))));
        assert!(engine.last_error().is_some());
    }

    #[test]
    fn test_reload_bumps_generation_and_drops_stale_upload() {
        let (engine, _rx) = engine(8);
        load_pattern(&engine);
        engine.render_at(0.0);
        load_pattern(&engine);
        assert_eq!(engine.generation(), 2);
        // Upload from the first load is now stale
        assert!(!engine.presenter().run_pending());
        assert_eq!(engine.presenter().stats().stale(), 1);
        engine.render_at(0.0);
        assert!(engine.presenter().run_pending());
    }

    struct Box2x2;

    impl SubtitleSource for Box2x2 {
        fn masks_at(&mut self, _t: f64, _w: usize, _h: usize) -> Vec<SubtitleMask> {
            let mut mask = SubtitleMask::new(0, 0, 2, 2, SubtitleMask::pack_color(255, 255, 255, 0));
            mask.coverage.fill(255);
            vec![mask]
        }
    }

    #[test]
    fn test_subtitles_blended_into_composited_only() {
        let (engine, _rx) = engine(8);
        load_pattern(&engine);
        engine.set_subtitles(Box::new(Box2x2));
        engine.render_at(0.0);
        let out = engine.composited();
        assert_eq!(out.pixel(0, 0), Some(u32::from_le_bytes([255, 255, 255, 255])));
        assert_eq!(out.pixel(5, 0), Some(u32::from_le_bytes(PatternSource::color_for(0))));
        // Raw slots untouched: a second render without subtitles shows the frame
        engine.clear_subtitles();
        engine.render_at(0.0);
        assert_eq!(engine.composited().pixel(0, 0), Some(u32::from_le_bytes(PatternSource::color_for(0))));
    }
}
