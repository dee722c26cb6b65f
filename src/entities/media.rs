//! Media metadata reported by a frame source.

/// Stream properties fixed for one loaded media
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MediaInfo {
    pub width: usize,
    pub height: usize,
    /// Seconds; 0.0 when neither container nor stream report it
    pub duration: f64,
    /// Frames per second; 0.0 when unavailable
    pub fps: f64,
}

impl MediaInfo {
    /// Fallback rate used for cache keys and clamping when fps is unknown
    pub const FALLBACK_FPS: f64 = 30.0;

    /// fps, or 30 when the stream did not report one
    pub fn effective_fps(&self) -> f64 {
        if self.fps > 0.0 && self.fps.is_finite() {
            self.fps
        } else {
            Self::FALLBACK_FPS
        }
    }

    /// Duration of one frame interval in seconds
    pub fn frame_interval(&self) -> f64 {
        1.0 / self.effective_fps()
    }

    /// Clamp a requested time into the renderable range.
    ///
    /// `[0, duration]`, then pulled back to `duration - 1/fps` because many
    /// decoders cannot produce the very last instant.
    pub fn clamp_time(&self, t: f64) -> f64 {
        let t = if t.is_finite() { t } else { 0.0 };
        if self.duration <= 0.0 {
            return t.max(0.0);
        }
        let t = t.clamp(0.0, self.duration);
        let last = if self.fps > 0.0 {
            self.duration - 1.0 / self.fps
        } else {
            self.duration
        };
        t.min(last).max(0.0)
    }

    /// Frame index used as cache key: `round(seconds * fps)`, fps fallback 30
    pub fn frame_index(&self, seconds: f64) -> i64 {
        (seconds * self.effective_fps()).round() as i64
    }
}
