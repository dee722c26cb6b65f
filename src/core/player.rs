//! Transport on top of the sync engine: play / pause / stop / seek / tick.
//!
//! **Architecture**: Player owns the `SyncEngine` and a `MasterClock`. The
//! clock is the audio track when the media has one, otherwise wall time.
//! Video never drives the clock; the engine only follows it.
//!
//! # Playback Loop
//!
//! `tick()` is called by the host at display rate (e.g. 60Hz). It reads the
//! clock and hands the time to `SyncEngine::render_at`, which never blocks on
//! the decoder. A backward clock jump of more than one frame becomes a real
//! seek. When the engine reports end of media the clock is paused and the
//! player parks in `Ended`; `play()` from there restarts at 0.
//!
//! # States
//!
//! ```text
//! Stopped --play--> Playing --pause--> Paused
//!    ^                 |                  |
//!    +------stop-------+-----stop---------+
//!                      |
//!                 media end --> Ended --play--> Playing (from 0)
//! ```

use log::{debug, info, trace, warn};
use std::path::Path;

use super::audio::{AudioClock, ClockHandle, MasterClock, WallClock};
use super::decoder::DecoderOptions;
use super::events::EventSender;
use super::sync_engine::SyncEngine;
use crate::config::EngineConfig;
use crate::entities::MediaInfo;
use crate::error::Result;
use crate::paths::PathConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
    Ended,
}

/// Playback transport
pub struct Player {
    engine: SyncEngine,
    clock: Box<dyn MasterClock>,
    /// Volume/mute control when the clock is an audio track
    audio: Option<ClockHandle>,
    state: PlaybackState,
    /// Last time handed to the engine
    position: f64,
}

impl Player {
    /// Drive an already loaded engine from `clock`
    pub fn new(engine: SyncEngine, clock: Box<dyn MasterClock>) -> Self {
        Self {
            engine,
            clock,
            audio: None,
            state: PlaybackState::Stopped,
            position: 0.0,
        }
    }

    /// Open `path` for playback: video through the engine, audio (if any) as master clock
    pub fn open(path: &Path, config: &EngineConfig, paths: &PathConfig, events: EventSender) -> Result<Self> {
        let engine = SyncEngine::new(config, events)?;
        let info = engine.load_file(path, &DecoderOptions::from_config(config, paths))?;

        let (clock, audio): (Box<dyn MasterClock>, Option<ClockHandle>) = if AudioClock::has_audio(path) {
            match AudioClock::open(path, config) {
                Ok(audio) => {
                    let handle = audio.handle();
                    (Box::new(audio), Some(handle))
                }
                Err(e) => {
                    warn!("Audio unavailable ({}), using wall clock", e);
                    (Box::new(WallClock::new()), None)
                }
            }
        } else {
            debug!("{} has no audio, using wall clock", path.display());
            (Box::new(WallClock::new()), None)
        };

        info!(
            "Player ready: {} ({}x{}, {:.3}s, {} clock)",
            path.display(),
            info.width,
            info.height,
            info.duration,
            if audio.is_some() { "audio" } else { "wall" }
        );
        let mut player = Self::new(engine, clock);
        player.audio = audio;
        player.engine.render_at(0.0);
        Ok(player)
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn info(&self) -> MediaInfo {
        self.engine.info()
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    /// Last rendered position
    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn clock_position(&self) -> f64 {
        self.clock.position()
    }

    pub fn play(&mut self) -> Result<()> {
        match self.state {
            PlaybackState::Playing => return Ok(()),
            PlaybackState::Ended => {
                trace!("Restarting from 0 after end");
                self.seek(0.0)?;
            }
            _ => {}
        }
        self.clock.play()?;
        self.engine.set_clock_rate(self.clock.rate());
        self.state = PlaybackState::Playing;
        debug!("Playback started at {:.3}s", self.clock.position());
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        if self.state != PlaybackState::Playing {
            return Ok(());
        }
        self.clock.pause()?;
        self.engine.set_clock_rate(0.0);
        self.state = PlaybackState::Paused;
        self.position = self.engine.render_at(self.clock.position());
        debug!("Playback paused at {:.3}s", self.position);
        Ok(())
    }

    pub fn toggle(&mut self) -> Result<()> {
        if self.is_playing() { self.pause() } else { self.play() }
    }

    /// Pause and rewind to 0
    pub fn stop(&mut self) -> Result<()> {
        self.clock.pause()?;
        self.engine.set_clock_rate(0.0);
        self.seek(0.0)?;
        self.state = PlaybackState::Stopped;
        trace!("Playback stopped");
        Ok(())
    }

    /// Jump to `position`; keeps playing if playing. Returns the clamped position.
    pub fn seek(&mut self, position: f64) -> Result<f64> {
        let pos = self.engine.seek_to(position)?;
        self.clock.seek(pos)?;
        self.position = pos;
        if self.state == PlaybackState::Ended {
            self.state = PlaybackState::Paused;
        }
        Ok(pos)
    }

    /// Render at the clock's current time; call once per display refresh
    pub fn tick(&mut self) -> Result<f64> {
        let t = self.clock.position();
        let info = self.engine.info();

        if self.state == PlaybackState::Playing && t + info.frame_interval() < self.position {
            debug!("Clock jumped back {:.3}s -> {:.3}s, seeking", self.position, t);
            self.position = self.engine.seek_to(t)?;
            return Ok(self.position);
        }

        self.position = self.engine.render_at(t);

        let past_end = info.duration > 0.0 && t >= info.duration;
        if self.state == PlaybackState::Playing && (self.engine.is_ended() || past_end) {
            self.clock.pause()?;
            self.engine.set_clock_rate(0.0);
            self.state = PlaybackState::Ended;
            info!("Playback ended at {:.3}s", self.position);
        }
        Ok(self.position)
    }

    /// Audio gain 0..=1 (no-op without an audio clock)
    pub fn set_volume(&self, volume: f32) {
        if let Some(audio) = &self.audio {
            audio.set_volume(volume);
        }
    }

    pub fn volume(&self) -> Option<f32> {
        self.audio.as_ref().map(|a| a.volume())
    }

    pub fn set_muted(&self, muted: bool) {
        if let Some(audio) = &self.audio {
            audio.set_muted(muted);
        }
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::channel;
    use crate::core::pattern::PatternSource;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    /// Clock the test moves by hand
    #[derive(Clone, Default)]
    struct ManualClock {
        state: Arc<Mutex<(f64, bool)>>,
    }

    impl ManualClock {
        fn set(&self, t: f64) {
            self.state.lock().unwrap().0 = t;
        }
    }

    impl MasterClock for ManualClock {
        fn position(&self) -> f64 {
            self.state.lock().unwrap().0
        }
        fn is_playing(&self) -> bool {
            self.state.lock().unwrap().1
        }
        fn play(&mut self) -> Result<()> {
            self.state.lock().unwrap().1 = true;
            Ok(())
        }
        fn pause(&mut self) -> Result<()> {
            self.state.lock().unwrap().1 = false;
            Ok(())
        }
        fn seek(&mut self, position: f64) -> Result<()> {
            self.set(position);
            Ok(())
        }
    }

    fn player(duration: f64) -> (Player, ManualClock) {
        let (tx, _rx) = channel(256);
        let engine = SyncEngine::new(&EngineConfig::default(), tx).unwrap();
        engine.load(Box::new(PatternSource::new(8, 4, 30.0, duration))).unwrap();
        let clock = ManualClock::default();
        (Player::new(engine, Box::new(clock.clone())), clock)
    }

    #[test]
    fn test_play_pause_toggle() {
        let (mut player, clock) = player(10.0);
        assert_eq!(player.state(), PlaybackState::Stopped);
        player.toggle().unwrap();
        assert!(player.is_playing());
        assert!(clock.is_playing());

        clock.set(1.0);
        assert_eq!(player.tick().unwrap(), 1.0);

        player.toggle().unwrap();
        assert_eq!(player.state(), PlaybackState::Paused);
        assert!(!clock.is_playing());
    }

    #[test]
    fn test_seek_moves_clock() {
        let (mut player, clock) = player(10.0);
        let pos = player.seek(4.0).unwrap();
        assert_eq!(pos, 4.0);
        assert_eq!(clock.position(), 4.0);
        assert_eq!(player.position(), 4.0);
    }

    #[test]
    fn test_backward_jump_seeks() {
        let (mut player, clock) = player(10.0);
        player.play().unwrap();
        clock.set(5.0);
        player.tick().unwrap();
        clock.set(1.0);
        assert_eq!(player.tick().unwrap(), 1.0);
        // Synchronous seek decoded the frame at 1.0; decode-ahead may have moved on a little
        let current = player.engine().slot_pts().1.unwrap();
        assert!(current >= 1.0 - 1e-9 && current < 1.5, "current {}", current);
    }

    #[test]
    fn test_end_pauses_clock_and_restarts() {
        let (mut player, clock) = player(1.0);
        player.play().unwrap();
        clock.set(1.5);
        let deadline = Instant::now() + Duration::from_secs(5);
        while player.state() != PlaybackState::Ended && Instant::now() < deadline {
            player.tick().unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(player.state(), PlaybackState::Ended);
        assert!(!clock.is_playing());

        player.play().unwrap();
        assert!(player.is_playing());
        assert_eq!(clock.position(), 0.0);
    }

    #[test]
    fn test_stop_rewinds() {
        let (mut player, clock) = player(10.0);
        player.play().unwrap();
        clock.set(3.0);
        player.tick().unwrap();
        player.stop().unwrap();
        assert_eq!(player.state(), PlaybackState::Stopped);
        assert_eq!(clock.position(), 0.0);
        assert_eq!(player.position(), 0.0);
    }

    #[test]
    fn test_volume_without_audio() {
        let (player, _clock) = player(1.0);
        player.set_volume(0.5);
        assert_eq!(player.volume(), None);
        assert!(!player.has_audio());
    }
}
