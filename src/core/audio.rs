//! Master clocks: the audio track's playback position, or wall time.
//!
//! `AudioClock` decodes the first audio stream on a feeder thread, runs it
//! through swresample to interleaved f32 stereo at the sink rate and queues
//! it. A sink (a timer-paced `NullSink`, or a real device) pulls from the
//! queue; the clock position is `base + frames consumed / sink rate`, so it
//! only moves as fast as audio is actually played out.
//!
//! `WallClock` stands in for media without an audio track.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, trace, warn};
use playa_ffmpeg as ffmpeg;
use playa_ffmpeg::software::resampling;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::decoder::{init_ffmpeg_logging, ts_to_seconds};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// Source of "what time is it in the media"
pub trait MasterClock: Send {
    /// Current media time in seconds
    fn position(&self) -> f64;

    fn is_playing(&self) -> bool;

    fn play(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn seek(&mut self, position: f64) -> Result<()>;

    /// Seconds of media per second of wall time right now (0 when paused)
    fn rate(&self) -> f64 {
        if self.is_playing() { 1.0 } else { 0.0 }
    }
}

/// Wall-clock master for media without audio
#[derive(Debug, Default)]
pub struct WallClock {
    base: f64,
    started: Option<Instant>,
}

impl WallClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MasterClock for WallClock {
    fn position(&self) -> f64 {
        self.base + self.started.map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0)
    }

    fn is_playing(&self) -> bool {
        self.started.is_some()
    }

    fn play(&mut self) -> Result<()> {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.base = self.position();
        self.started = None;
        Ok(())
    }

    fn seek(&mut self, position: f64) -> Result<()> {
        self.base = position.max(0.0);
        if self.started.is_some() {
            self.started = Some(Instant::now());
        }
        Ok(())
    }
}

struct ClockInner {
    base_bits: AtomicU64,
    /// Stereo frames played out since `base`
    frames: AtomicU64,
    sample_rate: AtomicU32,
    playing: AtomicBool,
    volume_bits: AtomicU32,
    muted: AtomicBool,
    /// Feeder hit end of stream for the current generation
    drained: AtomicBool,
    /// Bumped on every seek; queued samples from older generations are dropped
    generation: AtomicU64,
}

/// Lock-free view of the audio clock, shared by the feeder, the sink and readers
#[derive(Clone)]
pub struct ClockHandle {
    inner: Arc<ClockInner>,
}

impl std::fmt::Debug for ClockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockHandle")
            .field("position", &self.position())
            .field("playing", &self.is_playing())
            .finish()
    }
}

impl ClockHandle {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(ClockInner {
                base_bits: AtomicU64::new(0f64.to_bits()),
                frames: AtomicU64::new(0),
                sample_rate: AtomicU32::new(sample_rate.max(1)),
                playing: AtomicBool::new(false),
                volume_bits: AtomicU32::new(1f32.to_bits()),
                muted: AtomicBool::new(false),
                drained: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate.load(Ordering::Relaxed)
    }

    pub fn base(&self) -> f64 {
        f64::from_bits(self.inner.base_bits.load(Ordering::Acquire))
    }

    pub fn frames_played(&self) -> u64 {
        self.inner.frames.load(Ordering::Acquire)
    }

    pub fn position(&self) -> f64 {
        self.base() + self.frames_played() as f64 / self.sample_rate() as f64
    }

    pub fn add_frames(&self, frames: u64) {
        self.inner.frames.fetch_add(frames, Ordering::AcqRel);
    }

    pub fn is_playing(&self) -> bool {
        self.inner.playing.load(Ordering::Acquire)
    }

    pub fn set_playing(&self, playing: bool) {
        self.inner.playing.store(playing, Ordering::Release);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.inner.volume_bits.load(Ordering::Relaxed))
    }

    /// Linear gain, clamped to 0..=1
    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 1.0 };
        self.inner.volume_bits.store(volume.to_bits(), Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::Relaxed);
    }

    pub fn effective_volume(&self) -> f32 {
        if self.is_muted() { 0.0 } else { self.volume() }
    }

    pub fn is_drained(&self) -> bool {
        self.inner.drained.load(Ordering::Acquire)
    }

    /// Mark end of stream, unless a seek already moved on
    pub fn mark_drained(&self, generation: u64) {
        if self.generation() == generation {
            self.inner.drained.store(true, Ordering::Release);
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Restart counting at `position`; returns the new generation
    pub fn begin_seek(&self, position: f64) -> u64 {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.base_bits.store(position.max(0.0).to_bits(), Ordering::Release);
        self.inner.frames.store(0, Ordering::Release);
        self.inner.drained.store(false, Ordering::Release);
        generation
    }
}

/// Interleaved stereo f32 samples waiting for the sink
#[derive(Clone, Default)]
pub struct SampleQueue {
    samples: Arc<Mutex<VecDeque<f32>>>,
}

impl SampleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queued stereo frames
    pub fn frames(&self) -> usize {
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).len() / 2
    }

    /// Append unless `generation` is stale
    pub fn push(&self, samples: &[f32], generation: u64, clock: &ClockHandle) -> bool {
        let mut queue = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        if clock.generation() != generation {
            return false;
        }
        queue.extend(samples.iter().copied());
        true
    }

    pub fn clear(&self) {
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// What a sink needs to play out audio and advance the clock
#[derive(Clone)]
pub struct SinkShared {
    pub queue: SampleQueue,
    pub clock: ClockHandle,
}

impl SinkShared {
    /// Fill `out` (interleaved stereo) from the queue, silence on underrun.
    ///
    /// Only consumes while playing. Underrun silence advances the clock once
    /// the feeder has drained, so position keeps moving past the audio end.
    pub fn fill(&self, out: &mut [f32]) {
        if !self.clock.is_playing() {
            out.fill(0.0);
            return;
        }
        let frames = out.len() / 2;
        let gain = self.clock.effective_volume();
        let mut queue = self.queue.samples.lock().unwrap_or_else(|e| e.into_inner());
        let available = (queue.len() / 2).min(frames);
        for (dst, src) in out.iter_mut().zip(queue.drain(..available * 2)) {
            *dst = src * gain;
        }
        drop(queue);
        out[available * 2..].fill(0.0);

        let counted = if self.clock.is_drained() { frames } else { available };
        self.clock.add_frames(counted as u64);
    }
}

/// Audio output: pulls from the shared queue at its own pace
pub trait AudioSink: Send {
    fn name(&self) -> &str;

    /// Output rate in Hz
    fn sample_rate(&self) -> u32;

    /// Begin pulling; called once before playback
    fn start(&mut self, shared: SinkShared) -> Result<()>;

    /// Device-level play/pause; the clock's own flag gates consumption
    fn set_playing(&mut self, _playing: bool) -> Result<()> {
        Ok(())
    }
}

/// Software device: a timer thread consumes samples in real time
pub struct NullSink {
    sample_rate: u32,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl NullSink {
    const TICK: Duration = Duration::from_millis(5);

    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl AudioSink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, shared: SinkShared) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let stop = Arc::clone(&self.stop);
        let rate = self.sample_rate as f64;
        let handle = thread::Builder::new()
            .name("cuepoint-null-sink".to_string())
            .spawn(move || {
                let mut buf = Vec::new();
                let mut owed = 0.0f64;
                let mut last = Instant::now();
                while !stop.load(Ordering::Acquire) {
                    thread::sleep(Self::TICK);
                    let now = Instant::now();
                    let elapsed = now.duration_since(last).as_secs_f64();
                    last = now;
                    if !shared.clock.is_playing() {
                        owed = 0.0;
                        continue;
                    }
                    owed += elapsed * rate;
                    let frames = owed.floor();
                    owed -= frames;
                    buf.resize(frames as usize * 2, 0.0);
                    shared.fill(&mut buf);
                }
            })?;
        self.thread = Some(handle);
        Ok(())
    }
}

impl Drop for NullSink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Interleaved f32 stereo at the sink rate
struct AudioChunk {
    pts: f64,
    samples: Vec<f32>,
}

/// Packed f32 stereo bytes from the resampler -> samples
fn packed_stereo(raw: &[u8], frames: usize) -> Vec<f32> {
    let len = (frames * 2 * 4).min(raw.len() / 4 * 4);
    raw[..len].chunks_exact(4).map(bytemuck::pod_read_unaligned::<f32>).collect()
}

/// Drop the part of `chunk` that plays before `t`. False when nothing is left.
fn trim_before(chunk: &mut AudioChunk, t: f64, rate: u32) -> bool {
    let frames = chunk.samples.len() / 2;
    let end = chunk.pts + frames as f64 / rate as f64;
    if end <= t {
        return false;
    }
    let skip = ((t - chunk.pts) * rate as f64).floor().max(0.0) as usize;
    chunk.samples.drain(..(skip * 2).min(frames * 2));
    chunk.pts = chunk.pts.max(t);
    true
}

/// Decoders may leave the layout unspecified; assume the default for the channel count
fn source_layout(frame: &mut ffmpeg::frame::Audio) -> ffmpeg::ChannelLayout {
    let layout = frame.channel_layout();
    if !layout.is_empty() {
        return layout;
    }
    // swresample checks the frame's own layout against its input, so stamp it
    let layout = ffmpeg::ChannelLayout::default(frame.channels().max(1) as i32);
    frame.set_channel_layout(layout);
    layout
}

/// Facts about the opened audio track
#[derive(Debug, Clone, PartialEq)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: usize,
    pub codec: String,
    pub duration: f64,
}

/// FFmpeg audio demux + decode + swresample; lives on the feeder thread
struct AudioStream {
    input: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Audio,
    stream_idx: usize,
    time_base: (i32, i32),
    decoded: ffmpeg::frame::Audio,
    /// Built lazily from the first decoded frame, rebuilt when its input changes
    resampler: Option<resampling::Context>,
    sink_rate: u32,
    drained: bool,
    /// Where the next chunk starts when a frame carries no pts
    next_pts: f64,
    info: AudioInfo,
}

impl AudioStream {
    fn open(path: &Path, sink_rate: u32) -> Result<Self> {
        init_ffmpeg_logging();

        let input = ffmpeg::format::input(path)
            .map_err(|e| EngineError::Audio(format!("Failed to open {}: {}", path.display(), e)))?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Audio)
            .ok_or_else(|| EngineError::Audio("No audio stream found".to_string()))?;
        let stream_idx = stream.index();
        let tb = stream.time_base();
        let time_base = (tb.numerator(), tb.denominator());

        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|ctx| ctx.decoder().audio())
            .map_err(|e| EngineError::Audio(format!("Failed to create audio decoder: {}", e)))?;

        let duration = if input.duration() > 0 {
            input.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64
        } else {
            ts_to_seconds(stream.duration().max(0), time_base)
        };
        let info = AudioInfo {
            sample_rate: decoder.rate(),
            channels: decoder.channels().max(1) as usize,
            codec: decoder
                .codec()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            duration,
        };
        if info.sample_rate == 0 {
            return Err(EngineError::Audio("Audio stream has no sample rate".to_string()));
        }
        debug!(
            "Audio {}: {}Hz {}ch {} {:.3}s",
            path.display(),
            info.sample_rate,
            info.channels,
            info.codec,
            info.duration
        );

        Ok(Self {
            input,
            decoder,
            stream_idx,
            time_base,
            decoded: ffmpeg::frame::Audio::empty(),
            resampler: None,
            sink_rate: sink_rate.max(1),
            drained: false,
            next_pts: 0.0,
            info,
        })
    }

    fn seek(&mut self, position: f64) -> Result<()> {
        // Container-level seek takes AV_TIME_BASE units
        let ts = (position.max(0.0) * ffmpeg::ffi::AV_TIME_BASE as f64) as i64;
        self.input
            .seek(ts, ..)
            .map_err(|e| EngineError::Audio(format!("Audio seek to {:.3}s failed: {}", position, e)))?;
        self.decoder.flush();
        // Drops whatever the resampler still buffers from before the seek
        self.resampler = None;
        self.drained = false;
        self.next_pts = position;
        Ok(())
    }

    fn next_chunk(&mut self) -> Result<Option<AudioChunk>> {
        loop {
            match self.decoder.receive_frame(&mut self.decoded) {
                Ok(()) => {
                    let frames = self.decoded.samples();
                    let rate = self.decoded.rate().max(1);
                    let pts = self
                        .decoded
                        .timestamp()
                        .or(self.decoded.pts())
                        .map(|ts| ts_to_seconds(ts, self.time_base))
                        .unwrap_or(self.next_pts);
                    self.next_pts = pts + frames as f64 / rate as f64;

                    let samples = self.resample()?;
                    return Ok(Some(AudioChunk { pts, samples }));
                }
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                    if self.drained {
                        return Ok(None);
                    }
                    let mut fed = false;
                    for (stream, packet) in self.input.packets() {
                        if stream.index() != self.stream_idx {
                            continue;
                        }
                        self.decoder
                            .send_packet(&packet)
                            .map_err(|e| EngineError::Audio(format!("Failed to send packet: {}", e)))?;
                        fed = true;
                        break;
                    }
                    if !fed {
                        self.decoder
                            .send_eof()
                            .map_err(|e| EngineError::Audio(format!("Failed to send EOF: {}", e)))?;
                        self.drained = true;
                    }
                }
                Err(e) => return Err(EngineError::Audio(format!("Audio decode failed: {}", e))),
            }
        }
    }

    /// (Re)build the converter when the decoded format, rate or layout changes
    fn ensure_resampler(&mut self) -> Result<()> {
        let src_format = self.decoded.format();
        let src_rate = self.decoded.rate().max(1);
        let src_layout = source_layout(&mut self.decoded);

        let stale = match &self.resampler {
            None => true,
            Some(resampler) => {
                let input = resampler.input();
                input.format != src_format || input.rate != src_rate || input.channel_layout != src_layout
            }
        };
        if stale {
            let resampler = resampling::Context::get(
                src_format,
                src_layout,
                src_rate,
                ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Packed),
                ffmpeg::ChannelLayout::STEREO,
                self.sink_rate,
            )
            .map_err(|e| EngineError::Audio(format!("Failed to create resampler: {}", e)))?;
            debug!(
                "Audio resampler {:?} {}Hz {}ch -> f32 stereo {}Hz",
                src_format,
                src_rate,
                self.decoded.channels(),
                self.sink_rate
            );
            self.resampler = Some(resampler);
        }
        Ok(())
    }

    /// Last decoded frame as interleaved f32 stereo at the sink rate.
    /// May come back short or empty while the resampler buffers.
    fn resample(&mut self) -> Result<Vec<f32>> {
        self.ensure_resampler()?;
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };
        let mut output = ffmpeg::frame::Audio::empty();
        resampler
            .run(&self.decoded, &mut output)
            .map_err(|e| EngineError::Audio(format!("Resampling failed: {}", e)))?;
        let frames = output.samples();
        if frames == 0 {
            return Ok(Vec::new());
        }
        Ok(packed_stereo(output.data(0), frames))
    }
}

enum FeederCommand {
    Seek { position: f64, generation: u64 },
    Shutdown,
}

fn feed(
    mut stream: AudioStream,
    shared: SinkShared,
    commands: Receiver<FeederCommand>,
    sink_rate: u32,
    target_frames: usize,
) {
    let mut generation = shared.clock.generation();
    let mut trim_until: Option<f64> = None;
    let mut exhausted = false;

    loop {
        let full = exhausted || shared.queue.frames() >= target_frames;
        let command = if full {
            match commands.recv_timeout(Duration::from_millis(10)) {
                Ok(c) => Some(c),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match commands.try_recv() {
                Ok(c) => Some(c),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => break,
            }
        };

        match command {
            Some(FeederCommand::Shutdown) => break,
            Some(FeederCommand::Seek { position, generation: g }) => {
                if let Err(e) = stream.seek(position) {
                    warn!("{}", e);
                }
                generation = g;
                trim_until = Some(position);
                exhausted = false;
                continue;
            }
            None => {}
        }
        if full {
            continue;
        }

        match stream.next_chunk() {
            Ok(Some(mut chunk)) => {
                if let Some(t) = trim_until {
                    if !trim_before(&mut chunk, t, sink_rate) {
                        continue;
                    }
                    trim_until = None;
                }
                if chunk.samples.is_empty() {
                    continue;
                }
                if !shared.queue.push(&chunk.samples, generation, &shared.clock) {
                    trace!("Dropped {} stale audio frames", chunk.samples.len() / 2);
                }
            }
            Ok(None) => {
                debug!("Audio feeder reached end of stream");
                shared.clock.mark_drained(generation);
                exhausted = true;
            }
            Err(e) => {
                warn!("{}", e);
                shared.clock.mark_drained(generation);
                exhausted = true;
            }
        }
    }
    debug!("Audio feeder stopped");
}

/// Audio-track master clock
pub struct AudioClock {
    path: PathBuf,
    info: AudioInfo,
    handle: ClockHandle,
    queue: SampleQueue,
    sink: Box<dyn AudioSink>,
    commands: Sender<FeederCommand>,
    feeder: Option<thread::JoinHandle<()>>,
}

impl AudioClock {
    /// Open with the software sink at the configured rate
    pub fn open(path: &Path, config: &EngineConfig) -> Result<Self> {
        Self::open_with_sink(path, Box::new(NullSink::new(config.audio_sample_rate)), config.audio_buffer_ms)
    }

    /// Open the first audio stream of `path` and start feeding `sink`
    pub fn open_with_sink(path: &Path, mut sink: Box<dyn AudioSink>, buffer_ms: u64) -> Result<Self> {
        let sink_rate = sink.sample_rate().max(1);
        let handle = ClockHandle::new(sink_rate);
        let queue = SampleQueue::new();
        let shared = SinkShared {
            queue: queue.clone(),
            clock: handle.clone(),
        };
        let target_frames = (buffer_ms.max(20) as usize * sink_rate as usize) / 1000;

        let (ready_tx, ready_rx) = bounded::<Result<AudioInfo>>(1);
        let (commands, command_rx) = bounded(16);
        let feeder_path = path.to_path_buf();
        let feeder_shared = shared.clone();
        // FFmpeg contexts are created and used on the feeder thread only
        let feeder = thread::Builder::new()
            .name("cuepoint-audio-feeder".to_string())
            .spawn(move || match AudioStream::open(&feeder_path, sink_rate) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(stream.info.clone()));
                    feed(stream, feeder_shared, command_rx, sink_rate, target_frames);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        let info = match ready_rx.recv() {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                let _ = feeder.join();
                return Err(e);
            }
            Err(_) => return Err(EngineError::Audio("Audio feeder exited during open".to_string())),
        };

        sink.start(shared)?;
        debug!("AudioClock on {} sink at {}Hz", sink.name(), sink_rate);

        Ok(Self {
            path: path.to_path_buf(),
            info,
            handle,
            queue,
            sink,
            commands,
            feeder: Some(feeder),
        })
    }

    /// True when `path` opens and has an audio stream
    pub fn has_audio(path: &Path) -> bool {
        init_ffmpeg_logging();
        ffmpeg::format::input(path)
            .map(|input| input.streams().best(ffmpeg::media::Type::Audio).is_some())
            .unwrap_or(false)
    }

    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn handle(&self) -> ClockHandle {
        self.handle.clone()
    }

    pub fn volume(&self) -> f32 {
        self.handle.volume()
    }

    pub fn set_volume(&self, volume: f32) {
        self.handle.set_volume(volume);
    }

    pub fn is_muted(&self) -> bool {
        self.handle.is_muted()
    }

    pub fn set_muted(&self, muted: bool) {
        self.handle.set_muted(muted);
    }

    /// Queued audio not yet played, in seconds
    pub fn buffered(&self) -> f64 {
        self.queue.frames() as f64 / self.handle.sample_rate() as f64
    }
}

impl MasterClock for AudioClock {
    fn position(&self) -> f64 {
        self.handle.position()
    }

    fn is_playing(&self) -> bool {
        self.handle.is_playing()
    }

    fn play(&mut self) -> Result<()> {
        self.handle.set_playing(true);
        self.sink.set_playing(true)
    }

    fn pause(&mut self) -> Result<()> {
        self.handle.set_playing(false);
        self.sink.set_playing(false)
    }

    fn seek(&mut self, position: f64) -> Result<()> {
        let generation = self.handle.begin_seek(position);
        self.queue.clear();
        self.commands
            .send(FeederCommand::Seek {
                position: position.max(0.0),
                generation,
            })
            .map_err(|_| EngineError::Audio("Audio feeder is gone".to_string()))
    }
}

impl Drop for AudioClock {
    fn drop(&mut self) {
        self.handle.set_playing(false);
        let _ = self.commands.send(FeederCommand::Shutdown);
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_clock() {
        let mut clock = WallClock::new();
        assert_eq!(clock.position(), 0.0);
        assert_eq!(clock.rate(), 0.0);
        clock.seek(2.0).unwrap();
        assert_eq!(clock.position(), 2.0);
        clock.play().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(clock.position() > 2.0);
        assert_eq!(clock.rate(), 1.0);
        clock.pause().unwrap();
        let held = clock.position();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.position(), held);
    }

    #[test]
    fn test_clock_handle_position() {
        let handle = ClockHandle::new(1000);
        handle.begin_seek(3.0);
        handle.add_frames(500);
        assert!((handle.position() - 3.5).abs() < 1e-9);
        let generation = handle.begin_seek(1.0);
        assert_eq!(handle.position(), 1.0);
        assert_eq!(handle.generation(), generation);
    }

    #[test]
    fn test_stale_generation_not_queued() {
        let handle = ClockHandle::new(1000);
        let queue = SampleQueue::new();
        let old = handle.generation();
        handle.begin_seek(1.0);
        assert!(!queue.push(&[0.5, 0.5], old, &handle));
        assert!(queue.push(&[0.5, 0.5], handle.generation(), &handle));
        assert_eq!(queue.frames(), 1);

        handle.mark_drained(old);
        assert!(!handle.is_drained());
        handle.mark_drained(handle.generation());
        assert!(handle.is_drained());
    }

    #[test]
    fn test_fill_applies_volume_and_counts() {
        let shared = SinkShared {
            queue: SampleQueue::new(),
            clock: ClockHandle::new(100),
        };
        shared.queue.push(&[1.0, -1.0, 0.5, 0.5], 0, &shared.clock);

        let mut out = [9.0f32; 6];
        shared.fill(&mut out);
        // Paused: silence, nothing consumed
        assert_eq!(out, [0.0; 6]);
        assert_eq!(shared.queue.frames(), 2);

        shared.clock.set_playing(true);
        shared.clock.set_volume(0.5);
        shared.fill(&mut out);
        assert_eq!(out, [0.5, -0.5, 0.25, 0.25, 0.0, 0.0]);
        // Underrun before drain does not advance the clock
        assert_eq!(shared.clock.frames_played(), 2);

        shared.clock.mark_drained(0);
        shared.fill(&mut out);
        assert_eq!(shared.clock.frames_played(), 5);
    }

    #[test]
    fn test_muted_fill_is_silent() {
        let shared = SinkShared {
            queue: SampleQueue::new(),
            clock: ClockHandle::new(100),
        };
        shared.queue.push(&[1.0, 1.0], 0, &shared.clock);
        shared.clock.set_playing(true);
        shared.clock.set_muted(true);
        let mut out = [1.0f32; 2];
        shared.fill(&mut out);
        assert_eq!(out, [0.0, 0.0]);
        assert_eq!(shared.clock.frames_played(), 1);
    }

    #[test]
    fn test_null_sink_advances_clock() {
        let shared = SinkShared {
            queue: SampleQueue::new(),
            clock: ClockHandle::new(48_000),
        };
        shared.clock.mark_drained(0);
        let mut sink = NullSink::new(48_000);
        sink.start(shared.clone()).unwrap();

        thread::sleep(Duration::from_millis(30));
        assert_eq!(shared.clock.position(), 0.0);

        shared.clock.set_playing(true);
        thread::sleep(Duration::from_millis(150));
        let pos = shared.clock.position();
        assert!(pos > 0.05 && pos < 1.0, "position {}", pos);
    }

    #[test]
    fn test_packed_stereo_reads_f32_pairs() {
        let raw: Vec<u8> = [0.5f32, -0.5, 0.25, 1.0].iter().flat_map(|s| s.to_ne_bytes()).collect();
        assert_eq!(packed_stereo(&raw, 2), vec![0.5, -0.5, 0.25, 1.0]);
        // Plane padding past `frames` is ignored
        assert_eq!(packed_stereo(&raw, 1), vec![0.5, -0.5]);
        // Short buffer never reads out of bounds
        assert_eq!(packed_stereo(&raw[..6], 2), vec![0.5]);
    }

    #[test]
    fn test_trim_before_seek_target() {
        let mut chunk = AudioChunk {
            pts: 1.0,
            samples: (0..20).map(|i| i as f32).collect(),
        };
        // 10 frames at 10Hz cover 1.0..2.0; keep from 1.5
        assert!(trim_before(&mut chunk, 1.5, 10));
        assert_eq!(chunk.samples.len(), 10);
        assert_eq!(chunk.samples[0], 10.0);
        assert_eq!(chunk.pts, 1.5);

        let mut early = AudioChunk { pts: 0.0, samples: vec![0.0; 20] };
        assert!(!trim_before(&mut early, 1.0, 10));
    }

    #[test]
    fn test_trim_before_chunk_start_keeps_all() {
        let mut chunk = AudioChunk { pts: 3.0, samples: vec![1.0; 8] };
        assert!(trim_before(&mut chunk, 2.0, 48_000));
        assert_eq!(chunk.samples.len(), 8);
        assert_eq!(chunk.pts, 3.0);
    }

    #[test]
    fn test_open_missing_file_is_audio_error() {
        let config = EngineConfig::default();
        let path = std::env::temp_dir().join(format!("cuepoint-missing-{}.mkv", uuid::Uuid::new_v4()));
        assert!(matches!(AudioClock::open(&path, &config), Err(EngineError::Audio(_))));
        assert!(!AudioClock::has_audio(&path));
    }
}
