//! Decode-ahead worker - keeps the frame slots bracketing the master clock.
//!
//! One named thread per engine. The render path posts the latest master time
//! with `request()` (never blocks); the worker then advances the decoder one
//! frame per step, taking the decoder gate only for that frame, until the
//! current slot is at or past the horizon:
//!
//! ```text
//! horizon = min(master + elapsed * rate, master + lookahead)
//! ```
//!
//! With `rate == 0` (paused, scrubbing) the horizon is the requested time
//! itself. Once the current slot is at least `backoff` ahead of the horizon
//! the worker sleeps instead of polling.
//!
//! `pause()`/`resume()` bracket seeks; `cancel()` drops the outstanding
//! request. All three are cooperative: a frame already being decoded finishes
//! before the worker notices.

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Result of one decoder step
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// A frame was decoded; more may be needed
    Decoded,
    /// Current slot is `ahead` seconds at or past the horizon
    Bracketed { ahead: f64 },
    /// End of stream reached
    Ended,
    /// Decoder failed; nothing more until a seek or reload
    Failed,
    /// No media loaded
    Unavailable,
}

/// Something the worker can advance one frame at a time
pub trait DecodeAheadTarget: Send + Sync + 'static {
    fn step(&self, horizon: f64) -> StepOutcome;
}

#[derive(Debug, Clone, Copy)]
struct Request {
    master: f64,
    lookahead: f64,
    at: Instant,
    seq: u64,
}

impl Request {
    fn horizon(&self, rate: f64) -> f64 {
        let predicted = self.master + self.at.elapsed().as_secs_f64() * rate;
        predicted.min(self.master + self.lookahead).max(self.master)
    }
}

struct WorkerState {
    request: Mutex<Option<Request>>,
    rate_bits: AtomicU64,
    seq: AtomicU64,
    /// Last request seq the worker finished with
    handled: AtomicU64,
    paused: AtomicBool,
    /// Worker is between "took request" and "finished step"
    stepping: AtomicBool,
    shutdown: AtomicBool,
    wake: Sender<()>,
}

impl WorkerState {
    fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    fn poke(&self) {
        // Capacity 1: a pending token already wakes the worker
        let _ = self.wake.try_send(());
    }
}

/// Background decode-ahead thread
pub struct DecodeAhead {
    state: Arc<WorkerState>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DecodeAhead {
    /// Spawn the worker for `target`
    pub fn spawn(target: Arc<dyn DecodeAheadTarget>, backoff: Duration) -> std::io::Result<Self> {
        let (wake, wake_rx) = bounded(1);
        let state = Arc::new(WorkerState {
            request: Mutex::new(None),
            rate_bits: AtomicU64::new(0f64.to_bits()),
            seq: AtomicU64::new(0),
            handled: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            stepping: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            wake,
        });

        let worker_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name("cuepoint-decode-ahead".to_string())
            .spawn(move || run(worker_state, target, wake_rx, backoff))?;

        Ok(Self { state, handle: Some(handle) })
    }

    /// Post the latest master time; never blocks on the decoder
    pub fn request(&self, master: f64, lookahead: f64) {
        let seq = self.state.seq.fetch_add(1, Ordering::AcqRel) + 1;
        *self.state.request.lock().unwrap_or_else(|e| e.into_inner()) = Some(Request {
            master,
            lookahead: lookahead.max(0.0),
            at: Instant::now(),
            seq,
        });
        self.state.poke();
    }

    /// Master clock speed used to extrapolate between requests (0 = paused)
    pub fn set_rate(&self, rate: f64) {
        let rate = if rate.is_finite() { rate.max(0.0) } else { 0.0 };
        self.state.rate_bits.store(rate.to_bits(), Ordering::Relaxed);
        self.state.poke();
    }

    pub fn pause(&self) {
        self.state.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.state.paused.store(false, Ordering::Release);
        self.state.poke();
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused.load(Ordering::Acquire)
    }

    /// Forget the outstanding request
    pub fn cancel(&self) {
        let mut request = self.state.request.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(req) = request.take() {
            trace!("Decode-ahead request for {:.3}s cancelled", req.master);
        }
        self.state.handled.store(self.state.seq.load(Ordering::Acquire), Ordering::Release);
    }

    /// Worker has nothing left to do for the latest request
    pub fn is_idle(&self) -> bool {
        !self.state.stepping.load(Ordering::Acquire)
            && self.state.handled.load(Ordering::Acquire) == self.state.seq.load(Ordering::Acquire)
    }

    /// Block until idle or `timeout`; only meaningful with rate 0
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_idle() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

fn run(state: Arc<WorkerState>, target: Arc<dyn DecodeAheadTarget>, wake: Receiver<()>, backoff: Duration) {
    debug!("Decode-ahead worker started");
    let idle_poll = Duration::from_millis(50);

    loop {
        if state.shutdown.load(Ordering::Acquire) {
            break;
        }
        if state.paused.load(Ordering::Acquire) {
            let _ = wake.recv_timeout(idle_poll);
            continue;
        }

        let request = *state.request.lock().unwrap_or_else(|e| e.into_inner());
        let Some(request) = request else {
            let _ = wake.recv_timeout(idle_poll);
            continue;
        };

        let rate = state.rate();
        state.stepping.store(true, Ordering::Release);
        let outcome = target.step(request.horizon(rate));
        state.stepping.store(false, Ordering::Release);

        match outcome {
            StepOutcome::Decoded => continue,
            StepOutcome::Bracketed { ahead } => {
                if rate > 0.0 {
                    // Horizon keeps moving: nap proportionally to the lead
                    let nap = if ahead >= backoff.as_secs_f64() {
                        backoff / 2
                    } else {
                        Duration::from_secs_f64(ahead.clamp(0.001, backoff.as_secs_f64() / 2.0))
                    };
                    let _ = wake.recv_timeout(nap);
                } else {
                    state.handled.store(request.seq, Ordering::Release);
                    let _ = wake.recv_timeout(idle_poll);
                }
            }
            StepOutcome::Ended | StepOutcome::Failed | StepOutcome::Unavailable => {
                state.handled.store(request.seq, Ordering::Release);
                let _ = wake.recv_timeout(idle_poll);
            }
        }
    }
    debug!("Decode-ahead worker stopped");
}

impl Drop for DecodeAhead {
    fn drop(&mut self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        self.state.poke();

        // A step finishes its current frame; don't hang teardown on a stuck codec
        let deadline = Instant::now() + Duration::from_millis(500);
        if let Some(handle) = self.handle.take() {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Decode-ahead shutdown timeout, detaching");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
    }
}
