//! Presenter - coalesced, non-blocking hand-off of composited frames.
//!
//! Producer side (`upload`) runs on whatever thread rendered the frame and
//! never blocks on the display. It copies into a single pending slot: a newer
//! frame replaces an older one that has not been shown yet, so fast scrubbing
//! cannot build a backlog. One wake token per pending frame is sent to the
//! presentation context, which calls `run_pending()` (usually from the UI
//! loop, after `wait()` or on its own tick).
//!
//! Before touching any buffer the deferred callback re-checks the generation
//! and surface id captured at upload time. A mismatch means buffers or the
//! surface were reallocated meanwhile and the frame is dropped silently.
//!
//! Back-ends are an enum picked once at construction; the only transition is
//! the one-way GPU -> CPU fallback on `PresentationDegraded`.

pub mod cpu;
pub mod gpu;

pub use cpu::{CpuPresenter, SurfaceImage};
pub use gpu::{CorruptionProbe, GlSharedTexture, GpuPresenter, SharedTexture};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use uuid::Uuid;

use crate::error::EngineError;

/// Frame waiting for the presentation callback
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub pixels: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    /// Playback generation at upload time
    pub generation: u64,
    /// Surface the frame was rendered for
    pub surface: Uuid,
}

/// Active presentation strategy
pub enum Backend {
    Gpu(GpuPresenter),
    Cpu(CpuPresenter),
}

impl Backend {
    pub fn is_gpu(&self) -> bool {
        matches!(self, Backend::Gpu(_))
    }
}

/// Counters for monitoring presentation
#[derive(Debug, Default)]
pub struct PresentStats {
    uploads: AtomicU64,
    coalesced: AtomicU64,
    presented: AtomicU64,
    stale: AtomicU64,
    failed: AtomicU64,
}

impl PresentStats {
    pub fn uploads(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    /// Uploads that replaced a frame never shown
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    pub fn presented(&self) -> u64 {
        self.presented.load(Ordering::Relaxed)
    }

    /// Frames dropped by the generation/surface check
    pub fn stale(&self) -> u64 {
        self.stale.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Display-surface owner shared between the engine and the UI loop
pub struct Presenter {
    backend: Mutex<Backend>,
    pending: Mutex<Option<PendingUpload>>,
    // Buffer recycled from the last presented upload
    spare: Mutex<Vec<u8>>,
    scheduled: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    generation: Arc<AtomicU64>,
    surface: RwLock<Uuid>,
    // CPU surface survives a fallback, so readers keep a valid handle
    cpu_surface: Arc<RwLock<SurfaceImage>>,
    degraded: AtomicBool,
    stats: PresentStats,
}

impl Presenter {
    /// CPU presenter
    pub fn cpu(generation: Arc<AtomicU64>) -> Self {
        let cpu = CpuPresenter::new();
        let cpu_surface = cpu.surface();
        Self::with_backend(Backend::Cpu(cpu), cpu_surface, generation)
    }

    /// GPU presenter writing into `texture`, with CPU fallback
    pub fn gpu(texture: Box<dyn SharedTexture>, probe: CorruptionProbe, generation: Arc<AtomicU64>) -> Self {
        let cpu_surface = Arc::new(RwLock::new(SurfaceImage::default()));
        Self::with_backend(Backend::Gpu(GpuPresenter::new(texture, probe)), cpu_surface, generation)
    }

    fn with_backend(backend: Backend, cpu_surface: Arc<RwLock<SurfaceImage>>, generation: Arc<AtomicU64>) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            backend: Mutex::new(backend),
            pending: Mutex::new(None),
            spare: Mutex::new(Vec::new()),
            scheduled: AtomicBool::new(false),
            wake_tx,
            wake_rx,
            generation,
            surface: RwLock::new(Uuid::new_v4()),
            cpu_surface,
            degraded: AtomicBool::new(false),
            stats: PresentStats::default(),
        }
    }

    /// Current surface identity
    pub fn surface_id(&self) -> Uuid {
        *self.surface.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the display surface (window recreated, device lost, ...).
    /// Frames uploaded for the old surface are dropped.
    pub fn reset_surface(&self) -> Uuid {
        let id = Uuid::new_v4();
        *self.surface.write().unwrap_or_else(|e| e.into_inner()) = id;
        trace!("Presenter surface reset: {}", id);
        id
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Queue a frame for presentation; never blocks on the display.
    ///
    /// Only the newest frame is kept if the previous one has not run yet.
    pub fn upload(&self, pixels: &[u8], width: usize, height: usize, stride: usize, generation: u64) {
        self.stats.uploads.fetch_add(1, Ordering::Relaxed);
        let surface = self.surface_id();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.as_mut() {
                Some(slot) => {
                    // Replace in place, reusing the allocation
                    slot.pixels.clear();
                    slot.pixels.extend_from_slice(pixels);
                    slot.width = width;
                    slot.height = height;
                    slot.stride = stride;
                    slot.generation = generation;
                    slot.surface = surface;
                    self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    let mut buf = std::mem::take(&mut *self.spare.lock().unwrap_or_else(|e| e.into_inner()));
                    buf.clear();
                    buf.extend_from_slice(pixels);
                    *pending = Some(PendingUpload { pixels: buf, width, height, stride, generation, surface });
                }
            }
        }

        if !self.scheduled.swap(true, Ordering::AcqRel) {
            // Capacity 1 and guarded by `scheduled`: cannot be full
            let _ = self.wake_tx.try_send(());
        }
    }

    /// Block until a frame is pending or `timeout` elapses
    pub fn wait(&self, timeout: Duration) -> bool {
        self.wake_rx.recv_timeout(timeout).is_ok()
    }

    /// Presentation callback: show the pending frame if still valid.
    ///
    /// Returns `true` if a frame reached the surface. Errors are logged and
    /// swallowed; a failed frame never blocks later ones.
    pub fn run_pending(&self) -> bool {
        // Drain the wake token if the caller did not wait()
        let _ = self.wake_rx.try_recv();
        self.scheduled.store(false, Ordering::Release);

        let Some(upload) = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return false;
        };

        let current_gen = self.generation();
        let current_surface = self.surface_id();
        if upload.generation != current_gen || upload.surface != current_surface {
            self.stats.stale.fetch_add(1, Ordering::Relaxed);
            trace!(
                "Dropped stale upload (gen {} vs {}, surface match {})",
                upload.generation,
                current_gen,
                upload.surface == current_surface
            );
            self.recycle(upload);
            return false;
        }

        let shown = self.present(&upload);
        self.recycle(upload);
        shown
    }

    fn present(&self, upload: &PendingUpload) -> bool {
        let mut backend = self.backend.lock().unwrap_or_else(|e| e.into_inner());
        let result = match &mut *backend {
            Backend::Gpu(gpu) => match gpu.present(upload) {
                Err(EngineError::PresentationDegraded(reason)) => {
                    warn!("{}; falling back to CPU presentation", EngineError::PresentationDegraded(reason));
                    let mut cpu = CpuPresenter::with_surface(Arc::clone(&self.cpu_surface));
                    let result = cpu.present(upload);
                    *backend = Backend::Cpu(cpu);
                    self.degraded.store(true, Ordering::Release);
                    result
                }
                other => other,
            },
            Backend::Cpu(cpu) => cpu.present(upload),
        };

        match result {
            Ok(()) => {
                self.stats.presented.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!("Presentation failed: {}", e);
                false
            }
        }
    }

    fn recycle(&self, upload: PendingUpload) {
        *self.spare.lock().unwrap_or_else(|e| e.into_inner()) = upload.pixels;
    }

    pub fn is_gpu(&self) -> bool {
        self.backend.lock().unwrap_or_else(|e| e.into_inner()).is_gpu()
    }

    /// GPU path was abandoned for this session
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn stats(&self) -> &PresentStats {
        &self.stats
    }

    /// Copy of the CPU surface (empty while the GPU path is active)
    pub fn snapshot(&self) -> SurfaceImage {
        self.cpu_surface.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::gpu::tests::MockTexture;
    use super::*;

    fn frame(value: u8, w: usize, h: usize) -> Vec<u8> {
        vec![value; w * h * 4]
    }

    #[test]
    fn test_upload_then_run_presents() {
        let generation = Arc::new(AtomicU64::new(1));
        let presenter = Presenter::cpu(Arc::clone(&generation));
        presenter.upload(&frame(9, 2, 2), 2, 2, 8, 1);
        assert!(presenter.wait(Duration::from_millis(100)));
        assert!(presenter.run_pending());
        assert_eq!(presenter.snapshot().pixels, frame(9, 2, 2));
        assert!(!presenter.run_pending());
    }

    #[test]
    fn test_uploads_coalesce_to_latest() {
        let presenter = Presenter::cpu(Arc::new(AtomicU64::new(0)));
        for v in 1..=5u8 {
            presenter.upload(&frame(v, 2, 2), 2, 2, 8, 0);
        }
        assert!(presenter.run_pending());
        assert_eq!(presenter.snapshot().pixels, frame(5, 2, 2));
        assert_eq!(presenter.stats().coalesced(), 4);
        assert_eq!(presenter.stats().presented(), 1);
    }

    #[test]
    fn test_stale_generation_dropped() {
        let generation = Arc::new(AtomicU64::new(3));
        let presenter = Presenter::cpu(Arc::clone(&generation));
        presenter.upload(&frame(7, 2, 2), 2, 2, 8, 3);
        // Buffers reallocated before the callback ran
        generation.fetch_add(1, Ordering::AcqRel);
        assert!(!presenter.run_pending());
        assert_eq!(presenter.snapshot(), SurfaceImage::default());
        assert_eq!(presenter.stats().stale(), 1);
    }

    #[test]
    fn test_surface_change_drops_frame() {
        let presenter = Presenter::cpu(Arc::new(AtomicU64::new(0)));
        presenter.upload(&frame(7, 2, 2), 2, 2, 8, 0);
        presenter.reset_surface();
        assert!(!presenter.run_pending());
        assert_eq!(presenter.stats().stale(), 1);
    }

    #[test]
    fn test_gpu_falls_back_to_cpu_once() {
        let texture = MockTexture::new();
        let fail = Arc::clone(&texture.fail_write);
        let probe = CorruptionProbe::new(Duration::from_secs(60), 3, 2);
        let presenter = Presenter::gpu(Box::new(texture), probe, Arc::new(AtomicU64::new(0)));
        assert!(presenter.is_gpu());

        presenter.upload(&frame(50, 4, 4), 4, 4, 16, 0);
        assert!(presenter.run_pending());
        assert!(presenter.is_gpu());

        fail.store(true, Ordering::Relaxed);
        presenter.upload(&frame(60, 4, 4), 4, 4, 16, 0);
        // Frame still reaches the CPU surface
        assert!(presenter.run_pending());
        assert!(!presenter.is_gpu());
        assert!(presenter.is_degraded());
        assert_eq!(presenter.snapshot().pixels, frame(60, 4, 4));

        // Recovery of the device does not switch back
        fail.store(false, Ordering::Relaxed);
        presenter.upload(&frame(70, 4, 4), 4, 4, 16, 0);
        assert!(presenter.run_pending());
        assert!(!presenter.is_gpu());
    }

    #[test]
    fn test_black_gpu_surface_degrades() {
        let texture = MockTexture::new();
        texture.black.store(true, Ordering::Relaxed);
        let probe = CorruptionProbe::new(Duration::from_secs(60), 3, 2);
        let presenter = Presenter::gpu(Box::new(texture), probe, Arc::new(AtomicU64::new(0)));
        for v in [100u8, 110, 120] {
            presenter.upload(&frame(v, 4, 4), 4, 4, 16, 0);
            presenter.run_pending();
        }
        assert!(presenter.is_degraded());
        assert_eq!(presenter.snapshot().pixels, frame(120, 4, 4));
    }
}
