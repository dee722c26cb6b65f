//! GPU presentation path: write into a shared texture, probe for corruption.
//!
//! The texture is shared with the windowing layer, which samples it directly
//! (no CPU read-back on the display path). For the first few seconds after
//! init a cheap probe reads back a handful of pixels; some drivers hand back
//! an all-black shared surface, and repeated black probes on non-black input
//! degrade the presenter to the CPU path for the rest of the session.

use glow::HasContext;
use log::{debug, trace};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::PendingUpload;
use crate::config::EngineConfig;
use crate::entities::BYTES_PER_PIXEL;
use crate::error::{EngineError, Result};

/// Texture shared between the engine and the display surface
pub trait SharedTexture: Send {
    /// (Re)allocate storage; called on the first upload and on size change
    fn resize(&mut self, width: usize, height: usize) -> Result<()>;

    /// Upload a BGRA image with row stride `stride` bytes
    fn write(&mut self, pixels: &[u8], width: usize, height: usize, stride: usize) -> Result<()>;

    /// Read back one BGRA pixel from the texture
    fn read_pixel(&mut self, x: usize, y: usize) -> Result<[u8; 4]>;
}

/// Probe schedule and failure accounting
#[derive(Debug, Clone)]
pub struct CorruptionProbe {
    started: Instant,
    window: Duration,
    points: usize,
    threshold: u32,
    failures: u32,
    probes: u32,
}

impl CorruptionProbe {
    pub fn new(window: Duration, points: usize, threshold: u32) -> Self {
        Self {
            started: Instant::now(),
            window,
            points: points.max(1),
            threshold: threshold.max(1),
            failures: 0,
            probes: 0,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.gpu_probe_window(), config.gpu_probe_points, config.gpu_probe_failures)
    }

    pub fn active(&self) -> bool {
        self.started.elapsed() < self.window
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn probes(&self) -> u32 {
        self.probes
    }

    /// Sample positions on the main diagonal, away from the edges
    pub fn sample_points(&self, width: usize, height: usize) -> Vec<(usize, usize)> {
        let n = self.points;
        (0..n)
            .map(|k| ((2 * k + 1) * width / (2 * n), (2 * k + 1) * height / (2 * n)))
            .filter(|&(x, y)| x < width && y < height)
            .collect()
    }

    /// Record one probe; `true` once the failure threshold is reached
    pub fn record(&mut self, black: bool) -> bool {
        self.probes += 1;
        if black {
            self.failures += 1;
        } else {
            self.failures = 0;
        }
        self.failures >= self.threshold
    }
}

/// Presenter writing into a `SharedTexture`
pub struct GpuPresenter {
    texture: Box<dyn SharedTexture>,
    size: (usize, usize),
    probe: CorruptionProbe,
    presented: u64,
}

impl GpuPresenter {
    pub fn new(texture: Box<dyn SharedTexture>, probe: CorruptionProbe) -> Self {
        Self {
            texture,
            size: (0, 0),
            probe,
            presented: 0,
        }
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn probe(&self) -> &CorruptionProbe {
        &self.probe
    }

    /// Upload one frame. `PresentationDegraded` means the caller must fall back.
    pub fn present(&mut self, upload: &PendingUpload) -> Result<()> {
        let (w, h) = (upload.width, upload.height);
        if self.size != (w, h) {
            self.texture
                .resize(w, h)
                .map_err(|e| EngineError::PresentationDegraded(format!("texture resize failed: {}", e)))?;
            self.size = (w, h);
        }
        self.texture
            .write(&upload.pixels, w, h, upload.stride)
            .map_err(|e| EngineError::PresentationDegraded(format!("texture write failed: {}", e)))?;
        self.presented += 1;

        if self.probe.active() {
            self.run_probe(upload)?;
        }
        Ok(())
    }

    fn run_probe(&mut self, upload: &PendingUpload) -> Result<()> {
        let points = self.probe.sample_points(upload.width, upload.height);
        let mut source_black = true;
        let mut readback_black = true;
        for &(x, y) in &points {
            let i = y * upload.stride + x * BYTES_PER_PIXEL;
            if upload.pixels.get(i..i + 3).is_some_and(|p| p.iter().any(|&c| c != 0)) {
                source_black = false;
            }
            let px = self.texture.read_pixel(x, y)?;
            if px.iter().any(|&c| c != 0) {
                readback_black = false;
            }
        }
        // A black source frame proves nothing
        if source_black {
            return Ok(());
        }
        let failed = self.probe.record(readback_black);
        trace!(
            "GPU probe #{}: black={} failures={}",
            self.probe.probes(),
            readback_black,
            self.probe.failures()
        );
        if failed {
            return Err(EngineError::PresentationDegraded(format!(
                "shared texture read back black {} times in a row",
                self.probe.failures()
            )));
        }
        Ok(())
    }
}

/// RAII owner of GL objects; deletes them on drop
struct GlObjects {
    gl: Arc<glow::Context>,
    texture: Option<glow::Texture>,
    fbo: Option<glow::Framebuffer>,
}

impl Drop for GlObjects {
    fn drop(&mut self) {
        unsafe {
            if let Some(fbo) = self.fbo.take() {
                self.gl.delete_framebuffer(fbo);
            }
            if let Some(texture) = self.texture.take() {
                self.gl.delete_texture(texture);
            }
        }
    }
}

/// OpenGL texture the window layer samples directly
pub struct GlSharedTexture {
    objects: GlObjects,
}

// SAFETY: GL calls happen only inside `Presenter::run_pending`, which the
// owner of the GL context invokes on its own thread.
unsafe impl Send for GlSharedTexture {}

impl GlSharedTexture {
    pub fn new(gl: Arc<glow::Context>) -> Self {
        Self {
            objects: GlObjects { gl, texture: None, fbo: None },
        }
    }

    /// Texture handle for the window layer
    pub fn texture(&self) -> Option<glow::Texture> {
        self.objects.texture
    }

    fn gl_error(&self, what: &str) -> Result<()> {
        let err = unsafe { self.objects.gl.get_error() };
        if err != glow::NO_ERROR {
            return Err(EngineError::PresentationDegraded(format!("{} failed: GL error 0x{:x}", what, err)));
        }
        Ok(())
    }
}

impl SharedTexture for GlSharedTexture {
    fn resize(&mut self, width: usize, height: usize) -> Result<()> {
        let gl = Arc::clone(&self.objects.gl);
        unsafe {
            if let Some(old) = self.objects.texture.take() {
                gl.delete_texture(old);
            }
            let texture = gl
                .create_texture()
                .map_err(|e| EngineError::PresentationDegraded(format!("Failed to create texture: {}", e)))?;
            self.objects.texture = Some(texture);

            gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA8 as i32,
                width as i32,
                height as i32,
                0,
                glow::BGRA,
                glow::UNSIGNED_BYTE,
                glow::PixelUnpackData::Slice(None),
            );

            if self.objects.fbo.is_none() {
                let fbo = gl
                    .create_framebuffer()
                    .map_err(|e| EngineError::PresentationDegraded(format!("Failed to create FBO: {}", e)))?;
                self.objects.fbo = Some(fbo);
            }
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, self.objects.fbo);
            gl.framebuffer_texture_2d(
                glow::READ_FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(texture),
                0,
            );
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, None);
            gl.bind_texture(glow::TEXTURE_2D, None);
        }
        debug!("GL shared texture allocated {}x{}", width, height);
        self.gl_error("texture allocation")
    }

    fn write(&mut self, pixels: &[u8], width: usize, height: usize, stride: usize) -> Result<()> {
        let texture = self.objects.texture.ok_or(EngineError::NotOpen)?;
        let gl = &self.objects.gl;
        unsafe {
            gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            gl.pixel_store_i32(glow::UNPACK_ROW_LENGTH, (stride / BYTES_PER_PIXEL) as i32);
            gl.tex_sub_image_2d(
                glow::TEXTURE_2D,
                0,
                0,
                0,
                width as i32,
                height as i32,
                glow::BGRA,
                glow::UNSIGNED_BYTE,
                glow::PixelUnpackData::Slice(Some(pixels)),
            );
            gl.pixel_store_i32(glow::UNPACK_ROW_LENGTH, 0);
            gl.bind_texture(glow::TEXTURE_2D, None);
        }
        self.gl_error("texture upload")
    }

    fn read_pixel(&mut self, x: usize, y: usize) -> Result<[u8; 4]> {
        let gl = &self.objects.gl;
        let mut px = [0u8; 4];
        unsafe {
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, self.objects.fbo);
            gl.read_pixels(
                x as i32,
                y as i32,
                1,
                1,
                glow::BGRA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::Slice(Some(&mut px)),
            );
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, None);
        }
        self.gl_error("probe read-back")?;
        Ok(px)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory texture; `black` simulates a driver that drops writes
    pub(crate) struct MockTexture {
        pub pixels: Vec<u8>,
        pub width: usize,
        pub black: Arc<AtomicBool>,
        pub fail_write: Arc<AtomicBool>,
        pub writes: Arc<AtomicUsize>,
    }

    impl MockTexture {
        pub(crate) fn new() -> Self {
            Self {
                pixels: Vec::new(),
                width: 0,
                black: Arc::new(AtomicBool::new(false)),
                fail_write: Arc::new(AtomicBool::new(false)),
                writes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl SharedTexture for MockTexture {
        fn resize(&mut self, width: usize, height: usize) -> Result<()> {
            self.width = width;
            self.pixels = vec![0u8; width * height * 4];
            Ok(())
        }

        fn write(&mut self, pixels: &[u8], width: usize, height: usize, stride: usize) -> Result<()> {
            if self.fail_write.load(Ordering::Relaxed) {
                return Err(EngineError::PresentationDegraded("mock write failure".into()));
            }
            self.writes.fetch_add(1, Ordering::Relaxed);
            if self.black.load(Ordering::Relaxed) {
                return Ok(());
            }
            for y in 0..height {
                let row = width * 4;
                self.pixels[y * row..(y + 1) * row].copy_from_slice(&pixels[y * stride..y * stride + row]);
            }
            Ok(())
        }

        fn read_pixel(&mut self, x: usize, y: usize) -> Result<[u8; 4]> {
            let i = (y * self.width + x) * 4;
            let mut px = [0u8; 4];
            px.copy_from_slice(&self.pixels[i..i + 4]);
            Ok(px)
        }
    }

    fn upload(value: u8) -> PendingUpload {
        PendingUpload {
            pixels: vec![value; 8 * 8 * 4],
            width: 8,
            height: 8,
            stride: 32,
            generation: 0,
            surface: uuid::Uuid::nil(),
        }
    }

    #[test]
    fn test_sample_points_inside_frame() {
        let probe = CorruptionProbe::new(Duration::from_secs(1), 5, 3);
        let points = probe.sample_points(100, 50);
        assert_eq!(points.len(), 5);
        assert_eq!(points[0], (10, 5));
        assert!(points.iter().all(|&(x, y)| x < 100 && y < 50));
    }

    #[test]
    fn test_healthy_texture_never_degrades() {
        let probe = CorruptionProbe::new(Duration::from_secs(60), 4, 2);
        let mut gpu = GpuPresenter::new(Box::new(MockTexture::new()), probe);
        for _ in 0..10 {
            gpu.present(&upload(200)).unwrap();
        }
        assert_eq!(gpu.probe().failures(), 0);
        assert_eq!(gpu.presented(), 10);
    }

    #[test]
    fn test_black_readback_degrades_after_threshold() {
        let texture = MockTexture::new();
        texture.black.store(true, Ordering::Relaxed);
        let probe = CorruptionProbe::new(Duration::from_secs(60), 4, 3);
        let mut gpu = GpuPresenter::new(Box::new(texture), probe);
        assert!(gpu.present(&upload(200)).is_ok());
        assert!(gpu.present(&upload(200)).is_ok());
        assert!(matches!(gpu.present(&upload(200)), Err(EngineError::PresentationDegraded(_))));
    }

    #[test]
    fn test_black_source_is_not_a_failure() {
        let texture = MockTexture::new();
        texture.black.store(true, Ordering::Relaxed);
        let probe = CorruptionProbe::new(Duration::from_secs(60), 4, 1);
        let mut gpu = GpuPresenter::new(Box::new(texture), probe);
        for _ in 0..5 {
            gpu.present(&upload(0)).unwrap();
        }
        assert_eq!(gpu.probe().probes(), 0);
    }

    #[test]
    fn test_probe_inactive_after_window() {
        let texture = MockTexture::new();
        texture.black.store(true, Ordering::Relaxed);
        let probe = CorruptionProbe::new(Duration::ZERO, 4, 1);
        let mut gpu = GpuPresenter::new(Box::new(texture), probe);
        gpu.present(&upload(200)).unwrap();
        assert_eq!(gpu.probe().probes(), 0);
    }
}
