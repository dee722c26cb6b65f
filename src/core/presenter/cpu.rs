//! CPU presentation path: staging copy, then blit to the front surface.

use log::trace;
use std::sync::{Arc, RwLock};

use super::PendingUpload;
use crate::entities::BYTES_PER_PIXEL;
use crate::error::Result;

/// Presented BGRA image, tightly packed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurfaceImage {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl SurfaceImage {
    pub fn stride(&self) -> usize {
        self.width * BYTES_PER_PIXEL
    }

    /// BGRA bytes at (x, y)
    pub fn pixel(&self, x: usize, y: usize) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = y * self.stride() + x * BYTES_PER_PIXEL;
        let mut px = [0u8; 4];
        px.copy_from_slice(&self.pixels[i..i + 4]);
        Some(px)
    }

    /// Swizzle to RGBA (for encoders that only take RGBA)
    pub fn to_rgba(&self) -> Vec<u8> {
        let mut out = self.pixels.clone();
        for px in out.chunks_exact_mut(4) {
            px.swap(0, 2);
        }
        out
    }
}

/// Software presenter
#[derive(Debug)]
pub struct CpuPresenter {
    staging: Vec<u8>,
    staging_size: (usize, usize),
    front: Arc<RwLock<SurfaceImage>>,
    presented: u64,
}

impl CpuPresenter {
    pub fn new() -> Self {
        Self::with_surface(Arc::new(RwLock::new(SurfaceImage::default())))
    }

    /// Present into an existing front surface (used by the GPU fallback)
    pub fn with_surface(front: Arc<RwLock<SurfaceImage>>) -> Self {
        Self {
            staging: Vec::new(),
            staging_size: (0, 0),
            front,
            presented: 0,
        }
    }

    /// Shared handle to the front surface (read by the window layer)
    pub fn surface(&self) -> Arc<RwLock<SurfaceImage>> {
        Arc::clone(&self.front)
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn present(&mut self, upload: &PendingUpload) -> Result<()> {
        let (w, h) = (upload.width, upload.height);
        let row_bytes = w * BYTES_PER_PIXEL;

        // Staging is only reallocated on resolution change
        if self.staging_size != (w, h) {
            self.staging = vec![0u8; row_bytes * h];
            self.staging_size = (w, h);
        }
        for y in 0..h {
            let src = y * upload.stride;
            let Some(row) = upload.pixels.get(src..src + row_bytes) else {
                break;
            };
            self.staging[y * row_bytes..(y + 1) * row_bytes].copy_from_slice(row);
        }

        let mut front = self.front.write().unwrap_or_else(|e| e.into_inner());
        if front.width != w || front.height != h {
            front.width = w;
            front.height = h;
            front.pixels.resize(row_bytes * h, 0);
        }
        front.pixels.copy_from_slice(&self.staging);
        drop(front);

        self.presented += 1;
        trace!("CPU present #{} ({}x{}, gen {})", self.presented, w, h, upload.generation);
        Ok(())
    }

    pub fn snapshot(&self) -> SurfaceImage {
        self.front.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for CpuPresenter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_present_strips_stride_padding() {
        let mut cpu = CpuPresenter::new();
        // 1x2 image, rows padded to 8 bytes
        let upload = PendingUpload {
            pixels: vec![1, 2, 3, 4, 0, 0, 0, 0, 5, 6, 7, 8, 0, 0, 0, 0],
            width: 1,
            height: 2,
            stride: 8,
            generation: 0,
            surface: uuid::Uuid::nil(),
        };
        cpu.present(&upload).unwrap();
        let snap = cpu.snapshot();
        assert_eq!(snap.pixels, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(snap.pixel(0, 1), Some([5, 6, 7, 8]));
        assert_eq!(cpu.presented(), 1);
    }

    #[test]
    fn test_to_rgba_swizzles() {
        let img = SurfaceImage { width: 1, height: 1, pixels: vec![10, 20, 30, 255] };
        assert_eq!(img.to_rgba(), vec![30, 20, 10, 255]);
    }
}
