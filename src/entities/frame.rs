//! Frame buffers shared by decoder, sync engine and presenter.
//!
//! **Why**: Every stage of the pipeline works on the same fixed pixel layout
//! (32-bit packed BGRA, 4 bytes/pixel) so buffers can be swapped and copied
//! without conversion.
//!
//! - `DecodedFrame`: output of a `FrameSource`, one persistent buffer per decoder
//! - `FrameBuffer`: fixed-size arena for the prev/curr slots and the composited
//!   buffer; allocated once per media load and never per frame

/// Bytes per pixel of the only supported layout
pub const BYTES_PER_PIXEL: usize = 4;

/// Pixel layout of every frame in the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Byte order B, G, R, A in memory (little-endian 0xAARRGGBB)
    Bgra8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Bgra8 => BYTES_PER_PIXEL,
        }
    }
}

/// Frame produced by a decoder.
///
/// `pixels` is exclusively owned; rows are `stride` bytes apart (stride >= width*4).
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub format: PixelFormat,
    /// Presentation timestamp in seconds
    pub pts: f64,
    pub pixels: Vec<u8>,
}

impl DecodedFrame {
    /// Allocate a zeroed, tightly packed frame
    pub fn new(width: usize, height: usize) -> Self {
        let stride = width * BYTES_PER_PIXEL;
        Self {
            width,
            height,
            stride,
            format: PixelFormat::Bgra8,
            pts: 0.0,
            pixels: vec![0u8; stride * height],
        }
    }

    /// Row `y` without stride padding
    pub fn row(&self, y: usize) -> &[u8] {
        let start = y * self.stride;
        &self.pixels[start..start + self.width * BYTES_PER_PIXEL]
    }

    /// Fill every pixel with a single BGRA value
    pub fn fill(&mut self, bgra: [u8; 4]) {
        let row_bytes = self.width * BYTES_PER_PIXEL;
        for y in 0..self.height {
            let start = y * self.stride;
            for px in self.pixels[start..start + row_bytes].chunks_exact_mut(4) {
                px.copy_from_slice(&bgra);
            }
        }
    }
}

/// Fixed-size BGRA arena (frame slot or composited buffer).
///
/// Tightly packed: `stride == width * 4`. `pts` is `None` until the slot
/// receives its first frame.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    width: usize,
    height: usize,
    stride: usize,
    pub pts: Option<f64>,
    pixels: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(width: usize, height: usize) -> Self {
        let stride = width * BYTES_PER_PIXEL;
        Self {
            width,
            height,
            stride,
            pts: None,
            pixels: vec![0u8; stride * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Size in bytes (stride * height)
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Copy a decoded frame in, dropping stride padding.
    ///
    /// Rows/columns outside either buffer are skipped, so a frame whose size
    /// differs from the arena never faults.
    pub fn copy_from_decoded(&mut self, frame: &DecodedFrame) {
        let rows = self.height.min(frame.height);
        let row_bytes = self.width.min(frame.width) * BYTES_PER_PIXEL;
        for y in 0..rows {
            let src = y * frame.stride;
            let dst = y * self.stride;
            self.pixels[dst..dst + row_bytes].copy_from_slice(&frame.pixels[src..src + row_bytes]);
        }
        self.pts = Some(frame.pts);
    }

    /// Copy another arena of the same geometry (pts included)
    pub fn copy_from(&mut self, other: &FrameBuffer) {
        if other.pixels.len() == self.pixels.len() {
            self.pixels.copy_from_slice(&other.pixels);
        } else {
            let n = self.pixels.len().min(other.pixels.len());
            self.pixels[..n].copy_from_slice(&other.pixels[..n]);
        }
        self.pts = other.pts;
    }

    /// Copy raw packed bytes (e.g. from the frame cache)
    pub fn copy_from_bytes(&mut self, bytes: &[u8], pts: f64) {
        let n = self.pixels.len().min(bytes.len());
        self.pixels[..n].copy_from_slice(&bytes[..n]);
        self.pts = Some(pts);
    }

    /// Read pixel as packed little-endian BGRA u32
    pub fn pixel(&self, x: usize, y: usize) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = y * self.stride + x * BYTES_PER_PIXEL;
        Some(u32::from_le_bytes([
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ]))
    }
}
