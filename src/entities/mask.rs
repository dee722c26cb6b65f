//! Subtitle coverage masks produced per render call.

/// One positioned alpha-mask bitmap with a single fill color.
///
/// `coverage` holds `width * height` bytes (0 = empty, 255 = fully covered).
/// `color` is packed `0xRRGGBBAA` where `AA` is transparency: 0x00 is opaque,
/// 0xFF is fully transparent.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleMask {
    /// Left edge in frame pixels (may be negative)
    pub x: i32,
    /// Top edge in frame pixels (may be negative)
    pub y: i32,
    pub width: usize,
    pub height: usize,
    pub coverage: Vec<u8>,
    pub color: u32,
}

impl SubtitleMask {
    /// Empty (fully uncovered) mask
    pub fn new(x: i32, y: i32, width: usize, height: usize, color: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            coverage: vec![0u8; width * height],
            color,
        }
    }

    /// Pack 8-bit channels, `transparency` 0 = opaque
    pub fn pack_color(r: u8, g: u8, b: u8, transparency: u8) -> u32 {
        u32::from_be_bytes([r, g, b, transparency])
    }

    /// (r, g, b, transparency)
    pub fn unpack_color(&self) -> (u8, u8, u8, u8) {
        let [r, g, b, a] = self.color.to_be_bytes();
        (r, g, b, a)
    }

    /// Coverage at mask-local coordinates
    pub fn coverage_at(&self, x: usize, y: usize) -> u8 {
        self.coverage[y * self.width + x]
    }
}
