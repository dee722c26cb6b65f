//! Subtitle mask blending onto BGRA frames.
//!
//! Per pixel, per mask:
//! ```text
//! final_alpha = coverage * (255 - transparency) / 255
//! out         = (src * final_alpha + dst * (255 - final_alpha)) / 255   (B, G, R)
//! out.a       = 255
//! ```
//! Masks are applied in the order given. Anything outside the frame is clipped.

use log::trace;

use crate::entities::{FrameBuffer, SubtitleMask, BYTES_PER_PIXEL};

/// Blend every mask into `frame` in order
pub fn blend_masks(frame: &mut FrameBuffer, masks: &[SubtitleMask]) {
    for mask in masks {
        blend_mask(frame, mask);
    }
}

/// Blend one mask into `frame`
pub fn blend_mask(frame: &mut FrameBuffer, mask: &SubtitleMask) {
    let (r, g, b, transparency) = mask.unpack_color();
    let opacity = 255 - transparency as u32;
    if opacity == 0 || mask.width == 0 || mask.height == 0 {
        return;
    }
    if mask.width.checked_mul(mask.height).is_none_or(|n| mask.coverage.len() < n) {
        trace!(
            "Skipping {}x{} mask with {} coverage bytes",
            mask.width,
            mask.height,
            mask.coverage.len()
        );
        return;
    }

    let fw = frame.width() as i64;
    let fh = frame.height() as i64;
    let stride = frame.stride();

    // Clip mask rect against the frame once, then walk only the overlap
    let x0 = (mask.x as i64).max(0);
    let y0 = (mask.y as i64).max(0);
    let x1 = (mask.x as i64 + mask.width as i64).min(fw);
    let y1 = (mask.y as i64 + mask.height as i64).min(fh);
    if x0 >= x1 || y0 >= y1 {
        return;
    }

    let pixels = frame.pixels_mut();
    for fy in y0..y1 {
        let my = (fy - mask.y as i64) as usize;
        let cov_row = &mask.coverage[my * mask.width..(my + 1) * mask.width];
        let row = fy as usize * stride;
        for fx in x0..x1 {
            let mx = (fx - mask.x as i64) as usize;
            let c = cov_row[mx] as u32;
            if c == 0 {
                continue;
            }
            let alpha = c * opacity / 255;
            let inv = 255 - alpha;
            let i = row + fx as usize * BYTES_PER_PIXEL;
            pixels[i] = ((b as u32 * alpha + pixels[i] as u32 * inv) / 255) as u8;
            pixels[i + 1] = ((g as u32 * alpha + pixels[i + 1] as u32 * inv) / 255) as u8;
            pixels[i + 2] = ((r as u32 * alpha + pixels[i + 2] as u32 * inv) / 255) as u8;
            pixels[i + 3] = 255;
        }
    }
}
