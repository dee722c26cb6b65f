//! Subtitle rasterisation: active cues at `t` -> positioned coverage masks.
//!
//! Each cue produces up to three masks, blended in this order:
//! shadow (`BackColour`, offset by `Shadow`), outline (`OutlineColour`, glyph
//! coverage dilated by `Outline`), fill (`PrimaryColour`). Cues come out in
//! script order. Sizes and margins are scaled from the script's PlayRes to the
//! frame. Rasterised cues are memoised per frame size.

pub mod script;

use cosmic_text::{Attrs, Buffer, Color, Family, FontSystem, Metrics, Shaping, SwashCache, Weight};
use log::{debug, trace};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use crate::entities::SubtitleMask;
use crate::error::Result;
pub use script::{Cue, Script, Style};

const MEMO_CAPACITY: usize = 32;
const LINE_SPACING: f32 = 1.2;

/// Anything that can hand the engine a mask list for a frame
pub trait SubtitleSource: Send {
    /// Masks to blend at media time `t` onto a `width` x `height` frame
    fn masks_at(&mut self, t: f64, width: usize, height: usize) -> Vec<SubtitleMask>;
}

/// Source with nothing to draw
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSubtitles;

impl SubtitleSource for NoSubtitles {
    fn masks_at(&mut self, _t: f64, _width: usize, _height: usize) -> Vec<SubtitleMask> {
        Vec::new()
    }
}

/// (cue index, frame width, frame height)
type MemoKey = (usize, usize, usize);

/// Markup-driven subtitle renderer
pub struct SubtitleCompositor {
    script: Script,
    font_system: FontSystem,
    swash: SwashCache,
    memo: LruCache<MemoKey, Arc<Vec<SubtitleMask>>>,
}

impl SubtitleCompositor {
    pub fn from_markup(markup: &str) -> Self {
        Self::from_script(Script::parse(markup))
    }

    pub fn from_script(script: Script) -> Self {
        debug!(
            "SubtitleCompositor: {} cues, {} styles, PlayRes {}x{}",
            script.cues.len(),
            script.styles.len(),
            script.play_res.0,
            script.play_res.1
        );
        Self {
            script,
            font_system: FontSystem::new(),
            swash: SwashCache::new(),
            memo: LruCache::new(NonZeroUsize::new(MEMO_CAPACITY).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let markup = std::fs::read_to_string(path)?;
        Ok(Self::from_markup(&markup))
    }

    /// Replace the content; drops memoised masks
    pub fn set_markup(&mut self, markup: &str) {
        self.script = Script::parse(markup);
        self.memo.clear();
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }

    fn cue_masks(&mut self, index: usize, width: usize, height: usize) -> Arc<Vec<SubtitleMask>> {
        let key = (index, width, height);
        if let Some(hit) = self.memo.get(&key) {
            return Arc::clone(hit);
        }

        let cue = &self.script.cues[index];
        let style = self.script.style(cue);
        let layout = CueLayout::new(&self.script, cue, style, width, height);
        let masks = match rasterize_lines(&mut self.font_system, &mut self.swash, cue, style, &layout) {
            Some(canvas) => build_masks(&canvas, &layout, style),
            None => Vec::new(),
        };
        trace!("Rasterised cue {} at {}x{}: {} masks", index, width, height, masks.len());

        let masks = Arc::new(masks);
        self.memo.put(key, Arc::clone(&masks));
        masks
    }
}

impl SubtitleSource for SubtitleCompositor {
    fn masks_at(&mut self, t: f64, width: usize, height: usize) -> Vec<SubtitleMask> {
        if width == 0 || height == 0 {
            return Vec::new();
        }
        let mut out = Vec::new();
        for index in self.script.active_at(t) {
            out.extend(self.cue_masks(index, width, height).iter().cloned());
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum HAlign {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum VAlign {
    Bottom,
    Middle,
    Top,
}

fn split_alignment(numpad: u8) -> (HAlign, VAlign) {
    let h = match numpad % 3 {
        1 => HAlign::Left,
        0 => HAlign::Right,
        _ => HAlign::Center,
    };
    let v = match numpad {
        4..=6 => VAlign::Middle,
        7..=9 => VAlign::Top,
        _ => VAlign::Bottom,
    };
    (h, v)
}

/// Frame-space metrics for one cue
#[derive(Debug, Clone, PartialEq)]
struct CueLayout {
    frame: (usize, usize),
    font_px: f32,
    line_height: usize,
    outline_px: f32,
    shadow_px: i32,
    margins: (i32, i32, i32),
    align: (HAlign, VAlign),
}

impl CueLayout {
    fn new(script: &Script, cue: &Cue, style: &Style, width: usize, height: usize) -> Self {
        let sx = width as f32 / script.play_res.0.max(1) as f32;
        let sy = height as f32 / script.play_res.1.max(1) as f32;
        let pick = |over: i32, base: i32| if over != 0 { over } else { base };
        let font_px = (style.font_size * sy).max(1.0);
        Self {
            frame: (width, height),
            font_px,
            line_height: (font_px * LINE_SPACING).ceil() as usize,
            outline_px: (style.outline * sy).max(0.0),
            shadow_px: (style.shadow * sy).max(0.0).round() as i32,
            margins: (
                (pick(cue.margin_l, style.margin_l) as f32 * sx).round() as i32,
                (pick(cue.margin_r, style.margin_r) as f32 * sx).round() as i32,
                (pick(cue.margin_v, style.margin_v) as f32 * sy).round() as i32,
            ),
            align: split_alignment(style.alignment),
        }
    }

    /// Blank border around the glyphs so outline and shadow never clip
    fn pad(&self) -> usize {
        self.outline_px.ceil() as usize + self.shadow_px as usize + 2
    }

    /// Top-left of the text block (glyph area, no padding) in frame space
    fn origin(&self, content_w: usize, content_h: usize) -> (i32, i32) {
        let (fw, fh) = (self.frame.0 as i32, self.frame.1 as i32);
        let (cw, ch) = (content_w as i32, content_h as i32);
        let (ml, mr, mv) = self.margins;
        let x = match self.align.0 {
            HAlign::Left => ml,
            HAlign::Center => ml + (fw - ml - mr - cw) / 2,
            HAlign::Right => fw - mr - cw,
        };
        let y = match self.align.1 {
            VAlign::Bottom => fh - mv - ch,
            VAlign::Middle => (fh - ch) / 2,
            VAlign::Top => mv,
        };
        (x, y)
    }

    fn line_offset(&self, line_w: usize, content_w: usize) -> usize {
        match self.align.0 {
            HAlign::Left => 0,
            HAlign::Center => (content_w - line_w) / 2,
            HAlign::Right => content_w - line_w,
        }
    }
}

/// Glyph coverage for the whole cue, padded by `layout.pad()`
#[derive(Debug, Clone, PartialEq)]
struct Canvas {
    width: usize,
    height: usize,
    /// Glyph block size without padding
    content: (usize, usize),
    coverage: Vec<u8>,
}

fn rasterize_lines(
    font_system: &mut FontSystem,
    swash: &mut SwashCache,
    cue: &Cue,
    style: &Style,
    layout: &CueLayout,
) -> Option<Canvas> {
    let metrics = Metrics::new(layout.font_px, layout.line_height as f32);
    let mut attrs = Attrs::new().family(Family::Name(&style.font_name));
    if style.bold {
        attrs = attrs.weight(Weight::BOLD);
    }

    // One unwrapped buffer per line so each line can be aligned on its own
    let mut lines = Vec::new();
    for text in cue.text.split('\n') {
        let mut buffer = Buffer::new(font_system, metrics);
        buffer.set_size(font_system, None, None);
        buffer.set_text(font_system, text, &attrs, Shaping::Advanced, None);
        buffer.shape_until_scroll(font_system, false);
        let line_w = buffer.layout_runs().map(|run| run.line_w).fold(0.0f32, f32::max);
        lines.push((buffer, line_w.ceil() as usize));
    }

    let content_w = lines.iter().map(|(_, w)| *w).max().unwrap_or(0);
    let content_h = lines.len() * layout.line_height;
    if content_w == 0 || content_h == 0 {
        return None;
    }

    let pad = layout.pad();
    let width = content_w + 2 * pad;
    let height = content_h + 2 * pad;
    let mut coverage = vec![0u8; width * height];

    for (i, (buffer, line_w)) in lines.iter().enumerate() {
        let x_off = (pad + layout.line_offset(*line_w, content_w)) as i32;
        let y_off = (pad + i * layout.line_height) as i32;
        buffer.draw(font_system, swash, Color::rgb(255, 255, 255), |x, y, w, h, color| {
            let a = color.a();
            if a == 0 {
                return;
            }
            for dy in 0..h as i32 {
                let py = y_off + y + dy;
                if py < 0 || py >= height as i32 {
                    continue;
                }
                for dx in 0..w as i32 {
                    let px = x_off + x + dx;
                    if px < 0 || px >= width as i32 {
                        continue;
                    }
                    let idx = py as usize * width + px as usize;
                    coverage[idx] = coverage[idx].max(a);
                }
            }
        });
    }

    if coverage.iter().all(|&c| c == 0) {
        // No usable font
        return None;
    }
    Some(Canvas {
        width,
        height,
        content: (content_w, content_h),
        coverage,
    })
}

/// Grow coverage by `radius` pixels (round brush, max filter)
fn dilate(src: &[u8], width: usize, height: usize, radius: f32) -> Vec<u8> {
    let r = radius.ceil() as i32;
    let limit = radius * radius + 0.5;
    let brush: Vec<(i32, i32)> = (-r..=r)
        .flat_map(|dy| (-r..=r).map(move |dx| (dx, dy)))
        .filter(|&(dx, dy)| ((dx * dx + dy * dy) as f32) <= limit)
        .collect();

    let mut out = src.to_vec();
    for y in 0..height as i32 {
        for x in 0..width as i32 {
            let v = src[y as usize * width + x as usize];
            if v == 0 {
                continue;
            }
            for &(dx, dy) in &brush {
                let (px, py) = (x + dx, y + dy);
                if px < 0 || py < 0 || px >= width as i32 || py >= height as i32 {
                    continue;
                }
                let idx = py as usize * width + px as usize;
                out[idx] = out[idx].max(v);
            }
        }
    }
    out
}

/// Shadow, outline, fill for one rasterised cue
fn build_masks(canvas: &Canvas, layout: &CueLayout, style: &Style) -> Vec<SubtitleMask> {
    let pad = layout.pad() as i32;
    let (cx, cy) = layout.origin(canvas.content.0, canvas.content.1);
    let (x, y) = (cx - pad, cy - pad);

    let mask = |x: i32, y: i32, coverage: Vec<u8>, color: u32| SubtitleMask {
        x,
        y,
        width: canvas.width,
        height: canvas.height,
        coverage,
        color,
    };

    let outline = (layout.outline_px > 0.0)
        .then(|| dilate(&canvas.coverage, canvas.width, canvas.height, layout.outline_px));

    let mut masks = Vec::with_capacity(3);
    if layout.shadow_px > 0 {
        let body = outline.clone().unwrap_or_else(|| canvas.coverage.clone());
        let s = layout.shadow_px;
        masks.push(mask(x + s, y + s, body, style.back_color));
    }
    if let Some(outline) = outline {
        masks.push(mask(x, y, outline, style.outline_color));
    }
    masks.push(mask(x, y, canvas.coverage.clone(), style.primary));
    masks
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKUP: &str = "\
[Script Info]
PlayResX: 640
PlayResY: 360

[V4+ Styles]
Format: Name, Fontname, Fontsize, PrimaryColour, SecondaryColour, OutlineColour, BackColour, Bold, Italic, Underline, StrikeOut, ScaleX, ScaleY, Spacing, Angle, BorderStyle, Outline, Shadow, Alignment, MarginL, MarginR, MarginV, Encoding
Style: Default,sans-serif,24,&H00FFFFFF,&H000000FF,&H00000000,&H80000000,0,0,0,0,100,100,0,0,1,2,2,2,10,10,20,1

[Events]
Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text
Dialogue: 0,0:00:01.00,0:00:02.00,Default,,0,0,0,,Hello\\Nworld
";

    fn layout(align: u8, outline: f32, shadow: f32) -> (CueLayout, Style) {
        let script = Script::parse(MARKUP);
        let style = Style {
            alignment: align,
            outline,
            shadow,
            ..script.styles[0].clone()
        };
        // Frame at 2x PlayRes
        let layout = CueLayout::new(&script, &script.cues[0], &style, 1280, 720);
        (layout, style)
    }

    fn dot_canvas(layout: &CueLayout) -> Canvas {
        // 4x2 glyph block with one covered pixel in the middle
        let pad = layout.pad();
        let (w, h) = (4 + 2 * pad, 2 + 2 * pad);
        let mut coverage = vec![0u8; w * h];
        coverage[(pad + 1) * w + pad + 2] = 255;
        Canvas { width: w, height: h, content: (4, 2), coverage }
    }

    #[test]
    fn test_no_subtitles_is_empty() {
        assert!(NoSubtitles.masks_at(1.0, 640, 360).is_empty());
    }

    #[test]
    fn test_layout_scales_from_play_res() {
        let (layout, _) = layout(2, 2.0, 2.0);
        assert_eq!(layout.font_px, 48.0);
        assert_eq!(layout.outline_px, 4.0);
        assert_eq!(layout.shadow_px, 4);
        assert_eq!(layout.margins, (20, 20, 40));
        assert_eq!(layout.line_height, 58);
    }

    #[test]
    fn test_alignment_origin() {
        let (bottom_center, _) = layout(2, 0.0, 0.0);
        assert_eq!(bottom_center.origin(100, 50), (20 + (1280 - 40 - 100) / 2, 720 - 40 - 50));

        let (top_left, _) = layout(7, 0.0, 0.0);
        assert_eq!(top_left.origin(100, 50), (20, 40));

        let (mid_right, _) = layout(6, 0.0, 0.0);
        assert_eq!(mid_right.origin(100, 50), (1280 - 20 - 100, (720 - 50) / 2));
    }

    #[test]
    fn test_masks_in_shadow_outline_fill_order() {
        let (layout, style) = layout(2, 1.0, 1.0);
        let canvas = dot_canvas(&layout);
        let masks = build_masks(&canvas, &layout, &style);

        assert_eq!(masks.len(), 3);
        assert_eq!(masks[0].color, style.back_color);
        assert_eq!(masks[1].color, style.outline_color);
        assert_eq!(masks[2].color, style.primary);

        // Shadow is the outline body shifted by the shadow distance
        assert_eq!(masks[0].coverage, masks[1].coverage);
        assert_eq!(masks[0].x, masks[1].x + layout.shadow_px);
        assert_eq!(masks[0].y, masks[1].y + layout.shadow_px);
        assert_eq!(masks[2].coverage, canvas.coverage);
        for m in &masks {
            assert_eq!(m.coverage.len(), m.width * m.height);
        }
    }

    #[test]
    fn test_no_outline_no_shadow_only_fill() {
        let (layout, style) = layout(2, 0.0, 0.0);
        let masks = build_masks(&dot_canvas(&layout), &layout, &style);
        assert_eq!(masks.len(), 1);
        assert_eq!(masks[0].color, style.primary);
    }

    #[test]
    fn test_dilate_round_brush() {
        let (w, h) = (5, 5);
        let mut src = vec![0u8; w * h];
        src[2 * w + 2] = 200;
        let out = dilate(&src, w, h, 1.0);
        assert_eq!(out[2 * w + 1], 200);
        assert_eq!(out[w + 2], 200);
        assert_eq!(out[w + 1], 0); // diagonal is outside radius 1
        assert_eq!(out[0], 0);
    }

    #[test]
    fn test_inactive_time_no_masks() {
        let mut comp = SubtitleCompositor::from_markup(MARKUP);
        assert!(comp.masks_at(0.5, 640, 360).is_empty());
        assert!(comp.masks_at(2.0, 640, 360).is_empty());
        assert_eq!(comp.memo_len(), 0);
    }

    #[test]
    fn test_active_cue_memoised() {
        let mut comp = SubtitleCompositor::from_markup(MARKUP);
        let first = comp.masks_at(1.5, 640, 360);
        let second = comp.masks_at(1.6, 640, 360);
        assert_eq!(first, second);
        assert_eq!(comp.memo_len(), 1);
        // Masks stay inside the padded canvas contract whether or not fonts exist
        for m in &first {
            assert_eq!(m.coverage.len(), m.width * m.height);
        }

        comp.set_markup("");
        assert_eq!(comp.memo_len(), 0);
        assert!(comp.masks_at(1.5, 640, 360).is_empty());
    }
}
