//! Reader for the subset of ASS/SSA markup the compositor draws.
//!
//! Understood: `[Script Info]` PlayResX/PlayResY, `[V4+ Styles]` (and the
//! older `[V4 Styles]`) with a `Format:` header, `[Events]` `Dialogue:` lines.
//! Override blocks `{...}` are stripped; `\N`/`\n` become line breaks and
//! `\h` a space. Lines the reader cannot make sense of are skipped.

use log::debug;

/// Default canvas when the script does not declare one
pub const DEFAULT_PLAY_RES: (u32, u32) = (384, 288);

/// Packed `0xRRGGBBAA`, AA = transparency (00 opaque)
pub type PackedColor = u32;

/// One `Style:` line
#[derive(Debug, Clone, PartialEq)]
pub struct Style {
    pub name: String,
    pub font_name: String,
    pub font_size: f32,
    pub primary: PackedColor,
    pub outline_color: PackedColor,
    pub back_color: PackedColor,
    pub bold: bool,
    pub outline: f32,
    pub shadow: f32,
    /// Numpad layout: 1-3 bottom, 4-6 middle, 7-9 top
    pub alignment: u8,
    pub margin_l: i32,
    pub margin_r: i32,
    pub margin_v: i32,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            name: "Default".to_string(),
            font_name: "sans-serif".to_string(),
            font_size: 20.0,
            primary: 0xFFFFFF00,
            outline_color: 0x00000000,
            back_color: 0x00000080,
            bold: false,
            outline: 2.0,
            shadow: 2.0,
            alignment: 2,
            margin_l: 10,
            margin_r: 10,
            margin_v: 10,
        }
    }
}

/// One `Dialogue:` line
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub start: f64,
    pub end: f64,
    pub layer: i32,
    /// Index into `Script::styles`
    pub style: usize,
    /// Plain text, lines separated by `\n`
    pub text: String,
    /// Per-cue margin overrides (0 = use style)
    pub margin_l: i32,
    pub margin_r: i32,
    pub margin_v: i32,
}

impl Cue {
    /// Shown at `t` (start inclusive, end exclusive)
    pub fn is_active(&self, t: f64) -> bool {
        t >= self.start && t < self.end
    }
}

/// Parsed script
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub play_res: (u32, u32),
    pub styles: Vec<Style>,
    pub cues: Vec<Cue>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            play_res: DEFAULT_PLAY_RES,
            styles: vec![Style::default()],
            cues: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Info,
    Styles,
    Events,
    Other,
}

impl Script {
    pub fn parse(markup: &str) -> Self {
        let mut play_x = None;
        let mut play_y = None;
        let mut styles: Vec<Style> = Vec::new();
        let mut raw_cues: Vec<(Cue, String)> = Vec::new();
        let mut style_format: Vec<String> = Vec::new();
        let mut event_format: Vec<String> = Vec::new();
        let mut section = Section::Other;

        for (lineno, line) in markup.lines().enumerate() {
            let line = line.trim_start_matches('\u{feff}').trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                section = match line.to_ascii_lowercase().as_str() {
                    "[script info]" => Section::Info,
                    "[v4+ styles]" | "[v4 styles]" => Section::Styles,
                    "[events]" => Section::Events,
                    _ => Section::Other,
                };
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match (section, key) {
                (Section::Info, "PlayResX") => play_x = value.parse::<u32>().ok().filter(|&v| v > 0),
                (Section::Info, "PlayResY") => play_y = value.parse::<u32>().ok().filter(|&v| v > 0),
                (Section::Styles, "Format") => style_format = split_format(value),
                (Section::Styles, "Style") => match parse_style(&style_format, value) {
                    Some(style) => styles.push(style),
                    None => debug!("Skipping style on line {}", lineno + 1),
                },
                (Section::Events, "Format") => event_format = split_format(value),
                (Section::Events, "Dialogue") => match parse_dialogue(&event_format, value) {
                    Some(cue) => raw_cues.push(cue),
                    None => debug!("Skipping dialogue on line {}", lineno + 1),
                },
                _ => {}
            }
        }

        if styles.is_empty() {
            styles.push(Style::default());
        }
        let cues = raw_cues
            .into_iter()
            .map(|(mut cue, style_name)| {
                cue.style = style_index(&styles, &style_name);
                cue
            })
            .collect();

        Self {
            play_res: match (play_x, play_y) {
                (Some(x), Some(y)) => (x, y),
                // Only one given: keep the default aspect
                (Some(x), None) => (x, x * DEFAULT_PLAY_RES.1 / DEFAULT_PLAY_RES.0),
                (None, Some(y)) => (y * DEFAULT_PLAY_RES.0 / DEFAULT_PLAY_RES.1, y),
                (None, None) => DEFAULT_PLAY_RES,
            },
            styles,
            cues,
        }
    }

    pub fn style(&self, cue: &Cue) -> &Style {
        // parse() guarantees at least one style
        self.styles.get(cue.style).unwrap_or(&self.styles[0])
    }

    /// Indices of cues shown at `t`, in script order
    pub fn active_at(&self, t: f64) -> Vec<usize> {
        self.cues
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_active(t))
            .map(|(i, _)| i)
            .collect()
    }
}

fn style_index(styles: &[Style], name: &str) -> usize {
    let name = name.trim_start_matches('*');
    styles
        .iter()
        .position(|s| s.name.eq_ignore_ascii_case(name))
        .unwrap_or(0)
}

fn split_format(value: &str) -> Vec<String> {
    value.split(',').map(|f| f.trim().to_ascii_lowercase()).collect()
}

fn fields<'a>(format: &[String], value: &'a str, defaults: &[&str]) -> Vec<(String, &'a str)> {
    let names: Vec<String> = if format.is_empty() {
        defaults.iter().map(|s| s.to_string()).collect()
    } else {
        format.to_vec()
    };
    // Last field (Text) may contain commas
    value
        .splitn(names.len(), ',')
        .zip(names)
        .map(|(v, n)| (n, v))
        .collect()
}

const STYLE_FIELDS: &[&str] = &[
    "name", "fontname", "fontsize", "primarycolour", "secondarycolour", "outlinecolour", "backcolour",
    "bold", "italic", "underline", "strikeout", "scalex", "scaley", "spacing", "angle", "borderstyle",
    "outline", "shadow", "alignment", "marginl", "marginr", "marginv", "encoding",
];

const EVENT_FIELDS: &[&str] = &[
    "layer", "start", "end", "style", "name", "marginl", "marginr", "marginv", "effect", "text",
];

fn parse_style(format: &[String], value: &str) -> Option<Style> {
    let mut style = Style::default();
    let mut named = false;
    for (name, v) in fields(format, value, STYLE_FIELDS) {
        let v = v.trim();
        match name.as_str() {
            "name" => {
                style.name = v.to_string();
                named = true;
            }
            "fontname" => style.font_name = v.to_string(),
            "fontsize" => style.font_size = v.parse().ok()?,
            "primarycolour" => style.primary = parse_color(v)?,
            "outlinecolour" => style.outline_color = parse_color(v)?,
            "backcolour" => style.back_color = parse_color(v)?,
            "bold" => style.bold = v.parse::<i32>().map(|b| b != 0).unwrap_or(false),
            "outline" => style.outline = v.parse().unwrap_or(0.0),
            "shadow" => style.shadow = v.parse().unwrap_or(0.0),
            "alignment" => style.alignment = v.parse().ok().filter(|a| (1..=9).contains(a)).unwrap_or(2),
            "marginl" => style.margin_l = v.parse().unwrap_or(0),
            "marginr" => style.margin_r = v.parse().unwrap_or(0),
            "marginv" => style.margin_v = v.parse().unwrap_or(0),
            _ => {}
        }
    }
    named.then_some(style)
}

fn parse_dialogue(format: &[String], value: &str) -> Option<(Cue, String)> {
    let mut cue = Cue {
        start: 0.0,
        end: 0.0,
        layer: 0,
        style: 0,
        text: String::new(),
        margin_l: 0,
        margin_r: 0,
        margin_v: 0,
    };
    let mut style_name = String::new();
    let mut timed = (false, false);
    for (name, v) in fields(format, value, EVENT_FIELDS) {
        match name.as_str() {
            "layer" => cue.layer = v.trim().parse().unwrap_or(0),
            "start" => {
                cue.start = parse_time(v.trim())?;
                timed.0 = true;
            }
            "end" => {
                cue.end = parse_time(v.trim())?;
                timed.1 = true;
            }
            "style" => style_name = v.trim().to_string(),
            "marginl" => cue.margin_l = v.trim().parse().unwrap_or(0),
            "marginr" => cue.margin_r = v.trim().parse().unwrap_or(0),
            "marginv" => cue.margin_v = v.trim().parse().unwrap_or(0),
            "text" => cue.text = plain_text(v),
            _ => {}
        }
    }
    if timed != (true, true) || cue.end <= cue.start {
        return None;
    }
    Some((cue, style_name))
}

/// `H:MM:SS.cc` -> seconds
pub fn parse_time(s: &str) -> Option<f64> {
    let mut parts = s.split(':');
    let h: f64 = parts.next()?.trim().parse().ok()?;
    let m: f64 = parts.next()?.trim().parse().ok()?;
    let sec: f64 = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() || h < 0.0 || m < 0.0 || sec < 0.0 {
        return None;
    }
    Some(h * 3600.0 + m * 60.0 + sec)
}

/// `&HAABBGGRR&` (or `&HBBGGRR`, or decimal) -> `0xRRGGBBAA`
pub fn parse_color(s: &str) -> Option<PackedColor> {
    let s = s.trim().trim_end_matches('&');
    let raw = if let Some(hex) = s.strip_prefix("&H").or_else(|| s.strip_prefix("&h")) {
        u32::from_str_radix(hex, 16).ok()?
    } else {
        let v: i64 = s.parse().ok()?;
        v as u32
    };
    let [a, b, g, r] = raw.to_be_bytes();
    Some(u32::from_be_bytes([r, g, b, a]))
}

/// Strip override blocks and resolve escapes
pub fn plain_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut depth = 0usize;
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => depth += 1,
            '}' if depth > 0 => depth -= 1,
            _ if depth > 0 => {}
            '\\' => match chars.peek() {
                Some('N') | Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('h') => {
                    chars.next();
                    out.push(' ');
                }
                _ => out.push('\\'),
            },
            _ => out.push(c),
        }
    }
    out
}
