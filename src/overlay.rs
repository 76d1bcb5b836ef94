use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::PipelineConfig;
use crate::subtitle::{CaptionEntry, split_window};

static MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));
static DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s.,!?-]").expect("valid regex"));
static PUNCT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.,!?-]{2,}").expect("valid regex"));

/// Caption styling as requested by the caller: keys into the font and colour
/// tables, not raw values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextStyle {
    pub font: String,
    pub color: String,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            font: "bold-sans".into(),
            color: "yellow".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedStyle {
    pub font_file: String,
    pub color: String,
    pub font_size: u32,
}

/// Strips markup, quotes, anything outside word characters, whitespace and
/// `. , ! ? -`, and runs of two or more punctuation marks. Whitespace is
/// collapsed. Idempotent.
pub fn clean_caption_text(text: &str) -> String {
    let text = MARKUP.replace_all(text, " ");
    let text = DISALLOWED.replace_all(&text, "");
    let text = PUNCT_RUN.replace_all(&text, "");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn sanitize_caption(text: &str, max_chars: usize) -> String {
    let cleaned = clean_caption_text(text);
    if cleaned.chars().count() <= max_chars {
        return cleaned;
    }
    let truncated: String = cleaned.chars().take(max_chars).collect();
    truncated.trim_end().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayInstruction {
    pub text: String,
    pub start_time: f64,
    pub end_time: f64,
}

impl OverlayInstruction {
    pub fn visible_at(&self, t: f64) -> bool {
        t >= self.start_time && t < self.end_time
    }
}

#[derive(Debug, Clone)]
pub struct OverlayRenderer {
    max_line_chars: usize,
    style: ResolvedStyle,
    bottom_margin: u32,
}

impl OverlayRenderer {
    pub fn new(config: &PipelineConfig, style: &TextStyle) -> Self {
        Self {
            max_line_chars: config.max_line_chars,
            style: resolve_style(config, style),
            bottom_margin: config.height / 12,
        }
    }

    pub fn style(&self) -> &ResolvedStyle {
        &self.style
    }

    /// Sanitized, wrapped, time-gated lines for every caption. Empty when
    /// there are no captions, which disables the overlay.
    pub fn instructions(&self, captions: &[CaptionEntry]) -> Vec<OverlayInstruction> {
        captions
            .iter()
            .flat_map(|entry| {
                let cleaned = clean_caption_text(&entry.text);
                split_window(&cleaned, entry.start_time, entry.end_time, self.max_line_chars)
            })
            .filter_map(|line| {
                let text = sanitize_caption(&line.text, self.max_line_chars);
                (!text.is_empty()).then_some(OverlayInstruction {
                    text,
                    start_time: line.start_time,
                    end_time: line.end_time,
                })
            })
            .collect()
    }

    pub fn drawtext_filters(&self, instructions: &[OverlayInstruction]) -> Vec<String> {
        let font = escape_filter_value(&self.style.font_file);
        let color = &self.style.color;
        let size = self.style.font_size;
        let margin = self.bottom_margin;
        instructions
            .iter()
            .map(|ins| {
                format!(
                    "drawtext=fontfile='{font}':text='{text}':fontsize={size}:fontcolor={color}:\
                     borderw=3:bordercolor=black:x=(w-tw)/2:y=h-th-{margin}:\
                     enable='gte(t\\,{start:.3})*lt(t\\,{end:.3})'",
                    text = ins.text,
                    start = ins.start_time,
                    end = ins.end_time,
                )
            })
            .collect()
    }
}

/// Looks up font and colour keys, falling back to the configured defaults
/// (bold sans-serif, yellow) for unknown keys.
pub fn resolve_style(config: &PipelineConfig, style: &TextStyle) -> ResolvedStyle {
    let font_file = lookup(&config.fonts, &style.font, &config.default_font, "font")
        .unwrap_or_else(|| "DejaVuSans-Bold.ttf".to_string());
    let color = lookup(&config.colors, &style.color, &config.default_color, "color")
        .unwrap_or_else(|| "yellow".to_string());
    ResolvedStyle {
        font_file,
        color,
        font_size: (config.height / 18).max(12),
    }
}

fn lookup(
    table: &std::collections::BTreeMap<String, String>,
    key: &str,
    default_key: &str,
    what: &str,
) -> Option<String> {
    if let Some(value) = table.get(key) {
        return Some(value.clone());
    }
    warn!("Unknown caption {} '{}', using '{}'", what, key, default_key);
    table.get(default_key).cloned()
}

fn escape_filter_value(value: &str) -> String {
    value.replace('\\', "/").replace(':', "\\:").replace('\'', "")
}
