use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::probe::DurationProber;

/// Pan/zoom applied to a still over its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectPreset {
    ZoomIn,
    ZoomOut,
    PanLeft,
    PanRight,
    Stable,
}

impl EffectPreset {
    pub const ALL: [EffectPreset; 5] = [
        EffectPreset::ZoomIn,
        EffectPreset::ZoomOut,
        EffectPreset::PanLeft,
        EffectPreset::PanRight,
        EffectPreset::Stable,
    ];

    pub fn for_index(index: usize) -> Self {
        Self::ALL[index % Self::ALL.len()]
    }

    /// The editly-style name used by the component renderer.
    pub fn direction(self) -> Option<&'static str> {
        match self {
            EffectPreset::ZoomIn => Some("in"),
            EffectPreset::ZoomOut => Some("out"),
            EffectPreset::PanLeft => Some("left"),
            EffectPreset::PanRight => Some("right"),
            EffectPreset::Stable => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualSlot {
    pub image_index: usize,
    pub image: PathBuf,
    pub start_time: f64,
    pub end_time: f64,
    pub effect: EffectPreset,
}

impl VisualSlot {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Splits `[0, total)` into one equal slot per image, in image order.
pub fn partition(images: &[PathBuf], total: f64) -> PipelineResult<Vec<VisualSlot>> {
    if images.is_empty() {
        return Err(PipelineError::InvalidJob("no images to compose".into()));
    }
    if !(total.is_finite() && total > 0.0) {
        return Err(PipelineError::InvalidJob(format!(
            "total duration must be positive, got {total}"
        )));
    }

    let n = images.len();
    let slot = total / n as f64;
    Ok(images
        .iter()
        .enumerate()
        .map(|(i, image)| VisualSlot {
            image_index: i,
            image: image.clone(),
            start_time: slot * i as f64,
            end_time: if i + 1 == n { total } else { slot * (i + 1) as f64 },
            effect: EffectPreset::for_index(i),
        })
        .collect())
}

/// How long each still must be fed to the encoder, and where its cross-fade
/// starts, so that the faded track still ends at the slot boundary total.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipSpan {
    pub input_duration: f64,
    /// Offset into the accumulated stream where this clip fades in. `None`
    /// for the first clip.
    pub xfade_offset: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FadePlan {
    pub fade: f64,
    pub spans: Vec<ClipSpan>,
}

#[derive(Debug, Clone)]
pub struct VisualComposer {
    width: u32,
    height: u32,
    fps: u32,
    crossfade: f64,
    zoom_amount: f64,
}

impl VisualComposer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            fps: config.fps,
            crossfade: config.crossfade_secs,
            zoom_amount: config.zoom_amount,
        }
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Checks every image decodes, then partitions the timeline. Any bad
    /// image aborts the whole composition.
    pub async fn compose(
        &self,
        prober: &DurationProber<'_>,
        images: &[PathBuf],
        total: f64,
    ) -> PipelineResult<Vec<VisualSlot>> {
        for image in images {
            let (w, h) = prober.image_dimensions(image).await?;
            debug!("Image {} is {}x{}", image.display(), w, h);
        }
        let slots = partition(images, total)?;
        info!(
            "Composed {} visual slots of {:.3}s over {:.3}s",
            slots.len(),
            total / slots.len() as f64,
            total
        );
        Ok(slots)
    }

    /// Cross-fade layout for `slots`. The fade is capped at half a slot and
    /// dropped entirely for a single slot.
    pub fn fade_plan(&self, slots: &[VisualSlot]) -> FadePlan {
        let n = slots.len();
        let min_slot = slots
            .iter()
            .map(VisualSlot::duration)
            .fold(f64::INFINITY, f64::min);
        let fade = if n > 1 {
            self.crossfade.min(min_slot / 2.0).max(0.0)
        } else {
            0.0
        };
        let half = fade / 2.0;

        let spans = slots
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                let lead = if i == 0 { 0.0 } else { half };
                let tail = if i + 1 == n { 0.0 } else { half };
                ClipSpan {
                    input_duration: slot.duration() + lead + tail,
                    xfade_offset: (i > 0).then(|| slot.start_time - half),
                }
            })
            .collect();

        FadePlan { fade, spans }
    }

    /// Fit-and-pad onto the canonical frame, then the slot's effect.
    /// `input` and `output` are filtergraph labels without brackets.
    pub fn slot_chain(
        &self,
        input: &str,
        output: &str,
        effect: EffectPreset,
        clip_duration: f64,
        with_effect: bool,
    ) -> String {
        let (w, h) = (self.width, self.height);
        let motion = if with_effect {
            self.effect_filter(effect, clip_duration)
        } else {
            self.effect_filter(EffectPreset::Stable, clip_duration)
        };
        format!(
            "[{input}]scale={w}:{h}:force_original_aspect_ratio=decrease,\
             pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:color=black,setsar=1,{motion},\
             format=yuv420p,setpts=PTS-STARTPTS[{output}]"
        )
    }

    /// Zoom interpolates linearly from 1.0 to `1 + zoom_amount` (or back)
    /// over the clip's frames; pans hold the zoom and slide across.
    pub fn effect_filter(&self, effect: EffectPreset, clip_duration: f64) -> String {
        let frames = self.frame_count(clip_duration);
        let a = self.zoom_amount;
        let size = format!("{}x{}", self.width, self.height);
        let center_x = "iw/2-(iw/zoom/2)";
        let center_y = "ih/2-(ih/zoom/2)";

        let (z, x, y) = match effect {
            EffectPreset::ZoomIn => (
                format!("1+{a:.4}*on/{frames}"),
                center_x.to_string(),
                center_y.to_string(),
            ),
            EffectPreset::ZoomOut => (
                format!("1+{a:.4}-{a:.4}*on/{frames}"),
                center_x.to_string(),
                center_y.to_string(),
            ),
            EffectPreset::PanLeft => (
                format!("{:.4}", 1.0 + a),
                format!("(iw-iw/zoom)*(1-on/{frames})"),
                center_y.to_string(),
            ),
            EffectPreset::PanRight => (
                format!("{:.4}", 1.0 + a),
                format!("(iw-iw/zoom)*on/{frames}"),
                center_y.to_string(),
            ),
            EffectPreset::Stable => return format!("fps={}", self.fps),
        };

        format!(
            "zoompan=z='{z}':x='{x}':y='{y}':d=1:s={size}:fps={}",
            self.fps
        )
    }

    pub fn frame_index(&self, t: f64) -> u64 {
        (t * self.fps as f64).round() as u64
    }

    pub fn frame_count(&self, seconds: f64) -> u64 {
        ((seconds * self.fps as f64).ceil() as u64).max(1)
    }

    /// Joins the labelled slot streams `s0..sN` into `output`, with
    /// cross-fades when the plan has one.
    pub fn join_chain(&self, plan: &FadePlan, output: &str) -> String {
        let n = plan.spans.len();
        if n == 1 {
            return format!("[s0]null[{output}]");
        }
        if plan.fade <= 0.0 {
            let inputs: String = (0..n).map(|i| format!("[s{i}]")).collect();
            return format!("{inputs}concat=n={n}:v=1:a=0[{output}]");
        }

        let mut filters = Vec::with_capacity(n - 1);
        let mut prev = "s0".to_string();
        for (i, span) in plan.spans.iter().enumerate().skip(1) {
            let label = if i + 1 == n {
                output.to_string()
            } else {
                format!("x{i}")
            };
            let offset = span.xfade_offset.unwrap_or_default();
            filters.push(format!(
                "[{prev}][s{i}]xfade=transition=fade:duration={:.3}:offset={:.3}[{label}]",
                plan.fade, offset
            ));
            prev = label;
        }
        filters.join(";")
    }
}
