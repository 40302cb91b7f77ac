//! Groups: contiguous LED ranges with their own animation parameters.

use std::{error::Error, fmt, time::Instant};

use crate::{
    color::{hsv_to_rgb, Rgb},
    mapper::PixelMapper,
    palette::Palette,
    pattern::{CompiledPattern, EvalContext, PatternOutput},
};

/// How often the evaluation loop checks the soft deadline.
const DEADLINE_CHECK_STRIDE: usize = 64;

/// Animation parameters for one contiguous LED range. Mutable from
/// configuration but frozen for the duration of a tick.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupConfig {
    pub name: String,
    pub range_start: usize,
    pub range_end: usize,
    pub brightness: f32,
    pub saturation: f32,
    /// Animation speed in Hz; multiplies `anim_time`.
    pub speed: f32,
    /// Spatial scale; multiplies the normalized coordinate.
    pub scale: f32,
    pub pattern_id: String,
    pub palette_id: String,
    /// Sink this group's output is routed to, by identifier.
    pub sink_binding: Option<String>,
}

impl GroupConfig {
    pub fn len(&self) -> usize {
        self.range_end.saturating_sub(self.range_start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    /// The referenced pattern has no compiled form.
    NotCompiled,
    /// The pattern produced an invalid value.
    Runtime(String),
    /// Evaluation exceeded the per-tick budget.
    DeadlineExceeded,
}

impl fmt::Display for GroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupError::NotCompiled => f.write_str("pattern has no compiled form"),
            GroupError::Runtime(message) => write!(f, "pattern runtime error: {message}"),
            GroupError::DeadlineExceeded => f.write_str("pattern exceeded the tick budget"),
        }
    }
}

impl Error for GroupError {}

/// Evaluate one group for one tick. Returns the colors for the group's
/// range, already scaled by the group's saturation and brightness.
///
/// `prev` holds the in-progress frame content for the group's range and is
/// what patterns observe through `prev_r/g/b`.
pub fn evaluate(
    group: &GroupConfig,
    pattern: Option<&CompiledPattern>,
    palette: &Palette,
    mapper: &dyn PixelMapper,
    anim_time: f64,
    prev: &[Rgb],
    deadline: Instant,
) -> Result<Vec<Rgb>, GroupError> {
    let pattern = pattern.ok_or(GroupError::NotCompiled)?;
    let t = (anim_time * f64::from(group.speed)) as f32;

    let mut out = Vec::with_capacity(group.len());
    for (offset, index) in (group.range_start..group.range_end).enumerate() {
        if offset % DEADLINE_CHECK_STRIDE == 0 && Instant::now() > deadline {
            return Err(GroupError::DeadlineExceeded);
        }
        let x = mapper.map(index) * group.scale;
        let ctx = EvalContext {
            t,
            x,
            prev: prev.get(offset).copied().unwrap_or(Rgb::BLACK),
            palette,
        };
        let color = match pattern.eval(&ctx) {
            Ok(PatternOutput::Color(color)) => color,
            Ok(PatternOutput::PalettePosition(p)) => hsv_to_rgb(palette.sample(p)),
            Err(e) => return Err(GroupError::Runtime(e.message)),
        };
        let color = color
            .saturate(group.saturation)
            .scaled(group.brightness.clamp(0.0, 1.0))
            .clamped();
        out.push(color);
    }
    Ok(out)
}
