use std::{
    collections::{BTreeMap, HashMap},
    error::Error,
    fmt,
    fs,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use argh::FromArgs;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    artnet::ArtNetConfig,
    color::{ChannelCorrection, Hsv, RgbwAlgorithm},
    frame::ChannelOrder,
    group::GroupConfig,
    palette::{default_palettes, Palette},
    pattern::PatternRegistry,
    smoothing::{FrameMode, SmoothingConfig, SpatialMode},
    timesync::{SyncMode, TimeSyncConfig},
};

/// Configuration for an addressable LED strip controller.
#[derive(FromArgs, Debug)]
pub struct StripConfig {
    /// the number of LEDs on the strip. Default: 60
    #[argh(option, default = "60")]
    pub led_count: usize,
    /// the channel order the strip expects e.g. "RGB", "GRB" or "GRBW".
    /// Default: "GRB"
    #[argh(option, default = "ChannelOrder::Grb")]
    pub led_pixel_order: ChannelOrder,
    /// the target frame rate. Default: 60
    #[argh(option, default = "60")]
    pub target_fps: usize,
    /// path to the JSON configuration document.
    #[argh(option)]
    pub config: Option<PathBuf>,
    /// the SPI device of a locally attached strip e.g. "/dev/spidev0.0".
    #[argh(option)]
    pub spi_device: Option<PathBuf>,
    /// the serial device of a tethered microcontroller e.g. "/dev/ttyACM0".
    #[argh(option)]
    pub serial_device: Option<PathBuf>,
    /// UDP frame destination as "host:port".
    #[argh(option)]
    pub udp_target: Option<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    ZeroLedCount,
    InvalidRange {
        group: String,
        start: usize,
        end: usize,
        led_count: usize,
    },
    OverlappingGroups(String, String),
    UnknownPattern {
        group: String,
        pattern: String,
    },
    UnknownPalette {
        group: String,
        palette: String,
    },
    PaletteTooSmall(String),
    InvalidValue {
        key: &'static str,
        value: String,
    },
    ArtNetChannelOverflow,
    Io(io::Error),
    Parse(serde_json::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroLedCount => f.write_str("led_count must be at least 1"),
            ConfigError::InvalidRange {
                group,
                start,
                end,
                led_count,
            } => write!(
                f,
                "group '{group}' range {start}..{end} is invalid for {led_count} LEDs"
            ),
            ConfigError::OverlappingGroups(a, b) => {
                write!(f, "groups '{a}' and '{b}' overlap")
            }
            ConfigError::UnknownPattern { group, pattern } => {
                write!(f, "group '{group}' references unknown pattern '{pattern}'")
            }
            ConfigError::UnknownPalette { group, palette } => {
                write!(f, "group '{group}' references unknown palette '{palette}'")
            }
            ConfigError::PaletteTooSmall(name) => {
                write!(f, "palette '{name}' needs at least two stops")
            }
            ConfigError::InvalidValue { key, value } => {
                write!(f, "'{value}' is not a valid value for {key}")
            }
            ConfigError::ArtNetChannelOverflow => {
                f.write_str("ArtNet channel offset plus pixel block exceeds 512 channels")
            }
            ConfigError::Io(e) => write!(f, "could not read configuration: {e}"),
            ConfigError::Parse(e) => write!(f, "could not parse configuration: {e}"),
        }
    }
}

impl Error for ConfigError {}

/// One group record in the configuration document.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GroupRecord {
    pub range_start: usize,
    pub range_end: usize,
    pub brightness: f32,
    pub saturation: f32,
    pub speed: f32,
    pub scale: f32,
    pub pattern: String,
    pub palette: String,
    pub sink: Option<String>,
}

impl Default for GroupRecord {
    fn default() -> Self {
        Self {
            range_start: 0,
            range_end: 0,
            brightness: 1.0,
            saturation: 1.0,
            speed: 1.0,
            scale: 1.0,
            pattern: "cycle".to_string(),
            palette: "rainbow".to_string(),
            sink: None,
        }
    }
}

/// The configuration document consumed from disk or from the API.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigDocument {
    pub global_brightness: f32,
    pub global_saturation: f32,
    pub global_color_temp: f32,
    /// Channel correction gains, 0..255 per channel.
    pub global_color_r: u8,
    pub global_color_g: u8,
    pub global_color_b: u8,
    pub use_white_channel: bool,
    pub rgbw_algorithm: String,
    pub white_led_temperature: f32,
    pub calibration: u8,
    pub gamma: f32,
    pub groups: BTreeMap<String, GroupRecord>,
    /// Palette stops as `[h, s, v]` triples.
    pub palettes: BTreeMap<String, Vec<[f32; 3]>>,
    /// Pattern sources by name.
    pub functions: BTreeMap<String, String>,
    pub enable_artnet: bool,
    pub artnet_universe: u16,
    pub artnet_channel_offset: usize,
    pub artnet_group_size: usize,
    pub artnet_frame_interpolation: String,
    pub artnet_frame_interp_size: usize,
    pub artnet_spatial_smoothing: String,
    pub artnet_spatial_size: usize,
    pub enable_sync: bool,
    pub sync_master_mode: bool,
    pub sync_interval: f32,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            global_brightness: 1.0,
            global_saturation: 1.0,
            global_color_temp: 6500.0,
            global_color_r: 255,
            global_color_g: 255,
            global_color_b: 255,
            use_white_channel: false,
            rgbw_algorithm: "legacy".to_string(),
            white_led_temperature: 4500.0,
            calibration: 0,
            gamma: 2.2,
            groups: BTreeMap::new(),
            palettes: BTreeMap::new(),
            functions: BTreeMap::new(),
            enable_artnet: false,
            artnet_universe: 0,
            artnet_channel_offset: 0,
            artnet_group_size: 1,
            artnet_frame_interpolation: "none".to_string(),
            artnet_frame_interp_size: 1,
            artnet_spatial_smoothing: "none".to_string(),
            artnet_spatial_size: 1,
            enable_sync: false,
            sync_master_mode: false,
            sync_interval: 1.0,
        }
    }
}

impl ConfigDocument {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&text).map_err(ConfigError::Parse)
    }
}

/// Settings applied to the full frame after group evaluation.
#[derive(Debug, Clone, Copy)]
pub struct GlobalSettings {
    pub brightness: f32,
    pub saturation: f32,
    pub color_temp: f32,
    pub correction: ChannelCorrection,
    pub use_white_channel: bool,
    pub rgbw_algorithm: RgbwAlgorithm,
    pub white_led_temperature: f32,
    pub calibration: bool,
    pub gamma: f32,
    pub target_fps: usize,
}

/// Immutable configuration view the render loop works from. Swapped whole
/// at tick boundaries; a tick never observes a partial update.
pub struct RenderSnapshot {
    pub globals: GlobalSettings,
    pub groups: Vec<GroupConfig>,
    pub palettes: HashMap<String, Arc<Palette>>,
    pub patterns: Arc<PatternRegistry>,
    pub artnet_enabled: bool,
    pub smoothing: SmoothingConfig,
}

fn parse_rgbw_algorithm(value: &str) -> Result<RgbwAlgorithm, ConfigError> {
    match value {
        "legacy" => Ok(RgbwAlgorithm::Legacy),
        "advanced" => Ok(RgbwAlgorithm::Advanced),
        other => Err(ConfigError::InvalidValue {
            key: "rgbw_algorithm",
            value: other.to_string(),
        }),
    }
}

fn parse_frame_mode(value: &str) -> Result<FrameMode, ConfigError> {
    match value {
        "none" => Ok(FrameMode::None),
        "average" => Ok(FrameMode::Average),
        "lerp" => Ok(FrameMode::Lerp),
        other => Err(ConfigError::InvalidValue {
            key: "artnet_frame_interpolation",
            value: other.to_string(),
        }),
    }
}

fn parse_spatial_mode(value: &str) -> Result<SpatialMode, ConfigError> {
    match value {
        "none" => Ok(SpatialMode::None),
        "average" => Ok(SpatialMode::Average),
        "lerp" => Ok(SpatialMode::Lerp),
        "gaussian" => Ok(SpatialMode::Gaussian),
        other => Err(ConfigError::InvalidValue {
            key: "artnet_spatial_smoothing",
            value: other.to_string(),
        }),
    }
}

/// Validate a document and produce the immutable render-side view.
///
/// Validation failures leave the caller's previous snapshot untouched, so
/// a rejected configuration never reaches the render loop.
pub fn build_snapshot(
    document: &ConfigDocument,
    led_count: usize,
    target_fps: usize,
) -> Result<RenderSnapshot, ConfigError> {
    if led_count == 0 {
        return Err(ConfigError::ZeroLedCount);
    }

    // Palettes: built-in defaults are always present; document palettes are
    // added on top and must be editable, so at least two stops.
    let mut palettes: HashMap<String, Arc<Palette>> = default_palettes()
        .into_iter()
        .map(|(name, palette)| (name, Arc::new(palette)))
        .collect();
    for (name, stops) in &document.palettes {
        if stops.len() < 2 {
            return Err(ConfigError::PaletteTooSmall(name.clone()));
        }
        let stops = stops.iter().map(|&[h, s, v]| Hsv::new(h, s, v)).collect();
        match Palette::new(stops) {
            Some(palette) => {
                palettes.insert(name.clone(), Arc::new(palette));
            }
            None => return Err(ConfigError::PaletteTooSmall(name.clone())),
        }
    }

    // Patterns: defaults first, then user sources. A source that fails to
    // compile is kept with its error recorded; groups referencing it render
    // black until it is fixed.
    let mut patterns = PatternRegistry::with_defaults();
    for (name, source) in &document.functions {
        if let Err(errors) = patterns.set_source(name, source) {
            warn!("pattern '{name}' failed to compile: {}", errors[0]);
        }
    }

    // Groups, or one whole-strip default when the document defines none.
    let mut groups: Vec<GroupConfig> = Vec::new();
    if document.groups.is_empty() {
        groups.push(GroupConfig {
            name: "main".to_string(),
            range_start: 0,
            range_end: led_count,
            brightness: 1.0,
            saturation: 1.0,
            speed: 1.0,
            scale: 1.0,
            pattern_id: "cycle".to_string(),
            palette_id: "rainbow".to_string(),
            sink_binding: None,
        });
    }
    for (name, record) in &document.groups {
        if record.range_start >= record.range_end || record.range_end > led_count {
            return Err(ConfigError::InvalidRange {
                group: name.clone(),
                start: record.range_start,
                end: record.range_end,
                led_count,
            });
        }
        if !patterns.contains(&record.pattern) {
            return Err(ConfigError::UnknownPattern {
                group: name.clone(),
                pattern: record.pattern.clone(),
            });
        }
        if !palettes.contains_key(&record.palette) {
            return Err(ConfigError::UnknownPalette {
                group: name.clone(),
                palette: record.palette.clone(),
            });
        }
        groups.push(GroupConfig {
            name: name.clone(),
            range_start: record.range_start,
            range_end: record.range_end,
            brightness: record.brightness.clamp(0.0, 1.0),
            saturation: record.saturation.clamp(0.0, 1.0),
            speed: record.speed,
            scale: record.scale,
            pattern_id: record.pattern.clone(),
            palette_id: record.palette.clone(),
            sink_binding: record.sink.clone(),
        });
    }

    // Ranges of distinct groups must not overlap.
    let mut sorted: Vec<&GroupConfig> = groups.iter().collect();
    sorted.sort_by_key(|g| g.range_start);
    for pair in sorted.windows(2) {
        if pair[0].range_end > pair[1].range_start {
            return Err(ConfigError::OverlappingGroups(
                pair[0].name.clone(),
                pair[1].name.clone(),
            ));
        }
    }

    if document.enable_artnet {
        let artnet = artnet_config(document, led_count);
        if artnet.validate().is_err() {
            return Err(ConfigError::ArtNetChannelOverflow);
        }
    }

    let smoothing = SmoothingConfig {
        spatial_mode: parse_spatial_mode(&document.artnet_spatial_smoothing)?,
        spatial_window: document.artnet_spatial_size.max(1),
        frame_mode: parse_frame_mode(&document.artnet_frame_interpolation)?,
        frame_window: document.artnet_frame_interp_size.max(1),
    };

    let globals = GlobalSettings {
        brightness: document.global_brightness.clamp(0.0, 1.0),
        saturation: document.global_saturation.clamp(0.0, 1.0),
        color_temp: document.global_color_temp,
        correction: ChannelCorrection {
            r: f32::from(document.global_color_r) / 255.0,
            g: f32::from(document.global_color_g) / 255.0,
            b: f32::from(document.global_color_b) / 255.0,
        },
        use_white_channel: document.use_white_channel,
        rgbw_algorithm: parse_rgbw_algorithm(&document.rgbw_algorithm)?,
        white_led_temperature: document.white_led_temperature,
        calibration: document.calibration != 0,
        gamma: document.gamma,
        target_fps: target_fps.max(1),
    };

    Ok(RenderSnapshot {
        globals,
        groups,
        palettes,
        patterns: Arc::new(patterns),
        artnet_enabled: document.enable_artnet,
        smoothing,
    })
}

/// ArtNet receiver settings from the document.
pub fn artnet_config(document: &ConfigDocument, led_count: usize) -> ArtNetConfig {
    ArtNetConfig {
        universe: document.artnet_universe,
        channel_offset: document.artnet_channel_offset,
        group_size: document.artnet_group_size.max(1),
        led_count,
        stale_after: Duration::from_secs(5),
    }
}

/// TimeSync settings from the document.
pub fn sync_config(document: &ConfigDocument) -> TimeSyncConfig {
    TimeSyncConfig {
        mode: if !document.enable_sync {
            SyncMode::Off
        } else if document.sync_master_mode {
            SyncMode::Master
        } else {
            SyncMode::Slave
        },
        broadcast_period: Duration::from_secs_f32(document.sync_interval.clamp(0.1, 5.0)),
        master_addr: None,
    }
}
