pub mod artnet;
pub mod color;
pub mod config;
pub mod frame;
pub mod group;
pub mod mapper;
pub mod noise;
pub mod palette;
pub mod pattern;
pub mod pool;
pub mod render;
pub mod sink;
pub mod smoothing;
pub mod stats;
pub mod timesync;
pub mod utils;
pub mod waveform;

pub use config::{ConfigDocument, StripConfig};
pub use frame::{ChannelOrder, Frame};
pub use render::Controller;
pub use stats::Stats;
