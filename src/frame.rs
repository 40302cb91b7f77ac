//! Frame buffers and their 8-bit wire encoding.

use std::{error::Error, str::FromStr};

use crate::color::{Rgb, Rgbw};

/// Channel order on the wire. Strips differ in how they expect the three
/// or four color bytes per pixel; the white byte, when present, always
/// trails the permuted RGB bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Rbg,
    Grb,
    Gbr,
    Brg,
    Bgr,
    Rgbw,
    Rbgw,
    Grbw,
    Gbrw,
    Brgw,
    Bgrw,
}

impl FromStr for ChannelOrder {
    type Err = Box<dyn Error>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let order = match s.to_uppercase().as_str() {
            "RGB" => Self::Rgb,
            "RBG" => Self::Rbg,
            "GRB" => Self::Grb,
            "GBR" => Self::Gbr,
            "BRG" => Self::Brg,
            "BGR" => Self::Bgr,
            "RGBW" => Self::Rgbw,
            "RBGW" => Self::Rbgw,
            "GRBW" => Self::Grbw,
            "GBRW" => Self::Gbrw,
            "BRGW" => Self::Brgw,
            "BGRW" => Self::Bgrw,
            other => return Err(format!("Invalid pixel order: {other}").into()),
        };
        Ok(order)
    }
}

impl ChannelOrder {
    pub const fn has_white(self) -> bool {
        matches!(
            self,
            Self::Rgbw | Self::Rbgw | Self::Grbw | Self::Gbrw | Self::Brgw | Self::Bgrw
        )
    }

    pub const fn bytes_per_pixel(self) -> usize {
        if self.has_white() {
            4
        } else {
            3
        }
    }

    /// Indices into `[r, g, b]` for the three leading wire bytes.
    const fn rgb_permutation(self) -> [usize; 3] {
        match self {
            Self::Rgb | Self::Rgbw => [0, 1, 2],
            Self::Rbg | Self::Rbgw => [0, 2, 1],
            Self::Grb | Self::Grbw => [1, 0, 2],
            Self::Gbr | Self::Gbrw => [1, 2, 0],
            Self::Brg | Self::Brgw => [2, 0, 1],
            Self::Bgr | Self::Bgrw => [2, 1, 0],
        }
    }
}

/// Quantize a normalized channel to 8 bits.
pub fn quantize(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// A dense vector of pixels covering the whole strip for one tick. The
/// length is fixed for the lifetime of a configured strip.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pixels: Vec<Rgbw>,
}

impl Frame {
    pub fn new(led_count: usize) -> Self {
        Self {
            pixels: vec![Rgbw::BLACK; led_count],
        }
    }

    pub fn from_pixels(pixels: Vec<Rgbw>) -> Self {
        Self { pixels }
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn pixels(&self) -> &[Rgbw] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [Rgbw] {
        &mut self.pixels
    }

    pub fn clear(&mut self) {
        self.pixels.fill(Rgbw::BLACK);
    }

    pub fn fill_rgb(&mut self, rgb: Rgb) {
        self.pixels.fill(Rgbw::from_rgb(rgb));
    }

    /// Copy group output into the frame starting at `start`. Writes beyond
    /// the frame length are discarded.
    pub fn write_rgb(&mut self, start: usize, colors: &[Rgb]) {
        for (offset, &color) in colors.iter().enumerate() {
            if let Some(pixel) = self.pixels.get_mut(start + offset) {
                *pixel = Rgbw::from_rgb(color);
            }
        }
    }

    /// Encode the frame into wire bytes in the given channel order,
    /// quantizing each channel to 8 bits. The output buffer is reused
    /// between ticks.
    pub fn encode(&self, order: ChannelOrder, out: &mut Vec<u8>) {
        out.clear();
        out.reserve(self.pixels.len() * order.bytes_per_pixel());
        let perm = order.rgb_permutation();
        for pixel in &self.pixels {
            let rgb = [quantize(pixel.r), quantize(pixel.g), quantize(pixel.b)];
            out.push(rgb[perm[0]]);
            out.push(rgb[perm[1]]);
            out.push(rgb[perm[2]]);
            if order.has_white() {
                out.push(quantize(pixel.w));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_clamps_and_rounds() {
        assert_eq!(quantize(-1.0), 0);
        assert_eq!(quantize(0.0), 0);
        assert_eq!(quantize(1.0), 255);
        assert_eq!(quantize(2.0), 255);
        assert_eq!(quantize(0.5), 128);
    }

    #[test]
    fn channel_order_round_trips_names() {
        for name in ["RGB", "GRB", "RGBW", "GRBW", "bgr"] {
            assert!(ChannelOrder::from_str(name).is_ok(), "{name}");
        }
        assert!(ChannelOrder::from_str("RWB").is_err());
    }

    #[test]
    fn encode_permutes_channels() {
        let mut frame = Frame::new(1);
        frame.pixels_mut()[0] = Rgbw::new(1.0, 0.5, 0.0, 0.25);

        let mut out = Vec::new();
        frame.encode(ChannelOrder::Grb, &mut out);
        assert_eq!(out, vec![128, 255, 0]);

        frame.encode(ChannelOrder::Grbw, &mut out);
        assert_eq!(out, vec![128, 255, 0, 64]);
    }

    #[test]
    fn write_rgb_ignores_out_of_range() {
        let mut frame = Frame::new(2);
        frame.write_rgb(1, &[Rgb::new(1.0, 0.0, 0.0), Rgb::new(0.0, 1.0, 0.0)]);
        assert_eq!(frame.pixels()[0], Rgbw::BLACK);
        assert_eq!(frame.pixels()[1].r, 1.0);
    }

    #[test]
    fn out_of_range_channels_are_clamped() {
        let mut frame = Frame::new(3);
        frame.pixels_mut()[0] = Rgbw::new(5.0, -3.0, 0.7, 1.5);
        let mut out = Vec::new();
        frame.encode(ChannelOrder::Rgbw, &mut out);
        assert_eq!(out[0], 255);
        assert_eq!(out[1], 0);
        assert_eq!(out[3], 255);
    }
}
