//! Color primitives shared by the pattern evaluator and the output pipeline.
//!
//! All channels are normalized floats in `[0, 1]`; conversion to 8-bit
//! happens at the very end of the pipeline (see [`crate::frame`]).

/// An RGB color with normalized float channels.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Rgb {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

/// An RGBW color with normalized float channels.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Rgbw {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub w: f32,
}

/// An HSV color. Hue wraps on `[0, 1)`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Hsv {
    pub h: f32,
    pub s: f32,
    pub v: f32,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb {
        r: 0.0,
        g: 0.0,
        b: 0.0,
    };

    pub const fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    pub fn clamped(self) -> Self {
        Self {
            r: self.r.clamp(0.0, 1.0),
            g: self.g.clamp(0.0, 1.0),
            b: self.b.clamp(0.0, 1.0),
        }
    }

    pub fn scaled(self, factor: f32) -> Self {
        Self {
            r: self.r * factor,
            g: self.g * factor,
            b: self.b * factor,
        }
    }

    pub fn max_channel(self) -> f32 {
        self.r.max(self.g).max(self.b)
    }

    pub fn min_channel(self) -> f32 {
        self.r.min(self.g).min(self.b)
    }

    /// Scale chroma towards the neutral axis. `saturation` of 1 is identity,
    /// 0 collapses the color to gray at its value.
    pub fn saturate(self, saturation: f32) -> Self {
        let mut hsv = rgb_to_hsv(self);
        hsv.s *= saturation.clamp(0.0, 1.0);
        hsv_to_rgb(hsv)
    }

    pub fn lerp(self, other: Rgb, f: f32) -> Rgb {
        Rgb {
            r: self.r + (other.r - self.r) * f,
            g: self.g + (other.g - self.g) * f,
            b: self.b + (other.b - self.b) * f,
        }
    }
}

impl Rgbw {
    pub const BLACK: Rgbw = Rgbw {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        w: 0.0,
    };

    pub const fn new(r: f32, g: f32, b: f32, w: f32) -> Self {
        Self { r, g, b, w }
    }

    pub const fn from_rgb(rgb: Rgb) -> Self {
        Self {
            r: rgb.r,
            g: rgb.g,
            b: rgb.b,
            w: 0.0,
        }
    }

    pub const fn rgb(self) -> Rgb {
        Rgb {
            r: self.r,
            g: self.g,
            b: self.b,
        }
    }
}

impl Hsv {
    pub const fn new(h: f32, s: f32, v: f32) -> Self {
        Self { h, s, v }
    }
}

/// Standard piecewise HSV to RGB conversion. Hue wraps on `[0, 1)`.
pub fn hsv_to_rgb(hsv: Hsv) -> Rgb {
    let h = hsv.h.rem_euclid(1.0) * 6.0;
    let s = hsv.s.clamp(0.0, 1.0);
    let v = hsv.v.clamp(0.0, 1.0);
    let c = v * s;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    Rgb::new(r + m, g + m, b + m)
}

/// Inverse of [`hsv_to_rgb`]. Achromatic inputs report hue 0.
pub fn rgb_to_hsv(rgb: Rgb) -> Hsv {
    let max = rgb.max_channel();
    let min = rgb.min_channel();
    let delta = max - min;

    let h = if delta <= f32::EPSILON {
        0.0
    } else if max == rgb.r {
        ((rgb.g - rgb.b) / delta).rem_euclid(6.0) / 6.0
    } else if max == rgb.g {
        ((rgb.b - rgb.r) / delta + 2.0) / 6.0
    } else {
        ((rgb.r - rgb.g) / delta + 4.0) / 6.0
    };
    let s = if max <= f32::EPSILON { 0.0 } else { delta / max };
    Hsv::new(h, s, max)
}

/// Color temperature in Kelvin to normalized RGB using the Tanner-Helland
/// piecewise curves, rescaled so the peak channel is exactly 1.
///
/// Zero or negative temperatures yield neutral white.
pub fn blackbody(kelvin: f32) -> Rgb {
    if kelvin <= 0.0 {
        return Rgb::new(1.0, 1.0, 1.0);
    }
    let temp = (kelvin / 100.0).clamp(10.0, 400.0);

    let red = if temp <= 66.0 {
        255.0
    } else {
        (329.698_727_446 * (temp - 60.0).powf(-0.133_204_759_2)).clamp(0.0, 255.0)
    };

    let green = if temp <= 66.0 {
        99.470_802_586_1 * temp.ln() - 161.119_568_166_1
    } else {
        288.122_169_528_3 * (temp - 60.0).powf(-0.075_514_849_2)
    }
    .clamp(0.0, 255.0);

    let blue = if temp >= 66.0 {
        255.0
    } else if temp <= 19.0 {
        0.0
    } else {
        (138.517_731_223_1 * (temp - 10.0).ln() - 305.044_792_730_7).clamp(0.0, 255.0)
    };

    let rgb = Rgb::new(red / 255.0, green / 255.0, blue / 255.0);
    let max = rgb.max_channel();
    if max <= f32::EPSILON {
        Rgb::new(1.0, 1.0, 1.0)
    } else {
        rgb.scaled(1.0 / max)
    }
}

/// Per-channel power-curve gamma correction.
#[derive(Clone, Copy, Debug)]
pub struct Gamma {
    exponent: f32,
}

impl Gamma {
    pub fn new(exponent: f32) -> Self {
        Self {
            exponent: if exponent > 0.0 { exponent } else { 1.0 },
        }
    }

    pub fn apply(&self, value: f32) -> f32 {
        value.clamp(0.0, 1.0).powf(self.exponent)
    }

    pub fn apply_rgbw(&self, p: Rgbw) -> Rgbw {
        Rgbw::new(
            self.apply(p.r),
            self.apply(p.g),
            self.apply(p.b),
            self.apply(p.w),
        )
    }
}

impl Default for Gamma {
    fn default() -> Self {
        Self::new(2.2)
    }
}

/// Calibration gain triple multiplied into RGB before gamma.
#[derive(Clone, Copy, Debug)]
pub struct ChannelCorrection {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl ChannelCorrection {
    pub const IDENTITY: ChannelCorrection = ChannelCorrection {
        r: 1.0,
        g: 1.0,
        b: 1.0,
    };

    pub fn apply(&self, p: Rgbw) -> Rgbw {
        Rgbw::new(p.r * self.r, p.g * self.g, p.b * self.b, p.w)
    }
}

impl Default for ChannelCorrection {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// White extraction mode, see [`rgb_to_rgbw`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RgbwAlgorithm {
    #[default]
    Legacy,
    Advanced,
}

/// Inputs to the advanced extraction that are fixed for a whole frame.
#[derive(Clone, Copy, Debug)]
pub struct WhiteExtraction {
    pub algorithm: RgbwAlgorithm,
    pub saturation: f32,
    /// Normalized RGB of the configured target color temperature.
    pub target: Rgb,
    /// Normalized RGB of the hardware white LED's own temperature.
    pub white_led: Rgb,
}

impl WhiteExtraction {
    pub fn new(algorithm: RgbwAlgorithm, saturation: f32, target_temp: f32, white_temp: f32) -> Self {
        Self {
            algorithm,
            saturation: saturation.clamp(0.0, 1.0),
            target: blackbody(target_temp),
            white_led: blackbody(white_temp),
        }
    }
}

/// Convert RGB to RGBW according to the configured extraction mode.
pub fn rgb_to_rgbw(rgb: Rgb, extraction: &WhiteExtraction) -> Rgbw {
    match extraction.algorithm {
        RgbwAlgorithm::Legacy => rgbw_legacy(rgb, 1.0),
        RgbwAlgorithm::Advanced => rgbw_advanced(rgb, extraction),
    }
}

/// Desaturation extraction: the white channel takes the common gray
/// component out of RGB.
pub fn rgbw_legacy(rgb: Rgb, white_gain: f32) -> Rgbw {
    let w = rgb.min_channel() * white_gain;
    Rgbw::new(
        (rgb.r - w).clamp(0.0, 1.0),
        (rgb.g - w).clamp(0.0, 1.0),
        (rgb.b - w).clamp(0.0, 1.0),
        w.clamp(0.0, 1.0),
    )
}

/// Temperature-aware extraction. Splits the input into a chroma component
/// and a neutral strength, renders the neutral part at the target
/// temperature, then pulls as much of it as possible out of the (tinted)
/// hardware white LED.
pub fn rgbw_advanced(rgb: Rgb, extraction: &WhiteExtraction) -> Rgbw {
    let max = rgb.max_channel();
    if max <= 0.0 {
        return Rgbw::BLACK;
    }
    let min = rgb.min_channel();
    let chroma = max - min;
    let sat = extraction.saturation;

    let c = Rgb::new(rgb.r - min, rgb.g - min, rgb.b - min).scaled(sat);
    let neutral = min + (1.0 - sat) * chroma;

    let t = extraction.target;
    let desired = Rgb::new(
        c.r + neutral * t.r,
        c.g + neutral * t.g,
        c.b + neutral * t.b,
    );

    let wl = extraction.white_led;
    let mut w = f32::INFINITY;
    for (d, ch) in [(desired.r, wl.r), (desired.g, wl.g), (desired.b, wl.b)] {
        if ch > 0.0 {
            w = w.min(d / ch);
        }
    }
    if !w.is_finite() {
        w = 0.0;
    }
    let w = w.clamp(0.0, neutral);

    Rgbw::new(
        (desired.r - w * wl.r).max(0.0),
        (desired.g - w * wl.g).max(0.0),
        (desired.b - w * wl.b).max(0.0),
        w,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f32, b: f32, eps: f32) {
        assert!((a - b).abs() <= eps, "{a} != {b} (eps {eps})");
    }

    #[test]
    fn hsv_primaries() {
        assert_eq!(hsv_to_rgb(Hsv::new(0.0, 1.0, 1.0)), Rgb::new(1.0, 0.0, 0.0));
        let green = hsv_to_rgb(Hsv::new(1.0 / 3.0, 1.0, 1.0));
        assert_close(green.g, 1.0, 1e-6);
        assert_close(green.r, 0.0, 1e-6);
        let blue = hsv_to_rgb(Hsv::new(2.0 / 3.0, 1.0, 1.0));
        assert_close(blue.b, 1.0, 1e-6);
    }

    #[test]
    fn hsv_hue_wraps() {
        let a = hsv_to_rgb(Hsv::new(0.25, 1.0, 1.0));
        let b = hsv_to_rgb(Hsv::new(1.25, 1.0, 1.0));
        assert_close(a.r, b.r, 1e-6);
        assert_close(a.g, b.g, 1e-6);
        assert_close(a.b, b.b, 1e-6);
    }

    #[test]
    fn hsv_round_trip() {
        for &rgb in &[
            Rgb::new(0.8, 0.2, 0.1),
            Rgb::new(0.0, 0.5, 0.5),
            Rgb::new(0.3, 0.3, 0.9),
        ] {
            let back = hsv_to_rgb(rgb_to_hsv(rgb));
            assert_close(back.r, rgb.r, 1e-5);
            assert_close(back.g, rgb.g, 1e-5);
            assert_close(back.b, rgb.b, 1e-5);
        }
    }

    #[test]
    fn blackbody_is_peak_normalized() {
        for kelvin in [1500.0, 2700.0, 5000.0, 6500.0, 10000.0] {
            let rgb = blackbody(kelvin);
            assert_close(rgb.max_channel(), 1.0, 1e-6);
        }
        assert_eq!(blackbody(0.0), Rgb::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn blackbody_warm_is_red_heavy() {
        let warm = blackbody(2000.0);
        assert!(warm.r > warm.g && warm.g > warm.b);
        let cool = blackbody(10000.0);
        assert!(cool.b >= cool.r);
    }

    #[test]
    fn legacy_extraction_removes_gray() {
        let out = rgbw_legacy(Rgb::new(1.0, 0.5, 0.25), 1.0);
        assert_close(out.w, 0.25, 1e-6);
        assert_close(out.r, 0.75, 1e-6);
        assert_close(out.g, 0.25, 1e-6);
        assert_close(out.b, 0.0, 1e-6);
    }

    #[test]
    fn advanced_extraction_zero_white_for_pure_chroma() {
        // With full saturation there is no neutral component to extract.
        let extraction = WhiteExtraction::new(RgbwAlgorithm::Advanced, 1.0, 6500.0, 5000.0);
        for &rgb in &[
            Rgb::new(1.0, 0.0, 0.0),
            Rgb::new(0.0, 1.0, 0.5),
            Rgb::new(0.7, 0.3, 0.0),
        ] {
            let out = rgbw_advanced(rgb, &extraction);
            assert_close(out.w, 0.0, 1e-6);
        }
    }

    #[test]
    fn advanced_extraction_round_trip() {
        // Residual RGB plus the white LED's spectrum reconstructs the
        // desired linear light.
        let extraction = WhiteExtraction::new(RgbwAlgorithm::Advanced, 1.0, 6500.0, 5000.0);
        let rgb = Rgb::new(0.9, 0.7, 0.5);
        let out = rgbw_advanced(rgb, &extraction);

        let min = rgb.min_channel();
        let desired = Rgb::new(rgb.r - min, rgb.g - min, rgb.b - min);
        let neutral_part = min;
        let t = extraction.target;
        let expect = Rgb::new(
            desired.r + neutral_part * t.r,
            desired.g + neutral_part * t.g,
            desired.b + neutral_part * t.b,
        );

        let wl = extraction.white_led;
        assert_close(out.r + out.w * wl.r, expect.r, 1.0 / 255.0);
        assert_close(out.g + out.w * wl.g, expect.g, 1.0 / 255.0);
        assert_close(out.b + out.w * wl.b, expect.b, 1.0 / 255.0);
    }

    #[test]
    fn advanced_beats_legacy_brightness_on_white() {
        let extraction = WhiteExtraction::new(RgbwAlgorithm::Advanced, 1.0, 6500.0, 5000.0);
        let white = Rgb::new(1.0, 1.0, 1.0);
        let advanced = rgbw_advanced(white, &extraction);
        let legacy = rgbw_legacy(white, 1.0);
        let sum = |p: Rgbw| p.r + p.g + p.b + p.w;
        assert!(sum(advanced) > sum(legacy));
    }

    #[test]
    fn gamma_endpoints_fixed() {
        let gamma = Gamma::default();
        assert_close(gamma.apply(0.0), 0.0, 1e-9);
        assert_close(gamma.apply(1.0), 1.0, 1e-9);
        assert!(gamma.apply(0.5) < 0.5);
    }
}
