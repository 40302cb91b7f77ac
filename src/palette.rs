//! Color-stop palettes sampled by continuous position.

use crate::color::{hsv_to_rgb, Hsv, Rgb};

/// An ordered, non-empty list of HSV color stops.
#[derive(Clone, Debug, PartialEq)]
pub struct Palette {
    stops: Vec<Hsv>,
}

impl Palette {
    /// Build a palette from stops. Returns `None` for an empty list.
    pub fn new(stops: Vec<Hsv>) -> Option<Self> {
        if stops.is_empty() {
            None
        } else {
            Some(Self { stops })
        }
    }

    pub fn stops(&self) -> &[Hsv] {
        &self.stops
    }

    /// Sample at `p` reduced modulo 1. With `N` stops the position selects
    /// segment `⌊p·N⌋` and interpolates to the next stop, wrapping from the
    /// last stop back to the first. Hue takes the shortest arc.
    pub fn sample(&self, p: f32) -> Hsv {
        let n = self.stops.len();
        if n == 1 {
            return self.stops[0];
        }
        let p = p.rem_euclid(1.0);
        let scaled = p * n as f32;
        let segment = (scaled as usize).min(n - 1);
        let f = scaled - segment as f32;
        let a = self.stops[segment];
        let b = self.stops[(segment + 1) % n];

        let mut dh = b.h - a.h;
        if dh > 0.5 {
            dh -= 1.0;
        } else if dh < -0.5 {
            dh += 1.0;
        }
        Hsv::new(
            (a.h + dh * f).rem_euclid(1.0),
            a.s + (b.s - a.s) * f,
            a.v + (b.v - a.v) * f,
        )
    }

    /// Sample in RGB space across the stop list without wraparound: `p` is
    /// reduced modulo 1, spread over the `N−1` segments, and the converted
    /// stops are mixed componentwise. This is the sampler legacy pattern
    /// sources rely on for linear ramps between endpoints.
    pub fn sample_rgb(&self, p: f32) -> Rgb {
        let n = self.stops.len();
        if n == 1 {
            return hsv_to_rgb(self.stops[0]);
        }
        let p = p.rem_euclid(1.0);
        let scaled = p * (n - 1) as f32;
        let segment = (scaled as usize).min(n - 2);
        let f = scaled - segment as f32;
        let a = hsv_to_rgb(self.stops[segment]);
        let b = hsv_to_rgb(self.stops[segment + 1]);
        a.lerp(b, f)
    }
}

/// Built-in palettes available without any configuration.
pub fn default_palettes() -> Vec<(String, Palette)> {
    let rainbow = Palette::new(
        (0..6)
            .map(|i| Hsv::new(i as f32 / 6.0, 1.0, 1.0))
            .collect(),
    );
    let sunset = Palette::new(vec![
        Hsv::new(0.0, 1.0, 1.0),
        Hsv::new(0.05, 0.9, 1.0),
        Hsv::new(0.11, 0.8, 0.9),
        Hsv::new(0.8, 0.6, 0.5),
    ]);
    let ocean = Palette::new(vec![
        Hsv::new(0.5, 1.0, 0.8),
        Hsv::new(0.58, 0.9, 1.0),
        Hsv::new(0.66, 1.0, 0.6),
    ]);
    [("rainbow", rainbow), ("sunset", sunset), ("ocean", ocean)]
        .into_iter()
        .filter_map(|(name, p)| p.map(|p| (name.to_string(), p)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_stop() -> Palette {
        Palette::new(vec![Hsv::new(0.0, 1.0, 1.0), Hsv::new(0.33, 1.0, 1.0)]).unwrap()
    }

    #[test]
    fn rejects_empty() {
        assert!(Palette::new(vec![]).is_none());
    }

    #[test]
    fn sample_at_zero_is_stop_zero() {
        let palette = two_stop();
        assert_eq!(palette.sample(0.0), Hsv::new(0.0, 1.0, 1.0));
    }

    #[test]
    fn sample_near_stop_stays_near() {
        let palette = two_stop();
        let eps = 1e-3;
        // Position (k+ε)/N lands just past stop k.
        let near = palette.sample((1.0 + eps) / 2.0);
        assert!((near.h - 0.33).abs() < eps);
    }

    #[test]
    fn sample_wraps_last_to_first() {
        let palette = two_stop();
        // Second half of the cycle interpolates back towards stop 0.
        let mid = palette.sample(0.75);
        assert!((mid.h - 0.165).abs() < 1e-5);
        // And the position wraps modulo 1.
        let wrapped = palette.sample(1.75);
        assert!((wrapped.h - mid.h).abs() < 1e-6);
    }

    #[test]
    fn hue_takes_shortest_arc() {
        let palette =
            Palette::new(vec![Hsv::new(0.95, 1.0, 1.0), Hsv::new(0.05, 1.0, 1.0)]).unwrap();
        // Crossing the hue wrap point goes through 0, not through 0.5.
        let mid = palette.sample(0.25);
        assert!(mid.h > 0.9 || mid.h < 0.1, "went the long way: {}", mid.h);
    }

    #[test]
    fn rgb_sampler_is_linear_between_endpoints() {
        let palette = two_stop();
        let q = palette.sample_rgb(0.25);
        // Red to green, one quarter in.
        assert!((q.r - 0.75).abs() < 1e-5);
        assert!((q.g - 0.25).abs() < 1e-5);
        assert!(q.b.abs() < 1e-6);
        // Endpoint reached without wrapping back.
        let end = palette.sample_rgb(0.999_999);
        assert!(end.g > 0.99);
    }

    #[test]
    fn default_palettes_present() {
        let names: Vec<String> = default_palettes().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"rainbow".to_string()));
        assert!(names.len() >= 3);
    }
}
