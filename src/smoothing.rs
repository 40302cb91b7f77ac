//! Temporal and spatial smoothing for externally sourced frame streams.
//!
//! Both stages are deterministic functions of the input frame, the history
//! ring and the parameters. Buffers are sized once at configuration time;
//! the steady state does not allocate.

use crate::{color::Rgbw, frame::Frame};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SpatialMode {
    #[default]
    None,
    Average,
    Lerp,
    Gaussian,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameMode {
    #[default]
    None,
    Average,
    Lerp,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SmoothingConfig {
    pub spatial_mode: SpatialMode,
    pub spatial_window: usize,
    pub frame_mode: FrameMode,
    pub frame_window: usize,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            spatial_mode: SpatialMode::None,
            spatial_window: 1,
            frame_mode: FrameMode::None,
            frame_window: 1,
        }
    }
}

/// Build the spatial kernel for the mode. The window is forced odd; the
/// weights sum to 1.
fn build_kernel(mode: SpatialMode, window: usize) -> Vec<f32> {
    let window = window.max(1);
    let window = if window % 2 == 0 { window + 1 } else { window };
    let half = (window / 2) as isize;
    let weights: Vec<f32> = match mode {
        SpatialMode::None => vec![1.0],
        SpatialMode::Average => vec![1.0; window],
        SpatialMode::Lerp => (-half..=half)
            .map(|d| (half + 1 - d.abs()) as f32)
            .collect(),
        SpatialMode::Gaussian => {
            let sigma = (window as f32 / 4.0).max(1.0);
            (-half..=half)
                .map(|d| (-((d * d) as f32) / (2.0 * sigma * sigma)).exp())
                .collect()
        }
    };
    let sum: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / sum).collect()
}

/// Composable temporal + spatial smoother over a frame stream.
pub struct SmoothingFilter {
    config: SmoothingConfig,
    kernel: Vec<f32>,
    /// Ring of the most recent input frames, newest last.
    ring: Vec<Frame>,
    ring_len: usize,
    ring_head: usize,
    scratch: Frame,
}

impl SmoothingFilter {
    pub fn new(config: SmoothingConfig, led_count: usize) -> Self {
        let frame_window = config.frame_window.max(1);
        Self {
            kernel: build_kernel(config.spatial_mode, config.spatial_window),
            ring: (0..frame_window).map(|_| Frame::new(led_count)).collect(),
            ring_len: 0,
            ring_head: 0,
            scratch: Frame::new(led_count),
            config,
        }
    }

    pub fn config(&self) -> &SmoothingConfig {
        &self.config
    }

    /// Apply both stages to `input`, writing the result into `out`.
    pub fn apply(&mut self, input: &Frame, out: &mut Frame) {
        self.push(input);
        self.temporal(input);
        self.spatial(out);
    }

    fn push(&mut self, input: &Frame) {
        let capacity = self.ring.len();
        let slot = (self.ring_head + self.ring_len) % capacity;
        self.ring[slot].pixels_mut().copy_from_slice(input.pixels());
        if self.ring_len < capacity {
            self.ring_len += 1;
        } else {
            self.ring_head = (self.ring_head + 1) % capacity;
        }
    }

    /// Temporal stage into the scratch frame. The ring already contains the
    /// current input as its newest entry.
    fn temporal(&mut self, input: &Frame) {
        let Self {
            config,
            ring,
            ring_len,
            ring_head,
            scratch,
            ..
        } = self;
        match config.frame_mode {
            FrameMode::None => {
                scratch.pixels_mut().copy_from_slice(input.pixels());
            }
            FrameMode::Average => {
                let count = (*ring_len).max(1) as f32;
                let scratch = scratch.pixels_mut();
                scratch.fill(Rgbw::BLACK);
                for i in 0..*ring_len {
                    let frame = &ring[(*ring_head + i) % ring.len()];
                    for (acc, px) in scratch.iter_mut().zip(frame.pixels()) {
                        acc.r += px.r;
                        acc.g += px.g;
                        acc.b += px.b;
                        acc.w += px.w;
                    }
                }
                for acc in scratch.iter_mut() {
                    acc.r /= count;
                    acc.g /= count;
                    acc.b /= count;
                    acc.w /= count;
                }
            }
            FrameMode::Lerp => {
                let alpha = 1.0 / config.frame_window.max(1) as f32;
                let oldest = &ring[*ring_head];
                for ((dst, old), cur) in scratch
                    .pixels_mut()
                    .iter_mut()
                    .zip(oldest.pixels())
                    .zip(input.pixels())
                {
                    dst.r = old.r + (cur.r - old.r) * alpha;
                    dst.g = old.g + (cur.g - old.g) * alpha;
                    dst.b = old.b + (cur.b - old.b) * alpha;
                    dst.w = old.w + (cur.w - old.w) * alpha;
                }
            }
        }
    }

    /// Spatial stage from the scratch frame into `out`. Kernel taps that
    /// fall outside the strip are dropped and the remaining weights are
    /// renormalized.
    fn spatial(&mut self, out: &mut Frame) {
        let src = self.scratch.pixels();
        let dst = out.pixels_mut();
        if self.kernel.len() == 1 {
            dst.copy_from_slice(src);
            return;
        }
        let half = (self.kernel.len() / 2) as isize;
        let len = src.len() as isize;
        for (i, dst_px) in dst.iter_mut().enumerate() {
            let mut acc = Rgbw::BLACK;
            let mut weight = 0.0;
            for (k, &kw) in self.kernel.iter().enumerate() {
                let j = i as isize + k as isize - half;
                if j < 0 || j >= len {
                    continue;
                }
                let px = src[j as usize];
                acc.r += px.r * kw;
                acc.g += px.g * kw;
                acc.b += px.b * kw;
                acc.w += px.w * kw;
                weight += kw;
            }
            if weight > 0.0 {
                acc.r /= weight;
                acc.g /= weight;
                acc.b /= weight;
                acc.w /= weight;
            }
            *dst_px = acc;
        }
    }
}
