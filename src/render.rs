//! The fixed-rate render loop.
//!
//! A single render thread owns the frame buffers. Per tick it reads the
//! shared animation time, snapshots the configuration, fans group
//! evaluation out to the worker pool, overlays DMX input, runs the global
//! color pipeline and posts the encoded bytes to every sink worker.

use std::{
    sync::{
        atomic::Ordering,
        mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc,
    },
    thread::{available_parallelism, spawn, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, warn};
use thread_priority::{set_current_thread_priority, ThreadPriority};

use crate::{
    artnet::ArtNetHandle,
    color::{rgb_to_rgbw, Gamma, Rgb, Rgbw, WhiteExtraction},
    config::{GlobalSettings, RenderSnapshot},
    frame::{ChannelOrder, Frame},
    group::{self, GroupError},
    mapper::StripMapper,
    pool::WorkerPool,
    sink::{FramePayload, SinkWorker},
    smoothing::SmoothingFilter,
    stats::Stats,
    timesync::TimeSyncHandle,
    utils::{pin_to_core, sleep_out_tick, FrameRateMonitor, Mailbox},
};

/// Fraction of the tick period available to group evaluation.
const GROUP_BUDGET: f64 = 0.8;

fn initialize_render_thread() {
    // Pin the thread to the last core to keep the cadence clear of the
    // receiver and sink threads.
    let num_cores = available_parallelism().map(|n| n.get()).unwrap_or(1);
    if num_cores > 1 {
        if let Err(e) = pin_to_core(num_cores - 1) {
            warn!("Could not pin the render thread to core {}: {e}", num_cores - 1);
        }
    }

    if set_current_thread_priority(ThreadPriority::Max).is_err() {
        warn!("Could not set thread priority. This might lead to reduced performance.");
    }
}

/// Handle to the running render loop. Dropping it shuts the loop down and
/// joins the thread.
pub struct Controller {
    /// The join handle of the render thread.
    thread_handle: Option<JoinHandle<()>>,
    /// Sender for the shutdown signal.
    shutdown_sender: Sender<()>,
    /// Pending configuration snapshot, applied at the next tick boundary.
    snapshot_mailbox: Arc<Mailbox<Arc<RenderSnapshot>>>,
    stats: Arc<Stats>,
}

impl Controller {
    /// Start the render thread with an initial configuration view.
    pub fn start(
        initial: Arc<RenderSnapshot>,
        led_count: usize,
        order: ChannelOrder,
        sinks: Vec<Arc<SinkWorker>>,
        artnet: Option<ArtNetHandle>,
        time: TimeSyncHandle,
        stats: Arc<Stats>,
    ) -> Self {
        let snapshot_mailbox: Arc<Mailbox<Arc<RenderSnapshot>>> = Arc::new(Mailbox::new());
        let (shutdown_sender, shutdown_receiver) = channel::<()>();

        let thread_handle = {
            let snapshot_mailbox = Arc::clone(&snapshot_mailbox);
            let stats = Arc::clone(&stats);
            spawn(move || {
                initialize_render_thread();
                render_loop(
                    initial,
                    led_count,
                    order,
                    &sinks,
                    artnet.as_ref(),
                    &time,
                    &stats,
                    &snapshot_mailbox,
                    &shutdown_receiver,
                );
            })
        };

        Self {
            thread_handle: Some(thread_handle),
            shutdown_sender,
            snapshot_mailbox,
            stats,
        }
    }

    /// Queue a validated configuration snapshot. It becomes visible to the
    /// loop at the next tick boundary, never mid-frame; posting twice
    /// between ticks keeps only the newest.
    pub fn update_config(&self, snapshot: Arc<RenderSnapshot>) {
        self.snapshot_mailbox.post(snapshot);
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        let Self {
            thread_handle,
            shutdown_sender,
            ..
        } = self;
        if let Some(handle) = thread_handle.take() {
            shutdown_sender.send(()).ok();
            let _result = handle.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn render_loop(
    initial: Arc<RenderSnapshot>,
    led_count: usize,
    order: ChannelOrder,
    sinks: &[Arc<SinkWorker>],
    artnet: Option<&ArtNetHandle>,
    time: &TimeSyncHandle,
    stats: &Arc<Stats>,
    snapshot_mailbox: &Mailbox<Arc<RenderSnapshot>>,
    shutdown_receiver: &Receiver<()>,
) {
    let pool = WorkerPool::with_default_size();
    let mapper = StripMapper::new(led_count);
    let mut snapshot = initial;
    let mut smoother = SmoothingFilter::new(snapshot.smoothing, led_count);
    let mut frame = Frame::new(led_count);
    let mut smoothed = Frame::new(led_count);
    let mut encoded: Vec<u8> = Vec::new();
    let mut frame_rate_monitor = FrameRateMonitor::new(snapshot.globals.target_fps);
    let mut next_deadline = Instant::now();

    'thread: loop {
        // Try to receive a shutdown request.
        if shutdown_receiver.try_recv() != Err(TryRecvError::Empty) {
            break 'thread;
        }

        // Pending configuration becomes visible here, atomically.
        if let Some(new_snapshot) = snapshot_mailbox.take() {
            if new_snapshot.smoothing != *smoother.config() {
                smoother = SmoothingFilter::new(new_snapshot.smoothing, led_count);
            }
            if new_snapshot.globals.target_fps != snapshot.globals.target_fps {
                frame_rate_monitor = FrameRateMonitor::new(new_snapshot.globals.target_fps);
            }
            snapshot = new_snapshot;
        }

        let period = Duration::from_secs_f64(1.0 / snapshot.globals.target_fps.max(1) as f64);
        let tick_start = Instant::now();
        let anim_time = time.anim_time();

        let mut external_white_leds = 0;
        if snapshot.globals.calibration {
            // Flat neutral white so the operator can tune the gain triple.
            frame.fill_rgb(Rgb::new(1.0, 1.0, 1.0));
        } else {
            frame.clear();
            evaluate_groups(
                &pool,
                &snapshot,
                &mapper,
                anim_time,
                tick_start,
                period,
                &mut frame,
                stats,
            );
            if snapshot.artnet_enabled {
                external_white_leds =
                    overlay_artnet(artnet, &mut smoother, &mut smoothed, &mut frame);
            }
        }

        run_pipeline(&mut frame, &snapshot.globals, external_white_leds);

        let ticks = stats.ticks_total.fetch_add(1, Ordering::Relaxed);
        dispatch(&frame, order, ticks as u32, &snapshot, sinks, &mut encoded, stats);

        frame_rate_monitor.tick();
        stats.set_fps(frame_rate_monitor.fps());

        // Sleep out the rest of the tick; when we blow past the deadline,
        // skip to the next aligned slot instead of catching up.
        next_deadline += period;
        let now = Instant::now();
        if now > next_deadline {
            stats.overruns_total.fetch_add(1, Ordering::Relaxed);
            while next_deadline < now {
                next_deadline += period;
            }
        } else {
            sleep_out_tick(next_deadline - now, period);
        }
    }

    // Turn it off.
    frame.clear();
    frame.encode(order, &mut encoded);
    let seq = stats.ticks_total.load(Ordering::Relaxed) as u32;
    for sink in sinks {
        sink.post(FramePayload {
            seq,
            offset: 0,
            bytes: encoded.clone(),
        });
    }
}

/// Overlay the latest DMX input over the LEDs its channel data covers,
/// smoothed. Returns the number of leading LEDs replaced; the rest of the
/// frame keeps its pattern output, as does the whole strip until the first
/// packet arrives.
fn overlay_artnet(
    artnet: Option<&ArtNetHandle>,
    smoother: &mut SmoothingFilter,
    smoothed: &mut Frame,
    frame: &mut Frame,
) -> usize {
    let Some(update) = artnet.and_then(|handle| handle.latest()) else {
        return 0;
    };
    if update.stale {
        debug!("DMX input is stale, holding last frame");
    }
    smoother.apply(&update.frame, smoothed);
    let covered = update.covered.min(frame.len());
    frame.pixels_mut()[..covered].copy_from_slice(&smoothed.pixels()[..covered]);
    covered
}

/// Fan group evaluation out to the pool and collect results until the tick
/// budget runs out. Groups that fail or overrun keep their black range and
/// raise their error flag; the others land normally.
#[allow(clippy::too_many_arguments)]
fn evaluate_groups(
    pool: &WorkerPool,
    snapshot: &Arc<RenderSnapshot>,
    mapper: &StripMapper,
    anim_time: f64,
    tick_start: Instant,
    period: Duration,
    frame: &mut Frame,
    stats: &Stats,
) {
    let deadline = tick_start + period.mul_f64(GROUP_BUDGET);
    let (result_sender, result_receiver) =
        channel::<(usize, Result<Vec<Rgb>, GroupError>)>();

    let mut jobs = 0;
    for index in 0..snapshot.groups.len() {
        let snapshot = Arc::clone(snapshot);
        let sender = result_sender.clone();
        let mapper = *mapper;
        pool.execute(move || {
            let group = &snapshot.groups[index];
            let prev = vec![Rgb::BLACK; group.len()];
            let result = match snapshot.palettes.get(&group.palette_id) {
                Some(palette) => group::evaluate(
                    group,
                    snapshot.patterns.compiled(&group.pattern_id),
                    palette,
                    &mapper,
                    anim_time,
                    &prev,
                    deadline,
                ),
                None => Err(GroupError::NotCompiled),
            };
            // The receiver is gone if the tick already moved on.
            let _result = sender.send((index, result));
        });
        jobs += 1;
    }
    drop(result_sender);

    let hard_stop = tick_start + period;
    for _ in 0..jobs {
        let remaining = hard_stop.saturating_duration_since(Instant::now());
        match result_receiver.recv_timeout(remaining) {
            Ok((index, Ok(colors))) => {
                let group = &snapshot.groups[index];
                frame.write_rgb(group.range_start, &colors);
                stats.clear_group_error(&group.name);
            }
            Ok((index, Err(error))) => {
                let group = &snapshot.groups[index];
                stats.record_group_error(&group.name, error.to_string());
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                // Abandon the stragglers; their ranges stay black.
                break;
            }
        }
    }
}

/// The global color pipeline: saturation, brightness, channel correction,
/// gamma, then white extraction. The first `external_white_leds` pixels
/// arrived as RGBW wire data and skip the extraction step.
fn run_pipeline(frame: &mut Frame, globals: &GlobalSettings, external_white_leds: usize) {
    // Calibration renders the correction target at full output.
    let brightness = if globals.calibration {
        1.0
    } else {
        globals.brightness.clamp(0.0, 1.0)
    };
    let saturation = if globals.calibration {
        1.0
    } else {
        globals.saturation.clamp(0.0, 1.0)
    };
    let gamma = Gamma::new(globals.gamma);
    let extraction = WhiteExtraction::new(
        globals.rgbw_algorithm,
        saturation,
        globals.color_temp,
        globals.white_led_temperature,
    );

    for (index, pixel) in frame.pixels_mut().iter_mut().enumerate() {
        let rgb = pixel.rgb().saturate(saturation).scaled(brightness).clamped();
        let with_white = Rgbw::new(rgb.r, rgb.g, rgb.b, (pixel.w * brightness).clamp(0.0, 1.0));
        let corrected = globals.correction.apply(with_white);
        let mut out = gamma.apply_rgbw(corrected);
        if globals.use_white_channel && index >= external_white_leds {
            out = rgb_to_rgbw(out.rgb(), &extraction);
        }
        *pixel = out;
    }
}

/// Encode the frame and post it to every sink. Sinks with bound groups get
/// the byte region covering those groups; unbound sinks get the whole
/// strip.
fn dispatch(
    frame: &Frame,
    order: ChannelOrder,
    seq: u32,
    snapshot: &RenderSnapshot,
    sinks: &[Arc<SinkWorker>],
    encoded: &mut Vec<u8>,
    stats: &Stats,
) {
    frame.encode(order, encoded);
    let bytes_per_pixel = order.bytes_per_pixel();
    for sink in sinks {
        if sink.is_disabled() {
            continue;
        }
        let payload = match sink_led_range(snapshot, sink.id()) {
            Some((start, end)) => FramePayload {
                seq,
                offset: start * bytes_per_pixel,
                bytes: encoded[start * bytes_per_pixel..end * bytes_per_pixel].to_vec(),
            },
            None => FramePayload {
                seq,
                offset: 0,
                bytes: encoded.clone(),
            },
        };
        if sink.post(payload) {
            stats.sink_drops_total.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// The LED range a sink is responsible for: the union of its bound groups,
/// or `None` when no group names it.
fn sink_led_range(snapshot: &RenderSnapshot, sink_id: &str) -> Option<(usize, usize)> {
    let mut range: Option<(usize, usize)> = None;
    for group in &snapshot.groups {
        if group.sink_binding.as_deref() == Some(sink_id) {
            range = Some(match range {
                None => (group.range_start, group.range_end),
                Some((start, end)) => {
                    (start.min(group.range_start), end.max(group.range_end))
                }
            });
        }
    }
    range
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        color::{ChannelCorrection, RgbwAlgorithm},
        config::{build_snapshot, ConfigDocument},
    };

    fn globals() -> GlobalSettings {
        GlobalSettings {
            brightness: 1.0,
            saturation: 1.0,
            color_temp: 6500.0,
            correction: ChannelCorrection::IDENTITY,
            use_white_channel: false,
            rgbw_algorithm: RgbwAlgorithm::Legacy,
            white_led_temperature: 4500.0,
            calibration: false,
            gamma: 1.0,
            target_fps: 60,
        }
    }

    #[test]
    fn pipeline_is_identity_at_defaults() {
        let mut frame = Frame::new(2);
        frame.pixels_mut()[0] = Rgbw::new(0.5, 0.25, 0.75, 0.0);
        let reference = frame.clone();
        run_pipeline(&mut frame, &globals(), 0);
        for (a, b) in frame.pixels().iter().zip(reference.pixels()) {
            assert!((a.r - b.r).abs() < 1e-5);
            assert!((a.g - b.g).abs() < 1e-5);
            assert!((a.b - b.b).abs() < 1e-5);
        }
    }

    #[test]
    fn pipeline_applies_brightness_and_correction() {
        let mut frame = Frame::new(1);
        frame.pixels_mut()[0] = Rgbw::new(1.0, 1.0, 1.0, 0.0);
        let mut settings = globals();
        settings.brightness = 0.5;
        settings.correction = ChannelCorrection {
            r: 1.0,
            g: 0.5,
            b: 0.25,
        };
        run_pipeline(&mut frame, &settings, 0);
        let px = frame.pixels()[0];
        assert!((px.r - 0.5).abs() < 1e-5);
        assert!((px.g - 0.25).abs() < 1e-5);
        assert!((px.b - 0.125).abs() < 1e-5);
    }

    #[test]
    fn pipeline_extracts_white_when_enabled() {
        let mut frame = Frame::new(1);
        frame.pixels_mut()[0] = Rgbw::new(0.5, 0.5, 0.5, 0.0);
        let mut settings = globals();
        settings.use_white_channel = true;
        run_pipeline(&mut frame, &settings, 0);
        let px = frame.pixels()[0];
        assert!((px.w - 0.5).abs() < 1e-5);
        assert!(px.r.abs() < 1e-5);
    }

    #[test]
    fn pipeline_skips_extraction_for_dmx_covered_prefix() {
        let mut frame = Frame::new(2);
        frame.pixels_mut()[0] = Rgbw::new(0.0, 0.0, 0.0, 0.8);
        frame.pixels_mut()[1] = Rgbw::new(0.5, 0.5, 0.5, 0.0);
        let mut settings = globals();
        settings.use_white_channel = true;
        run_pipeline(&mut frame, &settings, 1);
        // The DMX pixel keeps its wire white channel; the pattern pixel
        // past the covered prefix goes through extraction.
        assert!((frame.pixels()[0].w - 0.8).abs() < 1e-5);
        assert!((frame.pixels()[1].w - 0.5).abs() < 1e-5);
        assert!(frame.pixels()[1].r.abs() < 1e-5);
    }

    #[test]
    fn calibration_ignores_brightness() {
        let mut frame = Frame::new(1);
        frame.fill_rgb(Rgb::new(1.0, 1.0, 1.0));
        let mut settings = globals();
        settings.calibration = true;
        settings.brightness = 0.1;
        run_pipeline(&mut frame, &settings, 0);
        assert!((frame.pixels()[0].r - 1.0).abs() < 1e-5);
    }

    #[test]
    fn overlay_replaces_only_the_covered_range() {
        let handle = ArtNetHandle::new(Duration::from_secs(5));
        let mut dmx = Frame::new(4);
        dmx.pixels_mut()[0] = Rgbw::new(0.0, 0.0, 1.0, 0.0);
        dmx.pixels_mut()[1] = Rgbw::new(0.0, 0.0, 1.0, 0.0);
        handle.publish(dmx, 2);

        let mut smoother = SmoothingFilter::new(crate::smoothing::SmoothingConfig::default(), 4);
        let mut smoothed = Frame::new(4);
        let mut frame = Frame::new(4);
        frame.fill_rgb(Rgb::new(1.0, 0.0, 0.0));

        let covered = overlay_artnet(Some(&handle), &mut smoother, &mut smoothed, &mut frame);
        assert_eq!(covered, 2);
        // DMX blue over the covered prefix, pattern red beyond it.
        assert_eq!(frame.pixels()[0].b, 1.0);
        assert_eq!(frame.pixels()[1].b, 1.0);
        assert_eq!(frame.pixels()[2].r, 1.0);
        assert_eq!(frame.pixels()[3].r, 1.0);
    }

    #[test]
    fn overlay_without_packets_leaves_patterns_alone() {
        let handle = ArtNetHandle::new(Duration::from_secs(5));
        let mut smoother = SmoothingFilter::new(crate::smoothing::SmoothingConfig::default(), 4);
        let mut smoothed = Frame::new(4);
        let mut frame = Frame::new(4);
        frame.fill_rgb(Rgb::new(1.0, 0.0, 0.0));

        let covered = overlay_artnet(Some(&handle), &mut smoother, &mut smoothed, &mut frame);
        assert_eq!(covered, 0);
        assert_eq!(frame.pixels()[0].r, 1.0);
    }

    #[test]
    fn sink_range_unions_bound_groups() {
        let mut document = ConfigDocument::default();
        let mut a = crate::config::GroupRecord {
            range_start: 0,
            range_end: 10,
            ..Default::default()
        };
        a.sink = Some("tether".to_string());
        let mut b = crate::config::GroupRecord {
            range_start: 20,
            range_end: 30,
            ..Default::default()
        };
        b.sink = Some("tether".to_string());
        document.groups.insert("a".to_string(), a);
        document.groups.insert("b".to_string(), b);
        let snapshot = build_snapshot(&document, 30, 60).unwrap();

        assert_eq!(sink_led_range(&snapshot, "tether"), Some((0, 30)));
        assert_eq!(sink_led_range(&snapshot, "other"), None);
    }
}
