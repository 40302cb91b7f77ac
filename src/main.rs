use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::sleep,
    time::{Duration, Instant},
};

use log::{error, info, warn};

use rpi_led_strip::{
    artnet::ArtNetReceiver,
    config::{artnet_config, build_snapshot, sync_config, ConfigDocument, StripConfig},
    render::Controller,
    sink::{LocalDriver, SerialSink, Sink, SinkWorker, UdpSink},
    stats::Stats,
    timesync::TimeSync,
};

/// Exit codes: 0 clean shutdown, 1 configuration error, 2 hardware open
/// error.
const EXIT_CONFIG: i32 = 1;
const EXIT_HARDWARE: i32 = 2;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    let handler = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config: StripConfig = argh::from_env();
    std::process::exit(run(&config));
}

fn run(config: &StripConfig) -> i32 {
    let document = match &config.config {
        Some(path) => match ConfigDocument::load(path) {
            Ok(document) => document,
            Err(e) => {
                error!("{e}");
                return EXIT_CONFIG;
            }
        },
        None => ConfigDocument::default(),
    };

    let snapshot = match build_snapshot(&document, config.led_count, config.target_fps) {
        Ok(snapshot) => Arc::new(snapshot),
        Err(e) => {
            error!("{e}");
            return EXIT_CONFIG;
        }
    };

    let stats = Arc::new(Stats::new());

    let mut sinks: Vec<Arc<SinkWorker>> = Vec::new();
    if let Some(path) = &config.spi_device {
        let driver = match LocalDriver::open(path) {
            Ok(driver) => driver,
            Err(e) => {
                error!("could not open {}: {e}", path.display());
                return EXIT_HARDWARE;
            }
        };
        sinks.push(Arc::new(SinkWorker::start(
            "local".to_string(),
            Box::new(driver),
            config.led_pixel_order,
            config.led_count,
            Arc::clone(&stats),
        )));
    }
    if let Some(path) = &config.serial_device {
        // The serial link connects lazily and reconnects with backoff.
        let sink: Box<dyn Sink> = Box::new(SerialSink::new(path.clone()));
        sinks.push(Arc::new(SinkWorker::start(
            "serial".to_string(),
            sink,
            config.led_pixel_order,
            config.led_count,
            Arc::clone(&stats),
        )));
    }
    if let Some(target) = &config.udp_target {
        let sink = match UdpSink::open(target) {
            Ok(sink) => sink,
            Err(e) => {
                error!("could not open UDP target {target}: {e}");
                return EXIT_HARDWARE;
            }
        };
        sinks.push(Arc::new(SinkWorker::start(
            "udp".to_string(),
            Box::new(sink),
            config.led_pixel_order,
            config.led_count,
            Arc::clone(&stats),
        )));
    }
    if sinks.is_empty() {
        warn!("no sink configured, rendering without output");
    }

    let artnet = if document.enable_artnet {
        match ArtNetReceiver::start(
            artnet_config(&document, config.led_count),
            Arc::clone(&stats),
        ) {
            Ok(receiver) => Some(receiver),
            Err(e) => {
                error!("could not start DMX receiver: {e}");
                return EXIT_HARDWARE;
            }
        }
    } else {
        None
    };

    let timesync = match TimeSync::start(sync_config(&document), Arc::clone(&stats)) {
        Ok(timesync) => timesync,
        Err(e) => {
            error!("could not start time sync: {e}");
            return EXIT_HARDWARE;
        }
    };

    install_signal_handlers();

    let controller = Controller::start(
        snapshot,
        config.led_count,
        config.led_pixel_order,
        sinks.clone(),
        artnet.as_ref().map(ArtNetReceiver::handle),
        timesync.handle(),
        Arc::clone(&stats),
    );

    info!(
        "driving {} LEDs at {} fps ({:?})",
        config.led_count, config.target_fps, config.led_pixel_order
    );

    let mut last_report = Instant::now();
    while !SHUTDOWN.load(Ordering::Relaxed) {
        sleep(Duration::from_millis(200));
        if last_report.elapsed() >= Duration::from_secs(10) {
            info!(
                "fps {:.1}, ticks {}, overruns {}, dmx packets {}, sink drops {}",
                stats.fps(),
                stats.ticks_total.load(Ordering::Relaxed),
                stats.overruns_total.load(Ordering::Relaxed),
                stats.artnet_packets_total.load(Ordering::Relaxed),
                stats.sink_drops_total.load(Ordering::Relaxed),
            );
            last_report = Instant::now();
        }
    }

    info!("shutting down");
    // Reverse dependency order: stop the render loop, flush the sinks,
    // then close the receivers.
    drop(controller);
    drop(sinks);
    drop(artnet);
    drop(timesync);

    0
}
