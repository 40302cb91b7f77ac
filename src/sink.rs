//! Output sinks: local SPI driver, serial tether and UDP transport.
//!
//! Each sink runs on its own worker thread behind a single-slot mailbox.
//! The render thread posts the newest frame and never blocks; a slow sink
//! simply misses intermediate frames.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{spawn, JoinHandle},
    time::{Duration, Instant},
};

use log::{info, warn};

use crate::{frame::ChannelOrder, stats::Stats, utils::Mailbox};

/// Serial frame start byte.
pub const SERIAL_START: u8 = 0x7E;

/// Default UDP fragmentation threshold in payload bytes.
pub const DEFAULT_UDP_MTU: usize = 1400;

/// UDP datagram header: seq (4) + offset (2) + payload length (2).
pub const UDP_HEADER_LEN: usize = 8;

const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Consecutive failures after which a sink is considered permanently gone.
const FATAL_FAILURE_COUNT: u32 = 10;

/// How long a worker waits for a frame before rechecking shutdown.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// One encoded frame region headed for a sink. `offset` is the byte offset
/// of this region within the full frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramePayload {
    pub seq: u32,
    pub offset: usize,
    pub bytes: Vec<u8>,
}

/// An output endpoint accepting byte-encoded frames.
pub trait Sink: Send {
    fn configure(&mut self, order: ChannelOrder, led_count: usize);
    fn submit(&mut self, payload: &FramePayload) -> io::Result<()>;
    fn shutdown(&mut self);
}

/// CRC16-CCITT (poly 0x1021, init 0xFFFF).
pub fn crc16_ccitt(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in bytes {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = crc << 1 ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Wire code for the channel order byte in the serial envelope.
pub fn order_code(order: ChannelOrder) -> u8 {
    match order {
        ChannelOrder::Rgb => 0,
        ChannelOrder::Rbg => 1,
        ChannelOrder::Grb => 2,
        ChannelOrder::Gbr => 3,
        ChannelOrder::Brg => 4,
        ChannelOrder::Bgr => 5,
        ChannelOrder::Rgbw => 6,
        ChannelOrder::Rbgw => 7,
        ChannelOrder::Grbw => 8,
        ChannelOrder::Gbrw => 9,
        ChannelOrder::Brgw => 10,
        ChannelOrder::Bgrw => 11,
    }
}

/// Frame the payload for the serial wire:
/// `0x7E | u16 len | u8 order | bytes… | u16 crc`, little-endian, where
/// `len` counts the bytes after itself excluding the CRC and the CRC covers
/// the order byte and the data.
pub fn serial_envelope(order: ChannelOrder, bytes: &[u8]) -> Vec<u8> {
    let len = (bytes.len() + 1) as u16;
    let mut out = Vec::with_capacity(bytes.len() + 6);
    out.push(SERIAL_START);
    out.extend_from_slice(&len.to_le_bytes());
    out.push(order_code(order));
    out.extend_from_slice(bytes);
    let crc = crc16_ccitt(&out[3..]);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Split a payload into UDP datagrams:
/// `u32 seq | u16 offset_in_frame_bytes | u16 payload_len | payload`.
pub fn udp_datagrams(payload: &FramePayload, mtu: usize) -> Vec<Vec<u8>> {
    let mtu = mtu.max(1);
    payload
        .bytes
        .chunks(mtu)
        .enumerate()
        .map(|(i, chunk)| {
            let offset = (payload.offset + i * mtu) as u16;
            let mut datagram = Vec::with_capacity(UDP_HEADER_LEN + chunk.len());
            datagram.extend_from_slice(&payload.seq.to_le_bytes());
            datagram.extend_from_slice(&offset.to_le_bytes());
            datagram.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
            datagram.extend_from_slice(chunk);
            datagram
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Local driver

/// Writes the raw byte stream to a hardware LED driver device.
pub struct LocalDriver {
    device: File,
}

impl LocalDriver {
    /// Open the device file. Failure here is a hardware open error.
    pub fn open(path: &Path) -> io::Result<Self> {
        let device = OpenOptions::new().write(true).open(path)?;
        Ok(Self { device })
    }
}

impl Sink for LocalDriver {
    fn configure(&mut self, _order: ChannelOrder, _led_count: usize) {}

    fn submit(&mut self, payload: &FramePayload) -> io::Result<()> {
        self.device.write_all(&payload.bytes)?;
        self.device.flush()
    }

    fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// Serial sink

/// Length-prefixed, CRC-protected frames over a serial link. Reconnects
/// with exponential backoff after I/O errors.
pub struct SerialSink {
    path: PathBuf,
    port: Option<File>,
    order: ChannelOrder,
    backoff: Duration,
    next_attempt: Instant,
}

impl SerialSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            port: None,
            order: ChannelOrder::default(),
            backoff: BACKOFF_MIN,
            next_attempt: Instant::now(),
        }
    }

    fn ensure_open(&mut self) -> io::Result<&mut File> {
        if self.port.is_none() {
            if Instant::now() < self.next_attempt {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "waiting for reconnect backoff",
                ));
            }
            match OpenOptions::new().write(true).open(&self.path) {
                Ok(port) => {
                    info!("serial sink connected to {}", self.path.display());
                    self.port = Some(port);
                    self.backoff = BACKOFF_MIN;
                }
                Err(e) => {
                    self.next_attempt = Instant::now() + self.backoff;
                    self.backoff = (self.backoff * 2).min(BACKOFF_MAX);
                    return Err(e);
                }
            }
        }
        match self.port.as_mut() {
            Some(port) => Ok(port),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "port not open")),
        }
    }
}

impl Sink for SerialSink {
    fn configure(&mut self, order: ChannelOrder, _led_count: usize) {
        self.order = order;
    }

    fn submit(&mut self, payload: &FramePayload) -> io::Result<()> {
        let envelope = serial_envelope(self.order, &payload.bytes);
        let result = self
            .ensure_open()
            .and_then(|port| port.write_all(&envelope).and_then(|()| port.flush()));
        if result.is_err() {
            // Force a reconnect attempt after the backoff.
            self.port = None;
            self.next_attempt = Instant::now() + self.backoff;
            self.backoff = (self.backoff * 2).min(BACKOFF_MAX);
        }
        result
    }

    fn shutdown(&mut self) {
        self.port = None;
    }
}

// ---------------------------------------------------------------------------
// UDP sink

/// Sends frames as sequence-numbered datagrams, fragmenting at the MTU.
pub struct UdpSink {
    socket: UdpSocket,
    target: SocketAddr,
    mtu: usize,
}

impl UdpSink {
    pub fn open(target: &str) -> io::Result<Self> {
        let target = target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address for target"))?;
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        Ok(Self {
            socket,
            target,
            mtu: DEFAULT_UDP_MTU,
        })
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.max(1);
        self
    }
}

impl Sink for UdpSink {
    fn configure(&mut self, _order: ChannelOrder, _led_count: usize) {}

    fn submit(&mut self, payload: &FramePayload) -> io::Result<()> {
        for datagram in udp_datagrams(payload, self.mtu) {
            self.socket.send_to(&datagram, self.target)?;
        }
        Ok(())
    }

    fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// Worker

/// Owns a sink on its own thread behind a latest-wins mailbox.
pub struct SinkWorker {
    id: String,
    mailbox: Arc<Mailbox<FramePayload>>,
    disabled: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SinkWorker {
    pub fn start(
        id: String,
        mut sink: Box<dyn Sink>,
        order: ChannelOrder,
        led_count: usize,
        stats: Arc<Stats>,
    ) -> Self {
        sink.configure(order, led_count);
        let mailbox = Arc::new(Mailbox::new());
        let disabled = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let id = id.clone();
            let mailbox = Arc::clone(&mailbox);
            let disabled = Arc::clone(&disabled);
            let shutdown = Arc::clone(&shutdown);
            spawn(move || {
                worker_loop(&id, sink.as_mut(), &mailbox, &disabled, &shutdown, &stats);
                // Flush whatever arrived during shutdown, best-effort.
                if let Some(payload) = mailbox.take() {
                    let _result = sink.submit(&payload);
                }
                sink.shutdown();
            })
        };

        Self {
            id,
            mailbox,
            disabled,
            shutdown,
            thread: Some(thread),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the sink was disabled after repeated failures. Groups bound
    /// to it keep computing; their output is discarded.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Post the newest frame. Returns `true` if an unsent frame was
    /// replaced, which callers count as a drop.
    pub fn post(&self, payload: FramePayload) -> bool {
        self.mailbox.post(payload)
    }
}

impl Drop for SinkWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _result = thread.join();
        }
    }
}

fn worker_loop(
    id: &str,
    sink: &mut dyn Sink,
    mailbox: &Mailbox<FramePayload>,
    disabled: &AtomicBool,
    shutdown: &AtomicBool,
    stats: &Stats,
) {
    let mut consecutive_failures: u32 = 0;
    while !shutdown.load(Ordering::Relaxed) {
        let Some(payload) = mailbox.take_timeout(POLL_TIMEOUT) else {
            continue;
        };
        if disabled.load(Ordering::Relaxed) {
            continue;
        }
        match sink.submit(&payload) {
            Ok(()) => {
                consecutive_failures = 0;
            }
            Err(e) => {
                stats.sink_drops_total.fetch_add(1, Ordering::Relaxed);
                stats.record_sink_error(id, e.to_string());
                consecutive_failures += 1;
                if consecutive_failures == FATAL_FAILURE_COUNT {
                    warn!("sink '{id}' disabled after {consecutive_failures} failures: {e}");
                    disabled.store(true, Ordering::Relaxed);
                } else {
                    warn!("sink '{id}' dropped frame {}: {e}", payload.seq);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn crc16_ccitt_check_value() {
        // Standard check input for CRC16-CCITT (false).
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
    }

    #[test]
    fn serial_envelope_layout() {
        let envelope = serial_envelope(ChannelOrder::Grb, &[1, 2, 3]);
        assert_eq!(envelope[0], SERIAL_START);
        // len counts order byte + data, excluding itself and the CRC.
        assert_eq!(u16::from_le_bytes([envelope[1], envelope[2]]), 4);
        assert_eq!(envelope[3], order_code(ChannelOrder::Grb));
        assert_eq!(&envelope[4..7], &[1, 2, 3]);
        let crc = u16::from_le_bytes([envelope[7], envelope[8]]);
        assert_eq!(crc, crc16_ccitt(&envelope[3..7]));
        assert_eq!(envelope.len(), 9);
    }

    #[test]
    fn udp_fragmentation_respects_mtu() {
        let payload = FramePayload {
            seq: 7,
            offset: 0,
            bytes: vec![0xAB; 3000],
        };
        let datagrams = udp_datagrams(&payload, 1400);
        assert_eq!(datagrams.len(), 3);

        let first = &datagrams[0];
        assert_eq!(u32::from_le_bytes(first[0..4].try_into().unwrap()), 7);
        assert_eq!(u16::from_le_bytes(first[4..6].try_into().unwrap()), 0);
        assert_eq!(u16::from_le_bytes(first[6..8].try_into().unwrap()), 1400);
        assert_eq!(first.len(), UDP_HEADER_LEN + 1400);

        let last = &datagrams[2];
        assert_eq!(u16::from_le_bytes(last[4..6].try_into().unwrap()), 2800);
        assert_eq!(u16::from_le_bytes(last[6..8].try_into().unwrap()), 200);
    }

    #[test]
    fn udp_offset_carries_region_offset() {
        let payload = FramePayload {
            seq: 1,
            offset: 96,
            bytes: vec![0; 10],
        };
        let datagrams = udp_datagrams(&payload, 1400);
        assert_eq!(datagrams.len(), 1);
        assert_eq!(
            u16::from_le_bytes(datagrams[0][4..6].try_into().unwrap()),
            96
        );
    }

    struct RecordingSink {
        frames: Arc<Mutex<Vec<u32>>>,
        fail: bool,
    }

    impl Sink for RecordingSink {
        fn configure(&mut self, _order: ChannelOrder, _led_count: usize) {}

        fn submit(&mut self, payload: &FramePayload) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
            }
            self.frames.lock().unwrap().push(payload.seq);
            Ok(())
        }

        fn shutdown(&mut self) {}
    }

    #[test]
    fn worker_delivers_frames() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(Stats::new());
        let worker = SinkWorker::start(
            "test".to_string(),
            Box::new(RecordingSink {
                frames: Arc::clone(&frames),
                fail: false,
            }),
            ChannelOrder::Rgb,
            4,
            stats,
        );
        worker.post(FramePayload {
            seq: 1,
            offset: 0,
            bytes: vec![1, 2, 3],
        });
        let deadline = Instant::now() + Duration::from_secs(2);
        while frames.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        drop(worker);
        assert_eq!(*frames.lock().unwrap(), vec![1]);
    }

    #[test]
    fn failing_sink_is_disabled_eventually() {
        let stats = Arc::new(Stats::new());
        let worker = SinkWorker::start(
            "broken".to_string(),
            Box::new(RecordingSink {
                frames: Arc::new(Mutex::new(Vec::new())),
                fail: true,
            }),
            ChannelOrder::Rgb,
            4,
            Arc::clone(&stats),
        );
        let deadline = Instant::now() + Duration::from_secs(5);
        while !worker.is_disabled() && Instant::now() < deadline {
            worker.post(FramePayload {
                seq: 0,
                offset: 0,
                bytes: vec![0],
            });
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(worker.is_disabled());
        assert!(stats.sink_error("broken").is_some());
        assert!(stats.sink_drops_total.load(Ordering::Relaxed) >= u64::from(FATAL_FAILURE_COUNT));
    }
}
