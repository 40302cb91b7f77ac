//! DMX ingestion over ArtNet and sACN (E1.31).
//!
//! A receiver thread per protocol blocks on its UDP socket, decodes
//! matching packets into fully formed frames and publishes the newest one
//! through a pointer swap. The render loop reads the latest frame each
//! tick; missed intermediate frames are expected.

use std::{
    error::Error,
    fmt,
    io,
    net::{Ipv4Addr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{spawn, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{color::Rgbw, frame::Frame, stats::Stats};

pub const ARTNET_PORT: u16 = 6454;
pub const SACN_PORT: u16 = 5568;

const ARTNET_HEADER: &[u8; 8] = b"Art-Net\0";
const ARTNET_OP_DMX: u16 = 0x5000;
const SACN_ACN_ID: &[u8; 12] = b"ASC-E1.17\0\0\0";
const SACN_ROOT_VECTOR: u32 = 0x0000_0004;
const SACN_FRAMING_VECTOR: u32 = 0x0000_0002;

/// How long the receiver threads block before rechecking the shutdown flag.
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Clone, Debug, PartialEq)]
pub struct ArtNetConfig {
    pub universe: u16,
    /// First DMX channel of the pixel block.
    pub channel_offset: usize,
    /// LEDs driven by each 4-channel wire pixel.
    pub group_size: usize,
    pub led_count: usize,
    /// Published frames older than this are reported stale.
    pub stale_after: Duration,
}

impl ArtNetConfig {
    /// Number of 4-channel wire pixels needed to cover the strip.
    pub fn wire_pixels(&self) -> usize {
        let group_size = self.group_size.max(1);
        self.led_count.div_ceil(group_size)
    }

    /// The channel block must fit a single DMX universe.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.channel_offset + 4 * self.wire_pixels() > 512 {
            return Err(ProtocolError::ChannelBlockTooLarge);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    TooShort,
    BadHeader,
    UnsupportedOpcode(u16),
    BadVector(u32),
    NonZeroStartCode(u8),
    ChannelBlockTooLarge,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::TooShort => f.write_str("packet too short"),
            ProtocolError::BadHeader => f.write_str("bad packet header"),
            ProtocolError::UnsupportedOpcode(op) => write!(f, "unsupported opcode {op:#06x}"),
            ProtocolError::BadVector(v) => write!(f, "unsupported layer vector {v:#010x}"),
            ProtocolError::NonZeroStartCode(c) => write!(f, "non-zero DMX start code {c}"),
            ProtocolError::ChannelBlockTooLarge => {
                f.write_str("channel offset plus pixel block exceeds 512 channels")
            }
        }
    }
}

impl Error for ProtocolError {}

/// Expand a DMX channel block into a full-strip RGBW frame. Each 4-byte
/// wire pixel is replicated across `group_size` consecutive LEDs. Returns
/// the frame and the number of leading LEDs the received channels actually
/// covered; LEDs past that keep rendering their pattern.
pub fn payload_to_frame(payload: &[u8], config: &ArtNetConfig) -> (Frame, usize) {
    let group_size = config.group_size.max(1);
    let mut frame = Frame::new(config.led_count);
    let available = payload.len().saturating_sub(config.channel_offset);
    let received_wire = config.wire_pixels().min(available.div_ceil(4));
    for wire_index in 0..received_wire {
        let base = config.channel_offset + wire_index * 4;
        let channel = |offset: usize| -> f32 {
            payload.get(base + offset).copied().unwrap_or(0) as f32 / 255.0
        };
        let pixel = Rgbw::new(channel(0), channel(1), channel(2), channel(3));
        for led in 0..group_size {
            let index = wire_index * group_size + led;
            if let Some(slot) = frame.pixels_mut().get_mut(index) {
                *slot = pixel;
            }
        }
    }
    let covered = (received_wire * group_size).min(config.led_count);
    (frame, covered)
}

/// Decode an ArtNet OpDmx packet. Returns `None` when the packet is valid
/// but addressed to another universe.
pub fn decode_artnet(
    packet: &[u8],
    config: &ArtNetConfig,
) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if packet.len() < 18 {
        return Err(ProtocolError::TooShort);
    }
    if &packet[0..8] != ARTNET_HEADER {
        return Err(ProtocolError::BadHeader);
    }
    let opcode = u16::from_le_bytes([packet[8], packet[9]]);
    if opcode != ARTNET_OP_DMX {
        return Err(ProtocolError::UnsupportedOpcode(opcode));
    }
    let sub_uni = packet[14];
    let net = packet[15];
    let universe = u16::from(net) << 8 | u16::from(sub_uni);
    if universe != config.universe {
        return Ok(None);
    }
    let length = usize::from(u16::from_be_bytes([packet[16], packet[17]]));
    if length < 2 || length > 512 {
        return Err(ProtocolError::TooShort);
    }
    let data = packet.get(18..18 + length).ok_or(ProtocolError::TooShort)?;
    Ok(Some(payload_to_frame(data, config)))
}

/// Decode an sACN E1.31 data packet. Returns `None` for other universes.
pub fn decode_sacn(
    packet: &[u8],
    config: &ArtNetConfig,
) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if packet.len() < 126 {
        return Err(ProtocolError::TooShort);
    }
    if &packet[4..16] != SACN_ACN_ID {
        return Err(ProtocolError::BadHeader);
    }
    let root_vector = u32::from_be_bytes([packet[18], packet[19], packet[20], packet[21]]);
    if root_vector != SACN_ROOT_VECTOR {
        return Err(ProtocolError::BadVector(root_vector));
    }
    let framing_vector = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]);
    if framing_vector != SACN_FRAMING_VECTOR {
        return Err(ProtocolError::BadVector(framing_vector));
    }
    let universe = u16::from_be_bytes([packet[113], packet[114]]);
    if universe != config.universe {
        return Ok(None);
    }
    let start_code = packet[125];
    if start_code != 0 {
        return Err(ProtocolError::NonZeroStartCode(start_code));
    }
    let property_count = usize::from(u16::from_be_bytes([packet[123], packet[124]]));
    let dmx_len = property_count.saturating_sub(1).min(512);
    let data = packet.get(126..126 + dmx_len).ok_or(ProtocolError::TooShort)?;
    Ok(Some(payload_to_frame(data, config)))
}

/// Multicast group for an sACN universe: `239.255.<hi>.<lo>`.
pub fn sacn_multicast_group(universe: u16) -> Ipv4Addr {
    let [hi, lo] = universe.to_be_bytes();
    Ipv4Addr::new(239, 255, hi, lo)
}

struct Published {
    frame: Arc<Frame>,
    covered: usize,
    received: Instant,
}

/// The most recent decoded DMX state.
#[derive(Clone)]
pub struct ArtNetUpdate {
    pub frame: Arc<Frame>,
    /// Leading LEDs covered by the received channel data.
    pub covered: usize,
    /// No packet has arrived within the staleness timeout.
    pub stale: bool,
}

/// Read side of the receiver. Cloneable; used by the render loop.
#[derive(Clone)]
pub struct ArtNetHandle {
    slot: Arc<Mutex<Option<Published>>>,
    stale_after: Duration,
}

impl ArtNetHandle {
    pub(crate) fn new(stale_after: Duration) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            stale_after,
        }
    }

    /// The most recent decoded frame, its coverage, and whether it has gone
    /// stale. `None` until the first matching packet arrives.
    pub fn latest(&self) -> Option<ArtNetUpdate> {
        let slot = match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.as_ref().map(|published| ArtNetUpdate {
            frame: Arc::clone(&published.frame),
            covered: published.covered,
            stale: published.received.elapsed() > self.stale_after,
        })
    }

    pub(crate) fn publish(&self, frame: Frame, covered: usize) {
        let published = Published {
            frame: Arc::new(frame),
            covered,
            received: Instant::now(),
        };
        let mut slot = match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(published);
    }
}

/// Owns the two receiver threads. Dropping shuts them down and joins.
pub struct ArtNetReceiver {
    handle: ArtNetHandle,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl ArtNetReceiver {
    /// Bind both sockets and start the receiver threads.
    pub fn start(config: ArtNetConfig, stats: Arc<Stats>) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let handle = ArtNetHandle::new(config.stale_after);
        let shutdown = Arc::new(AtomicBool::new(false));

        let artnet_socket = UdpSocket::bind(("0.0.0.0", ARTNET_PORT))?;
        artnet_socket.set_read_timeout(Some(POLL_TIMEOUT))?;

        let sacn_socket = UdpSocket::bind(("0.0.0.0", SACN_PORT))?;
        sacn_socket.set_read_timeout(Some(POLL_TIMEOUT))?;
        if let Err(e) =
            sacn_socket.join_multicast_v4(&sacn_multicast_group(config.universe), &Ipv4Addr::UNSPECIFIED)
        {
            warn!("could not join sACN multicast group: {e}");
        }

        let mut threads = Vec::new();
        for (socket, decode) in [
            (artnet_socket, decode_artnet as DecodeFn),
            (sacn_socket, decode_sacn as DecodeFn),
        ] {
            let handle = handle.clone();
            let shutdown = Arc::clone(&shutdown);
            let stats = Arc::clone(&stats);
            let config = config.clone();
            threads.push(spawn(move || {
                receive_loop(&socket, decode, &config, &handle, &stats, &shutdown);
            }));
        }

        Ok(Self {
            handle,
            shutdown,
            threads,
        })
    }

    pub fn handle(&self) -> ArtNetHandle {
        self.handle.clone()
    }
}

impl Drop for ArtNetReceiver {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for thread in self.threads.drain(..) {
            let _result = thread.join();
        }
    }
}

type DecodeFn = fn(&[u8], &ArtNetConfig) -> Result<Option<(Frame, usize)>, ProtocolError>;

fn receive_loop(
    socket: &UdpSocket,
    decode: DecodeFn,
    config: &ArtNetConfig,
    handle: &ArtNetHandle,
    stats: &Stats,
    shutdown: &AtomicBool,
) {
    let mut buffer = [0u8; 1024];
    while !shutdown.load(Ordering::Relaxed) {
        let len = match socket.recv_from(&mut buffer) {
            Ok((len, _)) => len,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("receive error: {e}");
                continue;
            }
        };
        match decode(&buffer[..len], config) {
            Ok(Some((frame, covered))) => {
                stats.artnet_packets_total.fetch_add(1, Ordering::Relaxed);
                handle.publish(frame, covered);
            }
            Ok(None) => {
                debug!("packet for another universe");
            }
            Err(e) => {
                stats.artnet_drops_total.fetch_add(1, Ordering::Relaxed);
                debug!("dropped malformed packet: {e}");
            }
        }
    }
}
