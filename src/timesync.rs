//! Shared animation time across cooperating nodes.
//!
//! A master broadcasts its anim time on UDP 6455; slaves predict between
//! packets from their local monotonic clock and nudge towards the received
//! value with a first-order filter. No sub-frame alignment is attempted.

use std::{
    error::Error,
    fmt,
    io,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{spawn, JoinHandle},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use log::{debug, warn};

use crate::stats::Stats;

pub const SYNC_PORT: u16 = 6455;

const MAGIC: &[u8; 4] = b"LCTS";
const VERSION: u16 = 1;
pub const PACKET_LEN: usize = 24;

/// Broadcast period bounds.
const MIN_PERIOD: Duration = Duration::from_millis(100);
const MAX_PERIOD: Duration = Duration::from_secs(5);

/// Weight of the received time in the drift filter.
const BLEND: f64 = 0.1;

const POLL_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    #[default]
    Off,
    Master,
    Slave,
}

#[derive(Clone, Debug)]
pub struct TimeSyncConfig {
    pub mode: SyncMode,
    pub broadcast_period: Duration,
    /// Slave: accept only this master. `None` locks onto the first seen.
    pub master_addr: Option<SocketAddr>,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Off,
            broadcast_period: Duration::from_secs(1),
            master_addr: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPacket {
    pub version: u16,
    pub flags: u16,
    pub master_wall_ns: i64,
    pub anim_time_s: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    TooShort,
    BadMagic,
    UnsupportedVersion(u16),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::TooShort => f.write_str("sync packet too short"),
            PacketError::BadMagic => f.write_str("bad sync packet magic"),
            PacketError::UnsupportedVersion(v) => write!(f, "unsupported sync version {v}"),
        }
    }
}

impl Error for PacketError {}

/// Serialize a sync packet; all fields little-endian.
pub fn encode_packet(master_wall_ns: i64, anim_time_s: f64) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0..4].copy_from_slice(MAGIC);
    packet[4..6].copy_from_slice(&VERSION.to_le_bytes());
    packet[6..8].copy_from_slice(&0u16.to_le_bytes());
    packet[8..16].copy_from_slice(&master_wall_ns.to_le_bytes());
    packet[16..24].copy_from_slice(&anim_time_s.to_le_bytes());
    packet
}

pub fn decode_packet(packet: &[u8]) -> Result<SyncPacket, PacketError> {
    if packet.len() < PACKET_LEN {
        return Err(PacketError::TooShort);
    }
    if &packet[0..4] != MAGIC {
        return Err(PacketError::BadMagic);
    }
    let version = u16::from_le_bytes([packet[4], packet[5]]);
    if version != VERSION {
        return Err(PacketError::UnsupportedVersion(version));
    }
    Ok(SyncPacket {
        version,
        flags: u16::from_le_bytes([packet[6], packet[7]]),
        master_wall_ns: i64::from_le_bytes(packet[8..16].try_into().unwrap()),
        anim_time_s: f64::from_le_bytes(packet[16..24].try_into().unwrap()),
    })
}

/// Slave-side time base: `anim_time(now) = base + (now − epoch)`.
#[derive(Debug, Clone, Copy)]
struct SlaveClock {
    base: f64,
    epoch: Instant,
}

impl SlaveClock {
    fn anim_time(&self, now: Instant) -> f64 {
        self.base + now.saturating_duration_since(self.epoch).as_secs_f64()
    }

    /// Fold a received time into the local base. The first packet sets the
    /// base outright; later packets blend to bound the step size.
    fn observe(state: &mut Option<SlaveClock>, received: f64, now: Instant) {
        let base = match state {
            None => received,
            Some(clock) => {
                let predicted = clock.anim_time(now);
                predicted * (1.0 - BLEND) + received * BLEND
            }
        };
        *state = Some(SlaveClock { base, epoch: now });
    }
}

struct SyncShared {
    start: Instant,
    slave: Mutex<Option<SlaveClock>>,
}

/// Read side handed to the render loop.
#[derive(Clone)]
pub struct TimeSyncHandle {
    shared: Arc<SyncShared>,
}

impl TimeSyncHandle {
    /// The shared animation time in seconds.
    pub fn anim_time(&self) -> f64 {
        let now = Instant::now();
        let slave = match self.shared.slave.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match *slave {
            Some(clock) => clock.anim_time(now),
            None => now.saturating_duration_since(self.shared.start).as_secs_f64(),
        }
    }

    /// A local-only handle for hosts that run without sync.
    pub fn local() -> Self {
        Self {
            shared: Arc::new(SyncShared {
                start: Instant::now(),
                slave: Mutex::new(None),
            }),
        }
    }
}

/// Owns the broadcaster or receiver thread for the configured mode.
pub struct TimeSync {
    handle: TimeSyncHandle,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TimeSync {
    pub fn start(config: TimeSyncConfig, stats: Arc<Stats>) -> io::Result<Self> {
        let handle = TimeSyncHandle::local();
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = match config.mode {
            SyncMode::Off => None,
            SyncMode::Master => {
                let socket = UdpSocket::bind(("0.0.0.0", 0))?;
                socket.set_broadcast(true)?;
                let period = config.broadcast_period.clamp(MIN_PERIOD, MAX_PERIOD);
                let handle = handle.clone();
                let shutdown = Arc::clone(&shutdown);
                Some(spawn(move || master_loop(&socket, period, &handle, &shutdown)))
            }
            SyncMode::Slave => {
                let socket = UdpSocket::bind(("0.0.0.0", SYNC_PORT))?;
                socket.set_read_timeout(Some(POLL_TIMEOUT))?;
                let shared = Arc::clone(&handle.shared);
                let shutdown = Arc::clone(&shutdown);
                let master = config.master_addr;
                Some(spawn(move || {
                    slave_loop(&socket, master, &shared, &stats, &shutdown)
                }))
            }
        };

        Ok(Self {
            handle,
            shutdown,
            thread,
        })
    }

    pub fn handle(&self) -> TimeSyncHandle {
        self.handle.clone()
    }
}

impl Drop for TimeSync {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _result = thread.join();
        }
    }
}

fn wall_clock_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn master_loop(
    socket: &UdpSocket,
    period: Duration,
    handle: &TimeSyncHandle,
    shutdown: &AtomicBool,
) {
    let target = (Ipv4Addr::BROADCAST, SYNC_PORT);
    while !shutdown.load(Ordering::Relaxed) {
        let packet = encode_packet(wall_clock_ns(), handle.anim_time());
        if let Err(e) = socket.send_to(&packet, target) {
            warn!("sync broadcast failed: {e}");
        }
        std::thread::sleep(period);
    }
}

fn slave_loop(
    socket: &UdpSocket,
    configured_master: Option<SocketAddr>,
    shared: &SyncShared,
    stats: &Stats,
    shutdown: &AtomicBool,
) {
    let mut master = configured_master;
    let mut buffer = [0u8; 64];
    while !shutdown.load(Ordering::Relaxed) {
        let (len, from) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("sync receive error: {e}");
                continue;
            }
        };
        // Lock onto the first master seen after enabling.
        match master {
            None => master = Some(from),
            Some(expected) if expected.ip() != from.ip() => {
                debug!("ignoring sync packet from {from}");
                continue;
            }
            Some(_) => {}
        }
        match decode_packet(&buffer[..len]) {
            Ok(packet) => {
                let now = Instant::now();
                let mut slave = match shared.slave.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                SlaveClock::observe(&mut slave, packet.anim_time_s, now);
                drop(slave);
                stats.record_sync();
            }
            Err(e) => debug!("dropped sync packet: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_round_trip() {
        let packet = encode_packet(1_234_567_890, 42.5);
        assert_eq!(packet.len(), PACKET_LEN);
        let decoded = decode_packet(&packet).unwrap();
        assert_eq!(decoded.version, 1);
        assert_eq!(decoded.master_wall_ns, 1_234_567_890);
        assert_eq!(decoded.anim_time_s, 42.5);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut packet = encode_packet(0, 0.0);
        packet[0] = b'X';
        assert_eq!(decode_packet(&packet), Err(PacketError::BadMagic));
        assert_eq!(decode_packet(&packet[..10]), Err(PacketError::TooShort));
    }

    #[test]
    fn slave_predicts_between_packets() {
        let t0 = Instant::now();
        let mut state = None;
        SlaveClock::observe(&mut state, 10.0, t0);
        let predicted = state.unwrap().anim_time(t0 + Duration::from_millis(500));
        assert!((predicted - 10.5).abs() < 1e-3, "{predicted}");
    }

    #[test]
    fn resync_step_is_bounded_by_filter() {
        let t0 = Instant::now();
        let mut state = None;
        SlaveClock::observe(&mut state, 10.0, t0);

        // One second later the master disagrees by 0.4 s; the filter takes
        // a tenth of the difference.
        let t1 = t0 + Duration::from_secs(1);
        SlaveClock::observe(&mut state, 11.4, t1);
        let after = state.unwrap().anim_time(t1);
        assert!((after - 11.04).abs() < 1e-6, "{after}");
        assert!((after - 11.0).abs() <= 0.5 * 1.0);
    }

    #[test]
    fn local_time_is_monotonic() {
        let handle = TimeSyncHandle::local();
        let a = handle.anim_time();
        let b = handle.anim_time();
        assert!(b >= a);
    }
}
