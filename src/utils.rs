use std::{
    io,
    sync::{Condvar, Mutex, MutexGuard},
    thread, time,
};

/// Pin the calling thread to one CPU core.
pub fn pin_to_core(core: usize) -> io::Result<()> {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe { libc::CPU_SET(core, &mut set) };
    let result =
        unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Rolling frame rate over roughly the last second of ticks.
pub(crate) struct FrameRateMonitor {
    durations: Vec<f32>,
    next: usize,
    filled: usize,
    last_tick: Option<time::Instant>,
}

impl FrameRateMonitor {
    /// Window sized to one second at the target rate, so the reading
    /// settles at the same pace regardless of the configured fps.
    pub(crate) fn new(target_fps: usize) -> Self {
        Self {
            durations: vec![0.0; target_fps.max(1)],
            next: 0,
            filled: 0,
            last_tick: None,
        }
    }

    pub(crate) fn tick(&mut self) {
        let now = time::Instant::now();
        if let Some(last) = self.last_tick.replace(now) {
            self.durations[self.next] = (now - last).as_secs_f32();
            self.next = (self.next + 1) % self.durations.len();
            self.filled = (self.filled + 1).min(self.durations.len());
        }
    }

    /// Measured rate, or 0 before the first full tick.
    pub(crate) fn fps(&self) -> f32 {
        if self.filled == 0 {
            return 0.0;
        }
        let total: f32 = self.durations.iter().take(self.filled).sum();
        if total > 0.0 {
            self.filled as f32 / total
        } else {
            0.0
        }
    }
}

/// Sleep out the remainder of a tick. Slices shorter than a small fraction
/// of the period are skipped, since the system sleep would overshoot them
/// and eat into the next tick's budget.
pub(crate) fn sleep_out_tick(remaining: time::Duration, period: time::Duration) {
    let min_sleep = period / 64;
    if remaining > min_sleep {
        thread::sleep(remaining);
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A single-slot, latest-wins mailbox.
///
/// The writer overwrites whatever is pending; the reader takes the newest
/// value or waits for one. The lock is only ever held for the swap.
pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
    available: Condvar,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            available: Condvar::new(),
        }
    }

    /// Store a value, replacing any pending one. Returns `true` if an
    /// unconsumed value was dropped.
    pub fn post(&self, value: T) -> bool {
        let mut slot = lock_ignoring_poison(&self.slot);
        let dropped = slot.replace(value).is_some();
        self.available.notify_one();
        dropped
    }

    /// Take the pending value, if any.
    pub fn take(&self) -> Option<T> {
        lock_ignoring_poison(&self.slot).take()
    }

    /// Wait up to `timeout` for a value.
    pub fn take_timeout(&self, timeout: time::Duration) -> Option<T> {
        let guard = lock_ignoring_poison(&self.slot);
        let (mut guard, _) = self
            .available
            .wait_timeout_while(guard, timeout, |slot| slot.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.take()
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[test]
    fn mailbox_is_latest_wins() {
        let mailbox = Mailbox::new();
        assert!(!mailbox.post(1));
        assert!(mailbox.post(2));
        assert_eq!(mailbox.take(), Some(2));
        assert_eq!(mailbox.take(), None);
    }

    #[test]
    fn mailbox_wakes_waiting_reader() {
        let mailbox = Arc::new(Mailbox::new());
        let writer = Arc::clone(&mailbox);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.post(42);
        });
        let value = mailbox.take_timeout(Duration::from_secs(2));
        handle.join().unwrap();
        assert_eq!(value, Some(42));
    }

    #[test]
    fn mailbox_timeout_returns_none() {
        let mailbox: Mailbox<u8> = Mailbox::new();
        assert_eq!(mailbox.take_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn frame_rate_monitor_starts_at_zero() {
        let mut monitor = FrameRateMonitor::new(60);
        assert_eq!(monitor.fps(), 0.0);
        monitor.tick();
        // One tick records no duration yet.
        assert_eq!(monitor.fps(), 0.0);
    }

    #[test]
    fn frame_rate_monitor_tracks_tick_rate() {
        let mut monitor = FrameRateMonitor::new(10);
        for _ in 0..4 {
            monitor.tick();
            thread::sleep(Duration::from_millis(10));
        }
        let fps = monitor.fps();
        assert!(fps > 0.0 && fps < 1000.0, "fps = {fps}");
    }

    #[test]
    fn frame_rate_monitor_window_wraps() {
        let mut monitor = FrameRateMonitor::new(2);
        for _ in 0..8 {
            monitor.tick();
            thread::sleep(Duration::from_millis(2));
        }
        // Only the last window's worth of durations is averaged.
        assert!(monitor.fps() > 0.0);
    }
}
