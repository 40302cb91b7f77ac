//! Counters and last-error state observable by the host.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Instant,
};

/// Shared observability surface. All counters are monotonic; the error map
/// holds the most recent error string per group and per sink.
#[derive(Debug, Default)]
pub struct Stats {
    pub ticks_total: AtomicU64,
    pub overruns_total: AtomicU64,
    pub artnet_packets_total: AtomicU64,
    pub artnet_drops_total: AtomicU64,
    pub pattern_errors_total: AtomicU64,
    pub sink_drops_total: AtomicU64,
    group_errors: Mutex<HashMap<String, String>>,
    sink_errors: Mutex<HashMap<String, String>>,
    last_sync: Mutex<Option<Instant>>,
    fps: Mutex<f32>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_group_error(&self, group: &str, error: String) {
        self.pattern_errors_total.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut map) = self.group_errors.lock() {
            map.insert(group.to_string(), error);
        }
    }

    pub fn clear_group_error(&self, group: &str) {
        if let Ok(mut map) = self.group_errors.lock() {
            map.remove(group);
        }
    }

    pub fn group_error(&self, group: &str) -> Option<String> {
        self.group_errors
            .lock()
            .ok()
            .and_then(|map| map.get(group).cloned())
    }

    pub fn record_sink_error(&self, sink: &str, error: String) {
        if let Ok(mut map) = self.sink_errors.lock() {
            map.insert(sink.to_string(), error);
        }
    }

    pub fn sink_error(&self, sink: &str) -> Option<String> {
        self.sink_errors
            .lock()
            .ok()
            .and_then(|map| map.get(sink).cloned())
    }

    pub fn record_sync(&self) {
        if let Ok(mut last) = self.last_sync.lock() {
            *last = Some(Instant::now());
        }
    }

    pub fn last_sync(&self) -> Option<Instant> {
        self.last_sync.lock().ok().and_then(|last| *last)
    }

    pub fn set_fps(&self, fps: f32) {
        if let Ok(mut slot) = self.fps.lock() {
            *slot = fps;
        }
    }

    pub fn fps(&self) -> f32 {
        self.fps.lock().map(|slot| *slot).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_errors_track_latest() {
        let stats = Stats::new();
        stats.record_group_error("main", "first".to_string());
        stats.record_group_error("main", "second".to_string());
        assert_eq!(stats.group_error("main"), Some("second".to_string()));
        assert_eq!(stats.pattern_errors_total.load(Ordering::Relaxed), 2);

        stats.clear_group_error("main");
        assert_eq!(stats.group_error("main"), None);
    }

    #[test]
    fn counters_start_at_zero() {
        let stats = Stats::new();
        assert_eq!(stats.ticks_total.load(Ordering::Relaxed), 0);
        assert_eq!(stats.overruns_total.load(Ordering::Relaxed), 0);
    }
}
