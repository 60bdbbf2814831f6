//! Shared read surface between the connection manager and external consumers.
//!
//! `Core` bundles the latest-reading slot, the metrics engine, the broadcast
//! hub, and battery de-duplication. The connection manager is the only
//! writer; an HTTP layer, CSV logger, or any other sink only reads from here
//! and never drives the connection state machine.

use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;

use crate::hub::{BroadcastHub, Event, Subscriber};
use crate::metrics::{BpmSample, MetricsConfig, MetricsEngine, StatsSnapshot};
use crate::reading::Reading;

#[derive(Debug)]
pub struct Core {
    /// Most recently pushed reading, replaced wholly on each accept. Holds
    /// `None` until the first reading arrives. Readings are assumed to arrive
    /// in non-decreasing timestamp order; an out-of-order notification would
    /// overwrite a newer reading (see DESIGN.md).
    latest: RwLock<Option<Arc<Reading>>>,
    metrics: MetricsEngine,
    hub: BroadcastHub,
    last_battery: Mutex<Option<u8>>,
    default_window_secs: u64,
}

impl Core {
    pub fn new(metrics_config: MetricsConfig, default_window_secs: u64) -> Self {
        Core {
            latest: RwLock::new(None),
            metrics: MetricsEngine::new(metrics_config),
            hub: BroadcastHub::new(),
            last_battery: Mutex::new(None),
            default_window_secs: default_window_secs.max(crate::metrics::MIN_WINDOW_SECS),
        }
    }

    /// The most recently accepted reading, or `None` before the first one.
    pub fn latest_reading(&self) -> Option<Arc<Reading>> {
        self.latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Accept one decoded reading: replace the latest slot, feed the metrics
    /// windows, and broadcast it, in that order.
    ///
    /// A reading without its own battery value inherits the last observed
    /// level so the slot always carries the freshest known battery state.
    pub fn accept_reading(&self, mut reading: Reading) -> Arc<Reading> {
        {
            let mut last = self.last_battery.lock().unwrap_or_else(|e| e.into_inner());
            match reading.battery_percent {
                Some(pct) => *last = Some(pct),
                None => reading.battery_percent = *last,
            }
        }

        let reading = Arc::new(reading);
        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&reading));
        self.metrics
            .push(reading.timestamp, reading.bpm, &reading.rr_intervals_ms);
        self.hub.broadcast(&Event::Reading {
            reading: Arc::clone(&reading),
        });
        reading
    }

    /// Record a battery level observed outside the measurement stream.
    ///
    /// Returns `false` (and stays silent) when the value matches the last
    /// observed one. Otherwise the latest-reading slot is patched and a
    /// battery event is broadcast.
    pub fn update_battery(&self, percent: u8) -> bool {
        {
            let mut last = self.last_battery.lock().unwrap_or_else(|e| e.into_inner());
            if *last == Some(percent) {
                return false;
            }
            *last = Some(percent);
        }

        {
            let mut slot = self.latest.write().unwrap_or_else(|e| e.into_inner());
            if let Some(current) = slot.as_ref()
                && current.battery_percent != Some(percent)
            {
                let mut patched = (**current).clone();
                patched.battery_percent = Some(percent);
                *slot = Some(Arc::new(patched));
            }
        }

        self.hub.broadcast(&Event::Battery { percent });
        true
    }

    pub fn last_battery(&self) -> Option<u8> {
        *self.last_battery.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn compute_stats(&self, window_secs: u64) -> Option<StatsSnapshot> {
        self.metrics.compute_stats(window_secs)
    }

    /// Stats over the configured default analysis window.
    pub fn compute_default_stats(&self) -> Option<StatsSnapshot> {
        self.metrics.compute_stats(self.default_window_secs)
    }

    pub fn history(&self, window_secs: u64) -> Vec<BpmSample> {
        self.metrics.history(window_secs)
    }

    pub fn subscribe(&self) -> Subscriber {
        self.hub.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) {
        self.hub.unsubscribe(id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    pub fn metrics(&self) -> &MetricsEngine {
        &self.metrics
    }

    pub fn default_window_secs(&self) -> u64 {
        self.default_window_secs
    }
}

/// Build a reading stamped with the current time.
pub fn reading_now(
    bpm: u16,
    energy_expended: Option<u16>,
    rr_intervals_ms: Vec<u32>,
) -> Reading {
    Reading {
        timestamp: Utc::now(),
        bpm,
        battery_percent: None,
        energy_expended,
        rr_intervals_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsConfig;
    use chrono::{DateTime, Duration as ChronoDuration};

    fn reading_at(timestamp: DateTime<Utc>, bpm: u16) -> Reading {
        Reading {
            timestamp,
            bpm,
            battery_percent: None,
            energy_expended: None,
            rr_intervals_ms: vec![],
        }
    }

    fn core() -> Core {
        Core::new(MetricsConfig::default(), 60)
    }

    #[test]
    fn latest_is_empty_before_first_reading() {
        assert!(core().latest_reading().is_none());
    }

    #[test]
    fn accept_reading_updates_slot_and_metrics() {
        let core = core();
        let t0 = DateTime::<Utc>::UNIX_EPOCH;
        core.accept_reading(reading_at(t0, 70));
        core.accept_reading(reading_at(t0 + ChronoDuration::seconds(1), 75));

        assert_eq!(core.latest_reading().unwrap().bpm, 75);
        let stats = core
            .metrics()
            .compute_stats_at(60, t0 + ChronoDuration::seconds(1))
            .unwrap();
        assert_eq!(stats.count, 2);
    }

    #[tokio::test]
    async fn accept_reading_broadcasts_to_subscribers() {
        let core = core();
        let mut sub = core.subscribe();
        core.accept_reading(reading_at(DateTime::<Utc>::UNIX_EPOCH, 70));
        let payload = sub.rx.recv().await.unwrap();
        assert!(payload.contains("\"type\":\"reading\""));
    }

    #[test]
    fn battery_updates_deduplicate() {
        let core = core();
        assert!(core.update_battery(80));
        assert!(!core.update_battery(80));
        assert!(core.update_battery(79));
        assert_eq!(core.last_battery(), Some(79));
    }

    #[test]
    fn battery_update_patches_latest_reading() {
        let core = core();
        core.accept_reading(reading_at(DateTime::<Utc>::UNIX_EPOCH, 70));
        assert_eq!(core.latest_reading().unwrap().battery_percent, None);

        core.update_battery(66);
        let latest = core.latest_reading().unwrap();
        assert_eq!(latest.battery_percent, Some(66));
        assert_eq!(latest.bpm, 70);
    }

    #[test]
    fn readings_inherit_last_observed_battery() {
        let core = core();
        core.update_battery(90);
        core.accept_reading(reading_at(DateTime::<Utc>::UNIX_EPOCH, 70));
        assert_eq!(core.latest_reading().unwrap().battery_percent, Some(90));
    }

    #[tokio::test]
    async fn battery_change_emits_single_event() {
        let core = core();
        let mut sub = core.subscribe();
        core.update_battery(70);
        core.update_battery(70);
        let payload = sub.rx.recv().await.unwrap();
        assert!(payload.contains("\"type\":\"battery\""));
        assert!(sub.rx.try_recv().is_err());
    }
}
