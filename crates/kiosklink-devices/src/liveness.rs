//! Per-device liveness state machine and fleet aggregate.
//!
//! Both channels feed this tracker: push-channel activity and successful
//! polls call [`LivenessTracker::record_activity`], disconnects and failed
//! polls call [`LivenessTracker::record_explicit_down`]. A self-renewing
//! watchdog demotes a device that stays silent for the full window.
//!
//! All transitions are serialized through one mutex that is never held
//! across I/O; bus emission is synchronous and happens under the lock so
//! observers see transitions in order.

use kiosklink_core::{BridgeEvent, EventBus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Silence window before a device is demoted to dead: expected 60 s
/// telemetry cadence plus 10 s jitter margin.
pub const WATCHDOG_WINDOW: Duration = Duration::from_secs(70);

/// Liveness verdict for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessVerdict {
    /// No evidence yet since startup.
    Unknown,
    Alive,
    Dead,
}

struct DeviceLiveness {
    verdict: LivenessVerdict,
    last_activity: Option<Instant>,
    /// Whether a verdict was ever emitted for this device. The first call
    /// always emits, covering restarts where the stored value is stale.
    ever_reported: bool,
    /// At most one outstanding watchdog task per device.
    watchdog_armed: bool,
}

struct Inner {
    devices: HashMap<String, DeviceLiveness>,
    last_fleet_health: Option<bool>,
    shutdown: bool,
}

/// Tracks liveness for the enabled fleet.
#[derive(Clone)]
pub struct LivenessTracker {
    inner: Arc<Mutex<Inner>>,
    bus: EventBus,
    window: Duration,
}

impl LivenessTracker {
    /// Create a tracker for the given enabled device keys.
    pub fn new(bus: EventBus, keys: impl IntoIterator<Item = String>) -> Self {
        Self::with_window(bus, keys, WATCHDOG_WINDOW)
    }

    /// Tracker with a custom watchdog window, for tests.
    pub fn with_window(
        bus: EventBus,
        keys: impl IntoIterator<Item = String>,
        window: Duration,
    ) -> Self {
        let devices = keys
            .into_iter()
            .map(|key| {
                (
                    key,
                    DeviceLiveness {
                        verdict: LivenessVerdict::Unknown,
                        last_activity: None,
                        ever_reported: false,
                        watchdog_armed: false,
                    },
                )
            })
            .collect();

        Self {
            inner: Arc::new(Mutex::new(Inner {
                devices,
                last_fleet_health: None,
                shutdown: false,
            })),
            bus,
            window,
        }
    }

    /// Evidence of reachability for a device. Refreshes the watchdog and
    /// promotes to alive.
    pub fn record_activity(&self, key: &str) {
        let spawn_watchdog = {
            let mut inner = self.inner.lock().expect("liveness lock poisoned");
            if inner.shutdown {
                return;
            }
            let Some(device) = inner.devices.get_mut(key) else {
                tracing::debug!(device = key, "activity for untracked device ignored");
                return;
            };

            device.last_activity = Some(Instant::now());
            let previous = device.verdict;
            device.verdict = LivenessVerdict::Alive;

            if previous != LivenessVerdict::Alive || !device.ever_reported {
                device.ever_reported = true;
                self.bus
                    .publish(BridgeEvent::alive_changed(key, true), "liveness");
            }

            let spawn = !device.watchdog_armed;
            if spawn {
                device.watchdog_armed = true;
            }
            Self::recompute_fleet(&mut inner, &self.bus);
            spawn
        };

        if spawn_watchdog {
            self.spawn_watchdog(key.to_string());
        }
    }

    /// Direct evidence of unreachability (disconnect, failed poll).
    pub fn record_explicit_down(&self, key: &str) {
        let mut inner = self.inner.lock().expect("liveness lock poisoned");
        if inner.shutdown {
            return;
        }
        let Some(device) = inner.devices.get_mut(key) else {
            return;
        };

        let previous = device.verdict;
        device.verdict = LivenessVerdict::Dead;

        if previous != LivenessVerdict::Dead || !device.ever_reported {
            device.ever_reported = true;
            self.bus
                .publish(BridgeEvent::alive_changed(key, false), "liveness");
        }
        Self::recompute_fleet(&mut inner, &self.bus);
        // The armed watchdog, if any, observes the dead verdict at its next
        // deadline and disarms itself.
    }

    /// Current verdict for a device.
    pub fn verdict(&self, key: &str) -> Option<LivenessVerdict> {
        self.inner
            .lock()
            .expect("liveness lock poisoned")
            .devices
            .get(key)
            .map(|d| d.verdict)
    }

    /// Current fleet aggregate: all tracked devices alive, fleet non-empty.
    pub fn fleet_all_alive(&self) -> bool {
        let inner = self.inner.lock().expect("liveness lock poisoned");
        Self::compute_fleet(&inner)
    }

    /// Stop all watchdogs and mark the fleet dead. No events are emitted;
    /// callers are tearing the bridge down.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("liveness lock poisoned");
        inner.shutdown = true;
        for device in inner.devices.values_mut() {
            device.verdict = LivenessVerdict::Dead;
        }
    }

    fn compute_fleet(inner: &Inner) -> bool {
        !inner.devices.is_empty()
            && inner
                .devices
                .values()
                .all(|d| d.verdict == LivenessVerdict::Alive)
    }

    fn recompute_fleet(inner: &mut Inner, bus: &EventBus) {
        let all_alive = Self::compute_fleet(inner);
        if inner.last_fleet_health != Some(all_alive) {
            inner.last_fleet_health = Some(all_alive);
            bus.publish(BridgeEvent::fleet_health_changed(all_alive), "liveness");
        }
    }

    fn spawn_watchdog(&self, key: String) {
        let inner = Arc::clone(&self.inner);
        let bus = self.bus.clone();
        let window = self.window;

        tokio::spawn(async move {
            let mut deadline = Instant::now() + window;
            loop {
                tokio::time::sleep_until(deadline).await;

                let mut guard = inner.lock().expect("liveness lock poisoned");
                if guard.shutdown {
                    return;
                }
                let Some(device) = guard.devices.get_mut(&key) else {
                    return;
                };
                if device.verdict != LivenessVerdict::Alive {
                    device.watchdog_armed = false;
                    return;
                }

                let last = device.last_activity.unwrap_or(deadline - window);
                if last.elapsed() >= window {
                    tracing::warn!(device = %key, "no activity within watchdog window, marking dead");
                    device.verdict = LivenessVerdict::Dead;
                    device.watchdog_armed = false;
                    bus.publish(BridgeEvent::alive_changed(&key, false), "liveness");
                    LivenessTracker::recompute_fleet(&mut guard, &bus);
                    return;
                }
                deadline = last + window;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiosklink_core::EventBusReceiver;
    use std::time::Duration;

    fn tracker(keys: &[&str]) -> (LivenessTracker, EventBusReceiver) {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let tracker = LivenessTracker::new(bus, keys.iter().map(|k| k.to_string()));
        (tracker, rx)
    }

    fn drain(rx: &mut EventBusReceiver) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Some((event, _)) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn activity_promotes_and_first_call_emits() {
        let (tracker, mut rx) = tracker(&["a"]);

        tracker.record_activity("a");
        assert_eq!(tracker.verdict("a"), Some(LivenessVerdict::Alive));

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, BridgeEvent::AliveChanged { alive: true, .. })));

        // Repeat while already alive: no second alive event.
        tracker.record_activity("a");
        let events = drain(&mut rx);
        assert!(!events
            .iter()
            .any(|e| matches!(e, BridgeEvent::AliveChanged { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_demotes_after_silence_window() {
        let (tracker, mut rx) = tracker(&["a"]);
        tracker.record_activity("a");
        drain(&mut rx);

        tokio::time::advance(Duration::from_secs(69)).await;
        tokio::task::yield_now().await;
        assert_eq!(tracker.verdict("a"), Some(LivenessVerdict::Alive));

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(tracker.verdict("a"), Some(LivenessVerdict::Dead));

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, BridgeEvent::AliveChanged { alive: false, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn activity_renews_the_watchdog() {
        let (tracker, _rx) = tracker(&["a"]);
        tracker.record_activity("a");

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(60)).await;
            tokio::task::yield_now().await;
            tracker.record_activity("a");
        }
        assert_eq!(tracker.verdict("a"), Some(LivenessVerdict::Alive));

        tokio::time::advance(Duration::from_secs(71)).await;
        tokio::task::yield_now().await;
        assert_eq!(tracker.verdict("a"), Some(LivenessVerdict::Dead));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_down_emits_once() {
        let (tracker, mut rx) = tracker(&["a"]);
        tracker.record_activity("a");
        drain(&mut rx);

        tracker.record_explicit_down("a");
        tracker.record_explicit_down("a");
        assert_eq!(tracker.verdict("a"), Some(LivenessVerdict::Dead));

        let downs = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, BridgeEvent::AliveChanged { alive: false, .. }))
            .count();
        assert_eq!(downs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fleet_flips_only_when_whole_fleet_transitions() {
        let (tracker, mut rx) = tracker(&["a", "b"]);

        tracker.record_activity("a");
        let events = drain(&mut rx);
        // Startup publishes the initial (false) aggregate once; one device
        // alive out of two never reports true.
        assert!(!events
            .iter()
            .any(|e| matches!(e, BridgeEvent::FleetHealthChanged { all_alive: true, .. })));

        tracker.record_activity("b");
        let events = drain(&mut rx);
        let flips: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, BridgeEvent::FleetHealthChanged { all_alive: true, .. }))
            .collect();
        assert_eq!(flips.len(), 1);

        tracker.record_explicit_down("b");
        let events = drain(&mut rx);
        let flips: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, BridgeEvent::FleetHealthChanged { all_alive: false, .. }))
            .collect();
        assert_eq!(flips.len(), 1);

        // Second device down: aggregate already false, no further flip.
        tracker.record_explicit_down("a");
        let events = drain(&mut rx);
        assert!(!events
            .iter()
            .any(|e| matches!(e, BridgeEvent::FleetHealthChanged { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_silences_the_tracker() {
        let (tracker, mut rx) = tracker(&["a"]);
        tracker.record_activity("a");
        drain(&mut rx);

        tracker.shutdown();
        assert_eq!(tracker.verdict("a"), Some(LivenessVerdict::Dead));

        tracker.record_activity("a");
        assert_eq!(tracker.verdict("a"), Some(LivenessVerdict::Dead));
        assert!(drain(&mut rx).is_empty());
    }
}
