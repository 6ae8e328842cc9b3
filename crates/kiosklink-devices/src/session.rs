//! Push-channel session table.
//!
//! Sessions are ephemeral: a device identity is attached to a session when
//! its first telemetry snapshot resolves an authorized address, and the
//! association dies with the session. The table also carries the permanent
//! denylist of session ids that failed authorization once.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// State of one live push-channel session.
#[derive(Debug)]
pub struct PushSession {
    /// Resolved device association, set by the first accepted telemetry.
    pub device_key: Option<String>,
    pub last_seen: Instant,
    /// Whether this session was ever resolved to a device. Lets the caller
    /// log the resolution exactly once.
    pub first_telemetry_seen: bool,
    /// Per-session telemetry rate limiting.
    pub last_telemetry_accepted: Option<Instant>,
}

/// Table of live sessions plus the process-lifetime denylist.
#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<String, PushSession>,
    denylist: HashSet<String>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record traffic from a session, creating it on first contact.
    pub fn touch(&mut self, session_id: &str) {
        let now = Instant::now();
        self.sessions
            .entry(session_id.to_string())
            .and_modify(|s| s.last_seen = now)
            .or_insert(PushSession {
                device_key: None,
                last_seen: now,
                first_telemetry_seen: false,
                last_telemetry_accepted: None,
            });
    }

    /// Attach a device to a session. Returns `true` on the session's first
    /// resolution; later telemetry re-confirming the key returns `false`, so
    /// the caller logs the association only once.
    pub fn associate(&mut self, session_id: &str, device_key: &str) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        let first = !session.first_telemetry_seen;
        session.first_telemetry_seen = true;
        session.device_key = Some(device_key.to_string());
        first
    }

    pub fn device_key(&self, session_id: &str) -> Option<&str> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.device_key.as_deref())
    }

    /// Drop a session, returning the device it was bound to, if any.
    pub fn remove(&mut self, session_id: &str) -> Option<String> {
        self.sessions
            .remove(session_id)
            .and_then(|s| s.device_key)
    }

    /// Telemetry admission: at most one accepted snapshot per session per
    /// interval. Accepting updates the timestamp; a rejected snapshot leaves
    /// it untouched so a flood cannot push the window forward.
    pub fn accept_telemetry(&mut self, session_id: &str, min_interval: Duration) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        let now = Instant::now();
        match session.last_telemetry_accepted {
            Some(last) if now.duration_since(last) < min_interval => false,
            _ => {
                session.last_telemetry_accepted = Some(now);
                true
            }
        }
    }

    /// Permanently denylist a session id for this process lifetime.
    pub fn deny(&mut self, session_id: &str) {
        self.denylist.insert(session_id.to_string());
        self.sessions.remove(session_id);
    }

    pub fn is_denied(&self, session_id: &str) -> bool {
        self.denylist.contains(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn association_lives_and_dies_with_the_session() {
        let mut table = SessionTable::new();
        table.touch("s1");
        assert_eq!(table.device_key("s1"), None);

        assert!(table.associate("s1", "Tablet_Kitchen"));
        assert_eq!(table.device_key("s1"), Some("Tablet_Kitchen"));

        assert_eq!(table.remove("s1"), Some("Tablet_Kitchen".to_string()));
        assert_eq!(table.device_key("s1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_first_association_reports_as_first() {
        let mut table = SessionTable::new();
        table.touch("s1");

        assert!(table.associate("s1", "Tablet_Kitchen"));
        // Re-confirmations from later telemetry are not first.
        assert!(!table.associate("s1", "Tablet_Kitchen"));

        // A fresh session after a disconnect resolves anew.
        table.remove("s1");
        table.touch("s1");
        assert!(table.associate("s1", "Tablet_Kitchen"));
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_rate_limit_is_per_session() {
        let mut table = SessionTable::new();
        let window = Duration::from_secs(30);
        table.touch("s1");
        table.touch("s2");

        assert!(table.accept_telemetry("s1", window));
        assert!(!table.accept_telemetry("s1", window));
        // An independent session has its own window.
        assert!(table.accept_telemetry("s2", window));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(table.accept_telemetry("s1", window));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_telemetry_does_not_move_the_window() {
        let mut table = SessionTable::new();
        let window = Duration::from_secs(30);
        table.touch("s1");

        assert!(table.accept_telemetry("s1", window));
        tokio::time::advance(Duration::from_secs(20)).await;
        // Rejected: inside the window.
        assert!(!table.accept_telemetry("s1", window));
        tokio::time::advance(Duration::from_secs(11)).await;
        // 31 s after the accepted one; the rejection at t+20 must not count.
        assert!(table.accept_telemetry("s1", window));
    }

    #[tokio::test(start_paused = true)]
    async fn denylist_is_permanent_and_drops_the_session() {
        let mut table = SessionTable::new();
        table.touch("s1");
        table.deny("s1");

        assert!(table.is_denied("s1"));
        assert_eq!(table.session_count(), 0);

        // Re-touching does not clear the denial.
        table.touch("s1");
        assert!(table.is_denied("s1"));
    }
}
