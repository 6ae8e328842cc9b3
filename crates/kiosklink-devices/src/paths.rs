//! Store path layout.
//!
//! Every device owns a subtree rooted at its key:
//! `{key}.alive`, `{key}.enabled`, `{key}.last_info_update`,
//! `{key}.info.{field}`, `{key}.commands.{id}`, `{key}.events.{name}`.
//! The fleet aggregate lives outside any device subtree.

/// Fleet aggregate point.
pub const FLEET_ALL_ALIVE: &str = "fleet.all_alive";

/// Top-level segments that are not device subtrees and must survive
/// removed-device cleanup.
pub const RESERVED_ROOTS: &[&str] = &["fleet"];

pub fn alive(key: &str) -> String {
    format!("{key}.alive")
}

pub fn enabled(key: &str) -> String {
    format!("{key}.enabled")
}

pub fn last_info_update(key: &str) -> String {
    format!("{key}.last_info_update")
}

pub fn info(key: &str, field: &str) -> String {
    format!("{key}.info.{field}")
}

pub fn command(key: &str, id: &str) -> String {
    format!("{key}.commands.{id}")
}

pub fn event(key: &str, name: &str) -> String {
    format!("{key}.events.{name}")
}
