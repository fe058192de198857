//! Process-wide counters for modem and inbox activity.
//! Relaxed atomics only; values are read for logs and the `stats` command.
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

static COMMANDS_SENT: AtomicU64 = AtomicU64::new(0);
static TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static SESSIONS_OPENED: AtomicU64 = AtomicU64::new(0);
static OPEN_FAILURES: AtomicU64 = AtomicU64::new(0);
static LINK_LOSSES: AtomicU64 = AtomicU64::new(0);
static MESSAGES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static PERSISTENCE_FAILURES: AtomicU64 = AtomicU64::new(0);

pub fn inc_commands_sent() {
    COMMANDS_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_timeouts() {
    TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sessions_opened() {
    SESSIONS_OPENED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_open_failures() {
    OPEN_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_link_losses() {
    LINK_LOSSES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_received() {
    MESSAGES_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_persistence_failures() {
    PERSISTENCE_FAILURES.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub commands_sent: u64,
    pub timeouts: u64,
    pub sessions_opened: u64,
    pub open_failures: u64,
    pub link_losses: u64,
    pub messages_received: u64,
    pub persistence_failures: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        commands_sent: COMMANDS_SENT.load(Ordering::Relaxed),
        timeouts: TIMEOUTS.load(Ordering::Relaxed),
        sessions_opened: SESSIONS_OPENED.load(Ordering::Relaxed),
        open_failures: OPEN_FAILURES.load(Ordering::Relaxed),
        link_losses: LINK_LOSSES.load(Ordering::Relaxed),
        messages_received: MESSAGES_RECEIVED.load(Ordering::Relaxed),
        persistence_failures: PERSISTENCE_FAILURES.load(Ordering::Relaxed),
    }
}
