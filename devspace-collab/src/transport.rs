//! Connection lifecycle state machine.
//!
//! ```text
//!  Disconnected ──► Connecting ──► SyncingInitial ──► Live
//!                      ▲                 │             │
//!                      │                 ▼             ▼
//!                      └────────── Reconnecting ◄──────┘
//!                         (exponential backoff)
//! ```
//!
//! Pure state, no I/O: the session driver feeds in connection events and
//! clock readings and performs whatever the machine asks for. Every
//! reconnect goes through `SyncingInitial` again, since edits made while
//! offline have to be reconciled against everything that happened
//! elsewhere during the outage.

use std::time::{Duration, Instant};

use crate::config::CollabConfig;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    SyncingInitial,
    Live,
    Reconnecting,
}

/// Exponential reconnect delay: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// What the heartbeat check wants the driver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    SendPing,
    /// Channel silent for too long; treat the connection as failed.
    TimedOut,
}

/// Per-document sync transport state machine.
#[derive(Debug, Clone)]
pub struct SyncTransport {
    state: ConnectionState,
    backoff: Backoff,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    sync_timeout: Duration,
    last_seen: Option<Instant>,
    last_ping: Option<Instant>,
    sync_started: Option<Instant>,
    closed: bool,
}

impl SyncTransport {
    pub fn new(config: &CollabConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff: Backoff::new(config.backoff_base(), config.backoff_max()),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            sync_timeout: config.sync_timeout(),
            last_seen: None,
            last_ping: None,
            sync_started: None,
            closed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a connection is currently up (syncing or live).
    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::SyncingInitial | ConnectionState::Live)
    }

    pub fn is_live(&self) -> bool {
        self.state == ConnectionState::Live
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reconnect attempts since the last time the channel went live.
    pub fn attempt(&self) -> u32 {
        self.backoff.attempt()
    }

    /// Start a connection attempt. Returns `false` once closed.
    pub fn begin_connect(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    /// Connection established; the initial sync round starts now.
    pub fn on_connected(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        self.state = ConnectionState::SyncingInitial;
        self.last_seen = Some(now);
        self.last_ping = None;
        self.sync_started = Some(now);
    }

    /// Any inbound frame proves the channel is alive.
    pub fn on_message(&mut self, now: Instant) {
        self.last_seen = Some(now);
        self.last_ping = None;
    }

    /// Both directions exchanged a sync round. Returns `true` on the
    /// transition to `Live`.
    pub fn on_sync_complete(&mut self) -> bool {
        if self.state != ConnectionState::SyncingInitial {
            return false;
        }
        self.state = ConnectionState::Live;
        self.sync_started = None;
        self.backoff.reset();
        true
    }

    /// Nobody answered the sync request in time.
    pub fn sync_timed_out(&self, now: Instant) -> bool {
        match (self.state, self.sync_started) {
            (ConnectionState::SyncingInitial, Some(started)) => {
                now.saturating_duration_since(started) >= self.sync_timeout
            }
            _ => false,
        }
    }

    /// Connection failed or dropped. Returns the delay before the next
    /// attempt, or `None` once closed.
    pub fn on_connection_lost(&mut self) -> Option<Duration> {
        if self.closed {
            return None;
        }
        self.state = ConnectionState::Reconnecting;
        self.last_seen = None;
        self.last_ping = None;
        self.sync_started = None;
        Some(self.backoff.next_delay())
    }

    pub fn check_heartbeat(&mut self, now: Instant) -> HeartbeatAction {
        if !self.is_connected() {
            return HeartbeatAction::Idle;
        }
        let Some(last_seen) = self.last_seen else {
            return HeartbeatAction::Idle;
        };
        let silence = now.saturating_duration_since(last_seen);
        if silence >= self.heartbeat_timeout {
            return HeartbeatAction::TimedOut;
        }
        let ping_due = self
            .last_ping
            .map_or(true, |sent| now.saturating_duration_since(sent) >= self.heartbeat_interval);
        if silence >= self.heartbeat_interval && ping_due {
            self.last_ping = Some(now);
            return HeartbeatAction::SendPing;
        }
        HeartbeatAction::Idle
    }

    /// Terminal: no further connection attempts.
    pub fn close(&mut self) {
        self.closed = true;
        self.state = ConnectionState::Disconnected;
    }
}
