//! Ephemeral presence: who is in the document and where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! Local selection change ──► AwarenessChannel::set_selection() ──► push now
//! Refresh timer          ──► AwarenessChannel::refresh_due()   ──► push
//!
//! Inbound record ──► apply_remote()  (replaces the previous record wholesale)
//! Clock tick     ──► expire()        (evicts silent peers)
//! ```
//!
//! Records never touch the replica and are never persisted. Arrival order
//! decides which record wins; they are not ordered against document
//! operations.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::replica::{RelativePosition, ReplicaId};

/// Display name used when the account layer supplies none.
pub const DEFAULT_DISPLAY_NAME: &str = "Anonymous";

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a client id.
    ///
    /// The hue comes from the id; saturation and lightness are fixed so
    /// every collaborator stays readable on a dark editor theme.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// CSS `#rrggbb` for the presence panel.
    pub fn to_css_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// A selection expressed in replica-stable positions.
///
/// `anchor == head` is a plain caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: RelativePosition,
    pub head: RelativePosition,
}

/// One client's presence in a document session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessRecord {
    pub client_id: ReplicaId,
    pub display_name: String,
    pub color: CursorColor,
    pub selection: Option<Selection>,
    /// Bumped on every publish by the owner.
    pub clock: u64,
}

impl AwarenessRecord {
    pub fn new(client_id: ReplicaId, display_name: impl Into<String>) -> Self {
        let display_name = display_name.into();
        Self {
            client_id,
            display_name: if display_name.trim().is_empty() {
                DEFAULT_DISPLAY_NAME.to_string()
            } else {
                display_name
            },
            color: CursorColor::from_uuid(client_id.as_uuid()),
            selection: None,
            clock: 0,
        }
    }

    pub fn with_color(mut self, color: CursorColor) -> Self {
        self.color = color;
        self
    }
}

/// Effect of an inbound record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwarenessChange {
    Joined(ReplicaId),
    Updated(ReplicaId),
    /// Our own record echoed back.
    Ignored,
}

#[derive(Debug, Clone)]
struct RemotePeer {
    record: AwarenessRecord,
    last_seen: Instant,
}

// ───────────────────────────────────────────────────────────────────
// Channel
// ───────────────────────────────────────────────────────────────────

/// Local presence plus the records of every live remote peer.
pub struct AwarenessChannel {
    local: AwarenessRecord,
    peers: HashMap<ReplicaId, RemotePeer>,
    refresh_interval: Duration,
    timeout: Duration,
    last_published: Instant,
}

impl AwarenessChannel {
    pub fn new(local: AwarenessRecord, config: &CollabConfig, now: Instant) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            refresh_interval: config.awareness_refresh_interval(),
            timeout: config.awareness_timeout(),
            last_published: now,
        }
    }

    pub fn client_id(&self) -> ReplicaId {
        self.local.client_id
    }

    pub fn local(&self) -> &AwarenessRecord {
        &self.local
    }

    /// Stamp and return the local record for sending.
    pub fn publish(&mut self, now: Instant) -> AwarenessRecord {
        self.local.clock += 1;
        self.last_published = now;
        self.local.clone()
    }

    /// Replace the local selection; the returned record goes out immediately.
    pub fn set_selection(&mut self, selection: Option<Selection>, now: Instant) -> AwarenessRecord {
        self.local.selection = selection;
        self.publish(now)
    }

    pub fn set_identity(
        &mut self,
        display_name: impl Into<String>,
        color: CursorColor,
        now: Instant,
    ) -> AwarenessRecord {
        let replaced = AwarenessRecord::new(self.local.client_id, display_name).with_color(color);
        self.local.display_name = replaced.display_name;
        self.local.color = replaced.color;
        self.publish(now)
    }

    /// Periodic refresh so peers can tell idle from gone.
    pub fn refresh_due(&mut self, now: Instant) -> Option<AwarenessRecord> {
        if now.saturating_duration_since(self.last_published) >= self.refresh_interval {
            return Some(self.publish(now));
        }
        None
    }

    /// Handle an inbound record. The previous record is replaced, not merged.
    pub fn apply_remote(&mut self, record: AwarenessRecord, now: Instant) -> AwarenessChange {
        let client_id = record.client_id;
        if client_id == self.local.client_id {
            return AwarenessChange::Ignored;
        }
        match self.peers.insert(client_id, RemotePeer { record, last_seen: now }) {
            Some(_) => AwarenessChange::Updated(client_id),
            None => {
                log::debug!("Collaborator {} joined", client_id.short());
                AwarenessChange::Joined(client_id)
            }
        }
    }

    /// Explicit leave. Returns whether a record was removed.
    pub fn remove(&mut self, client_id: &ReplicaId) -> bool {
        let removed = self.peers.remove(client_id).is_some();
        if removed {
            log::debug!("Collaborator {} left", client_id.short());
        }
        removed
    }

    /// Evict peers silent for longer than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<ReplicaId> {
        let timeout = self.timeout;
        let stale: Vec<ReplicaId> = self
            .peers
            .iter()
            .filter(|(_, peer)| now.saturating_duration_since(peer.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
            log::debug!("Collaborator {} timed out", id.short());
        }
        stale
    }

    /// Forget every remote peer (our own connection dropped).
    pub fn clear_remote(&mut self) -> Vec<ReplicaId> {
        self.peers.drain().map(|(id, _)| id).collect()
    }

    /// Snapshot of remote records, ordered by client id.
    pub fn remote_records(&self) -> Vec<AwarenessRecord> {
        let mut records: Vec<AwarenessRecord> =
            self.peers.values().map(|peer| peer.record.clone()).collect();
        records.sort_by_key(|record| record.client_id);
        records
    }

    /// Everyone in the session, local client first.
    pub fn collaborators(&self) -> Vec<AwarenessRecord> {
        let mut all = vec![self.local.clone()];
        all.extend(self.remote_records());
        all
    }

    pub fn last_seen(&self, client_id: &ReplicaId) -> Option<Instant> {
        self.peers.get(client_id).map(|peer| peer.last_seen)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
