//! Per-document sync session.
//!
//! ```text
//!  editor ──► local_edit / set_selection ──┐
//!                                          ▼
//!  link ────► handle_message ──► inbound ──► pump (chunked merge)
//!                                          │
//!  clock ───► tick (heartbeat, awareness, causal gaps)
//!                                          ▼
//!                    drain_outbox() ──► link      drain_events() ──► editor
//! ```
//!
//! `Session` owns the replica, the transport state machine, the awareness
//! channel and the cursor projector, and performs no I/O itself. The
//! controller's driver task feeds it and ships whatever it produces.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::awareness::{AwarenessChannel, AwarenessChange, AwarenessRecord, CursorColor, Selection};
use crate::config::CollabConfig;
use crate::cursor::{CursorDecoration, CursorProjector, DecorationChange};
use crate::error::{ProtocolError, ReplicaError};
use crate::protocol::{MessageType, SyncMessage};
use crate::replica::{DocumentId, Operation, ReplicaId, ReplicaStore};
use crate::transport::{ConnectionState, HeartbeatAction, SyncTransport};

/// Connection status as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Syncing,
    Live,
    Reconnecting { attempt: u32 },
    /// The replica was discarded and is being rebuilt from peers.
    Desynced,
    Closed,
}

/// Notifications for the editor.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Remote operations changed the text.
    RemoteChange { text: String },
    DecorationsChanged(Vec<DecorationChange>),
    /// Everyone in the session, local client first.
    CollaboratorsChanged(Vec<AwarenessRecord>),
    Status(SessionStatus),
    /// The replica was rebuilt after a desync; replace the buffer wholesale.
    Resynced { text: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resync {
    Idle,
    AwaitingResponse,
    Draining,
}

pub struct Session {
    config: CollabConfig,
    replica: ReplicaStore,
    transport: SyncTransport,
    awareness: AwarenessChannel,
    projector: CursorProjector,
    /// Disk content not yet folded into the replica.
    seed_content: Option<String>,
    /// Initial sync finished (or failed); seed once the inbound queue drains.
    seed_ready: bool,
    resync: Resync,
    inbound: VecDeque<Operation>,
    outbox: Vec<SyncMessage>,
    events: Vec<SessionEvent>,
    status: SessionStatus,
    dirty: bool,
}

impl Session {
    pub fn new(
        document_id: DocumentId,
        initial_content: impl Into<String>,
        identity: AwarenessRecord,
        config: CollabConfig,
        now: Instant,
    ) -> Self {
        let initial_content = initial_content.into();
        let replica = ReplicaStore::with_config(document_id, ReplicaId::random(), &config);
        let projector = CursorProjector::new(identity.client_id);
        Self {
            transport: SyncTransport::new(&config),
            awareness: AwarenessChannel::new(identity, &config, now),
            replica,
            projector,
            seed_content: (!initial_content.is_empty()).then_some(initial_content),
            seed_ready: false,
            resync: Resync::Idle,
            inbound: VecDeque::new(),
            outbox: Vec::new(),
            events: Vec::new(),
            status: SessionStatus::Disconnected,
            dirty: false,
            config,
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        self.replica.document_id()
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica.replica_id()
    }

    /// Awareness identity; stays fixed across desyncs.
    pub fn client_id(&self) -> ReplicaId {
        self.awareness.client_id()
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn text(&self) -> &str {
        self.replica.text()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Unsaved changes since the last `mark_saved`.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_saved(&mut self) {
        self.dirty = false;
    }

    pub fn collaborators(&self) -> Vec<AwarenessRecord> {
        self.awareness.collaborators()
    }

    pub fn decorations(&self) -> impl Iterator<Item = &CursorDecoration> {
        self.projector.decorations()
    }

    /// Remote operations received but not merged yet.
    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn drain_outbox(&mut self) -> Vec<SyncMessage> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    // ───────────────────────────────────────────────────────────────
    // Editor input
    // ───────────────────────────────────────────────────────────────

    /// Apply an editor change: `removed` characters at `position` replaced
    /// by `inserted`. Never fails; out-of-range positions are clamped.
    pub fn local_edit(&mut self, position: usize, removed: usize, inserted: &str) {
        self.seed_now();
        let mut ops = self
            .replica
            .apply_local_delete(position..position.saturating_add(removed));
        ops.extend(self.replica.apply_local_insert(position, inserted));
        if ops.is_empty() {
            return;
        }
        self.dirty = true;
        if self.transport.is_live() {
            let sender = self.replica.replica_id();
            self.queue(SyncMessage::update(sender, &ops));
        }
        self.reproject();
    }

    pub fn set_selection(&mut self, anchor: usize, head: usize, now: Instant) {
        self.seed_now();
        let selection = Selection {
            anchor: self.replica.relative_position(anchor),
            head: self.replica.relative_position(head),
        };
        let record = self.awareness.set_selection(Some(selection), now);
        self.send_awareness(&record);
    }

    pub fn clear_selection(&mut self, now: Instant) {
        let record = self.awareness.set_selection(None, now);
        self.send_awareness(&record);
    }

    pub fn set_identity(&mut self, display_name: &str, color: CursorColor, now: Instant) {
        let record = self.awareness.set_identity(display_name, color, now);
        self.send_awareness(&record);
        self.emit_collaborators();
    }

    // ───────────────────────────────────────────────────────────────
    // Connection events
    // ───────────────────────────────────────────────────────────────

    /// Start a connection attempt. Returns `false` once closed.
    pub fn begin_connect(&mut self) -> bool {
        if !self.transport.begin_connect() {
            return false;
        }
        self.set_status(SessionStatus::Connecting);
        true
    }

    /// Link is up: request what we are missing and announce ourselves.
    pub fn on_connected(&mut self, now: Instant) {
        self.transport.on_connected(now);
        if !self.transport.is_connected() {
            return;
        }
        log::info!("Document {} connected, syncing", self.document_id());
        self.set_status(SessionStatus::Syncing);
        self.send_sync_request();
        let record = self.awareness.publish(now);
        self.send_awareness(&record);
    }

    /// Link failed or dropped. Returns the delay before the next attempt.
    pub fn on_connection_lost(&mut self) -> Option<Duration> {
        self.outbox.clear();
        if !self.awareness.clear_remote().is_empty() {
            self.emit_collaborators();
            self.reproject();
        }
        // First failure: make the file editable offline.
        self.seed_ready = true;
        self.maybe_seed();

        let delay = self.transport.on_connection_lost()?;
        log::warn!(
            "Document {} disconnected, retrying in {delay:?} (attempt {})",
            self.document_id(),
            self.transport.attempt()
        );
        self.set_status(SessionStatus::Reconnecting {
            attempt: self.transport.attempt(),
        });
        Some(delay)
    }

    /// Handle one inbound frame. Malformed payloads are dropped.
    pub fn handle_message(&mut self, message: SyncMessage, now: Instant) {
        self.transport.on_message(now);
        let kind = message.msg_type;
        if let Err(e) = self.dispatch(message, now) {
            log::warn!("Dropping malformed {} message: {e}", kind.name());
        }
    }

    fn dispatch(&mut self, message: SyncMessage, now: Instant) -> Result<(), ProtocolError> {
        match message.msg_type {
            MessageType::SyncRequest => {
                let remote = message.state_vector()?;
                let response = SyncMessage::sync_response(
                    self.replica.replica_id(),
                    self.replica.diff_since(&remote),
                    self.replica.state_vector().clone(),
                )?;
                self.outbox.push(response);
            }
            MessageType::SyncResponse => {
                let (operations, remote) = message.sync_payload()?;
                log::debug!(
                    "Sync response for {} with {} operations",
                    self.document_id(),
                    operations.len()
                );
                self.inbound.extend(operations);
                if self.resync == Resync::AwaitingResponse {
                    self.resync = Resync::Draining;
                }
                // Offline edits the other side has not seen.
                let missing = self.replica.diff_since(&remote);
                if !missing.is_empty() && self.transport.is_connected() {
                    self.outbox
                        .push(SyncMessage::update(self.replica.replica_id(), &missing)?);
                }
                if self.transport.on_sync_complete() {
                    self.seed_ready = true;
                    if self.resync == Resync::Idle {
                        self.set_status(SessionStatus::Live);
                    }
                }
            }
            MessageType::Update => {
                self.inbound.extend(message.operations()?);
            }
            MessageType::Awareness => {
                let record = message.awareness_record()?;
                match self.awareness.apply_remote(record, now) {
                    AwarenessChange::Ignored => {}
                    change => {
                        if let AwarenessChange::Joined(_) = change {
                            // The newcomer has not seen our record yet.
                            let local = self.awareness.publish(now);
                            self.send_awareness(&local);
                        }
                        self.emit_collaborators();
                        self.reproject();
                    }
                }
            }
            MessageType::Leave => {
                if self.awareness.remove(&message.sender) {
                    self.emit_collaborators();
                    self.reproject();
                }
            }
            MessageType::Ping => {
                self.outbox.push(SyncMessage::pong(self.awareness.client_id()));
            }
            MessageType::Pong => {}
        }
        Ok(())
    }

    /// Merge the next chunk of queued remote operations. Returns whether
    /// more remain.
    pub fn pump(&mut self, now: Instant) -> bool {
        if !self.inbound.is_empty() {
            let take = self.config.merge_chunk_size.max(1).min(self.inbound.len());
            let chunk: Vec<Operation> = self.inbound.drain(..take).collect();
            match self.replica.merge_remote(chunk, now) {
                Ok(outcome) if outcome.changed() => {
                    self.dirty = true;
                    if self.resync != Resync::Draining {
                        self.events.push(SessionEvent::RemoteChange {
                            text: self.replica.text().to_string(),
                        });
                    }
                    self.reproject();
                }
                Ok(_) => {}
                Err(err) => self.desync(err),
            }
        }
        if self.inbound.is_empty() {
            self.maybe_seed();
            if self.resync == Resync::Draining {
                self.finish_resync();
            }
        }
        !self.inbound.is_empty()
    }

    /// Clock tick: sync timeout, heartbeat, awareness refresh and expiry,
    /// causal-gap check.
    pub fn tick(&mut self, now: Instant) -> HeartbeatAction {
        if self.transport.sync_timed_out(now) && self.transport.on_sync_complete() {
            log::info!(
                "No sync response for {}, continuing without peers",
                self.document_id()
            );
            self.seed_ready = true;
            self.maybe_seed();
            if self.resync == Resync::Idle {
                self.set_status(SessionStatus::Live);
            }
        }

        let action = self.transport.check_heartbeat(now);
        match action {
            HeartbeatAction::SendPing => {
                self.outbox.push(SyncMessage::ping(self.awareness.client_id()));
            }
            HeartbeatAction::TimedOut => {
                log::warn!("Heartbeat timeout on {}", self.document_id());
            }
            HeartbeatAction::Idle => {}
        }

        if self.transport.is_connected() {
            if let Some(record) = self.awareness.refresh_due(now) {
                self.send_awareness(&record);
            }
        }
        if !self.awareness.expire(now).is_empty() {
            self.emit_collaborators();
            self.reproject();
        }
        if let Err(err) = self.replica.expire_pending(now) {
            self.desync(err);
        }
        action
    }

    /// Stop syncing. Returns the `leave` frame to send if a link is up.
    pub fn close(&mut self) -> Option<SyncMessage> {
        let was_connected = self.transport.is_connected();
        self.transport.close();
        self.outbox.clear();
        self.inbound.clear();
        self.awareness.clear_remote();
        self.set_status(SessionStatus::Closed);
        was_connected.then(|| SyncMessage::leave(self.awareness.client_id()))
    }

    // ───────────────────────────────────────────────────────────────
    // Internals
    // ───────────────────────────────────────────────────────────────

    fn queue(&mut self, message: Result<SyncMessage, ProtocolError>) {
        match message {
            Ok(message) => self.outbox.push(message),
            Err(e) => log::error!("Failed to encode outbound message: {e}"),
        }
    }

    fn send_sync_request(&mut self) {
        let request = SyncMessage::sync_request(self.replica.replica_id(), self.replica.state_vector());
        self.queue(request);
    }

    fn send_awareness(&mut self, record: &AwarenessRecord) {
        if self.transport.is_connected() {
            self.queue(SyncMessage::awareness(record));
        }
    }

    fn maybe_seed(&mut self) {
        if self.seed_ready && self.inbound.is_empty() {
            self.seed_now();
        }
    }

    fn seed_now(&mut self) {
        let Some(content) = self.seed_content.take() else {
            return;
        };
        let ops = self.replica.seed(&content);
        if ops.is_empty() {
            log::debug!("Document {} already has shared content", self.document_id());
            return;
        }
        if self.transport.is_live() {
            let sender = self.replica.replica_id();
            self.queue(SyncMessage::update(sender, &ops));
        }
    }

    fn desync(&mut self, err: ReplicaError) {
        log::error!("Document {} desynchronized: {err}", self.document_id());
        let document_id = self.replica.document_id().clone();
        self.replica = ReplicaStore::with_config(document_id, ReplicaId::random(), &self.config);
        self.inbound.clear();
        let removed = self.projector.clear();
        if !removed.is_empty() {
            self.events.push(SessionEvent::DecorationsChanged(removed));
        }
        self.resync = Resync::AwaitingResponse;
        self.set_status(SessionStatus::Desynced);
        if self.transport.is_connected() {
            self.send_sync_request();
        }
    }

    fn finish_resync(&mut self) {
        self.resync = Resync::Idle;
        log::info!(
            "Document {} rebuilt from peers ({} characters)",
            self.document_id(),
            self.replica.len()
        );
        self.events.push(SessionEvent::Resynced {
            text: self.replica.text().to_string(),
        });
        self.reproject();
        let status = match self.transport.state() {
            ConnectionState::Live => SessionStatus::Live,
            ConnectionState::SyncingInitial => SessionStatus::Syncing,
            ConnectionState::Connecting => SessionStatus::Connecting,
            ConnectionState::Reconnecting => SessionStatus::Reconnecting {
                attempt: self.transport.attempt(),
            },
            ConnectionState::Disconnected => SessionStatus::Disconnected,
        };
        self.set_status(status);
    }

    fn reproject(&mut self) {
        let records = self.awareness.remote_records();
        let changes = self.projector.project(&self.replica, &records);
        if !changes.is_empty() {
            self.events.push(SessionEvent::DecorationsChanged(changes));
        }
    }

    fn emit_collaborators(&mut self) {
        self.events
            .push(SessionEvent::CollaboratorsChanged(self.awareness.collaborators()));
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status != status {
            self.status = status;
            self.events.push(SessionEvent::Status(status));
        }
    }
}
