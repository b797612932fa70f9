//! Session controller: one driver task per open document.
//!
//! ```text
//!  SessionHandle ──commands──► driver task ──► Session (sans-IO core)
//!        ▲                        │   ▲
//!        └──────events────────────┘   └── Link (Connector) ◄──► relay
//! ```
//!
//! The driver owns its `Session` exclusively, so every replica mutation
//! happens on one task. Handles talk to it through channels and are cheap
//! to clone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;

use crate::awareness::{AwarenessRecord, CursorColor};
use crate::config::CollabConfig;
use crate::connector::{Connector, Link, WsConnector};
use crate::error::{SessionError, TransportError};
use crate::protocol::{RoomKey, SyncMessage};
use crate::replica::{DocumentId, ReplicaId};
use crate::session::{Session, SessionEvent, SessionStatus};
use crate::transport::HeartbeatAction;

/// Events buffered for an editor that has taken the receiver but is not
/// keeping up. Further events are dropped until it catches up.
const EVENT_CAPACITY: usize = 1024;

enum Command {
    LocalEdit {
        position: usize,
        removed: usize,
        inserted: String,
    },
    SetSelection {
        anchor: usize,
        head: usize,
    },
    ClearSelection,
    SetIdentity {
        display_name: String,
        color: CursorColor,
    },
    MarkSaved,
    Text(oneshot::Sender<String>),
    Collaborators(oneshot::Sender<Vec<AwarenessRecord>>),
    Close,
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

/// Editor-facing API of one open document.
#[derive(Clone)]
pub struct SessionHandle {
    document_id: DocumentId,
    client_id: ReplicaId,
    commands: mpsc::UnboundedSender<Command>,
    events: Arc<Mutex<Option<mpsc::Receiver<SessionEvent>>>>,
    /// Set once the event receiver has been taken.
    events_taken: Arc<AtomicBool>,
    status: watch::Receiver<SessionStatus>,
    dirty: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Awareness client id of this editor.
    pub fn client_id(&self) -> ReplicaId {
        self.client_id
    }

    fn closed(&self) -> SessionError {
        SessionError::Closed(self.document_id.to_string())
    }

    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| self.closed())
    }

    /// `removed` characters at `position` were replaced by `inserted`.
    pub fn on_local_edit(&self, position: usize, removed: usize, inserted: &str) -> Result<(), SessionError> {
        self.send(Command::LocalEdit {
            position,
            removed,
            inserted: inserted.to_string(),
        })
    }

    pub fn set_selection(&self, anchor: usize, head: usize) -> Result<(), SessionError> {
        self.send(Command::SetSelection { anchor, head })
    }

    pub fn clear_selection(&self) -> Result<(), SessionError> {
        self.send(Command::ClearSelection)
    }

    pub fn set_identity(&self, display_name: &str, color: CursorColor) -> Result<(), SessionError> {
        self.send(Command::SetIdentity {
            display_name: display_name.to_string(),
            color,
        })
    }

    /// Current replica text, after every command sent before this call.
    pub async fn text(&self) -> Result<String, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Text(reply))?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn collaborators(&self) -> Result<Vec<AwarenessRecord>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Collaborators(reply))?;
        rx.await.map_err(|_| self.closed())
    }

    /// Take the event receiver (can only be called once).
    ///
    /// Events are only queued from this point on; `text()`, `status()` and
    /// `collaborators()` always report the current state.
    pub fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        let receiver = self.events.lock().ok().and_then(|mut slot| slot.take());
        if receiver.is_some() {
            self.events_taken.store(true, Ordering::Release);
        }
        receiver
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// The storage layer wrote the current text back to disk.
    pub fn mark_saved(&self) -> Result<(), SessionError> {
        self.dirty.store(false, Ordering::Release);
        self.send(Command::MarkSaved)
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Wait until the status satisfies `predicate`.
    pub async fn wait_for_status(
        &self,
        predicate: impl FnMut(&SessionStatus) -> bool,
    ) -> Result<SessionStatus, SessionError> {
        let mut status = self.status.clone();
        let current = status.wait_for(predicate).await.map_err(|_| self.closed())?;
        Ok(*current)
    }
}

// ───────────────────────────────────────────────────────────────────
// Driver
// ───────────────────────────────────────────────────────────────────

struct Driver<C> {
    session: Session,
    connector: Arc<C>,
    room: RoomKey,
    link: Option<Link>,
    connecting: Option<JoinHandle<Result<Link, TransportError>>>,
    retry_at: Option<tokio::time::Instant>,
    events: mpsc::Sender<SessionEvent>,
    events_taken: Arc<AtomicBool>,
    status: watch::Sender<SessionStatus>,
    dirty: Arc<AtomicBool>,
    dirty_published: bool,
}

async fn connect_result<T>(task: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(link: &mut Option<Link>) -> Option<SyncMessage> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn retry_timer(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<C: Connector> Driver<C> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut ticker = tokio::time::interval(self.session.config().tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.start_connect();
        self.flush().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close) | None => break,
                    Some(command) => self.apply(command),
                },
                joined = connect_result(&mut self.connecting) => {
                    self.connecting = None;
                    match joined {
                        Ok(Ok(link)) => {
                            self.link = Some(link);
                            self.session.on_connected(Instant::now());
                        }
                        Ok(Err(e)) => {
                            log::warn!("Connection to {} failed: {e}", self.room);
                            self.connection_lost();
                        }
                        Err(e) => {
                            log::error!("Connect task for {} failed: {e}", self.room);
                            self.connection_lost();
                        }
                    }
                }
                frame = next_frame(&mut self.link) => match frame {
                    Some(message) => self.session.handle_message(message, Instant::now()),
                    None => {
                        log::info!("Link to {} closed", self.room);
                        self.connection_lost();
                    }
                },
                _ = retry_timer(self.retry_at) => {
                    self.retry_at = None;
                    self.start_connect();
                }
                _ = ticker.tick() => {
                    if self.session.tick(Instant::now()) == HeartbeatAction::TimedOut {
                        self.connection_lost();
                    }
                }
            }

            // Large batches: merge a chunk, ship, let other tasks run.
            while self.session.pump(Instant::now()) {
                self.flush().await;
                tokio::task::yield_now().await;
            }
            self.flush().await;
        }

        self.shutdown().await;
    }

    fn apply(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::LocalEdit {
                position,
                removed,
                inserted,
            } => self.session.local_edit(position, removed, &inserted),
            Command::SetSelection { anchor, head } => self.session.set_selection(anchor, head, now),
            Command::ClearSelection => self.session.clear_selection(now),
            Command::SetIdentity { display_name, color } => {
                self.session.set_identity(&display_name, color, now)
            }
            Command::MarkSaved => self.session.mark_saved(),
            Command::Text(reply) => {
                let _ = reply.send(self.session.text().to_string());
            }
            Command::Collaborators(reply) => {
                let _ = reply.send(self.session.collaborators());
            }
            Command::Close => {}
        }
    }

    fn start_connect(&mut self) {
        if !self.session.begin_connect() {
            return;
        }
        let connector = self.connector.clone();
        let room = self.room.clone();
        self.connecting = Some(tokio::spawn(async move { connector.connect(&room).await }));
    }

    fn connection_lost(&mut self) {
        self.link = None;
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        self.retry_at = self
            .session
            .on_connection_lost()
            .map(|delay| tokio::time::Instant::now() + delay);
    }

    /// Ship outbound frames and publish events.
    async fn flush(&mut self) {
        let outbox = self.session.drain_outbox();
        if let Some(link) = &self.link {
            let mut failed = false;
            for message in outbox {
                if link.send(message).await.is_err() {
                    failed = true;
                    break;
                }
            }
            if failed {
                log::info!("Link to {} dropped while sending", self.room);
                self.connection_lost();
            }
        }

        let deliver = self.events_taken.load(Ordering::Acquire);
        for event in self.session.drain_events() {
            if let SessionEvent::Status(status) = event {
                self.status.send_replace(status);
            }
            if !deliver {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = self.events.try_send(event) {
                log::warn!("Event queue for {} is full, dropping event", self.room);
            }
        }

        let dirty = self.session.is_dirty();
        if dirty != self.dirty_published {
            self.dirty.store(dirty, Ordering::Release);
            self.dirty_published = dirty;
        }
    }

    async fn shutdown(mut self) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let (Some(leave), Some(link)) = (self.session.close(), self.link.take()) {
            let _ = link.send(leave).await;
        }
        self.flush().await;
        log::info!("Session for {} closed", self.session.document_id());
    }
}

// ───────────────────────────────────────────────────────────────────
// Controller
// ───────────────────────────────────────────────────────────────────

struct SessionEntry {
    handle: SessionHandle,
    driver: JoinHandle<()>,
}

/// Opens and closes collaboration sessions, one per document.
pub struct SessionController<C = WsConnector> {
    connector: Arc<C>,
    config: CollabConfig,
    display_name: String,
    color: Option<CursorColor>,
    sessions: HashMap<DocumentId, SessionEntry>,
}

impl SessionController<WsConnector> {
    /// Controller syncing through the relay at `server_url`.
    pub fn connect_to(server_url: impl Into<String>, config: CollabConfig, display_name: impl Into<String>) -> Self {
        Self::new(WsConnector::new(server_url), config, display_name)
    }
}

impl<C: Connector> SessionController<C> {
    pub fn new(connector: C, config: CollabConfig, display_name: impl Into<String>) -> Self {
        Self {
            connector: Arc::new(connector),
            config,
            display_name: display_name.into(),
            color: None,
            sessions: HashMap::new(),
        }
    }

    /// Override the id-derived cursor color.
    pub fn with_color(mut self, color: CursorColor) -> Self {
        self.color = Some(color);
        self
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    /// Start syncing a document. Opening an already open document returns
    /// the existing handle. Must be called within a Tokio runtime.
    pub fn open_session(&mut self, document_id: impl Into<DocumentId>, initial_content: &str) -> SessionHandle {
        let document_id = document_id.into();
        if let Some(entry) = self.sessions.get(&document_id) {
            if !entry.driver.is_finished() {
                return entry.handle.clone();
            }
        }

        let mut identity = AwarenessRecord::new(ReplicaId::random(), self.display_name.clone());
        if let Some(color) = self.color {
            identity = identity.with_color(color);
        }
        let client_id = identity.client_id;
        let session = Session::new(
            document_id.clone(),
            initial_content,
            identity,
            self.config.clone(),
            Instant::now(),
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let events_taken = Arc::new(AtomicBool::new(false));
        let (status_tx, status_rx) = watch::channel(session.status());
        let dirty = Arc::new(AtomicBool::new(false));
        let room = RoomKey::for_document(&document_id);
        log::info!("Opening session for {document_id} in room {room}");

        let driver = Driver {
            session,
            connector: self.connector.clone(),
            room,
            link: None,
            connecting: None,
            retry_at: None,
            events: event_tx,
            events_taken: events_taken.clone(),
            status: status_tx,
            dirty: dirty.clone(),
            dirty_published: false,
        };
        let task = tokio::spawn(driver.run(command_rx));

        let handle = SessionHandle {
            document_id: document_id.clone(),
            client_id,
            commands: command_tx,
            events: Arc::new(Mutex::new(Some(event_rx))),
            events_taken,
            status: status_rx,
            dirty,
        };
        self.sessions.insert(
            document_id,
            SessionEntry {
                handle: handle.clone(),
                driver: task,
            },
        );
        handle
    }

    /// Send `leave`, stop the driver and discard the replica.
    /// Returns `false` if the document was not open.
    pub async fn close_session(&mut self, document_id: &DocumentId) -> bool {
        let Some(entry) = self.sessions.remove(document_id) else {
            return false;
        };
        let _ = entry.handle.commands.send(Command::Close);
        if let Err(e) = entry.driver.await {
            log::error!("Session driver for {document_id} failed: {e}");
        }
        true
    }

    pub async fn close_all(&mut self) {
        let open: Vec<DocumentId> = self.sessions.keys().cloned().collect();
        for document_id in open {
            self.close_session(&document_id).await;
        }
    }

    pub fn session(&self, document_id: &DocumentId) -> Option<SessionHandle> {
        self.sessions.get(document_id).map(|entry| entry.handle.clone())
    }

    pub fn open_documents(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }
}
