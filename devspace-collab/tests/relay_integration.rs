//! End-to-end tests: a real relay on a free port and real WebSocket clients.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use devspace_collab::{
    CollabConfig, DecorationChange, DocumentId, MessageType, ReplicaId, ReplicaStore, RoomKey,
    ServerConfig, SessionController, SessionEvent, SessionHandle, SessionStatus, StateVector,
    SyncMessage, SyncServer,
};

/// Start a relay on a free port, return its WebSocket URL.
async fn start_relay() -> String {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SyncServer::new(ServerConfig {
        bind_addr: addr.to_string(),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
    });
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    format!("ws://{addr}")
}

fn fast_config() -> CollabConfig {
    CollabConfig {
        backoff_base_ms: 20,
        backoff_max_ms: 200,
        tick_interval_ms: 10,
        ..CollabConfig::default()
    }
}

async fn wait_live(handle: &SessionHandle) {
    timeout(
        Duration::from_secs(5),
        handle.wait_for_status(|s| *s == SessionStatus::Live),
    )
    .await
    .expect("session did not go live")
    .unwrap();
}

async fn wait_for_text(handle: &SessionHandle, expected: &str) -> String {
    let mut text = String::new();
    for _ in 0..300 {
        text = handle.text().await.unwrap();
        if text == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    text
}

async fn raw_connect(
    url: &str,
    doc: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let room = RoomKey::for_document(&DocumentId::new(doc));
    let (ws, _) = tokio_tungstenite::connect_async(room.url(url)).await.unwrap();
    ws
}

async fn next_message<S>(ws: &mut S) -> SyncMessage
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no frame within timeout")
            .expect("stream ended")
            .unwrap();
        if let Message::Binary(data) = frame {
            return SyncMessage::decode(&data).unwrap();
        }
    }
}

async fn send_message<S>(ws: &mut S, message: &SyncMessage)
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    ws.send(Message::Binary(message.encode().unwrap().into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_relay_answers_sync_request() {
    let url = start_relay().await;
    let mut ws = raw_connect(&url, "doc-raw").await;

    let mut local = ReplicaStore::new(DocumentId::new("doc-raw"), ReplicaId::random());
    let ops = local.apply_local_insert(0, "hi");
    let update = SyncMessage::update(local.replica_id(), &ops).unwrap();
    ws.send(Message::Binary(update.encode().unwrap().into())).await.unwrap();

    let request = SyncMessage::sync_request(ReplicaId::random(), &StateVector::new()).unwrap();
    ws.send(Message::Binary(request.encode().unwrap().into())).await.unwrap();

    let response = next_message(&mut ws).await;
    assert_eq!(response.msg_type, MessageType::SyncResponse);
    let (operations, state_vector) = response.sync_payload().unwrap();
    assert_eq!(operations, ops);
    assert_eq!(&state_vector, local.state_vector());
}

#[tokio::test]
async fn test_relay_ping_pong() {
    let url = start_relay().await;
    let mut ws = raw_connect(&url, "doc-ping").await;
    let ping = SyncMessage::ping(ReplicaId::random());
    ws.send(Message::Binary(ping.encode().unwrap().into())).await.unwrap();
    assert_eq!(next_message(&mut ws).await.msg_type, MessageType::Pong);
}

#[tokio::test]
async fn test_relay_sends_leave_when_connection_drops() {
    let url = start_relay().await;
    let mut watcher = raw_connect(&url, "doc-leave").await;
    let mut leaver = raw_connect(&url, "doc-leave").await;

    let record = devspace_collab::AwarenessRecord::new(ReplicaId::random(), "Bob");
    let awareness = SyncMessage::awareness(&record).unwrap();
    leaver
        .send(Message::Binary(awareness.encode().unwrap().into()))
        .await
        .unwrap();
    assert_eq!(next_message(&mut watcher).await.msg_type, MessageType::Awareness);

    drop(leaver);
    let leave = next_message(&mut watcher).await;
    assert_eq!(leave.msg_type, MessageType::Leave);
    assert_eq!(leave.sender, record.client_id);
}

#[tokio::test]
async fn test_two_editors_converge_through_relay() {
    let url = start_relay().await;
    let mut alice = SessionController::connect_to(&url, fast_config(), "Alice");
    let mut bob = SessionController::connect_to(&url, fast_config(), "Bob");

    let a = alice.open_session("doc-1", "fn main() {}\n");
    wait_live(&a).await;
    let b = bob.open_session("doc-1", "fn main() {}\n");
    wait_live(&b).await;
    assert_eq!(wait_for_text(&b, "fn main() {}\n").await, "fn main() {}\n");

    a.on_local_edit(11, 0, " println!(); ").unwrap();
    b.on_local_edit(0, 0, "// hi\n").unwrap();

    let expected = "// hi\nfn main() { println!(); }\n";
    assert_eq!(wait_for_text(&a, expected).await, expected);
    assert_eq!(wait_for_text(&b, expected).await, expected);
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let url = start_relay().await;
    let mut alice = SessionController::connect_to(&url, fast_config(), "Alice");
    let a = alice.open_session("doc-late", "");
    wait_live(&a).await;
    a.on_local_edit(0, 0, "written before Bob arrived").unwrap();
    assert_eq!(a.text().await.unwrap(), "written before Bob arrived");

    // Bob's disk copy is stale; the shared document wins.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut bob = SessionController::connect_to(&url, fast_config(), "Bob");
    let b = bob.open_session("doc-late", "");
    wait_live(&b).await;
    assert_eq!(
        wait_for_text(&b, "written before Bob arrived").await,
        "written before Bob arrived"
    );
}

#[tokio::test]
async fn test_remote_cursor_and_leave() {
    let url = start_relay().await;
    let mut alice = SessionController::connect_to(&url, fast_config(), "Alice");
    let mut bob = SessionController::connect_to(&url, fast_config(), "Bob");

    let a = alice.open_session("doc-cursor", "abcdef");
    let mut a_events = a.take_events().unwrap();
    wait_live(&a).await;
    let b = bob.open_session("doc-cursor", "abcdef");
    wait_live(&b).await;
    wait_for_text(&b, "abcdef").await;

    b.set_selection(2, 4).unwrap();
    let decoration = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(SessionEvent::DecorationsChanged(changes)) = a_events.recv().await {
                for change in changes {
                    if let DecorationChange::Added(d) | DecorationChange::Updated(d) = change {
                        if d.client_id == b.client_id() && d.range_end == 4 {
                            return d;
                        }
                    }
                }
            }
        }
    })
    .await
    .expect("no decoration for Bob");
    assert_eq!(decoration.range_start, 2);
    assert_eq!(decoration.label, "Bob");

    assert!(bob.close_session(&DocumentId::new("doc-cursor")).await);
    let mut remaining = Vec::new();
    for _ in 0..300 {
        remaining = a.collaborators().await.unwrap();
        if remaining.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].display_name, "Alice");
}

#[tokio::test]
async fn test_connects_once_relay_comes_up() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut alice = SessionController::connect_to(format!("ws://{addr}"), fast_config(), "Alice");
    let a = alice.open_session("doc-retry", "offline text");
    timeout(
        Duration::from_secs(5),
        a.wait_for_status(|s| matches!(s, SessionStatus::Reconnecting { .. })),
    )
    .await
    .unwrap()
    .unwrap();
    a.on_local_edit(0, 0, "edited ").unwrap();
    assert_eq!(a.text().await.unwrap(), "edited offline text");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let server = SyncServer::new(ServerConfig {
        bind_addr: addr.to_string(),
        ..ServerConfig::default()
    });
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });

    wait_live(&a).await;
    let mut bob = SessionController::connect_to(format!("ws://{addr}"), fast_config(), "Bob");
    let b = bob.open_session("doc-retry", "");
    wait_live(&b).await;
    assert_eq!(
        wait_for_text(&b, "edited offline text").await,
        "edited offline text"
    );
}

#[tokio::test]
async fn test_late_joiner_sees_earlier_collaborator() {
    let url = start_relay().await;
    let mut alice = SessionController::connect_to(&url, fast_config(), "Alice");
    let a = alice.open_session("doc-presence", "");
    wait_live(&a).await;

    let mut bob = SessionController::connect_to(&url, fast_config(), "Bob");
    let b = bob.open_session("doc-presence", "");
    wait_live(&b).await;

    // Well inside the periodic awareness refresh.
    let mut names = Vec::new();
    for _ in 0..300 {
        names = b
            .collaborators()
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.display_name)
            .collect::<Vec<_>>();
        if names.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    names.sort();
    assert_eq!(names, ["Alice", "Bob"]);
}

#[tokio::test]
async fn test_relay_survives_orphan_flood_and_asks_for_refill() {
    let url = start_relay().await;
    let mut writer = raw_connect(&url, "doc-flood").await;
    let mut watcher = raw_connect(&url, "doc-flood").await;

    let mut honest = ReplicaStore::new(DocumentId::new("doc-flood"), ReplicaId::random());
    let kept = honest.apply_local_insert(0, "kept");
    send_message(&mut writer, &SyncMessage::update(honest.replica_id(), &kept).unwrap()).await;
    assert_eq!(next_message(&mut watcher).await.msg_type, MessageType::Update);

    // Operations that depend on history the relay never received.
    let mut flooder = ReplicaStore::new(DocumentId::new("doc-flood"), ReplicaId::random());
    flooder.apply_local_insert(0, "never sent");
    let flood = "x".repeat(CollabConfig::default().max_pending_operations + 1);
    let orphans = flooder.apply_local_insert(10, &flood);
    send_message(&mut writer, &SyncMessage::update(flooder.replica_id(), &orphans).unwrap()).await;

    let refill = loop {
        let message = next_message(&mut watcher).await;
        if message.msg_type != MessageType::Update {
            break message;
        }
    };
    assert_eq!(refill.msg_type, MessageType::SyncRequest);
    assert_eq!(&refill.state_vector().unwrap(), honest.state_vector());

    // Content merged before the flood is still served.
    let request = SyncMessage::sync_request(ReplicaId::random(), &StateVector::new()).unwrap();
    send_message(&mut watcher, &request).await;
    let response = loop {
        let message = next_message(&mut watcher).await;
        if message.msg_type == MessageType::SyncResponse {
            break message;
        }
    };
    let (operations, _) = response.sync_payload().unwrap();
    assert_eq!(operations, kept);
}
