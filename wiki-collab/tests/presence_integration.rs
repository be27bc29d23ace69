//! Presence across real sessions: join, leave and silent peers.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use wiki_collab::{
    AwarenessConfig, AwarenessMessage, AwarenessState, CursorSelection, EditingSession,
    MemorySnapshotStore, MessageType, RelayConfig, SessionConfig, SyncMessage, SyncRelay,
    UserProfile,
};

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_relay_on(port: u16) -> Arc<SyncRelay> {
    let relay = Arc::new(SyncRelay::new(RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..RelayConfig::default()
    }));
    let server = relay.clone();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    relay
}

fn open(port: u16, doc: &str, name: &str) -> EditingSession {
    EditingSession::open(
        SessionConfig::for_testing(
            format!("ws://127.0.0.1:{port}"),
            doc,
            UserProfile::new(format!("id-{name}"), name),
        ),
        Arc::new(MemorySnapshotStore::new()),
    )
}

fn names(session: &EditingSession) -> Vec<String> {
    session.presence().iter().map(|p| p.name.clone()).collect()
}

/// Drive `session` until `done` holds, failing after `limit`.
async fn drive_until<F>(session: &mut EditingSession, limit: Duration, mut done: F)
where
    F: FnMut(&EditingSession) -> bool,
{
    let start = Instant::now();
    while !done(session) {
        assert!(
            start.elapsed() < limit,
            "timed out, presence = {:?}",
            names(session)
        );
        let _ = timeout(Duration::from_millis(20), session.next_event()).await;
    }
}

async fn drive_both<F>(a: &mut EditingSession, b: &mut EditingSession, mut done: F)
where
    F: FnMut(&EditingSession, &EditingSession) -> bool,
{
    let start = Instant::now();
    while !done(a, b) {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "timed out: a={:?} b={:?}",
            names(a),
            names(b)
        );
        let _ = timeout(Duration::from_millis(20), a.next_event()).await;
        let _ = timeout(Duration::from_millis(20), b.next_event()).await;
    }
}

#[tokio::test]
async fn test_sessions_see_each_other() {
    let port = free_port().await;
    let _relay = start_relay_on(port).await;

    let mut a = open(port, "doc-presence", "Alice");
    let mut b = open(port, "doc-presence", "Bob");

    drive_both(&mut a, &mut b, |a, b| {
        a.presence().len() == 2 && b.presence().len() == 2
    })
    .await;

    // Local user always comes first.
    assert_eq!(names(&a), vec!["Alice", "Bob"]);
    assert_eq!(names(&b), vec!["Bob", "Alice"]);
    assert_eq!(a.presence()[1].id, "id-Bob");
    assert_eq!(a.presence()[1].color, UserProfile::new("id-Bob", "Bob").color);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_closed_session_leaves_presence() {
    let port = free_port().await;
    let _relay = start_relay_on(port).await;

    let mut a = open(port, "doc-leave", "Alice");
    let mut b = open(port, "doc-leave", "Bob");
    drive_both(&mut a, &mut b, |a, b| {
        a.presence().len() == 2 && b.presence().len() == 2
    })
    .await;

    b.close().await.unwrap();

    // Well under the stale timeout: removal comes from the leave, not expiry.
    drive_until(&mut a, Duration::from_millis(800), |a| a.presence().len() == 1).await;
    assert_eq!(names(&a), vec!["Alice"]);

    a.close().await.unwrap();
}

#[tokio::test]
async fn test_cursor_updates_keep_peer_listed() {
    let port = free_port().await;
    let _relay = start_relay_on(port).await;

    let mut a = open(port, "doc-cursor", "Alice");
    let mut b = open(port, "doc-cursor", "Bob");
    drive_both(&mut a, &mut b, |a, b| {
        a.presence().len() == 2 && b.presence().len() == 2
    })
    .await;

    b.push("some text");
    b.set_cursor(Some(CursorSelection { anchor: 0, head: 4 }));

    // Both keep heartbeating, so nobody expires past the stale timeout.
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(1500) {
        let _ = timeout(Duration::from_millis(20), a.next_event()).await;
        let _ = timeout(Duration::from_millis(20), b.next_event()).await;
    }
    assert_eq!(names(&a), vec!["Alice", "Bob"]);
    assert_eq!(a.content(), "some text");

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_silent_peer_is_evicted_after_stale_timeout() {
    let port = free_port().await;
    let _relay = start_relay_on(port).await;

    let mut a = open(port, "doc-silent", "Alice");
    drive_until(&mut a, Duration::from_secs(5), |a| a.is_syncing()).await;

    // A raw client announces itself once and then never heartbeats.
    let (mut ws, _) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/doc-silent"))
            .await
            .unwrap();
    let ghost = Uuid::new_v4();
    let profile = UserProfile::new("id-ghost", "Ghost");
    let join = SyncMessage::join(ghost, "doc-silent", &profile).unwrap();
    ws.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();
    let hello = AwarenessMessage::Update {
        state: AwarenessState {
            client_id: ghost,
            user: profile,
            cursor: None,
        },
        clock: 1,
    };
    let frame = SyncMessage::awareness(ghost, "doc-silent", 1, hello.encode().unwrap());
    ws.send(Message::Binary(frame.encode().unwrap().into())).await.unwrap();

    drive_until(&mut a, Duration::from_secs(5), |a| a.presence().len() == 2).await;
    assert_eq!(names(&a), vec!["Alice", "Ghost"]);
    let seen = Instant::now();

    // The socket stays open; only the stale timeout can remove it.
    drive_until(&mut a, Duration::from_secs(5), |a| a.presence().len() == 1).await;
    assert!(seen.elapsed() >= Duration::from_millis(900));
    assert_eq!(names(&a), vec!["Alice"]);

    let _ = ws.close(None).await;
    a.close().await.unwrap();
}

#[tokio::test]
async fn test_last_throttled_cursor_reaches_peers() {
    let port = free_port().await;
    let _relay = start_relay_on(port).await;

    // A raw watcher records every cursor the session publishes.
    let (mut ws, _) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/doc-trailing"))
            .await
            .unwrap();
    let watcher = Uuid::new_v4();
    let join = SyncMessage::join(watcher, "doc-trailing", &UserProfile::new("id-w", "Watcher"))
        .unwrap();
    ws.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (cursor_tx, mut cursors) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(Ok(frame)) = ws.next().await {
            let Message::Binary(bytes) = frame else { continue };
            let Ok(msg) = SyncMessage::decode(&bytes) else { continue };
            if msg.msg_type != MessageType::Awareness {
                continue;
            }
            if let Ok(AwarenessMessage::Update { state, .. }) = AwarenessMessage::decode(&msg.payload) {
                if cursor_tx.send(state.cursor).is_err() {
                    break;
                }
            }
        }
    });

    // Heartbeats are far apart, so only a trailing publish can carry the last move.
    let mut config = SessionConfig::for_testing(
        format!("ws://127.0.0.1:{port}"),
        "doc-trailing",
        UserProfile::new("id-Alice", "Alice"),
    );
    config.awareness = AwarenessConfig {
        heartbeat_interval: Duration::from_secs(30),
        cursor_throttle: Duration::from_millis(300),
        ..AwarenessConfig::for_testing()
    };
    let mut a = EditingSession::open(config, Arc::new(MemorySnapshotStore::new()));
    drive_until(&mut a, Duration::from_secs(5), |a| a.is_syncing()).await;

    // Both moves fall inside the throttle window opened by the connect publish.
    a.set_cursor(Some(CursorSelection::caret(1)));
    a.set_cursor(Some(CursorSelection::caret(5)));

    let start = Instant::now();
    loop {
        assert!(start.elapsed() < Duration::from_secs(3), "final cursor never published");
        let _ = timeout(Duration::from_millis(20), a.next_event()).await;
        let mut last = None;
        while let Ok(cursor) = cursors.try_recv() {
            last = Some(cursor);
        }
        if last == Some(Some(CursorSelection::caret(5))) {
            break;
        }
    }

    a.close().await.unwrap();
}
