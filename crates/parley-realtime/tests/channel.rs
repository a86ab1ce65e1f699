//! Channel against a minimal Socket.IO server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use tokio::sync::mpsc;
use url::Url;

use parley_realtime::{ChannelConfig, ChannelStatus, RealtimeChannel, RealtimeError};
use parley_types::UserId;
use parley_types::events::{RealtimeCommand, RealtimeEvent};

const OPEN: &str =
    r#"0{"sid":"eio1","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;

#[derive(Clone)]
struct Server {
    connections: Arc<AtomicUsize>,
    /// Every text frame the client sent after joining the namespace.
    seen: mpsc::UnboundedSender<String>,
    /// Close the first connection right after greeting it.
    drop_first: bool,
}

async fn upgrade(State(server): State<Server>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| session(server, socket))
}

async fn recv_text(socket: &mut WebSocket) -> Option<String> {
    loop {
        match socket.recv().await? {
            Ok(Message::Text(text)) => return Some(text.as_str().to_string()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn session(server: Server, mut socket: WebSocket) {
    let n = server.connections.fetch_add(1, Ordering::SeqCst) + 1;
    if socket.send(Message::Text(OPEN.into())).await.is_err() {
        return;
    }
    let Some(connect) = recv_text(&mut socket).await else {
        return;
    };
    if connect != r#"40{"token":"t1"}"# {
        let _ = socket
            .send(Message::Text(r#"44{"message":"invalid token"}"#.into()))
            .await;
        return;
    }
    let _ = socket.send(Message::Text(r#"40{"sid":"s1"}"#.into())).await;

    let online = if n == 1 { r#"["u1","u2"]"# } else { r#"["u3"]"# };
    let _ = socket
        .send(Message::Text(format!(r#"42["online-users",{}]"#, online).into()))
        .await;
    if server.drop_first && n == 1 {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let _ = socket.send(Message::Text("2".into())).await;
    while let Some(frame) = recv_text(&mut socket).await {
        let typing = frame.starts_with(r#"42["typing-start""#);
        let _ = server.seen.send(frame);
        if typing {
            let _ = socket
                .send(Message::Text(
                    r#"42["typing-start",{"userId":"u9","username":"nina"}]"#.into(),
                ))
                .await;
        }
    }
}

async fn serve(drop_first: bool) -> (Url, mpsc::UnboundedReceiver<String>, Arc<AtomicUsize>) {
    let (seen, seen_rx) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));
    let server = Server {
        connections: connections.clone(),
        seen,
        drop_first,
    };
    let app = Router::new()
        .route("/socket.io/", get(upgrade))
        .with_state(server);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (
        Url::parse(&format!("http://{}", addr)).unwrap(),
        seen_rx,
        connections,
    )
}

fn config(url: Url) -> ChannelConfig {
    ChannelConfig {
        url,
        reconnect_attempts: 3,
        reconnect_delay: Duration::from_millis(20),
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<RealtimeEvent>) -> Option<RealtimeEvent> {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
}

#[tokio::test]
async fn exchanges_events_and_answers_pings() {
    let (url, mut seen, _) = serve(false).await;
    let (channel, mut events) = RealtimeChannel::connect(config(url), || Some("t1".to_string()))
        .await
        .unwrap();

    assert_eq!(
        next_event(&mut events).await,
        Some(RealtimeEvent::OnlineUsers(vec![
            UserId::from("u1"),
            UserId::from("u2")
        ]))
    );
    assert_eq!(seen.recv().await.unwrap(), "3");

    channel
        .emit(RealtimeCommand::TypingStart {
            friend_id: UserId::from("u9"),
        })
        .unwrap();
    assert_eq!(
        seen.recv().await.unwrap(),
        r#"42["typing-start",{"friendId":"u9"}]"#
    );
    assert_eq!(
        next_event(&mut events).await,
        Some(RealtimeEvent::TypingStarted {
            user_id: UserId::from("u9"),
            username: Some("nina".into()),
        })
    );
    assert_eq!(channel.status(), ChannelStatus::Connected);

    channel.disconnect().await;
    assert_eq!(next_event(&mut events).await, None);
}

#[tokio::test]
async fn rejected_token_fails_connect() {
    let (url, _, _) = serve(false).await;
    let result = RealtimeChannel::connect(config(url), || Some("wrong".to_string())).await;
    match result {
        Err(RealtimeError::Rejected(reason)) => assert_eq!(reason, "invalid token"),
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("connect should have been rejected"),
    }
}

#[tokio::test]
async fn missing_token_fails_connect() {
    let (url, _, connections) = serve(false).await;
    let result = RealtimeChannel::connect(config(url), || None).await;
    assert!(matches!(result, Err(RealtimeError::NoCredential)));
    assert_eq!(connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reconnects_after_server_drop() {
    let (url, _, connections) = serve(true).await;
    let (channel, mut events) = RealtimeChannel::connect(config(url), || Some("t1".to_string()))
        .await
        .unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        Some(RealtimeEvent::OnlineUsers(users)) if users.len() == 2
    ));
    assert_eq!(
        next_event(&mut events).await,
        Some(RealtimeEvent::OnlineUsers(vec![UserId::from("u3")]))
    );
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    channel.disconnect().await;
    assert_eq!(next_event(&mut events).await, None);
}
