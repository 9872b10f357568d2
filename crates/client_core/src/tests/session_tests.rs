use super::*;
use axum::{
    extract::ws::{Message as WsMessage, WebSocketUpgrade},
    extract::Path,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;

use crate::config::ReconnectPolicy;

fn test_config(api_url: impl Into<String>, ws_url: impl Into<String>) -> ClientConfig {
    ClientConfig {
        api_url: api_url.into(),
        ws_url: ws_url.into(),
        client_type: "test".into(),
        request_timeout: Duration::from_secs(2),
        keepalive_interval: Duration::from_millis(50),
        reconnect: ReconnectPolicy {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(40),
            max_attempts: 2,
            jitter: false,
        },
    }
}

fn test_prefs() -> (tempfile::TempDir, Arc<PreferenceStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let prefs = Arc::new(PreferenceStore::open(dir.path().join("prefs.json")));
    (dir, prefs)
}

async fn spawn_server(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("127.0.0.1:{}", addr.port())
}

async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

async fn wait_for_open(rx: &mut broadcast::Receiver<SessionEvent>) {
    loop {
        if let SessionEvent::Connectivity(ConnectionState::Open) = next_event(rx).await {
            return;
        }
    }
}

async fn send_frame_then_idle(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        let frame = r#"{"type":"message","payload":{"id":"m1","content":"hi","sender":"alice"}}"#;
        if socket.send(WsMessage::Text(frame.into())).await.is_err() {
            return;
        }
        while let Some(Ok(_)) = socket.recv().await {}
    })
}

async fn echo_correlated(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        while let Some(Ok(msg)) = socket.recv().await {
            if let WsMessage::Text(text) = msg {
                if let Some((id, _)) = text.split_once('|') {
                    let reply = format!("{id}|{{\"success\":true,\"message\":\"ok\"}}");
                    if socket.send(WsMessage::Text(reply)).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

async fn drop_on_correlated(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        while let Some(Ok(msg)) = socket.recv().await {
            if let WsMessage::Text(text) = msg {
                if text.contains('|') {
                    break;
                }
            }
        }
    })
}

async fn pong_on_ping(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        while let Some(Ok(msg)) = socket.recv().await {
            if let WsMessage::Text(text) = msg {
                if text.contains("ping")
                    && socket
                        .send(WsMessage::Text(r#"{"type":"pong"}"#.into()))
                        .await
                        .is_err()
                {
                    break;
                }
            }
        }
    })
}

#[tokio::test]
async fn delivers_structured_frames_in_arrival_order() {
    let app = Router::new().route("/ws", get(send_frame_then_idle));
    let addr = spawn_server(app).await;
    let (_dir, prefs) = test_prefs();
    let session = ConnectionSession::new(
        test_config(format!("http://{addr}"), format!("ws://{addr}/ws")),
        prefs,
    );

    let mut events = session.subscribe();
    session.connect().await;
    wait_for_open(&mut events).await;

    loop {
        if let SessionEvent::Frame(Frame::Structured(StructuredFrame::Message(payload))) =
            next_event(&mut events).await
        {
            assert_eq!(payload.id.as_deref(), Some("m1"));
            assert_eq!(payload.content, "hi");
            break;
        }
    }

    // Socket path is fire-and-forget while open.
    let outcome = session.send_command(&Command::Rooms).await.expect("send");
    assert!(matches!(outcome, CommandOutcome::Sent));

    session.close().await;
}

#[tokio::test]
async fn keepalive_probe_gets_ponged() {
    let app = Router::new().route("/ws", get(pong_on_ping));
    let addr = spawn_server(app).await;
    let (_dir, prefs) = test_prefs();
    let session = ConnectionSession::new(
        test_config(format!("http://{addr}"), format!("ws://{addr}/ws")),
        prefs,
    );

    let mut events = session.subscribe();
    session.connect().await;
    wait_for_open(&mut events).await;

    loop {
        if let SessionEvent::Frame(Frame::Structured(StructuredFrame::Pong)) =
            next_event(&mut events).await
        {
            break;
        }
    }

    session.close().await;
}

#[tokio::test]
async fn correlated_command_settles_with_matching_reply() {
    let app = Router::new().route("/ws", get(echo_correlated));
    let addr = spawn_server(app).await;
    let (_dir, prefs) = test_prefs();
    let session = ConnectionSession::new(
        test_config(format!("http://{addr}"), format!("ws://{addr}/ws")),
        prefs,
    );

    let mut events = session.subscribe();
    session.connect().await;
    wait_for_open(&mut events).await;

    let response = session
        .send_command_correlated(&Command::Rooms)
        .await
        .expect("correlated response");
    assert!(response.success);
    assert_eq!(response.message.as_deref(), Some("ok"));

    session.close().await;
}

#[tokio::test]
async fn pending_commands_are_rejected_on_connection_drop() {
    let app = Router::new().route("/ws", get(drop_on_correlated));
    let addr = spawn_server(app).await;
    let (_dir, prefs) = test_prefs();
    let session = ConnectionSession::new(
        test_config(format!("http://{addr}"), format!("ws://{addr}/ws")),
        prefs,
    );

    let mut events = session.subscribe();
    session.connect().await;
    wait_for_open(&mut events).await;

    let result = session.send_command_correlated(&Command::Rooms).await;
    assert!(matches!(result, Err(ClientError::ConnectionClosed)));

    session.close().await;
}

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts_without_duplicate_states() {
    let (_dir, prefs) = test_prefs();
    // Nothing listens on port 1; every connect attempt fails fast.
    let session = ConnectionSession::new(test_config("http://127.0.0.1:1", "ws://127.0.0.1:1/ws"), prefs);

    let mut events = session.subscribe();
    session.connect().await;

    let mut connectivity = Vec::new();
    let attempts = loop {
        match next_event(&mut events).await {
            SessionEvent::Connectivity(state) => connectivity.push(state),
            SessionEvent::ReconnectsExhausted { attempts } => break attempts,
            _ => {}
        }
    };

    assert_eq!(attempts, 2);
    // Initial attempt plus two retries, each firing Connecting then Closed.
    assert_eq!(
        connectivity,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Closed,
            ConnectionState::Connecting,
            ConnectionState::Closed,
            ConnectionState::Connecting,
            ConnectionState::Closed,
        ]
    );
    for pair in connectivity.windows(2) {
        assert_ne!(pair[0], pair[1], "redundant connectivity notification");
    }
}

#[tokio::test]
async fn send_message_emits_structured_frame_when_open() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
    let app = Router::new().route(
        "/ws",
        get(move |ws: WebSocketUpgrade| {
            let seen_tx = seen_tx.clone();
            async move {
                ws.on_upgrade(move |mut socket| async move {
                    while let Some(Ok(msg)) = socket.recv().await {
                        if let WsMessage::Text(text) = msg {
                            let _ = seen_tx.send(text);
                        }
                    }
                })
            }
        }),
    );
    let addr = spawn_server(app).await;
    let (_dir, prefs) = test_prefs();
    let session = ConnectionSession::new(
        test_config(format!("http://{addr}"), format!("ws://{addr}/ws")),
        prefs,
    );

    let mut events = session.subscribe();
    session.connect().await;
    wait_for_open(&mut events).await;

    session
        .send_message(&MessagePayload {
            content: "hello".into(),
            ..MessagePayload::default()
        })
        .await
        .expect("send");

    // Keepalive pings share the socket; skip until the message shows up.
    loop {
        let raw = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("socket closed");
        if let Frame::Structured(StructuredFrame::Message(payload)) = Frame::decode(&raw) {
            assert_eq!(payload.content, "hello");
            break;
        }
    }

    session.close().await;
}

#[tokio::test]
async fn send_message_falls_back_to_rest_when_closed() {
    let app = Router::new().route(
        "/messages",
        post(|Json(payload): Json<MessagePayload>| async move {
            assert_eq!(payload.content, "hello");
            (StatusCode::CREATED, Json(serde_json::json!({"id": "m1"})))
        }),
    );
    let addr = spawn_server(app).await;
    let (_dir, prefs) = test_prefs();
    let session = ConnectionSession::new(
        test_config(format!("http://{addr}"), "ws://127.0.0.1:1/ws"),
        prefs,
    );

    session
        .send_message(&MessagePayload {
            content: "hello".into(),
            ..MessagePayload::default()
        })
        .await
        .expect("rest fallback");
}

#[tokio::test]
async fn send_message_surfaces_rest_error() {
    let app = Router::new().route(
        "/messages",
        post(|| async {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"message": "storage offline"})),
            )
        }),
    );
    let addr = spawn_server(app).await;
    let (_dir, prefs) = test_prefs();
    let session = ConnectionSession::new(
        test_config(format!("http://{addr}"), "ws://127.0.0.1:1/ws"),
        prefs,
    );

    let result = session
        .send_message(&MessagePayload {
            content: "hello".into(),
            ..MessagePayload::default()
        })
        .await;
    match result {
        Err(ClientError::Command { message }) => assert_eq!(message, "storage offline"),
        other => panic!("expected command error, got {other:?}"),
    }
}

#[tokio::test]
async fn fetch_conversations_parses_listing() {
    let app = Router::new().route(
        "/conversations",
        get(|| async {
            Json(serde_json::json!([
                {"id": "c1", "name": "general", "users_count": 2},
                {"name": "alice"}
            ]))
        }),
    );
    let addr = spawn_server(app).await;
    let (_dir, prefs) = test_prefs();
    let session = ConnectionSession::new(
        test_config(format!("http://{addr}"), "ws://127.0.0.1:1/ws"),
        prefs,
    );

    let conversations = session.fetch_conversations().await.expect("conversations");
    assert_eq!(conversations.len(), 2);
    assert_eq!(conversations[0].identity(), "c1");
    assert_eq!(conversations[0].participants, 2);
    assert_eq!(conversations[1].identity(), "alice");
}

#[tokio::test]
async fn fetch_conversation_messages_parses_history() {
    let app = Router::new().route(
        "/conversations/:id/messages",
        get(|Path(id): Path<String>| async move {
            assert_eq!(id, "c1");
            Json(serde_json::json!([
                {"id": "m1", "content": "hi", "sender": "alice"},
                {"id": "m2", "content": "hey", "sender": "bob"}
            ]))
        }),
    );
    let addr = spawn_server(app).await;
    let (_dir, prefs) = test_prefs();
    let session = ConnectionSession::new(
        test_config(format!("http://{addr}"), "ws://127.0.0.1:1/ws"),
        prefs,
    );

    let messages = session
        .fetch_conversation_messages("c1")
        .await
        .expect("history");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "hi");
    assert_eq!(messages[1].sender.as_deref(), Some("bob"));
}

#[tokio::test]
async fn send_command_falls_back_to_rest_when_closed() {
    let app = Router::new().route(
        "/command",
        post(|Json(body): Json<CommandRequest>| async move {
            assert_eq!(body.command, "/rooms");
            Json(serde_json::json!({
                "success": true,
                "rooms": [{"name": "general", "users_count": 3}]
            }))
        }),
    );
    let addr = spawn_server(app).await;
    let (_dir, prefs) = test_prefs();
    let session = ConnectionSession::new(
        test_config(format!("http://{addr}"), "ws://127.0.0.1:1/ws"),
        prefs,
    );

    let outcome = session.send_command(&Command::Rooms).await.expect("rest fallback");
    match outcome {
        CommandOutcome::Response(response) => {
            let rooms = response.rooms.expect("rooms");
            assert_eq!(rooms.len(), 1);
            assert_eq!(rooms[0].participants, 3);
        }
        CommandOutcome::Sent => panic!("expected REST response while disconnected"),
    }
}

#[tokio::test]
async fn rest_fallback_surfaces_server_error_message() {
    let app = Router::new().route(
        "/command",
        post(|| async {
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({"message": "room already exists"})),
            )
        }),
    );
    let addr = spawn_server(app).await;
    let (_dir, prefs) = test_prefs();
    let session = ConnectionSession::new(
        test_config(format!("http://{addr}"), "ws://127.0.0.1:1/ws"),
        prefs,
    );

    let result = session
        .send_command(&Command::CreateRoom {
            name: "general".into(),
            password: None,
        })
        .await;
    match result {
        Err(ClientError::Command { message }) => assert_eq!(message, "room already exists"),
        other => panic!("expected command error, got {other:?}"),
    }
}

#[tokio::test]
async fn rest_fallback_rejects_unsuccessful_body() {
    let app = Router::new().route(
        "/command",
        post(|| async { Json(serde_json::json!({"success": false, "message": "nope"})) }),
    );
    let addr = spawn_server(app).await;
    let (_dir, prefs) = test_prefs();
    let session = ConnectionSession::new(
        test_config(format!("http://{addr}"), "ws://127.0.0.1:1/ws"),
        prefs,
    );

    let result = session.send_command(&Command::History).await;
    match result {
        Err(ClientError::Command { message }) => assert_eq!(message, "nope"),
        other => panic!("expected command error, got {other:?}"),
    }
}

#[tokio::test]
async fn send_command_errors_when_socket_and_rest_are_down() {
    let (_dir, prefs) = test_prefs();
    let session = ConnectionSession::new(test_config("http://127.0.0.1:1", "ws://127.0.0.1:1/ws"), prefs);

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        session.send_command(&Command::Rooms),
    )
    .await
    .expect("send_command must not hang");
    assert!(matches!(result, Err(ClientError::Http(_))));
}

#[tokio::test]
async fn login_adopts_token_and_user() {
    let app = Router::new().route(
        "/login",
        post(|| async {
            Json(serde_json::json!({
                "success": true,
                "token": "tok-1",
                "user_id": "u1",
                "username": "alice",
                "email": "alice@example.com",
                "color": "#AA0000",
                "joined_rooms": ["general", "general"]
            }))
        }),
    );
    let addr = spawn_server(app).await;
    let (_dir, prefs) = test_prefs();
    let session = ConnectionSession::new(
        test_config(format!("http://{addr}"), "ws://127.0.0.1:1/ws"),
        Arc::clone(&prefs),
    );

    let mut events = session.subscribe();
    let user = session.login("alice@example.com", "pw").await.expect("login");
    assert_eq!(user.id, "u1");
    assert_eq!(user.color, "#AA0000");
    // Joined rooms are a set.
    assert_eq!(user.joined_rooms.len(), 1);

    assert!(session.is_authenticated().await);
    assert_eq!(prefs.get::<String>(KEY_AUTH_TOKEN).as_deref(), Some("tok-1"));

    match next_event(&mut events).await {
        SessionEvent::AuthChanged(Some(user)) => assert_eq!(user.username, "alice"),
        other => panic!("expected auth change, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_login_reports_server_message() {
    let app = Router::new().route(
        "/login",
        post(|| async {
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"message": "bad credentials"})),
            )
        }),
    );
    let addr = spawn_server(app).await;
    let (_dir, prefs) = test_prefs();
    let session = ConnectionSession::new(
        test_config(format!("http://{addr}"), "ws://127.0.0.1:1/ws"),
        prefs,
    );

    let result = session.login("alice@example.com", "wrong").await;
    match result {
        Err(ClientError::Command { message }) => assert_eq!(message, "bad credentials"),
        other => panic!("expected command error, got {other:?}"),
    }
    assert!(!session.is_authenticated().await);
}

#[tokio::test]
async fn logout_clears_token_and_stored_preference() {
    let app = Router::new().route(
        "/login",
        post(|| async {
            Json(serde_json::json!({
                "success": true,
                "token": "tok-1",
                "user_id": "u1",
                "username": "alice"
            }))
        }),
    );
    let addr = spawn_server(app).await;
    let (_dir, prefs) = test_prefs();
    let session = ConnectionSession::new(
        test_config(format!("http://{addr}"), "ws://127.0.0.1:1/ws"),
        Arc::clone(&prefs),
    );

    session.login("alice@example.com", "pw").await.expect("login");
    session.logout().await;

    assert!(!session.is_authenticated().await);
    assert!(session.current_user().await.is_none());
    assert_eq!(prefs.get::<String>(KEY_AUTH_TOKEN), None);
}

#[tokio::test]
async fn record_joined_room_is_idempotent() {
    let app = Router::new().route(
        "/login",
        post(|| async {
            Json(serde_json::json!({
                "success": true,
                "token": "tok-1",
                "user_id": "u1",
                "username": "alice"
            }))
        }),
    );
    let addr = spawn_server(app).await;
    let (_dir, prefs) = test_prefs();
    let session = ConnectionSession::new(
        test_config(format!("http://{addr}"), "ws://127.0.0.1:1/ws"),
        prefs,
    );

    session.login("alice@example.com", "pw").await.expect("login");
    assert!(session.record_joined_room("general").await);
    assert!(!session.record_joined_room("general").await);

    let user = session.current_user().await.expect("user");
    assert_eq!(user.joined_rooms.len(), 1);
}
