use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use reqwest::Client;
use serde::Serialize;
use shared::{
    domain::{RoomSummary, User},
    error::ApiError,
    protocol::{
        keepalive_probe, Command, CommandRequest, CommandResponse, Frame, MessagePayload,
        StructuredFrame,
    },
};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    config::ClientConfig,
    error::ClientError,
    prefs::{PreferenceStore, KEY_AUTH_TOKEN},
};

/// Transport state as reported to subscribers. `Idle` exists only before
/// the first `connect()`; afterwards the machine cycles
/// `Connecting -> Open -> Closed -> Connecting` until attempts run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Transport state transition. Redundant states are suppressed; each
    /// backoff retry re-fires `Connecting`.
    Connectivity(ConnectionState),
    /// One inbound frame, in arrival order.
    Frame(Frame),
    /// Login, logout or a joined-room change replaced the current user.
    AuthChanged(Option<User>),
    /// The reconnect budget is spent; the session parks in `Closed`.
    ReconnectsExhausted { attempts: u32 },
}

/// Result of `send_command`: the socket path is fire-and-forget, the REST
/// fallback carries the parsed server response.
#[derive(Debug)]
pub enum CommandOutcome {
    Sent,
    Response(CommandResponse),
}

struct SessionState {
    token: Option<String>,
    user: Option<User>,
    connection: ConnectionState,
    reported: Option<ConnectionState>,
    run_started: bool,
    outbound: Option<mpsc::UnboundedSender<String>>,
    pending: HashMap<String, oneshot::Sender<Result<CommandResponse, ClientError>>>,
}

/// The single connection session: one WebSocket, reconnect with capped
/// exponential backoff, command sending with REST fallback, and fan-out of
/// every inbound frame. Consolidates what the legacy client spread across
/// two divergent service implementations.
pub struct ConnectionSession {
    http: Client,
    config: ClientConfig,
    prefs: Arc<PreferenceStore>,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Serialize)]
struct LoginHttpRequest<'a> {
    email: &'a str,
    password: &'a str,
    client_type: &'a str,
}

impl ConnectionSession {
    pub fn new(config: ClientConfig, prefs: Arc<PreferenceStore>) -> Arc<Self> {
        let token: Option<String> = prefs.get(KEY_AUTH_TOKEN);
        let (events, _) = broadcast::channel(1024);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            http: Client::new(),
            config,
            prefs,
            inner: Mutex::new(SessionState {
                token,
                user: None,
                connection: ConnectionState::Idle,
                reported: None,
                run_started: false,
                outbound: None,
                pending: HashMap::new(),
            }),
            events,
            shutdown_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.lock().await.connection
    }

    pub async fn token(&self) -> Option<String> {
        self.inner.lock().await.token.clone()
    }

    pub async fn current_user(&self) -> Option<User> {
        self.inner.lock().await.user.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.lock().await.token.is_some()
    }

    /// Starts the connect/reconnect loop. Idempotent: while a loop is
    /// running this is a no-op.
    pub async fn connect(self: &Arc<Self>) {
        {
            let mut guard = self.inner.lock().await;
            if guard.run_started {
                return;
            }
            guard.run_started = true;
        }
        let _ = self.shutdown_tx.send(false);
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.run().await;
        });
    }

    /// Stops the session: cancels the keepalive and any pending backoff,
    /// rejects in-flight correlated commands and parks in `Closed`.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        self.reject_pending().await;
        self.set_state(ConnectionState::Closed).await;
    }

    /// Sends a text command. Socket path when open (fire-and-forget);
    /// otherwise falls back to `POST /command`. Both paths failing is an
    /// error the caller must surface.
    pub async fn send_command(&self, command: &Command) -> Result<CommandOutcome, ClientError> {
        self.send_text(&command.to_string()).await
    }

    /// Sends raw text over the socket, chat messages included, with the
    /// same REST fallback as commands.
    pub async fn send_text(&self, text: &str) -> Result<CommandOutcome, ClientError> {
        if let Some(sender) = self.socket_sender().await {
            if sender.send(text.to_string()).is_ok() {
                return Ok(CommandOutcome::Sent);
            }
        }
        let response = self.send_command_rest(text).await?;
        Ok(CommandOutcome::Response(response))
    }

    /// Sends a chat message as a structured `message` frame, falling back
    /// to `POST /messages` when the socket is down.
    pub async fn send_message(&self, payload: &MessagePayload) -> Result<(), ClientError> {
        let frame = serde_json::to_string(&StructuredFrame::Message(payload.clone()))?;
        if let Some(sender) = self.socket_sender().await {
            if sender.send(frame).is_ok() {
                return Ok(());
            }
        }
        let mut request = self
            .http
            .post(format!("{}/messages", self.config.api_url))
            .timeout(self.config.request_timeout)
            .json(payload);
        if let Some(token) = self.token().await {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let message = match response.json::<ApiError>().await {
                Ok(err) => err.message,
                Err(_) => "message send failed".to_string(),
            };
            return Err(ClientError::command(message));
        }
        Ok(())
    }

    /// `GET /conversations`: the rooms and direct threads visible to the
    /// current user.
    pub async fn fetch_conversations(&self) -> Result<Vec<RoomSummary>, ClientError> {
        let response = self
            .get_authorized(format!("{}/conversations", self.config.api_url))
            .await?;
        Ok(response.json().await?)
    }

    /// `GET /conversations/:id/messages`: stored history for one
    /// conversation, oldest first.
    pub async fn fetch_conversation_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<MessagePayload>, ClientError> {
        let response = self
            .get_authorized(format!(
                "{}/conversations/{conversation_id}/messages",
                self.config.api_url
            ))
            .await?;
        Ok(response.json().await?)
    }

    /// Socket-only request/response: prefixes the command with a one-shot
    /// correlation id and waits for the matching `Correlated` frame.
    pub async fn send_command_correlated(
        &self,
        command: &Command,
    ) -> Result<CommandResponse, ClientError> {
        let correlation_id = format!("cmd-{}", Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.inner.lock().await;
            let sender = match (guard.connection, guard.outbound.clone()) {
                (ConnectionState::Open, Some(sender)) => sender,
                _ => return Err(ClientError::NotConnected),
            };
            guard.pending.insert(correlation_id.clone(), tx);
            if sender.send(format!("{correlation_id}|{command}")).is_err() {
                guard.pending.remove(&correlation_id);
                return Err(ClientError::NotConnected);
            }
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.inner.lock().await.pending.remove(&correlation_id);
                Err(ClientError::command("timed out waiting for command response"))
            }
        }
    }

    /// `POST /login`. On success stores the token (preference write
    /// degrades to a no-op on storage failure), replaces the current user
    /// wholesale and notifies subscribers.
    pub async fn login(&self, email: &str, password: &str) -> Result<User, ClientError> {
        let response = self
            .http
            .post(format!("{}/login", self.config.api_url))
            .timeout(self.config.request_timeout)
            .json(&LoginHttpRequest {
                email,
                password,
                client_type: &self.config.client_type,
            })
            .send()
            .await?;
        let body = self.parse_command_response(response).await?;
        self.adopt_auth_response(body, email, None).await
    }

    /// `/register email password username` over the REST command surface.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        username: &str,
    ) -> Result<User, ClientError> {
        let command = Command::Register {
            email: email.into(),
            password: password.into(),
            username: username.into(),
        };
        let body = self.send_command_rest(&command.to_string()).await?;
        self.adopt_auth_response(body, email, Some(username)).await
    }

    /// `GET /auth/me` with the stored token. Any failure invalidates the
    /// session, mirroring the server's view of the token.
    pub async fn fetch_current_user(&self) -> Result<User, ClientError> {
        let Some(token) = self.token().await else {
            return Err(ClientError::Unauthenticated);
        };
        let result: Result<User, ClientError> = async {
            let response = self
                .http
                .get(format!("{}/auth/me", self.config.api_url))
                .timeout(self.config.request_timeout)
                .bearer_auth(&token)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(ClientError::Unauthenticated);
            }
            Ok(response.json::<User>().await?)
        }
        .await;

        match result {
            Ok(user) => {
                self.inner.lock().await.user = Some(user.clone());
                let _ = self.events.send(SessionEvent::AuthChanged(Some(user.clone())));
                Ok(user)
            }
            Err(err) => {
                warn!("current-user refresh failed, logging out: {err}");
                self.logout().await;
                Err(err)
            }
        }
    }

    pub async fn logout(&self) {
        {
            let mut guard = self.inner.lock().await;
            guard.token = None;
            guard.user = None;
        }
        self.prefs.remove(KEY_AUTH_TOKEN);
        let _ = self.events.send(SessionEvent::AuthChanged(None));
    }

    /// `/color #RRGGBB`; updates the local user optimistically since the
    /// socket path carries no confirmation.
    pub async fn change_color(&self, hex: &str) -> Result<(), ClientError> {
        self.send_command(&Command::Color { hex: hex.into() }).await?;
        let updated = {
            let mut guard = self.inner.lock().await;
            match guard.user.as_mut() {
                Some(user) => {
                    user.color = hex.to_string();
                    Some(user.clone())
                }
                None => None,
            }
        };
        if let Some(user) = updated {
            let _ = self.events.send(SessionEvent::AuthChanged(Some(user)));
        }
        Ok(())
    }

    pub async fn list_users(&self) -> Result<CommandOutcome, ClientError> {
        self.send_command(&Command::ListUsers).await
    }

    pub async fn fetch_history(&self) -> Result<CommandOutcome, ClientError> {
        self.send_command(&Command::History).await
    }

    /// Idempotent set add on the current user's joined rooms. Returns true
    /// if the room was newly added.
    pub async fn record_joined_room(&self, name: &str) -> bool {
        let updated = {
            let mut guard = self.inner.lock().await;
            match guard.user.as_mut() {
                Some(user) => user.join_room(name).then(|| user.clone()),
                None => None,
            }
        };
        match updated {
            Some(user) => {
                let _ = self.events.send(SessionEvent::AuthChanged(Some(user)));
                true
            }
            None => false,
        }
    }

    async fn adopt_auth_response(
        &self,
        body: CommandResponse,
        email: &str,
        username: Option<&str>,
    ) -> Result<User, ClientError> {
        let token = body
            .token
            .clone()
            .ok_or_else(|| ClientError::UnexpectedResponse("auth response missing token".into()))?;
        let fallback_name = username.unwrap_or(email);
        let user = User {
            id: body.user_id.clone().unwrap_or_else(|| fallback_name.to_string()),
            username: body.username.clone().unwrap_or_else(|| fallback_name.to_string()),
            email: body.email.clone().unwrap_or_else(|| email.to_string()),
            color: body.color.clone().unwrap_or_else(|| "#FFFFFF".to_string()),
            joined_rooms: body.joined_rooms.clone().unwrap_or_default().into_iter().collect(),
        };

        self.prefs.set(KEY_AUTH_TOKEN, &token);
        {
            let mut guard = self.inner.lock().await;
            guard.token = Some(token);
            guard.user = Some(user.clone());
        }
        let _ = self.events.send(SessionEvent::AuthChanged(Some(user.clone())));

        // A login response may carry the public room list; republish it on
        // the frame path so the room directory picks it up.
        if let Some(rooms) = body.chat_rooms {
            let _ = self
                .events
                .send(SessionEvent::Frame(Frame::Structured(StructuredFrame::RoomList {
                    rooms,
                })));
        }

        Ok(user)
    }

    async fn send_command_rest(&self, command: &str) -> Result<CommandResponse, ClientError> {
        let mut request = self
            .http
            .post(format!("{}/command", self.config.api_url))
            .timeout(self.config.request_timeout)
            .json(&CommandRequest {
                command: command.to_string(),
                client_type: self.config.client_type.clone(),
            });
        if let Some(token) = self.token().await {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        self.parse_command_response(response).await
    }

    async fn get_authorized(&self, url: String) -> Result<reqwest::Response, ClientError> {
        let mut request = self.http.get(url).timeout(self.config.request_timeout);
        if let Some(token) = self.token().await {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let message = match response.json::<ApiError>().await {
                Ok(err) => err.message,
                Err(_) => "request failed".to_string(),
            };
            return Err(ClientError::command(message));
        }
        Ok(response)
    }

    async fn parse_command_response(
        &self,
        response: reqwest::Response,
    ) -> Result<CommandResponse, ClientError> {
        if !response.status().is_success() {
            let message = match response.json::<ApiError>().await {
                Ok(err) => err.message,
                Err(_) => "command failed".to_string(),
            };
            return Err(ClientError::command(message));
        }
        let body: CommandResponse = response.json().await?;
        if !body.success {
            let message = body.message.unwrap_or_else(|| "command failed".to_string());
            return Err(ClientError::command(message));
        }
        Ok(body)
    }

    async fn socket_sender(&self) -> Option<mpsc::UnboundedSender<String>> {
        let guard = self.inner.lock().await;
        match guard.connection {
            ConnectionState::Open => guard.outbound.clone(),
            _ => None,
        }
    }

    async fn set_state(&self, next: ConnectionState) {
        let mut guard = self.inner.lock().await;
        guard.connection = next;
        if guard.reported == Some(next) {
            return;
        }
        guard.reported = Some(next);
        drop(guard);
        let _ = self.events.send(SessionEvent::Connectivity(next));
    }

    async fn reject_pending(&self) {
        let pending = {
            let mut guard = self.inner.lock().await;
            std::mem::take(&mut guard.pending)
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(ClientError::ConnectionClosed));
        }
    }

    async fn ws_url(&self) -> String {
        let token = self.token().await;
        match Url::parse(&self.config.ws_url) {
            Ok(mut url) => {
                if let Some(token) = token {
                    url.query_pairs_mut().append_pair("token", &token);
                }
                url.to_string()
            }
            Err(_) => self.config.ws_url.clone(),
        }
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting).await;

            let opened = self.run_connection(&mut shutdown).await;

            {
                let mut guard = self.inner.lock().await;
                guard.outbound = None;
            }
            self.reject_pending().await;
            self.set_state(ConnectionState::Closed).await;

            if *shutdown.borrow() {
                break;
            }
            if opened {
                attempt = 0;
            }
            if attempt >= self.config.reconnect.max_attempts {
                warn!(attempts = attempt, "reconnect attempts exhausted, giving up");
                let _ = self
                    .events
                    .send(SessionEvent::ReconnectsExhausted { attempts: attempt });
                break;
            }

            let mut delay = self.config.reconnect.delay_for(attempt);
            if self.config.reconnect.jitter {
                let spread = (delay.as_millis() as u64 / 4).max(1);
                delay += Duration::from_millis(rand::thread_rng().gen_range(0..spread));
            }
            attempt += 1;
            info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.inner.lock().await.run_started = false;
    }

    /// One transport lifetime: connect, pump frames, keepalive. Returns
    /// true if the socket reached `Open` (resets the attempt counter even
    /// when the connection later drops).
    async fn run_connection(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let url = self.ws_url().await;
        let ws = match connect_async(&url).await {
            Ok((ws, _)) => ws,
            Err(err) => {
                warn!("websocket connect failed: {err}");
                return false;
            }
        };
        info!("websocket connection established");
        self.set_state(ConnectionState::Open).await;

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        {
            let mut guard = self.inner.lock().await;
            guard.outbound = Some(out_tx);
        }

        // Token-in-message auth pattern, alongside the query credential.
        if let Some(token) = self.token().await {
            let auth = Command::Auth { token };
            if let Err(err) = ws_tx.send(Message::Text(auth.to_string())).await {
                warn!("post-open auth frame failed: {err}");
                return true;
            }
        }

        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await;

        loop {
            tokio::select! {
                inbound = ws_rx.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.dispatch_frame(&text).await,
                    Some(Ok(Message::Close(_))) | None => {
                        info!("websocket closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("websocket receive failed: {err}");
                        break;
                    }
                },
                outbound = out_rx.recv() => match outbound {
                    Some(text) => {
                        if let Err(err) = ws_tx.send(Message::Text(text)).await {
                            warn!("websocket send failed: {err}");
                            break;
                        }
                    }
                    None => break,
                },
                _ = keepalive.tick() => {
                    if let Err(err) = ws_tx.send(Message::Text(keepalive_probe())).await {
                        warn!("keepalive probe failed: {err}");
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }

        true
    }

    /// Decode once at the boundary, settle a matching pending command, and
    /// fan the frame out in arrival order. Never errors on malformed input.
    async fn dispatch_frame(&self, text: &str) {
        let frame = Frame::decode(text);

        if let Frame::Correlated {
            correlation_id,
            payload,
        } = &frame
        {
            let waiter = self.inner.lock().await.pending.remove(correlation_id);
            if let Some(tx) = waiter {
                let response = serde_json::from_str::<CommandResponse>(payload).unwrap_or_else(|_| {
                    CommandResponse {
                        success: true,
                        message: Some(payload.clone()),
                        ..CommandResponse::default()
                    }
                });
                let _ = tx.send(Ok(response));
            }
        }

        let _ = self.events.send(SessionEvent::Frame(frame));
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
