use std::sync::Arc;

use reqwest::Client;
use shared::{
    domain::{RoomSummary, User},
    protocol::{Command, Frame, StructuredFrame},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::ClientError,
    session::{ConnectionSession, SessionEvent},
};

/// A room as the directory exposes it to the UI: identity-keyed, merged
/// from the public listing, the user's joined set and server pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    /// Identity key: the server id when known, otherwise the name.
    pub id: String,
    pub name: String,
    pub is_group: bool,
    pub creator: Option<String>,
    pub participants: u32,
    pub last_message: Option<String>,
    pub unread_count: u32,
    pub requires_password: bool,
}

impl Room {
    fn from_summary(summary: &RoomSummary) -> Self {
        Self {
            id: summary.identity().to_string(),
            name: summary.name.clone(),
            is_group: true,
            creator: summary.creator.clone(),
            participants: summary.participants,
            last_message: summary.last_message.clone(),
            unread_count: summary.unread_count,
            requires_password: summary.requires_password,
        }
    }

    /// Folds an overlapping record into this one. Identity is kept;
    /// non-empty and more specific incoming values win.
    fn absorb(&mut self, incoming: &RoomSummary) {
        if incoming.participants > 0 {
            self.participants = incoming.participants;
        }
        if incoming.unread_count > 0 {
            self.unread_count = incoming.unread_count;
        }
        if let Some(creator) = incoming.creator.as_deref() {
            if !creator.is_empty() {
                self.creator = Some(creator.to_string());
            }
        }
        if let Some(last) = incoming.last_message.as_deref() {
            if !last.is_empty() {
                self.last_message = Some(last.to_string());
            }
        }
        if incoming.requires_password {
            self.requires_password = true;
        }
    }
}

fn position_for(cache: &[Room], incoming: &RoomSummary) -> Option<usize> {
    cache
        .iter()
        .position(|room| room.id == incoming.identity() || room.name == incoming.name)
}

/// Stable identity-keyed merge: public rooms in fetch order, joined-only
/// rooms appended in their order, never two entries with one identity.
fn merge_rooms(public: &[RoomSummary], joined: &[RoomSummary]) -> Vec<Room> {
    let mut merged: Vec<Room> = Vec::with_capacity(public.len());
    for summary in public {
        match position_for(&merged, summary) {
            Some(index) => merged[index].absorb(summary),
            None => merged.push(Room::from_summary(summary)),
        }
    }
    for summary in joined {
        match position_for(&merged, summary) {
            Some(index) => merged[index].absorb(summary),
            None => merged.push(Room::from_summary(summary)),
        }
    }
    merged
}

fn joined_summaries(user: Option<&User>) -> Vec<RoomSummary> {
    user.map(|user| {
        user.joined_rooms
            .iter()
            .map(|name| RoomSummary {
                name: name.clone(),
                ..RoomSummary::default()
            })
            .collect()
    })
    .unwrap_or_default()
}

struct DirectoryState {
    cache: Vec<Room>,
    has_snapshot: bool,
}

/// Maintains the merged, de-duplicated set of rooms visible to the current
/// user and republishes it on every change. Network failure degrades to
/// the last good snapshot, never an error.
pub struct RoomDirectory {
    session: Arc<ConnectionSession>,
    http: Client,
    api_url: String,
    inner: Mutex<DirectoryState>,
    events: broadcast::Sender<Vec<Room>>,
}

impl RoomDirectory {
    pub fn new(session: Arc<ConnectionSession>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let api_url = session.config().api_url.clone();
        Arc::new(Self {
            session,
            http: Client::new(),
            api_url,
            inner: Mutex::new(DirectoryState {
                cache: Vec::new(),
                has_snapshot: false,
            }),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<Room>> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> Vec<Room> {
        self.inner.lock().await.cache.clone()
    }

    /// Follows room-list pushes and auth changes coming through the
    /// session. Spawn once after construction.
    pub fn start(self: &Arc<Self>) {
        let directory = Arc::clone(self);
        let mut events = directory.session.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Frame(Frame::Structured(StructuredFrame::RoomList {
                        rooms,
                    }))) => {
                        directory.apply_room_push(&rooms).await;
                    }
                    Ok(SessionEvent::AuthChanged(Some(user))) => {
                        directory.apply_joined(&user).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "room directory lagged behind session events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Fetches public and joined rooms, merges and publishes. On total
    /// fetch failure the previous snapshot is returned unchanged.
    pub async fn refresh(&self) -> Vec<Room> {
        let public = match self.fetch_public_rooms().await {
            Ok(rooms) => rooms,
            Err(err) => {
                warn!("public room fetch failed, serving cached snapshot: {err}");
                return self.snapshot().await;
            }
        };
        let user = self.session.current_user().await;
        let joined = joined_summaries(user.as_ref());
        let merged = merge_rooms(&public, &joined);
        self.publish(merged.clone()).await;
        merged
    }

    /// `/cr name [password]` through the session; on success appends an
    /// optimistic entry with a local identity, reconciled by the next
    /// refresh.
    pub async fn create_room(
        &self,
        name: &str,
        password: Option<&str>,
    ) -> Result<Room, ClientError> {
        self.session
            .send_command(&Command::CreateRoom {
                name: name.to_string(),
                password: password.map(str::to_string),
            })
            .await?;

        let room = Room {
            id: format!("local-{}", Uuid::new_v4()),
            name: name.to_string(),
            is_group: true,
            creator: self
                .session
                .current_user()
                .await
                .map(|user| user.username),
            participants: 1,
            last_message: None,
            unread_count: 0,
            requires_password: password.is_some(),
        };

        self.session.record_joined_room(name).await;
        {
            let mut guard = self.inner.lock().await;
            guard.cache.push(room.clone());
            guard.has_snapshot = true;
            let _ = self.events.send(guard.cache.clone());
        }
        info!(room = name, "room created optimistically");
        Ok(room)
    }

    /// `/cd name [password]` through the session. No local mutation; the
    /// caller refreshes or waits for the server push.
    pub async fn join_room(&self, room: &Room, password: Option<&str>) -> Result<(), ClientError> {
        let password = if room.requires_password {
            password.map(str::to_string)
        } else {
            None
        };
        self.session
            .send_command(&Command::JoinRoom {
                name: room.name.clone(),
                password,
            })
            .await?;
        Ok(())
    }

    /// Merges a server-pushed room list into the current snapshot.
    pub async fn apply_room_push(&self, rooms: &[RoomSummary]) {
        let mut guard = self.inner.lock().await;
        for summary in rooms {
            match position_for(&guard.cache, summary) {
                Some(index) => guard.cache[index].absorb(summary),
                None => guard.cache.push(Room::from_summary(summary)),
            }
        }
        guard.has_snapshot = true;
        let _ = self.events.send(guard.cache.clone());
    }

    async fn apply_joined(&self, user: &User) {
        let joined = joined_summaries(Some(user));
        self.apply_room_push(&joined).await;
    }

    async fn publish(&self, merged: Vec<Room>) {
        let mut guard = self.inner.lock().await;
        guard.cache = merged;
        guard.has_snapshot = true;
        let _ = self.events.send(guard.cache.clone());
    }

    /// Primary endpoint with one fallback, both parsed leniently.
    async fn fetch_public_rooms(&self) -> Result<Vec<RoomSummary>, ClientError> {
        match self.fetch_rooms_from(&format!("{}/api/rooms/public", self.api_url)).await {
            Ok(rooms) => Ok(rooms),
            Err(err) => {
                warn!("primary room endpoint failed, trying fallback: {err}");
                self.fetch_rooms_from(&format!("{}/api/public_rooms", self.api_url))
                    .await
            }
        }
    }

    async fn fetch_rooms_from(&self, url: &str) -> Result<Vec<RoomSummary>, ClientError> {
        let response = self
            .http
            .get(url)
            .timeout(self.session.config().request_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::command(format!(
                "room fetch returned status {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
#[path = "tests/rooms_tests.rs"]
mod tests;
