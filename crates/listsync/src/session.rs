/// Sync session: one client connection subscribed to one list
/// Connecting -> Subscribed -> Streaming -> Closed. Closed is terminal.
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    Authenticator, ClientMessage, DropSignal, ListHandle, ListId, ListRegistry, ListSnapshot,
    Operation, Result, ServerMessage, SessionEvent, SessionId, SyncError, UserId, Version,
};

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Bad token, not a collaborator, or membership revoked
    Unauthorized,

    /// The session fell too far behind the list
    Overflow,

    /// Malformed or out-of-state message
    ProtocolViolation,

    /// The client went away
    Disconnected,

    /// The list worker stopped or the list could not be loaded
    ListClosed,

    /// The delivered stream skipped a version
    Desynchronized,
}

impl CloseReason {
    fn for_error(err: &SyncError) -> Self {
        match err {
            SyncError::Unauthorized(_) | SyncError::ListNotFound(_) => CloseReason::Unauthorized,
            SyncError::ProtocolViolation(_) | SyncError::InvalidOperation(_) => {
                CloseReason::ProtocolViolation
            }
            _ => CloseReason::ListClosed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Subscribed,
    Streaming,
    Closed(CloseReason),
}

/// Live subscription held while Subscribed or Streaming
struct Active {
    handle: ListHandle,
    user: UserId,

    /// Last list version delivered to the client
    cursor: Version,

    events: mpsc::Receiver<SessionEvent>,
    drop_signal: DropSignal,
    pending_snapshot: Option<(ListSnapshot, Vec<UserId>)>,
}

pub struct SyncSession {
    id: SessionId,
    registry: Arc<ListRegistry>,
    auth: Arc<dyn Authenticator>,
    state: SessionState,
    active: Option<Active>,
    closed_reported: bool,
}

impl SyncSession {
    pub fn new(registry: Arc<ListRegistry>, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            id: SessionId::new(),
            registry,
            auth,
            state: SessionState::Connecting,
            active: None,
            closed_reported: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed(_))
    }

    pub fn user(&self) -> Option<UserId> {
        self.active.as_ref().map(|a| a.user)
    }

    pub fn list_id(&self) -> Option<ListId> {
        self.active.as_ref().map(|a| a.handle.list_id())
    }

    pub fn cursor(&self) -> Option<Version> {
        self.active.as_ref().map(|a| a.cursor)
    }

    /// Authenticate and subscribe. Any failure closes the session.
    pub async fn connect(&mut self, token: &str, list_id: ListId) -> Result<()> {
        if self.state != SessionState::Connecting {
            let err = SyncError::ProtocolViolation("already connected".to_string());
            self.shutdown(CloseReason::ProtocolViolation).await;
            return Err(err);
        }

        match self.subscribe(token, list_id).await {
            Ok(active) => {
                info!(
                    "Session {} subscribed to list {} at version {}",
                    self.id, list_id, active.cursor
                );
                self.active = Some(active);
                self.state = SessionState::Subscribed;
                Ok(())
            }
            Err(e) => {
                warn!("Session {} failed to connect to list {}: {}", self.id, list_id, e);
                self.shutdown(CloseReason::for_error(&e)).await;
                // Missing lists look the same as lists the user cannot see
                match e {
                    SyncError::ListNotFound(_) => Err(SyncError::Unauthorized(format!(
                        "no access to list {}",
                        list_id
                    ))),
                    e => Err(e),
                }
            }
        }
    }

    async fn subscribe(&self, token: &str, list_id: ListId) -> Result<Active> {
        let user = self.auth.verify(token).await?;
        let handle = self.registry.handle(list_id).await?;
        let subscription = handle.subscribe(self.id, user).await?;

        Ok(Active {
            handle,
            user,
            cursor: subscription.snapshot.version,
            events: subscription.events,
            drop_signal: subscription.drop_signal,
            pending_snapshot: Some((subscription.snapshot, subscription.present)),
        })
    }

    /// The snapshot message, exactly once; moves the session to Streaming
    pub fn take_snapshot(&mut self) -> Option<ServerMessage> {
        if self.state != SessionState::Subscribed {
            return None;
        }
        let (snapshot, present) = self.active.as_mut()?.pending_snapshot.take()?;
        self.state = SessionState::Streaming;
        Some(ServerMessage::snapshot(snapshot, present))
    }

    /// Parse and handle one inbound text frame
    pub async fn handle_text(&mut self, text: &str) -> Vec<ServerMessage> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => {
                warn!("Session {} sent a malformed message: {}", self.id, e);
                self.close(CloseReason::ProtocolViolation)
                    .await
                    .into_iter()
                    .collect()
            }
        }
    }

    /// Handle one client message and return the direct replies
    pub async fn handle(&mut self, msg: ClientMessage) -> Vec<ServerMessage> {
        debug!("Session {} handling message while {:?}", self.id, self.state);
        if let Some(reason) = self.dropped() {
            warn!("Session {} dropped by list worker: {:?}", self.id, reason);
            return self.close(reason).await.into_iter().collect();
        }

        match (self.state, msg) {
            (SessionState::Closed(_), _) => Vec::new(),
            (SessionState::Streaming, ClientMessage::Ping) => {
                // Heartbeats keep presence alive
                let mut replies = vec![ServerMessage::Pong];
                replies.extend(self.touch_presence(None).await);
                replies
            }
            (_, ClientMessage::Ping) => vec![ServerMessage::Pong],

            (SessionState::Connecting, ClientMessage::Connect { token, list_id }) => {
                match self.connect(&token, list_id).await {
                    Ok(()) => self.take_snapshot().into_iter().collect(),
                    Err(_) => self.report_closed().into_iter().collect(),
                }
            }
            (
                SessionState::Connecting,
                ClientMessage::CreateList {
                    token,
                    name,
                    collaborators,
                },
            ) => self.create_list(&token, name, collaborators).await,

            (SessionState::Streaming, ClientMessage::Operation { operation }) => {
                self.submit(operation).await
            }
            (SessionState::Streaming, ClientMessage::SyncRequest { since }) => {
                self.sync_request(since).await
            }
            (SessionState::Streaming, ClientMessage::Typing { typing }) => {
                self.touch_presence(Some(typing)).await
            }
            (SessionState::Streaming, ClientMessage::Share { user_id }) => {
                self.membership(user_id, true).await
            }
            (SessionState::Streaming, ClientMessage::Unshare { user_id }) => {
                self.membership(user_id, false).await
            }

            (state, msg) => {
                warn!(
                    "Session {} sent {:?} while {:?}",
                    self.id, msg, state
                );
                self.close(CloseReason::ProtocolViolation)
                    .await
                    .into_iter()
                    .collect()
            }
        }
    }

    async fn create_list(
        &mut self,
        token: &str,
        name: String,
        collaborators: Vec<UserId>,
    ) -> Vec<ServerMessage> {
        let owner = match self.auth.verify(token).await {
            Ok(owner) => owner,
            Err(_) => {
                return self
                    .close(CloseReason::Unauthorized)
                    .await
                    .into_iter()
                    .collect()
            }
        };

        match self.registry.create_list(owner, name, collaborators).await {
            Ok(list) => vec![ServerMessage::ListCreated { list }],
            Err(e) => vec![ServerMessage::error(&e)],
        }
    }

    async fn submit(&mut self, operation: Operation) -> Vec<ServerMessage> {
        let Some(active) = self.active.as_ref() else {
            return Vec::new();
        };
        if operation.list_id != active.handle.list_id() {
            warn!(
                "Session {} submitted an operation for list {} it is not subscribed to",
                self.id, operation.list_id
            );
            return self
                .close(CloseReason::ProtocolViolation)
                .await
                .into_iter()
                .collect();
        }

        let result = active
            .handle
            .submit(operation.clone(), active.user, Some(self.id))
            .await;

        match result {
            // The ack arrives through the event queue, in version order
            Ok(_) => Vec::new(),
            // Dropped while the operation was in flight; it was never admitted
            Err(e) if self.dropped().is_some() => self.close_after(&e).await,
            Err(e) if e.is_session_fatal() => {
                let mut replies = vec![ServerMessage::rejected(&operation, &e)];
                replies.extend(self.close_after(&e).await);
                replies
            }
            Err(e) => vec![ServerMessage::rejected(&operation, &e)],
        }
    }

    async fn sync_request(&mut self, since: Version) -> Vec<ServerMessage> {
        let Some(active) = self.active.as_ref() else {
            return Vec::new();
        };

        match active.handle.entries_since(active.user, since).await {
            Ok(entries) => {
                let version = entries.last().map_or(since, |e| e.version);
                vec![ServerMessage::Entries { entries, version }]
            }
            Err(e) if e.is_session_fatal() || self.dropped().is_some() => {
                self.close_after(&e).await
            }
            Err(e) => vec![ServerMessage::error(&e)],
        }
    }

    async fn touch_presence(&mut self, typing: Option<bool>) -> Vec<ServerMessage> {
        let Some(active) = self.active.as_ref() else {
            return Vec::new();
        };
        match active.handle.typing(self.id, typing).await {
            Ok(()) => Vec::new(),
            Err(e) => self.close_after(&e).await,
        }
    }

    async fn membership(&mut self, user_id: UserId, share: bool) -> Vec<ServerMessage> {
        let Some(active) = self.active.as_ref() else {
            return Vec::new();
        };

        let result = if share {
            active.handle.share(active.user, user_id).await
        } else {
            active.handle.unshare(active.user, user_id).await
        };

        match result {
            Ok(list) => vec![ServerMessage::ListMembers { list }],
            Err(e) if e.is_session_fatal() || self.dropped().is_some() => {
                self.close_after(&e).await
            }
            Err(e) => vec![ServerMessage::error(&e)],
        }
    }

    /// Next outbound event while streaming.
    ///
    /// Pends while not streaming. After the session closes this yields the
    /// `closed` message once, then `None`.
    pub async fn next_event(&mut self) -> Option<ServerMessage> {
        loop {
            if self.is_closed() {
                return self.report_closed();
            }
            if !self.is_streaming() {
                return std::future::pending().await;
            }
            let active = self.active.as_mut()?;

            if let Some(reason) = active.drop_signal.reason() {
                warn!("Session {} dropped by list worker: {:?}", self.id, reason);
                self.shutdown(reason).await;
                continue;
            }

            let event = match active.events.recv().await {
                Some(event) => event,
                None => {
                    let reason = active
                        .drop_signal
                        .reason()
                        .unwrap_or(CloseReason::ListClosed);
                    self.shutdown(reason).await;
                    continue;
                }
            };

            let (version, message) = match event {
                SessionEvent::Committed(entry) => {
                    (entry.version, ServerMessage::from_entry(&entry))
                }
                SessionEvent::Acked(receipt) => (receipt.version, ServerMessage::ack(receipt)),
                SessionEvent::Presence(event) => return Some(ServerMessage::presence(event)),
            };

            if version <= active.cursor {
                continue;
            }
            if version != active.cursor + 1 {
                warn!(
                    "Session {} expected version {} but got {}",
                    self.id,
                    active.cursor + 1,
                    version
                );
                self.shutdown(CloseReason::Desynchronized).await;
                continue;
            }
            active.cursor = version;
            return Some(message);
        }
    }

    /// Why the list worker stopped delivering to this session, if it has
    fn dropped(&self) -> Option<CloseReason> {
        self.active.as_ref()?.drop_signal.reason()
    }

    /// Close after a failed request. A drop by the worker takes precedence over the error.
    async fn close_after(&mut self, err: &SyncError) -> Vec<ServerMessage> {
        let reason = self
            .dropped()
            .unwrap_or_else(|| CloseReason::for_error(err));
        self.close(reason).await.into_iter().collect()
    }

    /// End the session. Returns the `closed` message if it was not reported yet.
    pub async fn close(&mut self, reason: CloseReason) -> Option<ServerMessage> {
        self.shutdown(reason).await;
        self.report_closed()
    }

    async fn shutdown(&mut self, reason: CloseReason) {
        if self.is_closed() {
            return;
        }
        self.state = SessionState::Closed(reason);

        if let Some(active) = self.active.take() {
            // Worker may already be gone; nothing left to clean up then
            let _ = active.handle.unsubscribe(self.id).await;
        }
        info!("Session {} closed: {:?}", self.id, reason);
    }

    fn report_closed(&mut self) -> Option<ServerMessage> {
        match self.state {
            SessionState::Closed(reason) if !self.closed_reported => {
                self.closed_reported = true;
                Some(ServerMessage::Closed { reason })
            }
            _ => None,
        }
    }
}
