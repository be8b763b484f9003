/// Per-list single-writer actor
/// Every mutation of a list goes through its worker's mailbox, one command at a time.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    ChangeLogEntry, CloseReason, CommitReceipt, ListId, ListMeta, ListSnapshot, ListState,
    ListStore, Operation, PresenceEvent, PresenceTracker, Result, SessionId, SyncConfig,
    SyncError, UserId, Version,
};

/// Something a subscribed session has to hear about
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A commit made by another session or an API caller
    Committed(Arc<ChangeLogEntry>),

    /// A commit of this session's own operation
    Acked(CommitReceipt),

    Presence(PresenceEvent),
}

/// Why the worker stopped delivering to a session, readable by the session
#[derive(Debug, Clone, Default)]
pub struct DropSignal(Arc<Mutex<Option<CloseReason>>>);

impl DropSignal {
    pub fn reason(&self) -> Option<CloseReason> {
        self.0.lock().clone()
    }

    fn set(&self, reason: CloseReason) {
        self.0.lock().get_or_insert(reason);
    }
}

/// A session's registration with a list worker
#[derive(Debug)]
pub struct Subscription {
    pub session_id: SessionId,
    pub snapshot: ListSnapshot,

    /// Users present on the list, including the subscriber
    pub present: Vec<UserId>,

    pub events: mpsc::Receiver<SessionEvent>,
    pub drop_signal: DropSignal,
}

/// Mailbox messages understood by a list worker
#[derive(Debug)]
pub enum ListCommand {
    Submit {
        operation: Operation,
        author: UserId,

        /// Subscribed session the operation came from, if any
        origin: Option<SessionId>,

        reply: oneshot::Sender<Result<CommitReceipt>>,
    },
    Subscribe {
        session_id: SessionId,
        user: UserId,
        reply: oneshot::Sender<Result<Subscription>>,
    },
    Unsubscribe {
        session_id: SessionId,
    },
    EntriesSince {
        user: UserId,
        version: Version,
        reply: oneshot::Sender<Result<Vec<ChangeLogEntry>>>,
    },
    Snapshot {
        user: UserId,
        reply: oneshot::Sender<Result<ListSnapshot>>,
    },
    Typing {
        session_id: SessionId,
        typing: Option<bool>,
    },
    Share {
        by: UserId,
        user: UserId,
        reply: oneshot::Sender<Result<ListMeta>>,
    },
    Unshare {
        by: UserId,
        user: UserId,
        reply: oneshot::Sender<Result<ListMeta>>,
    },
}

struct Subscriber {
    user: UserId,
    tx: mpsc::Sender<SessionEvent>,
    drop_signal: DropSignal,
}

/// Owns one list's state and its subscribers
pub struct ListWorker {
    state: ListState,
    store: Arc<dyn ListStore>,
    subscribers: HashMap<SessionId, Subscriber>,
    presence: PresenceTracker,
    config: SyncConfig,
    mailbox: mpsc::Receiver<ListCommand>,
}

impl ListWorker {
    /// Start the worker task and return a handle to its mailbox
    pub fn spawn(state: ListState, store: Arc<dyn ListStore>, config: SyncConfig) -> ListHandle {
        let (tx, mailbox) = mpsc::channel(config.mailbox_capacity.max(1));
        let list_id = state.id();
        let worker = Self {
            state,
            store,
            subscribers: HashMap::new(),
            presence: PresenceTracker::new(config.presence_timeout()),
            config,
            mailbox,
        };

        tokio::spawn(worker.run());
        ListHandle { list_id, tx }
    }

    async fn run(mut self) {
        let list_id = self.state.id();
        info!(
            "List worker {} started at version {}",
            list_id,
            self.state.version()
        );

        let mut sweep = tokio::time::interval(self.config.presence_sweep_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.mailbox.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = sweep.tick() => self.sweep_presence(),
            }
        }

        info!("List worker {} stopped", list_id);
    }

    async fn handle(&mut self, command: ListCommand) {
        match command {
            ListCommand::Submit {
                operation,
                author,
                origin,
                reply,
            } => {
                if reply.is_closed() {
                    debug!("Dropping operation {}, submitter went away", operation.id);
                    return;
                }
                if let Some(session_id) = origin.filter(|id| !self.subscribers.contains_key(id)) {
                    debug!(
                        "Dropping operation {} from unsubscribed session {}",
                        operation.id, session_id
                    );
                    let _ = reply.send(Err(SyncError::ProtocolViolation(format!(
                        "session {} is not subscribed to list {}",
                        session_id,
                        self.state.id()
                    ))));
                    return;
                }
                let result = self.submit(operation, author, origin).await;
                let _ = reply.send(result);
            }
            ListCommand::Subscribe {
                session_id,
                user,
                reply,
            } => {
                let result = self.subscribe(session_id, user);
                if let Err(Ok(subscription)) = reply.send(result) {
                    // Caller gave up before the subscription arrived
                    self.remove_subscriber(subscription.session_id);
                }
            }
            ListCommand::Unsubscribe { session_id } => {
                if self.remove_subscriber(session_id).is_some() {
                    debug!("Session {} unsubscribed from list {}", session_id, self.state.id());
                }
            }
            ListCommand::EntriesSince {
                user,
                version,
                reply,
            } => {
                let _ = reply.send(self.entries_since(user, version));
            }
            ListCommand::Snapshot { user, reply } => {
                let result = self.state.authorize(user).map(|_| self.state.snapshot());
                let _ = reply.send(result);
            }
            ListCommand::Typing { session_id, typing } => self.typing(session_id, typing),
            ListCommand::Share { by, user, reply } => {
                let _ = reply.send(self.share(by, user).await);
            }
            ListCommand::Unshare { by, user, reply } => {
                let _ = reply.send(self.unshare(by, user).await);
            }
        }
    }

    async fn submit(
        &mut self,
        operation: Operation,
        author: UserId,
        origin: Option<SessionId>,
    ) -> Result<CommitReceipt> {
        self.state.authorize(author)?;

        let prepared = match self.state.prepare(&operation, author) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(
                    "Rejected operation {} on list {}: {}",
                    operation.id,
                    self.state.id(),
                    e
                );
                return Err(e);
            }
        };

        // Durable first; a failure leaves the in-memory list untouched
        if let Err(e) = self.store.persist(self.state.id(), &prepared.entry).await {
            error!(
                "Failed to persist version {} of list {}: {}",
                prepared.entry.version,
                self.state.id(),
                e
            );
            return Err(e);
        }

        let receipt = self.state.commit(prepared)?;
        let entry = match self.state.log().get(receipt.version) {
            Some(entry) => Arc::new(entry.clone()),
            None => {
                return Err(SyncError::CorruptLog(format!(
                    "committed version {} missing from log",
                    receipt.version
                )))
            }
        };
        debug!(
            "Committed operation {} as version {} of list {}",
            receipt.operation_id,
            receipt.version,
            self.state.id()
        );

        self.fan_out(|session_id, _| {
            if Some(session_id) == origin {
                Some(SessionEvent::Acked(receipt.clone()))
            } else {
                Some(SessionEvent::Committed(entry.clone()))
            }
        });

        // Editing counts as activity for presence
        if origin.is_some() && self.presence.touch(self.state.id(), author, chrono::Utc::now()) {
            self.broadcast_presence(PresenceEvent::Joined { user_id: author }, None);
        }

        Ok(receipt)
    }

    fn subscribe(&mut self, session_id: SessionId, user: UserId) -> Result<Subscription> {
        self.state.authorize(user)?;

        let (tx, events) = mpsc::channel(self.config.session_queue_capacity.max(1));
        let drop_signal = DropSignal::default();

        let joined = self
            .presence
            .touch(self.state.id(), user, chrono::Utc::now());
        if joined {
            self.broadcast_presence(PresenceEvent::Joined { user_id: user }, None);
        }

        self.subscribers.insert(
            session_id,
            Subscriber {
                user,
                tx,
                drop_signal: drop_signal.clone(),
            },
        );
        info!(
            "Session {} of user {} subscribed to list {} at version {}",
            session_id,
            user,
            self.state.id(),
            self.state.version()
        );

        Ok(Subscription {
            session_id,
            snapshot: self.state.snapshot(),
            present: self.presence.members(self.state.id()),
            events,
            drop_signal,
        })
    }

    fn entries_since(&self, user: UserId, version: Version) -> Result<Vec<ChangeLogEntry>> {
        self.state.authorize(user)?;
        if version > self.state.version() {
            return Err(SyncError::InvalidOperation(format!(
                "version {} is ahead of list version {}",
                version,
                self.state.version()
            )));
        }
        Ok(self.state.log().entries_since(version).to_vec())
    }

    fn typing(&mut self, session_id: SessionId, typing: Option<bool>) {
        let Some(user) = self.subscribers.get(&session_id).map(|s| s.user) else {
            return;
        };

        let list_id = self.state.id();
        let now = chrono::Utc::now();
        let joined = match typing {
            Some(typing) => self.presence.set_typing(list_id, user, typing, now),
            None => self.presence.touch(list_id, user, now),
        };

        if joined {
            self.broadcast_presence(PresenceEvent::Joined { user_id: user }, None);
        }
        if let Some(typing) = typing {
            self.broadcast_presence(
                PresenceEvent::Typing {
                    user_id: user,
                    typing,
                },
                Some(session_id),
            );
        }
    }

    async fn share(&mut self, by: UserId, user: UserId) -> Result<ListMeta> {
        let mut meta = self.state.meta().clone();
        if meta.share(by, user)? {
            self.store.save_meta(&meta).await?;
            info!("List {} shared with user {}", meta.id, user);
            *self.state.meta_mut() = meta.clone();
        }
        Ok(meta)
    }

    async fn unshare(&mut self, by: UserId, user: UserId) -> Result<ListMeta> {
        let mut meta = self.state.meta().clone();
        if !meta.unshare(by, user)? {
            return Ok(meta);
        }
        self.store.save_meta(&meta).await?;
        info!("List {} no longer shared with user {}", meta.id, user);
        *self.state.meta_mut() = meta.clone();

        let revoked: Vec<SessionId> = self
            .subscribers
            .iter()
            .filter(|(_, s)| s.user == user)
            .map(|(id, _)| *id)
            .collect();
        for session_id in revoked {
            if let Some(subscriber) = self.remove_subscriber(session_id) {
                subscriber.drop_signal.set(CloseReason::Unauthorized);
            }
        }
        Ok(meta)
    }

    fn sweep_presence(&mut self) {
        let expired = self.presence.evict_expired(chrono::Utc::now());
        for (_, user) in expired {
            debug!("Presence of user {} on list {} expired", user, self.state.id());
            self.broadcast_presence(PresenceEvent::Left { user_id: user }, None);
        }
    }

    fn broadcast_presence(&mut self, event: PresenceEvent, except: Option<SessionId>) {
        self.fan_out(|session_id, _| {
            (Some(session_id) != except).then(|| SessionEvent::Presence(event.clone()))
        });
    }

    /// Queue an event for each subscriber without waiting on any of them.
    /// Subscribers with a full queue are dropped with `Overflow`.
    fn fan_out(&mut self, mut event_for: impl FnMut(SessionId, &Subscriber) -> Option<SessionEvent>) {
        let mut dropped = Vec::new();
        for (session_id, subscriber) in &self.subscribers {
            let Some(event) = event_for(*session_id, subscriber) else {
                continue;
            };

            match subscriber.tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Session {} overflowed its queue on list {}, closing",
                        session_id,
                        self.state.id()
                    );
                    subscriber.drop_signal.set(CloseReason::Overflow);
                    dropped.push(*session_id);
                }
                Err(TrySendError::Closed(_)) => dropped.push(*session_id),
            }
        }

        for session_id in dropped {
            self.remove_subscriber(session_id);
        }
    }

    fn remove_subscriber(&mut self, session_id: SessionId) -> Option<Subscriber> {
        let subscriber = self.subscribers.remove(&session_id)?;
        let still_connected = self
            .subscribers
            .values()
            .any(|s| s.user == subscriber.user);

        if !still_connected && self.presence.leave(self.state.id(), subscriber.user) {
            self.broadcast_presence(
                PresenceEvent::Left {
                    user_id: subscriber.user,
                },
                None,
            );
        }
        Some(subscriber)
    }
}

/// Cloneable address of a running list worker
#[derive(Debug, Clone)]
pub struct ListHandle {
    list_id: ListId,
    tx: mpsc::Sender<ListCommand>,
}

impl ListHandle {
    pub fn list_id(&self) -> ListId {
        self.list_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn submit(
        &self,
        operation: Operation,
        author: UserId,
        origin: Option<SessionId>,
    ) -> Result<CommitReceipt> {
        self.request(|reply| ListCommand::Submit {
            operation,
            author,
            origin,
            reply,
        })
        .await?
    }

    pub async fn subscribe(&self, session_id: SessionId, user: UserId) -> Result<Subscription> {
        self.request(|reply| ListCommand::Subscribe {
            session_id,
            user,
            reply,
        })
        .await?
    }

    pub async fn unsubscribe(&self, session_id: SessionId) -> Result<()> {
        self.send(ListCommand::Unsubscribe { session_id }).await
    }

    pub async fn entries_since(&self, user: UserId, version: Version) -> Result<Vec<ChangeLogEntry>> {
        self.request(|reply| ListCommand::EntriesSince {
            user,
            version,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self, user: UserId) -> Result<ListSnapshot> {
        self.request(|reply| ListCommand::Snapshot { user, reply })
            .await?
    }

    /// Refresh presence; `Some` also sets the typing indicator
    pub async fn typing(&self, session_id: SessionId, typing: Option<bool>) -> Result<()> {
        self.send(ListCommand::Typing { session_id, typing }).await
    }

    pub async fn share(&self, by: UserId, user: UserId) -> Result<ListMeta> {
        self.request(|reply| ListCommand::Share { by, user, reply })
            .await?
    }

    pub async fn unshare(&self, by: UserId, user: UserId) -> Result<ListMeta> {
        self.request(|reply| ListCommand::Unshare { by, user, reply })
            .await?
    }

    async fn send(&self, command: ListCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SyncError::WorkerGone(self.list_id))
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ListCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response.await.map_err(|_| SyncError::WorkerGone(self.list_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientId, ItemDraft, LamportClock, MemoryStore, OperationKind};
    use std::time::Duration;

    struct Fixture {
        owner: UserId,
        guest: UserId,
        store: Arc<MemoryStore>,
        handle: ListHandle,
    }

    async fn fixture(config: SyncConfig) -> Fixture {
        let owner = UserId::new();
        let guest = UserId::new();
        let meta = ListMeta::new("Groceries", owner).with_collaborators([guest]);
        let store = Arc::new(MemoryStore::new());
        store.save_meta(&meta).await.unwrap();
        let handle = ListWorker::spawn(ListState::new(meta), store.clone(), config);
        Fixture {
            owner,
            guest,
            store,
            handle,
        }
    }

    fn add(list: ListId, base: Version, clock: u64, name: &str) -> Operation {
        Operation::new(
            list,
            ClientId::new(),
            clock,
            base,
            LamportClock(clock),
            OperationKind::Add {
                item: ItemDraft::new(name),
            },
        )
    }

    async fn recv(sub: &mut Subscription) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(1), sub.events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn next_commit(sub: &mut Subscription) -> Arc<ChangeLogEntry> {
        loop {
            match recv(sub).await {
                SessionEvent::Committed(entry) => return entry,
                SessionEvent::Presence(_) => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_origin_gets_ack_others_get_commit() {
        let f = fixture(SyncConfig::default()).await;
        let list = f.handle.list_id();
        let mut mine = f.handle.subscribe(SessionId::new(), f.owner).await.unwrap();
        let mut theirs = f.handle.subscribe(SessionId::new(), f.guest).await.unwrap();

        // Owner hears the guest join
        assert!(matches!(
            recv(&mut mine).await,
            SessionEvent::Presence(PresenceEvent::Joined { user_id }) if user_id == f.guest
        ));

        let receipt = f
            .handle
            .submit(add(list, 0, 1, "milk"), f.owner, Some(mine.session_id))
            .await
            .unwrap();
        assert_eq!(receipt.version, 1);

        assert!(matches!(recv(&mut mine).await, SessionEvent::Acked(r) if r.version == 1));
        assert!(matches!(recv(&mut theirs).await, SessionEvent::Committed(e) if e.version == 1));
        assert_eq!(f.store.stored(list).unwrap().version(), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_commit() {
        let f = fixture(SyncConfig::default()).await;
        let list = f.handle.list_id();

        f.store.set_available(false);
        let result = f.handle.submit(add(list, 0, 1, "bread"), f.owner, None).await;
        assert!(matches!(result, Err(SyncError::PersistenceUnavailable(_))));

        let snapshot = f.handle.snapshot(f.owner).await.unwrap();
        assert_eq!(snapshot.version, 0);
        assert!(snapshot.items.is_empty());

        f.store.set_available(true);
        let receipt = f
            .handle
            .submit(add(list, 0, 2, "bread"), f.owner, None)
            .await
            .unwrap();
        assert_eq!(receipt.version, 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_the_slow_session() {
        let config = SyncConfig {
            session_queue_capacity: 2,
            ..SyncConfig::default()
        };
        let f = fixture(config).await;
        let list = f.handle.list_id();
        let slow = f.handle.subscribe(SessionId::new(), f.guest).await.unwrap();
        let mut fast = f.handle.subscribe(SessionId::new(), f.owner).await.unwrap();

        for i in 0..5 {
            f.handle
                .submit(add(list, i, i + 1, "item"), f.owner, None)
                .await
                .unwrap();
            assert_eq!(next_commit(&mut fast).await.version, i + 1);
        }

        assert_eq!(slow.drop_signal.reason(), Some(CloseReason::Overflow));
        assert!(fast.drop_signal.reason().is_none());
    }

    #[tokio::test]
    async fn test_non_member_cannot_subscribe() {
        let f = fixture(SyncConfig::default()).await;
        let result = f.handle.subscribe(SessionId::new(), UserId::new()).await;
        assert!(matches!(result, Err(SyncError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_unshare_closes_sessions_of_removed_user() {
        let f = fixture(SyncConfig::default()).await;
        let guest_sub = f.handle.subscribe(SessionId::new(), f.guest).await.unwrap();

        let meta = f.handle.unshare(f.owner, f.guest).await.unwrap();
        assert!(!meta.is_member(f.guest));
        assert_eq!(guest_sub.drop_signal.reason(), Some(CloseReason::Unauthorized));
        assert!(!f.store.stored(meta.id).unwrap().meta.is_member(f.guest));

        assert!(matches!(
            f.handle.unshare(f.guest, f.owner).await,
            Err(SyncError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_submission_from_unsubscribed_session_is_dropped() {
        let f = fixture(SyncConfig::default()).await;
        let list = f.handle.list_id();
        let result = f
            .handle
            .submit(add(list, 0, 1, "ghost"), f.owner, Some(SessionId::new()))
            .await;
        assert!(matches!(result, Err(SyncError::ProtocolViolation(_))));
        assert_eq!(f.handle.snapshot(f.owner).await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_commit_refreshes_author_presence() {
        let config = SyncConfig {
            presence_timeout_secs: 0,
            presence_sweep_ms: 20,
            ..SyncConfig::default()
        };
        let f = fixture(config).await;
        let list = f.handle.list_id();
        let mine = f.handle.subscribe(SessionId::new(), f.owner).await.unwrap();
        let mut theirs = f.handle.subscribe(SessionId::new(), f.guest).await.unwrap();

        // Idle owner is swept out
        loop {
            if let SessionEvent::Presence(PresenceEvent::Left { user_id }) = recv(&mut theirs).await {
                if user_id == f.owner {
                    break;
                }
            }
        }

        f.handle
            .submit(add(list, 0, 1, "milk"), f.owner, Some(mine.session_id))
            .await
            .unwrap();

        assert_eq!(next_commit(&mut theirs).await.version, 1);
        loop {
            if let SessionEvent::Presence(PresenceEvent::Joined { user_id }) = recv(&mut theirs).await {
                if user_id == f.owner {
                    break;
                }
            }
        }
    }
}
