// src/broker/memory/broker.rs

//! In-memory broker.
//!
//! This file contains the concrete implementation of the broker client
//! traits using in-process data structures only. See the module docs for the
//! semantics it guarantees.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    // ---
    lock_ignore_poison,
    BrokerError,
    BrokerResult,
    EntityIdentity,
    EntityProperties,
    LockToken,
    MessageReceiver,
    MessagingProvider,
    MessagingProviderPtr,
    ReceiveMode,
    ReceivedMessage,
    ReceiverPtr,
    SessionClient,
    SessionClientPtr,
    SessionHandle,
};

/// Broker-wide settings.
#[derive(Debug, Clone)]
pub struct MemoryBrokerOptions {
    /// How long a received message stays locked.
    pub lock_duration: Duration,
    /// How long an accepted session stays locked.
    pub session_lock_duration: Duration,
    pub receive_mode: ReceiveMode,
    /// Reported through `entity_properties()`.
    pub partition_count: i32,
}

impl Default for MemoryBrokerOptions {
    fn default() -> Self {
        // ---
        Self {
            lock_duration: Duration::from_secs(60),
            session_lock_duration: Duration::from_secs(60),
            receive_mode: ReceiveMode::PeekLock,
            partition_count: 1,
        }
    }
}

/// Broker operations that can be made to fail with [`MemoryBroker::inject_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateClient,
    Receive,
    Complete,
    Abandon,
    RenewLock,
    RenewSessionLock,
    AcceptSession,
    CloseSession,
    Peek,
    EntityProperties,
}

/// Snapshot of the settlement and session traffic a broker has seen.
///
/// Only calls that succeeded are recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallLog {
    /// Lock tokens of each `complete` call, one entry per call.
    pub completes: Vec<Vec<LockToken>>,
    /// Lock tokens of each `abandon` call, one entry per call.
    pub abandons: Vec<Vec<LockToken>>,
    pub renewals: Vec<LockToken>,
    pub session_renewals: Vec<String>,
    pub accepted_sessions: Vec<String>,
    pub closed_sessions: Vec<String>,
    /// Receivers and session clients created through `MessagingProvider`.
    pub clients_opened: usize,
    pub clients_closed: usize,
    pub receive_calls: usize,
}

impl CallLog {
    /// Every completed lock token, flattened across calls.
    pub fn completed_tokens(&self) -> Vec<LockToken> {
        self.completes.iter().flatten().cloned().collect()
    }

    /// Every abandoned lock token, flattened across calls.
    pub fn abandoned_tokens(&self) -> Vec<LockToken> {
        self.abandons.iter().flatten().cloned().collect()
    }
}

/// A message to be sent to the broker.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub message_id: Option<String>,
    pub session_id: Option<String>,
    pub content_type: Option<String>,
    pub properties: HashMap<String, String>,
    pub body: Bytes,
}

impl OutgoingMessage {
    // ---
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// A message whose body is `value` serialized as JSON.
    pub fn json<T: Serialize>(value: &T) -> crate::Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(body).with_content_type("application/json"))
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    sequence_number: i64,
    delivery_count: u32,
    enqueued_time: DateTime<Utc>,
    session_id: Option<Arc<str>>,
    content_type: Option<String>,
    properties: HashMap<String, String>,
    body: Bytes,
}

impl StoredMessage {
    fn to_received(&self, lock_token: LockToken, locked_until: DateTime<Utc>) -> ReceivedMessage {
        // ---
        ReceivedMessage {
            message_id: self.message_id.clone(),
            sequence_number: self.sequence_number,
            delivery_count: self.delivery_count,
            enqueued_time: self.enqueued_time,
            locked_until,
            lock_token,
            session_id: self.session_id.clone(),
            content_type: self.content_type.clone(),
            properties: self.properties.clone(),
            body: self.body.clone(),
        }
    }
}

struct LockedMessage {
    message: StoredMessage,
    locked_until: DateTime<Utc>,
}

struct SessionLock {
    owner: u64,
    locked_until: DateTime<Utc>,
}

#[derive(Default)]
struct EntityState {
    available: BTreeMap<i64, StoredMessage>,
    locked: HashMap<LockToken, LockedMessage>,
    sessions: HashMap<Arc<str>, SessionLock>,
}

impl EntityState {
    /// Return expired message locks to the available set.
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        // ---
        let expired: Vec<LockToken> = self
            .locked
            .iter()
            .filter(|(_, locked)| locked.locked_until <= now)
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            if let Some(locked) = self.locked.remove(&token) {
                self.available
                    .insert(locked.message.sequence_number, locked.message);
            }
        }
    }

    fn session_is_free(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        self.sessions
            .get(session_id)
            .map(|lock| lock.locked_until <= now)
            .unwrap_or(true)
    }

    /// Earliest instant at which a lock held on this entity lapses.
    fn next_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let messages = self.locked.values().map(|l| l.locked_until);
        let sessions = self.sessions.values().map(|l| l.locked_until);
        messages.chain(sessions).filter(|at| *at > now).min()
    }
}

struct Inner {
    options: MemoryBrokerOptions,
    entities: Mutex<HashMap<String, EntityState>>,
    next_sequence: AtomicU64,
    next_client: AtomicU64,
    changed: Notify,
    calls: Mutex<CallLog>,
    faults: Mutex<HashMap<Operation, VecDeque<BrokerError>>>,
}

impl Inner {
    // ---
    fn take_fault(&self, op: Operation) -> BrokerResult<()> {
        let mut faults = lock_ignore_poison(&self.faults);
        match faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record(&self, f: impl FnOnce(&mut CallLog)) {
        f(&mut lock_ignore_poison(&self.calls));
    }

    fn with_entity<R>(&self, path: &str, f: impl FnOnce(&mut EntityState, DateTime<Utc>) -> R) -> R {
        // ---
        let now = Utc::now();
        let mut entities = lock_ignore_poison(&self.entities);
        let entity = entities.entry(path.to_owned()).or_default();
        entity.reclaim_expired(now);
        f(entity, now)
    }

    fn lock_until(&self, now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
        now + TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::days(3650))
    }

    /// Wait until the entity changes, a held lock lapses, or `deadline`.
    /// Returns false once the deadline has passed.
    ///
    /// `notified` must be enabled before the caller last inspected the
    /// entity, so no change can slip in between.
    async fn wait_for_change(
        &self,
        notified: Pin<&mut Notified<'_>>,
        path: &str,
        deadline: Instant,
    ) -> bool {
        // ---
        let next_expiry = self.with_entity(path, |entity, now| entity.next_expiry(now));
        let wake_at = next_expiry
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .map(|delay| (Instant::now() + delay).min(deadline))
            .unwrap_or(deadline);

        tokio::select! {
            _ = notified => true,
            _ = tokio::time::sleep_until(wake_at) => Instant::now() < deadline,
        }
    }

    fn new_client_id(&self, kind: &str, path: &str) -> (u64, String) {
        let n = self.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        (n, format!("{kind}-{path}-{n}"))
    }
}

/// In-memory broker.
///
/// A cloneable handle; every clone shares the same entities. It simulates a
/// message broker entirely within the process and is intended for testing and
/// for validating listener behavior without network or broker variability.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    // ---
    pub fn new(options: MemoryBrokerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                entities: Mutex::new(HashMap::new()),
                next_sequence: AtomicU64::new(0),
                next_client: AtomicU64::new(0),
                changed: Notify::new(),
                calls: Mutex::new(CallLog::default()),
                faults: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn options(&self) -> &MemoryBrokerOptions {
        &self.inner.options
    }

    /// This broker as a client factory for a listener.
    pub fn provider(&self) -> MessagingProviderPtr {
        Arc::new(self.clone())
    }

    /// Enqueue a message on `path`, returning its sequence number.
    pub fn send(&self, path: &str, message: OutgoingMessage) -> i64 {
        // ---
        let sequence_number = self.inner.next_sequence.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        let stored = StoredMessage {
            message_id: message
                .message_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            sequence_number,
            delivery_count: 0,
            enqueued_time: Utc::now(),
            session_id: message.session_id.map(Arc::from),
            content_type: message.content_type,
            properties: message.properties,
            body: message.body,
        };

        self.inner.with_entity(path, |entity, _| {
            entity.available.insert(sequence_number, stored);
        });
        self.inner.changed.notify_waiters();
        sequence_number
    }

    /// A plain receiver on `path`. Plain receivers only see messages without
    /// a session id.
    pub fn receiver(&self, path: &str) -> ReceiverPtr {
        Arc::new(MemoryReceiver::new(self.inner.clone(), path, None))
    }

    /// A session client on `path`.
    pub fn session_client(&self, path: &str) -> SessionClientPtr {
        Arc::new(MemorySessionClient::new(self.inner.clone(), path))
    }

    /// Messages on `path` that are neither locked nor settled.
    pub fn available_count(&self, path: &str) -> usize {
        self.inner.with_entity(path, |entity, _| entity.available.len())
    }

    /// Messages on `path` currently locked by a receiver.
    pub fn locked_count(&self, path: &str) -> usize {
        self.inner.with_entity(path, |entity, _| entity.locked.len())
    }

    pub fn calls(&self) -> CallLog {
        lock_ignore_poison(&self.inner.calls).clone()
    }

    /// Make the next call of `operation` fail with `error`. Faults queue up
    /// per operation and are consumed in order.
    pub fn inject_fault(&self, operation: Operation, error: BrokerError) {
        lock_ignore_poison(&self.inner.faults)
            .entry(operation)
            .or_default()
            .push_back(error);
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerOptions::default())
    }
}

#[async_trait]
impl MessagingProvider for MemoryBroker {
    // ---
    async fn create_receiver(
        &self,
        entity: &EntityIdentity,
        _prefetch_count: u32,
    ) -> BrokerResult<ReceiverPtr> {
        // ---
        self.inner.take_fault(Operation::CreateClient)?;
        let mut receiver = MemoryReceiver::new(self.inner.clone(), entity.path(), None);
        receiver.counted = true;
        self.inner.record(|log| log.clients_opened += 1);
        Ok(Arc::new(receiver))
    }

    async fn create_session_client(
        &self,
        entity: &EntityIdentity,
        _prefetch_count: u32,
    ) -> BrokerResult<SessionClientPtr> {
        // ---
        self.inner.take_fault(Operation::CreateClient)?;
        let mut client = MemorySessionClient::new(self.inner.clone(), entity.path());
        client.counted = true;
        self.inner.record(|log| log.clients_opened += 1);
        Ok(Arc::new(client))
    }
}

/// Create a new in-memory broker with default options.
///
/// The broker is always available and requires no external resources.
pub fn create_memory_broker() -> MemoryBroker {
    MemoryBroker::default()
}

struct MemoryReceiver {
    inner: Arc<Inner>,
    id: u64,
    path: String,
    client_id: String,
    session_id: Option<Arc<str>>,
    closed: AtomicBool,
    counted: bool,
}

impl MemoryReceiver {
    // ---
    fn new(inner: Arc<Inner>, path: &str, session_id: Option<Arc<str>>) -> Self {
        let (id, client_id) = inner.new_client_id("receiver", path);
        Self {
            inner,
            id,
            path: path.to_owned(),
            client_id,
            session_id,
            closed: AtomicBool::new(false),
            counted: false,
        }
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::disposed(format!(
                "receiver {} has been closed",
                self.client_id
            )));
        }
        Ok(())
    }

    fn ensure_settleable(&self) -> BrokerResult<()> {
        if self.inner.options.receive_mode != ReceiveMode::PeekLock {
            return Err(BrokerError::fatal(
                "messages received in ReceiveAndDelete mode cannot be settled",
            ));
        }
        Ok(())
    }

    /// Session lock check for session receivers; a no-op otherwise.
    fn check_session(&self, entity: &EntityState, now: DateTime<Utc>) -> BrokerResult<()> {
        // ---
        let Some(session_id) = &self.session_id else {
            return Ok(());
        };
        match entity.sessions.get(session_id) {
            Some(lock) if lock.owner == self.id && lock.locked_until > now => Ok(()),
            _ => Err(BrokerError::session_lock_lost(format!(
                "the lock on session '{session_id}' has expired or was released"
            ))),
        }
    }

    fn belongs_here(&self, message: &StoredMessage) -> bool {
        message.session_id.as_deref() == self.session_id.as_deref()
    }

    fn try_take(&self, max_messages: usize) -> BrokerResult<Vec<ReceivedMessage>> {
        // ---
        let mode = self.inner.options.receive_mode;
        self.inner.with_entity(&self.path, |entity, now| {
            self.check_session(entity, now)?;

            let sequences: Vec<i64> = entity
                .available
                .values()
                .filter(|m| self.belongs_here(m))
                .take(max_messages)
                .map(|m| m.sequence_number)
                .collect();

            let locked_until = match &self.session_id {
                Some(session_id) => entity
                    .sessions
                    .get(session_id)
                    .map(|lock| lock.locked_until)
                    .unwrap_or(now),
                None => self.inner.lock_until(now, self.inner.options.lock_duration),
            };

            let mut received = Vec::with_capacity(sequences.len());
            for sequence in sequences {
                let Some(mut message) = entity.available.remove(&sequence) else {
                    continue;
                };
                message.delivery_count += 1;
                let token = LockToken::from(Uuid::new_v4().to_string());
                received.push(message.to_received(token.clone(), locked_until));
                if mode == ReceiveMode::PeekLock {
                    entity.locked.insert(
                        token,
                        LockedMessage {
                            message,
                            locked_until,
                        },
                    );
                }
            }
            Ok(received)
        })
    }

    /// Validate every token before touching any, so a call settles all of its
    /// tokens or none.
    fn settle(&self, lock_tokens: &[LockToken], abandon: bool) -> BrokerResult<()> {
        // ---
        self.inner.with_entity(&self.path, |entity, now| {
            self.check_session(entity, now)?;

            for token in lock_tokens {
                match entity.locked.get(token) {
                    Some(locked) if self.belongs_here(&locked.message) => {}
                    _ => {
                        return Err(BrokerError::lock_lost(format!(
                            "the lock supplied for token {token} is invalid or has expired"
                        )))
                    }
                }
            }

            for token in lock_tokens {
                if let Some(locked) = entity.locked.remove(token) {
                    if abandon {
                        entity
                            .available
                            .insert(locked.message.sequence_number, locked.message);
                    }
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl MessageReceiver for MemoryReceiver {
    // ---
    fn entity_path(&self) -> &str {
        &self.path
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn receive_mode(&self) -> ReceiveMode {
        self.inner.options.receive_mode
    }

    async fn receive(
        &self,
        max_messages: usize,
        max_wait: Duration,
    ) -> BrokerResult<Vec<ReceivedMessage>> {
        // ---
        // Every broker call suspends at least once, like a network round trip.
        tokio::task::yield_now().await;
        self.ensure_open()?;
        self.inner.take_fault(Operation::Receive)?;
        self.inner.record(|log| log.receive_calls += 1);

        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let received = self.try_take(max_messages.max(1))?;
            if !received.is_empty() {
                return Ok(received);
            }
            if !self.inner.wait_for_change(notified, &self.path, deadline).await {
                return Ok(Vec::new());
            }
            self.ensure_open()?;
        }
    }

    async fn complete(&self, lock_tokens: &[LockToken]) -> BrokerResult<()> {
        // ---
        tokio::task::yield_now().await;
        self.ensure_open()?;
        self.ensure_settleable()?;
        self.inner.take_fault(Operation::Complete)?;
        self.settle(lock_tokens, false)?;
        self.inner
            .record(|log| log.completes.push(lock_tokens.to_vec()));
        Ok(())
    }

    async fn abandon(&self, lock_tokens: &[LockToken]) -> BrokerResult<()> {
        // ---
        tokio::task::yield_now().await;
        self.ensure_open()?;
        self.ensure_settleable()?;
        self.inner.take_fault(Operation::Abandon)?;
        self.settle(lock_tokens, true)?;
        self.inner.record(|log| log.abandons.push(lock_tokens.to_vec()));
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn renew_message_lock(&self, message: &ReceivedMessage) -> BrokerResult<DateTime<Utc>> {
        // ---
        self.ensure_open()?;
        self.ensure_settleable()?;
        self.inner.take_fault(Operation::RenewLock)?;

        let token = message.lock_token.clone();
        let until = self.inner.with_entity(&self.path, |entity, now| {
            let until = self.inner.lock_until(now, self.inner.options.lock_duration);
            match entity.locked.get_mut(&token) {
                Some(locked) => {
                    locked.locked_until = until;
                    Ok(until)
                }
                None => Err(BrokerError::lock_lost(format!(
                    "the lock supplied for token {token} is invalid or has expired"
                ))),
            }
        })?;

        self.inner.record(|log| log.renewals.push(token));
        Ok(until)
    }

    async fn peek(&self) -> BrokerResult<Option<ReceivedMessage>> {
        // ---
        self.ensure_open()?;
        self.inner.take_fault(Operation::Peek)?;
        Ok(self.inner.with_entity(&self.path, |entity, _| {
            entity
                .available
                .values()
                .next()
                .map(|m| m.to_received(LockToken::from(""), DateTime::<Utc>::MIN_UTC))
        }))
    }

    async fn entity_properties(&self) -> BrokerResult<EntityProperties> {
        // ---
        self.ensure_open()?;
        self.inner.take_fault(Operation::EntityProperties)?;
        let partition_count = self.inner.options.partition_count;
        Ok(self.inner.with_entity(&self.path, |entity, _| EntityProperties {
            active_message_count: (entity.available.len() + entity.locked.len()) as i64,
            partition_count,
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        // ---
        if self.session_id.is_some() {
            self.inner.take_fault(Operation::CloseSession)?;
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(session_id) = &self.session_id {
            let released = self.inner.with_entity(&self.path, |entity, _| {
                let owned = entity
                    .sessions
                    .get(session_id)
                    .map(|lock| lock.owner == self.id)
                    .unwrap_or(false);
                if !owned {
                    return false;
                }
                entity.sessions.remove(session_id);

                // Unsettled messages go back without counting as a delivery.
                let tokens: Vec<LockToken> = entity
                    .locked
                    .iter()
                    .filter(|(_, l)| l.message.session_id.as_deref() == Some(&**session_id))
                    .map(|(t, _)| t.clone())
                    .collect();
                for token in tokens {
                    if let Some(mut locked) = entity.locked.remove(&token) {
                        locked.message.delivery_count = locked.message.delivery_count.saturating_sub(1);
                        entity
                            .available
                            .insert(locked.message.sequence_number, locked.message);
                    }
                }
                true
            });
            if released {
                self.inner
                    .record(|log| log.closed_sessions.push(session_id.to_string()));
            }
        }
        if self.counted {
            self.inner.record(|log| log.clients_closed += 1);
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn session_locked_until(&self) -> Option<DateTime<Utc>> {
        // ---
        let session_id = self.session_id.as_ref()?;
        let entities = lock_ignore_poison(&self.inner.entities);
        entities
            .get(&self.path)
            .and_then(|entity| entity.sessions.get(session_id))
            .filter(|lock| lock.owner == self.id)
            .map(|lock| lock.locked_until)
    }

    async fn renew_session_lock(&self) -> BrokerResult<DateTime<Utc>> {
        // ---
        let Some(session_id) = self.session_id.clone() else {
            return Err(BrokerError::fatal(format!(
                "receiver {} is not bound to a session",
                self.client_id
            )));
        };
        self.ensure_open()?;
        self.inner.take_fault(Operation::RenewSessionLock)?;

        let until = self.inner.with_entity(&self.path, |entity, now| {
            self.check_session(entity, now)?;
            let until = self
                .inner
                .lock_until(now, self.inner.options.session_lock_duration);
            if let Some(lock) = entity.sessions.get_mut(&session_id) {
                lock.locked_until = until;
            }
            for locked in entity.locked.values_mut() {
                if locked.message.session_id.as_deref() == Some(&*session_id) {
                    locked.locked_until = until;
                }
            }
            Ok::<_, BrokerError>(until)
        })?;

        self.inner
            .record(|log| log.session_renewals.push(session_id.to_string()));
        Ok(until)
    }
}

struct MemorySessionClient {
    inner: Arc<Inner>,
    path: String,
    client_id: String,
    closed: AtomicBool,
    counted: bool,
}

impl MemorySessionClient {
    // ---
    fn new(inner: Arc<Inner>, path: &str) -> Self {
        let (_, client_id) = inner.new_client_id("session-client", path);
        Self {
            inner,
            path: path.to_owned(),
            client_id,
            closed: AtomicBool::new(false),
            counted: false,
        }
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::disposed(format!(
                "session client {} has been closed",
                self.client_id
            )));
        }
        Ok(())
    }

    /// Lock the free session owning the oldest available message.
    fn try_accept(&self) -> Option<SessionHandle> {
        // ---
        let receiver = MemoryReceiver::new(self.inner.clone(), &self.path, None);
        let owner = receiver.id;
        let session_lock = self.inner.options.session_lock_duration;

        let session_id = self.inner.with_entity(&self.path, |entity, now| {
            let session_id = entity
                .available
                .values()
                .filter_map(|m| m.session_id.clone())
                .find(|s| entity.session_is_free(s, now))?;
            entity.sessions.insert(
                session_id.clone(),
                SessionLock {
                    owner,
                    locked_until: self.inner.lock_until(now, session_lock),
                },
            );
            Some(session_id)
        })?;

        let receiver = MemoryReceiver {
            session_id: Some(session_id.clone()),
            ..receiver
        };
        Some(SessionHandle::new(session_id, Arc::new(receiver)))
    }
}

#[async_trait]
impl SessionClient for MemorySessionClient {
    // ---
    fn entity_path(&self) -> &str {
        &self.path
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn accept_session(&self, max_wait: Duration) -> BrokerResult<SessionHandle> {
        // ---
        self.ensure_open()?;
        self.inner.take_fault(Operation::AcceptSession)?;

        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(handle) = self.try_accept() {
                self.inner.record(|log| {
                    log.accepted_sessions
                        .push(handle.session_id().to_owned())
                });
                return Ok(handle);
            }
            if !self.inner.wait_for_change(notified, &self.path, deadline).await {
                return Err(BrokerError::timeout(format!(
                    "no session became available on '{}' within {:?}",
                    self.path, max_wait
                )));
            }
            self.ensure_open()?;
        }
    }

    async fn close(&self) -> BrokerResult<()> {
        // ---
        if !self.closed.swap(true, Ordering::SeqCst) && self.counted {
            self.inner.record(|log| log.clients_closed += 1);
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }
}
