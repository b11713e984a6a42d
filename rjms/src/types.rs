use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

pub use rjms_utils::TimestampMillis;

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;
pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

pub type ConnectionId = ByteString;
pub type ClientId = ByteString;
pub type UserName = ByteString;
pub type Password = Bytes;
pub type DestinationName = ByteString;
pub type QueueName = ByteString;
pub type SubscriptionId = ByteString;
pub type SubscriptionName = ByteString;
pub type MessageId = ByteString;
pub type TxId = ByteString;
pub type SelectorExpr = ByteString;
pub type PropertyName = ByteString;
pub type Properties = HashMap<PropertyName, PropertyValue>;

/// Identity of one handle inside the message store, never reused.
pub type HandleId = u64;
/// Identity of one in-flight delivery, unique across the broker.
pub type AckToken = u64;
pub type Priority = u8;

pub const PRIORITY_MIN: Priority = 0;
pub const PRIORITY_MAX: Priority = 9;
pub const PRIORITY_DEFAULT: Priority = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeliveryMode {
    NonPersistent,
    #[default]
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationKind {
    Queue,
    Topic,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Queue => write!(f, "QUEUE"),
            DestinationKind::Topic => write!(f, "TOPIC"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(ByteString),
}

/// Everything about a message except its body.
///
/// Handles keep the header resident while the body is tiered, so ordering,
/// expiry and selector evaluation never need to touch the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub message_id: MessageId,
    pub destination: DestinationName,
    pub priority: Priority,
    pub timestamp: TimestampMillis,
    /// 0 = never expires
    pub expiration: TimestampMillis,
    /// 0 = deliver immediately
    pub delivery_time: TimestampMillis,
    pub delivery_mode: DeliveryMode,
    pub redelivered: bool,
    pub delivery_count: u32,
    /// Delay before a nacked or rolled back message is offered again, 0 = none
    pub redelivery_delay: TimestampMillis,
    pub correlation_id: Option<ByteString>,
    pub reply_to: Option<DestinationName>,
    pub typ: Option<ByteString>,
    /// Connection that produced the message, used for no-local filtering
    pub producer: Option<ConnectionId>,
    pub properties: Properties,
}

impl Header {
    #[inline]
    pub fn is_expired(&self, now: TimestampMillis) -> bool {
        self.expiration > 0 && self.expiration <= now
    }

    #[inline]
    pub fn is_persistent(&self) -> bool {
        matches!(self.delivery_mode, DeliveryMode::Persistent)
    }

    #[inline]
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: Header,
    pub body: Bytes,
}

impl Message {
    #[inline]
    pub fn new<D: Into<DestinationName>, B: Into<Bytes>>(destination: D, body: B) -> Self {
        let timestamp = rjms_utils::timestamp_millis();
        Self {
            header: Header {
                message_id: ByteString::from(format!("ID:{}", uuid::Uuid::new_v4().as_simple())),
                destination: destination.into(),
                priority: PRIORITY_DEFAULT,
                timestamp,
                expiration: 0,
                delivery_time: 0,
                delivery_mode: DeliveryMode::default(),
                redelivered: false,
                delivery_count: 0,
                redelivery_delay: 0,
                correlation_id: None,
                reply_to: None,
                typ: None,
                producer: None,
                properties: Properties::default(),
            },
            body: body.into(),
        }
    }

    #[inline]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.header.priority = priority.min(PRIORITY_MAX);
        self
    }

    #[inline]
    pub fn expiration(mut self, expiration: TimestampMillis) -> Self {
        self.header.expiration = expiration;
        self
    }

    #[inline]
    pub fn time_to_live(mut self, ttl_millis: i64) -> Self {
        self.header.expiration = if ttl_millis > 0 { self.header.timestamp + ttl_millis } else { 0 };
        self
    }

    #[inline]
    pub fn delivery_time(mut self, delivery_time: TimestampMillis) -> Self {
        self.header.delivery_time = delivery_time;
        self
    }

    #[inline]
    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.header.delivery_mode = mode;
        self
    }

    #[inline]
    pub fn redelivery_delay(mut self, delay_millis: TimestampMillis) -> Self {
        self.header.redelivery_delay = delay_millis;
        self
    }

    #[inline]
    pub fn property<N: Into<PropertyName>>(mut self, name: N, value: PropertyValue) -> Self {
        self.header.properties.insert(name.into(), value);
        self
    }

    #[inline]
    pub fn id(&self) -> &MessageId {
        &self.header.message_id
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// One message handed to a consumer, acknowledged later by its token.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub token: AckToken,
    pub subscription: SubscriptionId,
    pub message: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckKind {
    Ack,
    Nack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRequest {
    pub token: AckToken,
    pub kind: AckKind,
}

impl AckRequest {
    #[inline]
    pub fn ack(token: AckToken) -> Self {
        Self { token, kind: AckKind::Ack }
    }

    #[inline]
    pub fn nack(token: AckToken) -> Self {
        Self { token, kind: AckKind::Nack }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReceiveMode {
    /// Deliveries are pushed through the session's outbound pipeline.
    #[default]
    Listener,
    /// Deliveries are only returned from explicit `receive` calls.
    Sync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    pub id: SubscriptionId,
    pub destination: DestinationName,
    pub selector: Option<SelectorExpr>,
    pub no_local: bool,
    /// Durable subscription name, topics only
    pub durable: Option<SubscriptionName>,
    pub mode: ReceiveMode,
}

impl SubscriptionSpec {
    #[inline]
    pub fn new<I: Into<SubscriptionId>, D: Into<DestinationName>>(id: I, destination: D) -> Self {
        Self {
            id: id.into(),
            destination: destination.into(),
            selector: None,
            no_local: false,
            durable: None,
            mode: ReceiveMode::Listener,
        }
    }

    #[inline]
    pub fn selector<S: Into<SelectorExpr>>(mut self, selector: S) -> Self {
        self.selector = Some(selector.into());
        self
    }

    #[inline]
    pub fn no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    #[inline]
    pub fn durable<N: Into<SubscriptionName>>(mut self, name: N) -> Self {
        self.durable = Some(name.into());
        self
    }

    #[inline]
    pub fn mode(mut self, mode: ReceiveMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectInfo {
    pub client_id: Option<ClientId>,
    pub username: Option<UserName>,
    pub password: Option<Password>,
}

impl ConnectInfo {
    #[inline]
    pub fn with_client_id<C: Into<ClientId>>(client_id: C) -> Self {
        Self { client_id: Some(client_id.into()), ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionRequest {
    /// One-phase commit of everything accumulated under the id
    Commit(TxId),
    /// Abort an active transaction
    Rollback(TxId),
    /// First phase of a two-phase commit
    Prepare(TxId),
    CommitPrepared(TxId),
    RollbackPrepared(TxId),
    /// Ids of prepared transactions still awaiting resolution
    Recover,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
    Prepared,
    Recovered(Vec<TxId>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub kind: DestinationKind,
    /// Resident message limit per queue, `None` uses `queue.max_depth`
    pub max_depth: Option<usize>,
    /// Persistent messages are saved on admission and restored at startup
    pub persistent: bool,
    /// Queues only: a single bound receiver
    pub exclusive: bool,
}

impl DestinationConfig {
    #[inline]
    pub fn queue() -> Self {
        Self { kind: DestinationKind::Queue, max_depth: None, persistent: true, exclusive: false }
    }

    #[inline]
    pub fn topic() -> Self {
        Self { kind: DestinationKind::Topic, max_depth: None, persistent: true, exclusive: false }
    }

    #[inline]
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    #[inline]
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    #[inline]
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

pub type HeaderRef = Arc<Header>;
