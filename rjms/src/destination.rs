use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::context::ServerContext;
use crate::error::{BrokerError, Result};
use crate::queue::{Queue, ReceiverId, ReceiverRef};
use crate::selector::Selector;
use crate::state::DurableRecord;
use crate::txn::Transaction;
use crate::types::{
    ClientId, ConnectionId, DestinationConfig, DestinationKind, DestinationName, HashMap, Message, SelectorExpr,
    SubscriptionName,
};

pub type DurableKey = (ClientId, SubscriptionName);

/// A named queue or topic.
#[derive(Clone)]
pub enum Destination {
    Queue(QueueDestination),
    Topic(TopicDestination),
}

impl Destination {
    pub fn new(scx: ServerContext, name: DestinationName, cfg: DestinationConfig) -> Self {
        match cfg.kind {
            DestinationKind::Queue => Destination::Queue(QueueDestination::new(scx, name, cfg)),
            DestinationKind::Topic => Destination::Topic(TopicDestination::new(scx, name, cfg)),
        }
    }

    #[inline]
    pub fn name(&self) -> &DestinationName {
        match self {
            Destination::Queue(q) => &q.inner.name,
            Destination::Topic(t) => &t.inner.name,
        }
    }

    #[inline]
    pub fn config(&self) -> &DestinationConfig {
        match self {
            Destination::Queue(q) => &q.inner.cfg,
            Destination::Topic(t) => &t.inner.cfg,
        }
    }

    #[inline]
    pub fn kind(&self) -> DestinationKind {
        self.config().kind
    }

    pub async fn add_message(&self, message: Message, tx: Option<&Transaction>) -> Result<()> {
        match self {
            Destination::Queue(q) => q.add_message(message, tx).await,
            Destination::Topic(t) => t.add_message(message, tx).await,
        }
    }

    /// Purges every queue of the destination.
    pub async fn close(&self) {
        match self {
            Destination::Queue(q) => {
                q.inner.queue.purge().await;
            }
            Destination::Topic(t) => t.close().await,
        }
    }
}

#[inline]
fn max_depth_of(scx: &ServerContext, cfg: &DestinationConfig) -> usize {
    cfg.max_depth.unwrap_or(scx.settings.queue.max_depth)
}

/// Stores `message` and admits it to `queue`. On refusal the store is undone
/// within `tx`, so a save staged by the transaction never commits.
async fn store_and_add(scx: &ServerContext, queue: &Queue, message: Message, tx: Option<&Transaction>) -> Result<()> {
    queue.check_capacity()?;
    let durable = queue.is_durable() && message.header.is_persistent();
    let tx_id = tx.map(|tx| tx.id());
    let handle = scx.store.add(message, queue.name(), durable, tx_id).await?;
    if let Err(e) = queue.add_message(handle.clone(), tx).await {
        scx.store.remove_within(&handle, tx_id).await?;
        return Err(e);
    }
    Ok(())
}

#[derive(Clone)]
pub struct QueueDestination {
    inner: Arc<QueueDestinationInner>,
}

struct QueueDestinationInner {
    scx: ServerContext,
    name: DestinationName,
    cfg: DestinationConfig,
    queue: Queue,
    bound: Mutex<Option<ReceiverRef>>,
}

impl QueueDestination {
    fn new(scx: ServerContext, name: DestinationName, cfg: DestinationConfig) -> Self {
        let queue = Queue::new(scx.clone(), name.clone(), max_depth_of(&scx, &cfg), cfg.persistent);
        Self { inner: Arc::new(QueueDestinationInner { scx, name, cfg, queue, bound: Mutex::new(None) }) }
    }

    #[inline]
    pub fn queue(&self) -> &Queue {
        &self.inner.queue
    }

    #[inline]
    pub fn is_exclusive(&self) -> bool {
        self.inner.cfg.exclusive
    }

    /// Binds the single receiver of an exclusive queue, a no-op otherwise.
    pub fn bind(&self, receiver: &ReceiverRef) -> Result<()> {
        if !self.is_exclusive() {
            return Ok(());
        }
        let mut bound = self.inner.bound.lock();
        match bound.as_ref() {
            Some(r) if r.id() != receiver.id() => Err(BrokerError::InvalidSubscription(
                format!("exclusive queue {} already has a receiver", self.inner.name).into(),
            )),
            _ => {
                *bound = Some(receiver.clone());
                Ok(())
            }
        }
    }

    #[inline]
    pub fn unbind(&self, receiver: ReceiverId) {
        let mut bound = self.inner.bound.lock();
        if bound.as_ref().map(|r| r.id() == receiver).unwrap_or(false) {
            *bound = None;
        }
    }

    /// Reloads the stored backlog of a persistent queue.
    pub async fn restore(&self) -> Result<usize> {
        let handles = self.inner.scx.store.restore(self.inner.queue.name()).await?;
        let restored = handles.len();
        self.inner.queue.restore(handles).await;
        Ok(restored)
    }

    async fn add_message(&self, message: Message, tx: Option<&Transaction>) -> Result<()> {
        if self.is_exclusive() {
            let bound = self.inner.bound.lock().clone();
            if let Some(receiver) = bound {
                if !receiver.accepts(&message.header) {
                    log::debug!("{} exclusive receiver rejected {}", self.inner.name, message.header.message_id);
                    self.inner.scx.stats.messages_dropped.inc();
                    return Ok(());
                }
            }
        }
        store_and_add(&self.inner.scx, &self.inner.queue, message, tx).await
    }
}

/// One subscription queue of a topic.
#[derive(Clone)]
pub struct TopicSubscription {
    inner: Arc<TopicSubscriptionInner>,
}

struct TopicSubscriptionInner {
    queue: Queue,
    selector: Option<Selector>,
    selector_expr: Option<SelectorExpr>,
    no_local: bool,
    //connection whose own messages are filtered out by no-local
    owner: RwLock<Option<ConnectionId>>,
}

impl TopicSubscription {
    fn new(
        queue: Queue,
        selector: Option<Selector>,
        selector_expr: Option<SelectorExpr>,
        no_local: bool,
        owner: Option<ConnectionId>,
    ) -> Self {
        Self {
            inner: Arc::new(TopicSubscriptionInner {
                queue,
                selector,
                selector_expr,
                no_local,
                owner: RwLock::new(owner),
            }),
        }
    }

    #[inline]
    pub fn queue(&self) -> &Queue {
        &self.inner.queue
    }

    #[inline]
    pub fn owner(&self) -> Option<ConnectionId> {
        self.inner.owner.read().clone()
    }

    #[inline]
    fn set_owner(&self, owner: Option<ConnectionId>) {
        *self.inner.owner.write() = owner;
    }

    #[inline]
    fn same_filter(&self, selector_expr: &Option<SelectorExpr>, no_local: bool) -> bool {
        &self.inner.selector_expr == selector_expr && self.inner.no_local == no_local
    }

    async fn add_message(&self, scx: &ServerContext, message: Message, tx: Option<&Transaction>) -> Result<()> {
        if self.inner.no_local {
            if let (Some(producer), Some(owner)) = (message.header.producer.as_ref(), self.owner()) {
                if producer == &owner {
                    return Ok(());
                }
            }
        }
        //filtered before anything is stored
        if let Some(selector) = self.inner.selector.as_ref() {
            if !selector.test(&message.header) {
                return Ok(());
            }
        }
        store_and_add(scx, &self.inner.queue, message, tx).await
    }
}

#[derive(Clone)]
pub struct TopicDestination {
    inner: Arc<TopicDestinationInner>,
}

struct TopicDestinationInner {
    scx: ServerContext,
    name: DestinationName,
    cfg: DestinationConfig,
    temporary: RwLock<Arc<HashMap<ReceiverId, TopicSubscription>>>,
    durable: RwLock<Arc<HashMap<DurableKey, TopicSubscription>>>,
}

impl TopicDestination {
    fn new(scx: ServerContext, name: DestinationName, cfg: DestinationConfig) -> Self {
        Self {
            inner: Arc::new(TopicDestinationInner {
                scx,
                name,
                cfg,
                temporary: RwLock::new(Arc::new(HashMap::default())),
                durable: RwLock::new(Arc::new(HashMap::default())),
            }),
        }
    }

    /// Fans `message` out to every subscription. Failures are collected after
    /// every subscription has been attempted.
    async fn add_message(&self, message: Message, tx: Option<&Transaction>) -> Result<()> {
        let temporary = self.inner.temporary.read().clone();
        let durable = self.inner.durable.read().clone();
        let mut errs = Vec::new();
        for sub in temporary.values().chain(durable.values()) {
            if let Err(e) = sub.add_message(&self.inner.scx, message.clone(), tx).await {
                log::debug!("{} fan-out to {} failed, {}", self.inner.name, sub.queue().name(), e);
                errs.push(e);
            }
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::Composite(errs))
        }
    }

    /// Creates a private queue for one non-durable subscriber.
    pub fn subscribe_temporary(
        &self,
        receiver: ReceiverId,
        connection: &ConnectionId,
        selector: Option<Selector>,
        no_local: bool,
    ) -> Queue {
        let scx = &self.inner.scx;
        let queue =
            Queue::new(scx.clone(), format!("{}.{}", self.inner.name, receiver).into(), max_depth_of(scx, &self.inner.cfg), false);
        let sub = TopicSubscription::new(queue.clone(), selector, None, no_local, Some(connection.clone()));
        let mut temporary = self.inner.temporary.write();
        let mut subs = temporary.as_ref().clone();
        subs.insert(receiver, sub);
        *temporary = Arc::new(subs);
        queue
    }

    /// Discards the queue of a non-durable subscriber.
    pub async fn unsubscribe_temporary(&self, receiver: ReceiverId) -> bool {
        let removed = {
            let mut temporary = self.inner.temporary.write();
            let mut subs = temporary.as_ref().clone();
            let removed = subs.remove(&receiver);
            *temporary = Arc::new(subs);
            removed
        };
        match removed {
            Some(sub) => {
                sub.queue().purge().await;
                true
            }
            None => false,
        }
    }

    /// Attaches `connection` to the durable subscription `(client_id, name)`,
    /// creating it when absent and recreating it when the selector or the
    /// no-local flag changed.
    pub async fn subscribe_durable(
        &self,
        client_id: &ClientId,
        name: &SubscriptionName,
        selector_expr: Option<SelectorExpr>,
        no_local: bool,
        connection: &ConnectionId,
    ) -> Result<Queue> {
        let key = (client_id.clone(), name.clone());
        let existing = self.inner.durable.read().get(&key).cloned();
        if let Some(sub) = existing {
            if sub.same_filter(&selector_expr, no_local) {
                sub.set_owner(Some(connection.clone()));
                return Ok(sub.queue().clone());
            }
            log::info!("{} durable subscription {}/{} changed, recreating", self.inner.name, client_id, name);
            self.remove_durable(&key).await;
        }

        let record =
            DurableRecord { client_id: client_id.clone(), name: name.clone(), topic: self.inner.name.clone(), selector: selector_expr, no_local };
        let sub = self.create_durable(&record, Some(connection.clone()))?;
        self.inner.scx.state.register_durable(record).await?;
        Ok(sub.queue().clone())
    }

    fn create_durable(&self, record: &DurableRecord, owner: Option<ConnectionId>) -> Result<TopicSubscription> {
        let scx = &self.inner.scx;
        let selector = match record.selector.as_ref() {
            Some(expr) => scx.selectors.compile(expr)?,
            None => None,
        };
        let queue = Queue::new(
            scx.clone(),
            durable_queue_name(&self.inner.name, &record.client_id, &record.name),
            max_depth_of(scx, &self.inner.cfg),
            self.inner.cfg.persistent,
        );
        let sub = TopicSubscription::new(queue, selector, record.selector.clone(), record.no_local, owner);
        let mut durable = self.inner.durable.write();
        let mut subs = durable.as_ref().clone();
        subs.insert((record.client_id.clone(), record.name.clone()), sub.clone());
        *durable = Arc::new(subs);
        Ok(sub)
    }

    async fn remove_durable(&self, key: &DurableKey) -> Option<TopicSubscription> {
        let removed = {
            let mut durable = self.inner.durable.write();
            let mut subs = durable.as_ref().clone();
            let removed = subs.remove(key);
            *durable = Arc::new(subs);
            removed
        };
        if let Some(sub) = removed.as_ref() {
            sub.queue().purge().await;
        }
        removed
    }

    /// The durable subscription survives, only the no-local owner is cleared.
    pub fn detach_durable(&self, client_id: &ClientId, name: &SubscriptionName) {
        if let Some(sub) = self.inner.durable.read().get(&(client_id.clone(), name.clone())) {
            sub.set_owner(None);
        }
    }

    /// Destroys a durable subscription and its backlog.
    pub async fn unsubscribe_durable(&self, client_id: &ClientId, name: &SubscriptionName) -> Result<()> {
        let key = (client_id.clone(), name.clone());
        if let Some(sub) = self.inner.durable.read().get(&key) {
            if sub.owner().is_some() {
                return Err(BrokerError::InvalidSubscription(
                    format!("durable subscription {client_id}/{name} is in use").into(),
                ));
            }
        }
        if self.remove_durable(&key).await.is_none() {
            return Err(BrokerError::InvalidSubscription(format!("no durable subscription {client_id}/{name}").into()));
        }
        self.inner.scx.state.unregister_durable(client_id, name).await
    }

    /// Recreates a registered durable subscription and reloads its stored backlog.
    pub async fn restore_durable(&self, record: &DurableRecord) -> Result<usize> {
        let sub = self.create_durable(record, None)?;
        let handles = self.inner.scx.store.restore(sub.queue().name()).await?;
        let restored = handles.len();
        sub.queue().restore(handles).await;
        Ok(restored)
    }

    #[inline]
    pub fn durable_queue(&self, client_id: &ClientId, name: &SubscriptionName) -> Option<Queue> {
        self.inner.durable.read().get(&(client_id.clone(), name.clone())).map(|sub| sub.queue().clone())
    }

    #[inline]
    pub fn subscriptions_len(&self) -> usize {
        self.inner.temporary.read().len() + self.inner.durable.read().len()
    }

    async fn close(&self) {
        let temporary = std::mem::replace(&mut *self.inner.temporary.write(), Arc::new(HashMap::default()));
        let durable = std::mem::replace(&mut *self.inner.durable.write(), Arc::new(HashMap::default()));
        for sub in temporary.values() {
            sub.queue().purge().await;
        }
        for ((client_id, name), sub) in durable.iter() {
            sub.queue().purge().await;
            if let Err(e) = self.inner.scx.state.unregister_durable(client_id, name).await {
                log::warn!("{} unregister durable {}/{} error, {}", self.inner.name, client_id, name, e);
            }
        }
    }
}

#[inline]
pub fn durable_queue_name(topic: &DestinationName, client_id: &ClientId, name: &SubscriptionName) -> DestinationName {
    format!("{topic}.{client_id}.{name}").into()
}
