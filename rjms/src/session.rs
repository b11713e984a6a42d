//! Per connection delivery pipeline.
//!
//! Listener subscriptions pull from their queue while they hold prefetch
//! credit and hand what they get to the session's bounded outbound FIFO. One
//! job at a time drains the FIFO on the shared worker pool and pushes the
//! whole batch to the client transport. A push failure is a connection fault:
//! it is reported to the broker, which tears the connection down.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rust_box::task_exec_queue::SpawnExt;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;

use crate::context::ServerContext;
use crate::destination::Destination;
use crate::error::{BrokerError, Result};
use crate::queue::{Dispatch, Queue, Receiver, ReceiverId, ReceiverRef};
use crate::selector::Selector;
use crate::txn::Transaction;
use crate::types::{
    AckKind, AckRequest, AckToken, ClientId, ConnectionId, Delivery, HashMap, Header, ReceiveMode, SubscriptionId,
    SubscriptionName, SubscriptionSpec, TimestampMillis,
};

/// Outbound side of a client connection.
#[async_trait]
pub trait ClientTransport: Sync + Send {
    async fn push_deliveries(&self, connection: &ConnectionId, batch: Vec<Delivery>) -> Result<()>;

    async fn pong(&self, connection: &ConnectionId, timestamp: TimestampMillis) -> Result<()>;
}

pub type TransportRef = Arc<dyn ClientTransport>;

pub(crate) type FaultSender = mpsc::UnboundedSender<(ConnectionId, BrokerError)>;

struct Outbound {
    subscription: Arc<Subscription>,
    dispatch: Dispatch,
}

struct Unacked {
    subscription: Arc<Subscription>,
    queue: Queue,
}

/// One consumer of a destination, bound to a session.
pub struct Subscription {
    me: Weak<Subscription>,
    spec: SubscriptionSpec,
    receiver: ReceiverId,
    destination: Destination,
    queue: Queue,
    selector: Option<Selector>,
    //topic subscription queues are filtered on fan-out
    filter_on_receive: bool,
    connection: ConnectionId,
    session: Weak<SessionInner>,
    prefetch: usize,
    unacked: AtomicUsize,
    starved: AtomicBool,
    detached: AtomicBool,
    //one synchronous receive at a time
    receiving: AtomicBool,
    pump_lock: tokio::sync::Mutex<()>,
}

impl Subscription {
    #[inline]
    pub fn id(&self) -> &SubscriptionId {
        &self.spec.id
    }

    #[inline]
    pub fn spec(&self) -> &SubscriptionSpec {
        &self.spec
    }

    #[inline]
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    #[inline]
    pub fn receiver_id(&self) -> ReceiverId {
        self.receiver
    }

    #[inline]
    fn is_listener(&self) -> bool {
        self.spec.mode == ReceiveMode::Listener
    }

    #[inline]
    fn release_credit(&self) {
        let _ = self.unacked.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    fn schedule_pump(self: &Arc<Self>) {
        if !self.is_listener() {
            return;
        }
        let sub = self.clone();
        tokio::spawn(async move { sub.pump().await });
    }

    /// Pulls from the queue while credit lasts; on a miss the subscription is
    /// left registered as a waiting receiver.
    async fn pump(self: Arc<Self>) {
        let _pumping = self.pump_lock.lock().await;
        loop {
            let session = match self.session.upgrade() {
                Some(session) => session,
                None => return,
            };
            if self.detached.load(Ordering::SeqCst) || session.is_closed() {
                return;
            }
            if !session.is_enabled() {
                session.block(self.id());
                return;
            }
            if self.unacked.load(Ordering::SeqCst) >= self.prefetch {
                return;
            }

            let receiver: ReceiverRef = self.clone();
            match self.queue.receive(&receiver, true).await {
                Ok(Some(dispatch)) => {
                    let token = dispatch.token;
                    if session.queue_for_delivery(Outbound { subscription: self.clone(), dispatch }) {
                        self.unacked.fetch_add(1, Ordering::SeqCst);
                    } else {
                        self.starved.store(true, Ordering::SeqCst);
                        self.queue.requeue(token).await;
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    log::warn!("{} subscription {} pump error, {}", self.connection, self.spec.id, e);
                    return;
                }
            }
        }
    }
}

impl Receiver for Subscription {
    #[inline]
    fn id(&self) -> ReceiverId {
        self.receiver
    }

    fn accepts(&self, header: &Header) -> bool {
        if !self.filter_on_receive {
            return true;
        }
        if self.spec.no_local && header.producer.as_ref() == Some(&self.connection) {
            return false;
        }
        self.selector.as_ref().map(|s| s.test(header)).unwrap_or(true)
    }

    #[inline]
    fn is_simple(&self) -> bool {
        !self.filter_on_receive || (self.selector.is_none() && !self.spec.no_local)
    }

    fn deliver(&self, dispatch: Dispatch) -> bool {
        if self.detached.load(Ordering::SeqCst) {
            return false;
        }
        let (me, session) = match (self.me.upgrade(), self.session.upgrade()) {
            (Some(me), Some(session)) => (me, session),
            _ => return false,
        };
        if session.queue_for_delivery(Outbound { subscription: me.clone(), dispatch }) {
            self.unacked.fetch_add(1, Ordering::SeqCst);
            me.schedule_pump();
            true
        } else {
            self.starved.store(true, Ordering::SeqCst);
            false
        }
    }
}

/// Registration of one blocking `receive` call.
struct WaitingReceiver {
    subscription: Arc<Subscription>,
    tx: Mutex<Option<oneshot::Sender<Dispatch>>>,
}

impl Receiver for WaitingReceiver {
    #[inline]
    fn id(&self) -> ReceiverId {
        self.subscription.receiver
    }

    #[inline]
    fn accepts(&self, header: &Header) -> bool {
        self.subscription.accepts(header)
    }

    #[inline]
    fn is_simple(&self) -> bool {
        self.subscription.is_simple()
    }

    fn deliver(&self, dispatch: Dispatch) -> bool {
        let tx = self.tx.lock().take();
        let enabled = self.subscription.session.upgrade().map(|s| s.is_enabled()).unwrap_or(false);
        match tx {
            //dropping the sender sends the caller back to wait for enable
            Some(_) if !enabled => false,
            Some(tx) => tx.send(dispatch).is_ok(),
            None => false,
        }
    }
}

/// An outstanding registration of a blocking `receive`. Dropped with a
/// handoff still unread, the message goes back to its queue.
struct PendingReceive {
    queue: Queue,
    receiver: ReceiverId,
    rx: oneshot::Receiver<Dispatch>,
}

impl PendingReceive {
    /// Releases the registration, returning a handoff that raced in first.
    #[inline]
    fn release(&mut self) -> Option<Dispatch> {
        self.queue.cancel_wait(self.receiver);
        self.rx.try_recv().ok()
    }
}

impl Drop for PendingReceive {
    fn drop(&mut self) {
        if let Some(dispatch) = self.release() {
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn(async move {
                        dispatch.queue.requeue(dispatch.token).await;
                    });
                }
                Err(_) => log::warn!("{:?} dropped outside a runtime, stays in flight", dispatch.handle),
            }
        }
    }
}

#[derive(Clone)]
pub struct ConsumerSession {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    scx: ServerContext,
    connection: ConnectionId,
    client_id: Option<ClientId>,
    transport: TransportRef,
    faults: FaultSender,
    enabled: AtomicBool,
    closed: AtomicBool,
    scheduled: AtomicBool,
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<Subscription>>>,
    outbound: Mutex<VecDeque<Outbound>>,
    outbound_max: usize,
    blocked: Mutex<Vec<SubscriptionId>>,
    enabled_notify: Notify,
    unacked: Mutex<HashMap<AckToken, Unacked>>,
}

impl ConsumerSession {
    pub(crate) fn new(
        scx: ServerContext,
        connection: ConnectionId,
        client_id: Option<ClientId>,
        transport: TransportRef,
        faults: FaultSender,
    ) -> Self {
        let outbound_max = scx.settings.session.outbound_max;
        Self {
            inner: Arc::new(SessionInner {
                scx,
                connection,
                client_id,
                transport,
                faults,
                enabled: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                scheduled: AtomicBool::new(false),
                subscriptions: RwLock::new(HashMap::default()),
                outbound: Mutex::new(VecDeque::new()),
                outbound_max,
                blocked: Mutex::new(Vec::new()),
                enabled_notify: Notify::new(),
                unacked: Mutex::new(HashMap::default()),
            }),
        }
    }

    #[inline]
    pub fn connection(&self) -> &ConnectionId {
        &self.inner.connection
    }

    #[inline]
    pub fn client_id(&self) -> Option<&ClientId> {
        self.inner.client_id.as_ref()
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    #[inline]
    pub fn subscription(&self, id: &SubscriptionId) -> Result<Arc<Subscription>> {
        self.inner
            .subscriptions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::InvalidSubscription(format!("unknown subscription {id}").into()))
    }

    #[inline]
    pub fn subscriptions_len(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    #[inline]
    pub fn blocked_len(&self) -> usize {
        self.inner.blocked.lock().len()
    }

    #[inline]
    pub fn outbound_len(&self) -> usize {
        self.inner.outbound.lock().len()
    }

    #[inline]
    pub fn unacked_len(&self) -> usize {
        self.inner.unacked.lock().len()
    }

    /// True when one of this session's subscriptions is attached to the durable `name`.
    #[inline]
    pub fn has_durable(&self, name: &SubscriptionName) -> bool {
        self.inner.subscriptions.read().values().any(|s| s.spec.durable.as_ref() == Some(name))
    }

    /// Attaches a consumer of `destination`. Listener subscriptions start pulling right away.
    pub async fn subscribe(&self, spec: SubscriptionSpec, destination: Destination) -> Result<()> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(BrokerError::Connection(format!("{} is closed", inner.connection)));
        }
        if inner.subscriptions.read().contains_key(&spec.id) {
            return Err(BrokerError::InvalidSubscription(format!("duplicate subscription id {}", spec.id).into()));
        }
        if let Some(name) = spec.durable.as_ref() {
            if self.has_durable(name) {
                return Err(BrokerError::InvalidSubscription(format!("durable {name} is already active").into()));
            }
        }

        let selector = match spec.selector.as_ref() {
            Some(expr) => inner.scx.selectors.compile(expr)?,
            None => None,
        };
        let receiver = inner.scx.next_receiver_id();
        let (queue, filter_on_receive) = match (&destination, spec.durable.as_ref()) {
            (Destination::Queue(_), Some(_)) => {
                return Err(BrokerError::InvalidSubscription(
                    format!("durable subscription on queue {}", destination.name()).into(),
                ))
            }
            (Destination::Queue(qd), None) => (qd.queue().clone(), true),
            (Destination::Topic(td), Some(name)) => {
                let client_id = inner.client_id.as_ref().ok_or_else(|| {
                    BrokerError::InvalidSubscription("durable subscription requires a client id".into())
                })?;
                let queue =
                    td.subscribe_durable(client_id, name, spec.selector.clone(), spec.no_local, &inner.connection).await?;
                (queue, false)
            }
            (Destination::Topic(td), None) => {
                (td.subscribe_temporary(receiver, &inner.connection, selector.clone(), spec.no_local), false)
            }
        };

        let sub = Arc::new_cyclic(|me| Subscription {
            me: me.clone(),
            spec,
            receiver,
            destination,
            queue,
            selector,
            filter_on_receive,
            connection: inner.connection.clone(),
            session: Arc::downgrade(inner),
            prefetch: inner.scx.settings.session.prefetch,
            unacked: AtomicUsize::new(0),
            starved: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            pump_lock: tokio::sync::Mutex::new(()),
        });

        if let Destination::Queue(qd) = &sub.destination {
            let receiver: ReceiverRef = sub.clone();
            qd.bind(&receiver)?;
        }

        inner.subscriptions.write().insert(sub.spec.id.clone(), sub.clone());
        inner.scx.stats.subscriptions.inc();
        log::debug!("{} subscribed {} to {}", inner.connection, sub.spec.id, sub.destination.name());
        sub.schedule_pump();
        Ok(())
    }

    /// Detaches a subscription. Its delivered but unacknowledged messages stay
    /// acknowledgeable.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        let sub = self
            .inner
            .subscriptions
            .write()
            .remove(id)
            .ok_or_else(|| BrokerError::InvalidSubscription(format!("unknown subscription {id}").into()))?;
        self.inner.detach(&sub).await;
        self.inner.scx.stats.subscriptions.dec();
        Ok(())
    }

    /// Synchronous receive: `wait_millis` < 0 returns at once, 0 waits forever,
    /// > 0 waits up to that many milliseconds. While the session is disabled the
    /// request parks until it is enabled again or the wait runs out.
    pub async fn receive(&self, id: &SubscriptionId, wait_millis: i64) -> Result<Option<Delivery>> {
        let sub = self.subscription(id)?;
        if sub.is_listener() {
            return Err(BrokerError::InvalidSubscription(format!("{id} is a listener subscription").into()));
        }
        if sub.receiving.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::InvalidSubscription(format!("{id} is already receiving").into()));
        }
        let _receiving = scopeguard::guard(sub.clone(), |sub| sub.receiving.store(false, Ordering::SeqCst));

        let deadline = (wait_millis > 0).then(|| Instant::now() + Duration::from_millis(wait_millis as u64));
        let dispatch = loop {
            if !self.inner.wait_enabled(id, wait_millis, deadline).await {
                return Ok(None);
            }
            if wait_millis < 0 {
                let receiver: ReceiverRef = sub.clone();
                break sub.queue.receive(&receiver, false).await?;
            }

            let (tx, rx) = oneshot::channel();
            let receiver: ReceiverRef = Arc::new(WaitingReceiver { subscription: sub.clone(), tx: Mutex::new(Some(tx)) });
            if let Some(dispatch) = sub.queue.receive(&receiver, true).await? {
                break Some(dispatch);
            }
            let mut pending = PendingReceive { queue: sub.queue.clone(), receiver: sub.receiver, rx };
            let received = match deadline {
                None => (&mut pending.rx).await,
                Some(deadline) => {
                    let res = tokio::time::timeout_at(deadline, &mut pending.rx).await;
                    match res {
                        Ok(res) => res,
                        //a delivery may have raced in before the registration was released
                        Err(_) => break pending.release(),
                    }
                }
            };
            match received {
                Ok(dispatch) => break Some(dispatch),
                //refused while disabled
                Err(_) => continue,
            }
        };

        match dispatch {
            Some(dispatch) => self.inner.materialize(&sub, dispatch).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn acknowledge(&self, req: AckRequest, tx: Option<&Transaction>) -> Result<()> {
        let Unacked { subscription, queue } =
            self.inner.unacked.lock().remove(&req.token).ok_or_else(|| {
                BrokerError::InvalidSubscription(format!("unknown ack token {}", req.token).into())
            })?;
        let res = queue.acknowledge(req.token, req.kind, tx).await;
        subscription.release_credit();
        subscription.schedule_pump();
        res
    }

    pub fn set_enabled(&self, enabled: bool) {
        let inner = &self.inner;
        let was = inner.enabled.swap(enabled, Ordering::SeqCst);
        if !enabled {
            let subs = inner.subscriptions.read().values().filter(|s| s.is_listener()).cloned().collect::<Vec<_>>();
            for sub in subs {
                sub.queue.cancel_wait(sub.receiver);
                inner.block(sub.id());
            }
        } else if !was {
            let blocked = std::mem::take(&mut *inner.blocked.lock());
            for id in blocked {
                if let Ok(sub) = self.subscription(&id) {
                    sub.schedule_pump();
                }
            }
            inner.enabled_notify.notify_waiters();
            inner.schedule_flush();
        }
    }

    pub async fn ping(&self, timestamp: TimestampMillis) -> Result<()> {
        self.inner.transport.pong(&self.inner.connection, timestamp).await
    }

    /// Stops delivery, detaches every subscription and nacks every message
    /// still in flight for this session.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.outbound.lock().clear();
        inner.blocked.lock().clear();
        inner.enabled_notify.notify_waiters();

        let subs = std::mem::take(&mut *inner.subscriptions.write());
        inner.scx.stats.subscriptions.decs(subs.len() as isize);
        for sub in subs.values() {
            inner.detach(sub).await;
        }

        let unacked = std::mem::take(&mut *inner.unacked.lock());
        for (token, Unacked { queue, .. }) in unacked {
            if let Err(e) = queue.acknowledge(token, AckKind::Nack, None).await {
                log::debug!("{} close, nack {} error, {}", inner.connection, token, e);
            }
        }
        //outbound entries and racing handoffs are still in flight in their queues
        for sub in subs.values() {
            sub.queue.recover(sub.receiver).await;
        }
        log::debug!("{} session closed", inner.connection);
    }
}

impl SessionInner {
    #[inline]
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    #[inline]
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Parks a synchronous receive while the session is disabled. False when
    /// the session closed, the wait ran out, or `wait_millis` asks not to wait.
    async fn wait_enabled(&self, id: &SubscriptionId, wait_millis: i64, deadline: Option<Instant>) -> bool {
        loop {
            let enabled = self.enabled_notify.notified();
            if self.is_closed() {
                return false;
            }
            if self.is_enabled() {
                return true;
            }
            if wait_millis < 0 {
                return false;
            }
            self.block(id);
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, enabled).await.is_err() {
                        self.blocked.lock().retain(|b| b != id);
                        return false;
                    }
                }
                None => enabled.await,
            }
        }
    }

    #[inline]
    fn block(&self, id: &SubscriptionId) {
        let mut blocked = self.blocked.lock();
        if !blocked.contains(id) {
            blocked.push(id.clone());
        }
    }

    /// Appends to the outbound FIFO. Refused when closed or full, the message
    /// then stays with its queue.
    fn queue_for_delivery(self: &Arc<Self>, outbound: Outbound) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let mut queue = self.outbound.lock();
            if queue.len() >= self.outbound_max {
                return false;
            }
            queue.push_back(outbound);
        }
        self.schedule_flush();
        true
    }

    fn schedule_flush(self: &Arc<Self>) {
        if !self.is_enabled() || self.is_closed() || self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.clone();
        tokio::spawn(async move {
            let scx = session.scx.clone();
            if let Err(e) = session.clone().flush().spawn(&scx.global_exec).await {
                log::warn!("{} schedule delivery job error, {:?}", session.connection, e.to_string());
                session.scheduled.store(false, Ordering::SeqCst);
            }
        });
    }

    /// Worker job: drains the FIFO batch by batch until it is empty.
    async fn flush(self: Arc<Self>) {
        loop {
            if self.is_closed() || !self.is_enabled() {
                self.scheduled.store(false, Ordering::SeqCst);
                return;
            }
            let batch = self.outbound.lock().drain(..).collect::<Vec<_>>();
            if batch.is_empty() {
                self.scheduled.store(false, Ordering::SeqCst);
                if self.outbound.lock().is_empty() || self.scheduled.swap(true, Ordering::SeqCst) {
                    return;
                }
                continue;
            }

            let mut deliveries = Vec::with_capacity(batch.len());
            for Outbound { subscription, dispatch } in batch {
                match self.scx.store.get(&dispatch.handle).await {
                    Ok(message) => {
                        self.unacked.lock().insert(
                            dispatch.token,
                            Unacked { subscription: subscription.clone(), queue: dispatch.queue.clone() },
                        );
                        deliveries.push(Delivery { token: dispatch.token, subscription: subscription.id().clone(), message });
                    }
                    Err(e) => {
                        log::warn!("{} load {:?} error, {}", self.connection, dispatch.handle, e);
                        subscription.release_credit();
                        if let Err(e) = dispatch.queue.acknowledge(dispatch.token, AckKind::Nack, None).await {
                            log::warn!("{} nack {} error, {}", self.connection, dispatch.token, e);
                        }
                    }
                }
            }
            if deliveries.is_empty() {
                continue;
            }

            let count = deliveries.len();
            if let Err(e) = self.transport.push_deliveries(&self.connection, deliveries).await {
                log::warn!("{} push deliveries error, {}", self.connection, e);
                if self.faults.send((self.connection.clone(), BrokerError::Connection(e.to_string()))).is_err() {
                    log::warn!("{} fault channel closed", self.connection);
                }
                return;
            }
            self.scx.stats.messages_delivered.incs(count as isize);

            let starved = self
                .subscriptions
                .read()
                .values()
                .filter(|s| s.starved.swap(false, Ordering::SeqCst))
                .cloned()
                .collect::<Vec<_>>();
            for sub in starved {
                sub.schedule_pump();
            }
        }
    }

    /// Loads the body of a synchronously received message.
    async fn materialize(&self, sub: &Arc<Subscription>, dispatch: Dispatch) -> Result<Delivery> {
        match self.scx.store.get(&dispatch.handle).await {
            Ok(message) => {
                self.unacked
                    .lock()
                    .insert(dispatch.token, Unacked { subscription: sub.clone(), queue: dispatch.queue.clone() });
                self.scx.stats.messages_delivered.inc();
                Ok(Delivery { token: dispatch.token, subscription: sub.id().clone(), message })
            }
            Err(e) => {
                if let Err(e) = dispatch.queue.acknowledge(dispatch.token, AckKind::Nack, None).await {
                    log::warn!("{} nack {} error, {}", self.connection, dispatch.token, e);
                }
                Err(e)
            }
        }
    }

    async fn detach(&self, sub: &Arc<Subscription>) {
        sub.detached.store(true, Ordering::SeqCst);
        self.blocked.lock().retain(|id| id != sub.id());
        if sub.queue.remove_subscriber(sub.receiver) {
            log::debug!("{} subscription {} detach deferred, messages in flight", self.connection, sub.spec.id);
        }
        match &sub.destination {
            Destination::Queue(qd) => qd.unbind(sub.receiver),
            Destination::Topic(td) => match (sub.spec.durable.as_ref(), self.client_id.as_ref()) {
                (Some(name), Some(client_id)) => td.detach_durable(client_id, name),
                _ => {
                    td.unsubscribe_temporary(sub.receiver).await;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::Destination;
    use crate::queue::tests::context;
    use crate::types::{DestinationConfig, Message};

    #[derive(Default)]
    struct Collect {
        batches: Mutex<Vec<Vec<Delivery>>>,
    }

    #[async_trait]
    impl ClientTransport for Collect {
        async fn push_deliveries(&self, _connection: &ConnectionId, batch: Vec<Delivery>) -> Result<()> {
            self.batches.lock().push(batch);
            Ok(())
        }

        async fn pong(&self, _connection: &ConnectionId, _timestamp: TimestampMillis) -> Result<()> {
            Ok(())
        }
    }

    impl Collect {
        fn tokens(&self) -> Vec<AckToken> {
            self.batches.lock().iter().flatten().map(|d| d.token).collect()
        }
    }

    async fn setup() -> (ServerContext, ConsumerSession, Arc<Collect>, Destination) {
        let scx = context().await;
        let transport = Arc::new(Collect::default());
        let (faults, _rx) = mpsc::unbounded_channel();
        let session = ConsumerSession::new(scx.clone(), "c1".into(), Some("app".into()), transport.clone(), faults);
        let dest = Destination::new(scx.clone(), "q".into(), DestinationConfig::queue());
        (scx, session, transport, dest)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn listener_receives_pushes() {
        let (_scx, session, transport, dest) = setup().await;
        session.subscribe(SubscriptionSpec::new("s1", "q"), dest.clone()).await.unwrap();
        settle().await;
        dest.add_message(Message::new("q", "a"), None).await.unwrap();
        dest.add_message(Message::new("q", "b"), None).await.unwrap();
        settle().await;
        let tokens = transport.tokens();
        assert_eq!(tokens.len(), 2);
        for token in tokens {
            session.acknowledge(AckRequest::ack(token), None).await.unwrap();
        }
        assert_eq!(session.unacked_len(), 0);
        assert!(session.acknowledge(AckRequest::ack(0), None).await.is_err());
    }

    #[tokio::test]
    async fn sync_receive_waits_and_times_out() {
        let (_scx, session, _transport, dest) = setup().await;
        session.subscribe(SubscriptionSpec::new("s1", "q").mode(ReceiveMode::Sync), dest.clone()).await.unwrap();
        assert!(session.receive(&"s1".into(), -1).await.unwrap().is_none());
        assert!(session.receive(&"s1".into(), 30).await.unwrap().is_none());
        if let Destination::Queue(qd) = &dest {
            assert_eq!(qd.queue().waiting_len(), 0);
        }

        let d = dest.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            d.add_message(Message::new("q", "late"), None).await.unwrap();
        });
        let delivery = session.receive(&"s1".into(), 0).await.unwrap().unwrap();
        assert_eq!(delivery.message.body, bytes::Bytes::from("late"));
    }

    #[tokio::test]
    async fn disabled_session_parks_and_resumes() {
        let (_scx, session, transport, dest) = setup().await;
        session.subscribe(SubscriptionSpec::new("s1", "q"), dest.clone()).await.unwrap();
        settle().await;
        session.set_enabled(false);
        assert_eq!(session.blocked_len(), 1);
        dest.add_message(Message::new("q", "x"), None).await.unwrap();
        settle().await;
        assert!(transport.tokens().is_empty());
        session.set_enabled(true);
        settle().await;
        assert_eq!(transport.tokens().len(), 1);
        assert_eq!(session.blocked_len(), 0);
    }

    #[tokio::test]
    async fn disabled_session_parks_sync_receive() {
        let (_scx, session, _transport, dest) = setup().await;
        session.subscribe(SubscriptionSpec::new("s1", "q").mode(ReceiveMode::Sync), dest.clone()).await.unwrap();
        dest.add_message(Message::new("q", "x"), None).await.unwrap();
        session.set_enabled(false);
        assert!(session.receive(&"s1".into(), -1).await.unwrap().is_none());
        assert!(session.receive(&"s1".into(), 50).await.unwrap().is_none());
        assert_eq!(session.blocked_len(), 0);
        if let Destination::Queue(qd) = &dest {
            assert_eq!(qd.queue().pending_len(), 1);
        }

        let s = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            s.set_enabled(true);
        });
        let delivery = session.receive(&"s1".into(), 0).await.unwrap().unwrap();
        assert_eq!(delivery.message.body, bytes::Bytes::from("x"));
    }

    #[tokio::test]
    async fn waiting_receive_holds_off_while_disabled() {
        let (_scx, session, _transport, dest) = setup().await;
        session.subscribe(SubscriptionSpec::new("s1", "q").mode(ReceiveMode::Sync), dest.clone()).await.unwrap();
        let s = session.clone();
        let receiving = tokio::spawn(async move { s.receive(&"s1".into(), 2000).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        session.set_enabled(false);
        dest.add_message(Message::new("q", "x"), None).await.unwrap();
        settle().await;
        assert!(!receiving.is_finished());
        if let Destination::Queue(qd) = &dest {
            assert_eq!(qd.queue().pending_len(), 1);
            assert_eq!(qd.queue().inflight_len(), 0);
        }

        session.set_enabled(true);
        let delivery = receiving.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.message.body, bytes::Bytes::from("x"));
    }

    #[tokio::test]
    async fn dropped_receive_puts_handoff_back() {
        let (_scx, session, _transport, dest) = setup().await;
        session.subscribe(SubscriptionSpec::new("s1", "q").mode(ReceiveMode::Sync), dest.clone()).await.unwrap();
        let id = SubscriptionId::from("s1");
        let mut receiving = Box::pin(session.receive(&id, 0));
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut receiving).await.is_err());

        //handed to the waiting call, which is then abandoned unpolled
        dest.add_message(Message::new("q", "x"), None).await.unwrap();
        drop(receiving);
        settle().await;
        if let Destination::Queue(qd) = &dest {
            assert_eq!(qd.queue().pending_len(), 1);
            assert_eq!(qd.queue().inflight_len(), 0);
            assert_eq!(qd.queue().waiting_len(), 0);
        }
        let delivery = session.receive(&id, -1).await.unwrap().unwrap();
        assert_eq!(delivery.message.body, bytes::Bytes::from("x"));
        assert!(!delivery.message.header.redelivered);
        assert_eq!(session.unacked_len(), 1);
    }

    #[tokio::test]
    async fn concurrent_receive_is_refused() {
        let (_scx, session, _transport, dest) = setup().await;
        session.subscribe(SubscriptionSpec::new("s1", "q").mode(ReceiveMode::Sync), dest.clone()).await.unwrap();
        let id = SubscriptionId::from("s1");
        let mut receiving = Box::pin(session.receive(&id, 0));
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut receiving).await.is_err());
        assert!(matches!(session.receive(&id, -1).await, Err(BrokerError::InvalidSubscription(_))));

        dest.add_message(Message::new("q", "x"), None).await.unwrap();
        let delivery = receiving.await.unwrap().unwrap();
        assert_eq!(delivery.message.body, bytes::Bytes::from("x"));
        //released once the first call returned
        assert!(session.receive(&id, -1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_nacks_everything() {
        let (_scx, session, transport, dest) = setup().await;
        session.subscribe(SubscriptionSpec::new("s1", "q"), dest.clone()).await.unwrap();
        settle().await;
        dest.add_message(Message::new("q", "x"), None).await.unwrap();
        settle().await;
        assert_eq!(transport.tokens().len(), 1);
        session.close().await;
        assert!(session.is_closed());
        if let Destination::Queue(qd) = &dest {
            assert_eq!(qd.queue().pending_len(), 1);
            assert_eq!(qd.queue().inflight_len(), 0);
            assert!(qd.queue().browse()[0].redelivered);
        }
        assert!(session.subscribe(SubscriptionSpec::new("s2", "q"), dest).await.is_err());
    }

    #[tokio::test]
    async fn prefetch_limits_unacked() {
        let scx = {
            let mut inner = crate::conf::Inner::default();
            inner.session.prefetch = 1;
            ServerContext::new()
                .settings(crate::conf::Settings::from(inner))
                .memory_probe(Arc::new(crate::store::FixedMemory::new(0)))
                .build()
                .await
        };
        let transport = Arc::new(Collect::default());
        let (faults, _rx) = mpsc::unbounded_channel();
        let session = ConsumerSession::new(scx.clone(), "c1".into(), None, transport.clone(), faults);
        let dest = Destination::new(scx.clone(), "q".into(), DestinationConfig::queue());
        for body in ["1", "2", "3"] {
            dest.add_message(Message::new("q", body), None).await.unwrap();
        }
        session.subscribe(SubscriptionSpec::new("s1", "q"), dest.clone()).await.unwrap();
        settle().await;
        assert_eq!(transport.tokens().len(), 1);
        let token = transport.tokens()[0];
        session.acknowledge(AckRequest::ack(token), None).await.unwrap();
        settle().await;
        assert_eq!(transport.tokens().len(), 2);
    }
}
