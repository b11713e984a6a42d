//! Ordered, filterable message queue of one destination or one subscription.
//!
//! A handle lives in exactly one place at a time: staged (admitted, waiting for
//! its transaction or its scheduled delivery time), pending (ordered by
//! priority desc then sequence asc) or in flight under an acknowledgment token.
//!
//! Lock order: `receivers` before `messages`. Handle state locks may be taken
//! while holding either.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_box::dequemap::DequeBTreeMap as DequeMap;

use crate::context::ServerContext;
use crate::error::{BrokerError, Result};
use crate::store::MessageHandle;
use crate::txn::Transaction;
use crate::types::{AckKind, AckToken, HashMap, HashSet, Header, HeaderRef, Priority, QueueName};
use crate::utils::timestamp_millis;

pub type ReceiverId = u64;

/// A consumer endpoint as seen by a queue.
pub trait Receiver: Sync + Send {
    fn id(&self) -> ReceiverId;

    /// Selector and no-local test.
    fn accepts(&self, header: &Header) -> bool;

    /// True when `accepts` is always true, so the head of the queue can be taken directly.
    fn is_simple(&self) -> bool;

    /// Hands over a message that is already in flight under `dispatch.token`.
    /// Returning false leaves the message in the queue.
    ///
    /// Called with the queue locks held, must not call back into the queue.
    fn deliver(&self, dispatch: Dispatch) -> bool;
}

pub type ReceiverRef = Arc<dyn Receiver>;

/// A message moved in flight for one receiver.
#[derive(Clone)]
pub struct Dispatch {
    pub token: AckToken,
    pub handle: MessageHandle,
    pub queue: Queue,
}

type PendingKey = (Reverse<Priority>, u64);

struct Inflight {
    handle: MessageHandle,
    receiver: ReceiverId,
}

#[derive(Default)]
struct Receivers {
    waiting: DequeMap<ReceiverId, ReceiverRef>,
    pending_removal: HashSet<ReceiverId>,
}

struct Messages {
    pending: BTreeMap<PendingKey, MessageHandle>,
    inflight: HashMap<AckToken, Inflight>,
    inflight_handles: HashSet<u64>,
    staged: usize,
    next_seq: u64,
    closed: bool,
}

impl Messages {
    #[inline]
    fn resident(&self) -> usize {
        self.pending.len() + self.inflight.len() + self.staged
    }

    #[inline]
    fn add_inflight(&mut self, token: AckToken, handle: MessageHandle, receiver: ReceiverId) -> Result<()> {
        if !self.inflight_handles.insert(handle.id()) {
            return Err(BrokerError::DuplicateInflight(handle.id()));
        }
        self.inflight.insert(token, Inflight { handle, receiver });
        Ok(())
    }

    #[inline]
    fn remove_inflight(&mut self, token: AckToken) -> Option<Inflight> {
        let inflight = self.inflight.remove(&token)?;
        self.inflight_handles.remove(&inflight.handle.id());
        Some(inflight)
    }

    #[inline]
    fn has_inflight_of(&self, receiver: ReceiverId) -> bool {
        self.inflight.values().any(|i| i.receiver == receiver)
    }
}

#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    scx: ServerContext,
    name: QueueName,
    max_depth: usize,
    durable: bool,
    receivers: Mutex<Receivers>,
    messages: Mutex<Messages>,
}

impl Queue {
    /// `max_depth` 0 is unbounded. A `durable` queue saves persistent messages on admission.
    pub fn new(scx: ServerContext, name: QueueName, max_depth: usize, durable: bool) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                scx,
                name,
                max_depth,
                durable,
                receivers: Mutex::new(Receivers::default()),
                messages: Mutex::new(Messages {
                    pending: BTreeMap::new(),
                    inflight: HashMap::default(),
                    inflight_handles: HashSet::default(),
                    staged: 0,
                    next_seq: 1,
                    closed: false,
                }),
            }),
        }
    }

    #[inline]
    pub fn name(&self) -> &QueueName {
        &self.inner.name
    }

    #[inline]
    pub fn is_durable(&self) -> bool {
        self.inner.durable
    }

    #[inline]
    pub fn max_depth(&self) -> usize {
        self.inner.max_depth
    }

    /// Fails with `Capacity` if one more message would exceed the maximum depth.
    pub fn check_capacity(&self) -> Result<()> {
        let msgs = self.inner.messages.lock();
        self.check_capacity_locked(&msgs)
    }

    #[inline]
    fn check_capacity_locked(&self, msgs: &Messages) -> Result<()> {
        if msgs.closed {
            return Err(BrokerError::InvalidDestination(self.inner.name.clone()));
        }
        if self.inner.max_depth > 0 && msgs.resident() >= self.inner.max_depth {
            return Err(BrokerError::Capacity { queue: self.inner.name.clone(), max_depth: self.inner.max_depth });
        }
        Ok(())
    }

    /// Admits `handle`. Inside `tx` the message becomes visible on commit and
    /// is removed from the store on rollback.
    pub async fn add_message(&self, handle: MessageHandle, tx: Option<&Transaction>) -> Result<()> {
        if handle.is_removed() {
            return Err(BrokerError::HandleRemoved(handle.id()));
        }
        {
            let mut msgs = self.inner.messages.lock();
            self.check_capacity_locked(&msgs)?;
            msgs.staged += 1;
        }
        self.inner.scx.stats.messages_added.inc();

        match tx {
            Some(tx) => {
                let (q, h) = (self.clone(), handle.clone());
                tx.on_commit(async move { q.commit_add(h).await });
                let q = self.clone();
                tx.on_rollback(async move {
                    q.unstage();
                    if let Err(e) = q.inner.scx.store.remove(&handle).await {
                        log::warn!("{} rollback add, remove {:?} error, {:?}", q.inner.name, handle, e);
                    }
                });
            }
            None => self.commit_add(handle).await,
        }
        Ok(())
    }

    /// Re-admits handles rebuilt from persistence at startup, bypassing the depth limit.
    pub async fn restore(&self, handles: Vec<MessageHandle>) {
        for handle in handles {
            self.inner.messages.lock().staged += 1;
            self.commit_add(handle).await;
        }
    }

    async fn commit_add(&self, handle: MessageHandle) {
        let delivery_time = handle.delivery_time();
        if delivery_time > timestamp_millis() {
            let q = self.clone();
            self.inner.scx.timer.schedule_at(delivery_time, async move { q.enqueue(handle).await });
        } else {
            self.enqueue(handle).await;
        }
    }

    #[inline]
    fn unstage(&self) {
        let mut msgs = self.inner.messages.lock();
        msgs.staged = msgs.staged.saturating_sub(1);
    }

    /// Moves a staged handle to a waiting receiver or into the pending set.
    async fn enqueue(&self, handle: MessageHandle) {
        if let Some(dropped) = self.enqueue_locked(&handle) {
            self.discard(&handle, dropped).await;
        }
    }

    fn enqueue_locked(&self, handle: &MessageHandle) -> Option<Discard> {
        let now = timestamp_millis();
        let mut rcv = self.inner.receivers.lock();
        let mut msgs = self.inner.messages.lock();
        msgs.staged = msgs.staged.saturating_sub(1);

        //removed while staged, e.g. purged by its transaction's rollback
        if handle.is_removed() {
            log::debug!("{} {:?} removed before it was enqueued", self.inner.name, handle);
            return None;
        }
        if handle.is_expired(now) {
            return Some(Discard::Expired);
        }
        if msgs.closed {
            return Some(Discard::Closed);
        }

        let header = handle.header();
        let candidates = rcv
            .waiting
            .iter()
            .filter_map(|(id, r)| if r.is_simple() || r.accepts(&header) { Some(*id) } else { None })
            .collect::<Vec<_>>();
        for id in candidates {
            //waiting registrations are one-shot
            let receiver = match rcv.waiting.remove(&id) {
                Some(r) => r,
                None => continue,
            };
            let token = self.inner.scx.next_ack_token();
            if let Err(e) = msgs.add_inflight(token, handle.clone(), id) {
                log::error!("{} {:?}, {}", self.inner.name, handle, e);
                return None;
            }
            if receiver.deliver(Dispatch { token, handle: handle.clone(), queue: self.clone() }) {
                self.inner.scx.stats.inflights.inc();
                return None;
            }
            msgs.remove_inflight(token);
        }

        let seq = handle.assign_sequence(msgs.next_seq);
        if seq == msgs.next_seq {
            msgs.next_seq += 1;
        }
        msgs.pending.insert((Reverse(handle.priority()), seq), handle.clone());
        self.inner.scx.stats.pending.inc();

        let expiration = handle.expiration();
        if expiration > 0 {
            let (q, h) = (self.clone(), handle.clone());
            self.inner.scx.timer.schedule_at(expiration, async move { q.expire(h).await });
        }
        None
    }

    async fn discard(&self, handle: &MessageHandle, reason: Discard) {
        match reason {
            Discard::Expired => self.inner.scx.stats.messages_expired.inc(),
            Discard::Closed => self.inner.scx.stats.messages_dropped.inc(),
        }
        log::debug!("{} discard {:?}, {:?}", self.inner.name, handle, reason);
        if let Err(e) = self.inner.scx.store.remove(handle).await {
            log::warn!("{} discard, remove {:?} error, {:?}", self.inner.name, handle, e);
        }
    }

    /// Expiry timer callback, a no-op unless the handle is still pending.
    async fn expire(&self, handle: MessageHandle) {
        let expired = {
            let mut msgs = self.inner.messages.lock();
            let key = (Reverse(handle.priority()), handle.sequence());
            if msgs.pending.get(&key) == Some(&handle) {
                msgs.pending.remove(&key);
                true
            } else {
                false
            }
        };
        if expired {
            self.inner.scx.stats.pending.dec();
            self.discard(&handle, Discard::Expired).await;
        }
    }

    /// Takes the first pending message `receiver` accepts. On a miss the
    /// receiver is registered as waiting when `wait` is set.
    pub async fn receive(&self, receiver: &ReceiverRef, wait: bool) -> Result<Option<Dispatch>> {
        let now = timestamp_millis();
        let mut expired = Vec::new();
        let dispatch = {
            let mut rcv = self.inner.receivers.lock();
            let mut msgs = self.inner.messages.lock();
            if msgs.closed {
                return Ok(None);
            }

            let mut found = None;
            let mut expired_keys = Vec::new();
            if receiver.is_simple() {
                for (key, h) in msgs.pending.iter() {
                    if h.is_expired(now) {
                        expired_keys.push(*key);
                    } else {
                        found = Some(*key);
                        break;
                    }
                }
            } else {
                for (key, h) in msgs.pending.iter() {
                    if h.is_expired(now) {
                        expired_keys.push(*key);
                    } else if receiver.accepts(&h.header()) {
                        found = Some(*key);
                        break;
                    }
                }
            }
            for key in expired_keys {
                if let Some(h) = msgs.pending.remove(&key) {
                    expired.push(h);
                }
            }

            match found.and_then(|key| msgs.pending.remove(&key)) {
                Some(handle) => {
                    let token = self.inner.scx.next_ack_token();
                    msgs.add_inflight(token, handle.clone(), receiver.id())?;
                    self.inner.scx.stats.pending.dec();
                    self.inner.scx.stats.inflights.inc();
                    Some(Dispatch { token, handle, queue: self.clone() })
                }
                None => {
                    if wait {
                        rcv.waiting.insert(receiver.id(), receiver.clone());
                    }
                    None
                }
            }
        };

        if !expired.is_empty() {
            self.inner.scx.stats.pending.decs(expired.len() as isize);
        }
        for handle in expired {
            self.discard(&handle, Discard::Expired).await;
        }
        Ok(dispatch)
    }

    /// Resolves the in-flight entry `token`. An ack removes the message, on
    /// commit when inside `tx`. A nack, or the rollback of `tx`, restores it
    /// for redelivery.
    pub async fn acknowledge(&self, token: AckToken, kind: AckKind, tx: Option<&Transaction>) -> Result<()> {
        let handle = {
            let mut rcv = self.inner.receivers.lock();
            let mut msgs = self.inner.messages.lock();
            let Inflight { handle, receiver } = msgs.remove_inflight(token).ok_or_else(|| {
                BrokerError::InvalidSubscription(format!("{} unknown ack token {}", self.inner.name, token).into())
            })?;
            //the outcome may still be pending, keep the slot counted
            msgs.staged += 1;
            if rcv.pending_removal.contains(&receiver) && !msgs.has_inflight_of(receiver) {
                rcv.pending_removal.remove(&receiver);
                log::debug!("{} receiver {} detached", self.inner.name, receiver);
            }
            handle
        };
        self.inner.scx.stats.inflights.dec();

        match (kind, tx) {
            (AckKind::Ack, None) => {
                self.unstage();
                self.inner.scx.store.remove(&handle).await?;
                self.inner.scx.stats.messages_acked.inc();
            }
            (AckKind::Ack, Some(tx)) => {
                let (q, h) = (self.clone(), handle.clone());
                tx.on_commit(async move {
                    q.unstage();
                    if let Err(e) = q.inner.scx.store.remove(&h).await {
                        log::warn!("{} commit ack, remove {:?} error, {:?}", q.inner.name, h, e);
                    }
                    q.inner.scx.stats.messages_acked.inc();
                });
                let q = self.clone();
                tx.on_rollback(async move { q.restore_message(handle).await });
            }
            (AckKind::Nack, _) => self.restore_message(handle).await,
        }
        Ok(())
    }

    /// Offers a message again: redelivered, delivery count + 1, honouring the
    /// redelivery delay, then handled like a fresh add.
    async fn restore_message(&self, handle: MessageHandle) {
        let header = match handle.mark_redelivered() {
            Ok(header) => header,
            Err(e) => {
                self.unstage();
                log::warn!("{} restore {:?} error, {}", self.inner.name, handle, e);
                return;
            }
        };
        self.inner.scx.stats.messages_redelivered.inc();
        if header.redelivery_delay > 0 {
            let q = self.clone();
            self.inner
                .scx
                .timer
                .schedule(Duration::from_millis(header.redelivery_delay as u64), async move { q.enqueue(handle).await });
        } else {
            self.commit_add(handle).await;
        }
    }

    /// Puts back a message whose delivery could not be handed to the consumer,
    /// without a redelivery mark.
    pub async fn requeue(&self, token: AckToken) -> bool {
        let handle = {
            let mut msgs = self.inner.messages.lock();
            match msgs.remove_inflight(token) {
                Some(Inflight { handle, .. }) => {
                    msgs.staged += 1;
                    handle
                }
                None => return false,
            }
        };
        self.inner.scx.stats.inflights.dec();
        self.enqueue(handle).await;
        true
    }

    /// Releases a waiting registration. Returns false if the receiver was not waiting.
    #[inline]
    pub fn cancel_wait(&self, receiver: ReceiverId) -> bool {
        self.inner.receivers.lock().waiting.remove(&receiver).is_some()
    }

    /// Detaches `receiver`. Returns true when teardown is deferred because it
    /// still has messages in flight.
    pub fn remove_subscriber(&self, receiver: ReceiverId) -> bool {
        let mut rcv = self.inner.receivers.lock();
        let msgs = self.inner.messages.lock();
        rcv.waiting.remove(&receiver);
        let deferred = msgs.has_inflight_of(receiver);
        if deferred {
            rcv.pending_removal.insert(receiver);
        }
        deferred
    }

    /// Nacks every in-flight message of `receiver`. Returns how many.
    pub async fn recover(&self, receiver: ReceiverId) -> usize {
        let tokens = {
            let msgs = self.inner.messages.lock();
            msgs.inflight.iter().filter(|(_, i)| i.receiver == receiver).map(|(t, _)| *t).collect::<Vec<_>>()
        };
        let mut recovered = 0;
        for token in tokens {
            if self.acknowledge(token, AckKind::Nack, None).await.is_ok() {
                recovered += 1;
            }
        }
        recovered
    }

    /// Removes every pending message and closes the queue: later adds fail and
    /// late nacks drop instead of restoring. Returns the number purged.
    pub async fn purge(&self) -> usize {
        let pending = {
            let mut rcv = self.inner.receivers.lock();
            let mut msgs = self.inner.messages.lock();
            msgs.closed = true;
            while rcv.waiting.pop_front().is_some() {}
            std::mem::take(&mut msgs.pending)
        };
        let purged = pending.len();
        self.inner.scx.stats.pending.decs(purged as isize);
        for handle in pending.into_values() {
            if let Err(e) = self.inner.scx.store.remove(&handle).await {
                log::warn!("{} purge, remove {:?} error, {:?}", self.inner.name, handle, e);
            }
        }
        purged
    }

    /// Pending headers in delivery order.
    pub fn browse(&self) -> Vec<HeaderRef> {
        self.inner.messages.lock().pending.values().map(|h| h.header()).collect()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.messages.lock().closed
    }

    /// Pending + in flight + staged.
    #[inline]
    pub fn depth(&self) -> usize {
        self.inner.messages.lock().resident()
    }

    #[inline]
    pub fn pending_len(&self) -> usize {
        self.inner.messages.lock().pending.len()
    }

    #[inline]
    pub fn inflight_len(&self) -> usize {
        self.inner.messages.lock().inflight.len()
    }

    #[inline]
    pub fn waiting_len(&self) -> usize {
        self.inner.receivers.lock().waiting.len()
    }

    #[inline]
    pub fn pending_removal_len(&self) -> usize {
        self.inner.receivers.lock().pending_removal.len()
    }
}

#[derive(Debug, Clone, Copy)]
enum Discard {
    Expired,
    Closed,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::{FixedMemory, StorageState};
    use crate::types::{Message, TxId};
    use std::sync::atomic::{AtomicBool, Ordering};

    pub(crate) async fn context() -> ServerContext {
        let scx = ServerContext::new().memory_probe(Arc::new(FixedMemory::new(0))).build().await;
        scx.timer.start();
        scx
    }

    pub(crate) struct Probe {
        id: ReceiverId,
        refuse: AtomicBool,
        pub(crate) delivered: Mutex<Vec<Dispatch>>,
        filter: Option<Box<dyn Fn(&Header) -> bool + Sync + Send>>,
    }

    impl Probe {
        pub(crate) fn new(scx: &ServerContext) -> Arc<Self> {
            Arc::new(Self {
                id: scx.next_receiver_id(),
                refuse: AtomicBool::new(false),
                delivered: Mutex::new(Vec::new()),
                filter: None,
            })
        }

        fn with_filter(scx: &ServerContext, f: impl Fn(&Header) -> bool + Sync + Send + 'static) -> Arc<Self> {
            Arc::new(Self {
                id: scx.next_receiver_id(),
                refuse: AtomicBool::new(false),
                delivered: Mutex::new(Vec::new()),
                filter: Some(Box::new(f)),
            })
        }
    }

    impl Receiver for Probe {
        fn id(&self) -> ReceiverId {
            self.id
        }
        fn accepts(&self, header: &Header) -> bool {
            self.filter.as_ref().map(|f| f(header)).unwrap_or(true)
        }
        fn is_simple(&self) -> bool {
            self.filter.is_none()
        }
        fn deliver(&self, dispatch: Dispatch) -> bool {
            if self.refuse.load(Ordering::SeqCst) {
                return false;
            }
            self.delivered.lock().push(dispatch);
            true
        }
    }

    async fn add(scx: &ServerContext, q: &Queue, msg: Message) -> MessageHandle {
        let h = scx.store.add(msg, q.name(), false, None).await.unwrap();
        q.add_message(h.clone(), None).await.unwrap();
        h
    }

    async fn drain(q: &Queue, r: &ReceiverRef) -> Vec<Dispatch> {
        let mut out = Vec::new();
        while let Some(d) = q.receive(r, false).await.unwrap() {
            out.push(d);
        }
        out
    }

    #[tokio::test]
    async fn priority_major_sequence_minor() {
        let scx = context().await;
        let q = Queue::new(scx.clone(), "q".into(), 0, false);
        let a = add(&scx, &q, Message::new("q", "a").priority(5)).await;
        let b = add(&scx, &q, Message::new("q", "b").priority(9)).await;
        let c = add(&scx, &q, Message::new("q", "c").priority(5)).await;
        let r: ReceiverRef = Probe::new(&scx);
        let got = drain(&q, &r).await.into_iter().map(|d| d.handle).collect::<Vec<_>>();
        assert_eq!(got, vec![b, a, c]);
    }

    #[tokio::test]
    async fn handoff_to_waiting_receiver() {
        let scx = context().await;
        let q = Queue::new(scx.clone(), "q".into(), 0, false);
        let probe = Probe::new(&scx);
        let r: ReceiverRef = probe.clone();
        assert!(q.receive(&r, true).await.unwrap().is_none());
        assert_eq!(q.waiting_len(), 1);
        let h = add(&scx, &q, Message::new("q", "x")).await;
        assert_eq!(probe.delivered.lock()[0].handle, h);
        assert_eq!(q.waiting_len(), 0);
        assert_eq!(q.inflight_len(), 1);
        assert_eq!(q.pending_len(), 0);
    }

    #[tokio::test]
    async fn refused_delivery_stays_pending() {
        let scx = context().await;
        let q = Queue::new(scx.clone(), "q".into(), 0, false);
        let probe = Probe::new(&scx);
        probe.refuse.store(true, Ordering::SeqCst);
        let r: ReceiverRef = probe.clone();
        q.receive(&r, true).await.unwrap();
        add(&scx, &q, Message::new("q", "x")).await;
        assert_eq!(q.pending_len(), 1);
        assert_eq!(q.inflight_len(), 0);
    }

    #[tokio::test]
    async fn selective_receiver_skips_rejected() {
        let scx = context().await;
        let q = Queue::new(scx.clone(), "q".into(), 0, false);
        add(&scx, &q, Message::new("q", "low").priority(1)).await;
        let high = add(&scx, &q, Message::new("q", "high").priority(8)).await;
        let r: ReceiverRef = Probe::with_filter(&scx, |h| h.priority < 5);
        let d = q.receive(&r, false).await.unwrap().unwrap();
        assert_ne!(d.handle, high);
        assert!(q.receive(&r, false).await.unwrap().is_none());
        assert_eq!(q.pending_len(), 1);
    }

    #[tokio::test]
    async fn expired_on_add_is_never_delivered() {
        let scx = context().await;
        let q = Queue::new(scx.clone(), "q".into(), 0, false);
        let h = add(&scx, &q, Message::new("q", "old").expiration(1)).await;
        let r: ReceiverRef = Probe::new(&scx);
        assert!(q.receive(&r, false).await.unwrap().is_none());
        assert!(h.is_removed());
    }

    #[tokio::test]
    async fn expiry_timer_removes_pending() {
        let scx = context().await;
        let q = Queue::new(scx.clone(), "q".into(), 0, false);
        let h = add(&scx, &q, Message::new("q", "ttl").time_to_live(30)).await;
        assert_eq!(q.pending_len(), 1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(q.pending_len(), 0);
        assert!(h.is_removed());
    }

    #[tokio::test]
    async fn scheduled_delivery_waits() {
        let scx = context().await;
        let q = Queue::new(scx.clone(), "q".into(), 0, false);
        add(&scx, &q, Message::new("q", "later").delivery_time(timestamp_millis() + 80)).await;
        let r: ReceiverRef = Probe::new(&scx);
        assert!(q.receive(&r, false).await.unwrap().is_none());
        assert_eq!(q.depth(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(q.receive(&r, false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn nack_marks_redelivered() {
        let scx = context().await;
        let q = Queue::new(scx.clone(), "q".into(), 0, false);
        add(&scx, &q, Message::new("q", "x")).await;
        let r: ReceiverRef = Probe::new(&scx);
        let d = q.receive(&r, false).await.unwrap().unwrap();
        q.acknowledge(d.token, AckKind::Nack, None).await.unwrap();
        let d = q.receive(&r, false).await.unwrap().unwrap();
        let header = d.handle.header();
        assert!(header.redelivered);
        assert_eq!(header.delivery_count, 1);
        //unknown and already resolved tokens are refused
        q.acknowledge(d.token, AckKind::Ack, None).await.unwrap();
        assert!(matches!(
            q.acknowledge(d.token, AckKind::Ack, None).await,
            Err(BrokerError::InvalidSubscription(_))
        ));
        assert!(d.handle.is_removed());
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let scx = context().await;
        let q = Queue::new(scx.clone(), "q".into(), 2, false);
        add(&scx, &q, Message::new("q", "1")).await;
        add(&scx, &q, Message::new("q", "2")).await;
        assert!(matches!(q.check_capacity(), Err(BrokerError::Capacity { .. })));
        let h = scx.store.add(Message::new("q", "3"), q.name(), false, None).await.unwrap();
        assert!(q.add_message(h, None).await.unwrap_err().is_capacity());
        //in flight messages still count
        let r: ReceiverRef = Probe::new(&scx);
        q.receive(&r, false).await.unwrap().unwrap();
        assert!(q.check_capacity().is_err());
    }

    #[tokio::test]
    async fn transactional_add_and_ack() {
        let scx = context().await;
        let q = Queue::new(scx.clone(), "q".into(), 0, true);
        let r: ReceiverRef = Probe::new(&scx);

        let tx = Transaction::new(TxId::from("t1"), "c".into());
        let h = scx.store.add(Message::new("q", "x"), q.name(), true, Some(tx.id())).await.unwrap();
        q.add_message(h.clone(), Some(&tx)).await.unwrap();
        assert!(q.receive(&r, false).await.unwrap().is_none());
        assert_eq!(q.depth(), 1);
        tx.commit(scx.persistence.as_ref()).await.unwrap();
        let d = q.receive(&r, false).await.unwrap().unwrap();

        let tx = Transaction::new(TxId::from("t2"), "c".into());
        q.acknowledge(d.token, AckKind::Ack, Some(&tx)).await.unwrap();
        tx.rollback(scx.persistence.as_ref()).await.unwrap();
        let d = q.receive(&r, false).await.unwrap().unwrap();
        assert!(d.handle.header().redelivered);

        let tx = Transaction::new(TxId::from("t3"), "c".into());
        q.acknowledge(d.token, AckKind::Ack, Some(&tx)).await.unwrap();
        assert_eq!(h.storage(), StorageState::Stored);
        tx.commit(scx.persistence.as_ref()).await.unwrap();
        assert!(h.is_removed());
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test]
    async fn rolled_back_add_is_discarded() {
        let scx = context().await;
        let q = Queue::new(scx.clone(), "q".into(), 0, false);
        let tx = Transaction::new(TxId::from("t"), "c".into());
        let h = scx.store.add(Message::new("q", "x"), q.name(), false, None).await.unwrap();
        q.add_message(h.clone(), Some(&tx)).await.unwrap();
        tx.rollback(scx.persistence.as_ref()).await.unwrap();
        assert!(h.is_removed());
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test]
    async fn deferred_removal_and_recover() {
        let scx = context().await;
        let q = Queue::new(scx.clone(), "q".into(), 0, false);
        add(&scx, &q, Message::new("q", "x")).await;
        let probe = Probe::new(&scx);
        let r: ReceiverRef = probe.clone();
        q.receive(&r, false).await.unwrap().unwrap();
        assert!(q.remove_subscriber(probe.id()));
        assert_eq!(q.pending_removal_len(), 1);
        assert_eq!(q.recover(probe.id()).await, 1);
        assert_eq!(q.pending_removal_len(), 0);
        assert_eq!(q.pending_len(), 1);
        assert!(!q.remove_subscriber(probe.id()));
    }

    #[tokio::test]
    async fn purge_closes_queue() {
        let scx = context().await;
        let q = Queue::new(scx.clone(), "q".into(), 0, false);
        let h1 = add(&scx, &q, Message::new("q", "1")).await;
        add(&scx, &q, Message::new("q", "2")).await;
        let r: ReceiverRef = Probe::new(&scx);
        let d = q.receive(&r, false).await.unwrap().unwrap();
        assert_eq!(d.handle, h1);
        assert_eq!(q.purge().await, 1);
        //late nack drops instead of restoring
        q.acknowledge(d.token, AckKind::Nack, None).await.unwrap();
        assert!(h1.is_removed());
        assert_eq!(q.depth(), 0);
        let h = scx.store.add(Message::new("q", "3"), q.name(), false, None).await.unwrap();
        assert!(q.add_message(h, None).await.is_err());
    }

    #[tokio::test]
    async fn removed_handle_is_not_readmitted() {
        let scx = context().await;
        let q = Queue::new(scx.clone(), "q".into(), 0, false);
        let h = scx.store.add(Message::new("q", "x"), q.name(), false, None).await.unwrap();
        scx.store.remove(&h).await.unwrap();
        let err = q.add_message(h.clone(), None).await.unwrap_err();
        assert!(matches!(err, BrokerError::HandleRemoved(id) if id == h.id()));
        assert!(err.is_fatal());
        let tx = Transaction::new(TxId::from("t"), "c".into());
        assert!(q.add_message(h, Some(&tx)).await.unwrap_err().is_fatal());
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test]
    async fn browse_in_delivery_order() {
        let scx = context().await;
        let q = Queue::new(scx.clone(), "q".into(), 0, false);
        add(&scx, &q, Message::new("q", "a").priority(1)).await;
        add(&scx, &q, Message::new("q", "b").priority(7)).await;
        let priorities = q.browse().iter().map(|h| h.priority).collect::<Vec<_>>();
        assert_eq!(priorities, vec![7, 1]);
    }
}
