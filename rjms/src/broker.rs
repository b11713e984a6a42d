//! Routing and transaction coordination over destinations and sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::mpsc;

use crate::context::{ServerContext, TaskExecStats};
use crate::destination::{durable_queue_name, Destination};
use crate::error::{BrokerError, Result};
use crate::session::{ConsumerSession, FaultSender, TransportRef};
use crate::txn::{Transaction, TransactionManager, TxState};
use crate::types::{
    AckRequest, ConnectInfo, ConnectionId, DashMap, Delivery, DestinationConfig, DestinationKind, DestinationName,
    HashMap, HashSet, Message, SubscriptionId, SubscriptionName, SubscriptionSpec, TimestampMillis,
    TransactionOutcome, TransactionRequest, TxId,
};

/// Inbound operations of connected clients.
#[async_trait]
pub trait Broker: Sync + Send {
    async fn open_connection(&self, connection: ConnectionId, info: ConnectInfo, transport: TransportRef)
        -> Result<()>;

    async fn add_message(&self, connection: &ConnectionId, message: Message, tx: Option<&TxId>) -> Result<()>;

    async fn subscribe(&self, connection: &ConnectionId, spec: SubscriptionSpec) -> Result<()>;

    async fn unsubscribe(&self, connection: &ConnectionId, id: &SubscriptionId) -> Result<()>;

    ///Destroys the durable subscription `name` of the connection's client id, with its backlog.
    async fn unsubscribe_durable(&self, connection: &ConnectionId, name: &SubscriptionName) -> Result<()>;

    async fn receive(
        &self,
        connection: &ConnectionId,
        id: &SubscriptionId,
        wait_millis: i64,
    ) -> Result<Option<Delivery>>;

    async fn acknowledge(&self, connection: &ConnectionId, req: AckRequest, tx: Option<&TxId>) -> Result<()>;

    async fn transact(&self, connection: &ConnectionId, req: TransactionRequest) -> Result<TransactionOutcome>;

    async fn create_temporary_destination(
        &self,
        connection: &ConnectionId,
        kind: DestinationKind,
    ) -> Result<DestinationName>;

    async fn delete_temporary_destination(&self, connection: &ConnectionId, name: &DestinationName) -> Result<()>;

    async fn set_enabled(&self, connection: &ConnectionId, enabled: bool) -> Result<()>;

    async fn ping(&self, connection: &ConnectionId, timestamp: TimestampMillis) -> Result<()>;

    async fn connection_closing(&self, connection: &ConnectionId);
}

pub struct BrokerCore {
    scx: ServerContext,
    //copy on write, read on every add
    destinations: RwLock<Arc<HashMap<DestinationName, Destination>>>,
    sessions: DashMap<ConnectionId, ConsumerSession>,
    temporaries: DashMap<DestinationName, ConnectionId>,
    txns: TransactionManager,
    faults: FaultSender,
    fault_rx: Mutex<Option<mpsc::UnboundedReceiver<(ConnectionId, BrokerError)>>>,
    running: AtomicBool,
}

impl BrokerCore {
    pub fn new(scx: ServerContext) -> Arc<Self> {
        let (faults, fault_rx) = mpsc::unbounded_channel();
        let txns = TransactionManager::new(scx.settings.broker.max_transactions);
        Arc::new(Self {
            scx,
            destinations: RwLock::new(Arc::new(HashMap::default())),
            sessions: DashMap::default(),
            temporaries: DashMap::default(),
            txns,
            faults,
            fault_rx: Mutex::new(Some(fault_rx)),
            running: AtomicBool::new(true),
        })
    }

    #[inline]
    pub fn context(&self) -> &ServerContext {
        &self.scx
    }

    /// Starts the timer and store monitor, restores durable subscriptions and
    /// persistent queues, and begins serving connection faults.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.scx.timer.start();
        self.scx.store.start();

        let mut restored = HashSet::default();
        for record in self.scx.state.durables().await? {
            let topic = self.create_destination(record.topic.clone(), DestinationConfig::topic().persistent(true)).await?;
            match topic {
                Destination::Topic(td) => {
                    let count = td.restore_durable(&record).await?;
                    log::info!("restored durable {}/{} of {}, {} messages", record.client_id, record.name, record.topic, count);
                    restored.insert(durable_queue_name(&record.topic, &record.client_id, &record.name));
                }
                Destination::Queue(_) => {
                    log::warn!("durable {}/{} refers to queue {}", record.client_id, record.name, record.topic);
                }
            }
        }

        for name in self.scx.persistence.queues().await? {
            if restored.contains(&name) {
                continue;
            }
            self.create_destination(name, DestinationConfig::queue().persistent(true)).await?;
        }

        let fault_rx = self.fault_rx.lock().take();
        if let Some(mut fault_rx) = fault_rx {
            let broker: Weak<Self> = Arc::downgrade(self);
            tokio::spawn(async move {
                while let Some((connection, e)) = fault_rx.recv().await {
                    let Some(broker) = broker.upgrade() else {
                        break;
                    };
                    log::warn!("{} connection fault, {}", connection, e);
                    broker.connection_closing(&connection).await;
                }
                log::debug!("connection fault loop exited");
            });
        }
        log::info!("broker started, {} destinations", self.destinations.read().len());
        Ok(())
    }

    /// Stops timers and the store monitor; further inbound calls fail with
    /// `ServiceUnavailable`. Open sessions are left to finish.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.scx.timer.stop();
            self.scx.store.stop();
            log::info!("broker shutdown, {} sessions still open", self.sessions.len());
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    #[inline]
    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(BrokerError::ServiceUnavailable)
        }
    }

    /// Returns the destination `name`, creating it from `cfg` if absent. A
    /// newly created persistent queue reloads its stored backlog.
    pub async fn create_destination(&self, name: DestinationName, cfg: DestinationConfig) -> Result<Destination> {
        self.ensure_running()?;
        let dest = {
            let mut destinations = self.destinations.write();
            if let Some(dest) = destinations.get(&name) {
                if dest.kind() != cfg.kind {
                    return Err(BrokerError::InvalidDestination(name));
                }
                return Ok(dest.clone());
            }
            let dest = Destination::new(self.scx.clone(), name.clone(), cfg);
            let mut dests = destinations.as_ref().clone();
            dests.insert(name, dest.clone());
            *destinations = Arc::new(dests);
            dest
        };
        if let (Destination::Queue(qd), true) = (&dest, cfg.persistent) {
            let restored = qd.restore().await?;
            if restored > 0 {
                log::info!("restored {} messages of queue {}", restored, dest.name());
            }
        }
        Ok(dest)
    }

    /// Removes the destination and purges everything queued on it.
    pub async fn remove_destination(&self, name: &DestinationName) -> Result<()> {
        let removed = {
            let mut destinations = self.destinations.write();
            let mut dests = destinations.as_ref().clone();
            let removed = dests.remove(name);
            *destinations = Arc::new(dests);
            removed
        };
        let dest = removed.ok_or_else(|| BrokerError::InvalidDestination(name.clone()))?;
        self.temporaries.remove(name);
        dest.close().await;
        Ok(())
    }

    #[inline]
    pub fn destination(&self, name: &DestinationName) -> Option<Destination> {
        self.destinations.read().get(name).cloned()
    }

    #[inline]
    pub fn destinations(&self) -> Vec<DestinationName> {
        self.destinations.read().keys().cloned().collect()
    }

    #[inline]
    pub fn session(&self, connection: &ConnectionId) -> Result<ConsumerSession> {
        self.sessions
            .get(connection)
            .map(|s| s.value().clone())
            .ok_or_else(|| BrokerError::Connection(format!("unknown connection {connection}")))
    }

    #[inline]
    pub fn sessions_len(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    pub fn transactions_len(&self) -> usize {
        self.txns.len()
    }

    pub async fn stats_json(&self) -> serde_json::Value {
        let exec = TaskExecStats::from_global_exec(&self.scx.global_exec).await;
        json!({
            "destinations.count": self.destinations.read().len(),
            "stats": self.scx.stats.to_json(),
            "task_exec": exec,
            "store": {
                "hard": self.scx.store.hard_len(),
                "soft": self.scx.store.soft_len(),
                "persisted": self.scx.persistence.count().await,
            },
        })
    }

    #[inline]
    fn lookup(&self, name: &DestinationName) -> Result<Destination> {
        self.destination(name).ok_or_else(|| BrokerError::InvalidDestination(name.clone()))
    }

    async fn begin(&self, id: &TxId, connection: &ConnectionId) -> Result<Transaction> {
        let (tx, created) = self.txns.begin(id, connection, self.scx.persistence.as_ref()).await?;
        if created {
            self.scx.stats.transactions.inc();
            log::debug!("{} begin transaction {}", connection, id);
        }
        Ok(tx)
    }

    fn owned(&self, id: &TxId, connection: &ConnectionId) -> Result<Option<Transaction>> {
        match self.txns.get(id) {
            Ok(tx) if tx.connection() != connection => {
                Err(BrokerError::InvalidTransaction(id.clone(), "owned by another connection".into()))
            }
            Ok(tx) => Ok(Some(tx)),
            Err(_) => Ok(None),
        }
    }

    /// Commits or rolls back `tx`, forgetting it once it reached a final state.
    async fn complete(&self, tx: &Transaction, commit: bool) -> Result<TransactionOutcome> {
        let persistence = self.scx.persistence.as_ref();
        let res = if commit {
            tx.commit(persistence).await.map(|_| TransactionOutcome::Committed)
        } else {
            tx.rollback(persistence).await.map(|_| TransactionOutcome::RolledBack)
        };
        if matches!(tx.state(), TxState::Committed | TxState::RolledBack) && self.txns.remove(tx.id()).is_some() {
            self.scx.stats.transactions.dec();
        }
        res
    }

    fn expect_state(tx: &Transaction, state: TxState) -> Result<()> {
        if tx.state() == state {
            Ok(())
        } else {
            Err(BrokerError::InvalidTransaction(tx.id().clone(), format!("is {:?}, expected {:?}", tx.state(), state)))
        }
    }
}

#[async_trait]
impl Broker for BrokerCore {
    async fn open_connection(
        &self,
        connection: ConnectionId,
        info: ConnectInfo,
        transport: TransportRef,
    ) -> Result<()> {
        self.ensure_running()?;
        if self.sessions.contains_key(&connection) {
            return Err(BrokerError::Connection(format!("{connection} is already open")));
        }
        self.scx.state.authenticate(&info).await?;
        if let Some(client_id) = info.client_id.as_ref() {
            self.scx.state.check_client_id(&connection, client_id).await?;
        }

        let session =
            ConsumerSession::new(self.scx.clone(), connection.clone(), info.client_id.clone(), transport, self.faults.clone());
        match self.sessions.entry(connection.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                if let Some(client_id) = info.client_id.as_ref() {
                    self.scx.state.release_client_id(&connection, client_id).await;
                }
                Err(BrokerError::Connection(format!("{connection} is already open")))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(session);
                self.scx.stats.sessions.inc();
                log::info!("{} connection opened, client id {:?}", connection, info.client_id);
                Ok(())
            }
        }
    }

    async fn add_message(&self, connection: &ConnectionId, mut message: Message, tx: Option<&TxId>) -> Result<()> {
        self.ensure_running()?;
        self.session(connection)?;
        let dest = self.lookup(&message.header.destination)?;
        message.header.producer = Some(connection.clone());
        match tx {
            None => dest.add_message(message, None).await,
            Some(id) => {
                let tx = self.begin(id, connection).await?;
                let res = dest.add_message(message, Some(&tx)).await;
                if res.is_err() {
                    tx.set_rollback_only();
                }
                res
            }
        }
    }

    async fn subscribe(&self, connection: &ConnectionId, spec: SubscriptionSpec) -> Result<()> {
        self.ensure_running()?;
        let session = self.session(connection)?;
        let dest = self.lookup(&spec.destination)?;
        session.subscribe(spec, dest).await
    }

    async fn unsubscribe(&self, connection: &ConnectionId, id: &SubscriptionId) -> Result<()> {
        self.session(connection)?.unsubscribe(id).await
    }

    async fn unsubscribe_durable(&self, connection: &ConnectionId, name: &SubscriptionName) -> Result<()> {
        let session = self.session(connection)?;
        let client_id = session
            .client_id()
            .cloned()
            .ok_or_else(|| BrokerError::InvalidSubscription("durable subscription requires a client id".into()))?;
        if session.has_durable(name) {
            return Err(BrokerError::InvalidSubscription(format!("durable {name} is active").into()));
        }
        let destinations = self.destinations.read().clone();
        for dest in destinations.values() {
            if let Destination::Topic(td) = dest {
                if td.durable_queue(&client_id, name).is_some() {
                    return td.unsubscribe_durable(&client_id, name).await;
                }
            }
        }
        Err(BrokerError::InvalidSubscription(format!("no durable subscription {client_id}/{name}").into()))
    }

    async fn receive(
        &self,
        connection: &ConnectionId,
        id: &SubscriptionId,
        wait_millis: i64,
    ) -> Result<Option<Delivery>> {
        self.session(connection)?.receive(id, wait_millis).await
    }

    async fn acknowledge(&self, connection: &ConnectionId, req: AckRequest, tx: Option<&TxId>) -> Result<()> {
        let session = self.session(connection)?;
        match tx {
            None => session.acknowledge(req, None).await,
            Some(id) => {
                let tx = self.begin(id, connection).await?;
                let res = session.acknowledge(req, Some(&tx)).await;
                if res.is_err() {
                    tx.set_rollback_only();
                }
                res
            }
        }
    }

    async fn transact(&self, connection: &ConnectionId, req: TransactionRequest) -> Result<TransactionOutcome> {
        log::debug!("{} transact {:?}", connection, req);
        match req {
            TransactionRequest::Commit(id) => match self.owned(&id, connection)? {
                Some(tx) => {
                    Self::expect_state(&tx, TxState::Active)?;
                    self.complete(&tx, true).await
                }
                //nothing was done under this id
                None => Ok(TransactionOutcome::Committed),
            },
            TransactionRequest::Rollback(id) => match self.owned(&id, connection)? {
                Some(tx) => {
                    Self::expect_state(&tx, TxState::Active)?;
                    self.complete(&tx, false).await
                }
                None => Ok(TransactionOutcome::RolledBack),
            },
            TransactionRequest::Prepare(id) => {
                let tx = self
                    .owned(&id, connection)?
                    .ok_or_else(|| BrokerError::InvalidTransaction(id.clone(), "unknown transaction".into()))?;
                let res = tx.prepare(self.scx.persistence.as_ref()).await;
                if tx.state() == TxState::RolledBack && self.txns.remove(&id).is_some() {
                    self.scx.stats.transactions.dec();
                }
                res.map(|_| TransactionOutcome::Prepared)
            }
            TransactionRequest::CommitPrepared(id) => {
                let tx = self.txns.get(&id)?;
                Self::expect_state(&tx, TxState::Prepared)?;
                self.complete(&tx, true).await
            }
            TransactionRequest::RollbackPrepared(id) => {
                let tx = self.txns.get(&id)?;
                Self::expect_state(&tx, TxState::Prepared)?;
                self.complete(&tx, false).await
            }
            TransactionRequest::Recover => Ok(TransactionOutcome::Recovered(self.txns.prepared())),
        }
    }

    async fn create_temporary_destination(
        &self,
        connection: &ConnectionId,
        kind: DestinationKind,
    ) -> Result<DestinationName> {
        self.ensure_running()?;
        self.session(connection)?;
        let name: DestinationName =
            format!("{}.{}.{}", self.scx.settings.broker.temp_prefix, kind, uuid::Uuid::new_v4().as_simple()).into();
        let cfg = match kind {
            DestinationKind::Queue => DestinationConfig::queue(),
            DestinationKind::Topic => DestinationConfig::topic(),
        };
        self.create_destination(name.clone(), cfg).await?;
        self.temporaries.insert(name.clone(), connection.clone());
        log::debug!("{} created temporary destination {}", connection, name);
        Ok(name)
    }

    async fn delete_temporary_destination(&self, connection: &ConnectionId, name: &DestinationName) -> Result<()> {
        let owned = self.temporaries.get(name).map(|owner| owner.value() == connection).unwrap_or(false);
        if owned {
            self.remove_destination(name).await
        } else {
            Err(BrokerError::InvalidDestination(name.clone()))
        }
    }

    async fn set_enabled(&self, connection: &ConnectionId, enabled: bool) -> Result<()> {
        self.session(connection)?.set_enabled(enabled);
        Ok(())
    }

    async fn ping(&self, connection: &ConnectionId, timestamp: TimestampMillis) -> Result<()> {
        self.session(connection)?.ping(timestamp).await
    }

    async fn connection_closing(&self, connection: &ConnectionId) {
        let session = match self.sessions.remove(connection) {
            Some((_, session)) => session,
            None => return,
        };
        self.scx.stats.sessions.dec();
        session.close().await;

        for tx in self.txns.active_of(connection) {
            if let Err(e) = self.complete(&tx, false).await {
                log::warn!("{} rollback {} error, {}", connection, tx.id(), e);
            }
        }

        let temporaries = self
            .temporaries
            .iter()
            .filter(|e| e.value() == connection)
            .map(|e| e.key().clone())
            .collect::<Vec<_>>();
        for name in temporaries {
            if let Err(e) = self.remove_destination(&name).await {
                log::warn!("{} remove temporary destination {} error, {}", connection, name, e);
            }
        }

        if let Some(client_id) = session.client_id() {
            self.scx.state.release_client_id(connection, client_id).await;
        }
        log::info!("{} connection closed", connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::tests::context;
    use crate::session::ClientTransport;
    use crate::types::{ReceiveMode, TimestampMillis};

    struct Discard;

    #[async_trait]
    impl ClientTransport for Discard {
        async fn push_deliveries(&self, _connection: &ConnectionId, _batch: Vec<Delivery>) -> Result<()> {
            Ok(())
        }

        async fn pong(&self, _connection: &ConnectionId, _timestamp: TimestampMillis) -> Result<()> {
            Ok(())
        }
    }

    async fn broker() -> Arc<BrokerCore> {
        let broker = BrokerCore::new(context().await);
        broker.start().await.unwrap();
        broker.open_connection("c1".into(), ConnectInfo::with_client_id("app"), Arc::new(Discard)).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn client_id_is_unique() {
        let broker = broker().await;
        let res = broker.open_connection("c2".into(), ConnectInfo::with_client_id("app"), Arc::new(Discard)).await;
        assert!(res.is_err());
        broker.connection_closing(&"c1".into()).await;
        broker.open_connection("c2".into(), ConnectInfo::with_client_id("app"), Arc::new(Discard)).await.unwrap();
        assert_eq!(broker.sessions_len(), 1);
    }

    #[tokio::test]
    async fn unknown_destination_is_rejected() {
        let broker = broker().await;
        let res = broker.add_message(&"c1".into(), Message::new("nowhere", "x"), None).await;
        assert!(matches!(res, Err(BrokerError::InvalidDestination(_))));
    }

    #[tokio::test]
    async fn temporary_destinations_follow_their_connection() {
        let broker = broker().await;
        let c1: ConnectionId = "c1".into();
        let name = broker.create_temporary_destination(&c1, DestinationKind::Queue).await.unwrap();
        assert!(name.starts_with("TEMP.QUEUE."));
        broker.open_connection("c2".into(), ConnectInfo::default(), Arc::new(Discard)).await.unwrap();
        assert!(broker.delete_temporary_destination(&"c2".into(), &name).await.is_err());
        broker.connection_closing(&c1).await;
        assert!(broker.destination(&name).is_none());
    }

    #[tokio::test]
    async fn rollback_discards_and_commit_reveals() {
        let broker = broker().await;
        let c1: ConnectionId = "c1".into();
        broker.create_destination("q".into(), DestinationConfig::queue()).await.unwrap();
        broker.subscribe(&c1, SubscriptionSpec::new("s", "q").mode(ReceiveMode::Sync)).await.unwrap();

        let t1: TxId = "t1".into();
        broker.add_message(&c1, Message::new("q", "a"), Some(&t1)).await.unwrap();
        assert!(broker.receive(&c1, &"s".into(), -1).await.unwrap().is_none());
        assert_eq!(
            broker.transact(&c1, TransactionRequest::Rollback(t1.clone())).await.unwrap(),
            TransactionOutcome::RolledBack
        );
        assert!(broker.receive(&c1, &"s".into(), -1).await.unwrap().is_none());

        broker.add_message(&c1, Message::new("q", "b"), Some(&t1)).await.unwrap();
        broker.transact(&c1, TransactionRequest::Commit(t1)).await.unwrap();
        let d = broker.receive(&c1, &"s".into(), -1).await.unwrap().unwrap();
        assert_eq!(d.message.body, bytes::Bytes::from("b"));
        assert_eq!(broker.transactions_len(), 0);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let broker = broker().await;
        broker.create_destination("q".into(), DestinationConfig::queue()).await.unwrap();
        broker.shutdown();
        let res = broker.add_message(&"c1".into(), Message::new("q", "x"), None).await;
        assert!(matches!(res, Err(BrokerError::ServiceUnavailable)));
        assert_eq!(broker.sessions_len(), 1);
    }
}
