use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};
use crate::types::{DashMap, HandleId, Message, QueueName, TxId};
use crate::utils::Counter;

/// One durable record: a message as owned by one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub handle_id: HandleId,
    pub queue: QueueName,
    pub message: Message,
}

/// Durable message log used for spill-over and for persistent delivery.
///
/// Operations that take a `TxId` are staged until `commit` makes them visible
/// or `rollback` discards them.
#[async_trait]
pub trait PersistenceStore: Sync + Send {
    #[inline]
    async fn begin(&self, _tx: &TxId) -> Result<()> {
        Ok(())
    }

    async fn commit(&self, tx: &TxId) -> Result<()>;

    async fn rollback(&self, tx: &TxId) -> Result<()>;

    async fn save(&self, msg: &StoredMessage, tx: Option<&TxId>) -> Result<()>;

    async fn load(&self, id: HandleId) -> Result<Option<StoredMessage>>;

    async fn remove(&self, id: HandleId, tx: Option<&TxId>) -> Result<()>;

    ///Every record owned by `queue`, in handle id order.
    async fn restore_queue(&self, queue: &QueueName) -> Result<Vec<StoredMessage>>;

    async fn queues(&self) -> Result<Vec<QueueName>>;

    #[inline]
    async fn count(&self) -> usize {
        0
    }
}

enum StagedOp {
    Save(HandleId, Vec<u8>),
    Remove(HandleId),
}

/// In-process reference store, records are kept bincode-encoded.
pub struct MemoryPersistence {
    records: DashMap<HandleId, Vec<u8>>,
    staged: DashMap<TxId, Vec<StagedOp>>,
    failing: AtomicBool,
    saves: Counter,
    loads: Counter,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            records: DashMap::default(),
            staged: DashMap::default(),
            failing: AtomicBool::new(false),
            saves: Counter::new(),
            loads: Counter::new(),
        }
    }

    /// While set, `save` and `remove` fail with a store error.
    #[inline]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    #[inline]
    pub fn contains(&self, id: HandleId) -> bool {
        self.records.contains_key(&id)
    }

    #[inline]
    pub fn saves(&self) -> isize {
        self.saves.count()
    }

    #[inline]
    pub fn loads(&self) -> isize {
        self.loads.count()
    }

    #[inline]
    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(BrokerError::Store("persistence unavailable".into()))
        } else {
            Ok(())
        }
    }

    #[inline]
    fn decode(data: &[u8]) -> Result<StoredMessage> {
        Ok(bincode::deserialize::<StoredMessage>(data)?)
    }
}

#[async_trait]
impl PersistenceStore for MemoryPersistence {
    async fn begin(&self, tx: &TxId) -> Result<()> {
        self.staged.entry(tx.clone()).or_default();
        Ok(())
    }

    async fn commit(&self, tx: &TxId) -> Result<()> {
        self.check()?;
        if let Some((_, ops)) = self.staged.remove(tx) {
            for op in ops {
                match op {
                    StagedOp::Save(id, data) => {
                        self.records.insert(id, data);
                    }
                    StagedOp::Remove(id) => {
                        self.records.remove(&id);
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(&self, tx: &TxId) -> Result<()> {
        self.staged.remove(tx);
        Ok(())
    }

    async fn save(&self, msg: &StoredMessage, tx: Option<&TxId>) -> Result<()> {
        self.check()?;
        let data = bincode::serialize(msg)?;
        self.saves.inc();
        if let Some(tx) = tx {
            self.staged.entry(tx.clone()).or_default().push(StagedOp::Save(msg.handle_id, data));
        } else {
            self.records.insert(msg.handle_id, data);
        }
        Ok(())
    }

    async fn load(&self, id: HandleId) -> Result<Option<StoredMessage>> {
        self.loads.inc();
        if let Some(data) = self.records.get(&id) {
            return Ok(Some(Self::decode(data.value())?));
        }
        //a record saved inside a still open transaction is readable by the store itself
        for entry in self.staged.iter() {
            for op in entry.value().iter().rev() {
                if let StagedOp::Save(sid, data) = op {
                    if *sid == id {
                        return Ok(Some(Self::decode(data)?));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn remove(&self, id: HandleId, tx: Option<&TxId>) -> Result<()> {
        self.check()?;
        if let Some(tx) = tx {
            self.staged.entry(tx.clone()).or_default().push(StagedOp::Remove(id));
        } else {
            self.records.remove(&id);
        }
        Ok(())
    }

    async fn restore_queue(&self, queue: &QueueName) -> Result<Vec<StoredMessage>> {
        let mut msgs = Vec::new();
        for entry in self.records.iter() {
            let msg = Self::decode(entry.value())?;
            if &msg.queue == queue {
                msgs.push(msg);
            }
        }
        msgs.sort_by_key(|m| m.handle_id);
        Ok(msgs)
    }

    async fn queues(&self) -> Result<Vec<QueueName>> {
        let mut queues = Vec::new();
        for entry in self.records.iter() {
            let msg = Self::decode(entry.value())?;
            if !queues.contains(&msg.queue) {
                queues.push(msg.queue);
            }
        }
        Ok(queues)
    }

    #[inline]
    async fn count(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: HandleId, queue: &str) -> StoredMessage {
        StoredMessage { handle_id: id, queue: QueueName::from(queue), message: Message::new(queue, "body") }
    }

    #[tokio::test]
    async fn staged_saves_are_visible_after_commit() {
        let p = MemoryPersistence::new();
        let tx = TxId::from("tx-1");
        p.begin(&tx).await.unwrap();
        p.save(&stored(1, "q"), Some(&tx)).await.unwrap();
        assert!(!p.contains(1));
        //the store can still page the message back in before commit
        assert!(p.load(1).await.unwrap().is_some());
        p.commit(&tx).await.unwrap();
        assert!(p.contains(1));
    }

    #[tokio::test]
    async fn rollback_discards_staged() {
        let p = MemoryPersistence::new();
        let tx = TxId::from("tx-2");
        p.save(&stored(7, "q"), Some(&tx)).await.unwrap();
        p.rollback(&tx).await.unwrap();
        p.commit(&tx).await.unwrap();
        assert!(!p.contains(7));
        assert!(p.load(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restore_filters_by_queue() {
        let p = MemoryPersistence::new();
        p.save(&stored(3, "a"), None).await.unwrap();
        p.save(&stored(1, "a"), None).await.unwrap();
        p.save(&stored(2, "b"), None).await.unwrap();
        let restored = p.restore_queue(&QueueName::from("a")).await.unwrap();
        assert_eq!(restored.iter().map(|m| m.handle_id).collect::<Vec<_>>(), vec![1, 3]);
        let mut queues = p.queues().await.unwrap();
        queues.sort();
        assert_eq!(queues, vec![QueueName::from("a"), QueueName::from("b")]);
    }

    #[tokio::test]
    async fn failing_store_rejects_writes() {
        let p = MemoryPersistence::new();
        p.set_failing(true);
        assert!(matches!(p.save(&stored(1, "q"), None).await, Err(BrokerError::Store(_))));
        p.set_failing(false);
        assert!(p.save(&stored(1, "q"), None).await.is_ok());
    }
}
