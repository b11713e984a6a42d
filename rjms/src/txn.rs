use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;

use crate::error::{BrokerError, Result};
use crate::persist::PersistenceStore;
use crate::types::{ConnectionId, DashMap, TimestampMillis, TxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

type TxTask = BoxFuture<'static, ()>;

/// A unit of work accumulated under one `TxId`.
///
/// Queues register deferred side effects as commit and rollback tasks; they
/// run once, strictly after the persistence store committed or aborted.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

struct TransactionInner {
    id: TxId,
    connection: ConnectionId,
    created_at: TimestampMillis,
    state: Mutex<TxState>,
    commit_tasks: Mutex<Vec<TxTask>>,
    rollback_tasks: Mutex<Vec<TxTask>>,
    rollback_only: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(id: TxId, connection: ConnectionId) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id,
                connection,
                created_at: rjms_utils::timestamp_millis(),
                state: Mutex::new(TxState::Active),
                commit_tasks: Mutex::new(Vec::new()),
                rollback_tasks: Mutex::new(Vec::new()),
                rollback_only: AtomicBool::new(false),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> &TxId {
        &self.inner.id
    }

    #[inline]
    pub fn connection(&self) -> &ConnectionId {
        &self.inner.connection
    }

    #[inline]
    pub fn created_at(&self) -> TimestampMillis {
        self.inner.created_at
    }

    #[inline]
    pub fn state(&self) -> TxState {
        *self.inner.state.lock()
    }

    #[inline]
    pub fn set_rollback_only(&self) {
        self.inner.rollback_only.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_rollback_only(&self) -> bool {
        self.inner.rollback_only.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn on_commit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.commit_tasks.lock().push(task.boxed());
    }

    #[inline]
    pub fn on_rollback<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.rollback_tasks.lock().push(task.boxed());
    }

    #[inline]
    fn transition(&self, from: &[TxState], to: TxState) -> Result<()> {
        let mut state = self.inner.state.lock();
        if from.contains(&state) {
            *state = to;
            Ok(())
        } else {
            Err(BrokerError::InvalidTransaction(self.inner.id.clone(), format!("is {:?}, expected {:?}", *state, from)))
        }
    }

    /// Fails unless work can still be added.
    #[inline]
    pub fn ensure_active(&self) -> Result<()> {
        let state = self.state();
        if state == TxState::Active {
            Ok(())
        } else {
            Err(BrokerError::InvalidTransaction(self.inner.id.clone(), format!("is {state:?}")))
        }
    }

    /// One-phase commit from `Active`, second phase from `Prepared`.
    pub async fn commit(&self, persistence: &dyn PersistenceStore) -> Result<()> {
        self.transition(&[TxState::Active, TxState::Prepared], TxState::Committing)?;
        if self.is_rollback_only() {
            self.abort(persistence).await;
            return Err(BrokerError::TransactionRolledBack(self.inner.id.clone(), "marked rollback only".into()));
        }
        if let Err(e) = persistence.commit(&self.inner.id).await {
            log::warn!("{} persistence commit error, {:?}", self.inner.id, e);
            self.abort(persistence).await;
            return Err(BrokerError::TransactionRolledBack(self.inner.id.clone(), e.to_string()));
        }
        self.inner.rollback_tasks.lock().clear();
        let tasks = std::mem::take(&mut *self.inner.commit_tasks.lock());
        for task in tasks {
            task.await;
        }
        *self.inner.state.lock() = TxState::Committed;
        Ok(())
    }

    pub async fn rollback(&self, persistence: &dyn PersistenceStore) -> Result<()> {
        self.transition(&[TxState::Active, TxState::Prepared], TxState::RollingBack)?;
        self.abort(persistence).await;
        Ok(())
    }

    /// First phase of a two-phase commit. A rollback-only unit is rolled back instead.
    pub async fn prepare(&self, persistence: &dyn PersistenceStore) -> Result<()> {
        self.transition(&[TxState::Active], TxState::Prepared)?;
        if self.is_rollback_only() {
            *self.inner.state.lock() = TxState::RollingBack;
            self.abort(persistence).await;
            return Err(BrokerError::TransactionRolledBack(self.inner.id.clone(), "marked rollback only".into()));
        }
        Ok(())
    }

    async fn abort(&self, persistence: &dyn PersistenceStore) {
        *self.inner.state.lock() = TxState::RollingBack;
        if let Err(e) = persistence.rollback(&self.inner.id).await {
            log::warn!("{} persistence rollback error, {:?}", self.inner.id, e);
        }
        self.inner.commit_tasks.lock().clear();
        let tasks = std::mem::take(&mut *self.inner.rollback_tasks.lock());
        for task in tasks {
            task.await;
        }
        *self.inner.state.lock() = TxState::RolledBack;
    }
}

/// Open transactions by id.
pub struct TransactionManager {
    txs: DashMap<TxId, Transaction>,
    max: usize,
}

impl TransactionManager {
    #[inline]
    pub fn new(max: usize) -> Self {
        Self { txs: DashMap::default(), max }
    }

    /// Returns the active transaction `id` of `connection`, beginning it on first use.
    pub async fn begin(
        &self,
        id: &TxId,
        connection: &ConnectionId,
        persistence: &dyn PersistenceStore,
    ) -> Result<(Transaction, bool)> {
        if let Some(tx) = self.txs.get(id).map(|tx| tx.value().clone()) {
            if tx.connection() != connection {
                return Err(BrokerError::InvalidTransaction(id.clone(), "owned by another connection".into()));
            }
            tx.ensure_active()?;
            return Ok((tx, false));
        }
        if self.max > 0 && self.txs.len() >= self.max {
            return Err(BrokerError::InvalidTransaction(id.clone(), "too many open transactions".into()));
        }
        persistence.begin(id).await?;
        let tx = self.txs.entry(id.clone()).or_insert_with(|| Transaction::new(id.clone(), connection.clone())).clone();
        Ok((tx, true))
    }

    #[inline]
    pub fn get(&self, id: &TxId) -> Result<Transaction> {
        self.txs
            .get(id)
            .map(|tx| tx.value().clone())
            .ok_or_else(|| BrokerError::InvalidTransaction(id.clone(), "unknown transaction".into()))
    }

    #[inline]
    pub fn remove(&self, id: &TxId) -> Option<Transaction> {
        self.txs.remove(id).map(|(_, tx)| tx)
    }

    /// Ids of prepared transactions awaiting resolution.
    #[inline]
    pub fn prepared(&self) -> Vec<TxId> {
        self.txs.iter().filter(|tx| tx.state() == TxState::Prepared).map(|tx| tx.key().clone()).collect()
    }

    /// Active, unprepared transactions of `connection`.
    #[inline]
    pub fn active_of(&self, connection: &ConnectionId) -> Vec<Transaction> {
        self.txs
            .iter()
            .filter(|tx| tx.connection() == connection && tx.state() == TxState::Active)
            .map(|tx| tx.value().clone())
            .collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.txs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}
