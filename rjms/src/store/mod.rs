//! Two tier message cache with spill-over to the persistence store.
//!
//! Every resident body starts in the hard tier, an LRU of strongly held
//! bodies. Under memory pressure the least recently used bodies are softened:
//! saved to persistence if needed and handed to the reclamation pool, the
//! handle keeping only a weak reference. Reclaiming drops pooled bodies and
//! leaves their handles evicted; the next `get` loads the body back.
//!
//! Lock order: a handle's state lock may be held while taking the LRU or pool
//! lock, never the other way around.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rust_box::dequemap::DequeBTreeMap as DequeMap;

use crate::conf::Store as StoreConfig;
use crate::error::{BrokerError, Result};
use crate::persist::{PersistenceStore, StoredMessage};
use crate::stats::Stats;
use crate::types::{HandleId, Message, QueueName, TxId};

pub use self::handle::{MessageHandle, StorageState, Tier};
pub use self::memory::{FixedMemory, MemoryProbe, SystemMemory};

pub mod handle;
pub mod memory;

//validation never softens below this many hard entries
const MIN_HARD_ENTRIES: usize = 2;

struct SoftEntry {
    handle: MessageHandle,
    body: Arc<Bytes>,
}

#[derive(Clone)]
pub struct MessageStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    cfg: StoreConfig,
    next_id: AtomicU64,
    //front is the least recently used
    hard: Mutex<DequeMap<HandleId, MessageHandle>>,
    //reclamation pool, front is the oldest softened
    soft: Mutex<DequeMap<HandleId, SoftEntry>>,
    validating: tokio::sync::Mutex<()>,
    //an access-triggered validation is queued
    revalidate: AtomicBool,
    persistence: Arc<dyn PersistenceStore>,
    probe: Arc<dyn MemoryProbe>,
    stats: Arc<Stats>,
    monitor_started: AtomicBool,
    stopped: AtomicBool,
}

impl MessageStore {
    pub fn new(
        cfg: StoreConfig,
        persistence: Arc<dyn PersistenceStore>,
        probe: Arc<dyn MemoryProbe>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                cfg,
                next_id: AtomicU64::new(1),
                hard: Mutex::new(DequeMap::default()),
                soft: Mutex::new(DequeMap::default()),
                validating: tokio::sync::Mutex::new(()),
                revalidate: AtomicBool::new(false),
                persistence,
                probe,
                stats,
                monitor_started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Allocates a handle for `message` owned by `queue`, in the hard tier.
    ///
    /// A `durable` message is saved first, within `tx` when given, and the
    /// handle is tagged `Stored`.
    pub async fn add(
        &self,
        message: Message,
        queue: &QueueName,
        durable: bool,
        tx: Option<&TxId>,
    ) -> Result<MessageHandle> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        if !durable {
            return Ok(self.admit(id, queue.clone(), message, StorageState::NotStored));
        }
        let stored = StoredMessage { handle_id: id, queue: queue.clone(), message };
        self.inner.persistence.save(&stored, tx).await?;
        Ok(self.admit(id, stored.queue, stored.message, StorageState::Stored))
    }

    #[inline]
    fn admit(&self, id: HandleId, queue: QueueName, message: Message, storage: StorageState) -> MessageHandle {
        let Message { header, body } = message;
        let handle = MessageHandle::new(id, queue, header, body, storage);
        self.inner.hard.lock().insert(id, handle.clone());
        self.inner.stats.cache_hard.inc();
        handle
    }

    /// Returns the message, promoting the body to the most recently used hard
    /// entry and loading it from persistence when it was reclaimed. Every
    /// access queues a tier depth validation.
    pub async fn get(&self, handle: &MessageHandle) -> Result<Message> {
        let msg = self.fetch(handle).await?;
        self.schedule_validation();
        Ok(msg)
    }

    /// Runs `validate_tier_depth` off the caller's path, at most one queued at a time.
    fn schedule_validation(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) || self.inner.revalidate.swap(true, Ordering::SeqCst) {
            return;
        }
        let store = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    store.inner.revalidate.store(false, Ordering::SeqCst);
                    store.validate_tier_depth().await;
                });
            }
            Err(_) => self.inner.revalidate.store(false, Ordering::SeqCst),
        }
    }

    async fn fetch(&self, handle: &MessageHandle) -> Result<Message> {
        {
            let mut st = handle.state();
            match st.storage {
                StorageState::Removed => return Err(BrokerError::HandleRemoved(handle.id())),
                StorageState::NotStored | StorageState::Stored => {}
            }
            match st.tier {
                Tier::Hard => {
                    if let Some(body) = st.hard.as_ref() {
                        let msg = Message { header: (*st.header).clone(), body: (**body).clone() };
                        self.touch(handle);
                        self.inner.stats.cache_hits.inc();
                        return Ok(msg);
                    }
                }
                Tier::Soft => {
                    if let Some(body) = st.soft.upgrade() {
                        let msg = Message { header: (*st.header).clone(), body: (*body).clone() };
                        st.hard = Some(body);
                        st.soft = std::sync::Weak::new();
                        st.tier = Tier::Hard;
                        if self.inner.soft.lock().remove(&handle.id()).is_some() {
                            self.inner.stats.cache_soft.dec();
                        }
                        self.inner.hard.lock().insert(handle.id(), handle.clone());
                        self.inner.stats.cache_hard.inc();
                        self.inner.stats.cache_hits.inc();
                        return Ok(msg);
                    }
                }
                Tier::Evicted => {}
            }
        }

        //body is gone, page it back in
        self.inner.stats.cache_misses.inc();
        let stored = self.inner.persistence.load(handle.id()).await?.ok_or_else(|| {
            BrokerError::Store(format!("message {} of handle {} not found", handle.queue(), handle.id()))
        })?;
        let mut st = handle.state();
        if st.storage == StorageState::Removed {
            return Err(BrokerError::HandleRemoved(handle.id()));
        }
        let body = match st.hard.clone() {
            Some(body) if st.tier == Tier::Hard => body,
            _ => {
                let body = Arc::new(stored.message.body);
                st.hard = Some(body.clone());
                st.soft = std::sync::Weak::new();
                st.tier = Tier::Hard;
                self.inner.hard.lock().insert(handle.id(), handle.clone());
                self.inner.stats.cache_hard.inc();
                body
            }
        };
        Ok(Message { header: (*st.header).clone(), body: (*body).clone() })
    }

    #[inline]
    fn touch(&self, handle: &MessageHandle) {
        let mut hard = self.inner.hard.lock();
        if hard.remove(&handle.id()).is_some() {
            hard.insert(handle.id(), handle.clone());
        }
    }

    /// Removes the message for good. Returns false if it was already removed.
    #[inline]
    pub async fn remove(&self, handle: &MessageHandle) -> Result<bool> {
        self.remove_within(handle, None).await
    }

    /// Like `remove`, but a stored record is only dropped when `tx` commits.
    pub async fn remove_within(&self, handle: &MessageHandle, tx: Option<&TxId>) -> Result<bool> {
        let stored = {
            let mut st = handle.state();
            if st.storage == StorageState::Removed {
                return Ok(false);
            }
            let stored = st.storage == StorageState::Stored;
            st.storage = StorageState::Removed;
            st.hard = None;
            st.soft = std::sync::Weak::new();
            match st.tier {
                Tier::Hard => {
                    if self.inner.hard.lock().remove(&handle.id()).is_some() {
                        self.inner.stats.cache_hard.dec();
                    }
                }
                Tier::Soft => {
                    if self.inner.soft.lock().remove(&handle.id()).is_some() {
                        self.inner.stats.cache_soft.dec();
                    }
                }
                Tier::Evicted => {}
            }
            st.tier = Tier::Evicted;
            stored
        };

        if stored {
            if let Err(e) = self.inner.persistence.remove(handle.id(), tx).await {
                log::warn!("{:?} remove from persistence error, {:?}", handle, e);
            }
        }
        Ok(true)
    }

    /// Moves a hard body into the reclamation pool, saving it first when it
    /// is not stored yet. Returns false when nothing changed.
    pub async fn soften(&self, handle: &MessageHandle) -> Result<bool> {
        let unsaved = {
            let mut st = handle.state();
            if st.storage == StorageState::Removed {
                return Err(BrokerError::HandleRemoved(handle.id()));
            }
            if st.tier != Tier::Hard || st.persisting {
                return Ok(false);
            }
            if st.storage == StorageState::NotStored {
                let body = match st.hard.as_ref() {
                    Some(body) => (**body).clone(),
                    None => return Ok(false),
                };
                st.persisting = true;
                Some(Message { header: (*st.header).clone(), body })
            } else {
                None
            }
        };

        if let Some(message) = unsaved {
            let stored = StoredMessage { handle_id: handle.id(), queue: handle.queue().clone(), message };
            let res = self.inner.persistence.save(&stored, None).await;
            let removed = {
                let mut st = handle.state();
                st.persisting = false;
                match res {
                    Err(e) => {
                        log::warn!("{:?} soften, save to persistence error, {:?}", handle, e);
                        return Ok(false);
                    }
                    Ok(()) if st.storage == StorageState::Removed => true,
                    Ok(()) => {
                        st.storage = StorageState::Stored;
                        false
                    }
                }
            };
            if removed {
                //removed while saving, drop the orphan record
                if let Err(e) = self.inner.persistence.remove(handle.id(), None).await {
                    log::warn!("{:?} remove from persistence error, {:?}", handle, e);
                }
                return Err(BrokerError::HandleRemoved(handle.id()));
            }
        }

        let mut st = handle.state();
        if st.storage != StorageState::Stored || st.tier != Tier::Hard {
            return Ok(false);
        }
        let body = match st.hard.take() {
            Some(body) => body,
            None => return Ok(false),
        };
        st.soft = Arc::downgrade(&body);
        st.tier = Tier::Soft;
        if self.inner.hard.lock().remove(&handle.id()).is_some() {
            self.inner.stats.cache_hard.dec();
        }
        self.inner.soft.lock().insert(handle.id(), SoftEntry { handle: handle.clone(), body });
        self.inner.stats.cache_soft.inc();
        self.inner.stats.cache_softened.inc();
        Ok(true)
    }

    /// Softens least recently used hard entries until the soft tier holds the
    /// share dictated by current memory usage. Returns the number softened.
    pub async fn validate_tier_depth(&self) -> usize {
        let used = match self.inner.probe.used() {
            Some(used) => used,
            None => return 0,
        };
        let _validating = self.inner.validating.lock().await;
        let ratio =
            memory::soft_ratio(used, self.inner.cfg.low_water.as_u64(), self.inner.cfg.high_water.as_u64());
        let (hard_len, soft_len) = (self.hard_len(), self.soft_len());
        let target = ((hard_len + soft_len) as f64 * ratio) as usize;
        if soft_len >= target || hard_len <= MIN_HARD_ENTRIES {
            return 0;
        }

        let candidates = {
            let hard = self.inner.hard.lock();
            let max = hard.len().saturating_sub(MIN_HARD_ENTRIES);
            hard.iter().take(max).map(|(_, h)| h.clone()).collect::<Vec<_>>()
        };

        let mut softened = 0;
        for handle in candidates {
            if self.soft_len() >= target || self.hard_len() <= MIN_HARD_ENTRIES {
                break;
            }
            match self.soften(&handle).await {
                Ok(true) => softened += 1,
                Ok(false) => {}
                Err(e) => log::debug!("{:?} soften skipped, {}", handle, e),
            }
        }
        if softened > 0 {
            log::debug!(
                "tier depth validated, used: {used}, ratio: {ratio:.2}, softened: {softened}, hard: {}, soft: {}",
                self.hard_len(),
                self.soft_len()
            );
        }
        softened
    }

    /// Drops up to `max` pooled bodies, oldest first, then revalidates the
    /// tier depth. Returns the number of bodies dropped.
    pub async fn reclaim(&self, max: usize) -> usize {
        let entries = {
            let mut soft = self.inner.soft.lock();
            let mut entries = Vec::with_capacity(max.min(soft.len()));
            while entries.len() < max {
                match soft.pop_front() {
                    Some((_, entry)) => entries.push(entry),
                    None => break,
                }
            }
            entries
        };

        let reclaimed = entries.len();
        for SoftEntry { handle, body } in entries {
            drop(body);
            let mut st = handle.state();
            if st.tier == Tier::Soft && st.soft.upgrade().is_none() {
                st.soft = std::sync::Weak::new();
                st.tier = Tier::Evicted;
            }
        }
        if reclaimed > 0 {
            self.inner.stats.cache_soft.decs(reclaimed as isize);
            self.inner.stats.cache_reclaimed.incs(reclaimed as isize);
        }
        self.validate_tier_depth().await;
        reclaimed
    }

    /// Rebuilds the handles of every stored record owned by `queue`.
    pub async fn restore(&self, queue: &QueueName) -> Result<Vec<MessageHandle>> {
        let records = self.inner.persistence.restore_queue(queue).await?;
        let mut handles = Vec::with_capacity(records.len());
        for StoredMessage { handle_id, queue, message } in records {
            self.inner.next_id.fetch_max(handle_id + 1, Ordering::SeqCst);
            handles.push(self.admit(handle_id, queue, message, StorageState::Stored));
        }
        log::debug!("restored {} messages of queue {}", handles.len(), queue);
        Ok(handles)
    }

    /// Spawns the memory monitor, once.
    pub fn start(&self) {
        if self.inner.monitor_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let store = self.clone();
        let interval = self.inner.cfg.check_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if store.inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                store.check_memory().await;
            }
            log::debug!("message store monitor exited");
        });
    }

    #[inline]
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    /// One monitor round: reclaim above the high-water mark, otherwise only
    /// revalidate the tier depth.
    pub async fn check_memory(&self) {
        match self.inner.probe.used() {
            Some(used) if used >= self.inner.cfg.high_water.as_u64() => {
                let reclaimed = self.reclaim(self.inner.cfg.reclaim_batch).await;
                log::info!("memory used {used} above high water, reclaimed {reclaimed} soft bodies");
            }
            Some(_) => {
                self.validate_tier_depth().await;
            }
            None => {}
        }
    }

    #[inline]
    pub fn hard_len(&self) -> usize {
        self.inner.hard.lock().len()
    }

    #[inline]
    pub fn soft_len(&self) -> usize {
        self.inner.soft.lock().len()
    }

    #[inline]
    pub fn persistence(&self) -> &Arc<dyn PersistenceStore> {
        &self.inner.persistence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryPersistence;
    use crate::utils::Bytesize;

    fn store_with(probe: Arc<FixedMemory>) -> (MessageStore, Arc<MemoryPersistence>) {
        let persistence = Arc::new(MemoryPersistence::new());
        let cfg = StoreConfig {
            low_water: Bytesize::from(100usize),
            high_water: Bytesize::from(200usize),
            ..Default::default()
        };
        let store = MessageStore::new(cfg, persistence.clone(), probe, Arc::new(Stats::new()));
        (store, persistence)
    }

    async fn add(store: &MessageStore, body: &'static str) -> MessageHandle {
        store.add(Message::new("q", body), &QueueName::from("q"), false, None).await.unwrap()
    }

    #[tokio::test]
    async fn removed_handle_faults() {
        let (store, _) = store_with(Arc::new(FixedMemory::new(0)));
        let h = add(&store, "a").await;
        assert!(store.remove(&h).await.unwrap());
        assert!(!store.remove(&h).await.unwrap());
        assert!(store.get(&h).await.unwrap_err().is_fatal());
        assert!(store.soften(&h).await.unwrap_err().is_fatal());
        assert_eq!(store.hard_len(), 0);
    }

    #[tokio::test]
    async fn soften_twice_pools_once() {
        let (store, persistence) = store_with(Arc::new(FixedMemory::new(0)));
        let h = add(&store, "a").await;
        assert!(store.soften(&h).await.unwrap());
        assert!(!store.soften(&h).await.unwrap());
        assert_eq!(store.soft_len(), 1);
        assert_eq!(h.tier(), Tier::Soft);
        //softening forces a save
        assert_eq!(h.storage(), StorageState::Stored);
        assert!(persistence.contains(h.id()));
        //a soft body still resolves without a load
        assert_eq!(store.get(&h).await.unwrap().body, Bytes::from("a"));
        assert_eq!(h.tier(), Tier::Hard);
        assert_eq!(persistence.loads(), 0);
    }

    #[tokio::test]
    async fn reclaimed_body_reloads() {
        let (store, persistence) = store_with(Arc::new(FixedMemory::new(0)));
        let h = add(&store, "payload").await;
        store.soften(&h).await.unwrap();
        assert_eq!(store.reclaim(10).await, 1);
        assert_eq!(h.tier(), Tier::Evicted);
        let msg = store.get(&h).await.unwrap();
        assert_eq!(msg.body, Bytes::from("payload"));
        assert_eq!(h.tier(), Tier::Hard);
        assert_eq!(persistence.loads(), 1);
    }

    #[tokio::test]
    async fn failed_save_keeps_entry_hard() {
        let (store, persistence) = store_with(Arc::new(FixedMemory::new(0)));
        let h = add(&store, "a").await;
        persistence.set_failing(true);
        assert!(!store.soften(&h).await.unwrap());
        assert_eq!(h.tier(), Tier::Hard);
        assert_eq!(h.storage(), StorageState::NotStored);
    }

    #[tokio::test]
    async fn validation_keeps_two_hard_entries() {
        let probe = Arc::new(FixedMemory::new(0));
        let (store, _) = store_with(probe.clone());
        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(add(&store, "x").await);
        }
        assert_eq!(store.validate_tier_depth().await, 0);

        //halfway between the water marks, half of the entries go soft
        probe.set(150);
        assert_eq!(store.validate_tier_depth().await, 2);
        assert_eq!(store.soft_len(), 2);
        //least recently used first
        assert_eq!(handles[0].tier(), Tier::Soft);
        assert_eq!(handles[1].tier(), Tier::Soft);

        probe.set(1000);
        store.validate_tier_depth().await;
        assert_eq!(store.hard_len(), 2);
        assert_eq!(store.soft_len(), 3);
    }

    #[tokio::test]
    async fn access_under_pressure_softens_lru() {
        let probe = Arc::new(FixedMemory::new(0));
        let (store, persistence) = store_with(probe.clone());
        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(add(&store, "x").await);
        }
        probe.set(1000);
        assert_eq!(store.get(&handles[4]).await.unwrap().body, Bytes::from("x"));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(store.hard_len(), 2);
        assert_eq!(store.soft_len(), 3);
        assert_eq!(handles[0].tier(), Tier::Soft);
        assert_eq!(handles[4].tier(), Tier::Hard);
        assert!(persistence.contains(handles[0].id()));
    }

    #[tokio::test]
    async fn restore_rebuilds_stored_handles() {
        let (store, persistence) = store_with(Arc::new(FixedMemory::new(0)));
        let queue = QueueName::from("q");
        let h = store.add(Message::new("q", "durable"), &queue, true, None).await.unwrap();
        assert!(persistence.contains(h.id()));

        let other = MessageStore::new(
            StoreConfig::default(),
            persistence.clone(),
            Arc::new(FixedMemory::new(0)),
            Arc::new(Stats::new()),
        );
        let restored = other.restore(&queue).await.unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id(), h.id());
        assert_eq!(restored[0].storage(), StorageState::Stored);
        let next = other.add(Message::new("q", "n"), &queue, false, None).await.unwrap();
        assert!(next.id() > h.id());
    }
}
