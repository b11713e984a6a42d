use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use crate::error::{BrokerError, Result};
use crate::types::{HandleId, Header, HeaderRef, Priority, QueueName, TimestampMillis};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageState {
    NotStored,
    Stored,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Body strongly held and tracked by the LRU
    Hard,
    /// Body held only by the reclamation pool
    Soft,
    /// Body dropped, must be loaded from persistence
    Evicted,
}

pub(crate) struct HandleState {
    pub(crate) header: HeaderRef,
    pub(crate) storage: StorageState,
    pub(crate) tier: Tier,
    pub(crate) hard: Option<Arc<Bytes>>,
    pub(crate) soft: Weak<Bytes>,
    //set while a soften is saving the body
    pub(crate) persisting: bool,
    pub(crate) sequence: u64,
}

/// Per message lifecycle object.
///
/// Header fields needed for ordering and filtering stay resident for the whole
/// life of the handle, only the body moves between tiers.
#[derive(Clone)]
pub struct MessageHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: HandleId,
    queue: QueueName,
    priority: Priority,
    expiration: TimestampMillis,
    delivery_time: TimestampMillis,
    state: Mutex<HandleState>,
}

impl MessageHandle {
    pub(crate) fn new(id: HandleId, queue: QueueName, header: Header, body: Bytes, storage: StorageState) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                queue,
                priority: header.priority,
                expiration: header.expiration,
                delivery_time: header.delivery_time,
                state: Mutex::new(HandleState {
                    header: Arc::new(header),
                    storage,
                    tier: Tier::Hard,
                    hard: Some(Arc::new(body)),
                    soft: Weak::new(),
                    persisting: false,
                    sequence: 0,
                }),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    /// Name of the queue this handle was created for.
    #[inline]
    pub fn queue(&self) -> &QueueName {
        &self.inner.queue
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    #[inline]
    pub fn expiration(&self) -> TimestampMillis {
        self.inner.expiration
    }

    #[inline]
    pub fn delivery_time(&self) -> TimestampMillis {
        self.inner.delivery_time
    }

    #[inline]
    pub fn is_expired(&self, now: TimestampMillis) -> bool {
        self.inner.expiration > 0 && self.inner.expiration <= now
    }

    #[inline]
    pub fn header(&self) -> HeaderRef {
        self.inner.state.lock().header.clone()
    }

    #[inline]
    pub fn storage(&self) -> StorageState {
        self.inner.state.lock().storage
    }

    #[inline]
    pub fn tier(&self) -> Tier {
        self.inner.state.lock().tier
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.storage() == StorageState::Removed
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.inner.state.lock().sequence
    }

    /// Assigns the queue sequence once, returns the sequence in effect.
    #[inline]
    pub(crate) fn assign_sequence(&self, seq: u64) -> u64 {
        let mut st = self.inner.state.lock();
        if st.sequence == 0 {
            st.sequence = seq;
        }
        st.sequence
    }

    /// Marks the message as offered again: redelivered, delivery count + 1.
    pub(crate) fn mark_redelivered(&self) -> Result<HeaderRef> {
        let mut st = self.inner.state.lock();
        if st.storage == StorageState::Removed {
            return Err(BrokerError::HandleRemoved(self.inner.id));
        }
        let mut header = (*st.header).clone();
        header.redelivered = true;
        header.delivery_count += 1;
        st.header = Arc::new(header);
        Ok(st.header.clone())
    }

    #[inline]
    pub(crate) fn state(&self) -> MutexGuard<'_, HandleState> {
        self.inner.state.lock()
    }
}

impl PartialEq for MessageHandle {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MessageHandle {}

impl Hash for MessageHandle {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state)
    }
}

impl fmt::Debug for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        write!(
            f,
            "MessageHandle {{ id: {}, queue: {}, priority: {}, sequence: {}, storage: {:?}, tier: {:?} }}",
            self.inner.id, self.inner.queue, self.inner.priority, st.sequence, st.storage, st.tier
        )
    }
}
