use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::types::{HashMap, TimestampMillis};

pub type TimerId = u64;

struct TimerEntry {
    at: Instant,
    id: TimerId,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.id == other.id
    }
}

impl Ord for TimerEntry {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        //min-heap, earlier deadline first, then earlier registration
        other.at.cmp(&self.at).then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerEntry {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A single delay queue with one waiter task.
///
/// Expiry and scheduled delivery of every queue share this timer. Each entry is
/// a future that is spawned when its deadline passes, unless it was canceled.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    heap: Mutex<BinaryHeap<TimerEntry>>,
    tasks: Mutex<HashMap<TimerId, BoxFuture<'static, ()>>>,
    next_id: AtomicU64,
    notify: Notify,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimerInner {
                heap: Mutex::new(BinaryHeap::new()),
                tasks: Mutex::new(HashMap::default()),
                next_id: AtomicU64::new(1),
                notify: Notify::new(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Spawns the waiter task, once. Must be called inside a tokio runtime.
    pub fn start(&self) {
        if self.inner.started.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run().await;
            log::debug!("timer waiter exited");
        });
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, AtomicOrdering::SeqCst);
        self.inner.notify.notify_one();
        self.inner.heap.lock().clear();
        self.inner.tasks.lock().clear();
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(AtomicOrdering::SeqCst)
    }

    /// Runs `task` after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        if self.is_stopped() {
            return id;
        }
        self.inner.tasks.lock().insert(id, task.boxed());
        self.inner.heap.lock().push(TimerEntry { at: Instant::now() + delay, id });
        self.inner.notify.notify_one();
        id
    }

    /// Runs `task` at the wall-clock time `at` (milliseconds since the epoch).
    #[inline]
    pub fn schedule_at<F>(&self, at: TimestampMillis, task: F) -> TimerId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule(rjms_utils::millis_until(at), task)
    }

    /// Returns false if the entry already fired or was never registered.
    #[inline]
    pub fn cancel(&self, id: TimerId) -> bool {
        self.inner.tasks.lock().remove(&id).is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TimerInner {
    async fn run(&self) {
        loop {
            if self.stopped.load(AtomicOrdering::SeqCst) {
                break;
            }

            let now = Instant::now();
            let mut dues = Vec::new();
            let next = {
                let mut heap = self.heap.lock();
                while let Some(entry) = heap.peek() {
                    if entry.at > now {
                        break;
                    }
                    if let Some(entry) = heap.pop() {
                        dues.push(entry.id);
                    }
                }
                heap.peek().map(|e| e.at)
            };

            if !dues.is_empty() {
                let mut tasks = self.tasks.lock();
                for id in dues {
                    //canceled entries have no task left
                    if let Some(task) = tasks.remove(&id) {
                        tokio::spawn(task);
                    }
                }
                continue;
            }

            match next {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn fires_in_deadline_order() {
        let timer = Timer::new();
        timer.start();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, tag) in [(60u64, 3), (20, 1), (40, 2)] {
            let order = order.clone();
            timer.schedule(Duration::from_millis(delay), async move {
                order.lock().push(tag);
            });
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*order.lock(), vec![1, 2, 3]);
        assert!(timer.is_empty());
    }

    #[tokio::test]
    async fn canceled_entry_never_fires() {
        let timer = Timer::new();
        timer.start();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let id = timer.schedule(Duration::from_millis(30), async move {
            f.fetch_add(1, AtomicOrdering::SeqCst);
        });
        assert!(timer.cancel(id));
        assert!(!timer.cancel(id));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stopped_timer_refuses_work() {
        let timer = Timer::new();
        timer.start();
        timer.stop();
        timer.schedule(Duration::from_millis(1), async {});
        assert!(timer.is_empty());
    }
}
