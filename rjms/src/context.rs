use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rust_box::task_exec_queue::{Builder, TaskExecQueue};
use serde::{Deserialize, Serialize};

use crate::conf::Settings;
use crate::persist::{MemoryPersistence, PersistenceStore};
use crate::queue::ReceiverId;
use crate::selector::{NoSelectorFactory, SelectorFactory};
use crate::state::{DefaultStateManager, StateManager};
use crate::stats::Stats;
use crate::store::{MemoryProbe, MessageStore, SystemMemory};
use crate::timer::Timer;
use crate::types::AckToken;

/// Services shared by every destination, queue and session of one broker.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub settings: Settings,
    pub stats: Arc<Stats>,
    pub timer: Timer,
    pub store: MessageStore,
    pub persistence: Arc<dyn PersistenceStore>,
    pub state: Arc<dyn StateManager>,
    pub selectors: Arc<dyn SelectorFactory>,
    pub global_exec: TaskExecQueue,
    next_ack_token: AtomicU64,
    next_receiver_id: AtomicU64,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl ServerContext {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> ServerContextBuilder {
        ServerContextBuilder::default()
    }

    #[inline]
    pub fn next_ack_token(&self) -> AckToken {
        self.next_ack_token.fetch_add(1, Ordering::SeqCst)
    }

    #[inline]
    pub fn next_receiver_id(&self) -> ReceiverId {
        self.next_receiver_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ServerContext ...")?;
        Ok(())
    }
}

#[derive(Default)]
pub struct ServerContextBuilder {
    settings: Option<Settings>,
    persistence: Option<Arc<dyn PersistenceStore>>,
    state: Option<Arc<dyn StateManager>>,
    selectors: Option<Arc<dyn SelectorFactory>>,
    probe: Option<Arc<dyn MemoryProbe>>,
}

impl ServerContextBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn PersistenceStore>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn state_manager(mut self, state: Arc<dyn StateManager>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn selector_factory(mut self, selectors: Arc<dyn SelectorFactory>) -> Self {
        self.selectors = Some(selectors);
        self
    }

    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Builds the context and spawns the worker pool runner, so it must be
    /// called inside a tokio runtime.
    pub async fn build(self) -> ServerContext {
        let settings = self.settings.unwrap_or_default();
        let persistence = self.persistence.unwrap_or_else(|| Arc::new(MemoryPersistence::new()));
        let probe = self.probe.unwrap_or_else(|| Arc::new(SystemMemory::default()));
        let stats = Arc::new(Stats::new());

        let (global_exec, task_runner) = Builder::default()
            .workers(settings.task.exec_workers)
            .queue_max(settings.task.exec_queue_max)
            .build();

        tokio::spawn(async move {
            task_runner.await;
        });

        let store = MessageStore::new(settings.store.clone(), persistence.clone(), probe, stats.clone());

        ServerContext {
            inner: Arc::new(ServerContextInner {
                settings,
                stats,
                timer: Timer::new(),
                store,
                persistence,
                state: self.state.unwrap_or_else(|| Arc::new(DefaultStateManager::new())),
                selectors: self.selectors.unwrap_or_else(|| Arc::new(NoSelectorFactory)),
                global_exec,
                next_ack_token: AtomicU64::new(1),
                next_receiver_id: AtomicU64::new(1),
            }),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TaskExecStats {
    active_count: isize,
    completed_count: isize,
    waiting_count: isize,
    rate: f64,
}

impl TaskExecStats {
    #[inline]
    pub async fn from_global_exec(global_exec: &TaskExecQueue) -> Self {
        Self {
            active_count: global_exec.active_count(),
            completed_count: global_exec.completed_count().await,
            waiting_count: global_exec.waiting_count(),
            rate: global_exec.rate().await,
        }
    }
}
