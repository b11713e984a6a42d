#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use config::{Config, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use rjms_utils::*;

use self::logging::Log;

pub use self::options::Options;

pub mod logging;
pub mod options;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub task: Task,
    #[serde(default)]
    pub store: Store,
    #[serde(default)]
    pub queue: Queue,
    #[serde(default)]
    pub session: Session,
    #[serde(default)]
    pub broker: Broker,
    #[serde(default)]
    pub log: Log,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    #[inline]
    fn default() -> Self {
        Settings(Arc::new(Inner::default()))
    }
}

impl From<Inner> for Settings {
    #[inline]
    fn from(inner: Inner) -> Self {
        Settings(Arc::new(inner))
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/rjms/rjms").required(false))
            .add_source(File::with_name("/etc/rjms").required(false))
            .add_source(File::with_name("rjms").required(false))
            .add_source(config::Environment::with_prefix("rjms").separator("__").try_parsing(true));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(workers) = opts.exec_workers {
            inner.task.exec_workers = workers;
        }
        if let Some(max_depth) = opts.queue_max_depth {
            inner.queue.max_depth = max_depth;
        }

        inner.store.validate()?;
        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    /// Loads the settings once for the whole process.
    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("exec_workers is {}", self.task.exec_workers);
        log::info!("exec_queue_max is {}", self.task.exec_queue_max);
        log::info!("store config is: {:?}", self.store);
        log::info!("queue config is: {:?}", self.queue);
        log::info!("session config is: {:?}", self.session);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Task {
    //Concurrent task count for the delivery worker pool.
    #[serde(default = "Task::exec_workers_default", deserialize_with = "deserialize_nonzero")]
    pub exec_workers: usize,

    //Queue capacity for the delivery worker pool.
    #[serde(default = "Task::exec_queue_max_default", deserialize_with = "deserialize_nonzero")]
    pub exec_queue_max: usize,
}

impl Default for Task {
    #[inline]
    fn default() -> Self {
        Self { exec_workers: Self::exec_workers_default(), exec_queue_max: Self::exec_queue_max_default() }
    }
}

impl Task {
    fn exec_workers_default() -> usize {
        64
    }
    fn exec_queue_max_default() -> usize {
        100_000
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Store {
    //Below this much used process memory nothing is softened.
    #[serde(default = "Store::low_water_default")]
    pub low_water: Bytesize,
    //At or above this much used memory every eligible entry is softened.
    #[serde(default = "Store::high_water_default")]
    pub high_water: Bytesize,
    //Memory monitor polling interval.
    #[serde(default = "Store::check_interval_default", deserialize_with = "deserialize_duration")]
    pub check_interval: Duration,
    //Soft bodies dropped per reclamation round.
    #[serde(default = "Store::reclaim_batch_default")]
    pub reclaim_batch: usize,
}

impl Default for Store {
    #[inline]
    fn default() -> Self {
        Self {
            low_water: Self::low_water_default(),
            high_water: Self::high_water_default(),
            check_interval: Self::check_interval_default(),
            reclaim_batch: Self::reclaim_batch_default(),
        }
    }
}

impl Store {
    fn low_water_default() -> Bytesize {
        Bytesize::from("768M")
    }
    fn high_water_default() -> Bytesize {
        Bytesize::from("1G")
    }
    fn check_interval_default() -> Duration {
        Duration::from_secs(5)
    }
    fn reclaim_batch_default() -> usize {
        1000
    }

    fn validate(&self) -> Result<()> {
        if self.high_water <= self.low_water {
            return Err(anyhow!(
                "store.high_water ({:?}) must be greater than store.low_water ({:?})",
                self.high_water,
                self.low_water
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Queue {
    //Default maximum resident messages per queue, 0 is unbounded.
    #[serde(default)]
    pub max_depth: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    //Maximum deliveries waiting to be pushed to one connection.
    #[serde(default = "Session::outbound_max_default", deserialize_with = "deserialize_nonzero")]
    pub outbound_max: usize,
    //Maximum unacknowledged deliveries per listener subscription.
    #[serde(default = "Session::prefetch_default", deserialize_with = "deserialize_nonzero")]
    pub prefetch: usize,
}

impl Default for Session {
    #[inline]
    fn default() -> Self {
        Self { outbound_max: Self::outbound_max_default(), prefetch: Self::prefetch_default() }
    }
}

impl Session {
    fn outbound_max_default() -> usize {
        1000
    }
    fn prefetch_default() -> usize {
        100
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Broker {
    //Name prefix for temporary destinations.
    #[serde(default = "Broker::temp_prefix_default")]
    pub temp_prefix: String,
    //Maximum open transactions, 0 is unbounded.
    #[serde(default)]
    pub max_transactions: usize,
}

impl Default for Broker {
    #[inline]
    fn default() -> Self {
        Self { temp_prefix: Self::temp_prefix_default(), max_transactions: 0 }
    }
}

impl Broker {
    fn temp_prefix_default() -> String {
        "TEMP".into()
    }
}
