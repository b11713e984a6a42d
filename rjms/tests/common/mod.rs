#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use rjms::broker::{Broker, BrokerCore};
use rjms::context::ServerContext;
use rjms::session::ClientTransport;
use rjms::store::FixedMemory;
use rjms::types::{ConnectInfo, ConnectionId, Delivery, TimestampMillis};
use rjms::{BrokerError, Result};

/// Forwards pushed deliveries to a channel, or fails every push once told to.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Delivery>,
    failing: AtomicBool,
}

impl ChannelTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, failing: AtomicBool::new(false) }), rx)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClientTransport for ChannelTransport {
    async fn push_deliveries(&self, connection: &ConnectionId, batch: Vec<Delivery>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection(format!("{connection} push failed")));
        }
        for delivery in batch {
            self.tx.send(delivery).map_err(|e| BrokerError::Connection(e.to_string()))?;
        }
        Ok(())
    }

    async fn pong(&self, _connection: &ConnectionId, _timestamp: TimestampMillis) -> Result<()> {
        Ok(())
    }
}

pub fn init_log() {
    let _ = simple_logger::SimpleLogger::new().with_level(log::LevelFilter::Warn).init();
}

pub async fn context(probe: Arc<FixedMemory>) -> ServerContext {
    ServerContext::new().memory_probe(probe).build().await
}

pub async fn broker() -> Arc<BrokerCore> {
    init_log();
    let broker = BrokerCore::new(context(Arc::new(FixedMemory::new(0))).await);
    broker.start().await.unwrap();
    broker
}

/// Opens `connection` with a channel transport.
pub async fn connect(
    broker: &Arc<BrokerCore>,
    connection: &str,
    client_id: Option<&str>,
) -> (Arc<ChannelTransport>, mpsc::UnboundedReceiver<Delivery>) {
    let (transport, rx) = ChannelTransport::new();
    let info = client_id.map(ConnectInfo::with_client_id).unwrap_or_default();
    broker.open_connection(connection.into(), info, transport.clone()).await.unwrap();
    (transport, rx)
}

pub async fn next(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.expect("delivery timeout").expect("channel closed")
}

pub async fn nothing_within(rx: &mut mpsc::UnboundedReceiver<Delivery>, millis: u64) -> bool {
    tokio::time::timeout(Duration::from_millis(millis), rx.recv()).await.is_err()
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
