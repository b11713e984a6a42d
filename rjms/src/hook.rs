//! Interceptor chain around the inbound `Broker` operations.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::Broker;
use crate::error::{BrokerError, Result};
use crate::session::TransportRef;
use crate::types::{
    AckRequest, ClientId, ConnectInfo, ConnectionId, Delivery, DestinationKind, DestinationName, Header,
    Message, SubscriptionId, SubscriptionName, SubscriptionSpec, TimestampMillis, TransactionOutcome, TransactionRequest,
    TxId, UserName,
};

#[derive(Debug)]
pub enum Parameter<'a> {
    OpenConnection { client_id: Option<&'a ClientId>, username: Option<&'a UserName> },
    AddMessage(&'a Header, Option<&'a TxId>),
    Subscribe(&'a SubscriptionSpec),
    Unsubscribe(&'a SubscriptionId),
    UnsubscribeDurable(&'a SubscriptionName),
    Receive(&'a SubscriptionId, i64),
    Acknowledge(&'a AckRequest, Option<&'a TxId>),
    Transact(&'a TransactionRequest),
    CreateTemporaryDestination(DestinationKind),
    DeleteTemporaryDestination(&'a DestinationName),
    SetEnabled(bool),
    Ping(TimestampMillis),
    ConnectionClosing,
}

impl Parameter<'_> {
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Parameter::OpenConnection { .. } => "open_connection",
            Parameter::AddMessage(..) => "add_message",
            Parameter::Subscribe(..) => "subscribe",
            Parameter::Unsubscribe(..) => "unsubscribe",
            Parameter::UnsubscribeDurable(..) => "unsubscribe_durable",
            Parameter::Receive(..) => "receive",
            Parameter::Acknowledge(..) => "acknowledge",
            Parameter::Transact(..) => "transact",
            Parameter::CreateTemporaryDestination(..) => "create_temporary_destination",
            Parameter::DeleteTemporaryDestination(..) => "delete_temporary_destination",
            Parameter::SetEnabled(..) => "set_enabled",
            Parameter::Ping(..) => "ping",
            Parameter::ConnectionClosing => "connection_closing",
        }
    }
}

#[async_trait]
pub trait Interceptor: Sync + Send {
    ///Runs before the call, an error refuses it.
    async fn before(&self, _connection: &ConnectionId, _param: &Parameter<'_>) -> Result<()> {
        Ok(())
    }

    async fn after(&self, _connection: &ConnectionId, _param: &Parameter<'_>, _err: Option<&BrokerError>) {}
}

/// A `Broker` with interceptors run around every call. `before` runs in
/// registration order, `after` in reverse.
pub struct Intercepted<B> {
    inner: Arc<B>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl<B: Broker> Intercepted<B> {
    pub fn new(inner: Arc<B>) -> Self {
        Self { inner, interceptors: Vec::new() }
    }

    pub fn interceptor<I: Interceptor + 'static>(mut self, interceptor: I) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    #[inline]
    pub fn inner(&self) -> &Arc<B> {
        &self.inner
    }

    async fn call<T, F>(&self, connection: &ConnectionId, param: Parameter<'_>, fut: F) -> Result<T>
    where
        T: Send,
        F: Future<Output = Result<T>> + Send,
    {
        for interceptor in self.interceptors.iter() {
            interceptor.before(connection, &param).await?;
        }
        let res = fut.await;
        let err = res.as_ref().err();
        for interceptor in self.interceptors.iter().rev() {
            interceptor.after(connection, &param, err).await;
        }
        res
    }
}

#[async_trait]
impl<B: Broker> Broker for Intercepted<B> {
    async fn open_connection(
        &self,
        connection: ConnectionId,
        info: ConnectInfo,
        transport: TransportRef,
    ) -> Result<()> {
        let (client_id, username) = (info.client_id.clone(), info.username.clone());
        let param = Parameter::OpenConnection { client_id: client_id.as_ref(), username: username.as_ref() };
        self.call(&connection, param, self.inner.open_connection(connection.clone(), info, transport)).await
    }

    async fn add_message(&self, connection: &ConnectionId, message: Message, tx: Option<&TxId>) -> Result<()> {
        let header = message.header.clone();
        self.call(connection, Parameter::AddMessage(&header, tx), self.inner.add_message(connection, message, tx)).await
    }

    async fn subscribe(&self, connection: &ConnectionId, spec: SubscriptionSpec) -> Result<()> {
        let param_spec = spec.clone();
        self.call(connection, Parameter::Subscribe(&param_spec), self.inner.subscribe(connection, spec)).await
    }

    async fn unsubscribe(&self, connection: &ConnectionId, id: &SubscriptionId) -> Result<()> {
        self.call(connection, Parameter::Unsubscribe(id), self.inner.unsubscribe(connection, id)).await
    }

    async fn unsubscribe_durable(&self, connection: &ConnectionId, name: &SubscriptionName) -> Result<()> {
        self.call(connection, Parameter::UnsubscribeDurable(name), self.inner.unsubscribe_durable(connection, name))
            .await
    }

    async fn receive(
        &self,
        connection: &ConnectionId,
        id: &SubscriptionId,
        wait_millis: i64,
    ) -> Result<Option<Delivery>> {
        self.call(connection, Parameter::Receive(id, wait_millis), self.inner.receive(connection, id, wait_millis))
            .await
    }

    async fn acknowledge(&self, connection: &ConnectionId, req: AckRequest, tx: Option<&TxId>) -> Result<()> {
        self.call(connection, Parameter::Acknowledge(&req, tx), self.inner.acknowledge(connection, req, tx)).await
    }

    async fn transact(&self, connection: &ConnectionId, req: TransactionRequest) -> Result<TransactionOutcome> {
        let param_req = req.clone();
        self.call(connection, Parameter::Transact(&param_req), self.inner.transact(connection, req)).await
    }

    async fn create_temporary_destination(
        &self,
        connection: &ConnectionId,
        kind: DestinationKind,
    ) -> Result<DestinationName> {
        self.call(
            connection,
            Parameter::CreateTemporaryDestination(kind),
            self.inner.create_temporary_destination(connection, kind),
        )
        .await
    }

    async fn delete_temporary_destination(&self, connection: &ConnectionId, name: &DestinationName) -> Result<()> {
        self.call(
            connection,
            Parameter::DeleteTemporaryDestination(name),
            self.inner.delete_temporary_destination(connection, name),
        )
        .await
    }

    async fn set_enabled(&self, connection: &ConnectionId, enabled: bool) -> Result<()> {
        self.call(connection, Parameter::SetEnabled(enabled), self.inner.set_enabled(connection, enabled)).await
    }

    async fn ping(&self, connection: &ConnectionId, timestamp: TimestampMillis) -> Result<()> {
        self.call(connection, Parameter::Ping(timestamp), self.inner.ping(connection, timestamp)).await
    }

    async fn connection_closing(&self, connection: &ConnectionId) {
        let res = self
            .call(connection, Parameter::ConnectionClosing, async {
                self.inner.connection_closing(connection).await;
                Ok(())
            })
            .await;
        if let Err(e) = res {
            //refused by an interceptor, the connection is closed anyway
            log::warn!("{} connection_closing refused, {}, closing anyway", connection, e);
            self.inner.connection_closing(connection).await;
        }
    }
}

/// Logs every call at debug level and every failure at warn level.
#[derive(Default)]
pub struct LogInterceptor;

#[async_trait]
impl Interceptor for LogInterceptor {
    async fn before(&self, connection: &ConnectionId, param: &Parameter<'_>) -> Result<()> {
        log::debug!("{} {} {:?}", connection, param.name(), param);
        Ok(())
    }

    async fn after(&self, connection: &ConnectionId, param: &Parameter<'_>, err: Option<&BrokerError>) {
        if let Some(e) = err {
            if e.is_fatal() {
                log::error!("{} {} failed, {}", connection, param.name(), e);
            } else {
                log::warn!("{} {} failed, {}", connection, param.name(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerCore;
    use crate::queue::tests::context;
    use crate::session::ClientTransport;
    use parking_lot::Mutex;

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

    #[derive(Clone, Default)]
    struct Record {
        calls: Arc<Mutex<Vec<(&'static str, bool)>>>,
    }

    #[async_trait]
    impl Interceptor for Record {
        async fn after(&self, _connection: &ConnectionId, param: &Parameter<'_>, err: Option<&BrokerError>) {
            self.calls.lock().push((param.name(), err.is_none()));
        }
    }

    struct DenyTopics;

    #[async_trait]
    impl Interceptor for DenyTopics {
        async fn before(&self, _connection: &ConnectionId, param: &Parameter<'_>) -> Result<()> {
            match param {
                Parameter::CreateTemporaryDestination(DestinationKind::Topic) => {
                    Err(BrokerError::Security("temporary topics are not allowed".into()))
                }
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn interceptors_wrap_calls() {
        let core = BrokerCore::new(context().await);
        core.start().await.unwrap();
        let record = Record::default();
        let broker = Intercepted::new(core).interceptor(LogInterceptor).interceptor(DenyTopics).interceptor(record.clone());

        let c1: ConnectionId = "c1".into();
        broker.open_connection(c1.clone(), ConnectInfo::default(), Arc::new(Discard)).await.unwrap();
        assert!(broker.add_message(&c1, Message::new("none", "x"), None).await.is_err());
        assert!(matches!(
            broker.create_temporary_destination(&c1, DestinationKind::Topic).await,
            Err(BrokerError::Security(_))
        ));
        broker.create_temporary_destination(&c1, DestinationKind::Queue).await.unwrap();
        broker.connection_closing(&c1).await;

        let calls = record.calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                ("open_connection", true),
                ("add_message", false),
                ("create_temporary_destination", true),
                ("connection_closing", true)
            ]
        );
        assert_eq!(broker.inner().sessions_len(), 0);
    }
}
