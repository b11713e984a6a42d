use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};
use crate::types::{
    ClientId, ConnectInfo, ConnectionId, DashMap, DestinationName, Password, SelectorExpr, SubscriptionName,
    UserName,
};

/// Registry entry of one durable topic subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableRecord {
    pub client_id: ClientId,
    pub name: SubscriptionName,
    pub topic: DestinationName,
    pub selector: Option<SelectorExpr>,
    pub no_local: bool,
}

/// Authentication, client id uniqueness and the durable subscription registry.
#[async_trait]
pub trait StateManager: Sync + Send {
    async fn authenticate(&self, info: &ConnectInfo) -> Result<()>;

    ///Claims `client_id` for `connection`, fails if another connection holds it.
    async fn check_client_id(&self, connection: &ConnectionId, client_id: &ClientId) -> Result<()>;

    async fn release_client_id(&self, connection: &ConnectionId, client_id: &ClientId);

    async fn register_durable(&self, record: DurableRecord) -> Result<()>;

    async fn unregister_durable(&self, client_id: &ClientId, name: &SubscriptionName) -> Result<()>;

    async fn durables(&self) -> Result<Vec<DurableRecord>>;
}

#[derive(Default)]
pub struct DefaultStateManager {
    users: DashMap<UserName, Password>,
    client_ids: DashMap<ClientId, ConnectionId>,
    durables: DashMap<(ClientId, SubscriptionName), DurableRecord>,
}

impl DefaultStateManager {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Once a user is registered, connections must present matching credentials.
    #[inline]
    pub fn add_user<U: Into<UserName>, P: Into<Password>>(&self, username: U, password: P) {
        self.users.insert(username.into(), password.into());
    }
}

#[async_trait]
impl StateManager for DefaultStateManager {
    async fn authenticate(&self, info: &ConnectInfo) -> Result<()> {
        if self.users.is_empty() {
            return Ok(());
        }
        let username = info.username.as_ref().ok_or_else(|| BrokerError::Security("username required".into()))?;
        match self.users.get(username) {
            Some(password) if Some(password.value()) == info.password.as_ref() => Ok(()),
            _ => Err(BrokerError::Security(format!("bad username or password, {username}"))),
        }
    }

    async fn check_client_id(&self, connection: &ConnectionId, client_id: &ClientId) -> Result<()> {
        let entry = self.client_ids.entry(client_id.clone()).or_insert_with(|| connection.clone());
        if entry.value() != connection {
            return Err(BrokerError::Security(format!("client id {client_id} is already in use")));
        }
        Ok(())
    }

    async fn release_client_id(&self, connection: &ConnectionId, client_id: &ClientId) {
        self.client_ids.remove_if(client_id, |_, holder| holder == connection);
    }

    async fn register_durable(&self, record: DurableRecord) -> Result<()> {
        self.durables.insert((record.client_id.clone(), record.name.clone()), record);
        Ok(())
    }

    async fn unregister_durable(&self, client_id: &ClientId, name: &SubscriptionName) -> Result<()> {
        self.durables
            .remove(&(client_id.clone(), name.clone()))
            .map(|_| ())
            .ok_or_else(|| BrokerError::InvalidSubscription(format!("no durable subscription {client_id}/{name}").into()))
    }

    async fn durables(&self) -> Result<Vec<DurableRecord>> {
        Ok(self.durables.iter().map(|e| e.value().clone()).collect())
    }
}
