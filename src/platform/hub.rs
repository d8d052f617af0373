use async_trait::async_trait;

use crate::error::Result;
use crate::events::{EntityEvent, EntityState};

/// Opens sessions against the automation hub.
#[async_trait]
pub trait HubConnector: Send + Sync {
    /// Connect and authenticate.
    async fn connect(&self) -> Result<Box<dyn HubSession>>;
}

/// One live, authenticated hub connection.
#[async_trait]
pub trait HubSession: Send {
    /// Current state of every entity the hub knows about.
    async fn get_states(&mut self) -> Result<Vec<EntityState>>;

    /// Start receiving change events for `entity_ids`.
    async fn subscribe_entities(&mut self, entity_ids: &[String]) -> Result<()>;

    /// Next subscription event; `Ok(None)` once the hub closed the connection.
    async fn next_event(&mut self) -> Result<Option<EntityEvent>>;
}
