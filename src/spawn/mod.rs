//! Spawn pipeline: requests, queueing, character selection, session
//! construction and the orchestrator that drives them

pub mod error;
pub mod events;
pub mod factory;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod request;
pub mod selector;

#[cfg(test)]
mod orchestrator_tests;

pub use error::SpawnErrorKind;
pub use events::{Event, EventBus, EventBusMetrics, EventPayload, EventType};
pub use factory::{FactoryError, SessionFactory, ZoneProfile};
pub use orchestrator::{ActiveBot, SpawnOrchestrator, SpawnStats};
pub use pool::{BotSession, SessionHandle, SessionPool, SessionState};
pub use queue::{QueueError, QueueMetrics, SpawnQueue};
pub use request::{
    AccountId, BotId, CharacterId, Completion, MapId, Position, PrioritySpawnRequest, RequestId,
    SpawnPriority, SpawnRequest, SpawnType, ZoneId,
};
pub use selector::{CharacterSelector, Selection, SelectionResult};
