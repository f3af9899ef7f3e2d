//! Spawn failure kinds

use serde::Serialize;

/// Why a spawn did not happen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, thiserror::Error)]
pub enum SpawnErrorKind {
    #[error("capacity exhausted")]
    CapacityExhausted,
    #[error("throttled")]
    ThrottledNow,
    #[error("no suitable character")]
    NoSuitableCharacter,
    #[error("character store error")]
    StoreError,
    #[error("session construction failed")]
    SessionConstructionError,
    #[error("world bind rejected")]
    WorldBindRejected,
    #[error("event handler failed")]
    HandlerException,
    #[error("invalid configuration")]
    ConfigurationInvalid,
    #[error("cancelled")]
    Cancelled,
}

impl SpawnErrorKind {
    /// Whether the breaker sees this as a failed spawn
    pub fn counts_as_failure(self, count_provisioning_failures: bool) -> bool {
        match self {
            SpawnErrorKind::StoreError
            | SpawnErrorKind::SessionConstructionError
            | SpawnErrorKind::WorldBindRejected => true,
            SpawnErrorKind::NoSuitableCharacter => count_provisioning_failures,
            _ => false,
        }
    }

    /// Eligible for the single local retry
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            SpawnErrorKind::StoreError
                | SpawnErrorKind::SessionConstructionError
                | SpawnErrorKind::WorldBindRejected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SpawnErrorKind::CapacityExhausted => "CAPACITY_EXHAUSTED",
            SpawnErrorKind::ThrottledNow => "THROTTLED_NOW",
            SpawnErrorKind::NoSuitableCharacter => "NO_SUITABLE_CHARACTER",
            SpawnErrorKind::StoreError => "STORE_ERROR",
            SpawnErrorKind::SessionConstructionError => "SESSION_CONSTRUCTION_ERROR",
            SpawnErrorKind::WorldBindRejected => "WORLD_BIND_REJECTED",
            SpawnErrorKind::HandlerException => "HANDLER_EXCEPTION",
            SpawnErrorKind::ConfigurationInvalid => "CONFIGURATION_INVALID",
            SpawnErrorKind::Cancelled => "CANCELLED",
        }
    }
}
