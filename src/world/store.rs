//! Character store interface

use async_trait::async_trait;
use serde::Serialize;

use crate::spawn::request::{AccountId, CharacterId, ZoneId};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Character store timed out")]
    Timeout,
    #[error("Character store unavailable: {0}")]
    Unavailable(String),
    #[error("Not found")]
    NotFound,
    #[error("Character creation failed: {0}")]
    CreateFailed(String),
}

/// A character as listed for an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacterSummary {
    pub id: CharacterId,
    pub class: u8,
    pub race: u8,
    pub level: u8,
    pub last_known_zone: Option<ZoneId>,
}

/// Restricts `available_accounts`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountFilter {
    pub min_level: Option<u8>,
    pub max_level: Option<u8>,
    pub class: Option<u8>,
    pub race: Option<u8>,
    pub zone_id: Option<ZoneId>,
    pub limit: usize,
}

/// Persistent account and character storage
#[async_trait]
pub trait CharacterStore: Send + Sync {
    async fn characters_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<CharacterSummary>, StoreError>;

    async fn create_character(
        &self,
        account_id: AccountId,
        class: u8,
        race: u8,
        gender: u8,
        name: &str,
    ) -> Result<CharacterId, StoreError>;

    async fn account_id_for_character(
        &self,
        character_id: CharacterId,
    ) -> Result<AccountId, StoreError>;

    /// Bot-capable accounts, in store order
    async fn available_accounts(&self, filter: &AccountFilter) -> Result<Vec<AccountId>, StoreError>;
}
