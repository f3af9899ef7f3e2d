use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::spawn::request::{AccountId, CharacterId};
use crate::world::{AccountFilter, CharacterStore, CharacterSummary, StoreError};

/// Deterministic failure injection: with ratio `r`, exactly `r` of every
/// `1/r` calls fail, evenly spread
#[derive(Debug, Default)]
struct FailurePattern {
    ratio: f64,
    accumulator: f64,
}

impl FailurePattern {
    fn next_fails(&mut self) -> bool {
        if self.ratio <= 0.0 {
            return false;
        }
        self.accumulator += self.ratio;
        if self.accumulator >= 1.0 - 1e-9 {
            self.accumulator -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Character store backed by in-memory maps
pub struct SimCharacterStore {
    accounts: RwLock<BTreeMap<AccountId, Vec<CharacterSummary>>>,
    failing_accounts: RwLock<FxHashSet<AccountId>>,
    failures: Mutex<FailurePattern>,
    latency: RwLock<Option<Duration>>,
    next_character_id: AtomicU64,
    calls: AtomicU64,
}

impl SimCharacterStore {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(BTreeMap::new()),
            failing_accounts: RwLock::new(FxHashSet::default()),
            failures: Mutex::new(FailurePattern::default()),
            latency: RwLock::new(None),
            next_character_id: AtomicU64::new(1_000_000),
            calls: AtomicU64::new(0),
        }
    }

    /// Add an account with `(character id, level)` pairs
    pub fn add_account(&self, account_id: AccountId, characters: &[(CharacterId, u8)]) {
        let list = characters
            .iter()
            .map(|(id, level)| CharacterSummary {
                id: *id,
                class: 1,
                race: 1,
                level: *level,
                last_known_zone: None,
            })
            .collect();
        self.accounts.write().insert(account_id, list);
    }

    pub fn add_character(&self, account_id: AccountId, character: CharacterSummary) {
        self.accounts.write().entry(account_id).or_default().push(character);
    }

    /// Create `accounts` accounts with `per_account` characters spread over
    /// the level range
    pub fn populate(&self, accounts: u32, per_account: u32, min_level: u8, max_level: u8) {
        let span = max_level.saturating_sub(min_level) as u32 + 1;
        let mut next = 1u64;
        for account in 1..=accounts {
            let mut list = Vec::with_capacity(per_account as usize);
            for i in 0..per_account {
                list.push(CharacterSummary {
                    id: next,
                    class: (1 + (next % 11)) as u8,
                    race: (1 + (next % 10)) as u8,
                    level: min_level + ((account + i) % span) as u8,
                    last_known_zone: None,
                });
                next += 1;
            }
            self.accounts.write().insert(account, list);
        }
    }

    /// Every call touching this account fails
    pub fn fail_account(&self, account_id: AccountId) {
        self.failing_accounts.write().insert(account_id);
    }

    pub fn heal_account(&self, account_id: AccountId) {
        self.failing_accounts.write().remove(&account_id);
    }

    /// Share of `characters_for_account` calls that fail
    pub fn set_failure_ratio(&self, ratio: f64) {
        let mut failures = self.failures.lock();
        failures.ratio = ratio.clamp(0.0, 1.0);
        failures.accumulator = 0.0;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn character_count(&self) -> usize {
        self.accounts.read().values().map(Vec::len).sum()
    }

    async fn enter(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn is_failing(&self, account_id: AccountId) -> bool {
        self.failing_accounts.read().contains(&account_id)
    }
}

impl Default for SimCharacterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CharacterStore for SimCharacterStore {
    async fn characters_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<CharacterSummary>, StoreError> {
        self.enter().await;
        if self.is_failing(account_id) {
            return Err(StoreError::Unavailable(format!("account {} offline", account_id)));
        }
        if self.failures.lock().next_fails() {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(self.accounts.read().get(&account_id).cloned().unwrap_or_default())
    }

    async fn create_character(
        &self,
        account_id: AccountId,
        class: u8,
        race: u8,
        _gender: u8,
        name: &str,
    ) -> Result<CharacterId, StoreError> {
        self.enter().await;
        if self.is_failing(account_id) {
            return Err(StoreError::CreateFailed(format!("{}: account offline", name)));
        }
        let id = self.next_character_id.fetch_add(1, Ordering::Relaxed);
        self.add_character(
            account_id,
            CharacterSummary {
                id,
                class,
                race,
                level: 1,
                last_known_zone: None,
            },
        );
        Ok(id)
    }

    async fn account_id_for_character(
        &self,
        character_id: CharacterId,
    ) -> Result<AccountId, StoreError> {
        self.enter().await;
        self.accounts
            .read()
            .iter()
            .find(|(_, chars)| chars.iter().any(|c| c.id == character_id))
            .map(|(account, _)| *account)
            .ok_or(StoreError::NotFound)
    }

    async fn available_accounts(&self, filter: &AccountFilter) -> Result<Vec<AccountId>, StoreError> {
        self.enter().await;
        let accounts = self.accounts.read();
        let limit = if filter.limit == 0 { usize::MAX } else { filter.limit };
        Ok(accounts.keys().copied().take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_pattern_ratio() {
        let mut p = FailurePattern {
            ratio: 0.3,
            accumulator: 0.0,
        };
        let failures = (0..100).filter(|_| p.next_fails()).count();
        assert_eq!(failures, 30);
    }

    #[tokio::test]
    async fn test_lookup_and_create() {
        let store = SimCharacterStore::new();
        store.add_account(7, &[(70, 10)]);
        assert_eq!(store.account_id_for_character(70).await, Ok(7));
        assert_eq!(store.account_id_for_character(71).await, Err(StoreError::NotFound));

        let id = store.create_character(7, 2, 3, 0, "Test").await.expect("create");
        let chars = store.characters_for_account(7).await.expect("list");
        assert_eq!(chars.len(), 2);
        assert_eq!(chars[1].id, id);
    }

    #[test]
    fn test_failing_account() {
        let store = SimCharacterStore::new();
        store.add_account(3, &[(30, 12)]);
        store.fail_account(3);
        assert!(matches!(
            tokio_test::block_on(store.characters_for_account(3)),
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            tokio_test::block_on(store.create_character(3, 1, 1, 0, "Down")),
            Err(StoreError::CreateFailed(_))
        ));

        store.heal_account(3);
        let chars = tokio_test::block_on(store.characters_for_account(3)).expect("list");
        assert_eq!(chars.len(), 1);
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test]
    async fn test_populate() {
        let store = SimCharacterStore::new();
        store.populate(4, 5, 20, 30);
        assert_eq!(store.character_count(), 20);
        let all = store.available_accounts(&AccountFilter::default()).await.expect("accounts");
        assert_eq!(all, vec![1, 2, 3, 4]);
    }
}
