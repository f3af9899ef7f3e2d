//! Asynchronous character selection
//!
//! Resolves a spawn request to a concrete character on the tokio runtime and
//! hands the result to a continuation. The caller never waits on the
//! character store.

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use super::request::{AccountId, CharacterId, SpawnRequest, SpawnType};
use crate::config::SelectorConfig;
use crate::util::SharedClock;
use crate::world::{AccountFilter, CharacterStore, CharacterSummary, StoreError};

/// Store errors tolerated per selection before giving up
const MAX_STORE_ERRORS: u32 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum SelectionResult {
    Selected {
        character: CharacterSummary,
        account_id: AccountId,
        created: bool,
    },
    NoSuitableCharacter,
    StoreError(StoreError),
    /// Too many selections already pending
    Overloaded,
}

/// What the continuation receives
#[derive(Debug, Clone)]
pub struct Selection {
    pub result: SelectionResult,
    /// Time spent waiting on the store
    pub store_time: Duration,
    pub store_calls: u32,
}

impl Selection {
    fn immediate(result: SelectionResult) -> Self {
        Self {
            result,
            store_time: Duration::ZERO,
            store_calls: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SelectorStats {
    pub requests: u64,
    pub selected: u64,
    pub created: u64,
    pub no_character: u64,
    pub store_errors: u64,
    pub overloaded: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub pending: usize,
    pub reserved: usize,
}

struct CachedCharacters {
    fetched_at: Instant,
    characters: Arc<Vec<CharacterSummary>>,
}

struct SelectorShared {
    store: Arc<dyn CharacterStore>,
    config: RwLock<SelectorConfig>,
    clock: SharedClock,
    cache: DashMap<AccountId, CachedCharacters>,
    reservations: DashSet<CharacterId>,
    pending: AtomicUsize,
    shutdown: AtomicBool,
    cursor: AtomicUsize,
    requests: AtomicU64,
    selected: AtomicU64,
    created: AtomicU64,
    no_character: AtomicU64,
    store_errors: AtomicU64,
    overloaded: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

/// Per-call store bookkeeping
#[derive(Default)]
struct StoreUse {
    time: Duration,
    calls: u32,
}

pub struct CharacterSelector {
    shared: Arc<SelectorShared>,
    runtime: Handle,
}

impl CharacterSelector {
    pub fn new(
        store: Arc<dyn CharacterStore>,
        config: SelectorConfig,
        clock: SharedClock,
        runtime: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(SelectorShared {
                store,
                config: RwLock::new(config),
                clock,
                cache: DashMap::new(),
                reservations: DashSet::new(),
                pending: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
                cursor: AtomicUsize::new(0),
                requests: AtomicU64::new(0),
                selected: AtomicU64::new(0),
                created: AtomicU64::new(0),
                no_character: AtomicU64::new(0),
                store_errors: AtomicU64::new(0),
                overloaded: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                cache_misses: AtomicU64::new(0),
            }),
            runtime,
        }
    }

    /// Resolve `request` in the background. `continuation` runs on a runtime
    /// worker, unless the selector is overloaded, in which case it runs
    /// immediately. After `shutdown` continuations are dropped.
    pub fn select_async<F>(&self, request: SpawnRequest, continuation: F)
    where
        F: FnOnce(Selection) + Send + 'static,
    {
        let shared = self.shared.clone();
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        shared.requests.fetch_add(1, Ordering::Relaxed);

        let max_pending = shared.config.read().max_pending;
        if shared.pending.fetch_add(1, Ordering::AcqRel) >= max_pending {
            shared.pending.fetch_sub(1, Ordering::AcqRel);
            shared.overloaded.fetch_add(1, Ordering::Relaxed);
            debug!("Character selector overloaded ({} pending)", max_pending);
            continuation(Selection::immediate(SelectionResult::Overloaded));
            return;
        }

        self.runtime.spawn(async move {
            let selection = shared.resolve(&request).await;
            shared.pending.fetch_sub(1, Ordering::AcqRel);

            if shared.shutdown.load(Ordering::Acquire) {
                if let SelectionResult::Selected { character, .. } = &selection.result {
                    shared.reservations.remove(&character.id);
                }
                trace!("Dropping selection continuation after shutdown");
                return;
            }
            continuation(selection);
        });
    }

    /// Stop delivering continuations
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Hold a character so no other request can pick it
    pub fn reserve(&self, character_id: CharacterId) -> bool {
        self.shared.reservations.insert(character_id)
    }

    pub fn release_reservation(&self, character_id: CharacterId) -> bool {
        self.shared.reservations.remove(&character_id).is_some()
    }

    pub fn is_reserved(&self, character_id: CharacterId) -> bool {
        self.shared.reservations.contains(&character_id)
    }

    pub fn invalidate_account(&self, account_id: AccountId) {
        self.shared.cache.remove(&account_id);
    }

    pub fn clear_cache(&self) {
        self.shared.cache.clear();
    }

    pub fn set_config(&self, config: SelectorConfig) {
        *self.shared.config.write() = config;
    }

    pub fn stats(&self) -> SelectorStats {
        let s = &self.shared;
        SelectorStats {
            requests: s.requests.load(Ordering::Relaxed),
            selected: s.selected.load(Ordering::Relaxed),
            created: s.created.load(Ordering::Relaxed),
            no_character: s.no_character.load(Ordering::Relaxed),
            store_errors: s.store_errors.load(Ordering::Relaxed),
            overloaded: s.overloaded.load(Ordering::Relaxed),
            cache_hits: s.cache_hits.load(Ordering::Relaxed),
            cache_misses: s.cache_misses.load(Ordering::Relaxed),
            pending: s.pending.load(Ordering::Relaxed),
            reserved: s.reservations.len(),
        }
    }
}

impl SelectorShared {
    async fn resolve(&self, request: &SpawnRequest) -> Selection {
        let config = self.config.read().clone();
        let mut usage = StoreUse::default();
        let result = self.resolve_inner(request, &config, &mut usage).await;

        match &result {
            SelectionResult::Selected { created, .. } => {
                self.selected.fetch_add(1, Ordering::Relaxed);
                if *created {
                    self.created.fetch_add(1, Ordering::Relaxed);
                }
            }
            SelectionResult::NoSuitableCharacter => {
                self.no_character.fetch_add(1, Ordering::Relaxed);
            }
            SelectionResult::StoreError(_) => {
                self.store_errors.fetch_add(1, Ordering::Relaxed);
            }
            SelectionResult::Overloaded => {}
        }

        Selection {
            result,
            store_time: usage.time,
            store_calls: usage.calls,
        }
    }

    async fn resolve_inner(
        &self,
        request: &SpawnRequest,
        config: &SelectorConfig,
        usage: &mut StoreUse,
    ) -> SelectionResult {
        let accounts = match self.candidate_accounts(request, config, usage).await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!("Account lookup failed: {}", e);
                return SelectionResult::StoreError(e);
            }
        };

        let mut errors = 0;
        let mut last_error = None;
        let mut creation_account = None;
        for account_id in accounts.into_iter().take(config.max_accounts_per_request.max(1)) {
            match self.characters(account_id, config, usage).await {
                Ok(characters) => {
                    creation_account.get_or_insert(account_id);
                    if let Some(character) = self.pick(request, &characters) {
                        return SelectionResult::Selected {
                            character,
                            account_id,
                            created: false,
                        };
                    }
                }
                Err(e) => {
                    errors += 1;
                    warn!("Skipping account {}: {}", account_id, e);
                    if errors >= MAX_STORE_ERRORS {
                        return SelectionResult::StoreError(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        let may_create = request.allow_create
            && config.allow_create
            && request.spawn_type != SpawnType::SpecificCharacter;
        if let (true, Some(account_id)) = (may_create, creation_account) {
            return self.create(request, account_id, config, usage).await;
        }

        match last_error {
            Some(e) => SelectionResult::StoreError(e),
            None => SelectionResult::NoSuitableCharacter,
        }
    }

    async fn candidate_accounts(
        &self,
        request: &SpawnRequest,
        config: &SelectorConfig,
        usage: &mut StoreUse,
    ) -> Result<Vec<AccountId>, StoreError> {
        if let Some(account_id) = request.account_id {
            return Ok(vec![account_id]);
        }

        if let Some(character_id) = request.dedup_key() {
            let lookup = self.store.account_id_for_character(character_id);
            return match self.timed(lookup, config, usage).await {
                Ok(account_id) => Ok(vec![account_id]),
                Err(StoreError::NotFound) => Ok(Vec::new()),
                Err(e) => Err(e),
            };
        }

        let mut filter = AccountFilter {
            min_level: Some(request.min_level),
            max_level: Some(request.max_level),
            class: request.class_filter,
            race: request.race_filter,
            zone_id: None,
            limit: config.max_accounts_per_request,
        };
        if matches!(
            request.spawn_type,
            SpawnType::SpecificZone | SpawnType::GroupMember
        ) {
            filter.zone_id = Some(request.zone_id);
        }

        let mut accounts = self
            .timed(self.store.available_accounts(&filter), config, usage)
            .await?;
        if request.spawn_type == SpawnType::Random && !accounts.is_empty() {
            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % accounts.len();
            accounts.rotate_left(start);
        }
        Ok(accounts)
    }

    async fn characters(
        &self,
        account_id: AccountId,
        config: &SelectorConfig,
        usage: &mut StoreUse,
    ) -> Result<Arc<Vec<CharacterSummary>>, StoreError> {
        let now = self.clock.now();
        let validity = Duration::from_millis(config.cache_validity_ms);
        if let Some(entry) = self.cache.get(&account_id) {
            if now.saturating_duration_since(entry.fetched_at) < validity {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.characters.clone());
            }
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let characters = Arc::new(
            self.timed(self.store.characters_for_account(account_id), config, usage)
                .await?,
        );
        self.cache.insert(
            account_id,
            CachedCharacters {
                fetched_at: self.clock.now(),
                characters: characters.clone(),
            },
        );
        Ok(characters)
    }

    async fn create(
        &self,
        request: &SpawnRequest,
        account_id: AccountId,
        config: &SelectorConfig,
        usage: &mut StoreUse,
    ) -> SelectionResult {
        let class = request.class_filter.unwrap_or(config.default_class);
        let race = request.race_filter.unwrap_or(config.default_race);
        let (gender, name) = generated_identity();

        let created = self
            .store
            .create_character(account_id, class, race, gender, &name);
        match self.timed(created, config, usage).await {
            Ok(id) => {
                self.cache.remove(&account_id);
                self.reservations.insert(id);
                debug!("Created character {} ({}) on account {}", id, name, account_id);
                SelectionResult::Selected {
                    character: CharacterSummary {
                        id,
                        class,
                        race,
                        level: request.min_level.max(1),
                        last_known_zone: None,
                    },
                    account_id,
                    created: true,
                }
            }
            Err(e) => {
                warn!("Character creation on account {} failed: {}", account_id, e);
                SelectionResult::StoreError(e)
            }
        }
    }

    /// First unreserved character that fits, in store order
    fn pick(&self, request: &SpawnRequest, characters: &[CharacterSummary]) -> Option<CharacterSummary> {
        characters
            .iter()
            .filter(|c| fits(request, c))
            .find(|c| self.reservations.insert(c.id))
            .cloned()
    }

    async fn timed<T, Fut>(
        &self,
        fut: Fut,
        config: &SelectorConfig,
        usage: &mut StoreUse,
    ) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let started = Instant::now();
        let result = tokio::time::timeout(Duration::from_millis(config.store_timeout_ms), fut)
            .await
            .unwrap_or(Err(StoreError::Timeout));
        usage.time += started.elapsed();
        usage.calls += 1;
        result
    }
}

fn fits(request: &SpawnRequest, character: &CharacterSummary) -> bool {
    if let Some(id) = request.dedup_key() {
        return character.id == id;
    }
    if !request.level_fits(character.level) {
        return false;
    }
    if request.class_filter.is_some_and(|class| class != character.class) {
        return false;
    }
    if request.race_filter.is_some_and(|race| race != character.race) {
        return false;
    }
    if request.spawn_type == SpawnType::SpecificZone {
        if let Some(zone) = character.last_known_zone {
            return zone == request.zone_id;
        }
    }
    true
}

fn generated_identity() -> (u8, String) {
    const SYLLABLES: &[&str] = &[
        "ar", "bel", "cor", "dun", "el", "fen", "gar", "hal", "is", "jor", "kal", "lor", "mor",
        "nim", "or", "pel", "quin", "ras", "sol", "tor", "ul", "var", "wyn", "zar",
    ];
    let mut rng = rand::thread_rng();
    let mut name = String::new();
    for _ in 0..rng.gen_range(2..=3) {
        name.push_str(SYLLABLES[rng.gen_range(0..SYLLABLES.len())]);
    }
    if let Some(first) = name.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    (rng.gen_range(0..=1), name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCharacterStore;
    use crate::util::ManualClock;
    use tokio::sync::oneshot;

    fn selector(store: Arc<SimCharacterStore>, config: SelectorConfig) -> CharacterSelector {
        CharacterSelector::new(store, config, ManualClock::new(), Handle::current())
    }

    async fn select(sel: &CharacterSelector, request: SpawnRequest) -> Selection {
        let (tx, rx) = oneshot::channel();
        sel.select_async(request, move |s| {
            let _ = tx.send(s);
        });
        rx.await.expect("continuation")
    }

    fn selected_id(s: &Selection) -> Option<CharacterId> {
        match &s.result {
            SelectionResult::Selected { character, .. } => Some(character.id),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_selects_fitting_character() {
        let store = Arc::new(SimCharacterStore::new());
        store.add_account(1, &[(100, 10), (101, 25), (102, 28)]);
        let sel = selector(store, SelectorConfig::default());

        let s = select(&sel, SpawnRequest::random(12, 0).with_levels(20, 30)).await;
        assert_eq!(selected_id(&s), Some(101));
        assert!(sel.is_reserved(101));

        let s = select(&sel, SpawnRequest::random(12, 0).with_levels(20, 30)).await;
        assert_eq!(selected_id(&s), Some(102));
        assert_eq!(sel.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_specific_character() {
        let store = Arc::new(SimCharacterStore::new());
        store.add_account(3, &[(300, 10), (301, 70)]);
        let sel = selector(store, SelectorConfig::default());

        let s = select(&sel, SpawnRequest::specific_character(301, 1, 0)).await;
        assert!(matches!(
            s.result,
            SelectionResult::Selected { account_id: 3, created: false, .. }
        ));

        let s = select(&sel, SpawnRequest::specific_character(999, 1, 0)).await;
        assert_eq!(s.result, SelectionResult::NoSuitableCharacter);
    }

    #[tokio::test]
    async fn test_creates_when_nothing_fits() {
        let store = Arc::new(SimCharacterStore::new());
        store.add_account(1, &[(100, 5)]);
        let sel = selector(store.clone(), SelectorConfig::default());

        let s = select(&sel, SpawnRequest::random(1, 0).with_levels(40, 50)).await;
        match s.result {
            SelectionResult::Selected { character, created, .. } => {
                assert!(created);
                assert_eq!(character.level, 40);
                assert!(sel.is_reserved(character.id));
            }
            other => panic!("unexpected {:?}", other),
        }

        let s = select(
            &sel,
            SpawnRequest::random(1, 0).with_levels(60, 70).without_creation(),
        )
        .await;
        assert_eq!(s.result, SelectionResult::NoSuitableCharacter);
    }

    #[tokio::test]
    async fn test_store_error_skips_then_surfaces() {
        let store = Arc::new(SimCharacterStore::new());
        store.add_account(1, &[(100, 20)]);
        store.add_account(2, &[(200, 20)]);
        store.fail_account(1);
        let sel = selector(store.clone(), SelectorConfig::default());

        let s = select(&sel, SpawnRequest::random(1, 0).with_levels(1, 80).with_account(1)).await;
        assert!(matches!(s.result, SelectionResult::StoreError(_)));

        // round-robin may start on either account, a single failure is skipped
        let s = select(&sel, SpawnRequest::random(1, 0).with_levels(1, 80)).await;
        assert_eq!(selected_id(&s), Some(200));

        store.fail_account(2);
        let s = select(&sel, SpawnRequest::random(1, 0).with_levels(1, 80)).await;
        assert!(matches!(s.result, SelectionResult::StoreError(_)));
    }

    #[tokio::test]
    async fn test_overloaded() {
        let store = Arc::new(SimCharacterStore::new());
        store.add_account(1, &[(100, 20)]);
        let config = SelectorConfig {
            max_pending: 0,
            ..SelectorConfig::default()
        };
        let sel = selector(store, config);
        let s = select(&sel, SpawnRequest::random(1, 0)).await;
        assert_eq!(s.result, SelectionResult::Overloaded);
        assert_eq!(sel.stats().overloaded, 1);
    }

    #[tokio::test]
    async fn test_shutdown_drops_continuation() {
        let store = Arc::new(SimCharacterStore::new());
        store.add_account(1, &[(100, 20)]);
        let sel = selector(store, SelectorConfig::default());
        sel.shutdown();

        let (tx, rx) = oneshot::channel::<Selection>();
        sel.select_async(SpawnRequest::random(1, 0), move |s| {
            let _ = tx.send(s);
        });
        assert!(rx.await.is_err());
        assert_eq!(sel.pending(), 0);
    }

    #[test]
    fn test_zone_fit() {
        let c = CharacterSummary {
            id: 1,
            class: 1,
            race: 1,
            level: 10,
            last_known_zone: Some(4),
        };
        let req = SpawnRequest::new(SpawnType::SpecificZone, 5, 0).with_levels(1, 20);
        assert!(!fits(&req, &c));
        let req = SpawnRequest::new(SpawnType::SpecificZone, 4, 0).with_levels(1, 20);
        assert!(fits(&req, &c));
        let req = SpawnRequest::random(5, 0).with_levels(1, 20).with_class(2);
        assert!(!fits(&req, &c));
    }
}
