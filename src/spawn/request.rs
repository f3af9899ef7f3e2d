//! Spawn request types carried through the pipeline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

pub type AccountId = u32;
pub type CharacterId = u64;
/// A bot is identified by the character it plays
pub type BotId = CharacterId;
pub type ZoneId = u32;
pub type MapId = u32;
pub type RequestId = u64;

/// What kind of spawn is being asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpawnType {
    /// Any suitable character from any bot-capable account
    Random,
    /// One named character
    SpecificCharacter,
    /// A character that fits a given zone
    SpecificZone,
    /// Filling a slot in a human's group
    GroupMember,
}

/// Release priority. Declaration order is release order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SpawnPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl SpawnPriority {
    pub const ALL: [SpawnPriority; 4] = [
        SpawnPriority::Critical,
        SpawnPriority::High,
        SpawnPriority::Normal,
        SpawnPriority::Low,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether a gate allowing `self` lets `other` through
    #[inline]
    pub fn covers(self, other: SpawnPriority) -> bool {
        other <= self
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SpawnPriority::Critical => "critical",
            SpawnPriority::High => "high",
            SpawnPriority::Normal => "normal",
            SpawnPriority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Some(SpawnPriority::Critical),
            "high" => Some(SpawnPriority::High),
            "normal" => Some(SpawnPriority::Normal),
            "low" => Some(SpawnPriority::Low),
            _ => None,
        }
    }
}

/// World position hint for the host
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Invoked once with the final outcome of a request
pub type CompletionCallback = Arc<dyn Fn(bool, Option<BotId>) + Send + Sync>;

/// A concluded outcome waiting to reach its callback
pub struct Completion {
    callback: CompletionCallback,
    success: bool,
    bot_id: Option<BotId>,
}

impl Completion {
    pub fn success(&self) -> bool {
        self.success
    }

    pub fn run(self) {
        (self.callback)(self.success, self.bot_id);
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("success", &self.success)
            .field("bot_id", &self.bot_id)
            .finish()
    }
}

/// One desired spawn. Built once, then copied along the pipeline.
#[derive(Clone)]
pub struct SpawnRequest {
    pub spawn_type: SpawnType,
    pub account_id: Option<AccountId>,
    pub character_id: Option<CharacterId>,
    pub zone_id: ZoneId,
    pub map_id: MapId,
    pub min_level: u8,
    pub max_level: u8,
    pub class_filter: Option<u8>,
    pub race_filter: Option<u8>,
    /// Per-zone cap override
    pub zone_cap: Option<u32>,
    /// Asked for by a live human; random spawns release at HIGH or better
    pub requested_by_human: bool,
    /// Character creation allowed when no existing character fits
    pub allow_create: bool,
    pub position: Option<Position>,
    /// Registered factory template the session is built from
    pub template: Option<String>,
    on_complete: Option<CompletionCallback>,
}

impl SpawnRequest {
    pub fn new(spawn_type: SpawnType, zone_id: ZoneId, map_id: MapId) -> Self {
        Self {
            spawn_type,
            account_id: None,
            character_id: None,
            zone_id,
            map_id,
            min_level: 1,
            max_level: 80,
            class_filter: None,
            race_filter: None,
            zone_cap: None,
            requested_by_human: false,
            allow_create: true,
            position: None,
            template: None,
            on_complete: None,
        }
    }

    pub fn random(zone_id: ZoneId, map_id: MapId) -> Self {
        Self::new(SpawnType::Random, zone_id, map_id)
    }

    pub fn specific_character(character_id: CharacterId, zone_id: ZoneId, map_id: MapId) -> Self {
        let mut request = Self::new(SpawnType::SpecificCharacter, zone_id, map_id);
        request.character_id = Some(character_id);
        request.allow_create = false;
        request
    }

    pub fn group_member(zone_id: ZoneId, map_id: MapId) -> Self {
        Self::new(SpawnType::GroupMember, zone_id, map_id)
    }

    pub fn with_levels(mut self, min_level: u8, max_level: u8) -> Self {
        self.min_level = min_level.min(max_level);
        self.max_level = max_level.max(min_level);
        self
    }

    pub fn with_account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn with_class(mut self, class: u8) -> Self {
        self.class_filter = Some(class);
        self
    }

    pub fn with_race(mut self, race: u8) -> Self {
        self.race_filter = Some(race);
        self
    }

    pub fn with_zone_cap(mut self, cap: u32) -> Self {
        self.zone_cap = Some(cap);
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn requested_by_human(mut self) -> Self {
        self.requested_by_human = true;
        self
    }

    pub fn with_template(mut self, name: impl Into<String>) -> Self {
        self.template = Some(name.into());
        self
    }

    pub fn without_creation(mut self) -> Self {
        self.allow_create = false;
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(bool, Option<BotId>) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    /// Report the final outcome to whoever asked
    pub fn complete(&self, success: bool, bot_id: Option<BotId>) {
        if let Some(completion) = self.completion(success, bot_id) {
            completion.run();
        }
    }

    /// The outcome bound to this request's callback, to run later
    pub fn completion(&self, success: bool, bot_id: Option<BotId>) -> Option<Completion> {
        self.on_complete.as_ref().map(|callback| Completion {
            callback: callback.clone(),
            success,
            bot_id,
        })
    }

    /// Non-empty character id, used as the queue's dedup key
    pub fn dedup_key(&self) -> Option<CharacterId> {
        self.character_id.filter(|id| *id != 0)
    }

    pub fn level_fits(&self, level: u8) -> bool {
        level >= self.min_level && level <= self.max_level
    }
}

impl fmt::Debug for SpawnRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnRequest")
            .field("spawn_type", &self.spawn_type)
            .field("account_id", &self.account_id)
            .field("character_id", &self.character_id)
            .field("zone_id", &self.zone_id)
            .field("map_id", &self.map_id)
            .field("levels", &(self.min_level, self.max_level))
            .field("class_filter", &self.class_filter)
            .field("race_filter", &self.race_filter)
            .field("zone_cap", &self.zone_cap)
            .field("template", &self.template)
            .field("has_callback", &self.on_complete.is_some())
            .finish()
    }
}

/// A request as it sits in the spawn queue
#[derive(Debug, Clone)]
pub struct PrioritySpawnRequest {
    pub request_id: RequestId,
    pub request: SpawnRequest,
    pub priority: SpawnPriority,
    pub created_at: Instant,
    pub retry_count: u32,
    pub reason: String,
}

impl PrioritySpawnRequest {
    pub fn new(
        request_id: RequestId,
        request: SpawnRequest,
        priority: SpawnPriority,
        created_at: Instant,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            request,
            priority,
            created_at,
            retry_count: 0,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_priority_order() {
        assert!(SpawnPriority::Critical < SpawnPriority::High);
        assert!(SpawnPriority::Normal < SpawnPriority::Low);
        assert!(SpawnPriority::High.covers(SpawnPriority::Critical));
        assert!(SpawnPriority::High.covers(SpawnPriority::High));
        assert!(!SpawnPriority::High.covers(SpawnPriority::Normal));
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!(SpawnPriority::parse("LOW"), Some(SpawnPriority::Low));
        assert_eq!(SpawnPriority::parse("urgent"), None);
    }

    #[test]
    fn test_dedup_key_ignores_zero() {
        let mut request = SpawnRequest::random(12, 0);
        assert_eq!(request.dedup_key(), None);
        request.character_id = Some(0);
        assert_eq!(request.dedup_key(), None);
        request.character_id = Some(42);
        assert_eq!(request.dedup_key(), Some(42));
    }

    #[test]
    fn test_with_levels_normalizes() {
        let request = SpawnRequest::random(1, 0).with_levels(30, 20);
        assert_eq!(request.min_level, 20);
        assert_eq!(request.max_level, 30);
        assert!(request.level_fits(25));
        assert!(!request.level_fits(31));
    }

    #[test]
    fn test_completion_callback_runs() {
        let hits = Arc::new(AtomicU32::new(0));
        let seen = hits.clone();
        let request = SpawnRequest::random(1, 0).on_complete(move |ok, bot| {
            assert!(ok);
            assert_eq!(bot, Some(7));
            seen.fetch_add(1, Ordering::Relaxed);
        });
        let copy = request.clone();
        copy.complete(true, Some(7));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_completion_runs_later() {
        let hits = Arc::new(AtomicU32::new(0));
        let seen = hits.clone();
        let request = SpawnRequest::random(1, 0).on_complete(move |ok, _| {
            assert!(!ok);
            seen.fetch_add(1, Ordering::Relaxed);
        });
        let completion = request.completion(false, None).expect("callback set");
        assert!(!completion.success());
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        completion.run();
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        assert!(SpawnRequest::random(1, 0).completion(true, Some(1)).is_none());
    }
}
