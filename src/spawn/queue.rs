//! Priority-ordered spawn request queue
//!
//! Ordered by (priority, creation time); FIFO within a priority. A non-empty
//! character id may appear at most once.

use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

use crate::spawn::request::{CharacterId, PrioritySpawnRequest, SpawnPriority};
use crate::util::{RollingWindow, SharedClock};

/// Dwell-time samples kept for the running average
const DWELL_SAMPLES: usize = 1000;

/// Errors from enqueueing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Character {0} is already queued")]
    Duplicate(CharacterId),
    #[error("Spawn queue full ({0} entries)")]
    Full(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: SpawnPriority,
    created_at: Instant,
    seq: u64,
}

/// Queue metrics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueMetrics {
    pub queued: usize,
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub oldest_age_ms: u64,
    pub avg_dwell_ms: f64,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub duplicates_rejected: u64,
    pub overflow_evictions: u64,
    pub overflow_rejections: u64,
}

/// Bounded priority queue of spawn requests
pub struct SpawnQueue {
    entries: BTreeMap<QueueKey, PrioritySpawnRequest>,
    by_character: FxHashMap<CharacterId, QueueKey>,
    counts: [usize; 4],
    max_size: usize,
    next_seq: u64,
    clock: SharedClock,
    dwell_ms: RollingWindow,
    total_enqueued: u64,
    total_dequeued: u64,
    duplicates_rejected: u64,
    overflow_evictions: u64,
    overflow_rejections: u64,
}

impl SpawnQueue {
    pub fn new(max_size: usize, clock: SharedClock) -> Self {
        Self {
            entries: BTreeMap::new(),
            by_character: FxHashMap::default(),
            counts: [0; 4],
            max_size: max_size.max(1),
            next_seq: 0,
            clock,
            dwell_ms: RollingWindow::new(DWELL_SAMPLES),
            total_enqueued: 0,
            total_dequeued: 0,
            duplicates_rejected: 0,
            overflow_evictions: 0,
            overflow_rejections: 0,
        }
    }

    /// Add a request.
    ///
    /// When the queue is full, the lowest-priority entry is evicted if the new
    /// request outranks it; the evicted entry is returned so the caller can
    /// conclude it. Otherwise the new request is rejected.
    pub fn enqueue(
        &mut self,
        request: PrioritySpawnRequest,
    ) -> Result<Option<PrioritySpawnRequest>, QueueError> {
        let dedup = request.request.dedup_key();
        if let Some(character_id) = dedup {
            if self.by_character.contains_key(&character_id) {
                self.duplicates_rejected += 1;
                return Err(QueueError::Duplicate(character_id));
            }
        }

        let mut evicted = None;
        if self.entries.len() >= self.max_size {
            let lowest = self.entries.keys().next_back().copied();
            match lowest {
                Some(key) if request.priority < key.priority => {
                    evicted = self.remove_key(key);
                    self.overflow_evictions += 1;
                }
                _ => {
                    self.overflow_rejections += 1;
                    return Err(QueueError::Full(self.entries.len()));
                }
            }
        }

        let key = QueueKey {
            priority: request.priority,
            created_at: request.created_at,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        if let Some(character_id) = dedup {
            self.by_character.insert(character_id, key);
        }
        self.counts[request.priority.index()] += 1;
        self.entries.insert(key, request);
        self.total_enqueued += 1;

        Ok(evicted)
    }

    /// Pop the oldest request of the highest priority
    pub fn dequeue_highest(&mut self) -> Option<PrioritySpawnRequest> {
        let key = *self.entries.keys().next()?;
        let request = self.remove_key(key)?;
        let dwell = self.clock.now().saturating_duration_since(request.created_at);
        self.dwell_ms.push(dwell.as_secs_f64() * 1000.0);
        self.total_dequeued += 1;
        Some(request)
    }

    /// Priority of the next request to be released
    pub fn peek_priority(&self) -> Option<SpawnPriority> {
        self.entries.keys().next().map(|key| key.priority)
    }

    /// Remove the entry for a character
    pub fn remove(&mut self, character_id: CharacterId) -> Option<PrioritySpawnRequest> {
        let key = *self.by_character.get(&character_id)?;
        self.remove_key(key)
    }

    pub fn contains(&self, character_id: CharacterId) -> bool {
        self.by_character.contains_key(&character_id)
    }

    pub fn size_by_priority(&self, priority: SpawnPriority) -> usize {
        self.counts[priority.index()]
    }

    /// Whether any queued request passes a gate allowing `allowed`
    pub fn has_releasable(&self, allowed: SpawnPriority) -> bool {
        SpawnPriority::ALL
            .iter()
            .filter(|p| allowed.covers(**p))
            .any(|p| self.counts[p.index()] > 0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything, handing the removed requests back
    pub fn clear(&mut self) -> Vec<PrioritySpawnRequest> {
        let drained: Vec<_> = std::mem::take(&mut self.entries).into_values().collect();
        self.by_character.clear();
        self.counts = [0; 4];
        drained
    }

    pub fn iter(&self) -> impl Iterator<Item = &PrioritySpawnRequest> {
        self.entries.values()
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size.max(1);
    }

    pub fn metrics(&self) -> QueueMetrics {
        let now = self.clock.now();
        let oldest_age_ms = self
            .entries
            .values()
            .map(|r| now.saturating_duration_since(r.created_at).as_millis() as u64)
            .max()
            .unwrap_or(0);

        QueueMetrics {
            queued: self.entries.len(),
            critical: self.counts[SpawnPriority::Critical.index()],
            high: self.counts[SpawnPriority::High.index()],
            normal: self.counts[SpawnPriority::Normal.index()],
            low: self.counts[SpawnPriority::Low.index()],
            oldest_age_ms,
            avg_dwell_ms: self.dwell_ms.average(),
            total_enqueued: self.total_enqueued,
            total_dequeued: self.total_dequeued,
            duplicates_rejected: self.duplicates_rejected,
            overflow_evictions: self.overflow_evictions,
            overflow_rejections: self.overflow_rejections,
        }
    }

    fn remove_key(&mut self, key: QueueKey) -> Option<PrioritySpawnRequest> {
        let request = self.entries.remove(&key)?;
        if let Some(character_id) = request.request.dedup_key() {
            self.by_character.remove(&character_id);
        }
        self.counts[key.priority.index()] -= 1;
        Some(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawn::request::SpawnRequest;
    use crate::util::ManualClock;
    use std::sync::Arc;

    fn queue_with(max: usize) -> (SpawnQueue, Arc<ManualClock>) {
        let clock = ManualClock::new();
        (SpawnQueue::new(max, clock.clone()), clock)
    }

    fn req(id: u64, priority: SpawnPriority, clock: &ManualClock) -> PrioritySpawnRequest {
        use crate::util::Clock;
        PrioritySpawnRequest::new(id, SpawnRequest::random(1, 0), priority, clock.now(), "test")
    }

    fn char_req(
        id: u64,
        character: CharacterId,
        priority: SpawnPriority,
        clock: &ManualClock,
    ) -> PrioritySpawnRequest {
        let mut r = req(id, priority, clock);
        r.request.character_id = Some(character);
        r
    }

    #[test]
    fn test_priority_then_fifo() {
        let (mut q, clock) = queue_with(100);
        q.enqueue(req(1, SpawnPriority::Low, &clock)).unwrap();
        clock.advance_ms(1);
        q.enqueue(req(2, SpawnPriority::Normal, &clock)).unwrap();
        clock.advance_ms(1);
        q.enqueue(req(3, SpawnPriority::Critical, &clock)).unwrap();
        clock.advance_ms(1);
        q.enqueue(req(4, SpawnPriority::Normal, &clock)).unwrap();

        let order: Vec<u64> = std::iter::from_fn(|| q.dequeue_highest())
            .map(|r| r.request_id)
            .collect();
        assert_eq!(order, vec![3, 2, 4, 1]);
    }

    #[test]
    fn test_same_timestamp_keeps_insertion_order() {
        let (mut q, clock) = queue_with(100);
        for id in 0..5 {
            q.enqueue(req(id, SpawnPriority::High, &clock)).unwrap();
        }
        let order: Vec<u64> = std::iter::from_fn(|| q.dequeue_highest())
            .map(|r| r.request_id)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_duplicate_character_rejected() {
        let (mut q, clock) = queue_with(100);
        assert!(q.enqueue(char_req(1, 77, SpawnPriority::Normal, &clock)).is_ok());
        let second = q.enqueue(char_req(2, 77, SpawnPriority::Critical, &clock));
        assert!(matches!(second, Err(QueueError::Duplicate(77))));
        assert!(q.contains(77));
        assert_eq!(q.size_by_priority(SpawnPriority::Normal), 1);
        assert_eq!(q.size_by_priority(SpawnPriority::Critical), 0);
        assert_eq!(q.metrics().duplicates_rejected, 1);
    }

    #[test]
    fn test_requests_without_character_never_duplicate() {
        let (mut q, clock) = queue_with(100);
        assert!(q.enqueue(req(1, SpawnPriority::Normal, &clock)).is_ok());
        assert!(q.enqueue(req(2, SpawnPriority::Normal, &clock)).is_ok());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_enqueue_then_remove_restores_metrics() {
        let (mut q, clock) = queue_with(100);
        q.enqueue(req(1, SpawnPriority::High, &clock)).unwrap();
        let before = q.metrics();

        q.enqueue(char_req(2, 9, SpawnPriority::Low, &clock)).unwrap();
        let removed = q.remove(9).unwrap();
        assert_eq!(removed.request_id, 2);

        let after = q.metrics();
        assert_eq!(before.queued, after.queued);
        assert_eq!(before.high, after.high);
        assert_eq!(before.low, after.low);
        assert_eq!(before.oldest_age_ms, after.oldest_age_ms);
        assert!(!q.contains(9));
    }

    #[test]
    fn test_overflow_evicts_lower_priority() {
        let (mut q, clock) = queue_with(2);
        q.enqueue(req(1, SpawnPriority::Normal, &clock)).unwrap();
        q.enqueue(req(2, SpawnPriority::Low, &clock)).unwrap();

        let evicted = q.enqueue(req(3, SpawnPriority::High, &clock)).unwrap();
        assert_eq!(evicted.map(|r| r.request_id), Some(2));
        assert_eq!(q.len(), 2);
        assert_eq!(q.metrics().overflow_evictions, 1);
    }

    #[test]
    fn test_overflow_rejects_equal_or_lower_priority() {
        let (mut q, clock) = queue_with(2);
        q.enqueue(req(1, SpawnPriority::Normal, &clock)).unwrap();
        q.enqueue(req(2, SpawnPriority::Normal, &clock)).unwrap();

        assert_eq!(
            q.enqueue(req(3, SpawnPriority::Normal, &clock)).map(|_| ()),
            Err(QueueError::Full(2))
        );
        assert_eq!(
            q.enqueue(req(4, SpawnPriority::Low, &clock)).map(|_| ()),
            Err(QueueError::Full(2))
        );
        assert_eq!(q.metrics().overflow_rejections, 2);
    }

    #[test]
    fn test_has_releasable() {
        let (mut q, clock) = queue_with(10);
        q.enqueue(req(1, SpawnPriority::High, &clock)).unwrap();
        assert!(!q.has_releasable(SpawnPriority::Critical));
        assert!(q.has_releasable(SpawnPriority::High));
        assert!(q.has_releasable(SpawnPriority::Low));
    }

    #[test]
    fn test_dwell_time_recorded() {
        let (mut q, clock) = queue_with(10);
        q.enqueue(req(1, SpawnPriority::Normal, &clock)).unwrap();
        clock.advance_ms(40);
        assert_eq!(q.metrics().oldest_age_ms, 40);
        q.dequeue_highest().unwrap();
        let metrics = q.metrics();
        assert!((metrics.avg_dwell_ms - 40.0).abs() < 0.5);
        assert_eq!(metrics.oldest_age_ms, 0);
    }

    #[test]
    fn test_clear_returns_entries() {
        let (mut q, clock) = queue_with(10);
        q.enqueue(char_req(1, 5, SpawnPriority::Normal, &clock)).unwrap();
        q.enqueue(req(2, SpawnPriority::Low, &clock)).unwrap();
        let drained = q.clear();
        assert_eq!(drained.len(), 2);
        assert!(q.is_empty());
        assert!(!q.contains(5));
        assert_eq!(q.size_by_priority(SpawnPriority::Normal), 0);
    }
}
