//! Spawn pipeline event bus
//!
//! Typed pub/sub over a bounded priority queue. Events are delivered in batches
//! from the tick thread; same-priority events keep publish order.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, trace, warn};
use uuid::Uuid;

use super::error::SpawnErrorKind;
use super::request::{AccountId, BotId, CharacterId, RequestId, SpawnPriority, ZoneId};
use crate::config::EventBusConfig;
use crate::util::SharedClock;

/// Non-terminal events at or below this priority are shed first under load
const LOW_PRIORITY_FLOOR: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    SpawnRequested,
    CharacterSelected,
    SessionCreated,
    SpawnCompleted,
    SpawnFailed,
    PopulationChanged,
    PerformanceAlert,
}

impl EventType {
    /// Lower is more urgent
    pub fn priority(self) -> u8 {
        match self {
            EventType::PerformanceAlert => 1,
            EventType::SpawnFailed => 2,
            EventType::SpawnRequested => 3,
            EventType::CharacterSelected => 4,
            EventType::SessionCreated => 5,
            EventType::SpawnCompleted => 6,
            EventType::PopulationChanged => 7,
        }
    }

    /// Concludes a request; never shed
    pub fn is_terminal(self) -> bool {
        matches!(self, EventType::SpawnCompleted | EventType::SpawnFailed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventPayload {
    SpawnRequested {
        request_id: RequestId,
        zone_id: ZoneId,
        priority: SpawnPriority,
        reason: String,
    },
    CharacterSelected {
        request_id: RequestId,
        character_id: CharacterId,
        account_id: AccountId,
    },
    SessionCreated {
        request_id: RequestId,
        character_id: CharacterId,
        session_id: Uuid,
    },
    SpawnCompleted {
        request_id: RequestId,
        bot_id: BotId,
        zone_id: ZoneId,
        success: bool,
    },
    SpawnFailed {
        request_id: RequestId,
        kind: SpawnErrorKind,
        reason: String,
    },
    PopulationChanged {
        zone_id: ZoneId,
        bot_count: u32,
        target_bot_count: u32,
    },
    PerformanceAlert {
        status: String,
        message: String,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::SpawnRequested { .. } => EventType::SpawnRequested,
            EventPayload::CharacterSelected { .. } => EventType::CharacterSelected,
            EventPayload::SessionCreated { .. } => EventType::SessionCreated,
            EventPayload::SpawnCompleted { .. } => EventType::SpawnCompleted,
            EventPayload::SpawnFailed { .. } => EventType::SpawnFailed,
            EventPayload::PopulationChanged { .. } => EventType::PopulationChanged,
            EventPayload::PerformanceAlert { .. } => EventType::PerformanceAlert,
        }
    }

    /// Request the event belongs to, for pipeline stage events
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            EventPayload::SpawnRequested { request_id, .. }
            | EventPayload::CharacterSelected { request_id, .. }
            | EventPayload::SessionCreated { request_id, .. }
            | EventPayload::SpawnCompleted { request_id, .. }
            | EventPayload::SpawnFailed { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: u64,
    #[serde(skip)]
    pub timestamp: Option<Instant>,
    pub published_at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn priority(&self) -> u8 {
        self.event_type().priority()
    }
}

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;
pub type HandlerId = u64;

#[derive(Debug, Clone, Default, Serialize)]
pub struct EventBusMetrics {
    pub published: u64,
    pub processed: u64,
    pub dropped: u64,
    pub handler_failures: u64,
    pub total_handler_time_us: u64,
    pub queued: usize,
}

/// Result of one `process_batch` call
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchReport {
    pub processed: usize,
    pub handler_time: Duration,
    pub handler_failures: usize,
}

#[derive(Default)]
struct Subscribers {
    by_type: FxHashMap<EventType, SmallVec<[(HandlerId, EventHandler); 4]>>,
    global: Vec<(HandlerId, EventHandler)>,
}

pub struct EventBus {
    config: EventBusConfig,
    clock: SharedClock,
    next_event_id: AtomicU64,
    next_handler_id: AtomicU64,
    queue: Mutex<BTreeMap<(u8, u64), Event>>,
    subscribers: RwLock<Subscribers>,
    published: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
    handler_time_us: AtomicU64,
}

impl EventBus {
    pub fn new(config: EventBusConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            next_event_id: AtomicU64::new(1),
            next_handler_id: AtomicU64::new(1),
            queue: Mutex::new(BTreeMap::new()),
            subscribers: RwLock::new(Subscribers::default()),
            published: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            handler_time_us: AtomicU64::new(0),
        }
    }

    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .by_type
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn subscribe_all<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().global.push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, handler_id: HandlerId) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.global.len() + subs.by_type.values().map(|h| h.len()).sum::<usize>();
        subs.global.retain(|(id, _)| *id != handler_id);
        for handlers in subs.by_type.values_mut() {
            handlers.retain(|(id, _)| *id != handler_id);
        }
        let after = subs.global.len() + subs.by_type.values().map(|h| h.len()).sum::<usize>();
        before != after
    }

    /// Queue an event. Returns its id, or `None` if overflow shed it.
    pub fn publish(&self, payload: EventPayload) -> Option<u64> {
        let event_type = payload.event_type();
        let priority = event_type.priority();
        let terminal = event_type.is_terminal();
        let max = self.config.max_queue_size.max(1);
        let mut queue = self.queue.lock();

        if !terminal && priority >= LOW_PRIORITY_FLOOR && queue.len() * 10 >= max * 9 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Event bus near capacity, shedding {:?}", event_type);
            return None;
        }

        if queue.len() >= max {
            let victim = queue
                .iter()
                .rev()
                .find(|(key, queued)| {
                    !queued.event_type().is_terminal() && (terminal || key.0 > priority)
                })
                .map(|(key, _)| *key);
            match victim {
                Some(key) => {
                    queue.remove(&key);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                // terminal events may overrun the cap
                None if terminal => {
                    trace!("Event bus full, admitting {:?} over capacity", event_type);
                }
                None => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("Event bus full, dropping {:?}", event_type);
                    return None;
                }
            }
        }

        let id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        queue.insert(
            (priority, id),
            Event {
                id,
                timestamp: Some(self.clock.now()),
                published_at: Utc::now(),
                payload,
            },
        );
        self.published.fetch_add(1, Ordering::Relaxed);
        Some(id)
    }

    /// Deliver up to `batch_size` events, most urgent first
    pub fn process_batch(&self) -> BatchReport {
        let batch: Vec<Event> = {
            let mut queue = self.queue.lock();
            let mut batch = Vec::with_capacity(self.config.batch_size.min(queue.len()));
            while batch.len() < self.config.batch_size {
                match queue.pop_first() {
                    Some((_, event)) => batch.push(event),
                    None => break,
                }
            }
            batch
        };

        let mut report = BatchReport::default();
        for event in &batch {
            let handlers: SmallVec<[EventHandler; 8]> = {
                let subs = self.subscribers.read();
                subs.by_type
                    .get(&event.event_type())
                    .into_iter()
                    .flatten()
                    .chain(subs.global.iter())
                    .map(|(_, h)| h.clone())
                    .collect()
            };

            let started = Instant::now();
            for handler in handlers {
                if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                    report.handler_failures += 1;
                    error!(
                        "Event handler panicked on {:?} (event {})",
                        event.event_type(),
                        event.id
                    );
                }
            }
            report.handler_time += started.elapsed();
            report.processed += 1;
        }

        self.processed.fetch_add(report.processed as u64, Ordering::Relaxed);
        self.handler_failures
            .fetch_add(report.handler_failures as u64, Ordering::Relaxed);
        self.handler_time_us
            .fetch_add(report.handler_time.as_micros() as u64, Ordering::Relaxed);
        report
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn metrics(&self) -> EventBusMetrics {
        EventBusMetrics {
            published: self.published.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            total_handler_time_us: self.handler_time_us.load(Ordering::Relaxed),
            queued: self.queued(),
        }
    }
}
