//! Event Bus (C1, spec §4.1). `EventBus` is owned by the caller and passed
//! by `&mut` reference into every `Engine` method that can emit events —
//! never stored inside `Engine` itself. This is the direct fix for the
//! regression described in spec §9 ("Event bus with persistent
//! subscribers"): since the engine never holds the bus, a rebuild cannot
//! possibly drop a subscriber. Grounded on `bpmn-lite-core::events`'s
//! `RuntimeEvent` enum (an append-only, fully-`Serialize`d audit trail),
//! restructured so the log and its subscribers live outside the component
//! that produces them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{CoreId, ResourceId, SegmentId, SubtaskId, TaskId};
use crate::priority::Priority;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreemptKind {
    /// A higher-priority ready segment displaced a running one (scheduler policy).
    Scheduler,
    /// A job was torn down mid-execution after `abort_on_miss` (spec §4.5).
    Forced,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EventKind {
    JobRelease {
        job_id: Uuid,
        task_id: TaskId,
    },
    SubtaskReady {
        job_id: Uuid,
        subtask_id: SubtaskId,
    },
    SegmentStart {
        job_id: Uuid,
        segment_id: SegmentId,
        core_id: CoreId,
    },
    SegmentEnd {
        job_id: Uuid,
        segment_id: SegmentId,
        core_id: CoreId,
    },
    SegmentBlocked {
        job_id: Uuid,
        segment_id: SegmentId,
        resource_id: ResourceId,
    },
    SegmentUnblocked {
        job_id: Uuid,
        segment_id: SegmentId,
        resource_id: ResourceId,
    },
    Preempt {
        job_id: Uuid,
        segment_id: SegmentId,
        core_id: CoreId,
        kind: PreemptKind,
    },
    Migration {
        job_id: Uuid,
        segment_id: SegmentId,
        from_core: CoreId,
        to_core: CoreId,
    },
    ResourceAcquire {
        job_id: Uuid,
        segment_id: SegmentId,
        resource_id: ResourceId,
    },
    ResourceRelease {
        job_id: Uuid,
        segment_id: SegmentId,
        resource_id: ResourceId,
    },
    DeadlineMiss {
        job_id: Uuid,
        task_id: TaskId,
    },
    JobComplete {
        job_id: Uuid,
    },
    JobAbort {
        job_id: Uuid,
    },
    PriorityRaise {
        job_id: Uuid,
        segment_id: SegmentId,
        due_to_job: Uuid,
        due_to_segment: SegmentId,
        new_priority: Priority,
    },
    PriorityRestore {
        job_id: Uuid,
        segment_id: SegmentId,
        new_priority: Priority,
    },
    CeilingPush {
        core_id: CoreId,
        resource_id: ResourceId,
        ceiling: Priority,
    },
    CeilingPop {
        core_id: CoreId,
        resource_id: ResourceId,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::JobRelease { .. } => "JobRelease",
            EventKind::SubtaskReady { .. } => "SubtaskReady",
            EventKind::SegmentStart { .. } => "SegmentStart",
            EventKind::SegmentEnd { .. } => "SegmentEnd",
            EventKind::SegmentBlocked { .. } => "SegmentBlocked",
            EventKind::SegmentUnblocked { .. } => "SegmentUnblocked",
            EventKind::Preempt { .. } => "Preempt",
            EventKind::Migration { .. } => "Migration",
            EventKind::ResourceAcquire { .. } => "ResourceAcquire",
            EventKind::ResourceRelease { .. } => "ResourceRelease",
            EventKind::DeadlineMiss { .. } => "DeadlineMiss",
            EventKind::JobComplete { .. } => "JobComplete",
            EventKind::JobAbort { .. } => "JobAbort",
            EventKind::PriorityRaise { .. } => "PriorityRaise",
            EventKind::PriorityRestore { .. } => "PriorityRestore",
            EventKind::CeilingPush { .. } => "CeilingPush",
            EventKind::CeilingPop { .. } => "CeilingPop",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventIdMode {
    /// id = monotonic sequence (default).
    Deterministic,
    /// id = hash(seq, run_seed).
    SeededRandom,
    /// id = ephemeral UUID.
    Random,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub id: String,
    pub time: f64,
    pub kind: EventKind,
}

/// Implemented by anything that wants to observe events as they are
/// published. Subscribers are attached to the `EventBus`, never to the
/// `Engine` — see module docs.
pub trait EventSubscriber {
    fn on_event(&mut self, event: &Event);
}

/// Caller-owned event bus: the single source of truth for the trace (spec
/// §5) plus a persistent subscriber list. `Engine::build`/`reset` never
/// touch `subscribers`.
pub struct EventBus {
    seq: u64,
    id_mode: EventIdMode,
    run_seed: i64,
    trace: Vec<Event>,
    subscribers: Vec<Box<dyn EventSubscriber>>,
}

impl EventBus {
    pub fn new(id_mode: EventIdMode, run_seed: i64) -> Self {
        Self {
            seq: 0,
            id_mode,
            run_seed,
            trace: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    /// Attach a subscriber. Persists across any number of `Engine::build`/
    /// `reset` calls against this bus.
    pub fn subscribe(&mut self, subscriber: Box<dyn EventSubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn trace(&self) -> &[Event] {
        &self.trace
    }

    /// Clears the trace and sequence counter, but *not* the subscriber
    /// list — used by `Engine::build`/`reset` to start a fresh run on a
    /// bus that may have been used for a previous run.
    pub fn clear_trace(&mut self) {
        self.seq = 0;
        self.trace.clear();
    }

    pub(crate) fn publish(&mut self, time: f64, kind: EventKind) {
        let seq = self.seq;
        self.seq += 1;
        let id = match self.id_mode {
            EventIdMode::Deterministic => seq.to_string(),
            EventIdMode::SeededRandom => {
                use sha2::{Digest, Sha256};
                let mut hasher = Sha256::new();
                hasher.update(seq.to_le_bytes());
                hasher.update(self.run_seed.to_le_bytes());
                let digest = hasher.finalize();
                hex_prefix(&digest, 16)
            }
            EventIdMode::Random => Uuid::new_v4().to_string(),
        };
        let event = Event { seq, id, time, kind };
        for s in self.subscribers.iter_mut() {
            s.on_event(&event);
        }
        self.trace.push(event);
    }
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes
        .iter()
        .take(n)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// An in-memory subscriber that just collects events, useful for tests and
/// for a caller that wants a second independent view alongside the bus's
/// own trace.
#[derive(Default)]
pub struct RecordingSubscriber {
    pub events: Vec<Event>,
}

impl EventSubscriber for RecordingSubscriber {
    fn on_event(&mut self, event: &Event) {
        self.events.push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_survive_trace_clear() {
        let mut bus = EventBus::new(EventIdMode::Deterministic, 1);
        bus.subscribe(Box::new(RecordingSubscriber::default()));
        bus.publish(0.0, EventKind::JobComplete { job_id: Uuid::nil() });
        bus.clear_trace();
        bus.publish(1.0, EventKind::JobComplete { job_id: Uuid::nil() });
        assert_eq!(bus.trace().len(), 1);
        assert_eq!(bus.subscribers.len(), 1);
    }

    #[test]
    fn deterministic_ids_are_the_sequence() {
        let mut bus = EventBus::new(EventIdMode::Deterministic, 1);
        bus.publish(0.0, EventKind::JobComplete { job_id: Uuid::nil() });
        bus.publish(0.0, EventKind::JobComplete { job_id: Uuid::nil() });
        assert_eq!(bus.trace()[0].id, "0");
        assert_eq!(bus.trace()[1].id, "1");
    }
}
