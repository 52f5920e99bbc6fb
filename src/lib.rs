//! Discrete-event simulation engine for real-time scheduling on
//! heterogeneous multi-core platforms (spec §1). Consumes a validated
//! `Model` (platform, resources, task graphs), drives a `Engine` forward
//! in discrete steps through an `EventBus`, and exposes `metrics::compute`
//! / `audit::audit` as free functions over the resulting trace.
//!
//! Module layout mirrors the component table: `events` (C1), `arrivals`
//! (C2), `etm` (C3), `protocol` (C4), `scheduler` (C5), `engine` (C6),
//! `metrics`/`audit` (C7), with `model`, `priority`, `rng`, and `error` as
//! shared foundations. Grounded on `bpmn-lite-core::lib`'s curated
//! re-export block rather than a blanket `pub use module::*`.

pub mod arrivals;
pub mod audit;
pub mod engine;
pub mod error;
pub mod etm;
pub mod events;
pub mod metrics;
pub mod model;
pub mod priority;
pub mod protocol;
pub mod rng;
pub mod scheduler;

pub use arrivals::{ArrivalProcess, ArrivalSpec, GeneratorRegistry};
pub use engine::{Engine, EngineConfig, StepOutcome};
pub use error::{BuildError, RuntimeError};
pub use etm::Etm;
pub use events::{Event, EventBus, EventIdMode, EventKind, EventSubscriber, PreemptKind, RecordingSubscriber};
pub use metrics::Metrics;
pub use audit::{AuditReport, RuleReport, RuleStatus};
pub use model::{
    Core, CoreId, Model, Platform, ProcTypeId, ProcessorType, Protocol, Resource, ResourceId,
    Segment, SegmentId, SimParams, Subtask, SubtaskId, TaskGraph, TaskId, TaskKind,
    SUPPORTED_MODEL_VERSION,
};
pub use priority::{Priority, PriorityDomain};
pub use protocol::ResourceAcquirePolicy;
pub use scheduler::{SchedulerConfig, SchedulerKind, TieBreaker};
