use thiserror::Error;

use crate::model::{CoreId, ResourceId, SegmentId};

/// Errors that halt `Engine::build` / `Engine::reset`. No partial engine
/// state is returned when any of these fire — the caller gets a fresh
/// `Err` and the previous engine (if any) is untouched.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("resource {resource:?} is bound to core {core:?}, which does not exist on the platform")]
    DanglingResourceCore {
        resource: ResourceId,
        core: CoreId,
    },

    #[error("arrival generator id `{0}` is not registered")]
    UnknownArrivalGenerator(String),

    #[error("ETM table references segment {segment:?} on core {core:?}, but {what} does not exist")]
    DanglingEtmEntry {
        segment: SegmentId,
        core: CoreId,
        what: &'static str,
    },

    #[error("sim.duration must be > 0, got {0}")]
    NonPositiveDuration(f64),

    #[error("platform declares zero cores")]
    EmptyPlatform,

    #[error("subtask DAG of task {0:?} contains a cycle")]
    CyclicSubtaskGraph(crate::model::TaskId),

    #[error("segment {segment:?} of task {task:?} has no mapping hint and the platform has more than one core")]
    UnmappableSegment {
        task: crate::model::TaskId,
        segment: SegmentId,
    },

    #[error("resource {resource:?} declares a static ceiling but the scheduler is EDF, where ceilings must be the live minimum absolute deadline, not a static value (spec §4.4)")]
    StaticCeilingUnderEdf { resource: ResourceId },
}

impl BuildError {
    /// CLI exit-code family this error belongs to (spec §7): model/config errors -> 1.
    pub fn code(&self) -> &'static str {
        "model_or_config_error"
    }
}

/// Errors returned from `Engine::run` / `Engine::step`. Every other runtime
/// condition (deadline miss, block, preemption, migration, abort) is an
/// `Event`, never an `Err` — this enum exists only for conditions that are
/// fatal invariant violations per spec §7.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("resource {0:?} is held by segment {1:?}, which has no corresponding job/segment state")]
    ResourceHeldByGhost(ResourceId, SegmentId),

    #[error("segment {0:?} of job {1} has negative remaining work ({2})")]
    NegativeRemainingWork(SegmentId, uuid::Uuid, f64),

    #[error("PCP system ceiling stack underflow on core {0:?}")]
    CeilingStackUnderflow(CoreId),

    #[error("attempted to schedule job {0}, which is already aborted")]
    SchedulingAbortedJob(uuid::Uuid),

    #[error("engine is not in a runnable state (call build() first)")]
    NotBuilt,
}

impl RuntimeError {
    /// CLI exit-code family this error belongs to (spec §7): runtime invariant violation -> 2.
    pub fn code(&self) -> &'static str {
        "runtime_invariant_violation"
    }
}
