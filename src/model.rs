//! The configured (input) data model: platform, resources, and task graphs.
//! Everything here is produced by an external validator (spec §1, §7) and
//! treated as read-only by the engine. Mirrors the shape of
//! `bpmn-lite-core::types` — small newtype ids, enum-of-variants payload
//! types, `Serialize`/`Deserialize` on every wire type.

use serde::{Deserialize, Serialize};

use crate::arrivals::ArrivalSpec;
use crate::priority::Priority;

macro_rules! newtype_id {
    ($name:ident) => {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u32);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

newtype_id!(ProcTypeId);
newtype_id!(CoreId);
newtype_id!(ResourceId);
newtype_id!(TaskId);
newtype_id!(SubtaskId);
newtype_id!(SegmentId);

/// The input document's version tag (spec §6). Checked, not enforced, by
/// this crate — a mismatched version is a validator concern.
pub const SUPPORTED_MODEL_VERSION: &str = "0.2";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessorType {
    pub id: ProcTypeId,
    pub name: String,
    pub core_count: u32,
    /// Family-wide speed factor, > 0.
    pub family_speed: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Core {
    pub id: CoreId,
    pub type_id: ProcTypeId,
    /// Per-core speed factor, > 0.
    pub speed_factor: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Platform {
    pub processor_types: Vec<ProcessorType>,
    pub cores: Vec<Core>,
}

impl Platform {
    pub fn core(&self, id: CoreId) -> Option<&Core> {
        self.cores.iter().find(|c| c.id == id)
    }

    pub fn processor_type(&self, id: ProcTypeId) -> Option<&ProcessorType> {
        self.processor_types.iter().find(|t| t.id == id)
    }

    /// Product of family and per-core speed factors (spec §3).
    pub fn effective_speed(&self, core: CoreId) -> Option<f64> {
        let core = self.core(core)?;
        let ptype = self.processor_type(core.type_id)?;
        Some(ptype.family_speed * core.speed_factor)
    }

    pub fn is_multi_core(&self) -> bool {
        self.cores.len() > 1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Mutex,
    Pip,
    Pcp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    pub bound_core_id: CoreId,
    pub protocol: Protocol,
    /// Static ceiling (spec §3): "the highest static priority of any task
    /// that could ever request it". Meaningful only for `Protocol::Pcp`
    /// under Rate-Monotonic. Under EDF a static ceiling has no valid value
    /// (the ceiling must be the live minimum absolute deadline, recomputed
    /// per release) so `Engine::build` rejects any `Pcp` resource that
    /// declares one while the configured scheduler is EDF
    /// (`BuildError::StaticCeilingUnderEdf`) rather than silently ignoring it.
    pub declared_ceiling: Option<Priority>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    TimeDeterministic,
    DynamicRt,
    NonRt,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    /// 1-based index, monotone within its subtask.
    pub index: u32,
    pub wcet: f64,
    pub acet: Option<f64>,
    pub resources: Vec<ResourceId>,
    pub mapping_hint: Option<CoreId>,
    pub preemptible: bool,
    /// Explicit release offset, only meaningful for `TaskKind::TimeDeterministic`.
    pub release_offset: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub predecessors: Vec<SubtaskId>,
    pub successors: Vec<SubtaskId>,
    pub mapping_hint: Option<CoreId>,
    /// Non-empty, ordered.
    pub segments: Vec<Segment>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskGraph {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    pub period: Option<f64>,
    pub deadline: Option<f64>,
    pub phase: Option<f64>,
    pub arrival: Option<ArrivalSpec>,
    pub abort_on_miss: bool,
    pub mapping_hint: Option<CoreId>,
    /// Non-empty.
    pub subtasks: Vec<Subtask>,
}

impl TaskGraph {
    pub fn subtask(&self, id: SubtaskId) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    pub fn root_subtasks(&self) -> impl Iterator<Item = &Subtask> {
        self.subtasks.iter().filter(|s| s.predecessors.is_empty())
    }
}

/// Three-level mapping-hint fallback (spec §3): segment -> subtask -> task.
pub fn resolve_mapping_hint(
    task: &TaskGraph,
    subtask: &Subtask,
    segment: &Segment,
) -> Option<CoreId> {
    segment
        .mapping_hint
        .or(subtask.mapping_hint)
        .or(task.mapping_hint)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimParams {
    pub duration: f64,
    pub seed: i64,
}

/// The validated input document (spec §6): platform, resources, tasks, and
/// simulation parameters. Scheduler choice and engine configuration are a
/// separate `EngineConfig` (see `crate::engine`), since they are build-time
/// (not model) concerns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Model {
    pub version: String,
    pub platform: Platform,
    pub resources: Vec<Resource>,
    pub tasks: Vec<TaskGraph>,
    pub sim: SimParams,
}

impl Model {
    pub fn resource(&self, id: ResourceId) -> Option<&Resource> {
        self.resources.iter().find(|r| r.id == id)
    }

    pub fn task(&self, id: TaskId) -> Option<&TaskGraph> {
        self.tasks.iter().find(|t| t.id == id)
    }
}
