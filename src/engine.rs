//! Simulation Engine (C6, spec §4.6) — the time-advancing main loop, job and
//! segment state machines, mapping resolution, and deadline enforcement.
//! Grounded on `bpmn-lite-core::engine`'s `Engine::tick`/`run_to_completion`
//! shape (owns a `Vm`-equivalent job table, drives it forward in discrete
//! steps, and is itself `Clone`-free, rebuilt wholesale on `reset`), adapted
//! from BPMN token-passing to real-time job/segment scheduling.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::arrivals::{ArrivalGenerator, GeneratorRegistry};
use crate::error::{BuildError, RuntimeError};
use crate::etm::Etm;
use crate::events::{EventBus, EventIdMode, EventKind, PreemptKind};
use crate::model::{
    CoreId, Model, Platform, Resource, ResourceId, SegmentId, SubtaskId, TaskGraph, TaskId,
};
use crate::priority::{Priority, PriorityDomain};
use crate::protocol::{AcquireOutcome, ResourceAcquirePolicy, ResourceManager};
use crate::scheduler::{Candidate, SchedulerConfig, SelectDecision};

/// The §6 "Configuration parameters the engine recognizes" block, typed.
/// `event_id_mode` is carried here for documentation and for a caller that
/// wants to construct its `EventBus` from one place, but the bus itself
/// (not this struct) is what actually applies it — see `crate::events`.
#[derive(Clone)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub resource_acquire_policy: ResourceAcquirePolicy,
    pub etm: Etm,
    pub event_id_mode: EventIdMode,
    pub generators: GeneratorRegistry,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JobStatus {
    Running,
    Completed,
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubtaskState {
    NotReady,
    Ready,
    Done,
}

struct Job {
    id: Uuid,
    task_id: TaskId,
    release_time: f64,
    absolute_deadline: f64,
    priority: Priority,
    abort_on_miss: bool,
    status: JobStatus,
    deadline_miss_emitted: bool,
    subtask_state: HashMap<SubtaskId, SubtaskState>,
    pred_remaining: HashMap<SubtaskId, usize>,
    next_segment_idx: HashMap<SubtaskId, usize>,
    ready_since: HashMap<SubtaskId, f64>,
    remaining_nominal: HashMap<SegmentId, f64>,
    blocked_on: HashMap<SegmentId, ResourceId>,
    partial_acquire: HashMap<SegmentId, usize>,
    held: Vec<(ResourceId, SegmentId)>,
    last_core: Option<CoreId>,
}

impl Job {
    fn is_active(&self) -> bool {
        self.status == JobStatus::Running
    }
}

struct SegmentMeta {
    subtask: SubtaskId,
    index: u32,
    wcet: f64,
    resources: Vec<ResourceId>,
    preemptible: bool,
    core: CoreId,
}

/// Everything derived once from a `TaskGraph` at build time: the subtask DAG
/// (validated acyclic via `petgraph::algo::toposort`, mirroring the
/// teacher's use of `petgraph` for BPMN process graphs), per-subtask ordered
/// segment lists, and each segment's resolved core.
struct TaskRuntime {
    kind: crate::model::TaskKind,
    period: Option<f64>,
    deadline: Option<f64>,
    phase: f64,
    abort_on_miss: bool,
    root_subtasks: Vec<SubtaskId>,
    predecessors: HashMap<SubtaskId, Vec<SubtaskId>>,
    successors: HashMap<SubtaskId, Vec<SubtaskId>>,
    segments_of: HashMap<SubtaskId, Vec<SegmentId>>,
    segment_meta: HashMap<SegmentId, SegmentMeta>,
}

fn build_task_runtime(task: &TaskGraph, platform: &Platform) -> Result<TaskRuntime, BuildError> {
    let mut graph = DiGraph::<SubtaskId, ()>::new();
    let mut node_of = HashMap::new();
    for st in &task.subtasks {
        node_of.insert(st.id, graph.add_node(st.id));
    }
    for st in &task.subtasks {
        for pred in &st.predecessors {
            if let (Some(&p), Some(&c)) = (node_of.get(pred), node_of.get(&st.id)) {
                graph.add_edge(p, c, ());
            }
        }
    }
    toposort(&graph, None).map_err(|_| BuildError::CyclicSubtaskGraph(task.id))?;

    let mut predecessors = HashMap::new();
    let mut successors = HashMap::new();
    let mut segments_of = HashMap::new();
    let mut segment_meta = HashMap::new();

    for st in &task.subtasks {
        predecessors.insert(st.id, st.predecessors.clone());
        successors.insert(st.id, st.successors.clone());
        let mut ids = Vec::with_capacity(st.segments.len());
        for seg in &st.segments {
            let core = crate::model::resolve_mapping_hint(task, st, seg).or_else(|| {
                if platform.cores.len() == 1 {
                    Some(platform.cores[0].id)
                } else {
                    None
                }
            });
            let core = core.ok_or(BuildError::UnmappableSegment {
                task: task.id,
                segment: seg.id,
            })?;
            segment_meta.insert(
                seg.id,
                SegmentMeta {
                    subtask: st.id,
                    index: seg.index,
                    wcet: seg.wcet,
                    resources: seg.resources.clone(),
                    preemptible: seg.preemptible,
                    core,
                },
            );
            ids.push(seg.id);
        }
        segments_of.insert(st.id, ids);
    }

    let root_subtasks = task.root_subtasks().map(|s| s.id).collect();

    Ok(TaskRuntime {
        kind: task.kind,
        period: task.period,
        deadline: task.deadline,
        phase: task.phase.unwrap_or(0.0),
        abort_on_miss: task.abort_on_miss,
        root_subtasks,
        predecessors,
        successors,
        segments_of,
        segment_meta,
    })
}

struct Occupant {
    job_id: Uuid,
    segment_id: SegmentId,
    started_at: f64,
    planned_end: f64,
}

struct ArrivalState {
    generator: ArrivalGenerator,
    cached_next: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StepOutcome {
    /// The engine advanced to the given simulated time and applied its events.
    Advanced { time: f64 },
    /// Nothing left to schedule before `sim.duration`.
    Finished,
}

/// Owns all runtime state: jobs, per-core occupancy, resource holders, and
/// arrival-generator cursors (spec §3 "Ownership"). The scheduler, ETM, and
/// protocol components are stateless strategies invoked here; any state they
/// carry for the run (e.g. PCP's ceiling stack) lives inside `ResourceManager`
/// and is recreated wholesale on `reset`.
pub struct Engine {
    model: Model,
    config: EngineConfig,
    task_runtimes: HashMap<TaskId, TaskRuntime>,
    resources_by_id: HashMap<ResourceId, Resource>,
    resource_mgr: ResourceManager,
    jobs: HashMap<Uuid, Job>,
    cores: HashMap<CoreId, Option<Occupant>>,
    arrivals: HashMap<TaskId, ArrivalState>,
    now: f64,
    paused: bool,
    stopped: bool,
}

impl Engine {
    pub fn build(model: &Model, config: EngineConfig, bus: &mut EventBus) -> Result<Engine, BuildError> {
        if model.platform.cores.is_empty() {
            return Err(BuildError::EmptyPlatform);
        }
        if model.sim.duration <= 0.0 {
            return Err(BuildError::NonPositiveDuration(model.sim.duration));
        }
        for r in &model.resources {
            if model.platform.core(r.bound_core_id).is_none() {
                return Err(BuildError::DanglingResourceCore {
                    resource: r.id,
                    core: r.bound_core_id,
                });
            }
            if r.protocol == crate::model::Protocol::Pcp
                && r.declared_ceiling.is_some()
                && config.scheduler.kind == crate::scheduler::SchedulerKind::Edf
            {
                return Err(BuildError::StaticCeilingUnderEdf { resource: r.id });
            }
        }

        let mut task_runtimes = HashMap::new();
        for task in &model.tasks {
            task_runtimes.insert(task.id, build_task_runtime(task, &model.platform)?);
            if let Some(arrival) = &task.arrival {
                if let crate::arrivals::ArrivalProcess::Custom { generator, .. } = &arrival.process
                {
                    if !config.generators.contains(generator) {
                        return Err(BuildError::UnknownArrivalGenerator(generator.clone()));
                    }
                }
            }
        }

        if let Etm::TableBased {
            scale_by_segment_core,
            segment_default,
            ..
        } = &config.etm
        {
            let known_segments: std::collections::HashSet<SegmentId> = task_runtimes
                .values()
                .flat_map(|t| t.segment_meta.keys().copied())
                .collect();
            for (seg, core) in scale_by_segment_core.keys() {
                if !known_segments.contains(seg) {
                    return Err(BuildError::DanglingEtmEntry {
                        segment: *seg,
                        core: *core,
                        what: "segment",
                    });
                }
                if model.platform.core(*core).is_none() {
                    return Err(BuildError::DanglingEtmEntry {
                        segment: *seg,
                        core: *core,
                        what: "core",
                    });
                }
            }
            for seg in segment_default.keys() {
                if !known_segments.contains(seg) {
                    return Err(BuildError::DanglingEtmEntry {
                        segment: *seg,
                        core: model.platform.cores[0].id,
                        what: "segment",
                    });
                }
            }
        }

        let resources_by_id = model.resources.iter().map(|r| (r.id, r.clone())).collect();
        let cores = model.platform.cores.iter().map(|c| (c.id, None)).collect();

        let mut arrivals = HashMap::new();
        for task in &model.tasks {
            if let Some(spec) = &task.arrival {
                let phase = task.phase.unwrap_or(0.0);
                let mut gen =
                    ArrivalGenerator::new(spec.clone(), phase, model.sim.seed, &task.id.to_string());
                let cached_next = gen.next(&config.generators);
                arrivals.insert(task.id, ArrivalState { generator: gen, cached_next });
            }
        }

        info!(tasks = model.tasks.len(), cores = model.platform.cores.len(), "engine built");
        let _ = bus; // subscribers live on the caller's bus; build() never touches them.

        let engine = Engine {
            model: model.clone(),
            config,
            task_runtimes,
            resources_by_id,
            resource_mgr: ResourceManager::new(),
            jobs: HashMap::new(),
            cores,
            arrivals,
            now: 0.0,
            paused: false,
            stopped: false,
        };
        Ok(engine)
    }

    /// Rebuilds from the model and config used in the last successful
    /// `build()`. Equivalent to a fresh `build()` of the same inputs (spec
    /// §8: "`build()` followed by `reset()` followed by `build()` yields a
    /// trace identical to a single `build()`").
    pub fn reset(&mut self, bus: &mut EventBus) -> Result<(), BuildError> {
        let model = self.model.clone();
        let config = self.config.clone();
        let rebuilt = Engine::build(&model, config, bus)?;
        *self = rebuilt;
        Ok(())
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Advances until `sim.duration` or no more events remain.
    pub fn run(&mut self, bus: &mut EventBus) -> Result<(), RuntimeError> {
        info!(duration = self.model.sim.duration, "run start");
        while !self.stopped && !self.paused {
            match self.step(bus)? {
                StepOutcome::Advanced { .. } => {}
                StepOutcome::Finished => break,
            }
        }
        info!(now = self.now, "run stop");
        Ok(())
    }

    /// Advances to the next event horizon and applies it atomically, or
    /// returns `Finished` if nothing remains before `sim.duration`.
    pub fn step(&mut self, bus: &mut EventBus) -> Result<StepOutcome, RuntimeError> {
        if self.stopped {
            return Ok(StepOutcome::Finished);
        }
        let Some(horizon) = self.next_horizon() else {
            return Ok(StepOutcome::Finished);
        };
        if horizon > self.model.sim.duration {
            return Ok(StepOutcome::Finished);
        }
        self.now = horizon;
        self.apply_tick(bus)?;
        Ok(StepOutcome::Advanced { time: horizon })
    }

    /// Minimum of: running segments' projected completion, next arrival per
    /// task, nearest unmissed absolute deadline (spec §4.6 step 4).
    fn next_horizon(&self) -> Option<f64> {
        let mut best: Option<f64> = None;
        let mut consider = |t: f64| {
            best = Some(best.map_or(t, |b| b.min(t)));
        };
        for occ in self.cores.values().flatten() {
            consider(occ.planned_end);
        }
        for state in self.arrivals.values() {
            if let Some(t) = state.cached_next {
                consider(t);
            }
        }
        for job in self.jobs.values() {
            if job.is_active() && !job.deadline_miss_emitted {
                consider(job.absolute_deadline);
            }
        }
        best
    }

    fn apply_tick(&mut self, bus: &mut EventBus) -> Result<(), RuntimeError> {
        let now = self.now;
        debug!(time = now, "applying tick");

        // Phase 1: resource releases, via segments completing at `now`.
        let mut finishing: Vec<(CoreId, Uuid, SegmentId)> = self
            .cores
            .iter()
            .filter_map(|(&core, occ)| {
                occ.as_ref()
                    .filter(|o| o.planned_end == now)
                    .map(|o| (core, o.job_id, o.segment_id))
            })
            .collect();
        finishing.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        for (core, job_id, segment_id) in finishing {
            self.complete_segment(core, job_id, segment_id, bus)?;
        }

        // Phase 2: deadline checks. Ties at the same instant break by task
        // id, ascending (DESIGN.md open-question decision 3), not by the
        // (opaque) job id.
        let mut missed: Vec<(TaskId, Uuid)> = self
            .jobs
            .values()
            .filter(|j| j.is_active() && !j.deadline_miss_emitted && j.absolute_deadline <= now)
            .map(|j| (j.task_id, j.id))
            .collect();
        missed.sort();
        for (_, job_id) in missed {
            self.handle_deadline_miss(job_id, bus)?;
        }

        // Phase 3: new releases.
        let mut due_tasks: Vec<TaskId> = self
            .arrivals
            .iter()
            .filter(|(_, s)| s.cached_next == Some(now))
            .map(|(&t, _)| t)
            .collect();
        due_tasks.sort();
        for task_id in due_tasks {
            self.release_job(task_id, now, bus)?;
        }

        // Phase 4 + 5 + 6: scheduler decisions, new starts/preemptions, migrations.
        self.run_scheduler_pass(bus)?;

        Ok(())
    }

    fn release_job(&mut self, task_id: TaskId, now: f64, bus: &mut EventBus) -> Result<(), RuntimeError> {
        let task = self.model.task(task_id).expect("task exists");
        let rt = &self.task_runtimes[&task_id];
        let absolute_deadline = now + rt.deadline.unwrap_or(f64::INFINITY);
        let priority = self.config.scheduler.kind.priority_of(absolute_deadline, rt.period);

        // Deterministic under `sim.seed`: a job id is derived from the run
        // seed plus this task's release sequence number, not OS randomness,
        // since `job_id` is embedded in nearly every event payload and must
        // be reproducible across two runs of the same model/seed.
        let release_seq = self.arrivals[&task_id].generator.released_count();
        let job_id = crate::rng::derive_uuid(self.model.sim.seed, &format!("job|{task_id}|{release_seq}"));
        let mut subtask_state = HashMap::new();
        let mut pred_remaining = HashMap::new();
        let mut ready_since = HashMap::new();
        let mut remaining_nominal = HashMap::new();
        let mut next_segment_idx = HashMap::new();

        for st in &task.subtasks {
            let preds = rt.predecessors.get(&st.id).map(|p| p.len()).unwrap_or(0);
            pred_remaining.insert(st.id, preds);
            subtask_state.insert(st.id, SubtaskState::NotReady);
            next_segment_idx.insert(st.id, 0usize);
            for seg in &st.segments {
                remaining_nominal.insert(seg.id, seg.wcet);
            }
        }

        let job = Job {
            id: job_id,
            task_id,
            release_time: now,
            absolute_deadline,
            priority,
            abort_on_miss: task.abort_on_miss,
            status: JobStatus::Running,
            deadline_miss_emitted: false,
            subtask_state,
            pred_remaining,
            next_segment_idx,
            ready_since,
            remaining_nominal,
            blocked_on: HashMap::new(),
            partial_acquire: HashMap::new(),
            held: Vec::new(),
            last_core: None,
        };
        self.jobs.insert(job_id, job);
        bus.publish(now, EventKind::JobRelease { job_id, task_id });

        for &root in &rt.root_subtasks {
            self.mark_subtask_ready(job_id, root, now, bus);
        }

        // Advance the generator's cursor.
        let state = self.arrivals.get_mut(&task_id).expect("arrival state exists");
        state.cached_next = state.generator.next(&self.config.generators);

        Ok(())
    }

    fn mark_subtask_ready(&mut self, job_id: Uuid, subtask: SubtaskId, now: f64, bus: &mut EventBus) {
        let job = self.jobs.get_mut(&job_id).expect("job exists");
        job.subtask_state.insert(subtask, SubtaskState::Ready);
        job.ready_since.insert(subtask, now);
        bus.publish(now, EventKind::SubtaskReady { job_id, subtask_id: subtask });
    }

    fn complete_segment(
        &mut self,
        core: CoreId,
        job_id: Uuid,
        segment_id: SegmentId,
        bus: &mut EventBus,
    ) -> Result<(), RuntimeError> {
        let now = self.now;
        self.cores.insert(core, None);
        bus.publish(
            now,
            EventKind::SegmentEnd { job_id, segment_id, core_id: core },
        );

        self.release_segment_resources(job_id, segment_id, bus)?;

        let task_id = self.jobs[&job_id].task_id;
        let rt = &self.task_runtimes[&task_id];
        let meta = &rt.segment_meta[&segment_id];
        let subtask = meta.subtask;
        let seg_list = rt.segments_of[&subtask].clone();
        let successors = rt.successors.get(&subtask).cloned().unwrap_or_default();

        let job = self.jobs.get_mut(&job_id).expect("job exists");
        job.remaining_nominal.insert(segment_id, 0.0);
        let idx = job.next_segment_idx.get_mut(&subtask).expect("subtask tracked");
        *idx += 1;
        let subtask_done = *idx >= seg_list.len();
        if subtask_done {
            job.subtask_state.insert(subtask, SubtaskState::Done);
        }

        if subtask_done {
            for succ in successors {
                let remaining = self.jobs.get_mut(&job_id).unwrap().pred_remaining.get_mut(&succ).expect("tracked");
                *remaining -= 1;
                if *remaining == 0 {
                    self.mark_subtask_ready(job_id, succ, now, bus);
                }
            }
            let job = self.jobs.get(&job_id).unwrap();
            let all_done = job.subtask_state.values().all(|s| *s == SubtaskState::Done);
            if all_done {
                let job = self.jobs.get_mut(&job_id).unwrap();
                job.status = JobStatus::Completed;
                bus.publish(now, EventKind::JobComplete { job_id });
                info!(job = %job_id, time = now, "job complete");
            }
        }

        Ok(())
    }

    /// Releases every resource held by `segment_id` of `job_id` (spec §9
    /// "resource-holding abort paths"): the single bottleneck through which
    /// a job's held-resource set can shrink, invoked from both normal
    /// completion and forced abort.
    fn release_segment_resources(
        &mut self,
        job_id: Uuid,
        segment_id: SegmentId,
        bus: &mut EventBus,
    ) -> Result<(), RuntimeError> {
        let now = self.now;
        let claimant = (job_id, segment_id);
        let to_release: Vec<ResourceId> = self.jobs[&job_id]
            .held
            .iter()
            .filter(|(_, s)| *s == segment_id)
            .map(|(r, _)| *r)
            .collect();
        for resource_id in to_release {
            let resource = self.resources_by_id[&resource_id].clone();
            let base_priority = self.jobs[&job_id].priority;
            let result = self.resource_mgr.release(&resource, claimant, base_priority)?;
            bus.publish(
                now,
                EventKind::ResourceRelease { job_id, segment_id, resource_id },
            );
            self.jobs.get_mut(&job_id).unwrap().held.retain(|(r, s)| !(*r == resource_id && *s == segment_id));
            if let Some(pop) = result.ceiling_pop {
                bus.publish(
                    now,
                    EventKind::CeilingPop { core_id: resource.bound_core_id, resource_id },
                );
                let _ = pop;
            }
            if let Some(restore) = result.restore {
                let (owner_job, owner_seg) = restore.owner;
                bus.publish(
                    now,
                    EventKind::PriorityRestore {
                        job_id: owner_job,
                        segment_id: owner_seg,
                        new_priority: restore.new_priority,
                    },
                );
            }
            if let Some(next_claimant) = result.granted_next {
                self.grant_to_waiter(resource_id, next_claimant, result.grant_raise, bus);
            }
        }
        Ok(())
    }

    fn grant_to_waiter(
        &mut self,
        resource_id: ResourceId,
        claimant: (Uuid, SegmentId),
        grant_raise: Option<crate::protocol::PriorityRaiseEffect>,
        bus: &mut EventBus,
    ) {
        let now = self.now;
        let (job_id, segment_id) = claimant;
        bus.publish(
            now,
            EventKind::SegmentUnblocked { job_id, segment_id, resource_id },
        );
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.held.push((resource_id, segment_id));
            job.blocked_on.remove(&segment_id);
            let granted_idx = job.partial_acquire.get(&segment_id).copied().unwrap_or(0) + 1;
            job.partial_acquire.insert(segment_id, granted_idx);
        }
        if let Some(raise) = grant_raise {
            bus.publish(
                now,
                EventKind::PriorityRaise {
                    job_id,
                    segment_id,
                    due_to_job: raise.due_to.0,
                    due_to_segment: raise.due_to.1,
                    new_priority: raise.new_priority,
                },
            );
        }
    }

    fn handle_deadline_miss(&mut self, job_id: Uuid, bus: &mut EventBus) -> Result<(), RuntimeError> {
        let now = self.now;
        let task_id = self.jobs[&job_id].task_id;
        self.jobs.get_mut(&job_id).unwrap().deadline_miss_emitted = true;
        bus.publish(now, EventKind::DeadlineMiss { job_id, task_id });
        warn!(job = %job_id, time = now, "deadline miss");

        if !self.jobs[&job_id].abort_on_miss {
            return Ok(());
        }

        let occupied: Vec<(CoreId, SegmentId)> = self
            .cores
            .iter()
            .filter_map(|(&core, occ)| {
                occ.as_ref().filter(|o| o.job_id == job_id).map(|o| (core, o.segment_id))
            })
            .collect();
        for (core, segment_id) in occupied {
            self.cores.insert(core, None);
            bus.publish(
                now,
                EventKind::Preempt {
                    job_id,
                    segment_id,
                    core_id: core,
                    kind: PreemptKind::Forced,
                },
            );
            self.release_segment_resources(job_id, segment_id, bus)?;
        }
        // Any resources acquired by a not-currently-running segment of this
        // job (e.g. granted while blocked elsewhere) are still released here:
        // sweep every segment that appears in `held`.
        let held_segments: Vec<SegmentId> =
            self.jobs[&job_id].held.iter().map(|(_, s)| *s).collect::<std::collections::HashSet<_>>().into_iter().collect();
        for segment_id in held_segments {
            self.release_segment_resources(job_id, segment_id, bus)?;
        }

        // A segment blocked (not holding) a resource at abort time must be
        // purged from that resource's wait queue, or a later release could
        // still hand it a grant after the job no longer exists.
        let blocked: Vec<SegmentId> = self.jobs[&job_id].blocked_on.keys().copied().collect();
        for segment_id in blocked {
            self.resource_mgr.abandon((job_id, segment_id));
        }
        self.jobs.get_mut(&job_id).unwrap().blocked_on.clear();

        let job = self.jobs.get_mut(&job_id).unwrap();
        job.status = JobStatus::Aborted;
        bus.publish(now, EventKind::JobAbort { job_id });
        info!(job = %job_id, time = now, "job aborted");
        Ok(())
    }

    fn run_scheduler_pass(&mut self, bus: &mut EventBus) -> Result<(), RuntimeError> {
        let mut core_ids: Vec<CoreId> = self.cores.keys().copied().collect();
        core_ids.sort();
        for core in core_ids {
            self.schedule_core(core, bus)?;
        }
        Ok(())
    }

    fn schedule_core(&mut self, core: CoreId, bus: &mut EventBus) -> Result<(), RuntimeError> {
        let now = self.now;
        let occupant_candidate = self.cores[&core].as_ref().map(|occ| Candidate {
            job_id: occ.job_id,
            task_id: self.jobs[&occ.job_id].task_id,
            segment_id: occ.segment_id,
            priority: self
                .resource_mgr
                .effective_priority((occ.job_id, occ.segment_id), self.jobs[&occ.job_id].priority),
            ready_time: self.jobs[&occ.job_id]
                .ready_since
                .get(&self.task_runtimes[&self.jobs[&occ.job_id].task_id].segment_meta[&occ.segment_id].subtask)
                .copied()
                .unwrap_or(self.jobs[&occ.job_id].release_time),
            release_time: self.jobs[&occ.job_id].release_time,
            preemptible: self.task_runtimes[&self.jobs[&occ.job_id].task_id].segment_meta[&occ.segment_id]
                .preemptible,
        });

        let mut ready: Vec<Candidate> = Vec::new();
        for job in self.jobs.values() {
            if !job.is_active() {
                continue;
            }
            let rt = &self.task_runtimes[&job.task_id];
            for (&subtask, &state) in job.subtask_state.iter() {
                if state != SubtaskState::Ready {
                    continue;
                }
                let idx = job.next_segment_idx[&subtask];
                let seg_list = &rt.segments_of[&subtask];
                if idx >= seg_list.len() {
                    continue;
                }
                let segment_id = seg_list[idx];
                let meta = &rt.segment_meta[&segment_id];
                if meta.core != core {
                    continue;
                }
                if job.blocked_on.contains_key(&segment_id) {
                    continue;
                }
                ready.push(Candidate {
                    job_id: job.id,
                    task_id: job.task_id,
                    segment_id,
                    priority: self
                        .resource_mgr
                        .effective_priority((job.id, segment_id), job.priority),
                    ready_time: job.ready_since.get(&subtask).copied().unwrap_or(job.release_time),
                    release_time: job.release_time,
                    preemptible: meta.preemptible,
                });
            }
        }

        let decision = self.config.scheduler.select(&ready, occupant_candidate.as_ref());
        match decision {
            SelectDecision::Idle | SelectDecision::Keep(_) => Ok(()),
            SelectDecision::Start(c) => self.try_start(core, c, bus),
            SelectDecision::Preempt { incoming, outgoing } => {
                self.cores.insert(core, None);
                bus.publish(
                    now,
                    EventKind::Preempt {
                        job_id: outgoing.job_id,
                        segment_id: outgoing.segment_id,
                        core_id: core,
                        kind: PreemptKind::Scheduler,
                    },
                );
                self.pause_segment_progress(outgoing.job_id, outgoing.segment_id, core);
                self.try_start(core, incoming, bus)
            }
        }
    }

    /// Proportionally reduces remaining nominal work for a segment taken off
    /// a core before completion (preemption), so a later resume — possibly
    /// on a different core — rescales correctly (spec §4.6 "Heterogeneous
    /// execution").
    fn pause_segment_progress(&mut self, job_id: Uuid, segment_id: SegmentId, core: CoreId) {
        let occ = match &self.cores.get(&core) {
            Some(Some(o)) if o.job_id == job_id && o.segment_id == segment_id => o,
            _ => return,
        };
        let elapsed = self.now - occ.started_at;
        let total = occ.planned_end - occ.started_at;
        let job = self.jobs.get_mut(&job_id).unwrap();
        if total > 0.0 {
            let remaining = job.remaining_nominal.get_mut(&segment_id).unwrap();
            let fraction_left = (1.0 - elapsed / total).max(0.0);
            *remaining *= fraction_left;
        }
    }

    fn try_start(&mut self, core: CoreId, candidate: Candidate, bus: &mut EventBus) -> Result<(), RuntimeError> {
        let now = self.now;
        let job_id = candidate.job_id;
        let segment_id = candidate.segment_id;
        if self.jobs[&job_id].status == JobStatus::Aborted {
            return Err(RuntimeError::SchedulingAbortedJob(job_id));
        }

        let task_id = self.jobs[&job_id].task_id;
        let meta_resources = self.task_runtimes[&task_id].segment_meta[&segment_id].resources.clone();
        let claimant = (job_id, segment_id);
        let start_idx = self.jobs[&job_id].partial_acquire.get(&segment_id).copied().unwrap_or(0);

        let mut idx = start_idx;
        let mut granted_this_attempt: Vec<ResourceId> = Vec::new();
        let mut blocked_resource: Option<ResourceId> = None;
        while idx < meta_resources.len() {
            let resource_id = meta_resources[idx];
            let resource = self.resources_by_id[&resource_id].clone();
            let priority = self.jobs[&job_id].priority;
            let result = self.resource_mgr.try_acquire(&resource, claimant, priority);
            // PIP raises a blocked-on holder's effective priority the moment
            // the block happens, regardless of whether this attempt itself
            // is granted or blocked — publish them unconditionally.
            for raise in result.raises {
                bus.publish(
                    now,
                    EventKind::PriorityRaise {
                        job_id: raise.owner.0,
                        segment_id: raise.owner.1,
                        due_to_job: raise.due_to.0,
                        due_to_segment: raise.due_to.1,
                        new_priority: raise.new_priority,
                    },
                );
            }
            match result.outcome {
                AcquireOutcome::Granted => {
                    bus.publish(now, EventKind::ResourceAcquire { job_id, segment_id, resource_id });
                    if let Some(push) = result.ceiling_push {
                        bus.publish(
                            now,
                            EventKind::CeilingPush { core_id: resource.bound_core_id, resource_id, ceiling: push },
                        );
                    }
                    self.jobs.get_mut(&job_id).unwrap().held.push((resource_id, segment_id));
                    granted_this_attempt.push(resource_id);
                    idx += 1;
                }
                AcquireOutcome::MustBlock => {
                    blocked_resource = Some(resource_id);
                    break;
                }
            }
        }

        if let Some(resource_id) = blocked_resource {
            if self.config.resource_acquire_policy == ResourceAcquirePolicy::AtomicRollback {
                for resource_id in granted_this_attempt {
                    let resource = self.resources_by_id[&resource_id].clone();
                    let base_priority = self.jobs[&job_id].priority;
                    let result = self.resource_mgr.release(&resource, claimant, base_priority)?;
                    bus.publish(now, EventKind::ResourceRelease { job_id, segment_id, resource_id });
                    self.jobs.get_mut(&job_id).unwrap().held.retain(|(r, s)| !(*r == resource_id && *s == segment_id));
                    if let Some(next) = result.granted_next {
                        self.grant_to_waiter(resource_id, next, result.grant_raise, bus);
                    }
                }
                self.jobs.get_mut(&job_id).unwrap().partial_acquire.remove(&segment_id);
            } else {
                self.jobs
                    .get_mut(&job_id)
                    .unwrap()
                    .partial_acquire
                    .insert(segment_id, start_idx + granted_this_attempt.len());
            }
            self.jobs.get_mut(&job_id).unwrap().blocked_on.insert(segment_id, resource_id);
            bus.publish(now, EventKind::SegmentBlocked { job_id, segment_id, resource_id });
            return Ok(());
        }

        self.jobs.get_mut(&job_id).unwrap().partial_acquire.remove(&segment_id);

        let meta_core = self.task_runtimes[&task_id].segment_meta[&segment_id].core;
        let last_core = self.jobs[&job_id].last_core;
        if let Some(prev) = last_core {
            if prev != meta_core {
                bus.publish(
                    now,
                    EventKind::Migration { job_id, segment_id, from_core: prev, to_core: meta_core },
                );
            }
        }

        let remaining = self.jobs[&job_id].remaining_nominal[&segment_id];
        let duration = self
            .config
            .etm
            .duration(&self.model.platform, segment_id, meta_core, remaining)
            .expect("core validated at build time");

        bus.publish(now, EventKind::SegmentStart { job_id, segment_id, core_id: meta_core });
        self.jobs.get_mut(&job_id).unwrap().last_core = Some(meta_core);
        self.cores.insert(
            meta_core,
            Some(Occupant { job_id, segment_id, started_at: now, planned_end: now + duration }),
        );
        Ok(())
    }
}
