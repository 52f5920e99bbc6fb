//! Metrics Aggregator (C7 part 1, spec §4.7). A free function over the
//! trace rather than an `Engine` method (spec §6.1): a caller can compute
//! metrics against a trace loaded from disk with no `Engine` in scope.
//!
//! `compute` additionally takes the `Model` it was run against, since
//! per-core utilization needs the full core set (a core that is never
//! scheduled still contributes a `0.0` entry) and the simulated duration
//! denominator, neither of which is reliably recoverable from the trace
//! alone if a core simply never runs anything.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::{Event, EventKind, PreemptKind};
use crate::model::{CoreId, Model, TaskId};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PerJob {
    pub job_id: Uuid,
    pub task_id: TaskId,
    pub release: f64,
    pub complete: Option<f64>,
    pub response_time: Option<f64>,
    pub missed: bool,
    pub aborted: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Summary {
    pub jobs_released: u64,
    pub jobs_completed: u64,
    pub jobs_aborted: u64,
    pub deadline_miss_rate: f64,
    pub scheduler_preempt_count: u64,
    pub forced_preempt_count: u64,
    pub preempt_count: u64,
    pub migration_count: u64,
    /// Keyed by the core id's string form (`CoreId`'s `Display`), since JSON
    /// object keys must be strings and this document is the public wire
    /// contract (spec §6).
    pub core_utilization: HashMap<String, f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metrics {
    pub per_job: Vec<PerJob>,
    pub summary: Summary,
}

struct JobAccum {
    task_id: TaskId,
    release: f64,
    complete: Option<f64>,
    missed: bool,
    aborted: bool,
}

pub fn compute(trace: &[Event], model: &Model) -> Metrics {
    let mut jobs: HashMap<Uuid, JobAccum> = HashMap::new();
    let mut job_order: Vec<Uuid> = Vec::new();
    let mut scheduler_preempt_count = 0u64;
    let mut forced_preempt_count = 0u64;
    let mut migration_count = 0u64;
    let mut core_busy: HashMap<CoreId, f64> = HashMap::new();
    let mut core_running_since: HashMap<CoreId, f64> = HashMap::new();

    for event in trace {
        match &event.kind {
            EventKind::JobRelease { job_id, task_id } => {
                job_order.push(*job_id);
                jobs.insert(
                    *job_id,
                    JobAccum {
                        task_id: *task_id,
                        release: event.time,
                        complete: None,
                        missed: false,
                        aborted: false,
                    },
                );
            }
            EventKind::JobComplete { job_id } => {
                if let Some(j) = jobs.get_mut(job_id) {
                    j.complete = Some(event.time);
                }
            }
            EventKind::JobAbort { job_id } => {
                if let Some(j) = jobs.get_mut(job_id) {
                    j.aborted = true;
                }
            }
            EventKind::DeadlineMiss { job_id, .. } => {
                if let Some(j) = jobs.get_mut(job_id) {
                    j.missed = true;
                }
            }
            EventKind::Preempt { kind, .. } => match kind {
                PreemptKind::Scheduler => scheduler_preempt_count += 1,
                PreemptKind::Forced => forced_preempt_count += 1,
            },
            EventKind::Migration { .. } => migration_count += 1,
            EventKind::SegmentStart { core_id, .. } => {
                core_running_since.insert(*core_id, event.time);
            }
            EventKind::SegmentEnd { core_id, .. } | EventKind::Preempt { core_id, .. } => {
                if let Some(since) = core_running_since.remove(core_id) {
                    *core_busy.entry(*core_id).or_insert(0.0) += event.time - since;
                }
            }
            _ => {}
        }
    }

    let per_job = job_order
        .into_iter()
        .map(|job_id| {
            let j = jobs.remove(&job_id).expect("recorded at JobRelease");
            let response_time = j.complete.map(|c| c - j.release);
            PerJob {
                job_id,
                task_id: j.task_id,
                release: j.release,
                complete: j.complete,
                response_time,
                missed: j.missed,
                aborted: j.aborted,
            }
        })
        .collect::<Vec<_>>();

    let jobs_released = per_job.len() as u64;
    let jobs_completed = per_job.iter().filter(|j| j.complete.is_some()).count() as u64;
    let jobs_aborted = per_job.iter().filter(|j| j.aborted).count() as u64;
    let missed_count = per_job.iter().filter(|j| j.missed).count() as u64;
    let deadline_miss_rate = if jobs_released == 0 {
        0.0
    } else {
        missed_count as f64 / jobs_released as f64
    };

    let mut core_utilization: HashMap<String, f64> = model
        .platform
        .cores
        .iter()
        .map(|c| (c.id.to_string(), 0.0))
        .collect();
    for (core, busy) in core_busy {
        let fraction = if model.sim.duration > 0.0 {
            busy / model.sim.duration
        } else {
            0.0
        };
        core_utilization.insert(core.to_string(), fraction);
    }

    let summary = Summary {
        jobs_released,
        jobs_completed,
        jobs_aborted,
        deadline_miss_rate,
        scheduler_preempt_count,
        forced_preempt_count,
        preempt_count: scheduler_preempt_count + forced_preempt_count,
        migration_count,
        core_utilization,
    };

    Metrics { per_job, summary }
}
