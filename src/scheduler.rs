//! Scheduler (C5, spec §4.5). EDF and Rate-Monotonic as a closed tagged
//! union, each implementing `PriorityDomain` (see `crate::priority`).
//! Tie-breaking and preemption policy are configuration, not per-scheduler
//! behavior, so they live alongside the `SchedulerKind` rather than being
//! duplicated in each variant.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{SegmentId, TaskId};
use crate::priority::{Priority, PriorityDomain};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerKind {
    Edf,
    RateMonotonic,
}

impl PriorityDomain for SchedulerKind {
    fn priority_of(&self, absolute_deadline: f64, task_period: Option<f64>) -> Priority {
        match self {
            SchedulerKind::Edf => Priority(absolute_deadline),
            SchedulerKind::RateMonotonic => Priority(task_period.unwrap_or(f64::INFINITY)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TieBreaker {
    /// By ready-time, then release-time, then task id.
    Fifo,
    /// Reverse ready-time.
    Lifo,
    /// Stable lexicographic on segment id.
    SegmentKey,
}

/// Everything the scheduler needs to know about one ready candidate on a
/// core, without depending on `crate::engine`'s internal job table.
#[derive(Clone, Copy, Debug)]
pub struct Candidate {
    pub job_id: Uuid,
    pub task_id: TaskId,
    pub segment_id: SegmentId,
    pub priority: Priority,
    pub ready_time: f64,
    pub release_time: f64,
    pub preemptible: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub kind: SchedulerKind,
    pub tie_breaker: TieBreaker,
    pub allow_preempt: bool,
}

impl SchedulerConfig {
    /// Orders two candidates, best-first: lower `Priority` first, then the
    /// configured tie-breaker, with task id as the final deterministic
    /// fallback (spec §9's resolved open question for simultaneous ties).
    fn order(&self, a: &Candidate, b: &Candidate) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        a.priority
            .cmp(&b.priority)
            .then_with(|| match self.tie_breaker {
                TieBreaker::Fifo => a
                    .ready_time
                    .total_cmp(&b.ready_time)
                    .then_with(|| a.release_time.total_cmp(&b.release_time)),
                TieBreaker::Lifo => b
                    .ready_time
                    .total_cmp(&a.ready_time)
                    .then_with(|| a.release_time.total_cmp(&b.release_time)),
                TieBreaker::SegmentKey => a.segment_id.cmp(&b.segment_id),
            })
            .then_with(|| a.task_id.cmp(&b.task_id))
            .then_with(|| a.job_id.cmp(&b.job_id))
            .unwrap_or(Ordering::Equal)
    }

    /// Picks the best ready candidate for a core, given who (if anyone) is
    /// currently running there. Returns `None` if nothing should occupy the
    /// core (ready set empty, or the occupant should keep running).
    ///
    /// `select` never mutates state; the engine interprets the result
    /// (start / preempt / keep-running) and emits the corresponding events.
    pub fn select(&self, ready: &[Candidate], occupant: Option<&Candidate>) -> SelectDecision {
        let best = ready.iter().min_by(|a, b| self.order(a, b)).copied();

        match (occupant, best) {
            (None, Some(b)) => SelectDecision::Start(b),
            (None, None) => SelectDecision::Idle,
            (Some(occ), None) => SelectDecision::Keep(*occ),
            (Some(occ), Some(b)) => {
                if b.job_id == occ.job_id && b.segment_id == occ.segment_id {
                    return SelectDecision::Keep(*occ);
                }
                if !self.allow_preempt {
                    return SelectDecision::Keep(*occ);
                }
                if !occ.preemptible {
                    return SelectDecision::Keep(*occ);
                }
                if self.order(&b, occ) == std::cmp::Ordering::Less {
                    SelectDecision::Preempt {
                        incoming: b,
                        outgoing: *occ,
                    }
                } else {
                    SelectDecision::Keep(*occ)
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum SelectDecision {
    Idle,
    Keep(Candidate),
    Start(Candidate),
    Preempt {
        incoming: Candidate,
        outgoing: Candidate,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(job: u128, task: u32, seg: u32, prio: f64, ready: f64) -> Candidate {
        Candidate {
            job_id: Uuid::from_u128(job),
            task_id: TaskId(task),
            segment_id: SegmentId(seg),
            priority: Priority(prio),
            ready_time: ready,
            release_time: ready,
            preemptible: true,
        }
    }

    #[test]
    fn edf_prefers_earlier_deadline() {
        let cfg = SchedulerConfig {
            kind: SchedulerKind::Edf,
            tie_breaker: TieBreaker::Fifo,
            allow_preempt: true,
        };
        let a = cand(1, 0, 0, 10.0, 0.0);
        let b = cand(2, 1, 0, 5.0, 0.0);
        match cfg.select(&[a, b], None) {
            SelectDecision::Start(c) => assert_eq!(c.job_id, b.job_id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_preemptible_occupant_is_kept() {
        let cfg = SchedulerConfig {
            kind: SchedulerKind::Edf,
            tie_breaker: TieBreaker::Fifo,
            allow_preempt: true,
        };
        let mut occ = cand(1, 0, 0, 10.0, 0.0);
        occ.preemptible = false;
        let higher = cand(2, 1, 0, 1.0, 1.0);
        match cfg.select(&[higher], Some(&occ)) {
            SelectDecision::Keep(c) => assert_eq!(c.job_id, occ.job_id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn allow_preempt_false_runs_to_completion() {
        let cfg = SchedulerConfig {
            kind: SchedulerKind::Edf,
            tie_breaker: TieBreaker::Fifo,
            allow_preempt: false,
        };
        let occ = cand(1, 0, 0, 10.0, 0.0);
        let higher = cand(2, 1, 0, 1.0, 1.0);
        match cfg.select(&[higher], Some(&occ)) {
            SelectDecision::Keep(c) => assert_eq!(c.job_id, occ.job_id),
            other => panic!("unexpected {other:?}"),
        }
    }
}
