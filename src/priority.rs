//! A single, universal priority domain (spec §4.4, §9 "Priority domains").
//!
//! EDF's key is the absolute deadline; Rate-Monotonic's key is the period
//! (`non_rt` jobs get `+inf`). Both are funneled through `Priority` so the
//! scheduler and the PCP protocol never have to know which domain produced
//! a given value — "smaller key = higher priority" is the one convention
//! either side relies on. This removes the *representational* half of the
//! historical bug described in spec §9 (a static ceiling and an EDF deadline
//! can now be compared at all, since both are just a `Priority`), but a
//! declared static ceiling is still numerically meaningless under EDF — see
//! `Engine::build`'s rejection of `Protocol::Pcp` resources with a
//! `declared_ceiling` under `SchedulerKind::Edf` for the other half of the
//! fix.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Priority(pub f64);

impl Priority {
    /// Lower key wins. `non_rt` / "no real priority" callers use this.
    pub const LOWEST: Priority = Priority(f64::INFINITY);

    pub fn value(self) -> f64 {
        self.0
    }
}

impl Eq for Priority {}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// A scheduler's mapping from a job's runtime attributes to a `Priority`
/// key. Implemented by `scheduler::Edf` and `scheduler::RateMonotonic`.
pub trait PriorityDomain {
    /// Priority key for a job given its absolute deadline and the period of
    /// its task (`None` for `non_rt` tasks).
    fn priority_of(&self, absolute_deadline: f64, task_period: Option<f64>) -> Priority;
}
