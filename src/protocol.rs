//! Resource Protocols (C4, spec §4.4): Mutex, Priority Inheritance, and
//! Priority Ceiling. A closed tagged union dispatched by `ResourceManager`
//! rather than `dyn` trait objects, per the "dynamic plugin dispatch ->
//! tagged variants" redesign flag (spec §9) — there is no hot-path dynamic
//! dispatch anywhere in resource acquisition.
//!
//! Every claimant is identified by `(JobId, SegmentId)`: a resource is
//! bound to exactly one core (spec §3), so only segments mapped to that
//! core ever contend for it and per-core scoping (used by PCP's system
//! ceiling) is sound.
//!
//! `Priority` throughout this module follows the crate-wide convention
//! (`crate::priority`): **smaller key = higher priority**. The spec's prose
//! ("effective priority strictly greater than the system ceiling") is
//! written in the classical static-priority sense where larger = higher;
//! translated into this crate's convention that becomes "claimant's
//! priority key is strictly *less than* the system ceiling's key".

use std::collections::HashMap;
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{CoreId, Resource, ResourceId, SegmentId};
use crate::priority::Priority;

pub type ClaimantId = (Uuid, SegmentId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceAcquirePolicy {
    /// Acquire one resource at a time; hold while waiting for the next.
    LegacySequential,
    /// All-or-nothing: on any `MustBlock`, release any in-batch acquisitions
    /// before enqueuing the waiter. Avoids a class of hold-and-wait
    /// deadlocks (spec §5).
    AtomicRollback,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    MustBlock,
}

#[derive(Debug)]
pub struct PriorityRaiseEffect {
    pub owner: ClaimantId,
    pub due_to: ClaimantId,
    pub new_priority: Priority,
}

#[derive(Debug)]
pub struct PriorityRestoreEffect {
    pub owner: ClaimantId,
    pub new_priority: Priority,
}

#[derive(Debug)]
pub struct AcquireResult {
    pub outcome: AcquireOutcome,
    /// PIP only: raises triggered by this attempt blocking.
    pub raises: Vec<PriorityRaiseEffect>,
    /// PCP only: the ceiling pushed, if granted.
    pub ceiling_push: Option<Priority>,
}

#[derive(Debug, Default)]
pub struct ReleaseResult {
    pub granted_next: Option<ClaimantId>,
    /// PIP only: the releaser's restored effective priority, if it changed.
    pub restore: Option<PriorityRestoreEffect>,
    /// PCP only: the ceiling popped.
    pub ceiling_pop: Option<Priority>,
    /// Set if the grant to `granted_next` itself required raising its
    /// priority further (PIP: other waiters remain on the resource).
    pub grant_raise: Option<PriorityRaiseEffect>,
}

#[derive(Default)]
struct MutexState {
    holders: HashMap<ResourceId, ClaimantId>,
    waiters: HashMap<ResourceId, VecDeque<ClaimantId>>,
}

impl MutexState {
    fn abandon(&mut self, claimant: ClaimantId) {
        for q in self.waiters.values_mut() {
            q.retain(|c| *c != claimant);
        }
    }

    fn try_acquire(&mut self, resource: ResourceId, claimant: ClaimantId) -> AcquireResult {
        if !self.holders.contains_key(&resource) {
            self.holders.insert(resource, claimant);
            AcquireResult {
                outcome: AcquireOutcome::Granted,
                raises: vec![],
                ceiling_push: None,
            }
        } else {
            self.waiters.entry(resource).or_default().push_back(claimant);
            AcquireResult {
                outcome: AcquireOutcome::MustBlock,
                raises: vec![],
                ceiling_push: None,
            }
        }
    }

    fn release(&mut self, resource: ResourceId, claimant: ClaimantId) -> ReleaseResult {
        debug_assert_eq!(self.holders.get(&resource), Some(&claimant));
        self.holders.remove(&resource);
        let granted_next = self
            .waiters
            .get_mut(&resource)
            .and_then(|q| q.pop_front());
        if let Some(next) = granted_next {
            self.holders.insert(resource, next);
        }
        ReleaseResult {
            granted_next,
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct PipState {
    holders: HashMap<ResourceId, ClaimantId>,
    /// Waiters with the priority they were contending at.
    waiters: HashMap<ResourceId, Vec<(ClaimantId, Priority)>>,
    /// Resources currently held by each claimant (for restore-on-release).
    held_by: HashMap<ClaimantId, Vec<ResourceId>>,
    /// What a blocked claimant is waiting on, for chain propagation.
    waiting_on: HashMap<ClaimantId, ResourceId>,
    /// Current effective priority of each claimant known to this protocol
    /// (absent = running at its own base priority).
    effective: HashMap<ClaimantId, Priority>,
}

impl PipState {
    /// Removes a claimant from every wait queue and its propagated-raise
    /// bookkeeping, used when a job is aborted while blocked rather than
    /// while holding a resource (spec §4.5: "the aborted job must not be
    /// re-scheduled" applies to wait queues too, not only to held resources).
    fn abandon(&mut self, claimant: ClaimantId) {
        for w in self.waiters.values_mut() {
            w.retain(|(c, _)| *c != claimant);
        }
        self.waiting_on.remove(&claimant);
        self.effective.remove(&claimant);
    }

    fn effective_of(&self, claimant: ClaimantId, base: Priority) -> Priority {
        self.effective.get(&claimant).copied().unwrap_or(base).min(base)
    }

    fn try_acquire(
        &mut self,
        resource: ResourceId,
        claimant: ClaimantId,
        claimant_base: Priority,
    ) -> AcquireResult {
        match self.holders.get(&resource).copied() {
            None => {
                self.holders.insert(resource, claimant);
                self.held_by.entry(claimant).or_default().push(resource);
                AcquireResult {
                    outcome: AcquireOutcome::Granted,
                    raises: vec![],
                    ceiling_push: None,
                }
            }
            Some(holder) => {
                self.waiters
                    .entry(resource)
                    .or_default()
                    .push((claimant, claimant_base));
                self.waiting_on.insert(claimant, resource);
                let raises = self.propagate_raise(holder, claimant_base, claimant, claimant_base);
                AcquireResult {
                    outcome: AcquireOutcome::MustBlock,
                    raises,
                    ceiling_push: None,
                }
            }
        }
    }

    /// Raise `owner`'s effective priority to at least `candidate` (if that
    /// is actually higher), crediting `due_to`, then follow the chain if
    /// `owner` is itself blocked waiting on someone else (spec §4.4:
    /// "a raise propagates through transitive blocking relations").
    fn propagate_raise(
        &mut self,
        owner: ClaimantId,
        owner_base: Priority,
        due_to: ClaimantId,
        candidate: Priority,
    ) -> Vec<PriorityRaiseEffect> {
        let current = self.effective_of(owner, owner_base);
        if candidate >= current {
            return vec![];
        }
        self.effective.insert(owner, candidate);
        let mut out = vec![PriorityRaiseEffect {
            owner,
            due_to,
            new_priority: candidate,
        }];
        if let Some(&next_resource) = self.waiting_on.get(&owner) {
            if let Some(&next_holder) = self.holders.get(&next_resource) {
                out.extend(self.propagate_raise(next_holder, owner_base, owner, candidate));
            }
        }
        out
    }

    fn release(
        &mut self,
        resource: ResourceId,
        claimant: ClaimantId,
        claimant_base: Priority,
    ) -> ReleaseResult {
        debug_assert_eq!(self.holders.get(&resource), Some(&claimant));
        self.holders.remove(&resource);
        if let Some(held) = self.held_by.get_mut(&claimant) {
            held.retain(|r| *r != resource);
        }

        // Restore releaser to the max priority still required by its
        // remaining held resources, or its base priority if none remain.
        let remaining = self.held_by.get(&claimant).cloned().unwrap_or_default();
        let mut restored = claimant_base;
        for r in &remaining {
            if let Some(waiters) = self.waiters.get(r) {
                for (_, p) in waiters {
                    restored = restored.min(*p);
                }
            }
        }
        let prev = self.effective_of(claimant, claimant_base);
        let restore = if restored.value() != prev.value() {
            self.effective.insert(claimant, restored);
            Some(PriorityRestoreEffect {
                owner: claimant,
                new_priority: restored,
            })
        } else {
            self.effective.remove(&claimant);
            None
        };

        // Grant to the highest-priority waiter (ties broken by arrival order).
        let granted_next = self.waiters.get_mut(&resource).and_then(|w| {
            if w.is_empty() {
                return None;
            }
            let (idx, _) = w
                .iter()
                .enumerate()
                .min_by_key(|(_, (_, p))| *p)
                .expect("non-empty");
            Some(w.remove(idx).0)
        });

        let mut grant_raise = None;
        if let Some(next) = granted_next {
            self.waiting_on.remove(&next);
            self.holders.insert(resource, next);
            self.held_by.entry(next).or_default().push(resource);
            if let Some(waiters) = self.waiters.get(&resource) {
                if let Some((_, highest)) = waiters.iter().min_by_key(|(_, p)| *p) {
                    let next_base = self.effective_of(next, *highest);
                    if *highest < next_base {
                        self.effective.insert(next, *highest);
                        grant_raise = Some(PriorityRaiseEffect {
                            owner: next,
                            due_to: next,
                            new_priority: *highest,
                        });
                    }
                }
            }
        }

        ReleaseResult {
            granted_next,
            restore,
            ceiling_pop: None,
            grant_raise,
        }
    }
}

#[derive(Default)]
struct PcpState {
    holders: HashMap<ResourceId, ClaimantId>,
    waiters: HashMap<ResourceId, VecDeque<(ClaimantId, Priority)>>,
    held_by: HashMap<ClaimantId, Vec<(ResourceId, Priority)>>,
    /// System ceiling stack per core: resources held, in acquire order.
    ceiling_stack: HashMap<CoreId, Vec<(ResourceId, Priority)>>,
}

impl PcpState {
    fn abandon(&mut self, claimant: ClaimantId) {
        for q in self.waiters.values_mut() {
            q.retain(|(c, _)| *c != claimant);
        }
    }

    fn system_ceiling(&self, core: CoreId) -> Option<Priority> {
        self.ceiling_stack
            .get(&core)
            .and_then(|s| s.iter().map(|(_, p)| *p).min())
    }

    fn try_acquire(
        &mut self,
        resource: ResourceId,
        core: CoreId,
        ceiling: Priority,
        claimant: ClaimantId,
        claimant_priority: Priority,
    ) -> AcquireResult {
        let system_ceiling = self.system_ceiling(core);
        let already_contributes = self
            .held_by
            .get(&claimant)
            .map(|held| {
                system_ceiling
                    .map(|sc| held.iter().any(|(_, p)| p.value() == sc.value()))
                    .unwrap_or(false)
            })
            .unwrap_or(false);

        let allowed = match system_ceiling {
            None => true,
            Some(sc) => claimant_priority < sc || already_contributes,
        };

        if allowed {
            self.holders.insert(resource, claimant);
            self.held_by
                .entry(claimant)
                .or_default()
                .push((resource, ceiling));
            self.ceiling_stack
                .entry(core)
                .or_default()
                .push((resource, ceiling));
            AcquireResult {
                outcome: AcquireOutcome::Granted,
                raises: vec![],
                ceiling_push: Some(ceiling),
            }
        } else {
            self.waiters
                .entry(resource)
                .or_default()
                .push_back((claimant, claimant_priority));
            AcquireResult {
                outcome: AcquireOutcome::MustBlock,
                raises: vec![],
                ceiling_push: None,
            }
        }
    }

    fn release(
        &mut self,
        resource: ResourceId,
        core: CoreId,
        ceiling: Priority,
        claimant: ClaimantId,
    ) -> Result<ReleaseResult, crate::error::RuntimeError> {
        self.holders.remove(&resource);
        if let Some(held) = self.held_by.get_mut(&claimant) {
            held.retain(|(r, _)| *r != resource);
        }
        let stack = self
            .ceiling_stack
            .get_mut(&core)
            .ok_or(crate::error::RuntimeError::CeilingStackUnderflow(core))?;
        let pos = stack
            .iter()
            .position(|(r, _)| *r == resource)
            .ok_or(crate::error::RuntimeError::CeilingStackUnderflow(core))?;
        stack.remove(pos);

        let mut granted_next = None;
        if let Some(front) = self.waiters.get(&resource).and_then(|q| q.front()).copied() {
            let system_ceiling = self.system_ceiling(core);
            let (claimant_next, prio) = front;
            let allowed = system_ceiling.map(|sc| prio < sc).unwrap_or(true);
            if allowed {
                self.waiters.get_mut(&resource).unwrap().pop_front();
                self.holders.insert(resource, claimant_next);
                self.held_by
                    .entry(claimant_next)
                    .or_default()
                    .push((resource, ceiling));
                self.ceiling_stack.entry(core).or_default().push((resource, ceiling));
                granted_next = Some(claimant_next);
            }
        }

        Ok(ReleaseResult {
            granted_next,
            restore: None,
            ceiling_pop: Some(ceiling),
            grant_raise: None,
        })
    }
}

/// Dispatches to the correct protocol implementation for a resource.
/// Stateless from the engine's point of view — all per-run state lives in
/// this struct and is dropped/recreated on `Engine::reset` (spec §3,
/// "Ownership").
#[derive(Default)]
pub struct ResourceManager {
    mutex: MutexState,
    pip: PipState,
    pcp: PcpState,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(
        &mut self,
        resource: &Resource,
        claimant: ClaimantId,
        claimant_priority: Priority,
    ) -> AcquireResult {
        match resource.protocol {
            crate::model::Protocol::Mutex => self.mutex.try_acquire(resource.id, claimant),
            crate::model::Protocol::Pip => {
                self.pip.try_acquire(resource.id, claimant, claimant_priority)
            }
            crate::model::Protocol::Pcp => {
                let ceiling = resource.declared_ceiling.unwrap_or(claimant_priority);
                self.pcp.try_acquire(
                    resource.id,
                    resource.bound_core_id,
                    ceiling,
                    claimant,
                    claimant_priority,
                )
            }
        }
    }

    pub fn release(
        &mut self,
        resource: &Resource,
        claimant: ClaimantId,
        claimant_base_priority: Priority,
    ) -> Result<ReleaseResult, crate::error::RuntimeError> {
        match resource.protocol {
            crate::model::Protocol::Mutex => Ok(self.mutex.release(resource.id, claimant)),
            crate::model::Protocol::Pip => {
                Ok(self.pip.release(resource.id, claimant, claimant_base_priority))
            }
            crate::model::Protocol::Pcp => {
                let ceiling = resource.declared_ceiling.unwrap_or(claimant_base_priority);
                self.pcp
                    .release(resource.id, resource.bound_core_id, ceiling, claimant)
            }
        }
    }

    /// Current system ceiling on `core` (PCP only; `None` if no PCP
    /// resource on that core is currently held).
    pub fn system_ceiling(&self, core: CoreId) -> Option<Priority> {
        self.pcp.system_ceiling(core)
    }

    /// The scheduling priority the scheduler should actually use for
    /// `claimant`: its PIP-raised effective priority if one is in force,
    /// otherwise `base`. Mutex and PCP never modify a claimant's scheduling
    /// priority (PCP gates acquisition instead), so this only consults PIP.
    pub fn effective_priority(&self, claimant: ClaimantId, base: Priority) -> Priority {
        self.pip.effective_of(claimant, base)
    }

    /// Purges a claimant from every protocol's wait queues. Called when a
    /// job is aborted while blocked (not holding) a resource, so it can
    /// never be handed a grant after it no longer exists.
    pub fn abandon(&mut self, claimant: ClaimantId) {
        self.mutex.abandon(claimant);
        self.pip.abandon(claimant);
        self.pcp.abandon(claimant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn claimant(n: u32) -> ClaimantId {
        (Uuid::from_u128(n as u128), SegmentId(0))
    }

    #[test]
    fn mutex_is_fifo_among_waiters() {
        let mut mgr = ResourceManager::new();
        let r = Resource {
            id: ResourceId(0),
            name: "r0".into(),
            bound_core_id: CoreId(0),
            protocol: crate::model::Protocol::Mutex,
            declared_ceiling: None,
        };
        let a = claimant(1);
        let b = claimant(2);
        let c = claimant(3);
        assert_eq!(
            mgr.try_acquire(&r, a, Priority(0.0)).outcome,
            AcquireOutcome::Granted
        );
        assert_eq!(
            mgr.try_acquire(&r, b, Priority(0.0)).outcome,
            AcquireOutcome::MustBlock
        );
        assert_eq!(
            mgr.try_acquire(&r, c, Priority(0.0)).outcome,
            AcquireOutcome::MustBlock
        );
        let rel = mgr.release(&r, a, Priority(0.0)).unwrap();
        assert_eq!(rel.granted_next, Some(b));
    }

    #[test]
    fn pip_raises_holder_when_higher_priority_blocks() {
        let mut mgr = ResourceManager::new();
        let r = Resource {
            id: ResourceId(0),
            name: "r0".into(),
            bound_core_id: CoreId(0),
            protocol: crate::model::Protocol::Pip,
            declared_ceiling: None,
        };
        let low = claimant(1);
        let high = claimant(2);
        assert_eq!(
            mgr.try_acquire(&r, low, Priority(10.0)).outcome,
            AcquireOutcome::Granted
        );
        let result = mgr.try_acquire(&r, high, Priority(1.0));
        assert_eq!(result.outcome, AcquireOutcome::MustBlock);
        assert_eq!(result.raises.len(), 1);
        assert_eq!(result.raises[0].owner, low);
        assert_eq!(result.raises[0].new_priority.value(), 1.0);
    }

    #[test]
    fn pcp_blocks_when_priority_not_below_system_ceiling() {
        let mut mgr = ResourceManager::new();
        let r0 = Resource {
            id: ResourceId(0),
            name: "r0".into(),
            bound_core_id: CoreId(0),
            protocol: crate::model::Protocol::Pcp,
            declared_ceiling: Some(Priority(5.0)),
        };
        let holder = claimant(1);
        let contender = claimant(2);
        assert_eq!(
            mgr.try_acquire(&r0, holder, Priority(5.0)).outcome,
            AcquireOutcome::Granted
        );
        // contender's priority (10.0, worse) is not strictly below the
        // system ceiling (5.0), so it must block.
        assert_eq!(
            mgr.try_acquire(&r0, contender, Priority(10.0)).outcome,
            AcquireOutcome::MustBlock
        );
    }

    #[test]
    fn pcp_allows_acquire_when_already_contributing_to_ceiling() {
        let mut mgr = ResourceManager::new();
        let r0 = Resource {
            id: ResourceId(0),
            name: "r0".into(),
            bound_core_id: CoreId(0),
            protocol: crate::model::Protocol::Pcp,
            declared_ceiling: Some(Priority(5.0)),
        };
        let r1 = Resource {
            id: ResourceId(1),
            name: "r1".into(),
            bound_core_id: CoreId(0),
            protocol: crate::model::Protocol::Pcp,
            declared_ceiling: Some(Priority(5.0)),
        };
        let holder = claimant(1);
        assert_eq!(
            mgr.try_acquire(&r0, holder, Priority(5.0)).outcome,
            AcquireOutcome::Granted
        );
        // Same claimant, same ceiling value already contributing -> allowed.
        assert_eq!(
            mgr.try_acquire(&r1, holder, Priority(5.0)).outcome,
            AcquireOutcome::Granted
        );
    }
}
