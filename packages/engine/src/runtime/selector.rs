// packages/engine/src/runtime/selector.rs
//! Agent selection
//!
//! Among agents whose capabilities cover the task's requirements, prefer
//! (in order): higher reliability tier, fewer in-flight tasks, smaller
//! latency budget, and finally the lexicographically smaller id. The id
//! tie-break makes the ordering total, so the choice never depends on the
//! order in which the registry lists agents.

use crate::registry::AgentDescriptor;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// In-flight task count per agent
#[derive(Debug, Default)]
pub struct LoadTracker {
    in_flight: DashMap<String, usize>,
}

impl LoadTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn current(&self, agent_id: &str) -> usize {
        self.in_flight.get(agent_id).map(|count| *count).unwrap_or(0)
    }

    /// Count one more task against `agent_id` until the guard drops
    pub fn acquire(self: &Arc<Self>, agent_id: &str) -> LoadGuard {
        *self.in_flight.entry(agent_id.to_string()).or_insert(0) += 1;
        LoadGuard {
            tracker: Arc::clone(self),
            agent_id: agent_id.to_string(),
        }
    }

    fn release(&self, agent_id: &str) {
        if let Some(mut count) = self.in_flight.get_mut(agent_id) {
            *count = count.saturating_sub(1);
        }
        self.in_flight.remove_if(agent_id, |_, count| *count == 0);
    }

    pub fn snapshot(&self) -> BTreeMap<String, usize> {
        self.in_flight
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

/// Releases one unit of load on drop
#[derive(Debug)]
pub struct LoadGuard {
    tracker: Arc<LoadTracker>,
    agent_id: String,
}

impl LoadGuard {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.agent_id);
    }
}

/// Ordering of two eligible agents; `Less` is the better choice
pub fn rank(a: &AgentDescriptor, a_load: usize, b: &AgentDescriptor, b_load: usize) -> Ordering {
    b.reliability_tier
        .cmp(&a.reliability_tier)
        .then(a_load.cmp(&b_load))
        .then(a.latency_budget_ms.cmp(&b.latency_budget_ms))
        .then_with(|| a.id.cmp(&b.id))
}

/// Pick the best agent covering `required`, or `None` if nobody does
pub fn select(
    candidates: &[Arc<AgentDescriptor>],
    required: &BTreeSet<String>,
    load: &LoadTracker,
) -> Option<Arc<AgentDescriptor>> {
    candidates
        .iter()
        .filter(|agent| agent.covers(required))
        .map(|agent| (agent, load.current(&agent.id)))
        .min_by(|(a, a_load), (b, b_load)| rank(a, *a_load, b, *b_load))
        .map(|(agent, _)| Arc::clone(agent))
}
