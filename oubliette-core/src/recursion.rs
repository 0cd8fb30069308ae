//! Per-session-tree admission control for recursive spawns.
//!
//! A single lock guards one root's counters; it is taken only at admission
//! time and never held across I/O, per the concurrency model.

use std::collections::HashMap;

use parking_lot::Mutex;

pub const DEFAULT_MAX_DEPTH: u32 = 3;
pub const DEFAULT_MAX_AGENTS: u32 = 50;
pub const DEFAULT_MAX_COST_USD: f64 = 10.00;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RecursionError {
    #[error("max_depth")]
    MaxDepth,
    #[error("max_agents")]
    MaxAgents,
    #[error("max_cost_usd")]
    MaxCost,
}

#[derive(Debug, Default, Clone, Copy)]
struct TreeCounters {
    /// Active + terminated children admitted into this tree so far.
    agent_count: u32,
    cumulative_cost_usd: f64,
}

/// Admission gate consulted before persisting a new child `Session`.
///
/// One guard is shared across all projects; trees are distinguished by
/// root session id, so a single `max_depth`/`max_agents`/`max_cost_usd`
/// policy applies deployment-wide unless a project overrides it (callers
/// construct a guard per effective policy).
pub struct RecursionGuard {
    trees: Mutex<HashMap<String, TreeCounters>>,
    max_depth: u32,
    max_agents: u32,
    max_cost_usd: f64,
}

impl Default for RecursionGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH, DEFAULT_MAX_AGENTS, DEFAULT_MAX_COST_USD)
    }
}

impl RecursionGuard {
    pub fn new(max_depth: u32, max_agents: u32, max_cost_usd: f64) -> Self {
        Self {
            trees: Mutex::new(HashMap::new()),
            max_depth,
            max_agents,
            max_cost_usd,
        }
    }

    /// Checks and, if admitted, records a child spawn at `child_depth`
    /// under the tree rooted at `root_id`. Rejection names which limit
    /// tripped; the caller maps that to `ResourceExhausted`.
    pub fn admit_child(&self, root_id: &str, child_depth: u32) -> Result<(), RecursionError> {
        if child_depth > self.max_depth {
            return Err(RecursionError::MaxDepth);
        }
        let mut trees = self.trees.lock();
        let counters = trees.entry(root_id.to_string()).or_default();
        if counters.agent_count >= self.max_agents {
            return Err(RecursionError::MaxAgents);
        }
        if counters.cumulative_cost_usd >= self.max_cost_usd {
            return Err(RecursionError::MaxCost);
        }
        counters.agent_count += 1;
        Ok(())
    }

    /// Adds to the tree's cumulative cost. Called as turns complete;
    /// exceeding `max_cost_usd` blocks the *next* admission, not the
    /// in-flight turn that crossed it.
    pub fn record_cost(&self, root_id: &str, cost_usd: f64) {
        let mut trees = self.trees.lock();
        let counters = trees.entry(root_id.to_string()).or_default();
        counters.cumulative_cost_usd += cost_usd;
    }

    pub fn agent_count(&self, root_id: &str) -> u32 {
        self.trees
            .lock()
            .get(root_id)
            .map(|c| c.agent_count)
            .unwrap_or(0)
    }

    pub fn cumulative_cost(&self, root_id: &str) -> f64 {
        self.trees
            .lock()
            .get(root_id)
            .map(|c| c.cumulative_cost_usd)
            .unwrap_or(0.0)
    }

    /// Drops a tree's counters once its root session is retired.
    pub fn forget(&self, root_id: &str) {
        self.trees.lock().remove(root_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_enforced() {
        let guard = RecursionGuard::new(2, 50, 10.0);
        assert!(guard.admit_child("root", 1).is_ok());
        assert!(guard.admit_child("root", 2).is_ok());
        assert_eq!(guard.admit_child("root", 3), Err(RecursionError::MaxDepth));
    }

    #[test]
    fn test_scenario_b_child_depth_enforcement() {
        // project P with max_depth=2: S0(depth0) -> S1(depth1) -> S2(depth2) -> S3(depth3)
        let guard = RecursionGuard::new(2, 50, 10.0);
        assert!(guard.admit_child("s0", 1).is_ok()); // S1
        assert!(guard.admit_child("s0", 2).is_ok()); // S2
        assert_eq!(guard.admit_child("s0", 3), Err(RecursionError::MaxDepth)); // S3 rejected
    }

    #[test]
    fn test_max_agents_enforced() {
        let guard = RecursionGuard::new(10, 2, 10.0);
        assert!(guard.admit_child("root", 1).is_ok());
        assert!(guard.admit_child("root", 1).is_ok());
        assert_eq!(guard.admit_child("root", 1), Err(RecursionError::MaxAgents));
        assert_eq!(guard.agent_count("root"), 2);
    }

    #[test]
    fn test_max_cost_enforced() {
        let guard = RecursionGuard::new(10, 50, 5.0);
        guard.record_cost("root", 5.0);
        assert_eq!(guard.admit_child("root", 1), Err(RecursionError::MaxCost));
    }

    #[test]
    fn test_trees_are_independent() {
        let guard = RecursionGuard::new(10, 1, 10.0);
        assert!(guard.admit_child("root-a", 1).is_ok());
        assert!(guard.admit_child("root-b", 1).is_ok());
        assert_eq!(guard.admit_child("root-a", 1), Err(RecursionError::MaxAgents));
    }

    #[test]
    fn test_forget_resets_counters() {
        let guard = RecursionGuard::new(10, 1, 10.0);
        guard.admit_child("root", 1).unwrap();
        guard.forget("root");
        assert_eq!(guard.agent_count("root"), 0);
        assert!(guard.admit_child("root", 1).is_ok());
    }
}
