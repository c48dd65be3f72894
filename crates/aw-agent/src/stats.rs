// stats.rs — Agent flow counters.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use aw_rules::AgentStats;

/// Lock-free counters updated on the enforcement hot path.
#[derive(Debug)]
pub struct AgentCounters {
    total: AtomicU64,
    denied: AtomicU64,
    unattributed: AtomicU64,
    swept: AtomicU64,
    started_at: DateTime<Utc>,
}

impl AgentCounters {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            unattributed: AtomicU64::new(0),
            swept: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn record_flow(&self, denied: bool, unattributed: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if denied {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }
        if unattributed {
            self.unattributed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_swept(&self) {
        self.swept.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time view; `open_flows` and `active_rules` come from the caller.
    pub fn snapshot(&self, open_flows: usize, active_rules: usize) -> AgentStats {
        AgentStats {
            total_flows: self.total.load(Ordering::Relaxed),
            denied_flows: self.denied.load(Ordering::Relaxed),
            unattributed_flows: self.unattributed.load(Ordering::Relaxed),
            open_flows: open_flows as u64,
            swept_flows: self.swept.load(Ordering::Relaxed),
            active_rules: active_rules as u64,
            started_at: Some(self.started_at),
        }
    }
}

impl Default for AgentCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = AgentCounters::new();
        counters.record_flow(false, false);
        counters.record_flow(true, true);
        counters.record_swept();
        let stats = counters.snapshot(1, 4);
        assert_eq!(stats.total_flows, 2);
        assert_eq!(stats.denied_flows, 1);
        assert_eq!(stats.unattributed_flows, 1);
        assert_eq!(stats.swept_flows, 1);
        assert_eq!(stats.open_flows, 1);
        assert_eq!(stats.active_rules, 4);
    }
}
