//! Drop/timeout/emit accounting. Observability here is logging-only: the
//! supervisor dumps these counters at debug level on its housekeeping tick.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    /// Malformed packets, unknown methods, expired transaction ids.
    pub benign_drops: AtomicU64,
    /// Messages rejected by the address policy.
    pub policy_drops: AtomicU64,
    /// Observations suppressed by the dedup window.
    pub dedup_drops: AtomicU64,
    /// Expired KRPC transactions and leech deadlines.
    pub timeouts: AtomicU64,
    /// Leeches that ended without a verified info dict.
    pub leech_failures: AtomicU64,
    /// Requests shed because the leech fan-out cap was reached.
    pub leeches_shed: AtomicU64,
    /// Results pushed onto the output channel.
    pub results_emitted: AtomicU64,
    /// Results dropped because the output channel hit its hard ceiling.
    pub results_dropped: AtomicU64,
}

impl Stats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn log_summary(&self) {
        tracing::debug!(
            benign_drops = Stats::get(&self.benign_drops),
            policy_drops = Stats::get(&self.policy_drops),
            dedup_drops = Stats::get(&self.dedup_drops),
            timeouts = Stats::get(&self.timeouts),
            leech_failures = Stats::get(&self.leech_failures),
            leeches_shed = Stats::get(&self.leeches_shed),
            results_emitted = Stats::get(&self.results_emitted),
            results_dropped = Stats::get(&self.results_dropped),
            "crawler counters"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::default();
        Stats::bump(&stats.policy_drops);
        Stats::bump(&stats.policy_drops);
        assert_eq!(Stats::get(&stats.policy_drops), 2);
        assert_eq!(Stats::get(&stats.timeouts), 0);
    }
}
