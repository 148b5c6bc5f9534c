//! Runtime configuration (ambient stack: spec.md names the knobs these
//! fields carry — fd-table capacity, worker/thread counts, poll timeout,
//! shutdown drain budget — but leaves the builder shape to the
//! implementation).

use std::time::Duration;

/// Builder for [`crate::Runtime::init`].
///
/// Grounded on the plain-struct-with-`Default` configuration shape used
/// throughout the pack's manifests (e.g. `iscsi-client-rs`'s session
/// config) rather than a separate builder type, since every field here has
/// a sane default and none require validation against each other.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Number of worker processes to fork (spec.md §5's "optional
    /// multi-process worker pool"). `1` means no forking: the reactor
    /// runs entirely in the calling process.
    pub workers: u32,
    /// Number of reactor threads per worker.
    pub threads_per_worker: u32,
    /// Size of the fd table, i.e. the highest fd this reactor can track
    /// plus one.
    pub fd_capacity: usize,
    /// Upper bound on how long a single `Poller::wait` call may block,
    /// even with no pending timers, so the reactor periodically revisits
    /// shutdown/idle state.
    pub poll_timeout_ceiling: Duration,
    /// The graceful-shutdown drain budget (spec.md §4.F step b–c: "8
    /// seconds" in the original, exposed here as a configurable
    /// `Duration` with that value as the default).
    pub shutdown_drain_budget: Duration,
    /// Capacity hint for the poller's per-call readiness event buffer.
    pub events_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> ReactorConfig {
        ReactorConfig {
            workers: 1,
            threads_per_worker: 1,
            fd_capacity: 4096,
            poll_timeout_ceiling: Duration::from_millis(250),
            shutdown_drain_budget: Duration::from_secs(8),
            events_capacity: 1024,
        }
    }
}

impl ReactorConfig {
    pub fn new() -> ReactorConfig {
        ReactorConfig::default()
    }

    pub fn workers(mut self, workers: u32) -> ReactorConfig {
        self.workers = workers;
        self
    }

    pub fn threads_per_worker(mut self, threads: u32) -> ReactorConfig {
        self.threads_per_worker = threads;
        self
    }

    pub fn fd_capacity(mut self, capacity: usize) -> ReactorConfig {
        self.fd_capacity = capacity;
        self
    }

    pub fn poll_timeout_ceiling(mut self, timeout: Duration) -> ReactorConfig {
        self.poll_timeout_ceiling = timeout;
        self
    }

    pub fn shutdown_drain_budget(mut self, budget: Duration) -> ReactorConfig {
        self.shutdown_drain_budget = budget;
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> ReactorConfig {
        self.events_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shutdown_budget_is_eight_seconds() {
        assert_eq!(ReactorConfig::default().shutdown_drain_budget, Duration::from_secs(8));
    }

    #[test]
    fn builder_methods_chain() {
        let config = ReactorConfig::new().workers(4).threads_per_worker(2).fd_capacity(8192);
        assert_eq!(config.workers, 4);
        assert_eq!(config.threads_per_worker, 2);
        assert_eq!(config.fd_capacity, 8192);
    }
}
