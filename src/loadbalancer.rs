//! Round-robin selection over the backends resolved for a hostname
//!
//! Resolution happens per request, so the candidate list can change between
//! two requests. The balancer only keeps a rotation counter per hostname and
//! applies it to whatever list it is handed. Failing backends stay in the
//! rotation.

use crate::registry::Backend;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Upper bound on tracked hostnames; wildcard routes accept unbounded names
const MAX_TRACKED_HOSTS: usize = 10_000;

#[derive(Debug, Default)]
pub struct LoadBalancer {
    counters: DashMap<String, AtomicUsize>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next backend for `hostname`, or `None` if there are none.
    ///
    /// Candidates are put in a canonical order first, since the registry
    /// makes no ordering promise across snapshots.
    pub fn pick(&self, hostname: &str, mut backends: Vec<Backend>) -> Option<Backend> {
        match backends.len() {
            0 => return None,
            1 => return backends.pop(),
            _ => {}
        }

        backends.sort_by(|a, b| {
            (&a.host, a.port, a.scheme.as_str()).cmp(&(&b.host, b.port, b.scheme.as_str()))
        });

        let idx = self.next_index(hostname) % backends.len();
        let selected = backends.swap_remove(idx);
        debug!(
            hostname,
            backend = %selected,
            candidates = backends.len() + 1,
            "Selected backend"
        );
        Some(selected)
    }

    fn next_index(&self, hostname: &str) -> usize {
        if let Some(counter) = self.counters.get(hostname) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }

        if self.counters.len() >= MAX_TRACKED_HOSTS {
            self.counters.clear();
        }
        self.counters
            .entry(hostname.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }

    /// Number of hostnames with a rotation counter
    pub fn tracked_hosts(&self) -> usize {
        self.counters.len()
    }
}
