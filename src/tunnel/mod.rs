//! Tunnel engine: byte pumps, idle timeouts, and the two tunnel directions

pub mod forward;
pub mod idle;
pub mod reverse;
pub mod shovel;

use std::sync::atomic::{AtomicU64, Ordering};

/// Connection counters for one tunnel, updated lock-free from the accept
/// loop and the SSH event loop.
#[derive(Debug, Default)]
pub struct TunnelStats {
    pub connections: AtomicU64,
    pub active: AtomicU64,
}

impl TunnelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TunnelStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections: u64,
    pub active: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counters() {
        let stats = TunnelStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                connections: 2,
                active: 1
            }
        );
    }
}
