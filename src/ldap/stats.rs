//! Connection and operation counters, updated atomically by the dispatcher
//! and read by the metrics collector.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    conns: AtomicU64,
    conns_current: AtomicU64,
    conns_max: AtomicU64,
    binds: AtomicU64,
    unbinds: AtomicU64,
    searches: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub conns: u64,
    pub conns_current: u64,
    pub conns_max: u64,
    pub binds: u64,
    pub unbinds: u64,
    pub searches: u64,
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    pub fn count_conn(&self) {
        self.conns.fetch_add(1, Ordering::Relaxed);
        let current = self.conns_current.fetch_add(1, Ordering::Relaxed) + 1;
        self.conns_max.fetch_max(current, Ordering::Relaxed);
    }

    pub fn count_conn_close(&self) {
        self.conns_current.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn count_bind(&self) {
        self.binds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_unbind(&self) {
        self.unbinds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_search(&self) {
        self.searches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            conns: self.conns.load(Ordering::Relaxed),
            conns_current: self.conns_current.load(Ordering::Relaxed),
            conns_max: self.conns_max.load(Ordering::Relaxed),
            binds: self.binds.load(Ordering::Relaxed),
            unbinds: self.unbinds.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_max_concurrent_connections() {
        let stats = Stats::new();
        stats.count_conn();
        stats.count_conn();
        stats.count_conn_close();
        stats.count_conn();

        let snap = stats.snapshot();
        assert_eq!(snap.conns, 3);
        assert_eq!(snap.conns_current, 2);
        assert_eq!(snap.conns_max, 2);
    }

    #[test]
    fn counts_operations() {
        let stats = Stats::new();
        stats.count_bind();
        stats.count_bind();
        stats.count_search();
        stats.count_unbind();

        let snap = stats.snapshot();
        assert_eq!(snap.binds, 2);
        assert_eq!(snap.searches, 1);
        assert_eq!(snap.unbinds, 1);
    }
}
