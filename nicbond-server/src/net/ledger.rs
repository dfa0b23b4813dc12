use crate::config::COMMON_CLIENTS;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Which client of an interface bundle moved the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// The short-deadline first-request client.
    Probe,
    /// One of the long-lived ranged-fetch clients.
    Common(u8),
}

/// Monotonic byte counters for one interface, one per lane.
#[derive(Default)]
pub struct LaneCounters {
    probe: AtomicU64,
    chunks: [AtomicU64; COMMON_CLIENTS],
}

impl LaneCounters {
    pub fn add(&self, lane: Lane, n: u64) {
        self.cell(lane).fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, lane: Lane) -> u64 {
        self.cell(lane).load(Ordering::Relaxed)
    }

    fn cell(&self, lane: Lane) -> &AtomicU64 {
        match lane {
            Lane::Probe => &self.probe,
            Lane::Common(slot) => &self.chunks[usize::from(slot) % COMMON_CLIENTS],
        }
    }
}

/// Per-interface byte accounting, read by the capacity model every tick.
///
/// The interface set is fixed at startup, so the map itself is immutable and
/// every access is a single atomic op.
pub struct ByteLedger {
    counters: HashMap<IpAddr, Arc<LaneCounters>>,
}

impl ByteLedger {
    pub fn new(ips: impl IntoIterator<Item = IpAddr>) -> Self {
        let counters = ips
            .into_iter()
            .map(|ip| (ip, Arc::new(LaneCounters::default())))
            .collect();
        Self { counters }
    }

    pub fn counters(&self, ip: IpAddr) -> Option<Arc<LaneCounters>> {
        self.counters.get(&ip).cloned()
    }

    pub fn add(&self, ip: IpAddr, lane: Lane, n: u64) {
        if let Some(c) = self.counters.get(&ip) {
            c.add(lane, n);
        }
    }

    pub fn get(&self, ip: IpAddr, lane: Lane) -> u64 {
        self.counters.get(&ip).map_or(0, |c| c.get(lane))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "10.0.0.7".parse().unwrap()
    }

    #[test]
    fn lanes_accumulate_independently() {
        let ledger = ByteLedger::new([ip()]);
        ledger.add(ip(), Lane::Probe, 10);
        ledger.add(ip(), Lane::Common(0), 20);
        ledger.add(ip(), Lane::Common(1), 30);
        ledger.add(ip(), Lane::Common(1), 5);

        assert_eq!(ledger.get(ip(), Lane::Probe), 10);
        assert_eq!(ledger.get(ip(), Lane::Common(0)), 20);
        assert_eq!(ledger.get(ip(), Lane::Common(1)), 35);
    }

    #[test]
    fn unknown_interface_is_a_noop() {
        let ledger = ByteLedger::new([ip()]);
        let other: IpAddr = "10.0.0.8".parse().unwrap();
        ledger.add(other, Lane::Probe, 10);
        assert_eq!(ledger.get(other, Lane::Probe), 0);
    }

    #[test]
    fn counters_never_decrease() {
        let ledger = ByteLedger::new([ip()]);
        let mut last = 0;
        for n in [3u64, 0, 17, 1] {
            ledger.add(ip(), Lane::Common(0), n);
            let now = ledger.get(ip(), Lane::Common(0));
            assert!(now >= last);
            last = now;
        }
    }
}
