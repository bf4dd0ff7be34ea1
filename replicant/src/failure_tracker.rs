//! A heuristic answer to "is peer X suspected failed?", based on proof-of-life timestamps fed by
//! pings, pongs, and protocol traffic.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use replicant_pb::ServerId;

////////////////////////////////////////// FailureTracker //////////////////////////////////////////

#[derive(Debug, Default)]
pub struct FailureTracker {
    last_seen: HashMap<ServerId, Instant>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that we heard from the peer just now.
    pub fn proof_of_life(&mut self, si: ServerId) {
        self.last_seen.insert(si, Instant::now());
    }

    /// True iff the peer has been silent for at least `timeout`.  A peer never heard from is
    /// suspected immediately.
    pub fn suspect_failed(&self, si: ServerId, timeout: Duration) -> bool {
        match self.last_seen.get(&si) {
            Some(when) => when.elapsed() >= timeout,
            None => true,
        }
    }

    /// Grant every peer a fresh grace period.  Called after configuration changes so the first
    /// post-change tick cannot condemn a server that simply had no reason to talk to us yet.
    pub fn assume_all_alive(&mut self, peers: &[ServerId]) {
        let now = Instant::now();
        for &si in peers {
            self.last_seen.insert(si, now);
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(x: u64) -> ServerId {
        ServerId::new(x)
    }

    #[test]
    fn unknown_peers_are_suspect() {
        let ft = FailureTracker::new();
        assert!(ft.suspect_failed(sid(1), Duration::from_secs(5)));
    }

    #[test]
    fn proof_of_life_clears_suspicion() {
        let mut ft = FailureTracker::new();
        ft.proof_of_life(sid(1));
        assert!(!ft.suspect_failed(sid(1), Duration::from_secs(5)));
        assert!(ft.suspect_failed(sid(1), Duration::ZERO));
    }

    #[test]
    fn assume_all_alive_grants_grace() {
        let mut ft = FailureTracker::new();
        ft.assume_all_alive(&[sid(1), sid(2)]);
        assert!(!ft.suspect_failed(sid(1), Duration::from_secs(5)));
        assert!(!ft.suspect_failed(sid(2), Duration::from_secs(5)));
        assert!(ft.suspect_failed(sid(3), Duration::from_secs(5)));
    }
}
