//! A scout drives phase 1 of Paxos for one ballot:  it rallies acceptors behind the ballot and
//! merges the pvalues they report so the leader it becomes can re-propose them.

use replicant_pb::{Ballot, PValue, ServerId, SLOTS_WINDOW};

////////////////////////////////////////////// Scout ///////////////////////////////////////////////

/// A command a client submitted while the election was in progress.  The leader proposes it once
/// elected, within the recorded slot constraint.
#[derive(Clone, Debug)]
pub struct EnqueuedProposal {
    pub start: u64,
    pub limit: u64,
    pub command: Vec<u8>,
}

pub struct Scout {
    ballot: Ballot,
    acceptors: Vec<ServerId>,
    taken_up: Vec<ServerId>,
    pvals: Vec<PValue>,
    start: u64,
    limit: u64,
    enqueued: Vec<EnqueuedProposal>,
}

impl Scout {
    pub fn new(ballot: Ballot, acceptors: &[ServerId]) -> Self {
        assert!(!acceptors.is_empty());
        Self {
            ballot,
            acceptors: acceptors.to_vec(),
            taken_up: Vec::new(),
            pvals: Vec::new(),
            start: 0,
            limit: SLOTS_WINDOW,
            enqueued: Vec::new(),
        }
    }

    pub fn current_ballot(&self) -> Ballot {
        self.ballot
    }

    pub fn acceptors(&self) -> &[ServerId] {
        &self.acceptors
    }

    pub fn taken_up(&self) -> &[ServerId] {
        &self.taken_up
    }

    pub fn pvals(&self) -> &[PValue] {
        &self.pvals
    }

    pub fn window_start(&self) -> u64 {
        self.start
    }

    pub fn window_limit(&self) -> u64 {
        self.limit
    }

    pub fn set_window(&mut self, start: u64, limit: u64) {
        self.start = start;
        self.limit = limit;
    }

    pub fn enqueued(&self) -> &[EnqueuedProposal] {
        &self.enqueued
    }

    /// Remember a command for the leader to propose once elected.
    pub fn enqueue(&mut self, start: u64, limit: u64, command: Vec<u8>) {
        self.enqueued.push(EnqueuedProposal {
            start,
            limit,
            command,
        });
    }

    /// Record a phase-1b response.  Returns true iff this is a new response from a configured
    /// acceptor.  Pvalues are merged, deduplicated, and sorted.
    pub fn take_up(&mut self, si: ServerId, pvals: &[PValue]) -> bool {
        if self.taken_up.contains(&si) || !self.acceptors.contains(&si) {
            return false;
        }
        self.taken_up.push(si);
        self.pvals.extend_from_slice(pvals);
        self.pvals.sort();
        self.pvals.dedup();
        true
    }

    /// The configured acceptors that have not yet taken up the ballot.
    pub fn missing(&self) -> Vec<ServerId> {
        self.acceptors
            .iter()
            .filter(|a| !self.taken_up.contains(a))
            .copied()
            .collect()
    }

    /// True once a strict majority of the configured acceptors have taken up the ballot.
    pub fn adopted(&self) -> bool {
        self.taken_up.len() > self.acceptors.len() - self.taken_up.len()
    }
}

impl std::fmt::Display for Scout {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "scout({})", self.ballot)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(x: u64) -> ServerId {
        ServerId::new(x)
    }

    fn scout3() -> Scout {
        Scout::new(Ballot::new(2, sid(1)), &[sid(1), sid(2), sid(3)])
    }

    #[test]
    fn majority_of_three() {
        let mut scout = scout3();
        assert!(!scout.adopted());
        assert!(scout.take_up(sid(1), &[]));
        assert!(!scout.adopted());
        assert!(scout.take_up(sid(2), &[]));
        assert!(scout.adopted());
    }

    #[test]
    fn duplicate_and_foreign_responses_ignored() {
        let mut scout = scout3();
        assert!(scout.take_up(sid(1), &[]));
        assert!(!scout.take_up(sid(1), &[]));
        assert!(!scout.take_up(sid(9), &[]));
        assert_eq!(1, scout.taken_up().len());
    }

    #[test]
    fn missing_shrinks_as_responses_arrive() {
        let mut scout = scout3();
        assert_eq!(vec![sid(1), sid(2), sid(3)], scout.missing());
        scout.take_up(sid(2), &[]);
        assert_eq!(vec![sid(1), sid(3)], scout.missing());
    }

    #[test]
    fn pvals_merge_and_dedup() {
        let mut scout = scout3();
        let p1 = PValue::new(Ballot::new(1, sid(1)), 0, b"a".to_vec());
        let p2 = PValue::new(Ballot::new(1, sid(2)), 0, b"b".to_vec());
        scout.take_up(sid(1), &[p1.clone(), p2.clone()]);
        scout.take_up(sid(2), &[p1.clone()]);
        assert_eq!(vec![p1, p2], scout.pvals().to_vec());
    }

    #[test]
    fn enqueued_commands_are_retained() {
        let mut scout = scout3();
        scout.enqueue(5, 10, b"cmd".to_vec());
        assert_eq!(1, scout.enqueued().len());
        assert_eq!(5, scout.enqueued()[0].start);
        assert_eq!(10, scout.enqueued()[0].limit);
    }
}
