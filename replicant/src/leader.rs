//! A leader drives phase 2 of Paxos while its ballot is held:  it owns one commander per slot,
//! proposes commands into free slots, and gathers phase-2b acknowledgments until a quorum commits
//! each slot.

use std::collections::BTreeMap;

use replicant_pb::{Ballot, PValue, ServerId};

use super::scout::Scout;

//////////////////////////////////////////// Commander /////////////////////////////////////////////

/// Tracks one slot's proposal and which acceptors have acknowledged it.
struct Commander {
    pval: PValue,
    accepted_by: Vec<ServerId>,
}

impl Commander {
    fn new(pval: PValue) -> Self {
        Self {
            pval,
            accepted_by: Vec::new(),
        }
    }

    fn accepted_by(&self, si: ServerId) -> bool {
        self.accepted_by.contains(&si)
    }

    fn accept(&mut self, si: ServerId) {
        if !self.accepted_by(si) {
            self.accepted_by.push(si);
        }
    }
}

////////////////////////////////////////////// Leader //////////////////////////////////////////////

pub struct Leader {
    ballot: Ballot,
    acceptors: Vec<ServerId>,
    quorum: usize,
    commanders: BTreeMap<u64, Commander>,
    start: u64,
    limit: u64,
}

impl Leader {
    /// Promote a successful scout.  Seeds a commander per slot from the merged pvalues (highest
    /// ballot wins), relabels them under the new ballot, fills every gap at or above the window
    /// start with a Nop, and appends the proposals clients enqueued during the election.
    pub fn new(scout: &Scout) -> Self {
        let ballot = scout.current_ballot();
        let mut commanders: BTreeMap<u64, Commander> = BTreeMap::new();
        for pval in scout.pvals() {
            if pval.slot < scout.window_start() {
                continue;
            }
            match commanders.get_mut(&pval.slot) {
                Some(commander) => {
                    if commander.pval.ballot < pval.ballot {
                        *commander = Commander::new(pval.clone());
                    }
                }
                None => {
                    commanders.insert(pval.slot, Commander::new(pval.clone()));
                }
            }
        }
        for commander in commanders.values_mut() {
            commander.pval.ballot = ballot;
        }
        // Fill [window_start, max_seeded] so no slot below a seeded proposal is left open; a gap
        // there would stall the replicas behind a slot nobody proposes into.
        let max_seeded = commanders.keys().next_back().copied();
        let mut next = scout.window_start();
        if let Some(max_seeded) = max_seeded {
            for slot in scout.window_start()..max_seeded {
                commanders
                    .entry(slot)
                    .or_insert_with(|| Commander::new(PValue::nop(ballot, slot)));
            }
            next = std::cmp::max(next, max_seeded + 1);
        }
        for enqueued in scout.enqueued() {
            if enqueued.start <= next && next < enqueued.limit {
                commanders.insert(
                    next,
                    Commander::new(PValue::new(ballot, next, enqueued.command.clone())),
                );
                next += 1;
            }
        }
        Self {
            ballot,
            acceptors: scout.taken_up().to_vec(),
            quorum: scout.acceptors().len() / 2 + 1,
            commanders,
            start: scout.window_start(),
            limit: scout.window_limit(),
        }
    }

    pub fn current_ballot(&self) -> Ballot {
        self.ballot
    }

    pub fn acceptors(&self) -> &[ServerId] {
        &self.acceptors
    }

    pub fn quorum_size(&self) -> usize {
        self.quorum
    }

    pub fn window_start(&self) -> u64 {
        self.start
    }

    pub fn window_limit(&self) -> u64 {
        self.limit
    }

    /// Phase-2a messages for every outstanding proposal, addressed to the acceptors that have not
    /// yet acknowledged it.  Used on promotion and on every maintenance tick.
    pub fn all_proposals(&self) -> Vec<(ServerId, PValue)> {
        let mut sends = Vec::new();
        for commander in self.commanders.values() {
            Self::proposal(
                &self.acceptors,
                self.start,
                self.limit,
                commander,
                &mut sends,
            );
        }
        sends
    }

    fn proposal(
        acceptors: &[ServerId],
        start: u64,
        limit: u64,
        commander: &Commander,
        sends: &mut Vec<(ServerId, PValue)>,
    ) {
        if commander.pval.slot < start || commander.pval.slot >= limit {
            return;
        }
        for &si in acceptors {
            if !commander.accepted_by(si) {
                sends.push((si, commander.pval.clone()));
            }
        }
    }

    /// Record a phase-2b acknowledgment.  Returns true when the slot has reached quorum; the
    /// caller then broadcasts the learned pvalue.
    pub fn accept(&mut self, si: ServerId, p: &PValue) -> bool {
        if !self.acceptors.contains(&si) {
            return false;
        }
        let Some(commander) = self.commanders.get_mut(&p.slot) else {
            return false;
        };
        if commander.pval != *p {
            return false;
        }
        commander.accept(si);
        commander.accepted_by.len() >= self.quorum
    }

    /// Install a command into the lowest free slot within `[max(slot_start, window_start),
    /// slot_limit)` and return the phase-2a messages to send.  A full range proposes nothing; the
    /// client's retry finds the next window.
    pub fn propose(&mut self, slot_start: u64, slot_limit: u64, command: Vec<u8>) -> Vec<(ServerId, PValue)> {
        let search_start = std::cmp::max(slot_start, self.start);
        let mut slot = None;
        for s in search_start..slot_limit {
            if !self.commanders.contains_key(&s) {
                slot = Some(s);
                break;
            }
        }
        let Some(slot) = slot else {
            return Vec::new();
        };
        let commander = Commander::new(PValue::new(self.ballot, slot, command));
        let mut sends = Vec::new();
        Self::proposal(&self.acceptors, self.start, self.limit, &commander, &mut sends);
        self.commanders.insert(slot, commander);
        sends
    }

    /// Widen the legal slot window.  Proposals that just became legal are re-sent, and gaps below
    /// the highest owned slot are Nop-filled.
    pub fn set_window(&mut self, start: u64, limit: u64) -> Vec<(ServerId, PValue)> {
        assert!(start >= self.start);
        assert!(limit >= self.limit);
        let max_slot = self
            .commanders
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.start);
        let old_limit = self.limit;
        self.start = start;
        self.limit = limit;
        let mut sends = Vec::new();
        for slot in old_limit..self.limit {
            if let Some(commander) = self.commanders.get(&slot) {
                Self::proposal(&self.acceptors, self.start, self.limit, commander, &mut sends);
            }
        }
        sends.extend(self.nop_fill(max_slot));
        sends
    }

    /// Nop-propose every free slot in the window.  Used when a configuration change is pending
    /// and the cluster must reach its first slot.
    pub fn fill_window(&mut self) -> Vec<(ServerId, PValue)> {
        self.nop_fill(self.limit)
    }

    fn nop_fill(&mut self, limit: u64) -> Vec<(ServerId, PValue)> {
        let mut sends = Vec::new();
        for slot in self.start..limit {
            if self.commanders.contains_key(&slot) {
                continue;
            }
            let commander = Commander::new(PValue::nop(self.ballot, slot));
            Self::proposal(&self.acceptors, self.start, self.limit, &commander, &mut sends);
            self.commanders.insert(slot, commander);
        }
        sends
    }

    /// Drop commanders for slots the cluster has garbage collected.
    pub fn garbage_collect(&mut self, below: u64) {
        self.commanders = self.commanders.split_off(&below);
    }
}

impl std::fmt::Display for Leader {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "leader({})", self.ballot)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(x: u64) -> ServerId {
        ServerId::new(x)
    }

    fn adopted_scout(pvals: &[PValue], start: u64) -> Scout {
        let mut scout = Scout::new(Ballot::new(3, sid(1)), &[sid(1), sid(2), sid(3)]);
        scout.set_window(start, start + 64);
        scout.take_up(sid(1), pvals);
        scout.take_up(sid(2), &[]);
        assert!(scout.adopted());
        scout
    }

    #[test]
    fn seeds_relabel_to_leader_ballot() {
        let old = Ballot::new(1, sid(2));
        let scout = adopted_scout(&[PValue::new(old, 4, b"cmd".to_vec())], 4);
        let leader = Leader::new(&scout);
        let sends = leader.all_proposals();
        assert!(!sends.is_empty());
        for (_, pval) in &sends {
            assert_eq!(Ballot::new(3, sid(1)), pval.ballot);
            assert_eq!(4, pval.slot);
            assert_eq!(b"cmd".to_vec(), pval.command);
        }
    }

    #[test]
    fn seeding_keeps_highest_ballot_per_slot() {
        let scout = adopted_scout(
            &[
                PValue::new(Ballot::new(1, sid(2)), 4, b"low".to_vec()),
                PValue::new(Ballot::new(2, sid(3)), 4, b"high".to_vec()),
            ],
            4,
        );
        let leader = Leader::new(&scout);
        let sends = leader.all_proposals();
        assert!(sends.iter().all(|(_, p)| p.command == b"high".to_vec()));
    }

    #[test]
    fn nop_fill_covers_window_start_through_max_seeded() {
        // Seeded slots 5 and 7 with the window starting at 3:  slots 3, 4, and 6 get Nops, and
        // slot 7 (the highest seeded slot) is proposed rather than skipped.
        let scout = adopted_scout(
            &[
                PValue::new(Ballot::new(1, sid(2)), 5, b"five".to_vec()),
                PValue::new(Ballot::new(1, sid(2)), 7, b"seven".to_vec()),
            ],
            3,
        );
        let leader = Leader::new(&scout);
        let mut slots: Vec<u64> = leader.all_proposals().iter().map(|(_, p)| p.slot).collect();
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(vec![3, 4, 5, 6, 7], slots);
        let sends = leader.all_proposals();
        let nop_slots: Vec<u64> = sends
            .iter()
            .filter(|(_, p)| p.command.is_empty())
            .map(|(_, p)| p.slot)
            .collect();
        assert!(nop_slots.contains(&3));
        assert!(nop_slots.contains(&4));
        assert!(nop_slots.contains(&6));
        assert!(!nop_slots.contains(&7));
    }

    #[test]
    fn propose_takes_lowest_free_slot() {
        let scout = adopted_scout(&[], 0);
        let mut leader = Leader::new(&scout);
        let sends = leader.propose(0, 64, b"first".to_vec());
        assert!(sends.iter().all(|(_, p)| p.slot == 0));
        let sends = leader.propose(0, 64, b"second".to_vec());
        assert!(sends.iter().all(|(_, p)| p.slot == 1));
        // Range exhausted:  nothing proposed.
        let sends = leader.propose(0, 2, b"third".to_vec());
        assert!(sends.is_empty());
    }

    #[test]
    fn quorum_requires_configured_majority() {
        let scout = adopted_scout(&[], 0);
        let mut leader = Leader::new(&scout);
        assert_eq!(2, leader.quorum_size());
        let pval = leader.propose(0, 64, b"cmd".to_vec())[0].1.clone();
        assert!(!leader.accept(sid(1), &pval));
        // Unknown acceptors and mismatched pvalues never count.
        assert!(!leader.accept(sid(9), &pval));
        let mut wrong = pval.clone();
        wrong.command = b"other".to_vec();
        assert!(!leader.accept(sid(2), &wrong));
        assert!(leader.accept(sid(2), &pval));
    }

    #[test]
    fn enqueued_proposals_follow_seeds() {
        let mut scout = Scout::new(Ballot::new(3, sid(1)), &[sid(1), sid(2), sid(3)]);
        scout.set_window(0, 64);
        scout.enqueue(0, 64, b"queued".to_vec());
        scout.take_up(sid(1), &[PValue::new(Ballot::new(1, sid(2)), 2, b"seed".to_vec())]);
        scout.take_up(sid(2), &[]);
        let leader = Leader::new(&scout);
        let sends = leader.all_proposals();
        let queued: Vec<u64> = sends
            .iter()
            .filter(|(_, p)| p.command == b"queued".to_vec())
            .map(|(_, p)| p.slot)
            .collect();
        assert!(queued.iter().all(|&s| s == 3));
        assert!(!queued.is_empty());
    }

    #[test]
    fn set_window_resends_and_fills() {
        let scout = adopted_scout(&[], 0);
        let mut leader = Leader::new(&scout);
        leader.propose(0, 64, b"cmd".to_vec());
        let sends = leader.set_window(1, 128);
        // Slot 0's command is behind the new start; nothing below start is re-proposed.
        assert!(sends.iter().all(|(_, p)| p.slot >= 1));
    }

    #[test]
    fn garbage_collect_drops_low_slots() {
        let scout = adopted_scout(&[], 0);
        let mut leader = Leader::new(&scout);
        leader.propose(0, 64, b"a".to_vec());
        leader.propose(0, 64, b"b".to_vec());
        leader.garbage_collect(1);
        let slots: Vec<u64> = leader.all_proposals().iter().map(|(_, p)| p.slot).collect();
        assert!(slots.iter().all(|&s| s >= 1));
    }
}
