//! Client commands that have been received but not yet ordered by Paxos.  A command waits here
//! until a cluster nonce can be assigned, then stays until the replica executes it (at which
//! point the nonce is looked up and the client answered) or until a ballot change forces a
//! re-send.

use std::collections::HashMap;

use replicant_pb::{Ballot, ServerId, SlotType};

/////////////////////////////////////////////// entry //////////////////////////////////////////////

#[derive(Clone, Debug)]
pub struct UnorderedCommand {
    pub on_behalf_of: ServerId,
    pub request_nonce: u64,
    pub slot_type: SlotType,
    pub command: Vec<u8>,
    pub command_nonce: u64,
    pub last_used_ballot: Ballot,
    pub lowest_possible_slot: u64,
    pub robust: bool,
}

impl UnorderedCommand {
    pub fn new(
        on_behalf_of: ServerId,
        request_nonce: u64,
        slot_type: SlotType,
        command: Vec<u8>,
    ) -> Self {
        Self {
            on_behalf_of,
            request_nonce,
            slot_type,
            command,
            command_nonce: 0,
            last_used_ballot: Ballot::BOTTOM,
            lowest_possible_slot: 0,
            robust: false,
        }
    }
}

/////////////////////////////////////////////// table //////////////////////////////////////////////

/// The table of in-flight and not-yet-assigned commands.  Guarded by one mutex in the daemon;
/// this structure holds the bookkeeping only.
#[derive(Default)]
pub struct UnorderedTable {
    in_flight: HashMap<u64, UnorderedCommand>,
    unassigned: Vec<UnorderedCommand>,
}

impl UnorderedTable {
    /// Park a command until a nonce is available.
    pub fn push_unassigned(&mut self, uc: UnorderedCommand) {
        self.unassigned.push(uc);
    }

    /// Move a command in flight under its assigned nonce.
    pub fn insert(&mut self, uc: UnorderedCommand) {
        assert!(uc.command_nonce != 0);
        self.in_flight.insert(uc.command_nonce, uc);
    }

    /// The next parked command, if in-flight capacity remains.
    pub fn pop_unassigned(&mut self, capacity: usize) -> Option<UnorderedCommand> {
        if self.unassigned.is_empty() || self.in_flight.len() >= capacity {
            return None;
        }
        Some(self.unassigned.remove(0))
    }

    /// Take the command out of flight when its slot executes.  Returns who to answer.
    pub fn remove(&mut self, command_nonce: u64) -> Option<UnorderedCommand> {
        self.in_flight.remove(&command_nonce)
    }

    pub fn get_mut(&mut self, command_nonce: u64) -> Option<&mut UnorderedCommand> {
        self.in_flight.get_mut(&command_nonce)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn unassigned(&self) -> usize {
        self.unassigned.len()
    }

    /// Commands whose last submission used a ballot older than `current`.  The caller re-sends
    /// them toward the new leader.
    pub fn stale(&mut self, current: Ballot) -> Vec<&mut UnorderedCommand> {
        self.in_flight
            .values_mut()
            .filter(|uc| uc.last_used_ballot < current)
            .collect()
    }

    /// The oldest in-flight command, used as the periodic heartbeat re-send.
    pub fn any_in_flight(&mut self) -> Option<&mut UnorderedCommand> {
        self.in_flight.values_mut().next()
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn uc(nonce: u64) -> UnorderedCommand {
        let mut uc = UnorderedCommand::new(ServerId::new(1), 100, SlotType::Poke, b"poke".to_vec());
        uc.command_nonce = nonce;
        uc
    }

    #[test]
    fn unassigned_respects_capacity() {
        let mut table = UnorderedTable::default();
        table.push_unassigned(uc(0));
        table.insert(uc(1));
        assert!(table.pop_unassigned(1).is_none());
        assert!(table.pop_unassigned(2).is_some());
        assert_eq!(0, table.unassigned());
    }

    #[test]
    fn remove_returns_the_command() {
        let mut table = UnorderedTable::default();
        table.insert(uc(7));
        let got = table.remove(7).unwrap();
        assert_eq!(7, got.command_nonce);
        assert!(table.remove(7).is_none());
    }

    #[test]
    fn stale_finds_old_ballots() {
        let mut table = UnorderedTable::default();
        let mut fresh = uc(1);
        fresh.last_used_ballot = Ballot::new(5, ServerId::new(1));
        table.insert(fresh);
        table.insert(uc(2));
        let stale = table.stale(Ballot::new(5, ServerId::new(1)));
        assert_eq!(1, stale.len());
        assert_eq!(2, stale[0].command_nonce);
    }
}
