//! A snapshot captures the replica and every hosted object at a single slot boundary.  The
//! replica contributes its internal state immediately; each object contributes from its own
//! thread once it has executed everything below the snapshot slot.  If any participating object
//! fails mid-capture the snapshot is aborted rather than published.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex};

use buffertk::stack_pack;

use prototk_derive::Message;

///////////////////////////////////////// SnapshotContents /////////////////////////////////////////

/// One object's contribution to a snapshot.
#[derive(Clone, Debug, Default, Message)]
pub struct ObjectState {
    #[prototk(1, string)]
    pub name: String,
    #[prototk(2, bytes)]
    pub state: Vec<u8>,
}

/// A frame holding one object contribution.  Frames concatenate onto the replica's internal
/// state; the reader sees them as the repeated `objects` field of the full snapshot message.
#[derive(Clone, Debug, Default, Message)]
pub struct ObjectStateFrame {
    #[prototk(15, message)]
    pub object: ObjectState,
}

///////////////////////////////////////////// Snapshot /////////////////////////////////////////////

#[derive(Default)]
struct State {
    outstanding: BTreeSet<String>,
    objects: Vec<ObjectState>,
    failed: bool,
}

pub struct Snapshot {
    slot: u64,
    replica: Vec<u8>,
    state: Mutex<State>,
    done: Condvar,
}

impl Snapshot {
    pub fn new(slot: u64, replica: Vec<u8>) -> Self {
        Self {
            slot,
            replica,
            state: Mutex::new(State::default()),
            done: Condvar::new(),
        }
    }

    /// The slot boundary this snapshot observes:  everything below it applied, nothing at or
    /// above it.
    pub fn slot(&self) -> u64 {
        self.slot
    }

    /// Declare that the named object will contribute.  Called with the replica's snapshot lock
    /// held, before any higher-slot command reaches the object.
    pub fn start_object(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.outstanding.insert(name.to_string());
    }

    /// Deliver the named object's contribution.
    pub fn finish_object(&self, name: &str, snap: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        if state.outstanding.remove(name) {
            state.objects.push(ObjectState {
                name: name.to_string(),
                state: snap,
            });
        }
        self.done.notify_all();
    }

    /// Give up on the snapshot.  A snapshot with no outstanding objects is complete and stays
    /// complete; one still waiting on an object is marked failed.
    pub fn abort(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.outstanding.is_empty() {
            state.failed = true;
        }
        self.done.notify_all();
    }

    pub fn done(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.failed || state.outstanding.is_empty()
    }

    pub fn failed(&self) -> bool {
        self.state.lock().unwrap().failed
    }

    /// Block until every object has contributed or the snapshot is aborted.
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.failed && !state.outstanding.is_empty() {
            state = self.done.wait(state).unwrap();
        }
    }

    /// Serialize the finished snapshot:  the replica's internal state followed by each object's
    /// contribution.  Objects sort by name so every replica publishes identical bytes.
    pub fn contents(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        assert!(!state.failed && state.outstanding.is_empty());
        let mut objects = state.objects.clone();
        objects.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
        let mut buf = self.replica.clone();
        for object in objects.into_iter() {
            stack_pack(ObjectStateFrame { object }).append_to_vec(&mut buf);
        }
        buf
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_is_done() {
        let snap = Snapshot::new(10, b"replica".to_vec());
        assert!(snap.done());
        assert!(!snap.failed());
        snap.wait();
        assert_eq!(10, snap.slot());
    }

    #[test]
    fn waits_for_every_object() {
        let snap = Snapshot::new(10, b"replica".to_vec());
        snap.start_object("a");
        snap.start_object("b");
        assert!(!snap.done());
        snap.finish_object("a", b"A".to_vec());
        assert!(!snap.done());
        snap.finish_object("b", b"B".to_vec());
        assert!(snap.done());
        assert!(!snap.failed());
    }

    #[test]
    fn abort_fails_incomplete_snapshots_only() {
        let snap = Snapshot::new(10, b"replica".to_vec());
        snap.start_object("a");
        snap.abort();
        assert!(snap.done());
        assert!(snap.failed());
        let snap = Snapshot::new(11, b"replica".to_vec());
        snap.abort();
        assert!(snap.done());
        assert!(!snap.failed());
    }

    #[test]
    fn unexpected_objects_are_ignored() {
        let snap = Snapshot::new(10, b"replica".to_vec());
        snap.start_object("a");
        snap.finish_object("b", b"B".to_vec());
        assert!(!snap.done());
        snap.finish_object("a", b"A".to_vec());
        assert!(snap.done());
    }
}
