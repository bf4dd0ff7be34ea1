//! A condition is a named `(state, data)` pair clients can wait on.  Waiting for a state at or
//! below the current one answers immediately; otherwise the waiter parks until enough broadcasts
//! advance the state.  Broadcast releases every waiter whose target has been reached, in target
//! order.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use replicant_pb::ServerId;

//////////////////////////////////////////// Condition /////////////////////////////////////////////

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct Waiter {
    wait_for: u64,
    client: ServerId,
    nonce: u64,
}

/// A client released by a wait or broadcast, along with the state and data to answer with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Woken {
    pub client: ServerId,
    pub nonce: u64,
    pub state: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct Condition {
    state: u64,
    data: Vec<u8>,
    waiters: BinaryHeap<Reverse<Waiter>>,
}

impl Condition {
    pub fn new(initial: u64) -> Self {
        Self {
            state: initial,
            data: Vec::new(),
            waiters: BinaryHeap::new(),
        }
    }

    pub fn peek_state(&self) -> u64 {
        self.state
    }

    pub fn peek(&self) -> (u64, &[u8]) {
        (self.state, &self.data)
    }

    /// Wait for the condition to reach `wait_for`.  Returns the response to deliver now, or None
    /// if the client parked.
    pub fn wait(&mut self, client: ServerId, nonce: u64, wait_for: u64) -> Option<Woken> {
        if wait_for <= self.state {
            Some(Woken {
                client,
                nonce,
                state: self.state,
                data: self.data.clone(),
            })
        } else {
            self.waiters.push(Reverse(Waiter {
                wait_for,
                client,
                nonce,
            }));
            None
        }
    }

    /// Advance the state by one, optionally replacing the data, and release every waiter whose
    /// target has been reached.
    pub fn broadcast(&mut self, data: Option<Vec<u8>>) -> Vec<Woken> {
        self.state += 1;
        if let Some(data) = data {
            self.data = data;
        }
        let mut woken = Vec::new();
        while let Some(Reverse(waiter)) = self.waiters.peek() {
            if waiter.wait_for > self.state {
                break;
            }
            let Reverse(waiter) = self.waiters.pop().unwrap();
            woken.push(Woken {
                client: waiter.client,
                nonce: waiter.nonce,
                state: self.state,
                data: self.data.clone(),
            });
        }
        woken
    }

    /// Drain every parked waiter, for teardown.  The caller answers them however the teardown
    /// demands.
    pub fn drain(&mut self) -> Vec<(ServerId, u64)> {
        self.waiters
            .drain()
            .map(|Reverse(w)| (w.client, w.nonce))
            .collect()
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
    fn immediate_wake_at_or_below_state() {
        let mut cond = Condition::new(5);
        let woken = cond.wait(sid(1), 100, 5).unwrap();
        assert_eq!(5, woken.state);
        let woken = cond.wait(sid(1), 101, 0).unwrap();
        assert_eq!(5, woken.state);
    }

    #[test]
    fn parked_waiters_release_in_order() {
        let mut cond = Condition::new(0);
        assert!(cond.wait(sid(1), 100, 2).is_none());
        assert!(cond.wait(sid(2), 200, 1).is_none());
        let woken = cond.broadcast(None);
        assert_eq!(1, woken.len());
        assert_eq!(sid(2), woken[0].client);
        assert_eq!(1, woken[0].state);
        let woken = cond.broadcast(None);
        assert_eq!(1, woken.len());
        assert_eq!(sid(1), woken[0].client);
        assert_eq!(2, woken[0].state);
    }

    #[test]
    fn broadcast_data_reaches_waiters() {
        let mut cond = Condition::new(0);
        assert!(cond.wait(sid(1), 100, 1).is_none());
        let woken = cond.broadcast(Some(b"payload".to_vec()));
        assert_eq!(b"payload".to_vec(), woken[0].data);
        // Data persists for later immediate wakes.
        let woken = cond.wait(sid(2), 200, 1).unwrap();
        assert_eq!(b"payload".to_vec(), woken.data);
    }

    #[test]
    fn wait_response_state_is_at_least_target() {
        let mut cond = Condition::new(0);
        assert!(cond.wait(sid(1), 100, 3).is_none());
        cond.broadcast(None);
        cond.broadcast(None);
        let woken = cond.broadcast(None);
        assert_eq!(1, woken.len());
        assert!(woken[0].state >= 3);
    }
}
