//! Each replicated object is hosted by a child process that speaks a framed protocol over one end
//! of a `socketpair(AF_UNIX, SOCK_STREAM)`.  The supervisor here owns the child, feeds it calls
//! in slot order from a background thread, captures its snapshots, and on any I/O error or
//! malformed response declares the object FAILED:  pending callers get `Maybe`, the child is
//! reaped, and the server loop is told so the repair protocol can begin.
//!
//! Pipe protocol (all integers big-endian).  Supervisor writes an Action byte:
//!
//! - `CTOR` (1):  first-time construction.
//! - `RTOR` (2) + u32 length + snapshot bytes:  restore from a snapshot.
//! - `COMMAND` (3) + u64 length + u32 func-length + func + u32 input-length + input.
//! - `SNAPSHOT` (4):  request a snapshot; the response is u32 length + bytes.
//!
//! The object answers a COMMAND with a stream of Response bytes, terminated by `OUTPUT`:
//!
//! - `LOG` (1) + u32 + bytes:  diagnostic log line.
//! - `COND_CREATE` (2) + u32 + name.
//! - `COND_DESTROY` (3) + u32 + name.
//! - `COND_BROADCAST` (4) + u32 + name; acked with 0 (exists) or 1 (missing).
//! - `COND_BROADCAST_DATA` (5) + u32 + name + u32 + data; acked the same way.
//! - `COND_CURRENT_VALUE` (6) + u32 + name; answered 0 + u64 state + u32 length + data, or 1.
//! - `TICK_INTERVAL` (7) + u32 + func + u64 interval:  register a periodic tick function.
//! - `OUTPUT` (8) + u16 status + u32 length + bytes:  terminates the call.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

use biometrics::{Collector, Counter};

use buffertk::{stack_pack, Unpackable};

use indicio::{clue, INFO, WARNING};

use prototk_derive::Message;

use replicant_pb::{ReturnCode, ServerId, Tick};

use super::condition::Condition;
use super::replica::ReplicaShared;
use super::snapshot::Snapshot;
use super::COLLECTOR;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

pub const OBJECT_LIBRARY: u32 = 1;

const ACTION_CTOR: u8 = 1;
const ACTION_RTOR: u8 = 2;
const ACTION_COMMAND: u8 = 3;
const ACTION_SNAPSHOT: u8 = 4;

const RESP_LOG: u8 = 1;
const RESP_COND_CREATE: u8 = 2;
const RESP_COND_DESTROY: u8 = 3;
const RESP_COND_BROADCAST: u8 = 4;
const RESP_COND_BROADCAST_DATA: u8 = 5;
const RESP_COND_CURRENT_VALUE: u8 = 6;
const RESP_TICK_INTERVAL: u8 = 7;
const RESP_OUTPUT: u8 = 8;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static OBJECT_NEW: Counter = Counter::new("replicant.object.new");
static OBJECT_CALL: Counter = Counter::new("replicant.object.call");
static OBJECT_SNAPSHOT: Counter = Counter::new("replicant.object.snapshot");
static OBJECT_FAILED: Counter = Counter::new("replicant.object.failed");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&OBJECT_NEW);
    collector.register_counter(&OBJECT_CALL);
    collector.register_counter(&OBJECT_SNAPSHOT);
    collector.register_counter(&OBJECT_FAILED);
}

////////////////////////////////////////// durable format //////////////////////////////////////////

/// One condition's durable form.  Waiters and data are per-process and do not survive.
#[derive(Clone, Debug, Default, Message)]
pub struct NamedCondition {
    #[prototk(1, string)]
    pub name: String,
    #[prototk(2, uint64)]
    pub state: u64,
}

/// A call executed after the base snapshot was taken.  Replayed through the child on restore.
#[derive(Clone, Debug, Default, Message)]
pub struct PackedCall {
    #[prototk(1, string)]
    pub func: String,
    #[prototk(2, bytes)]
    pub input: Vec<u8>,
    #[prototk(3, uint64)]
    pub slot: u64,
    #[prototk(4, uint32)]
    pub flags: u32,
    #[prototk(5, uint64)]
    pub command_nonce: u64,
    #[prototk(6, message)]
    pub si: ServerId,
    #[prototk(7, uint64)]
    pub request_nonce: u64,
}

/// A frame holding one replayable call.  Frames append onto a packed [ObjectSnapshot]; readers
/// see them merged into the repeated `replay` field.
#[derive(Clone, Debug, Default, Message)]
pub struct PackedCallFrame {
    #[prototk(8, message)]
    pub call: PackedCall,
}

/// The serialized state of one object:  how to relaunch it, its supervisor-side bookkeeping, the
/// child's own snapshot, and the calls to replay on top.
#[derive(Clone, Debug, Default, Message)]
pub struct ObjectSnapshot {
    #[prototk(1, uint32)]
    pub ty: u32,
    #[prototk(2, bytes)]
    pub init: Vec<u8>,
    #[prototk(3, uint64)]
    pub fail_at: u64,
    #[prototk(4, string)]
    pub tick_func: String,
    #[prototk(5, uint64)]
    pub tick_interval: u64,
    #[prototk(6, message)]
    pub conditions: Vec<NamedCondition>,
    #[prototk(7, bytes)]
    pub state: Vec<u8>,
    #[prototk(8, message)]
    pub replay: Vec<PackedCall>,
}

/////////////////////////////////////////// queued work ////////////////////////////////////////////

#[derive(Clone, Debug)]
pub struct EnqueuedCall {
    pub func: String,
    pub input: Vec<u8>,
    pub slot: u64,
    pub flags: u8,
    pub command_nonce: u64,
    pub si: ServerId,
    pub request_nonce: u64,
}

#[derive(Clone, Debug)]
struct EnqueuedCondWait {
    slot: u64,
    si: ServerId,
    nonce: u64,
    cond: String,
    state: u64,
}

#[derive(Clone)]
enum Boot {
    Ctor,
    Rtor(Box<ObjectSnapshot>),
}

////////////////////////////////////////////// Object //////////////////////////////////////////////

struct ObjState {
    pid: Option<libc::pid_t>,
    stream: Option<UnixStream>,
    boot: Option<Boot>,
    cond_waits: Vec<EnqueuedCondWait>,
    calls: Vec<EnqueuedCall>,
    snapshots: Vec<Arc<Snapshot>>,
    highest_slot: u64,
    fail_at: u64,
    failed: bool,
    done: bool,
}

/// One hosted object.  The supervisor thread holds a reference for its lifetime; the object is
/// freed once the thread exits and the replica forgets it.
pub struct Object {
    replica: Arc<ReplicaShared>,
    created_at: u64,
    name: String,
    init: Vec<u8>,
    state: Mutex<ObjState>,
    wake: Condvar,
    snap: Mutex<Vec<u8>>,
    last_executed: AtomicU64,
}

impl Object {
    pub fn new(
        replica: Arc<ReplicaShared>,
        created_at: u64,
        name: String,
        init: Vec<u8>,
    ) -> Arc<Object> {
        OBJECT_NEW.click();
        let obj = Arc::new(Object {
            replica,
            created_at,
            name,
            init,
            state: Mutex::new(ObjState {
                pid: None,
                stream: None,
                boot: None,
                cond_waits: Vec::new(),
                calls: Vec::new(),
                snapshots: Vec::new(),
                highest_slot: 0,
                fail_at: u64::MAX,
                failed: false,
                done: false,
            }),
            wake: Condvar::new(),
            snap: Mutex::new(Vec::new()),
            last_executed: AtomicU64::new(0),
        });
        let thread_obj = Arc::clone(&obj);
        std::thread::spawn(move || thread_obj.run());
        obj
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn last_executed(&self) -> u64 {
        self.last_executed.load(Ordering::Acquire)
    }

    /// The object's most recent serialized state, including calls executed since the child last
    /// snapshotted.
    pub fn last_state(&self) -> Vec<u8> {
        self.snap.lock().unwrap().clone()
    }

    pub fn failed(&self) -> bool {
        self.state.lock().unwrap().failed
    }

    pub fn done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    /// Hand the supervisor its child process and pipe.  `pid` is None only in tests, where the
    /// peer is a scripted thread instead of a process.
    pub fn set_child(&self, pid: Option<libc::pid_t>, stream: UnixStream) {
        let mut state = self.state.lock().unwrap();
        state.pid = pid;
        state.stream = Some(stream);
        self.wake.notify_all();
    }

    /// First-time construction.
    pub fn ctor(&self) {
        let mut state = self.state.lock().unwrap();
        state.boot = Some(Boot::Ctor);
        self.wake.notify_all();
    }

    /// Restore from a snapshot.  Supervisor bookkeeping is adopted immediately; the child state
    /// and replayable calls feed through the boot conversation.
    pub fn rtor(&self, snapshot: ObjectSnapshot) {
        let mut state = self.state.lock().unwrap();
        state.fail_at = snapshot.fail_at;
        for call in snapshot.replay.iter() {
            state.calls.push(EnqueuedCall {
                func: call.func.clone(),
                input: call.input.clone(),
                slot: call.slot,
                flags: call.flags as u8,
                command_nonce: call.command_nonce,
                si: call.si,
                request_nonce: call.request_nonce,
            });
            state.highest_slot = std::cmp::max(state.highest_slot, call.slot);
        }
        state.boot = Some(Boot::Rtor(Box::new(snapshot)));
        self.wake.notify_all();
    }

    /// Park a client on one of the object's conditions.  The wait is translated once the object
    /// thread has executed everything at or below the current slot.
    pub fn cond_wait(&self, si: ServerId, nonce: u64, cond: String, wait_for: u64) {
        let mut state = self.state.lock().unwrap();
        if state.failed || state.highest_slot >= state.fail_at {
            drop(state);
            self.replica
                .daemon()
                .callback_client(si, nonce, ReturnCode::Maybe, Vec::new());
            return;
        }
        let slot = state.highest_slot;
        state.cond_waits.push(EnqueuedCondWait {
            slot,
            si,
            nonce,
            cond,
            state: wait_for,
        });
        self.wake.notify_all();
    }

    /// Dispatch one slot's call to the object.
    pub fn call(&self, call: EnqueuedCall) {
        OBJECT_CALL.click();
        let mut state = self.state.lock().unwrap();
        if state.failed || call.slot >= state.fail_at {
            drop(state);
            self.replica.executed(
                call.slot,
                call.flags,
                call.command_nonce,
                call.si,
                call.request_nonce,
                ReturnCode::Maybe,
                Vec::new(),
            );
            return;
        }
        assert!(call.slot > state.highest_slot);
        state.highest_slot = call.slot;
        state.calls.push(call);
        self.wake.notify_all();
    }

    /// Enroll the object in a snapshot.  Called under the replica's snapshot lock so no
    /// higher-slot command can slip in between enrollment and capture.
    pub fn take_snapshot(&self, snap: &Arc<Snapshot>) {
        let mut state = self.state.lock().unwrap();
        if state.failed || snap.slot() >= state.fail_at {
            return;
        }
        snap.start_object(&self.name);
        state.snapshots.push(Arc::clone(snap));
        self.wake.notify_all();
    }

    /// Refuse commands at or above `slot`.  Zero tears the object down immediately.
    pub fn fail_at(&self, slot: u64) {
        let mut state = self.state.lock().unwrap();
        state.fail_at = slot;
        self.wake.notify_all();
    }

    /// Transition to FAILED:  answer everything pending with `Maybe` and reap the child.
    pub fn fail(&self) {
        let (cond_waits, calls, pid) = {
            let mut state = self.state.lock().unwrap();
            if state.failed {
                return;
            }
            state.failed = true;
            self.wake.notify_all();
            (
                std::mem::take(&mut state.cond_waits),
                std::mem::take(&mut state.calls),
                state.pid.take(),
            )
        };
        OBJECT_FAILED.click();
        if let Some(pid) = pid {
            reap_child(pid);
        }
        for cw in cond_waits {
            self.replica
                .daemon()
                .callback_client(cw.si, cw.nonce, ReturnCode::Maybe, Vec::new());
        }
        for c in calls {
            self.replica.executed(
                c.slot,
                c.flags,
                c.command_nonce,
                c.si,
                c.request_nonce,
                ReturnCode::Maybe,
                Vec::new(),
            );
        }
    }

    ////////////////////////////////// supervisor thread ///////////////////////////////////

    fn run(self: Arc<Object>) {
        let mut conditions: HashMap<String, Condition> = HashMap::new();
        let mut tick_func = String::new();
        let mut tick_interval = 0u64;
        let (stream, boot) = {
            let mut state = self.state.lock().unwrap();
            while !state.failed && (state.stream.is_none() || state.boot.is_none()) {
                state = self.wake.wait(state).unwrap();
            }
            if state.failed {
                state.done = true;
                return;
            }
            (state.stream.take().unwrap(), state.boot.take().unwrap())
        };
        let mut stream = stream;
        let boot_ok = match &boot {
            Boot::Ctor => self.boot_ctor(&mut stream, &mut conditions, &mut tick_func, &mut tick_interval),
            Boot::Rtor(snapshot) => {
                for cond in snapshot.conditions.iter() {
                    conditions.insert(cond.name.clone(), Condition::new(cond.state));
                }
                tick_func = snapshot.tick_func.clone();
                tick_interval = snapshot.tick_interval;
                self.boot_rtor(&mut stream, snapshot, &mut conditions, &mut tick_func, &mut tick_interval)
            }
        };
        if boot_ok {
            // The first capture, so repair always has a donor state to offer.
            let mut fail_at = self.state.lock().unwrap().fail_at;
            let _ = self.capture_state(&mut stream, &conditions, &tick_func, tick_interval, fail_at);
            let mut cond_waits: Vec<EnqueuedCondWait> = Vec::new();
            'serving: loop {
                let (new_waits, calls, snapshots, failed_at) = {
                    let mut state = self.state.lock().unwrap();
                    while !state.failed
                        && state.calls.is_empty()
                        && state.cond_waits.is_empty()
                        && state.snapshots.is_empty()
                        && state.fail_at == u64::MAX
                    {
                        state = self.wake.wait(state).unwrap();
                    }
                    if state.failed {
                        break 'serving;
                    }
                    (
                        std::mem::take(&mut state.cond_waits),
                        std::mem::take(&mut state.calls),
                        std::mem::take(&mut state.snapshots),
                        state.fail_at,
                    )
                };
                fail_at = failed_at;
                cond_waits.extend(new_waits);
                let mut calls = std::collections::VecDeque::from(calls);
                let mut snapshots = std::collections::VecDeque::from(snapshots);
                while !calls.is_empty() || !snapshots.is_empty() {
                    let call_slot = calls.front().map(|c| c.slot).unwrap_or(u64::MAX);
                    let snap_slot = snapshots.front().map(|s| s.slot()).unwrap_or(u64::MAX);
                    if snap_slot <= call_slot {
                        let snap = snapshots.pop_front().unwrap();
                        self.do_snapshot(&mut stream, &snap, &conditions, &tick_func, tick_interval, fail_at);
                    } else {
                        let call = calls.pop_front().unwrap();
                        self.do_call(&mut stream, &call, &mut conditions, &mut tick_func, &mut tick_interval);
                        stack_pack(PackedCallFrame {
                            call: PackedCall {
                                func: call.func.clone(),
                                input: call.input.clone(),
                                slot: call.slot,
                                flags: call.flags as u32,
                                command_nonce: call.command_nonce,
                                si: call.si,
                                request_nonce: call.request_nonce,
                            },
                        })
                        .append_to_vec(&mut self.snap.lock().unwrap());
                    }
                }
                let executed = self.last_executed();
                let mut idx = 0;
                while idx < cond_waits.len() {
                    if cond_waits[idx].slot <= executed {
                        let cw = cond_waits.remove(idx);
                        self.do_cond_wait(&cw, &mut conditions);
                    } else {
                        idx += 1;
                    }
                }
                if failed_at < u64::MAX {
                    self.last_executed.fetch_max(failed_at, Ordering::AcqRel);
                    self.fail();
                }
            }
            for cw in cond_waits {
                self.replica
                    .daemon()
                    .callback_client(cw.si, cw.nonce, ReturnCode::Maybe, Vec::new());
            }
        }
        self.fail();
        let leftover = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.snapshots)
        };
        for snap in leftover {
            snap.abort();
            self.replica.snapshot_finished();
        }
        self.replica.daemon().notify_object_failed();
        self.state.lock().unwrap().done = true;
    }

    fn boot_ctor(
        &self,
        stream: &mut UnixStream,
        conditions: &mut HashMap<String, Condition>,
        tick_func: &mut String,
        tick_interval: &mut u64,
    ) -> bool {
        if !self.write(stream, &[ACTION_CTOR]) {
            return false;
        }
        let boot_call = self.boot_call();
        self.drain_responses(stream, &boot_call, conditions, tick_func, tick_interval)
            .is_some()
    }

    fn boot_rtor(
        &self,
        stream: &mut UnixStream,
        snapshot: &ObjectSnapshot,
        conditions: &mut HashMap<String, Condition>,
        tick_func: &mut String,
        tick_interval: &mut u64,
    ) -> bool {
        let mut buf = vec![ACTION_RTOR];
        buf.extend_from_slice(&(snapshot.state.len() as u32).to_be_bytes());
        buf.extend_from_slice(&snapshot.state);
        if !self.write(stream, &buf) {
            return false;
        }
        let boot_call = self.boot_call();
        self.drain_responses(stream, &boot_call, conditions, tick_func, tick_interval)
            .is_some()
    }

    fn boot_call(&self) -> EnqueuedCall {
        EnqueuedCall {
            func: "<init>".to_string(),
            input: Vec::new(),
            slot: self.created_at,
            flags: 0,
            command_nonce: 0,
            si: ServerId::BOTTOM,
            request_nonce: 0,
        }
    }

    fn do_call(
        &self,
        stream: &mut UnixStream,
        call: &EnqueuedCall,
        conditions: &mut HashMap<String, Condition>,
        tick_func: &mut String,
        tick_interval: &mut u64,
    ) {
        self.last_executed.fetch_max(call.slot, Ordering::AcqRel);
        if self.failed() {
            self.replica.executed(
                call.slot,
                call.flags,
                call.command_nonce,
                call.si,
                call.request_nonce,
                ReturnCode::Maybe,
                Vec::new(),
            );
            return;
        }
        if call.func == "__backup__" {
            let snap = self.last_state();
            self.replica.executed(
                call.slot,
                call.flags,
                call.command_nonce,
                call.si,
                call.request_nonce,
                ReturnCode::Success,
                snap,
            );
            return;
        }
        let mut func = call.func.as_str();
        let mut input = call.input.as_slice();
        if call.func == "__tick__" {
            let tick = Tick::unpack(input).map(|x| x.0.tick).unwrap_or(0);
            if tick_func.is_empty() || *tick_interval == 0 || tick % *tick_interval != 0 {
                self.replica.executed(
                    call.slot,
                    call.flags,
                    call.command_nonce,
                    call.si,
                    call.request_nonce,
                    ReturnCode::Success,
                    Vec::new(),
                );
                return;
            }
            func = tick_func.as_str();
            input = &[];
        }
        let func_bytes = func.as_bytes();
        let sz = 4 + func_bytes.len() + 4 + input.len();
        let mut buf = Vec::with_capacity(9 + sz);
        buf.push(ACTION_COMMAND);
        buf.extend_from_slice(&(sz as u64).to_be_bytes());
        buf.extend_from_slice(&(func_bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(func_bytes);
        buf.extend_from_slice(&(input.len() as u32).to_be_bytes());
        buf.extend_from_slice(input);
        let outcome = if self.write(stream, &buf) {
            self.drain_responses(stream, call, conditions, tick_func, tick_interval)
        } else {
            None
        };
        let (status, output) = outcome.unwrap_or((ReturnCode::Maybe, Vec::new()));
        self.replica.executed(
            call.slot,
            call.flags,
            call.command_nonce,
            call.si,
            call.request_nonce,
            status,
            output,
        );
    }

    /// Read responses until OUTPUT, handling log lines, condition operations, and tick
    /// registration along the way.  None means the conversation failed.
    fn drain_responses(
        &self,
        stream: &mut UnixStream,
        call: &EnqueuedCall,
        conditions: &mut HashMap<String, Condition>,
        tick_func: &mut String,
        tick_interval: &mut u64,
    ) -> Option<(ReturnCode, Vec<u8>)> {
        loop {
            let mut tag = [0u8; 1];
            if !self.read(stream, &mut tag) {
                return None;
            }
            match tag[0] {
                RESP_LOG => {
                    let line = self.read_block(stream)?;
                    clue!(COLLECTOR, INFO, {
                        object: self.name.as_str(),
                        func: call.func.as_str(),
                        slot: call.slot,
                        log: String::from_utf8_lossy(&line).into_owned(),
                    });
                }
                RESP_COND_CREATE => {
                    let name = self.read_block(stream)?;
                    let name = String::from_utf8_lossy(&name).into_owned();
                    conditions.entry(name).or_insert_with(|| Condition::new(0));
                }
                RESP_COND_DESTROY => {
                    let name = self.read_block(stream)?;
                    let name = String::from_utf8_lossy(&name).into_owned();
                    if let Some(mut cond) = conditions.remove(&name) {
                        for (si, nonce) in cond.drain() {
                            self.replica.daemon().callback_client(
                                si,
                                nonce,
                                ReturnCode::CondDestroyed,
                                Vec::new(),
                            );
                        }
                    }
                }
                RESP_COND_BROADCAST => {
                    let name = self.read_block(stream)?;
                    let name = String::from_utf8_lossy(&name).into_owned();
                    let ack = if let Some(cond) = conditions.get_mut(&name) {
                        for woken in cond.broadcast(None) {
                            self.replica.daemon().callback_condition(
                                woken.client,
                                woken.nonce,
                                woken.state,
                                woken.data,
                            );
                        }
                        0u8
                    } else {
                        1u8
                    };
                    if !self.write(stream, &[ack]) {
                        return None;
                    }
                }
                RESP_COND_BROADCAST_DATA => {
                    let name = self.read_block(stream)?;
                    let name = String::from_utf8_lossy(&name).into_owned();
                    let data = self.read_block(stream)?;
                    let ack = if let Some(cond) = conditions.get_mut(&name) {
                        for woken in cond.broadcast(Some(data.clone())) {
                            self.replica.daemon().callback_condition(
                                woken.client,
                                woken.nonce,
                                woken.state,
                                woken.data,
                            );
                        }
                        0u8
                    } else {
                        1u8
                    };
                    if !self.write(stream, &[ack]) {
                        return None;
                    }
                }
                RESP_COND_CURRENT_VALUE => {
                    let name = self.read_block(stream)?;
                    let name = String::from_utf8_lossy(&name).into_owned();
                    match conditions.get(&name) {
                        Some(cond) => {
                            let (state, data) = cond.peek();
                            let mut buf = Vec::with_capacity(13 + data.len());
                            buf.push(0);
                            buf.extend_from_slice(&state.to_be_bytes());
                            buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
                            buf.extend_from_slice(data);
                            if !self.write(stream, &buf) {
                                return None;
                            }
                        }
                        None => {
                            if !self.write(stream, &[1]) {
                                return None;
                            }
                        }
                    }
                }
                RESP_TICK_INTERVAL => {
                    let func = self.read_block(stream)?;
                    let mut interval = [0u8; 8];
                    if !self.read(stream, &mut interval) {
                        return None;
                    }
                    *tick_func = String::from_utf8_lossy(&func).into_owned();
                    *tick_interval = u64::from_be_bytes(interval);
                }
                RESP_OUTPUT => {
                    let mut status = [0u8; 2];
                    if !self.read(stream, &mut status) {
                        return None;
                    }
                    let output = self.read_block(stream)?;
                    let status = ReturnCode::from_u32(u16::from_be_bytes(status) as u32);
                    return Some((status, output));
                }
                _ => {
                    clue!(COLLECTOR, WARNING, {
                        object: self.name.as_str(),
                        malformed_response: tag[0] as u32,
                    });
                    self.fail();
                    return None;
                }
            }
        }
    }

    fn do_cond_wait(&self, cw: &EnqueuedCondWait, conditions: &mut HashMap<String, Condition>) {
        if self.failed() {
            self.replica
                .daemon()
                .callback_client(cw.si, cw.nonce, ReturnCode::Maybe, Vec::new());
            return;
        }
        match conditions.get_mut(&cw.cond) {
            Some(cond) => {
                if let Some(woken) = cond.wait(cw.si, cw.nonce, cw.state) {
                    self.replica.daemon().callback_condition(
                        woken.client,
                        woken.nonce,
                        woken.state,
                        woken.data,
                    );
                }
            }
            None => {
                self.replica.daemon().callback_client(
                    cw.si,
                    cw.nonce,
                    ReturnCode::CondNotFound,
                    Vec::new(),
                );
            }
        }
    }

    fn do_snapshot(
        &self,
        stream: &mut UnixStream,
        snap: &Arc<Snapshot>,
        conditions: &HashMap<String, Condition>,
        tick_func: &str,
        tick_interval: u64,
        fail_at: u64,
    ) {
        OBJECT_SNAPSHOT.click();
        match self.capture_state(stream, conditions, tick_func, tick_interval, fail_at) {
            Some(bytes) => {
                snap.finish_object(&self.name, bytes);
                if snap.done() {
                    self.replica.snapshot_finished();
                }
            }
            None => {
                snap.abort();
                self.replica.snapshot_finished();
            }
        }
    }

    /// Ask the child for its state and wrap it into the full serialized object.  Also refreshes
    /// [Object::last_state].
    fn capture_state(
        &self,
        stream: &mut UnixStream,
        conditions: &HashMap<String, Condition>,
        tick_func: &str,
        tick_interval: u64,
        fail_at: u64,
    ) -> Option<Vec<u8>> {
        if self.failed() {
            return None;
        }
        if !self.write(stream, &[ACTION_SNAPSHOT]) {
            return None;
        }
        let state = self.read_block(stream)?;
        let mut named: Vec<NamedCondition> = conditions
            .iter()
            .map(|(name, cond)| NamedCondition {
                name: name.clone(),
                state: cond.peek_state(),
            })
            .collect();
        named.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
        let snapshot = ObjectSnapshot {
            ty: OBJECT_LIBRARY,
            init: self.init.clone(),
            fail_at,
            tick_func: tick_func.to_string(),
            tick_interval,
            conditions: named,
            state,
            replay: Vec::new(),
        };
        let bytes = stack_pack(&snapshot).to_vec();
        *self.snap.lock().unwrap() = bytes.clone();
        Some(bytes)
    }

    fn read(&self, stream: &mut UnixStream, buf: &mut [u8]) -> bool {
        if stream.read_exact(buf).is_err() {
            self.fail();
            return false;
        }
        true
    }

    /// Read a u32-length-prefixed block.
    fn read_block(&self, stream: &mut UnixStream) -> Option<Vec<u8>> {
        let mut len = [0u8; 4];
        if !self.read(stream, &mut len) {
            return None;
        }
        let mut buf = vec![0u8; u32::from_be_bytes(len) as usize];
        if !self.read(stream, &mut buf) {
            return None;
        }
        Some(buf)
    }

    fn write(&self, stream: &mut UnixStream, buf: &[u8]) -> bool {
        if stream.write_all(buf).is_err() {
            self.fail();
            return false;
        }
        true
    }
}

//////////////////////////////////////////// reap_child ////////////////////////////////////////////

/// Best-effort non-blocking reap, then SIGKILL and a blocking wait.
fn reap_child(pid: libc::pid_t) {
    let mut status: libc::c_int = 0;
    unsafe {
        if libc::waitpid(pid, &mut status, libc::WNOHANG) <= 0 {
            libc::kill(pid, libc::SIGKILL);
            libc::waitpid(pid, &mut status, 0);
        }
    }
}

/////////////////////////////////////////////// spawn //////////////////////////////////////////////

/// Launch the RSM helper executable with `FD=<n>` naming the child's end of a fresh socketpair.
/// Returns the pid and the supervisor's end.
pub fn spawn_host(
    executable: &std::path::Path,
    args: &[&std::ffi::OsStr],
) -> Result<(libc::pid_t, UnixStream), super::Error> {
    use std::ffi::CString;
    use std::os::fd::AsRawFd;
    let (ours, theirs) = UnixStream::pair()?;
    // The child's fd must survive exec; pair() opens both ends close-on-exec.
    let inherited = unsafe { libc::dup(theirs.as_raw_fd()) };
    if inherited < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let exe = CString::new(executable.as_os_str().as_encoded_bytes())
        .map_err(|_| super::Error::system("executable path contains NUL"))?;
    let mut argv_owned = vec![exe.clone()];
    for arg in args {
        argv_owned.push(
            CString::new(arg.as_encoded_bytes())
                .map_err(|_| super::Error::system("argument contains NUL"))?,
        );
    }
    let env = CString::new(format!("FD={}", inherited)).expect("no NUL possible");
    let mut argv: Vec<*mut libc::c_char> = argv_owned.iter().map(|a| a.as_ptr() as _).collect();
    argv.push(std::ptr::null_mut());
    let mut envp: Vec<*mut libc::c_char> = vec![env.as_ptr() as _, std::ptr::null_mut()];
    let mut pid: libc::pid_t = -1;
    let ret = unsafe {
        libc::posix_spawn(
            &mut pid,
            exe.as_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            argv.as_mut_ptr(),
            envp.as_mut_ptr(),
        )
    };
    unsafe {
        libc::close(inherited);
    }
    if ret != 0 {
        return Err(super::Error::system(format!(
            "posix_spawn {}: {}",
            executable.display(),
            std::io::Error::from_raw_os_error(ret)
        )));
    }
    Ok((pid, ours))
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use replicant_pb::{NetworkMessage, Server};

    use crate::daemon::Shared;
    use crate::transport::inproc::Mesh;
    use crate::transport::Transport;

    use super::*;

    struct Peer {
        stream: UnixStream,
    }

    impl Peer {
        fn read_exact(&mut self, n: usize) -> Vec<u8> {
            let mut buf = vec![0u8; n];
            self.stream.read_exact(&mut buf).unwrap();
            buf
        }

        fn expect_action(&mut self, action: u8) {
            assert_eq!(vec![action], self.read_exact(1));
        }

        fn expect_command(&mut self) -> (String, Vec<u8>) {
            self.expect_action(ACTION_COMMAND);
            let _sz = u64::from_be_bytes(self.read_exact(8).try_into().unwrap());
            let func_len = u32::from_be_bytes(self.read_exact(4).try_into().unwrap()) as usize;
            let func = String::from_utf8(self.read_exact(func_len)).unwrap();
            let input_len = u32::from_be_bytes(self.read_exact(4).try_into().unwrap()) as usize;
            let input = self.read_exact(input_len);
            (func, input)
        }

        fn send_output(&mut self, status: ReturnCode, output: &[u8]) {
            let mut buf = vec![RESP_OUTPUT];
            buf.extend_from_slice(&(status.to_u32() as u16).to_be_bytes());
            buf.extend_from_slice(&(output.len() as u32).to_be_bytes());
            buf.extend_from_slice(output);
            self.stream.write_all(&buf).unwrap();
        }

        fn send_snapshot(&mut self, state: &[u8]) {
            self.expect_action(ACTION_SNAPSHOT);
            let mut buf = Vec::new();
            buf.extend_from_slice(&(state.len() as u32).to_be_bytes());
            buf.extend_from_slice(state);
            self.stream.write_all(&buf).unwrap();
        }
    }

    fn harness() -> (Arc<ReplicaShared>, crate::transport::inproc::MeshTransport, Arc<Object>, Peer) {
        let mesh = Mesh::new();
        let us = Server::new(replicant_pb::ServerId::new(1), "h1:1982");
        let server_end = mesh.register(&us);
        let client = mesh.client();
        let shared = Arc::new(Shared::new(us, Arc::new(server_end)));
        let replica = Arc::new(ReplicaShared::new(shared));
        let obj = Object::new(Arc::clone(&replica), 1, "echo".to_string(), b"lib".to_vec());
        let (ours, theirs) = UnixStream::pair().unwrap();
        obj.set_child(None, ours);
        (replica, client, obj, Peer { stream: theirs })
    }

    fn boot(obj: &Arc<Object>, peer: &mut Peer) {
        obj.ctor();
        peer.expect_action(ACTION_CTOR);
        peer.send_output(ReturnCode::Success, b"");
        peer.send_snapshot(b"state0");
    }

    fn call(nonce: u64, slot: u64, func: &str, input: &[u8], client: &impl Transport) -> EnqueuedCall {
        EnqueuedCall {
            func: func.to_string(),
            input: input.to_vec(),
            slot,
            flags: 0,
            command_nonce: nonce,
            si: client.us(),
            request_nonce: nonce,
        }
    }

    fn recv_response(client: &impl Transport) -> replicant_pb::ClientResponse {
        for _ in 0..100 {
            if let Some((_, msg)) = client.recv(Duration::from_secs(5)).unwrap() {
                if let NetworkMessage::ClientResponse(resp) = msg {
                    return resp;
                }
            }
        }
        panic!("no client response arrived");
    }

    #[test]
    fn ctor_call_output_round_trip() {
        let (_replica, client, obj, mut peer) = harness();
        boot(&obj, &mut peer);
        obj.call(call(7, 5, "echo", b"hello", &client));
        let (func, input) = peer.expect_command();
        assert_eq!("echo", func);
        assert_eq!(b"hello".to_vec(), input);
        peer.send_output(ReturnCode::Success, b"hello");
        let resp = recv_response(&client);
        assert_eq!(7, resp.client_nonce);
        assert_eq!(ReturnCode::Success.to_u32(), resp.status);
        assert_eq!(b"hello".to_vec(), resp.payload);
        assert_eq!(5, obj.last_executed());
    }

    #[test]
    fn backup_returns_last_state() {
        let (_replica, client, obj, mut peer) = harness();
        boot(&obj, &mut peer);
        // The boot capture recorded "state0"; __backup__ is served without touching the child.
        obj.call(call(8, 5, "__backup__", b"", &client));
        let resp = recv_response(&client);
        assert_eq!(ReturnCode::Success.to_u32(), resp.status);
        let snapshot = ObjectSnapshot::unpack(&resp.payload).unwrap().0;
        assert_eq!(b"state0".to_vec(), snapshot.state);
        assert_eq!(b"lib".to_vec(), snapshot.init);
    }

    #[test]
    fn malformed_response_fails_the_object() {
        let (_replica, client, obj, mut peer) = harness();
        boot(&obj, &mut peer);
        obj.call(call(9, 5, "echo", b"x", &client));
        let _ = peer.expect_command();
        peer.stream.write_all(&[200]).unwrap();
        let resp = recv_response(&client);
        assert_eq!(ReturnCode::Maybe.to_u32(), resp.status);
        for _ in 0..500 {
            if obj.failed() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(obj.failed());
        // Further calls answer Maybe without touching the dead child.
        obj.call(call(10, 6, "echo", b"y", &client));
        let resp = recv_response(&client);
        assert_eq!(ReturnCode::Maybe.to_u32(), resp.status);
    }

    #[test]
    fn hangup_fails_pending_callers() {
        let (_replica, client, obj, mut peer) = harness();
        boot(&obj, &mut peer);
        obj.call(call(11, 5, "echo", b"x", &client));
        let _ = peer.expect_command();
        drop(peer);
        let resp = recv_response(&client);
        assert_eq!(ReturnCode::Maybe.to_u32(), resp.status);
    }

    #[test]
    fn conditions_create_broadcast_and_wait() {
        let (_replica, client, obj, mut peer) = harness();
        boot(&obj, &mut peer);
        // The call creates a condition and broadcasts it with data.
        obj.call(call(12, 5, "bump", b"", &client));
        let _ = peer.expect_command();
        let mut buf = vec![RESP_COND_CREATE];
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(b"cnt");
        peer.stream.write_all(&buf).unwrap();
        let mut buf = vec![RESP_COND_BROADCAST_DATA];
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(b"cnt");
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.extend_from_slice(b"v1");
        peer.stream.write_all(&buf).unwrap();
        assert_eq!(vec![0u8], peer.read_exact(1));
        peer.send_output(ReturnCode::Success, b"");
        let resp = recv_response(&client);
        assert_eq!(ReturnCode::Success.to_u32(), resp.status);
        // A wait at state 1 answers immediately with the broadcast data.
        obj.cond_wait(client.us(), 13, "cnt".to_string(), 1);
        let resp = recv_response(&client);
        assert_eq!(13, resp.client_nonce);
        assert_eq!(ReturnCode::Success.to_u32(), resp.status);
        let value = replicant_pb::CondValue::unpack(&resp.payload).unwrap().0;
        assert_eq!(1, value.state);
        assert_eq!(b"v1".to_vec(), value.data);
        // A wait on a missing condition answers CondNotFound.
        obj.cond_wait(client.us(), 14, "nope".to_string(), 1);
        let resp = recv_response(&client);
        assert_eq!(ReturnCode::CondNotFound.to_u32(), resp.status);
    }

    #[test]
    fn snapshot_interleaves_before_higher_slots() {
        let (replica, client, obj, mut peer) = harness();
        boot(&obj, &mut peer);
        let snap = Arc::new(Snapshot::new(6, b"replica".to_vec()));
        obj.call(call(15, 5, "echo", b"five", &client));
        obj.take_snapshot(&snap);
        obj.call(call(16, 7, "echo", b"seven", &client));
        // Slot 5 executes, then the snapshot at 6, then slot 7.
        let _ = peer.expect_command();
        peer.send_output(ReturnCode::Success, b"five");
        peer.send_snapshot(b"state5");
        let (_, input) = peer.expect_command();
        assert_eq!(b"seven".to_vec(), input);
        peer.send_output(ReturnCode::Success, b"seven");
        snap.wait();
        assert!(snap.done());
        assert!(!snap.failed());
        let _ = recv_response(&client);
        let _ = recv_response(&client);
        let _ = replica;
    }

    #[test]
    fn restore_replays_recorded_calls() {
        let (_replica, client, obj, mut peer) = harness();
        boot(&obj, &mut peer);
        obj.call(call(17, 5, "echo", b"hello", &client));
        let _ = peer.expect_command();
        peer.send_output(ReturnCode::Success, b"hello");
        let _ = recv_response(&client);
        // last_state now carries the base snapshot plus the replayable call.
        let mut state = Vec::new();
        for _ in 0..100 {
            state = obj.last_state();
            let parsed = ObjectSnapshot::unpack(&state).unwrap().0;
            if parsed.replay.len() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        let parsed = ObjectSnapshot::unpack(&state).unwrap().0;
        assert_eq!(1, parsed.replay.len());
        assert_eq!("echo", parsed.replay[0].func);
        assert_eq!(5, parsed.replay[0].slot);
        // A second object restored from that state replays the call through its child.
        let mesh = Mesh::new();
        let us = Server::new(replicant_pb::ServerId::new(2), "h2:1982");
        let server_end = mesh.register(&us);
        let shared = Arc::new(Shared::new(us, Arc::new(server_end)));
        let replica2 = Arc::new(ReplicaShared::new(shared));
        let obj2 = Object::new(Arc::clone(&replica2), 5, "echo".to_string(), parsed.init.clone());
        let (ours, theirs) = UnixStream::pair().unwrap();
        obj2.set_child(None, ours);
        obj2.rtor(parsed);
        let mut peer2 = Peer { stream: theirs };
        peer2.expect_action(ACTION_RTOR);
        let len = u32::from_be_bytes(peer2.read_exact(4).try_into().unwrap()) as usize;
        assert_eq!(b"state0".to_vec(), peer2.read_exact(len));
        peer2.send_output(ReturnCode::Success, b"");
        peer2.send_snapshot(b"state0");
        let (func, input) = peer2.expect_command();
        assert_eq!("echo", func);
        assert_eq!(b"hello".to_vec(), input);
        peer2.send_output(ReturnCode::Success, b"hello");
        for _ in 0..500 {
            if obj2.last_executed() == 5 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(5, obj2.last_executed());
    }

    #[test]
    fn tick_interval_gates_tick_dispatch() {
        let (_replica, client, obj, mut peer) = harness();
        boot(&obj, &mut peer);
        // Register a tick function at interval 2.
        obj.call(call(18, 5, "setup", b"", &client));
        let _ = peer.expect_command();
        let mut buf = vec![RESP_TICK_INTERVAL];
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(b"on_tick");
        buf.extend_from_slice(&2u64.to_be_bytes());
        peer.stream.write_all(&buf).unwrap();
        peer.send_output(ReturnCode::Success, b"");
        let _ = recv_response(&client);
        // Tick 3 is not a multiple of 2:  answered without consulting the child.
        let tick3 = stack_pack(Tick { tick: 3 }).to_vec();
        obj.call(call(19, 6, "__tick__", &tick3, &client));
        let resp = recv_response(&client);
        assert_eq!(ReturnCode::Success.to_u32(), resp.status);
        // Tick 4 dispatches the registered function.
        let tick4 = stack_pack(Tick { tick: 4 }).to_vec();
        obj.call(call(20, 7, "__tick__", &tick4, &client));
        let (func, input) = peer.expect_command();
        assert_eq!("on_tick", func);
        assert!(input.is_empty());
        peer.send_output(ReturnCode::Success, b"");
        let resp = recv_response(&client);
        assert_eq!(ReturnCode::Success.to_u32(), resp.status);
    }
}
