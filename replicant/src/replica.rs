//! The replica applies learned pvalues in strict slot order and drives every side effect of
//! execution:  configuration changes, the nonce counter, command deduplication, robust-call
//! history, conditions, hosted objects, snapshots, and the repair of failed objects.
//!
//! The replica proper is owned by the server loop's thread.  The pieces object threads must
//! reach (robust history, snapshots, the latest published snapshot, and the daemon's callback
//! surface) live in [ReplicaShared] behind their own locks.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use biometrics::{Collector, Counter};

use buffertk::{stack_pack, Unpackable};

use indicio::{clue, ERROR, INFO, WARNING};

use prototk_derive::Message;

use replicant_pb::{
    BecomeMember, CallPayload, Command, Configuration, IncrementCounter, ObjectFailed,
    ObjectRepair, PValue, RestoreObjectInput, ReturnCode, Server, ServerId, SetGcThresh,
    SlotType, Tick, COMMAND_NONCE_HISTORY, SLOTS_WINDOW,
};

use super::condition::Condition;
use super::daemon::Shared;
use super::object::{spawn_host, EnqueuedCall, Object, ObjectSnapshot, OBJECT_LIBRARY};
use super::snapshot::{ObjectState, Snapshot};
use super::{Error, COLLECTOR, SNAPSHOT_INTERVAL_SLOTS};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static SLOTS_EXECUTED: Counter = Counter::new("replicant.replica.slots_executed");
static NONCES_DEDUPED: Counter = Counter::new("replicant.replica.nonces_deduped");
static ROBUST_REPLAYS: Counter = Counter::new("replicant.replica.robust_replays");
static CONFIGS_ADOPTED: Counter = Counter::new("replicant.replica.configs_adopted");
static SNAPSHOTS_INITIATED: Counter = Counter::new("replicant.replica.snapshots_initiated");
static SNAPSHOTS_PUBLISHED: Counter = Counter::new("replicant.replica.snapshots_published");
static OBJECTS_LAUNCHED: Counter = Counter::new("replicant.replica.objects_launched");
static OBJECTS_REPAIRED: Counter = Counter::new("replicant.replica.objects_repaired");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&SLOTS_EXECUTED);
    collector.register_counter(&NONCES_DEDUPED);
    collector.register_counter(&ROBUST_REPLAYS);
    collector.register_counter(&CONFIGS_ADOPTED);
    collector.register_counter(&SNAPSHOTS_INITIATED);
    collector.register_counter(&SNAPSHOTS_PUBLISHED);
    collector.register_counter(&OBJECTS_LAUNCHED);
    collector.register_counter(&OBJECTS_REPAIRED);
}

//////////////////////////////////////////// HostConfig ////////////////////////////////////////////

/// Where object libraries land on disk and which helper executable hosts them.
#[derive(Clone, Debug)]
pub struct HostConfig {
    pub data_dir: PathBuf,
    pub executable: PathBuf,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            executable: PathBuf::from("replicant-rsm-host"),
        }
    }
}

///////////////////////////////////////// durable formats //////////////////////////////////////////

/// One robust-call outcome, retained for replay.
#[derive(Clone, Debug, Default, Message)]
pub struct HistoryEntry {
    #[prototk(1, uint64)]
    pub slot: u64,
    #[prototk(2, uint64)]
    pub nonce: u64,
    #[prototk(3, uint32)]
    pub status: u32,
    #[prototk(4, bytes)]
    pub output: Vec<u8>,
}

/// The replica's serialized form.  Objects arrive as frames appended by the snapshot machinery;
/// see [crate::snapshot].
#[derive(Clone, Debug, Default, Message)]
pub struct ReplicaSnapshot {
    #[prototk(1, uint64)]
    pub slot: u64,
    #[prototk(2, uint64)]
    pub counter: u64,
    #[prototk(3, message)]
    pub config: Configuration,
    #[prototk(4, uint64)]
    pub slots: Vec<u64>,
    #[prototk(5, uint64)]
    pub cond_config_state: u64,
    #[prototk(6, uint64)]
    pub cond_tick_state: u64,
    #[prototk(7, uint64)]
    pub command_nonces: Vec<u64>,
    #[prototk(8, message)]
    pub robust: Vec<HistoryEntry>,
    #[prototk(15, message)]
    pub objects: Vec<ObjectState>,
}

//////////////////////////////////////////// SideEffect ////////////////////////////////////////////

/// Work the server loop must do on the replica's behalf after execution.  The replica never
/// touches the leader, the acceptor, or the nonce generator directly.
#[derive(Clone, Debug)]
pub enum SideEffect {
    /// Submit a command through the ordinary Paxos path.
    Enqueue {
        slot_type: SlotType,
        command: Vec<u8>,
    },
    /// A nonce batch was granted; unblock whoever waits on it.
    NonceSequence {
        server: ServerId,
        token: u64,
        counter: u64,
    },
}

/////////////////////////////////////////// ReplicaShared //////////////////////////////////////////

#[derive(Default)]
struct RobustState {
    history: VecDeque<HistoryEntry>,
    lookup: HashSet<u64>,
}

/// The thread-shared surface of the replica.  Object threads report outcomes and finished
/// snapshots here; the server loop reads the latest snapshot and robust history here.
pub struct ReplicaShared {
    daemon: Arc<Shared>,
    robust: Mutex<RobustState>,
    snapshots: Mutex<Vec<Arc<Snapshot>>>,
    latest: Mutex<Option<(u64, Vec<u8>)>>,
}

impl ReplicaShared {
    pub fn new(daemon: Arc<Shared>) -> Self {
        Self {
            daemon,
            robust: Mutex::new(RobustState::default()),
            snapshots: Mutex::new(Vec::new()),
            latest: Mutex::new(None),
        }
    }

    pub fn daemon(&self) -> &Arc<Shared> {
        &self.daemon
    }

    /// Report one command's outcome.  Answers the originating client, and for robust calls
    /// records the outcome for replay.  Callable from any thread.
    pub fn executed(
        &self,
        slot: u64,
        flags: u8,
        command_nonce: u64,
        si: ServerId,
        request_nonce: u64,
        status: ReturnCode,
        output: Vec<u8>,
    ) {
        if si != ServerId::BOTTOM {
            self.daemon
                .callback_client(si, request_nonce, status, output.clone());
        }
        if flags & replicant_pb::COMMAND_FLAG_ROBUST == 0 {
            return;
        }
        let mut robust = self.robust.lock().unwrap();
        if robust.history.iter().any(|h| h.slot == slot) {
            return;
        }
        let entry = HistoryEntry {
            slot,
            nonce: command_nonce,
            status: status.to_u32(),
            output,
        };
        let pos = robust.history.partition_point(|h| h.slot < slot);
        robust.history.insert(pos, entry);
        robust.lookup.insert(command_nonce);
        while robust.history.len() > COMMAND_NONCE_HISTORY {
            let evicted = robust.history.pop_front().unwrap();
            robust.lookup.remove(&evicted.nonce);
        }
    }

    /// Robust replay:  the recorded outcome for `nonce`, or `Maybe` when `min_slot` predates the
    /// retained history, or None when there is no record.
    pub fn has_output(&self, nonce: u64, min_slot: u64) -> Option<(ReturnCode, Vec<u8>)> {
        let robust = self.robust.lock().unwrap();
        if let Some(front) = robust.history.front() {
            if min_slot < front.slot {
                return Some((ReturnCode::Maybe, Vec::new()));
            }
        }
        if !robust.lookup.contains(&nonce) {
            return None;
        }
        let entry = robust
            .history
            .iter()
            .find(|h| h.nonce == nonce)
            .expect("lookup and history agree");
        ROBUST_REPLAYS.click();
        Some((ReturnCode::from_u32(entry.status), entry.output.clone()))
    }

    /// Publish the newest complete snapshot and sweep everything it supersedes.  Called whenever
    /// a snapshot might have completed, from any thread.
    pub fn snapshot_finished(&self) {
        let mut snapshots = self.snapshots.lock().unwrap();
        let mut published = None;
        for snap in snapshots.iter().rev() {
            if snap.done() && !snap.failed() {
                SNAPSHOTS_PUBLISHED.click();
                *self.latest.lock().unwrap() = Some((snap.slot(), snap.contents()));
                published = Some(snap.slot());
                break;
            }
        }
        if let Some(published) = published {
            snapshots.retain(|s| {
                if s.slot() <= published {
                    s.abort();
                    false
                } else {
                    true
                }
            });
        }
        snapshots.retain(|s| !s.failed());
    }

    /// The latest published snapshot, if any.
    pub fn latest_snapshot(&self) -> Option<(u64, Vec<u8>)> {
        self.latest.lock().unwrap().clone()
    }
}

//////////////////////////////////////////// RepairInfo ////////////////////////////////////////////

#[derive(Debug, Default)]
struct RepairInfo {
    when: u64,
    highest: u64,
    failures: Vec<ServerId>,
}

////////////////////////////////////////////// Replica /////////////////////////////////////////////

pub struct Replica {
    shared: Arc<ReplicaShared>,
    host: HostConfig,
    slot: u64,
    pvalues: VecDeque<PValue>,
    configs: VecDeque<Configuration>,
    slots: Vec<u64>,
    cond_config: Condition,
    cond_tick: Condition,
    counter: u64,
    command_nonces: VecDeque<u64>,
    command_nonces_lookup: HashSet<u64>,
    objects: BTreeMap<String, Arc<Object>>,
    dying_objects: Vec<Arc<Object>>,
    failed_objects: BTreeMap<String, RepairInfo>,
}

impl Replica {
    pub fn new(daemon: Arc<Shared>, host: HostConfig, config: Configuration) -> Self {
        let slots = vec![config.first_slot; config.servers.len()];
        let version = config.version.get();
        let mut configs = VecDeque::new();
        configs.push_back(config);
        Self {
            shared: Arc::new(ReplicaShared::new(daemon)),
            host,
            slot: 0,
            pvalues: VecDeque::new(),
            configs,
            slots,
            cond_config: Condition::new(version),
            cond_tick: Condition::new(version),
            counter: 0,
            command_nonces: VecDeque::new(),
            command_nonces_lookup: HashSet::new(),
            objects: BTreeMap::new(),
            dying_objects: Vec::new(),
            failed_objects: BTreeMap::new(),
        }
    }

    /// Rebuild a replica from a published snapshot, relaunching its objects.
    pub fn from_snapshot(
        daemon: Arc<Shared>,
        host: HostConfig,
        snap: &[u8],
    ) -> Result<Replica, Error> {
        let parsed = ReplicaSnapshot::unpack(snap)
            .map_err(|_| Error::corruption("corrupt replica state"))?
            .0;
        if parsed.config.servers.len() != parsed.slots.len() {
            return Err(Error::corruption("corrupt replica state"));
        }
        let mut replica = Replica::new(daemon, host, parsed.config);
        replica.slot = parsed.slot;
        replica.counter = parsed.counter;
        replica.slots = parsed.slots;
        replica.cond_config = Condition::new(parsed.cond_config_state);
        replica.cond_tick = Condition::new(parsed.cond_tick_state);
        for nonce in parsed.command_nonces.iter() {
            replica.command_nonces.push_back(*nonce);
            replica.command_nonces_lookup.insert(*nonce);
        }
        {
            let mut robust = replica.shared.robust.lock().unwrap();
            for entry in parsed.robust.iter() {
                robust.lookup.insert(entry.nonce);
            }
            robust.history = parsed.robust.into();
        }
        for obj in parsed.objects.iter() {
            clue!(COLLECTOR, INFO, {
                recreating_object: obj.name.as_str(),
            });
            if !replica.relaunch(&obj.name, replica.slot, &obj.state) {
                return Err(Error::corruption("could not recreate object from snapshot"));
            }
        }
        Ok(replica)
    }

    pub fn shared(&self) -> &Arc<ReplicaShared> {
        &self.shared
    }

    pub fn config(&self) -> &Configuration {
        self.configs.front().expect("configs are never empty")
    }

    pub fn configs(&self) -> impl Iterator<Item = &Configuration> {
        self.configs.iter()
    }

    pub fn any_config_has_id(&self, si: ServerId) -> bool {
        self.configs.iter().any(|c| c.has_id(si))
    }

    pub fn any_config_has_address(&self, bind_to: &str) -> bool {
        self.configs.iter().any(|c| c.has_address(bind_to))
    }

    /// The next slot to execute.
    pub fn next_slot(&self) -> u64 {
        self.slot
    }

    /// True when learned pvalues are stuck behind a gap the cluster must re-propose.
    pub fn discontinuous(&self) -> bool {
        self.pvalues
            .front()
            .map(|p| self.slot < p.slot)
            .unwrap_or(false)
    }

    /// The window of proposable slots.  Never reaches past a scheduled configuration's first
    /// slot, so proposals cannot race a membership change.
    pub fn window(&self) -> (u64, u64) {
        let start = self.slot;
        let mut limit = self.slot + SLOTS_WINDOW;
        if self.configs.len() > 1 {
            limit = std::cmp::min(limit, self.configs[1].first_slot);
        }
        (start, limit)
    }

    /// True when a configuration change is pending and the leader should Nop-fill to reach it.
    pub fn fill_window(&self) -> bool {
        self.configs.len() > 1
    }

    /// The cluster gc floor:  the minimum of every server's acknowledged-safe slot.
    pub fn gc_up_to(&self) -> u64 {
        self.slots.iter().copied().min().unwrap_or(0)
    }

    pub fn last_tick(&self) -> u64 {
        self.cond_tick.peek_state()
    }

    /// Learn one pvalue.  Pvalues arrive in any order; execution happens in slot order as the
    /// sequence becomes contiguous.  Returns the side effects for the server loop.
    pub fn learn(&mut self, p: PValue) -> Vec<SideEffect> {
        if p.slot < self.slot {
            return Vec::new();
        }
        let idx = self.pvalues.partition_point(|x| x.slot < p.slot);
        if self.pvalues.get(idx).map(|x| x.slot) == Some(p.slot) {
            // Learn agreement:  a slot learned twice must carry the same command.
            assert_eq!(
                self.pvalues[idx].command, p.command,
                "two values learned for one slot"
            );
            return Vec::new();
        }
        self.pvalues.insert(idx, p);
        let mut effects = Vec::new();
        while self.pvalues.front().map(|x| x.slot) == Some(self.slot) {
            let p = self.pvalues.pop_front().unwrap();
            self.execute(&p, &mut effects);
            SLOTS_EXECUTED.click();
            self.slot += 1;
            while self.configs.len() > 1 && self.configs[1].first_slot <= self.slot {
                CONFIGS_ADOPTED.click();
                self.configs.pop_front();
                let config = self.configs.front().expect("configs are never empty");
                clue!(COLLECTOR, INFO, {
                    adopting_configuration: config.version.get(),
                });
                self.slots = vec![0; config.servers.len()];
                for woken in self.cond_config.broadcast(None) {
                    self.shared.daemon.callback_condition(
                        woken.client,
                        woken.nonce,
                        woken.state,
                        woken.data,
                    );
                }
                assert_eq!(
                    self.cond_config.peek_state(),
                    self.configs.front().unwrap().version.get()
                );
                self.initiate_snapshot();
            }
            if self.slot % SNAPSHOT_INTERVAL_SLOTS == 0 {
                self.initiate_snapshot();
            }
        }
        effects
    }

    fn execute(&mut self, p: &PValue, effects: &mut Vec<SideEffect>) {
        if p.command.is_empty() {
            return;
        }
        let cmd = match Command::unpack(&p.command) {
            Ok(cmd) => cmd,
            Err(_) => {
                clue!(COLLECTOR, ERROR, {
                    bad_command_at_slot: p.slot,
                });
                return;
            }
        };
        let (si, request_nonce) = self.shared.daemon.callback_enqueued(cmd.nonce);
        if cmd.nonce != 0 {
            if let Some((status, output)) = self.shared.has_output(cmd.nonce, u64::MAX) {
                self.shared
                    .daemon
                    .callback_client(si, request_nonce, status, output);
                return;
            }
            if self.command_nonces_lookup.contains(&cmd.nonce) {
                NONCES_DEDUPED.click();
                return;
            }
            self.command_nonces.push_back(cmd.nonce);
            self.command_nonces_lookup.insert(cmd.nonce);
            while self.command_nonces.len() > COMMAND_NONCE_HISTORY {
                let evicted = self.command_nonces.pop_front().unwrap();
                self.command_nonces_lookup.remove(&evicted);
            }
        }
        if cmd.slot_type == SlotType::Call {
            self.execute_call(p, &cmd, si, request_nonce, effects);
            return;
        }
        if cmd.is_robust() {
            clue!(COLLECTOR, WARNING, {
                robust_flag_on_non_call: p.slot,
            });
        }
        match cmd.slot_type {
            SlotType::ServerBecomeMember => self.execute_become_member(p, &cmd),
            SlotType::ServerSetGcThresh => self.execute_set_gc_thresh(&cmd),
            SlotType::IncrementCounter => self.execute_increment_counter(&cmd, effects),
            SlotType::ObjectFailed => self.execute_object_failed(p, &cmd, effects),
            SlotType::ObjectRepair => self.execute_object_repair(&cmd),
            SlotType::Tick => self.execute_tick(p, &cmd),
            SlotType::Poke => self.execute_poke(&cmd),
            SlotType::Nop => {}
            SlotType::Call => unreachable!(),
        }
        if si != ServerId::BOTTOM {
            self.shared
                .daemon
                .callback_client(si, request_nonce, ReturnCode::Success, Vec::new());
        }
    }

    fn execute_become_member(&mut self, p: &PValue, cmd: &Command) {
        let Ok(become_msg) = BecomeMember::unpack(&cmd.payload).map(|x| x.0) else {
            clue!(COLLECTOR, ERROR, {
                invalid_become_member: p.slot,
            });
            return;
        };
        let tail = self.configs.back().expect("configs are never empty");
        if !tail.has_id(become_msg.server.id) && !tail.has_address(&become_msg.server.bind_to) {
            clue!(COLLECTOR, INFO, {
                adding_server: become_msg.server.id.get(),
                first_slot: p.slot + SLOTS_WINDOW,
            });
            let next = tail.grow(become_msg.server, p.slot + SLOTS_WINDOW);
            self.configs.push_back(next);
        }
    }

    fn execute_set_gc_thresh(&mut self, cmd: &Command) {
        let Ok(thresh) = SetGcThresh::unpack(&cmd.payload).map(|x| x.0) else {
            return;
        };
        let config = self.configs.front().expect("configs are never empty");
        assert_eq!(self.slots.len(), config.servers.len());
        for (i, server) in config.servers.iter().enumerate() {
            if server.id == thresh.server {
                self.slots[i] = std::cmp::max(self.slots[i], thresh.threshold);
            }
        }
    }

    fn execute_increment_counter(&mut self, cmd: &Command, effects: &mut Vec<SideEffect>) {
        let Ok(inc) = IncrementCounter::unpack(&cmd.payload).map(|x| x.0) else {
            return;
        };
        self.counter += replicant_pb::NONCE_BATCH;
        effects.push(SideEffect::NonceSequence {
            server: inc.server,
            token: inc.token,
            counter: self.counter,
        });
    }

    fn execute_object_failed(&mut self, p: &PValue, cmd: &Command, effects: &mut Vec<SideEffect>) {
        let Ok(failed) = ObjectFailed::unpack(&cmd.payload).map(|x| x.0) else {
            clue!(COLLECTOR, ERROR, {
                invalid_object_failed: p.slot,
            });
            return;
        };
        let Some(obj) = self.objects.get(&failed.object) else {
            return;
        };
        if obj.created_at() > failed.when {
            return;
        }
        let config = self.configs.front().expect("configs are never empty");
        if !config.has_id(failed.server) {
            return;
        }
        clue!(COLLECTOR, WARNING, {
            object_failure_reported: failed.object.as_str(),
            by: failed.server.get(),
            when: failed.when,
        });
        obj.fail_at(p.slot);
        let ri = self
            .failed_objects
            .entry(failed.object.clone())
            .or_insert_with(|| RepairInfo {
                when: failed.when,
                highest: failed.when,
                failures: Vec::new(),
            });
        ri.highest = std::cmp::max(ri.highest, failed.when);
        if !ri.failures.contains(&failed.server) {
            ri.failures.push(failed.server);
        }
        let all_failed = config
            .servers
            .iter()
            .all(|s| ri.failures.contains(&s.id));
        if all_failed {
            clue!(COLLECTOR, INFO, {
                object_repair_eligible: failed.object.as_str(),
            });
            Self::post_fail_action(&self.shared, obj, ri, effects);
        }
    }

    /// The furthest-along survivor volunteers its state as the repair donor.
    fn post_fail_action(
        shared: &Arc<ReplicaShared>,
        obj: &Arc<Object>,
        ri: &RepairInfo,
        effects: &mut Vec<SideEffect>,
    ) {
        if ri.highest != obj.last_executed() {
            return;
        }
        let repair = ObjectRepair {
            object: obj.name().to_string(),
            when: ri.when,
            donor: shared.daemon.us().id,
            donor_slot: ri.highest,
            state: obj.last_state(),
        };
        effects.push(SideEffect::Enqueue {
            slot_type: SlotType::ObjectRepair,
            command: stack_pack(repair).to_vec(),
        });
    }

    fn execute_object_repair(&mut self, cmd: &Command) {
        let Ok(repair) = ObjectRepair::unpack(&cmd.payload).map(|x| x.0) else {
            clue!(COLLECTOR, ERROR, {
                invalid_object_repair: true,
            });
            return;
        };
        let Some(obj) = self.objects.get(&repair.object).map(Arc::clone) else {
            return;
        };
        let matches = self
            .failed_objects
            .get(&repair.object)
            .map(|ri| ri.when == repair.when)
            .unwrap_or(false);
        if !matches {
            return;
        }
        OBJECTS_REPAIRED.click();
        clue!(COLLECTOR, INFO, {
            relaunching_object: repair.object.as_str(),
            donor: repair.donor.get(),
            donor_slot: repair.donor_slot,
        });
        self.dying_objects.push(obj);
        if self.relaunch(&repair.object, repair.donor_slot, &repair.state) {
            self.failed_objects.remove(&repair.object);
        } else if let Some(obj) = self.objects.get(&repair.object) {
            obj.fail_at(repair.donor_slot);
        } else {
            clue!(COLLECTOR, ERROR, {
                object_unrecoverable: repair.object.as_str(),
            });
        }
    }

    fn execute_tick(&mut self, p: &PValue, cmd: &Command) {
        let Ok(tick) = Tick::unpack(&cmd.payload).map(|x| x.0) else {
            return;
        };
        if self.cond_tick.peek_state() != tick.tick {
            return;
        }
        for woken in self.cond_tick.broadcast(None) {
            self.shared.daemon.callback_condition(
                woken.client,
                woken.nonce,
                woken.state,
                woken.data,
            );
        }
        for obj in self.objects.values() {
            obj.call(EnqueuedCall {
                func: "__tick__".to_string(),
                input: cmd.payload.clone(),
                slot: p.slot,
                flags: cmd.flags,
                command_nonce: cmd.nonce,
                si: ServerId::BOTTOM,
                request_nonce: 0,
            });
        }
    }

    fn execute_poke(&mut self, cmd: &Command) {
        clue!(COLLECTOR, INFO, {
            poke: String::from_utf8_lossy(&cmd.payload).into_owned(),
        });
    }

    fn execute_call(
        &mut self,
        p: &PValue,
        cmd: &Command,
        si: ServerId,
        request_nonce: u64,
        effects: &mut Vec<SideEffect>,
    ) {
        let Ok(call) = CallPayload::unpack(&cmd.payload).map(|x| x.0) else {
            clue!(COLLECTOR, ERROR, {
                invalid_call: p.slot,
            });
            self.executed(p, cmd, si, request_nonce, ReturnCode::Internal, b"bad command".to_vec());
            return;
        };
        if call.object == "replicant" {
            match call.func.as_str() {
                "new_object" => self.execute_new_object(p, cmd, si, request_nonce, &call.input),
                "del_object" => self.execute_del_object(p, cmd, si, request_nonce, &call.input),
                "backup_object" => self.execute_backup_object(p, cmd, si, request_nonce, &call.input),
                "restore_object" => self.execute_restore_object(p, cmd, si, request_nonce, &call.input),
                "kill_object" => {
                    self.execute_kill_object(p, cmd, si, request_nonce, &call.input, effects)
                }
                "list_objects" => self.execute_list_objects(p, cmd, si, request_nonce),
                "kill_server" => self.execute_kill_server(p, cmd, si, request_nonce, &call.input),
                "add_server" => self.execute_add_server(p, cmd, si, request_nonce, &call.input),
                _ => {
                    let what = format!("unknown function replicant.{}", call.func);
                    clue!(COLLECTOR, WARNING, {
                        func_not_found: call.func.as_str(),
                    });
                    self.executed(p, cmd, si, request_nonce, ReturnCode::FuncNotFound, what.into_bytes());
                }
            }
            return;
        }
        if self.failed_objects.contains_key(&call.object) {
            self.executed(p, cmd, si, request_nonce, ReturnCode::Maybe, Vec::new());
            return;
        }
        match self.objects.get(&call.object) {
            Some(obj) => {
                obj.call(EnqueuedCall {
                    func: call.func,
                    input: call.input,
                    slot: p.slot,
                    flags: cmd.flags,
                    command_nonce: cmd.nonce,
                    si,
                    request_nonce,
                });
            }
            None => {
                self.executed(
                    p,
                    cmd,
                    si,
                    request_nonce,
                    ReturnCode::ObjNotFound,
                    b"object not found".to_vec(),
                );
            }
        }
    }

    fn execute_new_object(
        &mut self,
        p: &PValue,
        cmd: &Command,
        si: ServerId,
        request_nonce: u64,
        input: &[u8],
    ) {
        let name_len = input.iter().position(|&b| b == 0).unwrap_or(input.len());
        let name = String::from_utf8_lossy(&input[..name_len]).into_owned();
        if self.objects.contains_key(&name) {
            self.executed(p, cmd, si, request_nonce, ReturnCode::ObjExist, b"object already exists".to_vec());
            return;
        }
        if name_len >= input.len() {
            self.executed(p, cmd, si, request_nonce, ReturnCode::Internal, b"invalid library".to_vec());
            return;
        }
        let lib = &input[name_len + 1..];
        clue!(COLLECTOR, INFO, {
            creating_object: name.as_str(),
        });
        match self.launch_library(&name, p.slot, lib) {
            Some(obj) => {
                obj.ctor();
                self.executed(p, cmd, si, request_nonce, ReturnCode::Success, Vec::new());
            }
            None => {
                self.executed(p, cmd, si, request_nonce, ReturnCode::Maybe, Vec::new());
            }
        }
    }

    fn execute_del_object(
        &mut self,
        p: &PValue,
        cmd: &Command,
        si: ServerId,
        request_nonce: u64,
        input: &[u8],
    ) {
        let name = String::from_utf8_lossy(input).into_owned();
        let Some(obj) = self.objects.remove(&name) else {
            self.executed(p, cmd, si, request_nonce, ReturnCode::ObjNotFound, b"object not found".to_vec());
            return;
        };
        clue!(COLLECTOR, INFO, {
            deleting_object: name.as_str(),
        });
        self.failed_objects.remove(&name);
        obj.fail_at(0);
        self.dying_objects.push(obj);
        self.executed(p, cmd, si, request_nonce, ReturnCode::Success, Vec::new());
    }

    fn execute_backup_object(
        &mut self,
        p: &PValue,
        cmd: &Command,
        si: ServerId,
        request_nonce: u64,
        input: &[u8],
    ) {
        let name = String::from_utf8_lossy(input).into_owned();
        let Some(obj) = self.objects.get(&name) else {
            self.executed(p, cmd, si, request_nonce, ReturnCode::ObjNotFound, b"object not found".to_vec());
            return;
        };
        obj.call(EnqueuedCall {
            func: "__backup__".to_string(),
            input: Vec::new(),
            slot: p.slot,
            flags: cmd.flags,
            command_nonce: cmd.nonce,
            si,
            request_nonce,
        });
    }

    fn execute_restore_object(
        &mut self,
        p: &PValue,
        cmd: &Command,
        si: ServerId,
        request_nonce: u64,
        input: &[u8],
    ) {
        let Ok(restore) = RestoreObjectInput::unpack(input).map(|x| x.0) else {
            clue!(COLLECTOR, ERROR, {
                invalid_restore_object: p.slot,
            });
            return;
        };
        if self.objects.contains_key(&restore.name) {
            self.executed(p, cmd, si, request_nonce, ReturnCode::ObjExist, b"object already exists".to_vec());
            return;
        }
        clue!(COLLECTOR, INFO, {
            restoring_object: restore.name.as_str(),
        });
        if self.relaunch(&restore.name, p.slot, &restore.state) {
            self.executed(p, cmd, si, request_nonce, ReturnCode::Success, Vec::new());
        } else {
            if let Some(obj) = self.objects.get(&restore.name) {
                obj.fail_at(p.slot);
            } else {
                clue!(COLLECTOR, ERROR, {
                    object_unrecoverable: restore.name.as_str(),
                });
            }
            self.executed(p, cmd, si, request_nonce, ReturnCode::Maybe, Vec::new());
        }
    }

    fn execute_kill_object(
        &mut self,
        p: &PValue,
        cmd: &Command,
        si: ServerId,
        request_nonce: u64,
        input: &[u8],
        effects: &mut Vec<SideEffect>,
    ) {
        let name = String::from_utf8_lossy(input).into_owned();
        let Some(obj) = self.objects.get(&name).map(Arc::clone) else {
            self.executed(p, cmd, si, request_nonce, ReturnCode::ObjNotFound, Vec::new());
            return;
        };
        clue!(COLLECTOR, WARNING, {
            killing_object: name.as_str(),
        });
        obj.fail_at(p.slot);
        let config = self.configs.front().expect("configs are never empty");
        let failures = config.server_ids();
        let ri = self.failed_objects.entry(name).or_insert_with(|| RepairInfo {
            when: p.slot,
            highest: obj.last_executed(),
            failures: Vec::new(),
        });
        ri.failures = failures;
        ri.highest = std::cmp::max(ri.highest, obj.last_executed());
        // kill_object repairs through the same Paxos path as a crash.
        Self::post_fail_action(&self.shared, &obj, ri, effects);
        self.executed(p, cmd, si, request_nonce, ReturnCode::Success, Vec::new());
    }

    fn execute_list_objects(&mut self, p: &PValue, cmd: &Command, si: ServerId, request_nonce: u64) {
        let mut listing = String::new();
        for name in self.objects.keys() {
            listing.push_str(name);
            listing.push('\n');
        }
        self.executed(p, cmd, si, request_nonce, ReturnCode::Success, listing.into_bytes());
    }

    fn execute_kill_server(
        &mut self,
        p: &PValue,
        cmd: &Command,
        si: ServerId,
        request_nonce: u64,
        input: &[u8],
    ) {
        let Ok(to_remove) = ServerId::unpack(input).map(|x| x.0) else {
            clue!(COLLECTOR, ERROR, {
                invalid_kill_server: p.slot,
            });
            return;
        };
        let tail = self.configs.back().expect("configs are never empty");
        if tail.has_id(to_remove) && tail.servers.len() == 1 {
            clue!(COLLECTOR, ERROR, {
                refusing_to_remove_last_server: to_remove.get(),
            });
        } else if tail.has_id(to_remove) {
            clue!(COLLECTOR, INFO, {
                removing_server: to_remove.get(),
            });
            let next = tail.shrink(to_remove, p.slot + SLOTS_WINDOW);
            self.configs.push_back(next);
        } else {
            clue!(COLLECTOR, INFO, {
                no_such_member: to_remove.get(),
            });
        }
        self.executed(p, cmd, si, request_nonce, ReturnCode::Success, Vec::new());
    }

    fn execute_add_server(
        &mut self,
        p: &PValue,
        cmd: &Command,
        si: ServerId,
        request_nonce: u64,
        input: &[u8],
    ) {
        let Ok(server) = Server::unpack(input).map(|x| x.0) else {
            clue!(COLLECTOR, ERROR, {
                invalid_add_server: p.slot,
            });
            self.executed(p, cmd, si, request_nonce, ReturnCode::Internal, b"bad server".to_vec());
            return;
        };
        if server.id == ServerId::BOTTOM || server.bind_to.is_empty() {
            self.executed(p, cmd, si, request_nonce, ReturnCode::ServerError, b"invalid server".to_vec());
            return;
        }
        let tail = self.configs.back().expect("configs are never empty");
        if tail.has_id(server.id) && tail.get(server.id).map(|s| s.bind_to.as_str()) == Some(server.bind_to.as_str()) {
            // Already a member:  the retry already won.
            self.executed(p, cmd, si, request_nonce, ReturnCode::Success, Vec::new());
            return;
        }
        if tail.has_id(server.id) || tail.has_address(&server.bind_to) {
            self.executed(
                p,
                cmd,
                si,
                request_nonce,
                ReturnCode::ServerError,
                b"id or address already in use".to_vec(),
            );
            return;
        }
        clue!(COLLECTOR, INFO, {
            adding_server: server.id.get(),
            first_slot: p.slot + SLOTS_WINDOW,
        });
        let next = tail.grow(server, p.slot + SLOTS_WINDOW);
        self.configs.push_back(next);
        self.executed(p, cmd, si, request_nonce, ReturnCode::Success, Vec::new());
    }

    fn executed(
        &self,
        p: &PValue,
        cmd: &Command,
        si: ServerId,
        request_nonce: u64,
        status: ReturnCode,
        output: Vec<u8>,
    ) {
        self.shared
            .executed(p.slot, cmd.flags, cmd.nonce, si, request_nonce, status, output);
    }

    ///////////////////////////////////// client operations ////////////////////////////////////

    /// Route a cond-wait to the right condition.  The `replicant` pseudo-object exposes
    /// `configuration` and `tick`; everything else belongs to a hosted object.
    pub fn cond_wait(&mut self, si: ServerId, nonce: u64, obj: &str, cond: &str, state: u64) {
        if obj == "replicant" {
            let condition = match cond {
                "configuration" => &mut self.cond_config,
                "tick" => &mut self.cond_tick,
                _ => {
                    clue!(COLLECTOR, WARNING, {
                        cond_not_found: cond,
                    });
                    self.shared.daemon.callback_client(
                        si,
                        nonce,
                        ReturnCode::CondNotFound,
                        Vec::new(),
                    );
                    return;
                }
            };
            if let Some(woken) = condition.wait(si, nonce, state) {
                self.shared.daemon.callback_condition(
                    woken.client,
                    woken.nonce,
                    woken.state,
                    woken.data,
                );
            }
            return;
        }
        match self.objects.get(obj) {
            Some(object) => {
                object.cond_wait(si, nonce, cond.to_string(), state);
            }
            None => {
                clue!(COLLECTOR, WARNING, {
                    obj_not_found: obj,
                });
                self.shared
                    .daemon
                    .callback_client(si, nonce, ReturnCode::ObjNotFound, Vec::new());
            }
        }
    }

    pub fn has_output(&self, nonce: u64, min_slot: u64) -> Option<(ReturnCode, Vec<u8>)> {
        self.shared.has_output(nonce, min_slot)
    }

    //////////////////////////////////////// maintenance ///////////////////////////////////////

    /// Drop objects whose supervisor threads have finished tearing down.
    pub fn clean_dead_objects(&mut self) {
        self.dying_objects.retain(|obj| !obj.done());
    }

    /// Re-propose the failure of every locally-failed object.  The proposal is idempotent; it
    /// repeats until the whole configuration has agreed.
    pub fn enqueue_failed_objects(&mut self) -> Vec<SideEffect> {
        let mut effects = Vec::new();
        for obj in self.objects.values() {
            if obj.failed() {
                let failed = ObjectFailed {
                    server: self.shared.daemon.us().id,
                    object: obj.name().to_string(),
                    when: obj.last_executed(),
                };
                effects.push(SideEffect::Enqueue {
                    slot_type: SlotType::ObjectFailed,
                    command: stack_pack(failed).to_vec(),
                });
            }
        }
        effects
    }

    ///////////////////////////////////////// snapshots ////////////////////////////////////////

    /// Begin a snapshot at the current slot boundary.  Skipped when an object has failed (the
    /// capture could never complete) or when a snapshot at this slot already exists.
    pub fn initiate_snapshot(&mut self) {
        let snap = {
            let mut snapshots = self.shared.snapshots.lock().unwrap();
            for obj in self.objects.values() {
                if obj.failed() {
                    clue!(COLLECTOR, INFO, {
                        snapshot_skipped_object_failed: obj.name(),
                    });
                    return;
                }
            }
            if snapshots.last().map(|s| s.slot()) >= Some(self.slot) {
                return;
            }
            SNAPSHOTS_INITIATED.click();
            let command_nonces: Vec<u64> = self.command_nonces.iter().copied().collect();
            let robust: Vec<HistoryEntry> = {
                let robust = self.shared.robust.lock().unwrap();
                robust.history.iter().cloned().collect()
            };
            let internals = ReplicaSnapshot {
                slot: self.slot,
                counter: self.counter,
                config: self.configs.front().expect("configs are never empty").clone(),
                slots: self.slots.clone(),
                cond_config_state: self.cond_config.peek_state(),
                cond_tick_state: self.cond_tick.peek_state(),
                command_nonces,
                robust,
                objects: Vec::new(),
            };
            let snap = Arc::new(Snapshot::new(self.slot, stack_pack(&internals).to_vec()));
            snapshots.push(Arc::clone(&snap));
            for obj in self.objects.values() {
                obj.take_snapshot(&snap);
            }
            snap
        };
        if snap.done() {
            self.shared.snapshot_finished();
        }
    }

    /// Block until the most recent snapshot settles.
    pub fn snapshot_barrier(&self) {
        let snap = {
            let snapshots = self.shared.snapshots.lock().unwrap();
            snapshots.last().map(Arc::clone)
        };
        if let Some(snap) = snap {
            snap.wait();
        }
    }

    pub fn last_snapshot_slot(&self) -> u64 {
        self.shared
            .latest
            .lock()
            .unwrap()
            .as_ref()
            .map(|(slot, _)| *slot)
            .unwrap_or(0)
    }

    /// The latest published snapshot, creating one if none has been published yet.
    pub fn get_last_snapshot(&mut self) -> Option<(u64, Vec<u8>)> {
        if self.shared.latest.lock().unwrap().is_none() {
            self.initiate_snapshot();
            self.snapshot_barrier();
            self.shared.snapshot_finished();
        }
        self.shared.latest_snapshot()
    }

    /// A snapshot taken right now, for bootstrap.
    pub fn take_blocking_snapshot(&mut self) -> Option<(u64, Vec<u8>)> {
        self.initiate_snapshot();
        self.snapshot_barrier();
        self.shared.snapshot_finished();
        self.shared.latest_snapshot()
    }

    ////////////////////////////////////////// objects /////////////////////////////////////////

    fn launch_library(&mut self, name: &str, slot: u64, lib: &[u8]) -> Option<Arc<Object>> {
        OBJECTS_LAUNCHED.click();
        let obj = Object::new(
            Arc::clone(&self.shared),
            slot,
            name.to_string(),
            lib.to_vec(),
        );
        self.objects.insert(name.to_string(), Arc::clone(&obj));
        let libpath = self
            .host
            .data_dir
            .join(format!("libreplicant-{}-{}.so", name, slot));
        if std::fs::write(&libpath, lib).is_err() {
            clue!(COLLECTOR, ERROR, {
                could_not_write_library: name,
            });
            obj.fail();
            return None;
        }
        match spawn_host(&self.host.executable, &[libpath.as_os_str()]) {
            Ok((pid, stream)) => {
                obj.set_child(Some(pid), stream);
                Some(obj)
            }
            Err(_) => {
                clue!(COLLECTOR, ERROR, {
                    could_not_spawn_host: name,
                });
                obj.fail();
                None
            }
        }
    }

    fn relaunch(&mut self, name: &str, slot: u64, state: &[u8]) -> bool {
        let Ok(snapshot) = ObjectSnapshot::unpack(state).map(|x| x.0) else {
            return false;
        };
        if snapshot.ty != OBJECT_LIBRARY {
            return false;
        }
        let init = snapshot.init.clone();
        let Some(obj) = self.launch_library(name, slot, &init) else {
            return false;
        };
        obj.rtor(snapshot);
        true
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        for obj in self.objects.values() {
            obj.fail();
        }
        for obj in self.dying_objects.iter() {
            obj.fail();
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use replicant_pb::{Ballot, ClusterId, NetworkMessage, VersionId};

    use crate::transport::inproc::Mesh;
    use crate::transport::Transport;
    use crate::unordered::UnorderedCommand;

    use super::*;

    fn sid(x: u64) -> ServerId {
        ServerId::new(x)
    }

    struct Fixture {
        replica: Replica,
        client: crate::transport::inproc::MeshTransport,
        shared: Arc<Shared>,
        next_slot: u64,
        next_nonce: u64,
    }

    impl Fixture {
        fn new(servers: &[Server]) -> Fixture {
            let mesh = Mesh::new();
            let us = servers[0].clone();
            let endpoint = mesh.register(&us);
            let client = mesh.client();
            let shared = Arc::new(Shared::new(us, Arc::new(endpoint)));
            let config = Configuration::new(
                ClusterId::new(999),
                VersionId::new(1),
                0,
                servers.to_vec(),
            );
            let replica = Replica::new(Arc::clone(&shared), HostConfig::default(), config);
            Fixture {
                replica,
                client,
                shared,
                next_slot: 0,
                next_nonce: 1,
            }
        }

        fn one_server() -> Fixture {
            Fixture::new(&[Server::new(sid(1), "h1:1982")])
        }

        fn learn(&mut self, slot_type: SlotType, flags: u8, nonce: u64, payload: Vec<u8>) -> Vec<SideEffect> {
            let cmd = Command::new(slot_type, flags, nonce, payload);
            let slot = self.next_slot;
            self.next_slot += 1;
            self.replica
                .learn(PValue::new(Ballot::new(1, sid(1)), slot, cmd.pack()))
        }

        /// Register a pending client command so execution can answer it.
        fn expect_response(&mut self, slot_type: SlotType) -> u64 {
            let nonce = self.next_nonce;
            self.next_nonce += 1;
            self.expect_response_for(slot_type, nonce);
            nonce
        }

        fn expect_response_for(&mut self, slot_type: SlotType, nonce: u64) {
            let mut uc = UnorderedCommand::new(
                self.client.us(),
                1000 + nonce,
                slot_type,
                Vec::new(),
            );
            uc.command_nonce = nonce;
            self.shared.unordered.lock().unwrap().insert(uc);
        }

        fn recv_response(&mut self) -> replicant_pb::ClientResponse {
            for _ in 0..100 {
                if let Some((_, msg)) = self.client.recv(Duration::from_secs(5)).unwrap() {
                    if let NetworkMessage::ClientResponse(resp) = msg {
                        return resp;
                    }
                }
            }
            panic!("no client response arrived");
        }
    }

    #[test]
    fn slots_execute_in_order_despite_arrival_order() {
        let mut fx = Fixture::one_server();
        let ballot = Ballot::new(1, sid(1));
        let poke = |slot| {
            PValue::new(
                ballot,
                slot,
                Command::new(SlotType::Poke, 0, 0, b"hi".to_vec()).pack(),
            )
        };
        fx.replica.learn(poke(2));
        fx.replica.learn(poke(1));
        assert_eq!(0, fx.replica.next_slot());
        assert!(fx.replica.discontinuous());
        fx.replica.learn(poke(0));
        assert_eq!(3, fx.replica.next_slot());
        assert!(!fx.replica.discontinuous());
    }

    #[test]
    fn duplicate_nonces_execute_once() {
        let mut fx = Fixture::one_server();
        let effects = fx.learn(SlotType::IncrementCounter, 0, 77, stack_pack(IncrementCounter {
            server: sid(1),
            token: 42,
        }).to_vec());
        assert_eq!(1, effects.len());
        // The same nonce again:  ignored, no new effect.
        let effects = fx.learn(SlotType::IncrementCounter, 0, 77, stack_pack(IncrementCounter {
            server: sid(1),
            token: 42,
        }).to_vec());
        assert!(effects.is_empty());
    }

    #[test]
    fn increment_counter_grants_batches() {
        let mut fx = Fixture::one_server();
        let effects = fx.learn(SlotType::IncrementCounter, 0, 1, stack_pack(IncrementCounter {
            server: sid(7),
            token: 42,
        }).to_vec());
        match &effects[0] {
            SideEffect::NonceSequence { server, token, counter } => {
                assert_eq!(sid(7), *server);
                assert_eq!(42, *token);
                assert_eq!(replicant_pb::NONCE_BATCH, *counter);
            }
            other => panic!("unexpected effect: {:?}", other),
        }
        let effects = fx.learn(SlotType::IncrementCounter, 0, 2, stack_pack(IncrementCounter {
            server: sid(7),
            token: 43,
        }).to_vec());
        match &effects[0] {
            SideEffect::NonceSequence { counter, .. } => {
                assert_eq!(2 * replicant_pb::NONCE_BATCH, *counter);
            }
            other => panic!("unexpected effect: {:?}", other),
        }
    }

    #[test]
    fn become_member_schedules_a_future_configuration() {
        let mut fx = Fixture::one_server();
        let payload = stack_pack(BecomeMember {
            server: Server::new(sid(2), "h2:1982"),
        })
        .to_vec();
        fx.learn(SlotType::ServerBecomeMember, 0, 1, payload.clone());
        assert_eq!(2, fx.replica.configs().count());
        let scheduled = fx.replica.configs().nth(1).unwrap();
        assert_eq!(VersionId::new(2), scheduled.version);
        assert_eq!(SLOTS_WINDOW, scheduled.first_slot);
        // The window may not race past the scheduled configuration.
        let (_, limit) = fx.replica.window();
        assert_eq!(SLOTS_WINDOW, limit);
        assert!(fx.replica.fill_window());
        // A duplicate is refused without a new configuration.
        fx.learn(SlotType::ServerBecomeMember, 0, 2, payload);
        assert_eq!(2, fx.replica.configs().count());
    }

    #[test]
    fn configuration_promotes_at_first_slot() {
        let mut fx = Fixture::one_server();
        let payload = stack_pack(BecomeMember {
            server: Server::new(sid(2), "h2:1982"),
        })
        .to_vec();
        fx.learn(SlotType::ServerBecomeMember, 0, 1, payload);
        // Park a waiter on the configuration condition.
        fx.replica
            .cond_wait(fx.client.us(), 555, "replicant", "configuration", 2);
        // Nops up to the scheduled first slot.
        for _ in fx.next_slot..SLOTS_WINDOW {
            fx.learn(SlotType::Nop, 0, 0, Vec::new());
        }
        assert_eq!(VersionId::new(2), fx.replica.config().version);
        assert_eq!(2, fx.replica.config().servers.len());
        let resp = fx.recv_response();
        assert_eq!(555, resp.client_nonce);
        assert_eq!(ReturnCode::Success.to_u32(), resp.status);
    }

    #[test]
    fn gc_floor_is_the_minimum_acknowledged() {
        let mut fx = Fixture::new(&[
            Server::new(sid(1), "h1:1982"),
            Server::new(sid(2), "h2:1982"),
        ]);
        assert_eq!(0, fx.replica.gc_up_to());
        fx.learn(
            SlotType::ServerSetGcThresh,
            0,
            1,
            stack_pack(SetGcThresh {
                server: sid(1),
                threshold: 50,
            })
            .to_vec(),
        );
        assert_eq!(0, fx.replica.gc_up_to());
        fx.learn(
            SlotType::ServerSetGcThresh,
            0,
            2,
            stack_pack(SetGcThresh {
                server: sid(2),
                threshold: 30,
            })
            .to_vec(),
        );
        assert_eq!(30, fx.replica.gc_up_to());
        // Thresholds never regress.
        fx.learn(
            SlotType::ServerSetGcThresh,
            0,
            3,
            stack_pack(SetGcThresh {
                server: sid(2),
                threshold: 10,
            })
            .to_vec(),
        );
        assert_eq!(30, fx.replica.gc_up_to());
    }

    #[test]
    fn list_objects_answers_the_client() {
        let mut fx = Fixture::one_server();
        let nonce = fx.expect_response(SlotType::Call);
        let payload = stack_pack(CallPayload {
            object: "replicant".to_string(),
            func: "list_objects".to_string(),
            input: Vec::new(),
        })
        .to_vec();
        fx.learn(SlotType::Call, 0, nonce, payload);
        let resp = fx.recv_response();
        assert_eq!(1000 + nonce, resp.client_nonce);
        assert_eq!(ReturnCode::Success.to_u32(), resp.status);
        assert!(resp.payload.is_empty());
    }

    #[test]
    fn robust_calls_replay_from_history() {
        let mut fx = Fixture::one_server();
        let nonce = fx.expect_response(SlotType::Call);
        let payload = stack_pack(CallPayload {
            object: "replicant".to_string(),
            func: "list_objects".to_string(),
            input: Vec::new(),
        })
        .to_vec();
        fx.learn(
            SlotType::Call,
            replicant_pb::COMMAND_FLAG_ROBUST,
            nonce,
            payload.clone(),
        );
        let first = fx.recv_response();
        assert_eq!(ReturnCode::Success.to_u32(), first.status);
        // The outcome is recorded.
        let (status, _) = fx.replica.has_output(nonce, 0).unwrap();
        assert_eq!(ReturnCode::Success, status);
        // Re-execution of the same nonce replays the recorded outcome rather than re-running.
        fx.expect_response_for(SlotType::Call, nonce);
        fx.learn(SlotType::Call, replicant_pb::COMMAND_FLAG_ROBUST, nonce, payload);
        let replay = fx.recv_response();
        assert_eq!(ReturnCode::Success.to_u32(), replay.status);
        assert_eq!(1000 + nonce, replay.client_nonce);
        // An unknown nonce has no record.
        assert!(fx.replica.has_output(123456, u64::MAX).is_none());
    }

    #[test]
    fn unknown_replicant_function_is_refused() {
        let mut fx = Fixture::one_server();
        let nonce = fx.expect_response(SlotType::Call);
        let payload = stack_pack(CallPayload {
            object: "replicant".to_string(),
            func: "frobnicate".to_string(),
            input: Vec::new(),
        })
        .to_vec();
        fx.learn(SlotType::Call, 0, nonce, payload);
        let resp = fx.recv_response();
        assert_eq!(ReturnCode::FuncNotFound.to_u32(), resp.status);
    }

    #[test]
    fn call_to_missing_object_is_refused() {
        let mut fx = Fixture::one_server();
        let nonce = fx.expect_response(SlotType::Call);
        let payload = stack_pack(CallPayload {
            object: "nope".to_string(),
            func: "poke".to_string(),
            input: Vec::new(),
        })
        .to_vec();
        fx.learn(SlotType::Call, 0, nonce, payload);
        let resp = fx.recv_response();
        assert_eq!(ReturnCode::ObjNotFound.to_u32(), resp.status);
    }

    #[test]
    fn kill_server_refuses_the_last_server() {
        let mut fx = Fixture::one_server();
        let nonce = fx.expect_response(SlotType::Call);
        let payload = stack_pack(CallPayload {
            object: "replicant".to_string(),
            func: "kill_server".to_string(),
            input: stack_pack(sid(1)).to_vec(),
        })
        .to_vec();
        fx.learn(SlotType::Call, 0, nonce, payload);
        let resp = fx.recv_response();
        assert_eq!(ReturnCode::Success.to_u32(), resp.status);
        assert_eq!(1, fx.replica.configs().count());
    }

    #[test]
    fn kill_server_removes_one_member() {
        let mut fx = Fixture::new(&[
            Server::new(sid(1), "h1:1982"),
            Server::new(sid(2), "h2:1982"),
        ]);
        let nonce = fx.expect_response(SlotType::Call);
        let payload = stack_pack(CallPayload {
            object: "replicant".to_string(),
            func: "kill_server".to_string(),
            input: stack_pack(sid(2)).to_vec(),
        })
        .to_vec();
        fx.learn(SlotType::Call, 0, nonce, payload);
        let resp = fx.recv_response();
        assert_eq!(ReturnCode::Success.to_u32(), resp.status);
        let scheduled = fx.replica.configs().nth(1).unwrap();
        assert_eq!(vec![sid(1)], scheduled.server_ids());
        assert_eq!(VersionId::new(2), scheduled.version);
    }

    #[test]
    fn add_server_validates_uniqueness() {
        let mut fx = Fixture::one_server();
        let nonce = fx.expect_response(SlotType::Call);
        let payload = stack_pack(CallPayload {
            object: "replicant".to_string(),
            func: "add_server".to_string(),
            input: stack_pack(Server::new(sid(1), "h9:1982")).to_vec(),
        })
        .to_vec();
        fx.learn(SlotType::Call, 0, nonce, payload);
        let resp = fx.recv_response();
        assert_eq!(ReturnCode::ServerError.to_u32(), resp.status);
        let nonce = fx.expect_response(SlotType::Call);
        let payload = stack_pack(CallPayload {
            object: "replicant".to_string(),
            func: "add_server".to_string(),
            input: stack_pack(Server::new(sid(2), "h2:1982")).to_vec(),
        })
        .to_vec();
        fx.learn(SlotType::Call, 0, nonce, payload);
        let resp = fx.recv_response();
        assert_eq!(ReturnCode::Success.to_u32(), resp.status);
        assert_eq!(2, fx.replica.configs().count());
    }

    #[test]
    fn tick_broadcasts_the_tick_condition() {
        let mut fx = Fixture::one_server();
        // cond_tick starts at the configuration version.
        assert_eq!(1, fx.replica.last_tick());
        fx.replica.cond_wait(fx.client.us(), 777, "replicant", "tick", 2);
        fx.learn(SlotType::Tick, 0, 1, stack_pack(Tick { tick: 1 }).to_vec());
        assert_eq!(2, fx.replica.last_tick());
        let resp = fx.recv_response();
        assert_eq!(777, resp.client_nonce);
        // A stale tick does not advance the clock.
        fx.learn(SlotType::Tick, 0, 2, stack_pack(Tick { tick: 1 }).to_vec());
        assert_eq!(2, fx.replica.last_tick());
    }

    #[test]
    fn snapshots_capture_and_restore_replica_state() {
        let mut fx = Fixture::one_server();
        fx.learn(SlotType::IncrementCounter, 0, 11, stack_pack(IncrementCounter {
            server: sid(1),
            token: 42,
        }).to_vec());
        fx.learn(SlotType::Poke, 0, 12, b"hello".to_vec());
        let (slot, snap) = fx.replica.take_blocking_snapshot().unwrap();
        assert_eq!(2, slot);
        // Restore into a second replica and verify the interesting state survived.
        let mesh = Mesh::new();
        let us = Server::new(sid(1), "h1:1982");
        let endpoint = mesh.register(&us);
        let shared = Arc::new(Shared::new(us, Arc::new(endpoint)));
        let restored = Replica::from_snapshot(shared, HostConfig::default(), &snap).unwrap();
        assert_eq!(2, restored.next_slot());
        assert_eq!(fx.replica.config(), restored.config());
        assert_eq!(fx.replica.last_tick(), restored.last_tick());
        // Nonces learned before the snapshot still dedup after restore.
        let mut restored = restored;
        let cmd = Command::new(
            SlotType::IncrementCounter,
            0,
            11,
            stack_pack(IncrementCounter {
                server: sid(1),
                token: 42,
            })
            .to_vec(),
        );
        let effects = restored.learn(PValue::new(Ballot::new(1, sid(1)), 2, cmd.pack()));
        assert!(effects.is_empty());
    }

    #[test]
    fn snapshot_every_interval() {
        let mut fx = Fixture::one_server();
        for _ in 0..SNAPSHOT_INTERVAL_SLOTS {
            fx.learn(SlotType::Nop, 0, 0, Vec::new());
        }
        fx.replica.snapshot_barrier();
        fx.replica.shared().snapshot_finished();
        assert_eq!(SNAPSHOT_INTERVAL_SLOTS, fx.replica.last_snapshot_slot());
    }

    #[test]
    fn poke_answers_its_client() {
        let mut fx = Fixture::one_server();
        let nonce = fx.expect_response(SlotType::Poke);
        fx.learn(SlotType::Poke, 0, nonce, b"poked".to_vec());
        let resp = fx.recv_response();
        assert_eq!(1000 + nonce, resp.client_nonce);
        assert_eq!(ReturnCode::Success.to_u32(), resp.status);
    }
}
