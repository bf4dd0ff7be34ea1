//! The server loop:  bootstrap or rejoin the cluster, then spin on the transport dispatching
//! messages to the acceptor, scout, leader, and replica, running the periodic tasks in between.
//! The loop is a single thread and is the only mutator of the scout, the leader, the acceptor,
//! and the replica's bookkeeping; everything object threads need lives behind [Shared].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arrrg_derive::CommandLine;

use biometrics::{Collector, Counter};

use buffertk::stack_pack;

use indicio::{clue, ALWAYS, ERROR, INFO, WARNING};

use sync42::background::BackgroundThread;

use tatl::{HeyListen, Stationary};

use zerror_core::ErrorCore;

use replicant_pb::{
    Ballot, BecomeMember, Bootstrap, BootstrapResponse, CallRobust, ClientResponse, CondValue,
    Configuration, GetRobustParams, Identity, IncrementCounter, NetworkMessage, NonceGranted,
    PValue, Phase1A, Phase1B, Phase2A, Phase2B, Ping, Poke, ReturnCode, RobustParams, Server,
    ServerId, SetGcThresh, SlotType, StateTransferred, Submit, Tick, VersionId,
    COMMANDS_TO_LEADER, COMMAND_NONCE_HISTORY, NONCE_BATCH, NONCE_REGENERATE_WHEN_FEWER_THAN,
};

use super::acceptor::Acceptor;
use super::failure_tracker::FailureTracker;
use super::leader::Leader;
use super::replica::{HostConfig, Replica, SideEffect};
use super::scout::Scout;
use super::transport::Transport;
use super::unordered::UnorderedCommand;
use super::{generate_token, Error, COLLECTOR, SUSPECT_TIMEOUT};

///////////////////////////////////////////// Constants ////////////////////////////////////////////

const RECV_TIMEOUT: Duration = Duration::from_millis(1);
const BOOTSTRAP_RPC_TIMEOUT: Duration = Duration::from_secs(1);
const TRANSFER_RPC_TIMEOUT: Duration = Duration::from_secs(60);
const JOIN_ATTEMPTS: usize = 100;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static MESSAGES_DISPATCHED: Counter = Counter::new("replicant.daemon.messages_dispatched");
static SCOUTS_STARTED: Counter = Counter::new("replicant.daemon.scouts_started");
static LEADERS_PROMOTED: Counter = Counter::new("replicant.daemon.leaders_promoted");
static LEARNED_BROADCAST: Counter = Counter::new("replicant.daemon.learned_broadcast");
static DEFERRED_FLUSHED: Counter = Counter::new("replicant.daemon.deferred_flushed");
static NONCES_GRANTED: Counter = Counter::new("replicant.daemon.nonces_granted");

static CORRUPT_MESSAGES: Counter = Counter::new("replicant.daemon.corrupt_messages");
static CORRUPT_MESSAGES_MONITOR: Stationary =
    Stationary::new("replicant.daemon.corrupt_messages", &CORRUPT_MESSAGES);

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&MESSAGES_DISPATCHED);
    collector.register_counter(&SCOUTS_STARTED);
    collector.register_counter(&LEADERS_PROMOTED);
    collector.register_counter(&LEARNED_BROADCAST);
    collector.register_counter(&DEFERRED_FLUSHED);
    collector.register_counter(&NONCES_GRANTED);
    collector.register_counter(&CORRUPT_MESSAGES);
}

pub fn register_monitors(hey_listen: &mut HeyListen) {
    hey_listen.register_stationary(&CORRUPT_MESSAGES_MONITOR);
}

////////////////////////////////////////////// Signals /////////////////////////////////////////////

/// The cancellation token.  Signal handlers feed it; every blocking site checks it.
#[derive(Default)]
pub struct Signals {
    interrupts: AtomicU32,
    debug_dump: AtomicBool,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn interrupted(&self) -> bool {
        self.interrupts.load(Ordering::Relaxed) > 0
    }

    pub fn request_debug_dump(&self) {
        self.debug_dump.store(true, Ordering::Relaxed);
    }

    fn take_debug_dump(&self) -> bool {
        self.debug_dump.swap(false, Ordering::Relaxed)
    }
}

////////////////////////////////////////////// Shared //////////////////////////////////////////////

/// The daemon surface reachable from other threads:  the transport's thread-safe send, the
/// unordered-command table, and the client callback helpers.
pub struct Shared {
    us: Server,
    transport: Arc<dyn Transport>,
    pub unordered: Mutex<super::unordered::UnorderedTable>,
}

impl Shared {
    pub fn new(us: Server, transport: Arc<dyn Transport>) -> Self {
        Self {
            us,
            transport,
            unordered: Mutex::new(super::unordered::UnorderedTable::default()),
        }
    }

    pub fn us(&self) -> &Server {
        &self.us
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Fire and forget.  Disruption is tolerated; the peer will be rediscovered.
    pub fn send(&self, si: ServerId, msg: &NetworkMessage) {
        if let Err(err) = self.transport.send(si, msg) {
            if !matches!(err, Error::Disrupted { .. }) {
                clue!(COLLECTOR, WARNING, {
                    send_failed: si.get(),
                });
            }
        }
    }

    /// Answer a client.  A bottom id means the command had no local client.
    pub fn callback_client(&self, si: ServerId, nonce: u64, status: ReturnCode, output: Vec<u8>) {
        if si == ServerId::BOTTOM {
            return;
        }
        self.send(
            si,
            &NetworkMessage::ClientResponse(ClientResponse {
                client_nonce: nonce,
                status: status.to_u32(),
                payload: output,
            }),
        );
    }

    /// Answer a condition waiter with the state and data it waited for.
    pub fn callback_condition(&self, si: ServerId, nonce: u64, state: u64, data: Vec<u8>) {
        if si == ServerId::BOTTOM {
            return;
        }
        self.send(
            si,
            &NetworkMessage::ClientResponse(ClientResponse {
                client_nonce: nonce,
                status: ReturnCode::Success.to_u32(),
                payload: stack_pack(CondValue { state, data }).to_vec(),
            }),
        );
    }

    /// A command reached execution:  look up who submitted it here, if anyone.
    pub fn callback_enqueued(&self, command_nonce: u64) -> (ServerId, u64) {
        if command_nonce == 0 {
            return (ServerId::BOTTOM, 0);
        }
        let mut unordered = self.unordered.lock().unwrap();
        match unordered.remove(command_nonce) {
            Some(uc) => (uc.on_behalf_of, uc.request_nonce),
            None => (ServerId::BOTTOM, 0),
        }
    }

    /// An object supervisor noticed its child die; poke the main loop from its thread.
    pub fn notify_object_failed(&self) {
        self.send(self.us.id, &NetworkMessage::ObjectFailed);
    }
}

/////////////////////////////////////////// DaemonOptions //////////////////////////////////////////

#[derive(Clone, CommandLine, Debug, Eq, PartialEq)]
pub struct DaemonOptions {
    #[arrrg(flag, "Run replicant in the background.")]
    pub daemon: bool,
    #[arrrg(flag, "Run replicant in the foreground.")]
    pub foreground: bool,
    #[arrrg(optional, "Store persistent state in this directory.", "DIR")]
    pub data: String,
    #[arrrg(optional, "Listen on a specific IP address.", "IP")]
    pub listen: String,
    #[arrrg(optional, "Listen on an alternative port.", "PORT")]
    pub listen_port: u16,
    #[arrrg(optional, "Join an existing cluster through this address.", "ADDR")]
    pub connect: String,
    #[arrrg(optional, "Connect to an alternative port.", "PORT")]
    pub connect_port: u16,
    #[arrrg(optional, "On a fresh cluster, create an object of this name.", "NAME")]
    pub init_obj: String,
    #[arrrg(optional, "Create the initial object from this library.", "PATH")]
    pub init_lib: String,
    #[arrrg(optional, "Pass this string to the initial object's init function.", "STR")]
    pub init_str: String,
    #[arrrg(optional, "Restore the initial object from this backup file.", "PATH")]
    pub init_rst: String,
    #[arrrg(optional, "Host objects with this helper executable.", "PATH")]
    pub rsm_host: String,
}

impl DaemonOptions {
    pub fn bind_to(&self) -> String {
        format!("{}:{}", self.listen, self.listen_port)
    }

    pub fn existing(&self) -> Option<Bootstrap> {
        if self.connect.is_empty() {
            return None;
        }
        let conn = if self.connect.contains(':') {
            self.connect.clone()
        } else {
            format!("{}:{}", self.connect, self.connect_port)
        };
        Bootstrap::parse(&conn).ok()
    }

    pub fn host_config(&self) -> HostConfig {
        let mut host = HostConfig {
            data_dir: self.data.clone().into(),
            ..HostConfig::default()
        };
        if !self.rsm_host.is_empty() {
            host.executable = self.rsm_host.clone().into();
        }
        host
    }
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            daemon: false,
            foreground: false,
            data: ".".to_string(),
            listen: "127.0.0.1".to_string(),
            listen_port: 1982,
            connect: String::new(),
            connect_port: 1982,
            init_obj: String::new(),
            init_lib: String::new(),
            init_str: String::new(),
            init_rst: String::new(),
            rsm_host: String::new(),
        }
    }
}

///////////////////////////////////////////// Periodic /////////////////////////////////////////////

#[derive(Clone, Copy, Debug)]
enum Task {
    Maintain,
    PingServers,
    GenerateNonceSequence,
    FlushEnqueuedCommands,
    MaintainObjects,
    Tick,
    WarnScoutStuck,
    CheckAddress,
}

struct Periodic {
    interval: Duration,
    next_run: Instant,
    task: Task,
}

////////////////////////////////////////////// Daemon //////////////////////////////////////////////

pub struct Daemon {
    shared: Arc<Shared>,
    signals: Arc<Signals>,
    acceptor: Acceptor,
    replica: Replica,
    scout: Option<Scout>,
    leader: Option<Leader>,
    ft: FailureTracker,
    config: Configuration,
    config_mtx: Arc<Mutex<Configuration>>,
    periodic: Vec<Periodic>,
    scout_wait_cycles: u64,
    unique_token: u64,
    unique_base: u64,
    unique_offset: u64,
    msgs_waiting_for_persistence: VecDeque<(u64, ServerId, NetworkMessage)>,
    msgs_waiting_for_nonces: Vec<(ServerId, NetworkMessage)>,
    last_replica_snapshot: u64,
    last_gc_slot: u64,
    bootstrap_stop: Arc<AtomicBool>,
    _rebootstrap: BackgroundThread,
}

impl Daemon {
    /// Start a server and serve until interrupted, the acceptor fails, or the cluster removes us.
    /// `transport_for` turns the resolved identity into a bound transport; tests hand in an
    /// in-process mesh here and production hands in TCP.
    pub fn run<F>(
        options: DaemonOptions,
        signals: Arc<Signals>,
        transport_for: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&Server) -> Result<Arc<dyn Transport>, Error>,
    {
        let host = options.host_config();
        let (mut acceptor, saved) = Acceptor::open(&options.data)?;
        let existing = options.existing();
        let mut init = false;
        let us: Server;
        let saved_bootstrap: Bootstrap;
        let shared: Arc<Shared>;
        let mut replica: Replica;
        match (saved, existing) {
            // Case 1:  no identity, no peers to join:  start a fresh cluster.
            (None, None) => {
                let this_server = if acceptor.current_ballot() != Ballot::BOTTOM {
                    acceptor.current_ballot().leader.get()
                } else {
                    generate_token().ok_or_else(|| Error::system("could not read /dev/urandom"))?
                };
                let cluster =
                    generate_token().ok_or_else(|| Error::system("could not read /dev/urandom"))?;
                us = Server::new(ServerId::new(this_server), options.bind_to());
                let config = Configuration::new(
                    replicant_pb::ClusterId::new(cluster),
                    VersionId::new(1),
                    0,
                    vec![us.clone()],
                );
                clue!(COLLECTOR, INFO, {
                    starting_cluster: cluster,
                    us: us.id.get(),
                });
                saved_bootstrap = config.bootstrap();
                init = !options.init_obj.is_empty() && !options.init_lib.is_empty();
                let transport = transport_for(&us)?;
                transport.set_servers(&config.servers);
                shared = Arc::new(Shared::new(us.clone(), transport));
                acceptor.adopt(Ballot::new(
                    acceptor.current_ballot().number + 1,
                    us.id,
                ));
                let become_msg = Command::become_member(&us);
                let p = PValue::new(acceptor.current_ballot(), 0, become_msg);
                acceptor.accept(p.clone());
                replica = Replica::new(Arc::clone(&shared), host.clone(), config);
                replica.learn(p);
                let Some((slot, snapshot)) = replica.take_blocking_snapshot() else {
                    return Err(Error::logic("fresh replica could not snapshot"));
                };
                acceptor.record_snapshot(slot, &snapshot)?;
            }
            // Case 2:  no identity, peers given:  transfer state and join.
            (None, Some(existing)) => {
                let this_server =
                    generate_token().ok_or_else(|| Error::system("could not read /dev/urandom"))?;
                us = Server::new(ServerId::new(this_server), options.bind_to());
                saved_bootstrap = existing.clone();
                let transport = transport_for(&us)?;
                shared = Arc::new(Shared::new(us.clone(), transport));
                replica = Self::replica_from_bootstrap(
                    &shared,
                    &signals,
                    &host,
                    &existing,
                    &mut acceptor,
                )?;
                if replica.config().has_address(&us.bind_to) {
                    clue!(COLLECTOR, ERROR, {
                        address_already_in_configuration: us.bind_to.as_str(),
                    });
                    return Err(Error::logic(
                        "configuration already has a server on our address",
                    ));
                }
            }
            // Case 3:  restart with a saved identity.
            (Some((saved_us, bootstrap)), existing) => {
                us = saved_us;
                saved_bootstrap = existing.unwrap_or(bootstrap);
                clue!(COLLECTOR, INFO, {
                    rejoining: us.id.get(),
                    bootstrap: saved_bootstrap.conn_str(),
                });
                let transport = transport_for(&us)?;
                shared = Arc::new(Shared::new(us.clone(), transport));
                let Some((_, snapshot)) = acceptor.load_latest_snapshot()? else {
                    return Err(Error::corruption("no replica snapshot on disk"));
                };
                replica = Replica::from_snapshot(Arc::clone(&shared), host.clone(), &snapshot)?;
            }
        }
        acceptor.save(&us, &saved_bootstrap)?;
        if !init && !options.init_rst.is_empty() {
            clue!(COLLECTOR, ERROR, {
                restore_requires_fresh_cluster: true,
            });
            return Err(Error::logic(
                "restore options only have an effect when starting a fresh cluster",
            ));
        }
        if !replica.config().has_id(us.id) {
            clue!(COLLECTOR, WARNING, {
                not_in_configuration: us.id.get(),
            });
            Self::become_cluster_member(&shared, &signals, &us, &saved_bootstrap);
            let mut joined = false;
            for _ in 0..10 {
                if signals.interrupted() {
                    return Err(Error::logic("interrupted while joining"));
                }
                replica = Self::replica_from_bootstrap(
                    &shared,
                    &signals,
                    &host,
                    &saved_bootstrap,
                    &mut acceptor,
                )?;
                if replica.config().has_id(us.id) {
                    joined = true;
                    break;
                }
                std::thread::sleep(Duration::from_secs(1));
            }
            if !joined {
                clue!(COLLECTOR, ERROR, {
                    could_not_join: us.id.get(),
                });
                return Err(Error::logic(
                    "despite repeated efforts, this server is not in the configuration",
                ));
            }
        }
        let config = replica.config().clone();
        shared.transport().set_servers(&config.servers);
        let mut ft = FailureTracker::new();
        ft.assume_all_alive(&config.server_ids());
        if init {
            Self::accept_init_commands(&options, &mut acceptor)?;
        }
        let config_mtx = Arc::new(Mutex::new(config.clone()));
        let bootstrap_stop = Arc::new(AtomicBool::new(false));
        let rebootstrap = Self::spawn_rebootstrap_thread(
            Arc::clone(&shared),
            Arc::clone(&signals),
            Arc::clone(&config_mtx),
            Arc::clone(&bootstrap_stop),
            saved_bootstrap.clone(),
        );
        let mut daemon = Daemon {
            shared,
            signals,
            acceptor,
            replica,
            scout: None,
            leader: None,
            ft,
            config,
            config_mtx,
            periodic: Self::periodic_table(),
            scout_wait_cycles: 0,
            unique_token: 0,
            unique_base: 0,
            unique_offset: 0,
            msgs_waiting_for_persistence: VecDeque::new(),
            msgs_waiting_for_nonces: Vec::new(),
            last_replica_snapshot: 0,
            last_gc_slot: 0,
            bootstrap_stop,
            _rebootstrap: rebootstrap,
        };
        daemon.serve()
    }

    fn periodic_table() -> Vec<Periodic> {
        let now = Instant::now();
        let table = [
            (250, Task::Maintain),
            (500, Task::PingServers),
            (1000, Task::GenerateNonceSequence),
            (1000, Task::FlushEnqueuedCommands),
            (1000, Task::MaintainObjects),
            (1000, Task::Tick),
            (10_000, Task::WarnScoutStuck),
            (10_000, Task::CheckAddress),
        ];
        table
            .into_iter()
            .map(|(ms, task)| Periodic {
                interval: Duration::from_millis(ms),
                next_run: now,
                task,
            })
            .collect()
    }

    ////////////////////////////////// getting to steady state /////////////////////////////////

    /// Fetch the cluster's configuration from the first bootstrap host that answers.
    fn fetch_config(shared: &Arc<Shared>, bootstrap: &Bootstrap) -> Option<Configuration> {
        for host in bootstrap.hosts.iter() {
            let reply = shared.transport().call(
                host,
                &NetworkMessage::Bootstrap(BootstrapResponse::default()),
                BOOTSTRAP_RPC_TIMEOUT,
            );
            if let Ok(NetworkMessage::Bootstrap(resp)) = reply {
                if resp.config.validate() {
                    return Some(resp.config);
                }
            }
        }
        None
    }

    /// Pull the latest snapshot out of the cluster and stand a replica up from it.
    fn replica_from_bootstrap(
        shared: &Arc<Shared>,
        signals: &Arc<Signals>,
        host: &HostConfig,
        bootstrap: &Bootstrap,
        acceptor: &mut Acceptor,
    ) -> Result<Replica, Error> {
        clue!(COLLECTOR, INFO, {
            state_transfer: bootstrap.conn_str(),
        });
        for _ in 0..JOIN_ATTEMPTS {
            if signals.interrupted() {
                return Err(Error::logic("interrupted during state transfer"));
            }
            let Some(config) = Self::fetch_config(shared, bootstrap) else {
                std::thread::sleep(Duration::from_millis(100));
                continue;
            };
            for server in config.servers.iter() {
                let reply = shared.transport().call(
                    &server.bind_to,
                    &NetworkMessage::StateTransfer(None),
                    TRANSFER_RPC_TIMEOUT,
                );
                let Ok(NetworkMessage::StateTransfer(Some(StateTransferred {
                    slot: _,
                    snapshot,
                }))) = reply
                else {
                    continue;
                };
                let Ok(mut replica) =
                    Replica::from_snapshot(Arc::clone(shared), host.clone(), &snapshot)
                else {
                    continue;
                };
                let Some((slot, snapshot)) = replica.take_blocking_snapshot() else {
                    continue;
                };
                acceptor.record_snapshot(slot, &snapshot)?;
                return Ok(replica);
            }
        }
        Err(Error::logic(
            "replica state transfer timed out, or was interrupted by the user",
        ))
    }

    /// Add ourselves to the cluster:  robust add_server first, the legacy become-member message
    /// as a fallback.
    fn become_cluster_member(
        shared: &Arc<Shared>,
        signals: &Arc<Signals>,
        us: &Server,
        bootstrap: &Bootstrap,
    ) {
        clue!(COLLECTOR, INFO, {
            joining_via: bootstrap.conn_str(),
        });
        let call = replicant_pb::CallPayload {
            object: "replicant".to_string(),
            func: "add_server".to_string(),
            input: stack_pack(us).to_vec(),
        };
        let mut params: Option<(u64, u64)> = None;
        for iteration in 0..JOIN_ATTEMPTS as u64 {
            if signals.interrupted() {
                return;
            }
            let Some(config) = Self::fetch_config(shared, bootstrap) else {
                std::thread::sleep(Duration::from_millis(100));
                continue;
            };
            if config.has_id(us.id) {
                return;
            }
            for server in config.servers.iter() {
                if params.is_some() {
                    break;
                }
                let reply = shared.transport().call(
                    &server.bind_to,
                    &NetworkMessage::GetRobustParams(GetRobustParams { client_nonce: 0 }),
                    BOOTSTRAP_RPC_TIMEOUT,
                );
                if let Ok(NetworkMessage::ClientResponse(resp)) = reply {
                    if let Ok((granted, _)) =
                        <RobustParams as buffertk::Unpackable>::unpack(&resp.payload)
                    {
                        params = Some((granted.command_nonce, granted.min_slot));
                    }
                }
            }
            let mut succeeded = false;
            if let Some((command_nonce, min_slot)) = params {
                for server in config.servers.iter() {
                    let reply = shared.transport().call(
                        &server.bind_to,
                        &NetworkMessage::CallRobust(CallRobust {
                            client_nonce: iteration,
                            command_nonce,
                            min_slot,
                            call: call.clone(),
                        }),
                        BOOTSTRAP_RPC_TIMEOUT,
                    );
                    if let Ok(NetworkMessage::ClientResponse(resp)) = reply {
                        if resp.status == ReturnCode::Success.to_u32() {
                            succeeded = true;
                            break;
                        }
                    }
                }
            }
            if !succeeded {
                for server in config.servers.iter() {
                    let reply = shared.transport().call(
                        &server.bind_to,
                        &NetworkMessage::BecomeMember(Identity { server: us.clone() }),
                        BOOTSTRAP_RPC_TIMEOUT,
                    );
                    if let Ok(NetworkMessage::Bootstrap(resp)) = reply {
                        if resp.config.has_id(us.id) {
                            succeeded = true;
                            break;
                        }
                    }
                }
            }
            if succeeded {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        clue!(COLLECTOR, ERROR, {
            join_process_timed_out: us.id.get(),
        });
    }

    /// Fresh-cluster initialization:  accept the object-creating commands directly; the first
    /// election re-proposes them from the phase-1b pvalues.
    fn accept_init_commands(options: &DaemonOptions, acceptor: &mut Acceptor) -> Result<(), Error> {
        let lib = std::fs::read(&options.init_lib)?;
        if !options.init_rst.is_empty() {
            let rst = std::fs::read(&options.init_rst)?;
            let input = stack_pack(replicant_pb::RestoreObjectInput {
                name: options.init_obj.clone(),
                state: rst,
            })
            .to_vec();
            let cmd = Command::call("replicant", "restore_object", input);
            acceptor.accept(PValue::new(acceptor.current_ballot(), 1, cmd));
            return Ok(());
        }
        let mut input = options.init_obj.clone().into_bytes();
        input.push(0);
        input.extend_from_slice(&lib);
        let cmd = Command::call("replicant", "new_object", input);
        acceptor.accept(PValue::new(acceptor.current_ballot(), 1, cmd));
        if !options.init_str.is_empty() {
            let mut init = options.init_str.clone().into_bytes();
            init.push(0);
            let cmd = Command::call(&options.init_obj, "init", init);
            acceptor.accept(PValue::new(acceptor.current_ballot(), 2, cmd));
        }
        Ok(())
    }

    /// The background thread that keeps peer addresses honest when the whole cluster moves:
    /// probe the original bootstrap hosts, and teach the transport any address the configuration
    /// does not know.  Exits once the server has learned from its own configuration, and joins
    /// when the daemon drops.
    fn spawn_rebootstrap_thread(
        shared: Arc<Shared>,
        signals: Arc<Signals>,
        config_mtx: Arc<Mutex<Configuration>>,
        stop: Arc<AtomicBool>,
        bootstrap: Bootstrap,
    ) -> BackgroundThread {
        BackgroundThread::spawn(move |done| {
            let exit = |done: &Arc<AtomicBool>| {
                done.load(Ordering::Relaxed)
                    || signals.interrupted()
                    || stop.load(Ordering::Relaxed)
            };
            while !exit(&done) {
                std::thread::sleep(Duration::from_secs(1));
                let config = config_mtx.lock().unwrap().clone();
                for host in bootstrap.hosts.iter() {
                    if exit(&done) {
                        break;
                    }
                    let reply = shared.transport().call(
                        host,
                        &NetworkMessage::WhoAreYou,
                        BOOTSTRAP_RPC_TIMEOUT,
                    );
                    let Ok(NetworkMessage::Identity(identity)) = reply else {
                        continue;
                    };
                    let known = config
                        .get(identity.server.id)
                        .map(|s| s.bind_to == identity.server.bind_to)
                        .unwrap_or(false);
                    if !known {
                        shared.transport().add_aux(&identity.server);
                    }
                }
            }
        })
    }

    //////////////////////////////////////// the main loop /////////////////////////////////////

    fn serve(&mut self) -> Result<(), Error> {
        while !self.signals.interrupted() {
            if self.acceptor.failed() {
                clue!(COLLECTOR, ERROR, {
                    acceptor_failed_exiting: true,
                });
                // Exit immediately; disconnected clients already read as indeterminate.
                return Err(Error::AcceptorFailed {
                    core: ErrorCore::default(),
                });
            }
            self.flush_acceptor_messages();
            self.run_periodic();
            if self.signals.take_debug_dump() {
                self.debug_dump();
            }
            match self.shared.transport().recv(RECV_TIMEOUT) {
                Ok(Some((si, msg))) => {
                    MESSAGES_DISPATCHED.click();
                    self.dispatch(si, msg);
                }
                Ok(None) => {}
                Err(_) => {}
            }
        }
        clue!(COLLECTOR, INFO, {
            shutting_down: true,
        });
        Ok(())
    }

    fn dispatch(&mut self, si: ServerId, msg: NetworkMessage) {
        match msg {
            NetworkMessage::Nop => {}
            NetworkMessage::Bootstrap(_) | NetworkMessage::SilentBootstrap(_) => {
                self.send_bootstrap(si);
            }
            NetworkMessage::StateTransfer(None) => self.process_state_transfer(si),
            NetworkMessage::WhoAreYou => {
                self.shared.send(
                    si,
                    &NetworkMessage::Identity(Identity {
                        server: self.shared.us().clone(),
                    }),
                );
            }
            NetworkMessage::Phase1A(m) => self.process_paxos_phase1a(si, m),
            NetworkMessage::Phase1B(m) => self.process_paxos_phase1b(si, m),
            NetworkMessage::Phase2A(m) => self.process_paxos_phase2a(si, m),
            NetworkMessage::Phase2B(m) => self.process_paxos_phase2b(si, m),
            NetworkMessage::Learn(m) => self.process_paxos_learn(si, m.pvalue),
            NetworkMessage::Submit(m) => self.process_paxos_submit(m),
            NetworkMessage::BecomeMember(m) => self.process_server_become_member(si, m.server),
            NetworkMessage::ObjectFailed => {
                if si == self.shared.us().id {
                    let effects = self.replica.enqueue_failed_objects();
                    self.apply_side_effects(effects);
                }
            }
            NetworkMessage::UniqueNumber(m) => self.process_unique_number(si, m),
            NetworkMessage::Poke(m) => self.process_poke(si, m),
            NetworkMessage::CondWait(m) => {
                self.replica
                    .cond_wait(si, m.client_nonce, &m.object, &m.cond, m.state);
            }
            NetworkMessage::Call(m) => {
                self.enqueue_paxos_command(
                    si,
                    m.client_nonce,
                    SlotType::Call,
                    stack_pack(m.call).to_vec(),
                );
            }
            NetworkMessage::GetRobustParams(m) => self.process_get_robust_params(si, m),
            NetworkMessage::CallRobust(m) => self.process_call_robust(si, m),
            NetworkMessage::Ping(m) => self.process_ping(si, m),
            NetworkMessage::Pong => self.process_pong(si),
            NetworkMessage::StateTransfer(Some(_))
            | NetworkMessage::Identity(_)
            | NetworkMessage::SuggestRejoin
            | NetworkMessage::ClientResponse(_)
            | NetworkMessage::Garbage => {
                CORRUPT_MESSAGES.click();
                clue!(COLLECTOR, WARNING, {
                    dropping_message: si.get(),
                });
            }
        }
    }

    //////////////////////////////////// core Paxos protocol ///////////////////////////////////

    fn send_paxos_phase1a(&self, to: ServerId, ballot: Ballot) {
        self.shared
            .send(to, &NetworkMessage::Phase1A(Phase1A { ballot }));
    }

    fn process_paxos_phase1a(&mut self, si: ServerId, m: Phase1A) {
        if si == m.ballot.leader && m.ballot > self.acceptor.current_ballot() {
            self.acceptor.adopt(m.ballot);
            if m.ballot.leader != self.shared.us().id {
                self.scout = None;
                self.leader = None;
            }
            self.ft.proof_of_life(si);
            clue!(COLLECTOR, INFO, {
                taking_up: m.ballot.number,
                leader: m.ballot.leader.get(),
            });
            self.flush_enqueued_commands_with_stale_leader();
        }
        if si != m.ballot.leader {
            clue!(COLLECTOR, ERROR, {
                ballot_misuse: si.get(),
            });
        }
        self.send_paxos_phase1b(m.ballot.leader);
    }

    fn send_paxos_phase1b(&mut self, to: ServerId) {
        let msg = NetworkMessage::Phase1B(Phase1B {
            ballot: self.acceptor.current_ballot(),
            pvalues: self.acceptor.pvals().to_vec(),
        });
        self.send_when_acceptor_persistent(to, msg);
    }

    fn process_paxos_phase1b(&mut self, si: ServerId, m: Phase1B) {
        if self.shared.us().id != m.ballot.leader {
            return;
        }
        let promote = {
            let Some(scout) = self.scout.as_mut() else {
                return;
            };
            if scout.current_ballot() != m.ballot {
                return;
            }
            if scout.take_up(si, &m.pvalues) {
                clue!(COLLECTOR, INFO, {
                    taken_up_by: si.get(),
                    ballot: m.ballot.number,
                });
            }
            let missing = scout.missing();
            // Promote only when every hold-out is independently suspected; otherwise a transient
            // partition clearing would flip-flop leadership.
            let all_missing_suspected = missing
                .iter()
                .all(|&m| self.ft.suspect_failed(m, SUSPECT_TIMEOUT));
            all_missing_suspected && scout.adopted()
        };
        if promote {
            LEADERS_PROMOTED.click();
            let scout = self.scout.take().unwrap();
            clue!(COLLECTOR, INFO, {
                phase1_complete: scout.current_ballot().number,
            });
            let mut leader = Leader::new(&scout);
            let mut sends = Vec::new();
            if self.replica.fill_window() {
                sends.extend(leader.fill_window());
            }
            sends.extend(leader.all_proposals());
            self.leader = Some(leader);
            for (to, pval) in sends {
                self.send_paxos_phase2a(to, pval);
            }
        }
    }

    fn send_paxos_phase2a(&self, to: ServerId, pvalue: PValue) {
        self.shared
            .send(to, &NetworkMessage::Phase2A(Phase2A { pvalue }));
    }

    fn process_paxos_phase2a(&mut self, si: ServerId, m: Phase2A) {
        let p = m.pvalue;
        if p.slot < self.acceptor.lowest_acceptable_slot() {
            return;
        }
        if si == p.ballot.leader && p.ballot == self.acceptor.current_ballot() {
            self.acceptor.accept(p.clone());
        }
        if si != p.ballot.leader {
            clue!(COLLECTOR, ERROR, {
                ballot_misuse: si.get(),
            });
        }
        self.send_paxos_phase2b(p.ballot.leader, p);
    }

    fn send_paxos_phase2b(&mut self, to: ServerId, pvalue: PValue) {
        let msg = NetworkMessage::Phase2B(Phase2B {
            ballot: self.acceptor.current_ballot(),
            pvalue,
        });
        self.send_when_acceptor_persistent(to, msg);
    }

    fn process_paxos_phase2b(&mut self, si: ServerId, m: Phase2B) {
        let quorum = {
            let Some(leader) = self.leader.as_mut() else {
                return;
            };
            leader.current_ballot() == m.ballot
                && m.ballot == m.pvalue.ballot
                && leader.accept(si, &m.pvalue)
        };
        if quorum {
            LEARNED_BROADCAST.click();
            for server in self.config.servers.clone() {
                self.shared.send(
                    server.id,
                    &NetworkMessage::Learn(replicant_pb::Learn {
                        pvalue: m.pvalue.clone(),
                    }),
                );
            }
        }
    }

    fn process_paxos_learn(&mut self, si: ServerId, pvalue: PValue) {
        if si != pvalue.ballot.leader {
            clue!(COLLECTOR, ERROR, {
                ballot_misuse: si.get(),
            });
            return;
        }
        self.ft.proof_of_life(si);
        let effects = self.replica.learn(pvalue);
        self.apply_side_effects(effects);
        if self.replica.config().version > self.config.version {
            self.config = self.replica.config().clone();
            *self.config_mtx.lock().unwrap() = self.config.clone();
            self.scout = None;
            self.leader = None;
            if !self.post_config_change_hook() {
                return;
            }
        }
        let (start, limit) = self.replica.window();
        if let Some(scout) = self.scout.as_mut() {
            scout.set_window(start, limit);
        }
        let mut sends = Vec::new();
        if let Some(leader) = self.leader.as_mut() {
            if start >= leader.window_start() && limit >= leader.window_limit() {
                sends.extend(leader.set_window(start, limit));
            }
            if self.replica.fill_window() {
                sends.extend(leader.fill_window());
            }
        }
        for (to, pval) in sends {
            self.send_paxos_phase2a(to, pval);
        }
        if self.last_replica_snapshot < self.replica.last_snapshot_slot() {
            if let Some((slot, snapshot)) = self.replica.shared().latest_snapshot() {
                match self.acceptor.record_snapshot(slot, &snapshot) {
                    Ok(()) => {
                        clue!(COLLECTOR, INFO, {
                            snapshotting_at: slot,
                        });
                        self.last_replica_snapshot = slot;
                        let thresh = SetGcThresh {
                            server: self.shared.us().id,
                            threshold: slot,
                        };
                        self.enqueue_paxos_command(
                            ServerId::BOTTOM,
                            0,
                            SlotType::ServerSetGcThresh,
                            stack_pack(thresh).to_vec(),
                        );
                    }
                    Err(_) => {
                        clue!(COLLECTOR, ERROR, {
                            could_not_save_snapshot: slot,
                        });
                    }
                }
            }
        }
        if self.last_gc_slot < self.replica.gc_up_to() {
            self.last_gc_slot = self.replica.gc_up_to();
            self.acceptor.garbage_collect(self.last_gc_slot);
            if let Some(leader) = self.leader.as_mut() {
                leader.garbage_collect(self.last_gc_slot);
            }
        }
        self.bootstrap_stop.store(true, Ordering::Relaxed);
    }

    fn send_paxos_submit(&self, slot_start: u64, slot_limit: u64, command: Vec<u8>) {
        if self.acceptor.current_ballot() == Ballot::BOTTOM {
            return;
        }
        self.shared.send(
            self.acceptor.current_ballot().leader,
            &NetworkMessage::Submit(Submit {
                slot_start,
                slot_limit,
                command,
            }),
        );
    }

    fn process_paxos_submit(&mut self, m: Submit) {
        let sends = if let Some(leader) = self.leader.as_mut() {
            leader.propose(m.slot_start, m.slot_limit, m.command)
        } else if let Some(scout) = self.scout.as_mut() {
            scout.enqueue(m.slot_start, m.slot_limit, m.command);
            Vec::new()
        } else {
            if self.acceptor.current_ballot().leader != self.shared.us().id {
                self.send_paxos_submit(m.slot_start, m.slot_limit, m.command);
            }
            Vec::new()
        };
        for (to, pval) in sends {
            self.send_paxos_phase2a(to, pval);
        }
    }

    /////////////////////////////////// unordered commands /////////////////////////////////////

    fn enqueue_paxos_command(
        &mut self,
        on_behalf_of: ServerId,
        request_nonce: u64,
        slot_type: SlotType,
        payload: Vec<u8>,
    ) {
        let mut uc = UnorderedCommand::new(on_behalf_of, request_nonce, slot_type, payload);
        let assigned = {
            let mut unordered = self.shared.unordered.lock().unwrap();
            if unordered.in_flight() >= COMMANDS_TO_LEADER && slot_type == SlotType::Call {
                unordered.push_unassigned(uc);
                return;
            }
            drop(unordered);
            match self.generate_nonce() {
                Some(nonce) => {
                    uc.command_nonce = nonce;
                    self.shared.unordered.lock().unwrap().insert(uc);
                    Some(nonce)
                }
                None => {
                    self.shared.unordered.lock().unwrap().push_unassigned(uc);
                    None
                }
            }
        };
        if let Some(nonce) = assigned {
            self.send_unordered_command(nonce);
        }
    }

    fn enqueue_robust_paxos_command(
        &mut self,
        on_behalf_of: ServerId,
        request_nonce: u64,
        command_nonce: u64,
        min_slot: u64,
        payload: Vec<u8>,
    ) {
        let mut uc = UnorderedCommand::new(on_behalf_of, request_nonce, SlotType::Call, payload);
        uc.command_nonce = command_nonce;
        uc.lowest_possible_slot = min_slot;
        uc.robust = true;
        self.shared.unordered.lock().unwrap().insert(uc);
        self.send_unordered_command(command_nonce);
    }

    fn send_unordered_command(&mut self, command_nonce: u64) {
        let (start, limit, cmd) = {
            let window_start = self.replica.window().0;
            let ballot = match self.leader.as_ref() {
                Some(leader) => leader.current_ballot(),
                None => self.acceptor.current_ballot(),
            };
            let mut unordered = self.shared.unordered.lock().unwrap();
            let Some(uc) = unordered.get_mut(command_nonce) else {
                return;
            };
            if !uc.robust {
                uc.lowest_possible_slot = window_start;
            }
            uc.last_used_ballot = ballot;
            let start = uc.lowest_possible_slot;
            let limit = start + COMMAND_NONCE_HISTORY as u64;
            let flags = if uc.robust {
                replicant_pb::COMMAND_FLAG_ROBUST
            } else {
                0
            };
            let cmd = replicant_pb::Command::new(
                uc.slot_type,
                flags,
                uc.command_nonce,
                uc.command.clone(),
            )
            .pack();
            (start, limit, cmd)
        };
        let sends = if let Some(leader) = self.leader.as_mut() {
            leader.propose(start, limit, cmd)
        } else {
            if self.acceptor.current_ballot().leader != self.shared.us().id {
                self.send_paxos_submit(start, limit, cmd);
            }
            Vec::new()
        };
        for (to, pval) in sends {
            self.send_paxos_phase2a(to, pval);
        }
    }

    fn flush_enqueued_commands_with_stale_leader(&mut self) {
        let stale: Vec<u64> = {
            let mut unordered = self.shared.unordered.lock().unwrap();
            unordered
                .stale(self.acceptor.current_ballot())
                .iter()
                .map(|uc| uc.command_nonce)
                .collect()
        };
        for nonce in stale {
            self.send_unordered_command(nonce);
        }
    }

    fn convert_unassigned_to_unordered(&mut self) {
        loop {
            if self.unique_base == 0 || self.unique_offset >= NONCE_BATCH {
                return;
            }
            let uc = {
                let mut unordered = self.shared.unordered.lock().unwrap();
                unordered.pop_unassigned(COMMANDS_TO_LEADER)
            };
            let Some(mut uc) = uc else {
                return;
            };
            let Some(nonce) = self.generate_nonce() else {
                self.shared.unordered.lock().unwrap().push_unassigned(uc);
                return;
            };
            uc.command_nonce = nonce;
            self.shared.unordered.lock().unwrap().insert(uc);
            self.send_unordered_command(nonce);
        }
    }

    ///////////////////////////////////////// periodics ////////////////////////////////////////

    fn run_periodic(&mut self) {
        let now = Instant::now();
        for idx in 0..self.periodic.len() {
            if self.periodic[idx].next_run > now {
                continue;
            }
            let interval = self.periodic[idx].interval;
            self.periodic[idx].next_run = now + interval;
            match self.periodic[idx].task {
                Task::Maintain => self.periodic_maintain(),
                Task::PingServers => self.periodic_ping_servers(),
                Task::GenerateNonceSequence => self.periodic_generate_nonce_sequence(),
                Task::FlushEnqueuedCommands => self.periodic_flush_enqueued_commands(),
                Task::MaintainObjects => self.periodic_maintain_objects(),
                Task::Tick => self.periodic_tick(),
                Task::WarnScoutStuck => self.periodic_warn_scout_stuck(),
                Task::CheckAddress => self.periodic_check_address(),
            }
        }
    }

    fn periodic_maintain(&mut self) {
        if self.scout.is_some() {
            self.periodic_maintain_scout();
        } else if self.leader.is_some() {
            self.periodic_maintain_leader();
        } else {
            self.periodic_start_scout();
        }
    }

    fn periodic_maintain_scout(&mut self) {
        let Some(scout) = self.scout.as_ref() else {
            return;
        };
        let ballot = scout.current_ballot();
        for si in scout.missing() {
            self.send_paxos_phase1a(si, ballot);
        }
    }

    fn periodic_maintain_leader(&mut self) {
        let sends = match self.leader.as_ref() {
            Some(leader) => leader.all_proposals(),
            None => return,
        };
        for (to, pval) in sends {
            self.send_paxos_phase2a(to, pval);
        }
    }

    fn periodic_start_scout(&mut self) {
        // Exponential backoff by configuration index, so servers stagger their elections.
        if self.scout_wait_cycles == 0 {
            let index = self.config.index(self.shared.us().id).unwrap_or(0);
            self.scout_wait_cycles = 1u64 << std::cmp::min(index as u32, 32);
        } else if self.scout_wait_cycles == 1 {
            self.scout_wait_cycles = 0;
        } else {
            self.scout_wait_cycles -= 1;
            return;
        }
        let current = self.acceptor.current_ballot();
        let next_ballot = Ballot::new(current.number + 1, self.shared.us().id);
        if self.replica.discontinuous() {
            clue!(COLLECTOR, INFO, {
                starting_scout: next_ballot.number,
                because: "our ledger is discontinuous",
            });
        } else if current.leader == ServerId::BOTTOM {
            clue!(COLLECTOR, INFO, {
                starting_scout: next_ballot.number,
                because: "there is no ballot floating around",
            });
        } else if current.leader == self.shared.us().id {
            clue!(COLLECTOR, INFO, {
                starting_scout: next_ballot.number,
                because: "the adopted ballot comes from this server in a previous execution",
            });
        } else if self.ft.suspect_failed(current.leader, SUSPECT_TIMEOUT) {
            clue!(COLLECTOR, INFO, {
                starting_scout: next_ballot.number,
                because: "we suspect the current leader has failed",
            });
        } else {
            return;
        }
        SCOUTS_STARTED.click();
        let mut scout = Scout::new(next_ballot, &self.config.server_ids());
        let (start, limit) = self.replica.window();
        scout.set_window(start, limit);
        self.scout = Some(scout);
        self.periodic_maintain_scout();
    }

    fn periodic_warn_scout_stuck(&mut self) {
        let Some(scout) = self.scout.as_ref() else {
            return;
        };
        let missing = scout.missing();
        let all_missing_suspected = missing
            .iter()
            .all(|&m| self.ft.suspect_failed(m, SUSPECT_TIMEOUT));
        if !scout.adopted() && all_missing_suspected {
            let quorum = scout.acceptors().len() / 2 + 1;
            let not_missing = scout.acceptors().len() - missing.len();
            clue!(COLLECTOR, WARNING, {
                scout_stuck: scout.current_ballot().number,
                servers_needed: (quorum.saturating_sub(not_missing)),
                missing: missing.iter().map(|m| indicio::Value::from(m.get())).collect::<Vec<_>>(),
            });
        }
    }

    fn periodic_ping_servers(&mut self) {
        let ballot = self.acceptor.current_ballot();
        for server in self.config.servers.iter() {
            if server.id != self.shared.us().id {
                self.shared
                    .send(server.id, &NetworkMessage::Ping(Ping { ballot }));
            }
        }
    }

    fn periodic_generate_nonce_sequence(&mut self) {
        if self.unique_token > 0 && self.unique_base > 0 && self.unique_offset < NONCE_BATCH {
            return;
        }
        let Some(token) = generate_token() else {
            clue!(COLLECTOR, ERROR, {
                could_not_read_urandom: true,
            });
            return;
        };
        let inc = IncrementCounter {
            server: self.shared.us().id,
            token,
        };
        let cmd = replicant_pb::Command::new(
            SlotType::IncrementCounter,
            0,
            0,
            stack_pack(inc).to_vec(),
        )
        .pack();
        self.unique_token = token;
        if self.leader.is_some() {
            let (start, limit) = (0, u64::MAX);
            let sends = self.leader.as_mut().unwrap().propose(start, limit, cmd);
            for (to, pval) in sends {
                self.send_paxos_phase2a(to, pval);
            }
        } else {
            self.send_paxos_submit(0, u64::MAX, cmd);
        }
    }

    fn callback_nonce_sequence(&mut self, server: ServerId, token: u64, counter: u64) {
        if server != self.shared.us().id || token != self.unique_token {
            return;
        }
        self.unique_base = counter;
        self.unique_offset = 0;
        let deferred = std::mem::take(&mut self.msgs_waiting_for_nonces);
        for (si, msg) in deferred {
            self.dispatch(si, msg);
        }
        self.convert_unassigned_to_unordered();
    }

    fn generate_nonce(&mut self) -> Option<u64> {
        if self.unique_base > 0 && self.unique_offset < NONCE_BATCH {
            let nonce = self.unique_base + self.unique_offset;
            self.unique_offset += 1;
            if self.unique_offset + NONCE_REGENERATE_WHEN_FEWER_THAN == NONCE_BATCH {
                self.unique_token = 0;
                self.periodic_generate_nonce_sequence();
            }
            NONCES_GRANTED.click();
            Some(nonce)
        } else {
            None
        }
    }

    fn periodic_flush_enqueued_commands(&mut self) {
        self.convert_unassigned_to_unordered();
        let nonce = {
            let mut unordered = self.shared.unordered.lock().unwrap();
            unordered.any_in_flight().map(|uc| uc.command_nonce)
        };
        if let Some(nonce) = nonce {
            self.send_unordered_command(nonce);
        }
    }

    fn periodic_maintain_objects(&mut self) {
        self.replica.clean_dead_objects();
        let effects = self.replica.enqueue_failed_objects();
        self.apply_side_effects(effects);
    }

    fn periodic_tick(&mut self) {
        if self.leader.is_none() {
            return;
        }
        let tick = Tick {
            tick: self.replica.last_tick(),
        };
        self.enqueue_paxos_command(
            ServerId::BOTTOM,
            0,
            SlotType::Tick,
            stack_pack(tick).to_vec(),
        );
    }

    fn periodic_check_address(&mut self) {
        let Some(listed) = self.config.get(self.shared.us().id) else {
            return;
        };
        if listed.bind_to != self.shared.us().bind_to {
            // Surfacing the mismatch is deliberate; rewriting the configuration in place would
            // break the one-change-per-version rule.
            clue!(COLLECTOR, WARNING, {
                configured_address: listed.bind_to.as_str(),
                actual_address: self.shared.us().bind_to.as_str(),
            });
        }
    }

    ///////////////////////////////////// membership & misc ////////////////////////////////////

    fn send_bootstrap(&self, si: ServerId) {
        self.shared.send(
            si,
            &NetworkMessage::Bootstrap(BootstrapResponse {
                server: self.shared.us().clone(),
                config: self.config.clone(),
            }),
        );
    }

    fn process_state_transfer(&mut self, si: ServerId) {
        match self.replica.get_last_snapshot() {
            Some((slot, snapshot)) => {
                self.shared.send(
                    si,
                    &NetworkMessage::StateTransfer(Some(StateTransferred { slot, snapshot })),
                );
            }
            None => {
                self.shared.send(si, &NetworkMessage::Nop);
            }
        }
    }

    fn process_server_become_member(&mut self, si: ServerId, server: Server) {
        clue!(COLLECTOR, INFO, {
            become_member_request: server.id.get(),
        });
        if self.replica.any_config_has_id(server.id) || self.replica.any_config_has_address(&server.bind_to)
        {
            clue!(COLLECTOR, INFO, {
                become_member_ignored: server.id.get(),
            });
        } else {
            let become_msg = BecomeMember { server };
            let cmd = replicant_pb::Command::new(
                SlotType::ServerBecomeMember,
                0,
                0,
                stack_pack(become_msg).to_vec(),
            )
            .pack();
            self.send_paxos_submit(0, u64::MAX, cmd);
        }
        self.send_bootstrap(si);
    }

    fn process_unique_number(&mut self, si: ServerId, m: replicant_pb::UniqueNumber) {
        match self.generate_nonce() {
            Some(nonce) => {
                self.shared.send(
                    si,
                    &NetworkMessage::ClientResponse(ClientResponse {
                        client_nonce: m.client_nonce,
                        status: ReturnCode::Success.to_u32(),
                        payload: stack_pack(NonceGranted {
                            cluster_nonce: nonce,
                        })
                        .to_vec(),
                    }),
                );
            }
            None => {
                self.msgs_waiting_for_nonces
                    .push((si, NetworkMessage::UniqueNumber(m)));
            }
        }
    }

    fn process_poke(&mut self, si: ServerId, m: Poke) {
        let text = format!(
            "{} poked by {}/nonce({})",
            self.shared.us(),
            si,
            m.client_nonce
        );
        self.enqueue_paxos_command(si, m.client_nonce, SlotType::Poke, text.into_bytes());
    }

    fn process_get_robust_params(&mut self, si: ServerId, m: GetRobustParams) {
        match self.generate_nonce() {
            Some(nonce) => {
                let (start, _) = self.replica.window();
                self.shared.send(
                    si,
                    &NetworkMessage::ClientResponse(ClientResponse {
                        client_nonce: m.client_nonce,
                        status: ReturnCode::Success.to_u32(),
                        payload: stack_pack(RobustParams {
                            command_nonce: nonce,
                            min_slot: start,
                        })
                        .to_vec(),
                    }),
                );
            }
            None => {
                self.msgs_waiting_for_nonces
                    .push((si, NetworkMessage::GetRobustParams(m)));
            }
        }
    }

    fn process_call_robust(&mut self, si: ServerId, m: CallRobust) {
        if let Some((status, output)) = self.replica.has_output(m.command_nonce, m.min_slot) {
            self.shared
                .callback_client(si, m.client_nonce, status, output);
            return;
        }
        self.enqueue_robust_paxos_command(
            si,
            m.client_nonce,
            m.command_nonce,
            m.min_slot,
            stack_pack(m.call).to_vec(),
        );
    }

    fn process_ping(&mut self, si: ServerId, _: Ping) {
        self.shared.send(si, &NetworkMessage::Pong);
    }

    fn process_pong(&mut self, si: ServerId) {
        if si != self.acceptor.current_ballot().leader {
            self.ft.proof_of_life(si);
        }
    }

    fn post_config_change_hook(&mut self) -> bool {
        if !self.config.has_id(self.shared.us().id) {
            clue!(COLLECTOR, WARNING, {
                removed_from_configuration: self.shared.us().id.get(),
            });
            self.scout = None;
            self.leader = None;
            self.signals.interrupt();
            return false;
        }
        self.ft.assume_all_alive(&self.config.server_ids());
        self.shared.transport().set_servers(&self.config.servers);
        true
    }

    fn apply_side_effects(&mut self, effects: Vec<SideEffect>) {
        for effect in effects {
            match effect {
                SideEffect::Enqueue { slot_type, command } => {
                    self.enqueue_paxos_command(ServerId::BOTTOM, 0, slot_type, command);
                }
                SideEffect::NonceSequence {
                    server,
                    token,
                    counter,
                } => {
                    self.callback_nonce_sequence(server, token, counter);
                }
            }
        }
    }

    ///////////////////////////////////// deferred sending /////////////////////////////////////

    /// Hold a message until the acceptor state that justified it is on disk.  Phase-1b and
    /// phase-2b promises ride this path; releasing them early would let a crash retract them.
    fn send_when_acceptor_persistent(&mut self, si: ServerId, msg: NetworkMessage) {
        self.msgs_waiting_for_persistence
            .push_back((self.acceptor.write_cut(), si, msg));
    }

    fn flush_acceptor_messages(&mut self) {
        let cut = self.acceptor.sync_cut();
        while let Some((when, _, _)) = self.msgs_waiting_for_persistence.front() {
            if *when > cut {
                break;
            }
            DEFERRED_FLUSHED.click();
            let (_, si, msg) = self.msgs_waiting_for_persistence.pop_front().unwrap();
            self.shared.send(si, &msg);
        }
    }

    //////////////////////////////////////// debug dump ////////////////////////////////////////

    pub fn debug_dump(&mut self) {
        let (start, limit) = self.replica.window();
        let unordered = self.shared.unordered.lock().unwrap();
        clue!(COLLECTOR, ALWAYS, {
            debug_dump: {
                us: self.shared.us().id.get(),
                config: format!("{}", self.config),
                ballot: self.acceptor.current_ballot().number,
                ballot_leader: self.acceptor.current_ballot().leader.get(),
                lowest_acceptable_slot: self.acceptor.lowest_acceptable_slot(),
                scout: self.scout.as_ref().map(|s| format!("{}", s)).unwrap_or_else(|| "none".to_string()),
                leader: self.leader.as_ref().map(|l| format!("{}", l)).unwrap_or_else(|| "none".to_string()),
                next_slot: self.replica.next_slot(),
                window_start: start,
                window_limit: limit,
                gc_up_to: self.replica.gc_up_to(),
                discontinuous: self.replica.discontinuous(),
                unordered_in_flight: unordered.in_flight(),
                unordered_unassigned: unordered.unassigned(),
            },
        });
    }
}

////////////////////////////////////////////// Command /////////////////////////////////////////////

/// Builders for the commands the daemon itself originates.
struct Command;

impl Command {
    fn become_member(server: &Server) -> Vec<u8> {
        let become_msg = BecomeMember {
            server: server.clone(),
        };
        replicant_pb::Command::new(
            SlotType::ServerBecomeMember,
            0,
            0,
            stack_pack(become_msg).to_vec(),
        )
        .pack()
    }

    fn call(object: &str, func: &str, input: Vec<u8>) -> Vec<u8> {
        let call = replicant_pb::CallPayload {
            object: object.to_string(),
            func: func.to_string(),
            input,
        };
        replicant_pb::Command::new(SlotType::Call, 0, 0, stack_pack(call).to_vec()).pack()
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
