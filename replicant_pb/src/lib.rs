#![doc = include_str!("../README.md")]

use std::fmt::Debug;

use prototk_derive::Message;

use zerror::{iotoz, Z};
use zerror_core::ErrorCore;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The number of slots a leader may have in flight past the replica's next slot.
pub const SLOTS_WINDOW: u64 = 256;

/// How many nonces an IncrementCounter command makes available at once.
pub const NONCE_BATCH: u64 = 8192;

/// Ask for another nonce batch when fewer than this many remain.
pub const NONCE_REGENERATE_WHEN_FEWER_THAN: u64 = 1024;

/// How many command nonces and robust-call outcomes each replica retains.
pub const COMMAND_NONCE_HISTORY: usize = 2048;

/// The most client commands a server will keep in flight to the leader.
pub const COMMANDS_TO_LEADER: usize = 1024;

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// Error for the Replicant protocol types.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// The default error type.  Necessary to support protobuf, but should otherwise not be
    /// constructed.
    #[prototk(557056, message)]
    Success {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// An error was encountered while serializing or deserializing data.
    #[prototk(557057, message)]
    SerializationError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        err: prototk::Error,
        /// Additional context for what was happening.
        #[prototk(3, string)]
        context: String,
    },
    /// A message, command, or file was shorter or stranger than the format allows.
    #[prototk(557058, message)]
    Corruption {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
    },
    /// A string could not be parsed into the requested type.
    #[prototk(557059, message)]
    ParseFailure {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
    },
}

impl Error {
    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }

    pub fn parse_failure(what: impl Into<String>) -> Self {
        Self::ParseFailure {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }
}

impl Default for Error {
    fn default() -> Error {
        Error::Success {
            core: ErrorCore::default(),
        }
    }
}

impl From<buffertk::Error> for Error {
    fn from(err: buffertk::Error) -> Error {
        Error::SerializationError {
            core: ErrorCore::default(),
            err: err.into(),
            context: "buffertk unpack error".to_string(),
        }
    }
}

impl From<prototk::Error> for Error {
    fn from(err: prototk::Error) -> Error {
        Error::SerializationError {
            core: ErrorCore::default(),
            err,
            context: "prototk unpack error".to_string(),
        }
    }
}

iotoz! {Error}

//////////////////////////////////////////////// IDs ///////////////////////////////////////////////

/// Generate an opaque 64-bit identifier type.  Identifiers have equality, a total order, and a
/// human-readable form like `server(42)`; nothing else is knowable about them.
macro_rules! generate_id {
    ($what:ident, $prefix:literal) => {
        /// An opaque 64-bit identifier.
        #[derive(
            Clone, Copy, Debug, Default, Eq, Hash, Message, Ord, PartialEq, PartialOrd,
        )]
        pub struct $what {
            #[prototk(1, uint64)]
            id: u64,
        }

        impl $what {
            /// The smallest identifier.  Doubles as "none".
            pub const BOTTOM: $what = $what { id: 0 };

            /// Wrap the provided token.
            pub fn new(id: u64) -> Self {
                Self { id }
            }

            /// The raw token.
            pub fn get(&self) -> u64 {
                self.id
            }
        }

        impl std::fmt::Display for $what {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
                write!(f, concat!($prefix, "({})"), self.id)
            }
        }
    };
}

generate_id! {ServerId, "server"}
generate_id! {ClusterId, "cluster"}
generate_id! {VersionId, "version"}

impl VersionId {
    /// The next version in sequence.
    pub fn next(&self) -> VersionId {
        VersionId::new(self.get() + 1)
    }
}

////////////////////////////////////////////// Ballot //////////////////////////////////////////////

/// Ballots are neither created nor destroyed, they just exist.  A ballot is the ordered pair of
/// (number, leader), where only the listed leader is allowed to issue proposals under the ballot.
///
/// Ballots are comparable.  When `ballot1 < ballot2`, we say ballot2 supersedes ballot1.  The
/// comparison is lexicographic by (number, leader), which ensures that a proposer whose ballot is
/// superseded by a competing proposer can select another ballot to supersede either of the first
/// two.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Message, Ord, PartialEq, PartialOrd)]
pub struct Ballot {
    #[prototk(1, uint64)]
    pub number: u64,
    #[prototk(2, message)]
    pub leader: ServerId,
}

impl Ballot {
    /// The zero ballot.  Means "none".
    pub const BOTTOM: Ballot = Ballot {
        number: 0,
        leader: ServerId::BOTTOM,
    };

    pub fn new(number: u64, leader: ServerId) -> Self {
        Self { number, leader }
    }

    /// Append the fixed on-disk form:  number || leader, both u64 big-endian.
    pub fn pack_fixed(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.number.to_be_bytes());
        buf.extend_from_slice(&self.leader.get().to_be_bytes());
    }

    /// Parse the fixed on-disk form, returning the remainder.
    pub fn unpack_fixed(buf: &[u8]) -> Result<(Ballot, &[u8]), Error> {
        if buf.len() < 16 {
            return Err(Error::corruption("truncated ballot"));
        }
        let number = u64::from_be_bytes(buf[..8].try_into().unwrap());
        let leader = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        Ok((
            Ballot {
                number,
                leader: ServerId::new(leader),
            },
            &buf[16..],
        ))
    }
}

impl std::fmt::Display for Ballot {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "ballot({}, {})", self.number, self.leader)
    }
}

////////////////////////////////////////////// PValue //////////////////////////////////////////////

/// A Proposed Value, or PValue, is commonly referred to as a "decree" in the Paxos papers.
///
/// PValues are triples of (ballot, slot, command) and read as, "the proposer championing `ballot`
/// proposes putting `command` into `slot`".  Two pvalues with equal slot but different ballots are
/// in conflict; the higher ballot wins.  An empty command is a Nop.
#[derive(Clone, Debug, Default, Eq, Hash, Message, Ord, PartialEq, PartialOrd)]
pub struct PValue {
    #[prototk(2, message)]
    pub ballot: Ballot,
    #[prototk(1, uint64)]
    pub slot: u64,
    #[prototk(3, bytes)]
    pub command: Vec<u8>,
}

impl PValue {
    pub fn new(ballot: Ballot, slot: u64, command: Vec<u8>) -> Self {
        Self {
            ballot,
            slot,
            command,
        }
    }

    /// A zero-length command proposed to keep the slot sequence gapless.
    pub fn nop(ballot: Ballot, slot: u64) -> Self {
        Self::new(ballot, slot, Vec::new())
    }

    /// Append the fixed on-disk form:  ballot || slot (u64 BE) || len (u32 BE) || command.
    pub fn pack_fixed(&self, buf: &mut Vec<u8>) {
        self.ballot.pack_fixed(buf);
        buf.extend_from_slice(&self.slot.to_be_bytes());
        buf.extend_from_slice(&(self.command.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.command);
    }

    /// Parse the fixed on-disk form, returning the remainder.
    pub fn unpack_fixed(buf: &[u8]) -> Result<(PValue, &[u8]), Error> {
        let (ballot, buf) = Ballot::unpack_fixed(buf)?;
        if buf.len() < 12 {
            return Err(Error::corruption("truncated pvalue"));
        }
        let slot = u64::from_be_bytes(buf[..8].try_into().unwrap());
        let len = u32::from_be_bytes(buf[8..12].try_into().unwrap()) as usize;
        if buf.len() < 12 + len {
            return Err(Error::corruption("truncated pvalue command"));
        }
        let command = buf[12..12 + len].to_vec();
        Ok((
            PValue {
                ballot,
                slot,
                command,
            },
            &buf[12 + len..],
        ))
    }
}

impl std::fmt::Display for PValue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "pvalue({}, {}, {}B)",
            self.ballot,
            self.slot,
            self.command.len()
        )
    }
}

////////////////////////////////////////////// Server //////////////////////////////////////////////

/// A Server pairs a stable identifier with the address it binds to.  Both are unique within a
/// configuration.
#[derive(Clone, Debug, Default, Eq, Hash, Message, PartialEq)]
pub struct Server {
    #[prototk(1, message)]
    pub id: ServerId,
    #[prototk(2, string)]
    pub bind_to: String,
}

impl Server {
    pub fn new(id: ServerId, bind_to: impl Into<String>) -> Self {
        Self {
            id,
            bind_to: bind_to.into(),
        }
    }
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "server(id={}, bind_to={})", self.id.get(), self.bind_to)
    }
}

impl std::str::FromStr for Server {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_end();
        let inner = s
            .strip_prefix("server(id=")
            .and_then(|x| x.strip_suffix(')'))
            .ok_or_else(|| Error::parse_failure("server must look like server(id=N, bind_to=ADDR)"))?;
        let (id, bind_to) = inner
            .split_once(", bind_to=")
            .ok_or_else(|| Error::parse_failure("server must look like server(id=N, bind_to=ADDR)"))?;
        let id: u64 = id
            .parse()
            .map_err(|err| Error::parse_failure(format!("bad server id: {}", err)))?;
        if bind_to.is_empty() {
            return Err(Error::parse_failure("server bind_to must be non-empty"));
        }
        Ok(Server::new(ServerId::new(id), bind_to))
    }
}

/////////////////////////////////////////// Configuration //////////////////////////////////////////

/// The ordered set of servers participating in a given slot range.  A configuration takes effect
/// when the replica's next slot reaches `first_slot`.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Configuration {
    #[prototk(1, message)]
    pub cluster: ClusterId,
    #[prototk(2, message)]
    pub version: VersionId,
    #[prototk(3, uint64)]
    pub first_slot: u64,
    #[prototk(4, message)]
    pub servers: Vec<Server>,
}

impl Configuration {
    pub fn new(
        cluster: ClusterId,
        version: VersionId,
        first_slot: u64,
        servers: Vec<Server>,
    ) -> Self {
        Self {
            cluster,
            version,
            first_slot,
            servers,
        }
    }

    /// A successor configuration with one server added.
    pub fn grow(&self, server: Server, first_slot: u64) -> Self {
        assert!(self.first_slot < first_slot);
        assert!(!self.has_id(server.id));
        assert!(!self.has_address(&server.bind_to));
        let mut servers = self.servers.clone();
        servers.push(server);
        Self::new(self.cluster, self.version.next(), first_slot, servers)
    }

    /// A successor configuration with one server removed.
    pub fn shrink(&self, id: ServerId, first_slot: u64) -> Self {
        assert!(self.first_slot < first_slot);
        let servers: Vec<Server> = self.servers.iter().filter(|s| s.id != id).cloned().collect();
        assert!(!servers.is_empty());
        Self::new(self.cluster, self.version.next(), first_slot, servers)
    }

    /// True iff the servers are non-empty with no duplicate id or bind address.
    pub fn validate(&self) -> bool {
        for (i, si) in self.servers.iter().enumerate() {
            if si.id == ServerId::BOTTOM || si.bind_to.is_empty() {
                return false;
            }
            for sj in self.servers.iter().skip(i + 1) {
                if si.id == sj.id || si.bind_to == sj.bind_to {
                    return false;
                }
            }
        }
        !self.servers.is_empty()
    }

    pub fn has_id(&self, id: ServerId) -> bool {
        self.servers.iter().any(|s| s.id == id)
    }

    pub fn has_address(&self, bind_to: &str) -> bool {
        self.servers.iter().any(|s| s.bind_to == bind_to)
    }

    /// The position of the server within the configuration, used for election backoff.
    pub fn index(&self, id: ServerId) -> Option<usize> {
        self.servers.iter().position(|s| s.id == id)
    }

    pub fn get(&self, id: ServerId) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        self.servers.iter().map(|s| s.id).collect()
    }

    /// The bootstrap list naming every server in this configuration.
    pub fn bootstrap(&self) -> Bootstrap {
        Bootstrap {
            hosts: self.servers.iter().map(|s| s.bind_to.clone()).collect(),
        }
    }
}

impl std::fmt::Display for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "configuration({}, {}, first_slot={}, [",
            self.cluster, self.version, self.first_slot
        )?;
        for (i, s) in self.servers.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", s)?;
        }
        write!(f, "])")
    }
}

///////////////////////////////////////////// Bootstrap ////////////////////////////////////////////

/// The list of peer addresses used to discover the current configuration.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Bootstrap {
    #[prototk(1, string)]
    pub hosts: Vec<String>,
}

impl Bootstrap {
    /// Parse a comma-separated connection string like `host1:2001,host2:2001`.
    pub fn parse(conn_str: &str) -> Result<Bootstrap, Error> {
        let mut hosts = Vec::new();
        for host in conn_str.split(',') {
            let host = host.trim();
            if host.is_empty() {
                continue;
            }
            let Some((h, p)) = host.rsplit_once(':') else {
                return Err(Error::parse_failure(format!("missing port in {:?}", host)));
            };
            if h.is_empty() || p.parse::<u16>().is_err() {
                return Err(Error::parse_failure(format!("bad host:port {:?}", host)));
            }
            hosts.push(host.to_string());
        }
        if hosts.is_empty() {
            return Err(Error::parse_failure("bootstrap requires at least one host"));
        }
        Ok(Bootstrap { hosts })
    }

    pub fn valid(&self) -> bool {
        !self.hosts.is_empty()
    }

    /// The canonical comma-separated connection string.
    pub fn conn_str(&self) -> String {
        self.hosts.join(",")
    }
}

impl std::fmt::Display for Bootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.conn_str())
    }
}

//////////////////////////////////////////// ReturnCode ////////////////////////////////////////////

/// The status of a client-visible operation.  `Maybe` explicitly means "indeterminate outcome;
/// safe to retry only if idempotent".  Success with an empty payload is distinct from `Maybe`.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ReturnCode {
    #[default]
    Success,
    Maybe,
    SeeErrno,
    ClusterJump,
    CommFailed,
    ObjNotFound,
    ObjExist,
    FuncNotFound,
    CondNotFound,
    CondDestroyed,
    ServerError,
    Timeout,
    Interrupted,
    NonePending,
    Internal,
    Exception,
    Garbage,
}

impl ReturnCode {
    pub fn from_u32(x: u32) -> ReturnCode {
        match x {
            0 => ReturnCode::Success,
            1 => ReturnCode::Maybe,
            2 => ReturnCode::SeeErrno,
            3 => ReturnCode::ClusterJump,
            4 => ReturnCode::CommFailed,
            5 => ReturnCode::ObjNotFound,
            6 => ReturnCode::ObjExist,
            7 => ReturnCode::FuncNotFound,
            8 => ReturnCode::CondNotFound,
            9 => ReturnCode::CondDestroyed,
            10 => ReturnCode::ServerError,
            11 => ReturnCode::Timeout,
            12 => ReturnCode::Interrupted,
            13 => ReturnCode::NonePending,
            14 => ReturnCode::Internal,
            15 => ReturnCode::Exception,
            _ => ReturnCode::Garbage,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            ReturnCode::Success => 0,
            ReturnCode::Maybe => 1,
            ReturnCode::SeeErrno => 2,
            ReturnCode::ClusterJump => 3,
            ReturnCode::CommFailed => 4,
            ReturnCode::ObjNotFound => 5,
            ReturnCode::ObjExist => 6,
            ReturnCode::FuncNotFound => 7,
            ReturnCode::CondNotFound => 8,
            ReturnCode::CondDestroyed => 9,
            ReturnCode::ServerError => 10,
            ReturnCode::Timeout => 11,
            ReturnCode::Interrupted => 12,
            ReturnCode::NonePending => 13,
            ReturnCode::Internal => 14,
            ReturnCode::Exception => 15,
            ReturnCode::Garbage => 16,
        }
    }
}

impl std::fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{:?}", self)
    }
}

///////////////////////////////////////////// SlotType /////////////////////////////////////////////

/// The discriminant of a slot command.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum SlotType {
    #[default]
    Nop = 0,
    ServerBecomeMember = 1,
    ServerSetGcThresh = 2,
    IncrementCounter = 3,
    Poke = 4,
    Call = 5,
    Tick = 7,
    ObjectRepair = 8,
    ObjectFailed = 9,
}

impl SlotType {
    pub fn from_u8(x: u8) -> Option<SlotType> {
        match x {
            0 => Some(SlotType::Nop),
            1 => Some(SlotType::ServerBecomeMember),
            2 => Some(SlotType::ServerSetGcThresh),
            3 => Some(SlotType::IncrementCounter),
            4 => Some(SlotType::Poke),
            5 => Some(SlotType::Call),
            7 => Some(SlotType::Tick),
            8 => Some(SlotType::ObjectRepair),
            9 => Some(SlotType::ObjectFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SlotType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{:?}", self)
    }
}

////////////////////////////////////////////// Command /////////////////////////////////////////////

/// The robust flag.  Robust calls are deduplicated and replayed from history.
pub const COMMAND_FLAG_ROBUST: u8 = 1;

/// A slot command:  `type: u8 | flags: u8 | nonce: u64 BE | payload`.  The payload is a prototk
/// message whose schema depends on the type.  An empty byte string is a Nop.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Command {
    pub slot_type: SlotType,
    pub flags: u8,
    pub nonce: u64,
    pub payload: Vec<u8>,
}

impl Command {
    pub fn new(slot_type: SlotType, flags: u8, nonce: u64, payload: Vec<u8>) -> Self {
        Self {
            slot_type,
            flags,
            nonce,
            payload,
        }
    }

    pub fn is_robust(&self) -> bool {
        self.flags & COMMAND_FLAG_ROBUST != 0
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10 + self.payload.len());
        buf.push(self.slot_type as u8);
        buf.push(self.flags);
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn unpack(buf: &[u8]) -> Result<Command, Error> {
        if buf.is_empty() {
            return Ok(Command::default());
        }
        if buf.len() < 10 {
            return Err(Error::corruption("truncated command"));
        }
        let slot_type = SlotType::from_u8(buf[0])
            .ok_or_else(|| Error::corruption(format!("unknown slot type {}", buf[0])))?;
        let flags = buf[1];
        let nonce = u64::from_be_bytes(buf[2..10].try_into().unwrap());
        Ok(Command {
            slot_type,
            flags,
            nonce,
            payload: buf[10..].to_vec(),
        })
    }
}

////////////////////////////////////////// Slot payloads ///////////////////////////////////////////

/// Payload of ServerBecomeMember:  the server asking to join.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct BecomeMember {
    #[prototk(1, message)]
    pub server: Server,
}

/// Payload of ServerSetGcThresh:  raise one server's acknowledged-safe-to-gc slot.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct SetGcThresh {
    #[prototk(1, message)]
    pub server: ServerId,
    #[prototk(2, uint64)]
    pub threshold: u64,
}

/// Payload of IncrementCounter:  advance the nonce counter on behalf of `server`.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct IncrementCounter {
    #[prototk(1, message)]
    pub server: ServerId,
    #[prototk(2, uint64)]
    pub token: u64,
}

/// Payload of ObjectFailed:  `server` observed `object` crash at `when`.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct ObjectFailed {
    #[prototk(1, message)]
    pub server: ServerId,
    #[prototk(2, string)]
    pub object: String,
    #[prototk(3, uint64)]
    pub when: u64,
}

/// Payload of ObjectRepair:  restore `object` from the donor's snapshot.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct ObjectRepair {
    #[prototk(1, string)]
    pub object: String,
    #[prototk(2, uint64)]
    pub when: u64,
    #[prototk(3, message)]
    pub donor: ServerId,
    #[prototk(4, uint64)]
    pub donor_slot: u64,
    #[prototk(5, bytes)]
    pub state: Vec<u8>,
}

/// Payload of Tick.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Tick {
    #[prototk(1, uint64)]
    pub tick: u64,
}

/// Payload of Call, and the body of the Call/CallRobust client requests.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct CallPayload {
    #[prototk(1, string)]
    pub object: String,
    #[prototk(2, string)]
    pub func: String,
    #[prototk(3, bytes)]
    pub input: Vec<u8>,
}

/// Input of the `replicant.restore_object` special function.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct RestoreObjectInput {
    #[prototk(1, string)]
    pub name: String,
    #[prototk(2, bytes)]
    pub state: Vec<u8>,
}

/////////////////////////////////////////// Wire payloads //////////////////////////////////////////

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct BootstrapResponse {
    #[prototk(1, message)]
    pub server: Server,
    #[prototk(2, message)]
    pub config: Configuration,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Ping {
    #[prototk(1, message)]
    pub ballot: Ballot,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct StateTransferred {
    #[prototk(1, uint64)]
    pub slot: u64,
    #[prototk(2, bytes)]
    pub snapshot: Vec<u8>,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Identity {
    #[prototk(1, message)]
    pub server: Server,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Phase1A {
    #[prototk(1, message)]
    pub ballot: Ballot,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Phase1B {
    #[prototk(1, message)]
    pub ballot: Ballot,
    #[prototk(2, message)]
    pub pvalues: Vec<PValue>,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Phase2A {
    #[prototk(1, message)]
    pub pvalue: PValue,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Phase2B {
    #[prototk(1, message)]
    pub ballot: Ballot,
    #[prototk(2, message)]
    pub pvalue: PValue,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Learn {
    #[prototk(1, message)]
    pub pvalue: PValue,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Submit {
    #[prototk(1, uint64)]
    pub slot_start: u64,
    #[prototk(2, uint64)]
    pub slot_limit: u64,
    #[prototk(3, bytes)]
    pub command: Vec<u8>,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct UniqueNumber {
    #[prototk(1, uint64)]
    pub client_nonce: u64,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Poke {
    #[prototk(1, uint64)]
    pub client_nonce: u64,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct CondWait {
    #[prototk(1, uint64)]
    pub client_nonce: u64,
    #[prototk(2, string)]
    pub object: String,
    #[prototk(3, string)]
    pub cond: String,
    #[prototk(4, uint64)]
    pub state: u64,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Call {
    #[prototk(1, uint64)]
    pub client_nonce: u64,
    #[prototk(2, message)]
    pub call: CallPayload,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct GetRobustParams {
    #[prototk(1, uint64)]
    pub client_nonce: u64,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct CallRobust {
    #[prototk(1, uint64)]
    pub client_nonce: u64,
    #[prototk(2, uint64)]
    pub command_nonce: u64,
    #[prototk(3, uint64)]
    pub min_slot: u64,
    #[prototk(4, message)]
    pub call: CallPayload,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct ClientResponse {
    #[prototk(1, uint64)]
    pub client_nonce: u64,
    #[prototk(2, uint32)]
    pub status: u32,
    #[prototk(3, bytes)]
    pub payload: Vec<u8>,
}

/// Payload of a ClientResponse to UniqueNumber.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct NonceGranted {
    #[prototk(1, uint64)]
    pub cluster_nonce: u64,
}

/// Payload of a ClientResponse to GetRobustParams.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct RobustParams {
    #[prototk(1, uint64)]
    pub command_nonce: u64,
    #[prototk(2, uint64)]
    pub min_slot: u64,
}

/// Payload of a ClientResponse to CondWait.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct CondValue {
    #[prototk(1, uint64)]
    pub state: u64,
    #[prototk(2, bytes)]
    pub data: Vec<u8>,
}

/////////////////////////////////////////// NetworkMessage /////////////////////////////////////////

/// Every message on the wire is a 1-byte type followed by a type-specific payload.  The numbers
/// are part of the protocol and never reused.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NetworkMessage {
    Nop,
    Identity(Identity),
    WhoAreYou,
    SuggestRejoin,
    SilentBootstrap(BootstrapResponse),
    Bootstrap(BootstrapResponse),
    Ping(Ping),
    Pong,
    /// An empty StateTransfer is the request; a populated one is the reply.
    StateTransfer(Option<StateTransferred>),
    Phase1A(Phase1A),
    Phase1B(Phase1B),
    Phase2A(Phase2A),
    Phase2B(Phase2B),
    Learn(Learn),
    Submit(Submit),
    BecomeMember(Identity),
    ObjectFailed,
    UniqueNumber(UniqueNumber),
    Poke(Poke),
    CondWait(CondWait),
    Call(Call),
    GetRobustParams(GetRobustParams),
    CallRobust(CallRobust),
    ClientResponse(ClientResponse),
    Garbage,
}

impl NetworkMessage {
    pub fn message_type(&self) -> u8 {
        match self {
            NetworkMessage::Nop => 0,
            NetworkMessage::Identity(_) => 24,
            NetworkMessage::WhoAreYou => 25,
            NetworkMessage::SuggestRejoin => 26,
            NetworkMessage::SilentBootstrap(_) => 27,
            NetworkMessage::Bootstrap(_) => 28,
            NetworkMessage::Ping(_) => 29,
            NetworkMessage::Pong => 30,
            NetworkMessage::StateTransfer(_) => 31,
            NetworkMessage::Phase1A(_) => 32,
            NetworkMessage::Phase1B(_) => 33,
            NetworkMessage::Phase2A(_) => 34,
            NetworkMessage::Phase2B(_) => 35,
            NetworkMessage::Learn(_) => 36,
            NetworkMessage::Submit(_) => 37,
            NetworkMessage::BecomeMember(_) => 48,
            NetworkMessage::ObjectFailed => 62,
            NetworkMessage::UniqueNumber(_) => 63,
            NetworkMessage::Poke(_) => 64,
            NetworkMessage::CondWait(_) => 69,
            NetworkMessage::Call(_) => 70,
            NetworkMessage::GetRobustParams(_) => 72,
            NetworkMessage::CallRobust(_) => 73,
            NetworkMessage::ClientResponse(_) => 224,
            NetworkMessage::Garbage => 255,
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        fn packed<M: buffertk::Packable>(t: u8, m: &M) -> Vec<u8> {
            let mut buf = vec![t];
            buffertk::stack_pack(m).append_to_vec(&mut buf);
            buf
        }
        match self {
            NetworkMessage::Nop => vec![0],
            NetworkMessage::Identity(m) => packed(24, m),
            NetworkMessage::WhoAreYou => vec![25],
            NetworkMessage::SuggestRejoin => vec![26],
            NetworkMessage::SilentBootstrap(m) => packed(27, m),
            NetworkMessage::Bootstrap(m) => packed(28, m),
            NetworkMessage::Ping(m) => packed(29, m),
            NetworkMessage::Pong => vec![30],
            NetworkMessage::StateTransfer(None) => vec![31],
            NetworkMessage::StateTransfer(Some(m)) => packed(31, m),
            NetworkMessage::Phase1A(m) => packed(32, m),
            NetworkMessage::Phase1B(m) => packed(33, m),
            NetworkMessage::Phase2A(m) => packed(34, m),
            NetworkMessage::Phase2B(m) => packed(35, m),
            NetworkMessage::Learn(m) => packed(36, m),
            NetworkMessage::Submit(m) => packed(37, m),
            NetworkMessage::BecomeMember(m) => packed(48, m),
            NetworkMessage::ObjectFailed => vec![62],
            NetworkMessage::UniqueNumber(m) => packed(63, m),
            NetworkMessage::Poke(m) => packed(64, m),
            NetworkMessage::CondWait(m) => packed(69, m),
            NetworkMessage::Call(m) => packed(70, m),
            NetworkMessage::GetRobustParams(m) => packed(72, m),
            NetworkMessage::CallRobust(m) => packed(73, m),
            NetworkMessage::ClientResponse(m) => packed(224, m),
            NetworkMessage::Garbage => vec![255],
        }
    }

    pub fn unpack(buf: &[u8]) -> Result<NetworkMessage, Error> {
        fn unpacked<'a, M: buffertk::Unpackable<'a>>(buf: &'a [u8]) -> Result<M, Error>
        where
            Error: From<M::Error>,
        {
            Ok(M::unpack(buf)?.0)
        }
        let Some((&t, buf)) = buf.split_first() else {
            return Err(Error::corruption("empty message"));
        };
        match t {
            0 => Ok(NetworkMessage::Nop),
            24 => Ok(NetworkMessage::Identity(unpacked(buf)?)),
            25 => Ok(NetworkMessage::WhoAreYou),
            26 => Ok(NetworkMessage::SuggestRejoin),
            27 => Ok(NetworkMessage::SilentBootstrap(unpacked(buf)?)),
            28 => Ok(NetworkMessage::Bootstrap(unpacked(buf)?)),
            29 => Ok(NetworkMessage::Ping(unpacked(buf)?)),
            30 => Ok(NetworkMessage::Pong),
            31 => {
                if buf.is_empty() {
                    Ok(NetworkMessage::StateTransfer(None))
                } else {
                    Ok(NetworkMessage::StateTransfer(Some(unpacked(buf)?)))
                }
            }
            32 => Ok(NetworkMessage::Phase1A(unpacked(buf)?)),
            33 => Ok(NetworkMessage::Phase1B(unpacked(buf)?)),
            34 => Ok(NetworkMessage::Phase2A(unpacked(buf)?)),
            35 => Ok(NetworkMessage::Phase2B(unpacked(buf)?)),
            36 => Ok(NetworkMessage::Learn(unpacked(buf)?)),
            37 => Ok(NetworkMessage::Submit(unpacked(buf)?)),
            48 => Ok(NetworkMessage::BecomeMember(unpacked(buf)?)),
            62 => Ok(NetworkMessage::ObjectFailed),
            63 => Ok(NetworkMessage::UniqueNumber(unpacked(buf)?)),
            64 => Ok(NetworkMessage::Poke(unpacked(buf)?)),
            69 => Ok(NetworkMessage::CondWait(unpacked(buf)?)),
            70 => Ok(NetworkMessage::Call(unpacked(buf)?)),
            72 => Ok(NetworkMessage::GetRobustParams(unpacked(buf)?)),
            73 => Ok(NetworkMessage::CallRobust(unpacked(buf)?)),
            224 => Ok(NetworkMessage::ClientResponse(unpacked(buf)?)),
            255 => Ok(NetworkMessage::Garbage),
            _ => Err(Error::corruption(format!("unknown message type {}", t))),
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use buffertk::{stack_pack, Unpackable};

    use super::*;

    #[test]
    fn ballot_ordering() {
        let b1 = Ballot::new(1, ServerId::new(5));
        let b2 = Ballot::new(1, ServerId::new(6));
        let b3 = Ballot::new(2, ServerId::new(1));
        assert!(Ballot::BOTTOM < b1);
        assert!(b1 < b2);
        assert!(b2 < b3);
    }

    #[test]
    fn ballot_fixed_round_trip() {
        let b = Ballot::new(7, ServerId::new(0xdeadbeef));
        let mut buf = Vec::new();
        b.pack_fixed(&mut buf);
        assert_eq!(16, buf.len());
        let (got, rem) = Ballot::unpack_fixed(&buf).unwrap();
        assert_eq!(b, got);
        assert!(rem.is_empty());
    }

    #[test]
    fn pvalue_fixed_round_trip() {
        let p = PValue::new(Ballot::new(3, ServerId::new(9)), 42, b"hello".to_vec());
        let mut buf = Vec::new();
        p.pack_fixed(&mut buf);
        let (got, rem) = PValue::unpack_fixed(&buf).unwrap();
        assert_eq!(p, got);
        assert!(rem.is_empty());
        assert!(PValue::unpack_fixed(&buf[..buf.len() - 1]).is_err());
    }

    #[test]
    fn server_display_parse() {
        let s = Server::new(ServerId::new(42), "127.0.0.1:1982");
        let text = format!("{}", s);
        assert_eq!("server(id=42, bind_to=127.0.0.1:1982)", text);
        let parsed: Server = text.parse().unwrap();
        assert_eq!(s, parsed);
        assert!("server(id=x, bind_to=y)".parse::<Server>().is_err());
        assert!("server(42)".parse::<Server>().is_err());
    }

    #[test]
    fn configuration_validate() {
        let s1 = Server::new(ServerId::new(1), "h1:1982");
        let s2 = Server::new(ServerId::new(2), "h2:1982");
        let c = Configuration::new(ClusterId::new(7), VersionId::new(1), 0, vec![s1.clone(), s2]);
        assert!(c.validate());
        let dup_id = Configuration::new(
            ClusterId::new(7),
            VersionId::new(1),
            0,
            vec![s1.clone(), Server::new(ServerId::new(1), "h3:1982")],
        );
        assert!(!dup_id.validate());
        let dup_addr = Configuration::new(
            ClusterId::new(7),
            VersionId::new(1),
            0,
            vec![s1, Server::new(ServerId::new(3), "h1:1982")],
        );
        assert!(!dup_addr.validate());
        let empty = Configuration::new(ClusterId::new(7), VersionId::new(1), 0, vec![]);
        assert!(!empty.validate());
    }

    #[test]
    fn configuration_grow_shrink() {
        let s1 = Server::new(ServerId::new(1), "h1:1982");
        let c = Configuration::new(ClusterId::new(7), VersionId::new(1), 0, vec![s1]);
        let c2 = c.grow(Server::new(ServerId::new(2), "h2:1982"), 300);
        assert_eq!(VersionId::new(2), c2.version);
        assert_eq!(300, c2.first_slot);
        assert_eq!(2, c2.servers.len());
        let c3 = c2.shrink(ServerId::new(1), 600);
        assert_eq!(VersionId::new(3), c3.version);
        assert_eq!(vec![ServerId::new(2)], c3.server_ids());
    }

    #[test]
    fn bootstrap_parse() {
        let bs = Bootstrap::parse("h1:1982, h2:1983").unwrap();
        assert_eq!(vec!["h1:1982".to_string(), "h2:1983".to_string()], bs.hosts);
        assert_eq!("h1:1982,h2:1983", bs.conn_str());
        assert!(Bootstrap::parse("").is_err());
        assert!(Bootstrap::parse("h1").is_err());
        assert!(Bootstrap::parse("h1:notaport").is_err());
    }

    #[test]
    fn command_round_trip() {
        let payload = stack_pack(Tick { tick: 9 }).to_vec();
        let cmd = Command::new(SlotType::Tick, 0, 77, payload);
        let buf = cmd.pack();
        assert_eq!(SlotType::Tick as u8, buf[0]);
        let got = Command::unpack(&buf).unwrap();
        assert_eq!(cmd, got);
    }

    #[test]
    fn empty_command_is_nop() {
        let cmd = Command::unpack(&[]).unwrap();
        assert_eq!(SlotType::Nop, cmd.slot_type);
        assert_eq!(0, cmd.nonce);
    }

    #[test]
    fn robust_flag() {
        let cmd = Command::new(SlotType::Call, COMMAND_FLAG_ROBUST, 1, vec![]);
        assert!(cmd.is_robust());
        let cmd = Command::new(SlotType::Call, 0, 1, vec![]);
        assert!(!cmd.is_robust());
    }

    #[test]
    fn network_message_round_trip() {
        let msgs = vec![
            NetworkMessage::Nop,
            NetworkMessage::WhoAreYou,
            NetworkMessage::Pong,
            NetworkMessage::StateTransfer(None),
            NetworkMessage::StateTransfer(Some(StateTransferred {
                slot: 4,
                snapshot: b"snap".to_vec(),
            })),
            NetworkMessage::Phase1A(Phase1A {
                ballot: Ballot::new(2, ServerId::new(8)),
            }),
            NetworkMessage::Phase1B(Phase1B {
                ballot: Ballot::new(2, ServerId::new(8)),
                pvalues: vec![PValue::new(Ballot::new(1, ServerId::new(3)), 0, b"x".to_vec())],
            }),
            NetworkMessage::Submit(Submit {
                slot_start: 1,
                slot_limit: 10,
                command: b"cmd".to_vec(),
            }),
            NetworkMessage::ClientResponse(ClientResponse {
                client_nonce: 11,
                status: ReturnCode::Maybe.to_u32(),
                payload: vec![],
            }),
            NetworkMessage::Garbage,
        ];
        for msg in msgs {
            let buf = msg.pack();
            assert_eq!(buf[0], msg.message_type());
            let got = NetworkMessage::unpack(&buf).unwrap();
            assert_eq!(msg, got);
        }
    }

    #[test]
    fn return_code_round_trip() {
        for x in 0..=16u32 {
            let rc = ReturnCode::from_u32(x);
            assert_eq!(x, rc.to_u32());
        }
        assert_eq!(ReturnCode::Garbage, ReturnCode::from_u32(200));
    }

    #[test]
    fn call_payload_prototk() {
        let call = CallPayload {
            object: "echo".to_string(),
            func: "echo".to_string(),
            input: b"hello\0".to_vec(),
        };
        let buf = stack_pack(&call).to_vec();
        let got = CallPayload::unpack(&buf).unwrap().0;
        assert_eq!(call, got);
    }
}
