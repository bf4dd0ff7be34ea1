#![doc = include_str!("../README.md")]

use std::fs::File;
use std::io::Read;

use biometrics::Collector;

use prototk_derive::Message;

use zerror::{iotoz, Z};
use zerror_core::ErrorCore;

pub mod acceptor;
pub mod condition;
pub mod daemon;
pub mod failure_tracker;
pub mod leader;
pub mod object;
pub mod replica;
pub mod scout;
pub mod snapshot;
pub mod transport;
pub mod unordered;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// How long a silent peer must stay silent before the failure tracker suspects it.
pub const SUSPECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Take a snapshot every this-many slots.
pub const SNAPSHOT_INTERVAL_SLOTS: u64 = 250;

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

pub fn register_biometrics(collector: &Collector) {
    acceptor::register_biometrics(collector);
    daemon::register_biometrics(collector);
    object::register_biometrics(collector);
    replica::register_biometrics(collector);
    transport::register_biometrics(collector);
}

pub fn register_monitors(hey_listen: &mut tatl::HeyListen) {
    acceptor::register_monitors(hey_listen);
    daemon::register_monitors(hey_listen);
}

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// Error for the Replicant daemon.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// The default error type.  Necessary to support protobuf, but should otherwise not be
    /// constructed.
    #[prototk(557088, message)]
    Success {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// An OS-level error.
    #[prototk(557089, message)]
    SystemError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The string representation of the error.
        #[prototk(2, string)]
        what: String,
    },
    /// Durable or in-flight state did not parse.
    #[prototk(557090, message)]
    Corruption {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
    },
    /// An error was encountered while serializing or deserializing data.
    #[prototk(557091, message)]
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
    /// A protocol-type error bubbled out of replicant_pb.
    #[prototk(557092, message)]
    ProtocolError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The underlying error.
        #[prototk(2, message)]
        err: replicant_pb::Error,
    },
    /// The data directory is locked by another process.
    #[prototk(557093, message)]
    LockNotObtained {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The path to the lock.
        #[prototk(2, string)]
        path: String,
    },
    /// Delivery to a peer failed; the peer will be rediscovered.
    #[prototk(557094, message)]
    Disrupted {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
    },
    /// The acceptor has failed permanently and the server must exit.
    #[prototk(557095, message)]
    AcceptorFailed {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// A logic error in the daemon.
    #[prototk(557096, message)]
    LogicError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
    },
}

impl Error {
    pub fn system(what: impl Into<String>) -> Self {
        Self::SystemError {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }

    pub fn disrupted(what: impl Into<String>) -> Self {
        Self::Disrupted {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }

    pub fn logic(what: impl Into<String>) -> Self {
        Self::LogicError {
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

impl From<std::io::Error> for Error {
    fn from(what: std::io::Error) -> Error {
        Error::SystemError {
            core: ErrorCore::default(),
            what: what.to_string(),
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

impl From<buffertk::Error> for Error {
    fn from(err: buffertk::Error) -> Error {
        Error::SerializationError {
            core: ErrorCore::default(),
            err: err.into(),
            context: "buffertk unpack error".to_string(),
        }
    }
}

impl From<replicant_pb::Error> for Error {
    fn from(err: replicant_pb::Error) -> Error {
        Error::ProtocolError {
            core: ErrorCore::default(),
            err,
        }
    }
}

iotoz! {Error}

/////////////////////////////////////////// generate_token /////////////////////////////////////////

/// Read a fresh non-zero 64-bit token from /dev/urandom.
pub fn generate_token() -> Option<u64> {
    let mut f = File::open("/dev/urandom").ok()?;
    let mut buf = [0u8; 8];
    loop {
        let mut amt = 0;
        while amt < buf.len() {
            let x = f.read(&mut buf[amt..]).ok()?;
            if x == 0 {
                return None;
            }
            amt += x;
        }
        let token = u64::from_be_bytes(buf);
        if token != 0 {
            return Some(token);
        }
    }
}

////////////////////////////////////////////// testutil ////////////////////////////////////////////

#[cfg(test)]
pub(crate) fn test_root(module: &str, line: u32) -> std::path::PathBuf {
    use std::path::PathBuf;
    let root: String = module
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let path = PathBuf::from(format!("replicant_test_{}_{}", root, line));
    if path.exists() {
        std::fs::remove_dir_all(&path).expect("could not prepare for test");
    }
    path
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
