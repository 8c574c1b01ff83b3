// File: error.rs
//
// The purpose of this file is to define the error kinds the ring can
// produce and their mapping to the fault codes carried on the wire.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while operating the ring.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A ring-facing operation was attempted before the node finished
    /// joining (or bootstrapping as the sole member).
    #[error("node is still starting up")]
    NotReady,

    /// The local node is not the owner of the hashed key; the caller is
    /// routing on stale information and should re-route.
    #[error("{0}")]
    NotResponsible(String),

    /// The key is absent from the owner's data map.
    #[error("no such key: {0}")]
    NotFound(String),

    /// A structural invariant is violated: a duplicate id during a ring
    /// walk, or a backup arriving from a node that is not the actual
    /// predecessor.
    #[error("ring broken: {0}")]
    RingBroken(String),

    /// RPC timeout or socket failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The join target refused: duplicate id, wrong arc, or a malformed
    /// setup payload.
    #[error("join rejected: {0}")]
    JoinRejected(String),

    /// The client's peer pool is empty.
    #[error("no reachable peers")]
    NoPeers,

    /// Startup-time configuration problem.
    #[error("bad configuration: {0}")]
    Config(String),
}

impl Error {
    /// Fault code used when this error crosses the wire.
    pub fn fault_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::RingBroken(_) => 409,
            Error::NotResponsible(_) => 421,
            Error::JoinRejected(_) => 400,
            Error::NotReady => 503,
            _ => 500,
        }
    }

    /// Rebuilds an error from a wire fault.
    ///
    /// # Arguments
    ///
    /// * `code` - the fault code carried in the reply
    /// * `message` - the fault text carried in the reply
    pub fn from_fault(code: u16, message: String) -> Error {
        match code {
            404 => Error::NotFound(message),
            409 => Error::RingBroken(message),
            421 => Error::NotResponsible(message),
            400 => Error::JoinRejected(message),
            503 => Error::NotReady,
            _ => Error::Transport(format!("remote fault {}: {}", code, message)),
        }
    }

    /// True for the kinds the service adapter retries once around a
    /// repair cycle.
    pub fn is_routing_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::RingBroken(_))
    }
}

impl From<zmq::Error> for Error {
    fn from(e: zmq::Error) -> Error {
        Error::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Transport(format!("message encoding: {}", e))
    }
}
