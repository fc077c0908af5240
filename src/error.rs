use std::io;
use std::net::SocketAddr;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the framework's setup and control surface.
///
/// Suspension points never return `Err` for flow events: would-block is
/// retried on the next readiness tick, peer close is observable as a
/// zero-length read, and a timed-out read carries a flag next to its value.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind listener on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("event loop thread terminated before reporting ready")]
    LoopStartup,

    #[error("server already started")]
    AlreadyStarted,
}
