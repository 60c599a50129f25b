//! Error types for the receive pipeline.
//!
//! Hot-path failures (truncated datagrams, undecodable packets) are logged
//! and swallowed so one bad datagram cannot tear the pipeline down; only
//! configuration, registration and consumer-side conditions surface here.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration or registration parameters.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No bypass technology with this name has been registered.
    #[error("bypass technology `{0}` is not registered")]
    UnknownTechnology(String),

    /// The ring has been stopped and holds no more heaps.
    #[error("ring stopped")]
    RingStopped,

    /// `try_pop` found the ring empty while the stream is still running.
    #[error("ring empty")]
    RingEmpty,

    /// An asynchronous registration was abandoned before it completed,
    /// typically because the service worker shut down.
    #[error("operation cancelled")]
    Cancelled,

    /// Socket or NIC system call failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
