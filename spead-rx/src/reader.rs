//! Reader lifecycle contract.
//!
//! A reader is an asynchronous source that drives packets into a stream. Its
//! lifecycle is:
//! - construction and `start` (stream mutex held)
//! - `state_change` with the stream stopped (stream mutex held)
//! - `join` (stream mutex *not* held)
//! - destruction (stream mutex held)

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::oneshot;

/// Internal state machine of a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// An asynchronous receive is outstanding.
    Running,
    /// No receive outstanding; packets may be queued internally awaiting
    /// consumer readiness.
    Paused,
    /// No receive outstanding; the reader's completion has been fulfilled.
    Stopped,
}

/// Snapshot of the owning stream's state, taken under the stream mutex.
///
/// Passed to [`Reader::state_change`] because the callee cannot re-acquire
/// the mutex its caller already holds.
#[derive(Debug, Clone, Copy)]
pub struct StreamStatus {
    pub stopped: bool,
    pub paused: bool,
}

/// Asynchronous packet source feeding one stream.
#[async_trait]
pub trait Reader: Send {
    /// Second-phase initialisation. Called with the stream mutex held; any
    /// work that must not run under the mutex is made asynchronous and its
    /// completion returned. The stream awaits the receiver only after
    /// releasing the mutex.
    fn start(&mut self) -> Option<oneshot::Receiver<Result<()>>> {
        None
    }

    /// Notify the reader that the stream may have changed state, because it
    /// resumed from a pause or because it stopped. Called with the stream
    /// mutex held; must not block and must not take the mutex.
    fn state_change(&mut self, status: StreamStatus);

    /// Wait until the last completion handler has finished. Called exactly
    /// once, after a `state_change` with the stream stopped, and never with
    /// the stream mutex held.
    async fn join(&mut self);
}
