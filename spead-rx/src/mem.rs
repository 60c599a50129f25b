//! Memory reader: drains a buffer of concatenated packets into a stream.
//!
//! Useful for replaying captures and for tests. When the buffer is
//! exhausted (or an undecodable region is reached) the reader signals end
//! of stream.

use crate::reader::{Reader, StreamStatus};
use crate::stream::{mem_to_stream, StreamCore};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

pub struct MemReader {
    wake: Arc<Notify>,
    pending: Option<Pending>,
    task: Option<tokio::task::JoinHandle<()>>,
}

struct Pending {
    core: Arc<Mutex<StreamCore>>,
    handle: tokio::runtime::Handle,
    data: Bytes,
}

impl MemReader {
    pub(crate) fn new(
        core: Arc<Mutex<StreamCore>>,
        handle: tokio::runtime::Handle,
        data: Bytes,
    ) -> Self {
        Self {
            wake: Arc::new(Notify::new()),
            pending: Some(Pending { core, handle, data }),
            task: None,
        }
    }
}

#[async_trait]
impl Reader for MemReader {
    fn start(&mut self) -> Option<tokio::sync::oneshot::Receiver<crate::Result<()>>> {
        if let Some(pending) = self.pending.take() {
            let wake = self.wake.clone();
            self.task = Some(
                pending
                    .handle
                    .spawn(run(pending.core, wake, pending.data)),
            );
        }
        None
    }

    fn state_change(&mut self, _status: StreamStatus) {
        self.wake.notify_one();
    }

    async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MemReader {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

async fn run(core: Arc<Mutex<StreamCore>>, wake: Arc<Notify>, data: Bytes) {
    let mut pos = 0usize;
    loop {
        enum Step {
            Wait,
            Done,
        }
        let step = {
            let mut core = core.lock();
            if core.is_stopped() {
                Step::Done
            } else if core.is_paused() {
                Step::Wait
            } else {
                pos += mem_to_stream(&mut core, &data[pos..]);
                if core.is_stopped() {
                    Step::Done
                } else if core.is_paused() {
                    Step::Wait
                } else {
                    // Exhausted, or stuck on undecodable bytes: either way
                    // this source has nothing more to deliver.
                    core.stop_received();
                    Step::Done
                }
            }
        };
        match step {
            Step::Done => break,
            Step::Wait => wake.notified().await,
        }
    }
    debug!(consumed = pos, total = data.len(), "memory reader finished");
}
