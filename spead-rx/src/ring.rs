//! Bounded heap ring and the stream built on top of it.
//!
//! [`RingStream`] is a [`Stream`] whose sink pushes ready heaps into a
//! bounded ring for a blocking consumer. The producer side never blocks:
//! when the ring is full the sink refuses the heap, which pauses the stream,
//! and arms an asynchronous space-available wakeup that resumes it once the
//! consumer pops.

use crate::config::{RingConfig, StreamConfig};
use crate::error::{Error, Result};
use crate::stats::StreamStats;
use crate::stream::{HeapSink, SinkStatus, Stream, StreamCore};
use parking_lot::{Condvar, Mutex};
use spead_proto::{Heap, LiveHeap};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

pub(crate) enum PushError {
    Full(LiveHeap),
    Stopped(LiveHeap),
}

/// Bounded single-producer handoff queue.
///
/// Consumers block on a condvar; the producer only ever tries, and waits for
/// space asynchronously through [`HeapRing::space_available`]. Once stopped,
/// remaining heaps can still be popped; after that, pops fail.
pub(crate) struct HeapRing {
    state: Mutex<RingState>,
    capacity: usize,
    data_available: Condvar,
    space_available: Notify,
}

struct RingState {
    queue: VecDeque<LiveHeap>,
    stopped: bool,
}

impl HeapRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                queue: VecDeque::with_capacity(capacity),
                stopped: false,
            }),
            capacity,
            data_available: Condvar::new(),
            space_available: Notify::new(),
        }
    }

    pub(crate) fn try_push(&self, heap: LiveHeap) -> std::result::Result<(), PushError> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(PushError::Stopped(heap));
        }
        if state.queue.len() >= self.capacity {
            return Err(PushError::Full(heap));
        }
        state.queue.push_back(heap);
        drop(state);
        self.data_available.notify_one();
        Ok(())
    }

    /// Block until a heap is available or the ring is stopped and drained.
    pub(crate) fn pop(&self) -> Result<LiveHeap> {
        let mut state = self.state.lock();
        loop {
            if let Some(heap) = state.queue.pop_front() {
                drop(state);
                self.space_available.notify_one();
                return Ok(heap);
            }
            if state.stopped {
                return Err(Error::RingStopped);
            }
            self.data_available.wait(&mut state);
        }
    }

    pub(crate) fn try_pop(&self) -> Result<LiveHeap> {
        let mut state = self.state.lock();
        if let Some(heap) = state.queue.pop_front() {
            drop(state);
            self.space_available.notify_one();
            return Ok(heap);
        }
        if state.stopped {
            Err(Error::RingStopped)
        } else {
            Err(Error::RingEmpty)
        }
    }

    /// Stop the ring, waking blocked consumers. Idempotent.
    pub(crate) fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        drop(state);
        self.data_available.notify_all();
    }

    /// Resolves when a consumer has made space since this call (or just
    /// before it: a stored permit covers the pop-then-arm race).
    pub(crate) async fn space_available(&self) {
        self.space_available.notified().await;
    }
}

/// Sink pushing heaps into the ring, with pause/resume backpressure.
struct RingSink {
    ring: Arc<HeapRing>,
    handle: tokio::runtime::Handle,
    core: Weak<Mutex<StreamCore>>,
    wakeup_closed: watch::Receiver<bool>,
    contiguous_only: bool,
    stats: Arc<StreamStats>,
}

impl RingSink {
    /// Arm a one-shot wakeup: when the consumer makes space, re-acquire the
    /// stream mutex and resume. If the stream turns out to be stopped once
    /// the queue drains, the ring is stopped to unblock the consumer. The
    /// wakeup is abandoned when the stream closes it (application stop).
    fn arm_space_wakeup(&self) {
        let ring = self.ring.clone();
        let core = self.core.clone();
        let mut closed = self.wakeup_closed.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = ring.space_available() => {
                    let Some(core) = core.upgrade() else { return };
                    let mut core = core.lock();
                    core.resume();
                    if core.is_stopped() && !core.is_paused() {
                        ring.stop();
                    }
                }
                _ = closed.wait_for(|c| *c) => {}
            }
        });
    }
}

impl HeapSink for RingSink {
    fn heap_ready(&mut self, heap: LiveHeap) -> SinkStatus {
        if self.contiguous_only && !heap.is_contiguous() {
            warn!(
                cnt = heap.cnt(),
                received = heap.received_length(),
                length = heap.heap_length().unwrap_or(0),
                "dropping non-contiguous heap"
            );
            StreamStats::add(&self.stats.dropped_heaps, 1);
            return SinkStatus::Accepted;
        }
        match self.ring.try_push(heap) {
            Ok(()) => SinkStatus::Accepted,
            Err(PushError::Full(heap)) => {
                self.arm_space_wakeup();
                SinkStatus::NotReady(heap)
            }
            Err(PushError::Stopped(heap)) => {
                // Stop raced ahead of us; the heap is quietly dropped.
                info!(cnt = heap.cnt(), "dropped heap due to external stop");
                StreamStats::add(&self.stats.dropped_heaps, 1);
                SinkStatus::Accepted
            }
        }
    }

    fn stop_received(&mut self, paused: bool) -> bool {
        // A stop from the network: the base flush has already run, pushing
        // tail data into the ring. If nothing was refused the ring can stop
        // now; otherwise the space wakeup finishes the job once the queue
        // drains. Either way the refused heaps are retained.
        if !paused {
            self.ring.stop();
        }
        true
    }

    fn bind(&mut self, core: &Arc<Mutex<StreamCore>>) {
        self.core = Arc::downgrade(core);
    }
}

/// Stream whose ready heaps are popped, frozen, by a blocking consumer.
pub struct RingStream {
    inner: Stream,
    ring: Arc<HeapRing>,
    wakeup_close: watch::Sender<bool>,
}

impl RingStream {
    pub fn new(
        handle: tokio::runtime::Handle,
        config: StreamConfig,
        ring_config: RingConfig,
    ) -> Result<Self> {
        ring_config.validate()?;
        let ring = Arc::new(HeapRing::new(ring_config.ring_heaps));
        let (wakeup_close, wakeup_closed) = watch::channel(false);
        let stats = Arc::new(StreamStats::default());
        let sink = RingSink {
            ring: ring.clone(),
            handle: handle.clone(),
            core: Weak::new(),
            wakeup_closed,
            contiguous_only: ring_config.contiguous_only,
            stats: stats.clone(),
        };
        let inner = Stream::with_stats(handle, config, Box::new(sink), stats)?;
        Ok(Self {
            inner,
            ring,
            wakeup_close,
        })
    }

    /// Block until a contiguous heap is available, freeze it and return it.
    ///
    /// Non-contiguous heaps that reached the ring (with `contiguous_only`
    /// disabled a stop can flush them in) are logged and skipped. Fails with
    /// [`Error::RingStopped`] once the stream is stopped and drained.
    pub fn pop(&self) -> Result<Heap> {
        loop {
            let heap = self.ring.pop()?;
            if heap.is_contiguous() {
                return Ok(Heap::freeze(heap));
            }
            info!(cnt = heap.cnt(), "skipping incomplete heap");
            StreamStats::add(&self.inner.stats_arc().dropped_heaps, 1);
        }
    }

    /// Like [`Self::pop`], but fails with [`Error::RingEmpty`] instead of
    /// blocking while the stream is still running.
    pub fn try_pop(&self) -> Result<Heap> {
        loop {
            let heap = self.ring.try_pop()?;
            if heap.is_contiguous() {
                return Ok(Heap::freeze(heap));
            }
            info!(cnt = heap.cnt(), "skipping incomplete heap");
            StreamStats::add(&self.inner.stats_arc().dropped_heaps, 1);
        }
    }

    /// Stop the stream and unblock any consumer waiting in [`Self::pop`].
    ///
    /// Ordering matters: the space wakeup is closed first so no late
    /// callback can run against a stopping stream, then the ring is stopped
    /// so a producer waiting for space observes the stop (and drops
    /// silently) before the base stop takes the stream mutex.
    pub async fn stop(&self) {
        let _ = self.wakeup_close.send(true);
        self.ring.stop();
        self.inner.stop().await;
    }
}

impl std::ops::Deref for RingStream {
    type Target = Stream;

    fn deref(&self) -> &Stream {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spead_proto::LiveHeap;

    fn live(cnt: i64) -> LiveHeap {
        LiveHeap::new(cnt, 0)
    }

    #[test]
    fn test_ring_push_pop() {
        let ring = HeapRing::new(2);
        ring.try_push(live(1)).map_err(|_| ()).unwrap();
        ring.try_push(live(2)).map_err(|_| ()).unwrap();
        assert!(matches!(ring.try_push(live(3)), Err(PushError::Full(_))));
        assert_eq!(ring.pop().unwrap().cnt(), 1);
        ring.try_push(live(3)).map_err(|_| ()).unwrap();
        assert_eq!(ring.pop().unwrap().cnt(), 2);
        assert_eq!(ring.pop().unwrap().cnt(), 3);
        assert!(matches!(ring.try_pop(), Err(Error::RingEmpty)));
    }

    #[test]
    fn test_ring_stop_drains_then_fails() {
        let ring = HeapRing::new(4);
        ring.try_push(live(1)).map_err(|_| ()).unwrap();
        ring.stop();
        assert!(matches!(ring.try_push(live(2)), Err(PushError::Stopped(_))));
        assert_eq!(ring.pop().unwrap().cnt(), 1);
        assert!(matches!(ring.pop(), Err(Error::RingStopped)));
        assert!(matches!(ring.try_pop(), Err(Error::RingStopped)));
    }

    #[test]
    fn test_ring_stop_unblocks_consumer() {
        let ring = Arc::new(HeapRing::new(1));
        let r = ring.clone();
        let consumer = std::thread::spawn(move || r.pop());
        std::thread::sleep(std::time::Duration::from_millis(50));
        ring.stop();
        assert!(matches!(consumer.join().unwrap(), Err(Error::RingStopped)));
    }

    #[tokio::test]
    async fn test_space_available_permit_covers_race() {
        let ring = HeapRing::new(1);
        ring.try_push(live(1)).map_err(|_| ()).unwrap();
        // Pop before anyone waits: the permit must be stored.
        ring.pop().unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), ring.space_available())
            .await
            .expect("stored permit should complete the wait immediately");
    }
}
