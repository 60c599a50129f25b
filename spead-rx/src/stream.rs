//! Stream core: live-heap table, resume queue and the heap sink hook.
//!
//! Packets are fed in through [`StreamCore::add_packet`]. The core keeps a
//! fixed collection of partial heaps; a heap leaves the collection and is
//! handed to the sink when
//! - it is known to be complete (or its end was signalled), or
//! - too many heaps are live: the slot holding the oldest is recycled, even
//!   if the heap is incomplete, or
//! - the stream is stopped.
//!
//! The live heaps sit in a circular queue with a parallel queue of heap
//! cnts (`-1` marking a hole). Scanning the cnt queue touches fewer cache
//! lines than walking the heaps themselves. Removing a heap leaves a hole
//! rather than shifting the queue, so only a head index is needed; a new
//! heap always claims the slot after the head, evicting any occupant. Heaps
//! with lost packets therefore cannot linger forever.

use crate::config::{StreamConfig, UdpConfig};
use crate::error::{Error, Result};
use crate::reader::{Reader, StreamStatus};
use crate::stats::{StreamStats, StatsSnapshot};
use bytes::Bytes;
use parking_lot::Mutex;
use spead_proto::packet::PacketHeader;
use spead_proto::{decode_packet, HeapCnt, LiveHeap};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Outcome of offering a heap to a sink.
pub enum SinkStatus {
    /// The sink consumed the heap.
    Accepted,
    /// The sink is temporarily unable to consume; the heap is returned and
    /// the stream queues it and pauses. The sink must eventually call
    /// [`StreamCore::resume`] once it may be ready again.
    NotReady(LiveHeap),
}

/// Consumer hook for heaps leaving the live collection.
///
/// All methods are called with the stream mutex held and must not block.
pub trait HeapSink: Send {
    /// Consume a heap being ejected. The heap might or might not be
    /// complete.
    fn heap_ready(&mut self, heap: LiveHeap) -> SinkStatus;

    /// Called once after a network-initiated stop has flushed the live
    /// collection. `paused` reports whether refused heaps remain queued.
    /// Return `true` to retain them for a later [`StreamCore::resume`];
    /// returning `false` discards them.
    fn stop_received(&mut self, paused: bool) -> bool {
        let _ = paused;
        false
    }

    /// Invoked once at stream construction with the shared core, for sinks
    /// that need to call back into the stream (e.g. to resume it).
    fn bind(&mut self, core: &Arc<Mutex<StreamCore>>) {
        let _ = core;
    }
}

/// Sink that always accepts and forwards heaps to a callback.
struct CallbackSink<F: FnMut(LiveHeap) + Send>(F);

impl<F: FnMut(LiveHeap) + Send> HeapSink for CallbackSink<F> {
    fn heap_ready(&mut self, heap: LiveHeap) -> SinkStatus {
        (self.0)(heap);
        SinkStatus::Accepted
    }
}

/// The reassembly state machine plus everything else the stream mutex
/// protects: live-heap table, resume queue, stopped flag and the readers.
pub struct StreamCore {
    heaps: Box<[Option<LiveHeap>]>,
    heap_cnts: Box<[HeapCnt]>,
    /// Slot of the most recently added heap.
    head: usize,
    /// Heaps refused by the sink, oldest first. The stream is paused iff
    /// this queue is non-empty.
    resume_queue: VecDeque<LiveHeap>,
    stopped: bool,
    config: StreamConfig,
    sink: Box<dyn HeapSink>,
    pub(crate) readers: Vec<Box<dyn Reader>>,
    stats: Arc<StreamStats>,
}

impl StreamCore {
    pub(crate) fn new(config: StreamConfig, sink: Box<dyn HeapSink>, stats: Arc<StreamStats>) -> Self {
        let max_heaps = config.max_heaps;
        Self {
            heaps: (0..max_heaps).map(|_| None).collect(),
            heap_cnts: vec![-1; max_heaps].into_boxed_slice(),
            head: 0,
            resume_queue: VecDeque::new(),
            stopped: false,
            config,
            sink,
            readers: Vec::new(),
            stats,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_paused(&self) -> bool {
        !self.resume_queue.is_empty()
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            stopped: self.stopped,
            paused: self.is_paused(),
        }
    }

    pub fn bug_compat(&self) -> u8 {
        self.config.bug_compat
    }

    pub(crate) fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    fn find_slot(&self, cnt: HeapCnt) -> Option<usize> {
        self.heap_cnts.iter().position(|&c| c == cnt)
    }

    /// Incorporate a decoded packet.
    ///
    /// Returns `true` if the packet contributed new data, `false` if it was
    /// rejected (stream stopped, duplicate, or inconsistent with existing
    /// heap state). A packet carrying the end-of-stream control flag stops
    /// the stream after being merged.
    pub fn add_packet(&mut self, packet: &PacketHeader) -> bool {
        if self.stopped {
            return false;
        }

        if let Some(idx) = self.find_slot(packet.heap_cnt) {
            let Some(heap) = self.heaps[idx].as_mut() else {
                debug_assert!(false, "cnt table points at an empty slot");
                return false;
            };
            if let Err(e) = heap.add_packet(packet) {
                StreamStats::add(&self.stats.rejected_packets, 1);
                debug!(cnt = packet.heap_cnt, error = %e, "packet rejected");
                return false;
            }
            StreamStats::add(&self.stats.packets, 1);
            let finished =
                packet.is_heap_end || heap.is_complete() || heap.is_end_of_stream();
            if finished {
                self.heap_cnts[idx] = -1;
                if let Some(heap) = self.heaps[idx].take() {
                    if heap.is_end_of_stream() {
                        self.stop_received();
                    } else {
                        self.deliver(heap);
                    }
                }
            }
            return true;
        }

        // First packet of a new heap. If it does not merge there is nothing
        // to keep: no empty heap is placed.
        let mut heap = LiveHeap::new(packet.heap_cnt, self.config.bug_compat);
        if let Err(e) = heap.add_packet(packet) {
            StreamStats::add(&self.stats.rejected_packets, 1);
            debug!(cnt = packet.heap_cnt, error = %e, "first packet of heap rejected");
            return false;
        }
        StreamStats::add(&self.stats.packets, 1);
        let finished = packet.is_heap_end || heap.is_complete() || heap.is_end_of_stream();

        let slot = (self.head + 1) % self.heap_cnts.len();
        if self.heap_cnts[slot] >= 0 {
            self.heap_cnts[slot] = -1;
            if let Some(evicted) = self.heaps[slot].take() {
                self.deliver(evicted);
            }
        }
        self.head = slot;
        if finished {
            if heap.is_end_of_stream() {
                self.stop_received();
            } else {
                self.deliver(heap);
            }
        } else {
            self.heap_cnts[slot] = packet.heap_cnt;
            self.heaps[slot] = Some(heap);
        }
        true
    }

    /// Pass a heap leaving the live collection to the sink, queueing it if
    /// the sink is not ready. End-of-stream control heaps are consumed here
    /// and never delivered.
    fn deliver(&mut self, heap: LiveHeap) {
        if heap.is_end_of_stream() {
            return;
        }
        if heap.is_complete() {
            StreamStats::add(&self.stats.complete_heaps, 1);
        } else {
            StreamStats::add(&self.stats.incomplete_heaps, 1);
        }
        match self.sink.heap_ready(heap) {
            SinkStatus::Accepted => {}
            SinkStatus::NotReady(heap) => self.resume_queue.push_back(heap),
        }
    }

    /// Flush the live collection through the sink, oldest slot first.
    pub fn flush(&mut self) {
        for i in 1..=self.heap_cnts.len() {
            let idx = (self.head + i) % self.heap_cnts.len();
            if self.heap_cnts[idx] >= 0 {
                self.heap_cnts[idx] = -1;
                if let Some(heap) = self.heaps[idx].take() {
                    self.deliver(heap);
                }
            }
        }
    }

    /// Shut the stream down from the network side: mark it stopped, flush
    /// the live collection, and let the sink decide whether refused heaps
    /// are retained for resumption. Idempotent.
    pub fn stop_received(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.flush();
        let retain = self.sink.stop_received(self.is_paused());
        if !retain {
            self.resume_queue.clear();
        }
        self.notify_readers();
    }

    /// Re-deliver queued heaps in order, stopping at the first refusal.
    /// When the queue empties the stream unpauses and the readers are told
    /// to re-arm.
    pub fn resume(&mut self) {
        while let Some(heap) = self.resume_queue.pop_front() {
            match self.sink.heap_ready(heap) {
                SinkStatus::Accepted => {}
                SinkStatus::NotReady(heap) => {
                    self.resume_queue.push_front(heap);
                    break;
                }
            }
        }
        if self.resume_queue.is_empty() {
            self.notify_readers();
        }
    }

    /// Throw away refused heaps without re-offering them. Used by an
    /// application-initiated stop; a network stop goes through the sink's
    /// retain decision instead.
    pub fn discard_resume_queue(&mut self) {
        self.resume_queue.clear();
    }

    fn notify_readers(&mut self) {
        let status = self.status();
        for reader in &mut self.readers {
            reader.state_change(status);
        }
    }
}

/// Push packets found in a block of memory into a stream core. Returns the
/// number of bytes consumed.
///
/// Scanning stops when the stream stops or pauses, or at the first byte
/// range `decode_packet` rejects (there is no way to find the next packet
/// after a corrupt one). Individual packets may still be rejected by the
/// stream; the scan continues past those.
pub fn mem_to_stream(core: &mut StreamCore, data: &[u8]) -> usize {
    let mut pos = 0;
    while pos < data.len() && !core.is_stopped() && !core.is_paused() {
        match decode_packet(&data[pos..]) {
            Ok(packet) => {
                core.add_packet(&packet);
                pos += packet.total_length();
            }
            Err(e) => {
                debug!(offset = pos, error = %e, "memory scan stopped at undecodable bytes");
                break;
            }
        }
    }
    pos
}

/// A stream of heaps fed by one or more readers.
///
/// Thread-safe: the core behind the mutex serialises packet processing,
/// state changes and reader registration. The stream owns its readers;
/// reader tasks hold the shared core and feed it until told to stop.
pub struct Stream {
    core: Arc<Mutex<StreamCore>>,
    handle: tokio::runtime::Handle,
    stats: Arc<StreamStats>,
}

impl Stream {
    /// Create a stream delivering heaps to `sink`.
    pub fn new(
        handle: tokio::runtime::Handle,
        config: StreamConfig,
        sink: Box<dyn HeapSink>,
    ) -> Result<Self> {
        Self::with_stats(handle, config, sink, Arc::new(StreamStats::default()))
    }

    pub(crate) fn with_stats(
        handle: tokio::runtime::Handle,
        config: StreamConfig,
        sink: Box<dyn HeapSink>,
        stats: Arc<StreamStats>,
    ) -> Result<Self> {
        config.validate()?;
        let core = Arc::new(Mutex::new(StreamCore::new(config, sink, stats.clone())));
        core.lock().sink.bind(&core);
        Ok(Self {
            core,
            handle,
            stats,
        })
    }

    pub(crate) fn stats_arc(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    /// Create a stream delivering every heap to a callback.
    pub fn with_callback<F>(
        handle: tokio::runtime::Handle,
        config: StreamConfig,
        callback: F,
    ) -> Result<Self>
    where
        F: FnMut(LiveHeap) + Send + 'static,
    {
        Self::new(handle, config, Box::new(CallbackSink(callback)))
    }

    pub fn is_stopped(&self) -> bool {
        self.core.lock().is_stopped()
    }

    pub fn is_paused(&self) -> bool {
        self.core.lock().is_paused()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Attach a UDP reader and return the locally bound address.
    pub async fn add_udp_reader(&self, config: UdpConfig) -> Result<SocketAddr> {
        config.validate()?;
        let reader = crate::udp::UdpReader::new(self.core.clone(), self.handle.clone(), config)?;
        let local = reader.local_addr();
        self.attach(Box::new(reader)).await?;
        Ok(local)
    }

    /// Attach a reader that drains an in-memory buffer of packets and then
    /// signals end of stream.
    pub async fn add_mem_reader(&self, data: Bytes) -> Result<()> {
        let reader = crate::mem::MemReader::new(self.core.clone(), self.handle.clone(), data);
        self.attach(Box::new(reader)).await
    }

    /// Attach a kernel-bypass reader for `endpoint` (IPv4 only) on the
    /// shared service for `(technology, interface)`. Returns once the
    /// endpoint registration has completed on the service.
    pub async fn add_bypass_reader(
        &self,
        technology: &str,
        interface: &str,
        endpoint: SocketAddr,
    ) -> Result<()> {
        let reader =
            crate::bypass::BypassReader::new(&self.core, technology, interface, endpoint)?;
        self.attach(Box::new(reader)).await
    }

    /// Attach an already-constructed reader.
    ///
    /// The reader is started under the stream mutex; any deferred start
    /// future is awaited after the mutex is released, so first-packet
    /// registration can run on the I/O executor without recursive locking.
    pub async fn attach(&self, mut reader: Box<dyn Reader>) -> Result<()> {
        let marker: *const () = &*reader as *const dyn Reader as *const ();
        let start_rx = {
            let mut core = self.core.lock();
            if core.is_stopped() {
                return Err(Error::InvalidArgument("stream already stopped".into()));
            }
            let rx = reader.start();
            core.readers.push(reader);
            rx
        };
        if let Some(rx) = start_rx {
            let started = match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::Cancelled),
            };
            if let Err(e) = started {
                let mut core = self.core.lock();
                core.readers
                    .retain(|r| &**r as *const dyn Reader as *const () != marker);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop the stream and block until all readers have wound up. After
    /// this returns no reader callback is in flight and no further
    /// `heap_ready` call will occur. Idempotent.
    pub async fn stop(&self) {
        let mut readers = {
            let mut core = self.core.lock();
            if !core.is_stopped() {
                core.stop_received();
            }
            core.discard_resume_queue();
            let mut readers = std::mem::take(&mut core.readers);
            let status = core.status();
            for reader in &mut readers {
                reader.state_change(status);
            }
            readers
        };
        for reader in &mut readers {
            reader.join().await;
        }
        // Readers are destroyed under the mutex, matching their
        // construction.
        let guard = self.core.lock();
        drop(readers);
        drop(guard);
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.lock();
        f.debug_struct("Stream")
            .field("stopped", &core.is_stopped())
            .field("paused", &core.is_paused())
            .field("readers", &core.readers.len())
            .finish()
    }
}
