//! Shared helpers for unit tests: wire packet construction and recording
//! sinks.

use crate::stream::{HeapSink, SinkStatus};
use parking_lot::Mutex;
use spead_proto::{item_id, LiveHeap};
use std::sync::Arc;

fn pointer(immediate: bool, id: u64, value: u64) -> u64 {
    ((immediate as u64) << 63) | (id << 48) | (value & ((1u64 << 48) - 1))
}

fn build(cnt: i64, pointers: Vec<u64>, payload: &[u8]) -> Vec<u8> {
    let mut all = vec![pointer(true, item_id::HEAP_CNT, cnt as u64)];
    all.extend(pointers);
    let mut out = vec![0x53, 0x04, 2, 6, 0, 0, 0, all.len() as u8];
    for p in all {
        out.extend_from_slice(&p.to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

/// One SPEAD-64-48 packet carrying a payload fragment of a heap.
pub fn packet(cnt: i64, offset: u64, heap_length: u64, payload: &[u8]) -> Vec<u8> {
    build(
        cnt,
        vec![
            pointer(true, item_id::PAYLOAD_OFFSET, offset),
            pointer(true, item_id::PAYLOAD_LENGTH, payload.len() as u64),
            pointer(true, item_id::HEAP_LENGTH, heap_length),
        ],
        payload,
    )
}

/// A payload-less control packet with the given `STREAM_CTRL` flags.
pub fn packet_with_ctrl(cnt: i64, flags: u64) -> Vec<u8> {
    build(
        cnt,
        vec![
            pointer(true, item_id::PAYLOAD_OFFSET, 0),
            pointer(true, item_id::PAYLOAD_LENGTH, 0),
            pointer(true, item_id::STREAM_CTRL, flags),
        ],
        &[],
    )
}

/// What a sink observed about one delivered heap.
#[derive(Debug, Clone)]
pub struct SeenHeap {
    pub cnt: i64,
    pub complete: bool,
    pub contiguous: bool,
    pub received: u64,
}

impl SeenHeap {
    fn of(heap: &LiveHeap) -> Self {
        Self {
            cnt: heap.cnt(),
            complete: heap.is_complete(),
            contiguous: heap.is_contiguous(),
            received: heap.received_length(),
        }
    }
}

pub type SinkLog = Arc<Mutex<Vec<SeenHeap>>>;

/// Sink that accepts everything and records what it saw.
pub struct CollectingSink(pub SinkLog);

impl HeapSink for CollectingSink {
    fn heap_ready(&mut self, heap: LiveHeap) -> SinkStatus {
        self.0.lock().push(SeenHeap::of(&heap));
        SinkStatus::Accepted
    }
}

/// Sink that refuses the first `n` offers, then accepts (and records) the
/// rest. Refused offers are not recorded until they are accepted on resume.
pub struct RefusingSink {
    remaining: usize,
    pub log: SinkLog,
}

impl RefusingSink {
    pub fn new(n: usize) -> Self {
        Self {
            remaining: n,
            log: SinkLog::default(),
        }
    }
}

impl HeapSink for RefusingSink {
    fn heap_ready(&mut self, heap: LiveHeap) -> SinkStatus {
        if self.remaining > 0 {
            self.remaining -= 1;
            SinkStatus::NotReady(heap)
        } else {
            self.log.lock().push(SeenHeap::of(&heap));
            SinkStatus::Accepted
        }
    }
}
