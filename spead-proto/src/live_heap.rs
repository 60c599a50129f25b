//! In-flight heap reassembly.
//!
//! A [`LiveHeap`] collects the payload fragments and item pointers of one
//! heap as its packets arrive, in any order. It is created from the first
//! packet bearing a heap cnt and destroyed by eviction, completion or stream
//! shutdown; those policies live in the receive pipeline, not here.

use crate::error::HeapError;
use crate::packet::{ItemPointer, PacketHeader};
use crate::{item_id, BugCompatMask, HeapCnt};
use alloc::collections::BTreeSet;
use alloc::vec::Vec;

/// Reassembly buffer for a single heap.
#[derive(Debug)]
pub struct LiveHeap {
    pub(crate) cnt: HeapCnt,
    pub(crate) heap_address_bits: u8,
    pub(crate) bug_compat: BugCompatMask,
    pub(crate) heap_length: Option<u64>,
    pub(crate) received_length: u64,
    /// One past the highest payload byte written so far.
    pub(crate) seen_end: u64,
    pub(crate) payload: Vec<u8>,
    /// Offsets of payload-bearing packets already merged, for duplicate
    /// rejection.
    packet_offsets: BTreeSet<u64>,
    pub(crate) pointers: Vec<ItemPointer>,
    pointer_raws: BTreeSet<u64>,
    end_of_stream: bool,
}

impl LiveHeap {
    pub fn new(cnt: HeapCnt, bug_compat: BugCompatMask) -> Self {
        Self {
            cnt,
            heap_address_bits: 48,
            bug_compat,
            heap_length: None,
            received_length: 0,
            seen_end: 0,
            payload: Vec::new(),
            packet_offsets: BTreeSet::new(),
            pointers: Vec::new(),
            pointer_raws: BTreeSet::new(),
            end_of_stream: false,
        }
    }

    /// Merge a decoded packet into the heap.
    ///
    /// The packet's payload is copied into place and its item pointers are
    /// recorded (deduplicated, standard items excluded). Rejected packets
    /// leave the heap unchanged.
    pub fn add_packet(&mut self, packet: &PacketHeader) -> Result<(), HeapError> {
        if packet.heap_cnt != self.cnt {
            return Err(HeapError::CntMismatch {
                packet: packet.heap_cnt,
                heap: self.cnt,
            });
        }
        if let Some(length) = packet.heap_length {
            match self.heap_length {
                None => self.heap_length = Some(length),
                Some(existing) if existing != length => {
                    return Err(HeapError::LengthMismatch {
                        packet: length,
                        heap: existing,
                    });
                }
                Some(_) => {}
            }
        }
        if let Some(heap_length) = self.heap_length {
            let end = packet.payload_offset + packet.payload_length;
            if end > heap_length {
                return Err(HeapError::PayloadOverrun {
                    offset: packet.payload_offset,
                    length: packet.payload_length,
                    heap_length,
                });
            }
        }
        if packet.payload_length > 0 {
            if !self.packet_offsets.insert(packet.payload_offset) {
                return Err(HeapError::Duplicate {
                    offset: packet.payload_offset,
                });
            }
            let offset = packet.payload_offset as usize;
            let end = offset + packet.payload.len();
            if self.payload.len() < end {
                self.payload.resize(end, 0);
            }
            self.payload[offset..end].copy_from_slice(packet.payload);
            self.received_length += packet.payload_length;
            self.seen_end = self.seen_end.max(end as u64);
        }

        self.heap_address_bits = packet.heap_address_bits;
        for pointer in packet.item_pointers() {
            let standard = matches!(
                pointer.id(),
                item_id::HEAP_CNT
                    | item_id::HEAP_LENGTH
                    | item_id::PAYLOAD_OFFSET
                    | item_id::PAYLOAD_LENGTH
                    | item_id::STREAM_CTRL
            );
            if !standard && self.pointer_raws.insert(pointer.raw()) {
                self.pointers.push(pointer);
            }
        }
        if packet.is_stream_end {
            self.end_of_stream = true;
        }
        Ok(())
    }

    pub fn cnt(&self) -> HeapCnt {
        self.cnt
    }

    pub fn heap_length(&self) -> Option<u64> {
        self.heap_length
    }

    pub fn received_length(&self) -> u64 {
        self.received_length
    }

    pub fn bug_compat(&self) -> BugCompatMask {
        self.bug_compat
    }

    /// The received payload covers the declared heap length with no gaps.
    pub fn is_contiguous(&self) -> bool {
        match self.heap_length {
            Some(length) => self.received_length == length && self.seen_end == length,
            None => false,
        }
    }

    /// Contiguous, and every addressed item falls inside the payload.
    pub fn is_complete(&self) -> bool {
        match self.heap_length {
            Some(length) => {
                self.is_contiguous()
                    && self
                        .pointers
                        .iter()
                        .filter(|p| !p.is_immediate())
                        .all(|p| p.value() <= length)
            }
            None => false,
        }
    }

    /// The heap carried an end-of-stream control flag. Such heaps are
    /// control messages and are not delivered downstream.
    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Item pointers collected so far, standard items excluded.
    pub fn item_pointers(&self) -> &[ItemPointer] {
        &self.pointers
    }
}
