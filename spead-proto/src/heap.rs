//! Frozen heaps.
//!
//! A [`Heap`] is the immutable form a [`LiveHeap`] takes once it leaves the
//! reassembly pipeline. The payload is reference-counted and items are
//! exposed without copying.

use crate::live_heap::LiveHeap;
use crate::{bug_compat, item_id, BugCompatMask, HeapCnt};
use alloc::vec::Vec;
use bytes::Bytes;

/// One item carried by a heap.
#[derive(Debug, Clone)]
pub struct Item {
    pub id: u64,
    pub value: ItemValue,
}

#[derive(Debug, Clone)]
pub enum ItemValue {
    /// Value encoded directly in the item pointer.
    Immediate(u64),
    /// Zero-copy slice of the heap payload.
    Addressed(Bytes),
}

/// An immutable, reassembled heap.
#[derive(Debug)]
pub struct Heap {
    cnt: HeapCnt,
    bug_compat: BugCompatMask,
    heap_length: Option<u64>,
    received_length: u64,
    contiguous: bool,
    complete: bool,
    payload: Bytes,
    items: Vec<Item>,
}

impl Heap {
    /// Freeze a live heap.
    ///
    /// Addressed items are sliced out of the payload; an item's extent runs
    /// to the next addressed item's offset, or to the end of the payload.
    pub fn freeze(live: LiveHeap) -> Self {
        let contiguous = live.is_contiguous();
        let complete = live.is_complete();
        let payload = Bytes::from(live.payload);

        let mut addressed: Vec<u64> = live
            .pointers
            .iter()
            .filter(|p| !p.is_immediate())
            .map(|p| p.value())
            .collect();
        addressed.sort_unstable();

        let items = live
            .pointers
            .iter()
            .map(|p| {
                let value = if p.is_immediate() {
                    let mut v = p.value();
                    if live.bug_compat & bug_compat::SWAP_ENDIAN != 0 {
                        let width = live.heap_address_bits as u32;
                        v = v.swap_bytes() >> (64 - width);
                    }
                    ItemValue::Immediate(v)
                } else {
                    let start = (p.value() as usize).min(payload.len());
                    let end = addressed
                        .iter()
                        .find(|&&a| a > p.value())
                        .map(|&a| a as usize)
                        .unwrap_or(payload.len())
                        .min(payload.len());
                    ItemValue::Addressed(payload.slice(start..end))
                };
                Item { id: p.id(), value }
            })
            .collect();

        Self {
            cnt: live.cnt,
            bug_compat: live.bug_compat,
            heap_length: live.heap_length,
            received_length: live.received_length,
            contiguous,
            complete,
            payload,
            items,
        }
    }

    pub fn cnt(&self) -> HeapCnt {
        self.cnt
    }

    pub fn bug_compat(&self) -> BugCompatMask {
        self.bug_compat
    }

    pub fn heap_length(&self) -> Option<u64> {
        self.heap_length
    }

    pub fn received_length(&self) -> u64 {
        self.received_length
    }

    pub fn is_contiguous(&self) -> bool {
        self.contiguous
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Items carrying item descriptors.
    pub fn descriptors(&self) -> impl Iterator<Item = &Item> {
        self.items.iter().filter(|i| i.id == item_id::DESCRIPTOR)
    }
}

impl From<LiveHeap> for Heap {
    fn from(live: LiveHeap) -> Self {
        Heap::freeze(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::decode_packet;
    use crate::test_util::PacketBuilder;

    fn live_from(data: &[u8]) -> LiveHeap {
        let ph = decode_packet(data).unwrap();
        let mut heap = LiveHeap::new(ph.heap_cnt, 0);
        heap.add_packet(&ph).unwrap();
        heap
    }

    #[test]
    fn test_freeze_immediate_and_addressed() {
        let data = PacketBuilder::new(4)
            .heap_length(8)
            .payload(0, b"xxxxyyyy")
            .item_imm(0x1000, 99)
            .item_addr(0x1001, 0)
            .item_addr(0x1002, 4)
            .build();
        let heap = Heap::freeze(live_from(&data));
        assert!(heap.is_complete());
        assert_eq!(heap.items().len(), 3);

        match &heap.items()[0].value {
            ItemValue::Immediate(v) => assert_eq!(*v, 99),
            other => panic!("expected immediate, got {:?}", other),
        }
        match &heap.items()[1].value {
            ItemValue::Addressed(b) => assert_eq!(&b[..], b"xxxx"),
            other => panic!("expected addressed, got {:?}", other),
        }
        match &heap.items()[2].value {
            ItemValue::Addressed(b) => assert_eq!(&b[..], b"yyyy"),
            other => panic!("expected addressed, got {:?}", other),
        }
    }

    #[test]
    fn test_freeze_incomplete_heap() {
        let data = PacketBuilder::new(4).heap_length(64).payload(0, b"frag").build();
        let heap = Heap::freeze(live_from(&data));
        assert!(!heap.is_complete());
        assert!(!heap.is_contiguous());
        assert_eq!(heap.received_length(), 4);
        assert_eq!(heap.heap_length(), Some(64));
    }

    #[test]
    fn test_freeze_swapped_immediates() {
        let data = PacketBuilder::new(4)
            .heap_length(0)
            .payload(0, &[])
            .item_imm(0x1000, 0x0000_0000_0001)
            .build();
        let ph = decode_packet(&data).unwrap();
        let mut live = LiveHeap::new(4, crate::bug_compat::SWAP_ENDIAN);
        live.add_packet(&ph).unwrap();
        let heap = Heap::freeze(live);
        match &heap.items()[0].value {
            ItemValue::Immediate(v) => assert_eq!(*v, 0x0100_0000_0000),
            other => panic!("expected immediate, got {:?}", other),
        }
    }

    #[test]
    fn test_descriptor_filter() {
        let data = PacketBuilder::new(4)
            .heap_length(4)
            .payload(0, b"desc")
            .item_addr(crate::item_id::DESCRIPTOR, 0)
            .item_imm(0x1000, 1)
            .build();
        let heap = Heap::freeze(live_from(&data));
        assert_eq!(heap.descriptors().count(), 1);
    }
}
