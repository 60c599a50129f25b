//! Wire-level packet construction for tests.

use crate::{item_id, MAGIC, VERSION};
use alloc::vec::Vec;

fn pointer(immediate: bool, id: u64, value: u64, address_bits: u8) -> u64 {
    ((immediate as u64) << 63) | (id << address_bits) | (value & ((1u64 << address_bits) - 1))
}

/// Builds SPEAD packets for tests, one heap fragment at a time.
pub struct PacketBuilder {
    id_bytes: u8,
    addr_bytes: u8,
    heap_cnt: u64,
    heap_length: Option<u64>,
    payload_offset: u64,
    payload: Vec<u8>,
    ctrl: Option<u64>,
    items: Vec<(bool, u64, u64)>,
}

impl PacketBuilder {
    /// SPEAD-64-48 flavour packet for heap `cnt`.
    pub fn new(cnt: u64) -> Self {
        Self::with_flavour(2, 6, cnt)
    }

    pub fn with_flavour(id_bytes: u8, addr_bytes: u8, cnt: u64) -> Self {
        Self {
            id_bytes,
            addr_bytes,
            heap_cnt: cnt,
            heap_length: None,
            payload_offset: 0,
            payload: Vec::new(),
            ctrl: None,
            items: Vec::new(),
        }
    }

    pub fn heap_length(mut self, length: u64) -> Self {
        self.heap_length = Some(length);
        self
    }

    pub fn payload(mut self, offset: u64, bytes: &[u8]) -> Self {
        self.payload_offset = offset;
        self.payload = bytes.to_vec();
        self
    }

    pub fn ctrl(mut self, flags: u64) -> Self {
        self.ctrl = Some(flags);
        self
    }

    pub fn item_imm(mut self, id: u64, value: u64) -> Self {
        self.items.push((true, id, value));
        self
    }

    pub fn item_addr(mut self, id: u64, address: u64) -> Self {
        self.items.push((false, id, address));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let address_bits = self.addr_bytes * 8;
        let mut pointers = Vec::new();
        pointers.push(pointer(true, item_id::HEAP_CNT, self.heap_cnt, address_bits));
        pointers.push(pointer(
            true,
            item_id::PAYLOAD_OFFSET,
            self.payload_offset,
            address_bits,
        ));
        pointers.push(pointer(
            true,
            item_id::PAYLOAD_LENGTH,
            self.payload.len() as u64,
            address_bits,
        ));
        if let Some(length) = self.heap_length {
            pointers.push(pointer(true, item_id::HEAP_LENGTH, length, address_bits));
        }
        if let Some(flags) = self.ctrl {
            pointers.push(pointer(true, item_id::STREAM_CTRL, flags, address_bits));
        }
        for (immediate, id, value) in &self.items {
            pointers.push(pointer(*immediate, *id, *value, address_bits));
        }

        let mut out = Vec::with_capacity(8 + 8 * pointers.len() + self.payload.len());
        out.extend_from_slice(&[
            MAGIC,
            VERSION,
            self.id_bytes,
            self.addr_bytes,
            0,
            0,
            (pointers.len() >> 8) as u8,
            pointers.len() as u8,
        ]);
        for p in pointers {
            out.extend_from_slice(&p.to_be_bytes());
        }
        out.extend_from_slice(&self.payload);
        out
    }

    /// A structurally valid packet that omits the heap-cnt item.
    pub fn raw_without_heap_cnt() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[MAGIC, VERSION, 2, 6, 0, 0, 0, 2]);
        out.extend_from_slice(&pointer(true, item_id::PAYLOAD_OFFSET, 0, 48).to_be_bytes());
        out.extend_from_slice(&pointer(true, item_id::PAYLOAD_LENGTH, 0, 48).to_be_bytes());
        out
    }

    /// A packet whose heap-cnt item is illegally sent in addressed mode.
    pub fn raw_with_addressed_heap_cnt() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[MAGIC, VERSION, 2, 6, 0, 0, 0, 3]);
        out.extend_from_slice(&pointer(false, item_id::HEAP_CNT, 0, 48).to_be_bytes());
        out.extend_from_slice(&pointer(true, item_id::PAYLOAD_OFFSET, 0, 48).to_be_bytes());
        out.extend_from_slice(&pointer(true, item_id::PAYLOAD_LENGTH, 0, 48).to_be_bytes());
        out
    }
}
