//! Zero-copy SPEAD packet decoding.
//!
//! A packet is an 8-byte header, `n_items` 64-bit big-endian item pointers,
//! and a payload. The decoded [`PacketHeader`] borrows the pointer and
//! payload regions from the input buffer; nothing is copied.

use crate::error::DecodeError;
use crate::{ctrl, item_id, HeapCnt, MAGIC, VERSION};

/// A single 64-bit item pointer.
///
/// Bit 63 is the immediate flag. The remaining 63 bits split into an item id
/// (upper) and an address or immediate value (lower); the split point is the
/// flavour's heap-address width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemPointer {
    raw: u64,
    address_bits: u8,
}

impl ItemPointer {
    pub fn new(raw: u64, address_bits: u8) -> Self {
        Self { raw, address_bits }
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }

    /// True if the value field holds the item value itself rather than a
    /// payload address.
    pub fn is_immediate(&self) -> bool {
        self.raw >> 63 != 0
    }

    pub fn id(&self) -> u64 {
        let id_bits = 63 - self.address_bits as u32;
        (self.raw >> self.address_bits) & ((1u64 << id_bits) - 1)
    }

    /// The low bits: an immediate value or a payload offset, depending on
    /// [`Self::is_immediate`].
    pub fn value(&self) -> u64 {
        self.raw & ((1u64 << self.address_bits) - 1)
    }
}

/// A decoded packet, borrowing from the datagram it was parsed from.
#[derive(Debug, Clone)]
pub struct PacketHeader<'a> {
    /// Heap this packet belongs to.
    pub heap_cnt: HeapCnt,
    /// Declared total heap length, if the sender included it.
    pub heap_length: Option<u64>,
    /// Offset of `payload` within the heap.
    pub payload_offset: u64,
    /// Length of `payload` in bytes.
    pub payload_length: u64,
    /// Heap-address width of the flavour, in bits.
    pub heap_address_bits: u8,
    /// Number of item pointers in the packet.
    pub n_items: usize,
    /// Raw item-pointer region (8 bytes per item).
    pub pointers: &'a [u8],
    /// Payload region.
    pub payload: &'a [u8],
    /// The heap is finished; deliver it without waiting for more payload.
    pub is_heap_end: bool,
    /// End of stream: no further packets will follow.
    pub is_stream_end: bool,
}

impl<'a> PacketHeader<'a> {
    /// Encoded length of the whole packet. Readers compare this against the
    /// datagram length to detect mismatches.
    pub fn total_length(&self) -> usize {
        8 + 8 * self.n_items + self.payload_length as usize
    }

    /// Iterate over the packet's item pointers.
    pub fn item_pointers(&self) -> impl Iterator<Item = ItemPointer> + 'a {
        let address_bits = self.heap_address_bits;
        self.pointers.chunks_exact(8).map(move |c| {
            let raw = u64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]);
            ItemPointer::new(raw, address_bits)
        })
    }
}

/// Decode one packet from the start of `data`.
///
/// Trailing bytes after the packet are permitted (memory readers scan
/// concatenated packets); use [`PacketHeader::total_length`] to find the next
/// packet or to reject a datagram whose length does not match.
pub fn decode_packet(data: &[u8]) -> Result<PacketHeader<'_>, DecodeError> {
    if data.len() < 8 {
        return Err(DecodeError::TooShort);
    }
    if data[0] != MAGIC || data[1] != VERSION {
        return Err(DecodeError::BadMagic);
    }
    let id_bits = data[2] as i32 * 8 - 1;
    let address_bits = data[3] as i32 * 8;
    if id_bits <= 0 || address_bits <= 0 || id_bits + address_bits != 63 {
        return Err(DecodeError::BadFlavour {
            id_bits,
            address_bits,
        });
    }
    let heap_address_bits = data[3] * 8;
    let n_items = u16::from_be_bytes([data[6], data[7]]) as usize;

    let pointers_end = 8 + 8 * n_items;
    if data.len() < pointers_end {
        return Err(DecodeError::TruncatedPointers);
    }
    let pointers = &data[8..pointers_end];

    let mut heap_cnt: Option<u64> = None;
    let mut heap_length: Option<u64> = None;
    let mut payload_offset: Option<u64> = None;
    let mut payload_length: Option<u64> = None;
    let mut ctrl_flags: u64 = 0;

    for chunk in pointers.chunks_exact(8) {
        let raw = u64::from_be_bytes([
            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
        ]);
        let pointer = ItemPointer::new(raw, heap_address_bits);
        let id = pointer.id();
        let standard = matches!(
            id,
            item_id::HEAP_CNT
                | item_id::HEAP_LENGTH
                | item_id::PAYLOAD_OFFSET
                | item_id::PAYLOAD_LENGTH
                | item_id::STREAM_CTRL
        );
        if standard && !pointer.is_immediate() {
            return Err(DecodeError::ImmediateRequired { id });
        }
        match id {
            item_id::HEAP_CNT => heap_cnt = Some(pointer.value()),
            item_id::HEAP_LENGTH => heap_length = Some(pointer.value()),
            item_id::PAYLOAD_OFFSET => payload_offset = Some(pointer.value()),
            item_id::PAYLOAD_LENGTH => payload_length = Some(pointer.value()),
            item_id::STREAM_CTRL => ctrl_flags |= pointer.value(),
            _ => {}
        }
    }

    let heap_cnt = heap_cnt.ok_or(DecodeError::MissingItem {
        id: item_id::HEAP_CNT,
    })?;
    let payload_offset = payload_offset.ok_or(DecodeError::MissingItem {
        id: item_id::PAYLOAD_OFFSET,
    })?;
    let payload_length = payload_length.ok_or(DecodeError::MissingItem {
        id: item_id::PAYLOAD_LENGTH,
    })?;

    let need = payload_length as usize;
    let have = data.len() - pointers_end;
    if have < need {
        return Err(DecodeError::TruncatedPayload { have, need });
    }
    let payload = &data[pointers_end..pointers_end + need];

    Ok(PacketHeader {
        heap_cnt: heap_cnt as HeapCnt,
        heap_length,
        payload_offset,
        payload_length,
        heap_address_bits,
        n_items,
        pointers,
        payload,
        is_heap_end: ctrl_flags & ctrl::HEAP_END != 0,
        is_stream_end: ctrl_flags & ctrl::STREAM_STOP != 0,
    })
}
