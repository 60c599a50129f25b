//! Error types for packet decoding and heap reassembly.

use thiserror::Error;

/// Reasons a byte buffer is rejected by [`crate::decode_packet`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer shorter than the 8-byte packet header.
    #[error("packet shorter than the fixed header")]
    TooShort,

    /// Magic byte or protocol version did not match.
    #[error("bad magic or version")]
    BadMagic,

    /// Item-pointer id width and heap-address width do not describe a
    /// 64-bit pointer.
    #[error("unsupported flavour: {id_bits} id bits + {address_bits} address bits")]
    BadFlavour { id_bits: i32, address_bits: i32 },

    /// Buffer ends before the declared item pointers.
    #[error("packet truncated inside the item pointers")]
    TruncatedPointers,

    /// Buffer ends before the declared payload.
    #[error("packet payload truncated ({have} of {need} bytes)")]
    TruncatedPayload { have: usize, need: usize },

    /// A required standard item was missing.
    #[error("required item {id:#x} missing")]
    MissingItem { id: u64 },

    /// A standard item that must be immediate was sent in addressed mode.
    #[error("item {id:#x} must be immediate")]
    ImmediateRequired { id: u64 },
}

/// Reasons a decoded packet is rejected by [`crate::LiveHeap::add_packet`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// Packet belongs to a different heap.
    #[error("heap cnt mismatch (packet {packet}, heap {heap})")]
    CntMismatch { packet: i64, heap: i64 },

    /// Packet declares a heap length that conflicts with what an earlier
    /// packet declared.
    #[error("heap length mismatch (packet {packet}, heap {heap})")]
    LengthMismatch { packet: u64, heap: u64 },

    /// Payload extends past the declared heap length.
    #[error("payload [{offset}, {offset}+{length}) exceeds heap length {heap_length}")]
    PayloadOverrun {
        offset: u64,
        length: u64,
        heap_length: u64,
    },

    /// A packet with this payload offset was already received.
    #[error("duplicate packet at payload offset {offset}")]
    Duplicate { offset: u64 },
}
