//! # spead-proto: SPEAD wire format and heap reassembly
//!
//! Pure protocol crate for the SPEAD (Streaming Protocol for Exchange of
//! Astronomical Data) receive path. It contains no I/O, sockets or event
//! loops: bytes go in, decoded packets and reassembled heaps come out.
//!
//! ```text
//! spead-proto/
//! ├── error       - Typed decode and reassembly errors
//! ├── packet      - Zero-copy packet header and item-pointer decoding
//! ├── live_heap   - In-flight reassembly buffer for one heap
//! └── heap        - Frozen (immutable) heap with item access
//! ```
//!
//! ## Design principles
//!
//! 1. **Pure state machine**: deterministic transformations of input bytes;
//!    the receive pipeline (`spead-rx`) supplies threading and sockets.
//! 2. **Zero-copy parsing**: [`packet::decode_packet`] borrows item pointers
//!    and payload from the input buffer.
//! 3. **Typed rejection**: malformed input is reported through
//!    [`error::DecodeError`] / [`error::HeapError`] so the I/O layer can log
//!    and drop without tearing anything down.

#![no_std]
#![forbid(unsafe_code)]

extern crate alloc;

pub mod error;
pub mod heap;
pub mod live_heap;
pub mod packet;

#[cfg(test)]
pub(crate) mod test_util;

pub use error::{DecodeError, HeapError};
pub use heap::{Heap, Item, ItemValue};
pub use live_heap::LiveHeap;
pub use packet::{decode_packet, ItemPointer, PacketHeader};

/// Heap counter as carried on the wire. Negative values never appear in
/// packets; `-1` is used by consumers as an empty-slot sentinel.
pub type HeapCnt = i64;

/// Magic byte opening every SPEAD packet.
pub const MAGIC: u8 = 0x53;

/// Protocol version this crate speaks.
pub const VERSION: u8 = 4;

/// Reserved item identifiers.
pub mod item_id {
    /// Heap counter (required immediate).
    pub const HEAP_CNT: u64 = 0x01;
    /// Declared heap length (optional immediate).
    pub const HEAP_LENGTH: u64 = 0x02;
    /// Offset of this packet's payload within the heap (required immediate).
    pub const PAYLOAD_OFFSET: u64 = 0x03;
    /// Length of this packet's payload (required immediate).
    pub const PAYLOAD_LENGTH: u64 = 0x04;
    /// Item descriptor (addressed; payload holds the descriptor).
    pub const DESCRIPTOR: u64 = 0x05;
    /// Stream control flags (immediate, see [`crate::ctrl`]).
    pub const STREAM_CTRL: u64 = 0x06;
}

/// Bits of the `STREAM_CTRL` immediate value.
pub mod ctrl {
    /// The heap this packet belongs to is finished and may be delivered even
    /// if its declared length has not been reached.
    pub const HEAP_END: u64 = 0x1;
    /// End of stream: the receiver stops after processing this packet.
    pub const STREAM_STOP: u64 = 0x2;
}

/// Mask of protocol-bug compatibility flags, applied when interpreting
/// descriptors in frozen heaps. Carried through reassembly untouched.
pub type BugCompatMask = u8;

/// Known compatibility flags for senders with historical protocol bugs.
pub mod bug_compat {
    /// Descriptors use nonstandard field widths.
    pub const DESCRIPTOR_WIDTHS: u8 = 0x1;
    /// Shape fields set bit 1 instead of bit 0 for variable dimensions.
    pub const SHAPE_BIT_1: u8 = 0x2;
    /// Immediate values are byte-swapped.
    pub const SWAP_ENDIAN: u8 = 0x4;
}
