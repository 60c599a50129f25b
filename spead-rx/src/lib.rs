//! # spead-rx: SPEAD receive pipeline
//!
//! Reassembles high-rate SPEAD telemetry packets into heaps and delivers
//! them to consumers, either through a [`HeapSink`] callback or through a
//! bounded blocking ring ([`RingStream`]).
//!
//! ```text
//! spead-rx/
//! ├── error    - Library error type
//! ├── config   - Stream / ring / UDP reader configuration
//! ├── stream   - Stream core: live-heap table, resume queue, heap sink hook
//! ├── ring     - Bounded heap ring and the ring stream built on it
//! ├── reader   - Reader lifecycle contract (RUNNING / PAUSED / STOPPED)
//! ├── udp      - UDP reader with batched receive and multicast support
//! ├── mem      - Memory reader draining an in-memory buffer
//! ├── bypass   - Shared kernel-bypass service, frame filter and reader
//! └── stats    - Per-stream counters
//! ```
//!
//! Dataflow: raw bytes → reader decode → [`StreamCore::add_packet`] →
//! live-heap table → `heap_ready` → sink or ring → consumer `pop`.
//!
//! ## Concurrency model
//!
//! Readers are tokio tasks sharing the runtime's worker threads; mutual
//! exclusion inside a stream comes from its mutex, which is held across
//! `add_packet`, `heap_ready` and `resume` but never across a blocking wait.
//! Each bypass service pins its dispatch to one worker thread so the hot
//! path needs no lock. When a downstream consumer stalls, the stream pauses
//! and its readers stop draining the network until space opens up again.
//!
//! ## Example
//!
//! ```no_run
//! use spead_rx::{RingStream, RingConfig, StreamConfig, UdpConfig};
//!
//! # async fn demo() -> Result<(), spead_rx::Error> {
//! let stream = RingStream::new(
//!     tokio::runtime::Handle::current(),
//!     StreamConfig::default(),
//!     RingConfig::default(),
//! )?;
//! stream.add_udp_reader(UdpConfig::new("239.1.2.3:8888".parse().unwrap())).await?;
//! // Blocking consumer, typically on its own thread:
//! while let Ok(heap) = stream.pop() {
//!     println!("heap {} ({} bytes)", heap.cnt(), heap.payload().len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod bypass;
pub mod config;
#[cfg(test)]
pub(crate) mod test_util;
pub mod error;
pub mod mem;
pub mod reader;
pub mod ring;
pub mod stats;
pub mod stream;
pub mod udp;

pub use config::{MulticastInterface, RingConfig, StreamConfig, UdpConfig};
pub use error::{Error, Result};
pub use reader::{Reader, ReaderState, StreamStatus};
pub use ring::RingStream;
pub use stats::{StatsSnapshot, StreamStats};
pub use stream::{mem_to_stream, HeapSink, SinkStatus, Stream, StreamCore};

pub use bypass::{bypass_types, register_technology, BypassDriver, BypassService, BypassTechnology};

/// Re-export of the wire-format crate.
pub use spead_proto as proto;
pub use spead_proto::{Heap, LiveHeap};
