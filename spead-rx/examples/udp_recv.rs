//! Minimal SPEAD receiver: listen on a UDP endpoint, pop heaps until the
//! sender signals end of stream, then print the stream counters.
//!
//! Usage: udp_recv [endpoint]        (default 127.0.0.1:8888)

use anyhow::Result;
use spead_rx::{Error, RingConfig, RingStream, StreamConfig, UdpConfig};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let endpoint: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8888".to_string())
        .parse()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let stream = RingStream::new(
        runtime.handle().clone(),
        StreamConfig::default(),
        RingConfig::default(),
    )?;
    let local = runtime.block_on(stream.add_udp_reader(UdpConfig::new(endpoint)))?;
    info!(%local, "listening");

    loop {
        match stream.pop() {
            Ok(heap) => {
                info!(
                    cnt = heap.cnt(),
                    bytes = heap.payload().len(),
                    items = heap.items().len(),
                    complete = heap.is_complete(),
                    "heap"
                );
            }
            Err(Error::RingStopped) => break,
            Err(e) => return Err(e.into()),
        }
    }

    runtime.block_on(stream.stop());
    let stats = stream.stats();
    info!(
        packets = stats.packets,
        complete = stats.complete_heaps,
        incomplete = stats.incomplete_heaps,
        dropped = stats.dropped_heaps,
        "stream finished"
    );
    Ok(())
}
