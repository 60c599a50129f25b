//! UDP reader with batched receive.
//!
//! Each socket wakeup drains up to `mmsg_count` datagrams with non-blocking
//! receives into preallocated buffers of `max_size + 1` bytes (the extra
//! byte detects truncation), then processes the whole batch under the
//! stream mutex. When the stream pauses mid-batch the remaining datagrams
//! stay in the buffers (`resume_first`/`resume_last`) until the stream
//! resumes.

use crate::config::{MulticastInterface, UdpConfig};
use crate::error::{Error, Result};
use crate::reader::{Reader, ReaderState, StreamStatus};
use crate::stats::StreamStats;
use crate::stream::StreamCore;
use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use spead_proto::decode_packet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, trace, warn};

/// Create and configure the UDP socket for a reader.
///
/// Address reuse is always enabled so several processes can share a
/// multicast group. The requested receive buffer is read back afterwards:
/// Linux silently clips to the system maximum, and that is worth a warning
/// at these packet rates.
fn bind_udp_socket(config: &UdpConfig) -> Result<std::net::UdpSocket> {
    let domain = match config.endpoint {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    if config.buffer_size != 0 {
        if let Err(e) = socket.set_recv_buffer_size(config.buffer_size) {
            warn!(
                requested = config.buffer_size,
                error = %e,
                "request for receive buffer size failed"
            );
        } else {
            let actual = socket.recv_buffer_size()?;
            if actual < config.buffer_size {
                warn!(
                    requested = config.buffer_size,
                    actual,
                    "receive buffer clipped by the operating system"
                );
            }
        }
    }

    if config.endpoint.ip().is_multicast() {
        match (config.endpoint, config.interface) {
            (SocketAddr::V4(ep), Some(MulticastInterface::V4(interface))) => {
                socket.join_multicast_v4(ep.ip(), &interface)?;
            }
            (SocketAddr::V4(ep), None) => {
                socket.join_multicast_v4(ep.ip(), &std::net::Ipv4Addr::UNSPECIFIED)?;
            }
            (SocketAddr::V6(ep), Some(MulticastInterface::V6(index))) => {
                socket.join_multicast_v6(ep.ip(), index)?;
            }
            (SocketAddr::V6(ep), None) => {
                socket.join_multicast_v6(ep.ip(), 0)?;
            }
            _ => {
                // Family mismatches are caught by UdpConfig::validate.
                return Err(Error::InvalidArgument(
                    "multicast interface does not match endpoint family".into(),
                ));
            }
        }
    }

    socket.bind(&config.endpoint.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Asynchronous stream reader that receives packets over UDP.
pub struct UdpReader {
    wake: Arc<Notify>,
    pending: Option<Pending>,
    task: Option<tokio::task::JoinHandle<()>>,
    local_addr: SocketAddr,
}

struct Pending {
    core: Arc<Mutex<StreamCore>>,
    handle: tokio::runtime::Handle,
    socket: std::net::UdpSocket,
    config: UdpConfig,
}

impl UdpReader {
    pub(crate) fn new(
        core: Arc<Mutex<StreamCore>>,
        handle: tokio::runtime::Handle,
        config: UdpConfig,
    ) -> Result<Self> {
        let socket = bind_udp_socket(&config)?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            wake: Arc::new(Notify::new()),
            pending: Some(Pending {
                core,
                handle,
                socket,
                config,
            }),
            task: None,
            local_addr,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Reader for UdpReader {
    fn start(&mut self) -> Option<oneshot::Receiver<Result<()>>> {
        if let Some(pending) = self.pending.take() {
            let wake = self.wake.clone();
            let _guard = pending.handle.enter();
            match tokio::net::UdpSocket::from_std(pending.socket) {
                Ok(socket) => {
                    self.task = Some(pending.handle.spawn(run(
                        pending.core,
                        wake,
                        socket,
                        pending.config,
                    )));
                }
                Err(e) => {
                    let (tx, rx) = oneshot::channel();
                    let _ = tx.send(Err(Error::Io(e)));
                    return Some(rx);
                }
            }
        }
        None
    }

    fn state_change(&mut self, _status: StreamStatus) {
        self.wake.notify_one();
    }

    async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for UdpReader {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

enum BatchOutcome {
    Drained,
    Paused,
    Stopped,
}

/// Hand one datagram to the stream. Truncated, undecodable and
/// length-mismatched datagrams are logged and dropped; they must not take
/// the pipeline down.
fn process_one(core: &mut StreamCore, data: &[u8], max_size: usize) {
    if data.len() > max_size {
        info!(length = data.len(), max_size, "dropped packet due to truncation");
        return;
    }
    match decode_packet(data) {
        Ok(packet) => {
            if packet.total_length() == data.len() {
                core.add_packet(&packet);
            } else {
                info!(
                    expected = packet.total_length(),
                    actual = data.len(),
                    "discarding packet due to size mismatch"
                );
            }
        }
        Err(e) => {
            info!(error = %e, "discarding undecodable packet");
        }
    }
}

/// Process buffered datagrams in order until the batch drains or the stream
/// stops or pauses.
fn process_batch(
    core: &mut StreamCore,
    buffers: &[Vec<u8>],
    lengths: &[usize],
    first: &mut usize,
    last: usize,
    max_size: usize,
) -> BatchOutcome {
    while *first < last {
        if core.is_stopped() {
            debug!(
                discarded = last - *first,
                "discarding datagrams received after stream stopped"
            );
            *first = last;
            return BatchOutcome::Stopped;
        }
        if core.is_paused() {
            return BatchOutcome::Paused;
        }
        process_one(core, &buffers[*first][..lengths[*first]], max_size);
        *first += 1;
    }
    if core.is_stopped() {
        BatchOutcome::Stopped
    } else {
        BatchOutcome::Drained
    }
}

async fn run(
    core: Arc<Mutex<StreamCore>>,
    wake: Arc<Notify>,
    socket: tokio::net::UdpSocket,
    config: UdpConfig,
) {
    let mmsg_count = config.mmsg_count;
    let mut buffers = vec![vec![0u8; config.max_size + 1]; mmsg_count];
    let mut lengths = vec![0usize; mmsg_count];
    let mut first = 0usize;
    let mut last = 0usize;
    let mut state = ReaderState::Running;

    loop {
        match state {
            ReaderState::Running => {
                tokio::select! {
                    ready = socket.readable() => {
                        if let Err(e) = ready {
                            warn!(error = %e, "udp socket wait failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            if core.lock().is_stopped() {
                                state = ReaderState::Stopped;
                            }
                            continue;
                        }
                        first = 0;
                        last = 0;
                        while last < mmsg_count {
                            match socket.try_recv_from(&mut buffers[last]) {
                                Ok((n, _peer)) => {
                                    lengths[last] = n;
                                    last += 1;
                                }
                                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                                Err(e) => {
                                    warn!(error = %e, "udp receive failed");
                                    break;
                                }
                            }
                        }
                        if last == 0 {
                            continue;
                        }
                        trace!(count = last, "received datagram batch");
                        let outcome = {
                            let mut core = core.lock();
                            StreamStats::add(&core.stats().batches, 1);
                            process_batch(&mut core, &buffers, &lengths, &mut first, last, config.max_size)
                        };
                        match outcome {
                            BatchOutcome::Drained => {}
                            BatchOutcome::Paused => state = ReaderState::Paused,
                            BatchOutcome::Stopped => state = ReaderState::Stopped,
                        }
                    }
                    _ = wake.notified() => {
                        if core.lock().is_stopped() {
                            state = ReaderState::Stopped;
                        }
                    }
                }
            }
            ReaderState::Paused => {
                wake.notified().await;
                let outcome = {
                    let mut core = core.lock();
                    if core.is_stopped() {
                        BatchOutcome::Stopped
                    } else if core.is_paused() {
                        BatchOutcome::Paused
                    } else {
                        process_batch(&mut core, &buffers, &lengths, &mut first, last, config.max_size)
                    }
                };
                match outcome {
                    BatchOutcome::Drained => state = ReaderState::Running,
                    BatchOutcome::Paused => {}
                    BatchOutcome::Stopped => state = ReaderState::Stopped,
                }
            }
            ReaderState::Stopped => break,
        }
    }
    // Dropping the socket cancels anything outstanding.
    debug!("udp reader finished");
}
