//! Shared kernel-bypass receive path.
//!
//! Bypass technologies (netmap, DPDK, AF_XDP, ...) deliver every frame that
//! arrives at an interface, so one receiver per interface has to be shared
//! by all stream endpoints on it. A [`BypassService`] owns that receiver: a
//! dedicated worker thread that polls the technology driver, filters frames
//! down to plain IPv4/UDP (see [`frame`]) and dispatches by
//! `(destination address, destination port)`, with `0.0.0.0` acting as a
//! port-wide wildcard.
//!
//! The endpoint map is touched only on the worker thread; registrations and
//! removals travel to it over a command queue and report back through
//! completion futures. This keeps the per-frame dispatch free of locks.
//!
//! Services are shared through a process-wide registry keyed by
//! `(technology, interface)`, holding weak references: readers hold the
//! strong ones, and when the last reader lets go the worker is stopped and
//! joined. Technology drivers themselves are out of tree; they plug in
//! through [`BypassTechnology`] and [`register_technology`].

mod frame;

use crate::error::{Error, Result};
use crate::reader::{Reader, StreamStatus};
use crate::stream::StreamCore;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use spead_proto::decode_packet;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// How long the worker blocks in the driver before re-checking its command
/// queue and stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Frame source for one interface, produced by a [`BypassTechnology`].
///
/// Implementations must deliver complete layer-2 frames. A frame for which
/// `sink` returns `false` was not consumed and must be re-inserted into the
/// host network stack if the technology supports it.
pub trait BypassDriver: Send {
    /// Wait up to `timeout` for frames and feed each to `sink`. Returns the
    /// number of frames delivered.
    fn poll(
        &mut self,
        timeout: Duration,
        sink: &mut dyn FnMut(&[u8]) -> bool,
    ) -> io::Result<usize>;
}

/// Factory for [`BypassDriver`] instances.
///
/// Implementations bring up their NIC handle in [`Self::open`] and tear it
/// down when the returned driver is dropped (after the service worker has
/// been joined, so no `poll` is in flight).
pub trait BypassTechnology: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, interface: &str) -> io::Result<Box<dyn BypassDriver>>;
}

struct Registry {
    technologies: HashMap<&'static str, Arc<dyn BypassTechnology>>,
    services: HashMap<(String, String), Weak<BypassService>>,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| {
    Mutex::new(Registry {
        technologies: HashMap::new(),
        services: HashMap::new(),
    })
});

/// Register a bypass technology under its name.
pub fn register_technology(technology: Arc<dyn BypassTechnology>) -> Result<()> {
    let mut registry = REGISTRY.lock();
    let name = technology.name();
    if registry.technologies.contains_key(name) {
        return Err(Error::InvalidArgument(format!(
            "bypass technology `{name}` is already registered"
        )));
    }
    registry.technologies.insert(name, technology);
    Ok(())
}

/// Names of the registered bypass technologies, sorted.
pub fn bypass_types() -> Vec<String> {
    let registry = REGISTRY.lock();
    let mut names: Vec<String> = registry
        .technologies
        .keys()
        .map(|n| n.to_string())
        .collect();
    names.sort();
    names
}

/// Dispatch target for one registered endpoint.
///
/// Holds a weak stream reference: the service worker must never keep a
/// stream alive, and an endpoint whose stream is gone simply stops
/// consuming.
struct PacketHandler {
    core: Weak<Mutex<StreamCore>>,
}

impl PacketHandler {
    /// Decode outside the stream mutex, then hand over under it, honouring
    /// the stopped/paused gates. Returns whether the frame was consumed.
    fn process_packet(&self, data: &[u8]) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        match decode_packet(data) {
            Ok(packet) => {
                if packet.total_length() == data.len() {
                    let mut core = core.lock();
                    if core.is_stopped() || core.is_paused() {
                        trace!(cnt = packet.heap_cnt, "dropping bypass packet while unavailable");
                    } else {
                        core.add_packet(&packet);
                    }
                } else {
                    info!(
                        expected = packet.total_length(),
                        actual = data.len(),
                        "discarding packet due to size mismatch"
                    );
                }
            }
            Err(e) => {
                debug!(error = %e, "discarding undecodable bypass packet");
            }
        }
        true
    }
}

/// Identifies one registration, so a removal can never tear down an
/// endpoint that a different reader registered (e.g. after a failed
/// duplicate registration).
type RegistrationToken = u64;

static NEXT_TOKEN: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

enum Command {
    Add {
        endpoint: SocketAddrV4,
        token: RegistrationToken,
        handler: PacketHandler,
        reply: oneshot::Sender<Result<()>>,
    },
    Remove {
        endpoint: SocketAddrV4,
        token: RegistrationToken,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Interface-wide demultiplexer shared by the bypass readers on one
/// `(technology, interface)` pair.
pub struct BypassService {
    commands: crossbeam_channel::Sender<Command>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    key: (String, String),
}

impl BypassService {
    /// Fetch the shared service for `(technology, interface)`, creating it
    /// (and its worker) on first use.
    pub fn for_interface(technology: &str, interface: &str) -> Result<Arc<BypassService>> {
        let mut registry = REGISTRY.lock();
        let key = (technology.to_string(), interface.to_string());
        if let Some(existing) = registry.services.get(&key).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let tech = registry
            .technologies
            .get(technology)
            .cloned()
            .ok_or_else(|| Error::UnknownTechnology(technology.to_string()))?;
        let driver = tech.open(interface)?;

        let (commands, command_rx) = crossbeam_channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let thread_name = format!("bypass-{technology}-{interface}");
        let worker = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker_loop(driver, command_rx, worker_stop))?;

        let service = Arc::new(BypassService {
            commands,
            stop,
            worker: Mutex::new(Some(worker)),
            key: key.clone(),
        });
        registry.services.insert(key, Arc::downgrade(&service));
        debug!(technology, interface, "bypass service started");
        Ok(service)
    }

    fn add_endpoint(
        &self,
        endpoint: SocketAddrV4,
        token: RegistrationToken,
        handler: PacketHandler,
    ) -> oneshot::Receiver<Result<()>> {
        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Add {
            endpoint,
            token,
            handler,
            reply,
        });
        rx
    }

    fn remove_endpoint(
        &self,
        endpoint: SocketAddrV4,
        token: RegistrationToken,
    ) -> oneshot::Receiver<Result<()>> {
        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Remove {
            endpoint,
            token,
            reply,
        });
        rx
    }
}

impl Drop for BypassService {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("bypass worker thread panicked");
            }
        }
        let mut registry = REGISTRY.lock();
        if let Some(entry) = registry.services.get(&self.key) {
            if entry.upgrade().is_none() {
                registry.services.remove(&self.key);
            }
        }
        debug!(technology = %self.key.0, interface = %self.key.1, "bypass service stopped");
    }
}

/// The service's serialization domain: a single thread that owns the
/// endpoint map, applies registration commands and dispatches frames.
fn worker_loop(
    mut driver: Box<dyn BypassDriver>,
    commands: crossbeam_channel::Receiver<Command>,
    stop: Arc<AtomicBool>,
) {
    let mut endpoints: HashMap<SocketAddrV4, (RegistrationToken, PacketHandler)> = HashMap::new();
    while !stop.load(Ordering::Relaxed) {
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Add {
                    endpoint,
                    token,
                    handler,
                    reply,
                } => {
                    let result = if endpoints.contains_key(&endpoint) {
                        Err(Error::InvalidArgument(format!(
                            "endpoint {endpoint} is already registered"
                        )))
                    } else {
                        endpoints.insert(endpoint, (token, handler));
                        Ok(())
                    };
                    let _ = reply.send(result);
                }
                Command::Remove {
                    endpoint,
                    token,
                    reply,
                } => {
                    let result = match endpoints.get(&endpoint) {
                        Some((owner, _)) if *owner == token => {
                            endpoints.remove(&endpoint);
                            Ok(())
                        }
                        _ => Err(Error::InvalidArgument(format!(
                            "endpoint {endpoint} is not registered"
                        ))),
                    };
                    let _ = reply.send(result);
                }
            }
        }

        let polled = driver.poll(POLL_INTERVAL, &mut |raw| dispatch(&endpoints, raw));
        if let Err(e) = polled {
            warn!(error = %e, "bypass driver poll failed");
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Match a frame to a registered endpoint: exact first, then the
/// `0.0.0.0` wildcard on the same port.
fn dispatch(
    endpoints: &HashMap<SocketAddrV4, (RegistrationToken, PacketHandler)>,
    raw: &[u8],
) -> bool {
    let Some(parsed) = frame::parse_udp_frame(raw) else {
        return false;
    };
    let handler = endpoints.get(&parsed.destination).or_else(|| {
        endpoints.get(&SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            parsed.destination.port(),
        ))
    });
    match handler {
        Some((_, handler)) => handler.process_packet(parsed.payload),
        None => false,
    }
}

/// Reader registered with a bypass service for one endpoint.
pub struct BypassReader {
    service: Option<Arc<BypassService>>,
    endpoint: SocketAddrV4,
    token: RegistrationToken,
    start_rx: Option<oneshot::Receiver<Result<()>>>,
    removal: Option<oneshot::Receiver<Result<()>>>,
    core: Weak<Mutex<StreamCore>>,
    removed: bool,
}

impl BypassReader {
    pub(crate) fn new(
        core: &Arc<Mutex<StreamCore>>,
        technology: &str,
        interface: &str,
        endpoint: SocketAddr,
    ) -> Result<Self> {
        let SocketAddr::V4(endpoint) = endpoint else {
            return Err(Error::InvalidArgument(
                "only IPv4 addresses can be used with bypass".into(),
            ));
        };
        let service = BypassService::for_interface(technology, interface)?;
        Ok(Self {
            service: Some(service),
            endpoint,
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            start_rx: None,
            removal: None,
            core: Arc::downgrade(core),
            removed: false,
        })
    }
}

#[async_trait]
impl Reader for BypassReader {
    fn start(&mut self) -> Option<oneshot::Receiver<Result<()>>> {
        if let Some(service) = &self.service {
            let handler = PacketHandler {
                core: self.core.clone(),
            };
            self.start_rx = Some(service.add_endpoint(self.endpoint, self.token, handler));
        }
        self.start_rx.take()
    }

    fn state_change(&mut self, status: StreamStatus) {
        if status.stopped && !self.removed {
            self.removed = true;
            if let Some(service) = &self.service {
                self.removal = Some(service.remove_endpoint(self.endpoint, self.token));
            }
        }
    }

    async fn join(&mut self) {
        if let Some(removal) = self.removal.take() {
            let _ = removal.await;
        }
        // Releasing the service reference here, outside the stream mutex:
        // if this was the last reader the worker is joined, and the worker
        // may be blocked acquiring a stream mutex in a dispatch handler.
        self.service.take();
    }
}

impl Drop for BypassReader {
    fn drop(&mut self) {
        if !self.removed {
            if let Some(service) = &self.service {
                // Best effort; a registration that never succeeded matches
                // no token and is ignored by the worker.
                let _ = service.remove_endpoint(self.endpoint, self.token);
            }
        }
    }
}
