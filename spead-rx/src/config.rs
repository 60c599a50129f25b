//! Configuration for streams, rings and readers.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::net::Ipv4Addr;

/// Stream-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Mask of protocol-bug compatibility flags, carried through to frozen
    /// heaps (see [`spead_proto::bug_compat`]).
    pub bug_compat: u8,

    /// Size of the live-heap table. Bounds the memory held by heaps with
    /// lost packets: the oldest slot is recycled when the table is full.
    pub max_heaps: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bug_compat: 0,
            max_heaps: 4,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_heaps == 0 {
            return Err(Error::InvalidArgument("max_heaps must be at least 1".into()));
        }
        Ok(())
    }
}

/// Ring-stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Capacity of the bounded handoff ring.
    pub ring_heaps: usize,

    /// Drop non-contiguous heaps instead of pushing them to the ring.
    pub contiguous_only: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            ring_heaps: 4,
            contiguous_only: true,
        }
    }
}

impl RingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ring_heaps == 0 {
            return Err(Error::InvalidArgument("ring_heaps must be at least 1".into()));
        }
        Ok(())
    }
}

/// Interface selection for a multicast subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum MulticastInterface {
    /// IPv4 interface, identified by its address.
    V4(Ipv4Addr),
    /// IPv6 interface, identified by its index (see `if_nametoindex(3)`).
    V6(u32),
}

/// UDP reader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Address to listen on. A multicast address subscribes to the group
    /// with address-reuse enabled, so several processes can share it.
    pub endpoint: SocketAddr,

    /// Interface for the multicast subscription. Leave `None` to let the
    /// system pick one. Invalid for unicast endpoints.
    pub interface: Option<MulticastInterface>,

    /// Largest datagram that will be accepted; larger ones are dropped as
    /// truncated.
    pub max_size: usize,

    /// Requested kernel receive-buffer size. The operating system may clip
    /// it; a warning is logged when it does. `0` leaves the default.
    pub buffer_size: usize,

    /// Maximum datagrams drained per socket wakeup.
    pub mmsg_count: usize,
}

impl UdpConfig {
    pub const DEFAULT_MAX_SIZE: usize = 9200;
    pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024 * 1024;
    pub const DEFAULT_MMSG_COUNT: usize = 64;

    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            interface: None,
            max_size: Self::DEFAULT_MAX_SIZE,
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
            mmsg_count: Self::DEFAULT_MMSG_COUNT,
        }
    }

    pub fn with_interface(mut self, interface: MulticastInterface) -> Self {
        self.interface = Some(interface);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::InvalidArgument("max_size must be nonzero".into()));
        }
        if self.mmsg_count == 0 {
            return Err(Error::InvalidArgument("mmsg_count must be at least 1".into()));
        }
        if self.interface.is_some() && !self.endpoint.ip().is_multicast() {
            return Err(Error::InvalidArgument(
                "interface given but endpoint is not a multicast address".into(),
            ));
        }
        match (self.interface, &self.endpoint) {
            (Some(MulticastInterface::V4(_)), SocketAddr::V6(_)) => Err(Error::InvalidArgument(
                "IPv4 interface address given for an IPv6 endpoint".into(),
            )),
            (Some(MulticastInterface::V6(_)), SocketAddr::V4(_)) => Err(Error::InvalidArgument(
                "IPv6 interface index given for an IPv4 endpoint".into(),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = StreamConfig::default();
        assert_eq!(s.max_heaps, 4);
        assert_eq!(s.bug_compat, 0);
        let r = RingConfig::default();
        assert_eq!(r.ring_heaps, 4);
        assert!(r.contiguous_only);
        let u = UdpConfig::new("127.0.0.1:8888".parse().unwrap());
        assert_eq!(u.max_size, 9200);
        assert_eq!(u.buffer_size, 8 * 1024 * 1024);
        assert_eq!(u.mmsg_count, 64);
    }

    #[test]
    fn test_rejects_zero_sizes() {
        let s = StreamConfig {
            max_heaps: 0,
            ..Default::default()
        };
        assert!(s.validate().is_err());
        let r = RingConfig {
            ring_heaps: 0,
            ..Default::default()
        };
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_rejects_interface_on_unicast() {
        let cfg = UdpConfig::new("127.0.0.1:8888".parse().unwrap())
            .with_interface(MulticastInterface::V4(Ipv4Addr::UNSPECIFIED));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_family_mismatch() {
        let cfg = UdpConfig::new("[ff02::1]:8888".parse().unwrap())
            .with_interface(MulticastInterface::V4(Ipv4Addr::UNSPECIFIED));
        assert!(cfg.validate().is_err());
        let cfg = UdpConfig::new("239.1.2.3:8888".parse().unwrap())
            .with_interface(MulticastInterface::V6(2));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_multicast_interface_ok() {
        let cfg = UdpConfig::new("239.1.2.3:8888".parse().unwrap())
            .with_interface(MulticastInterface::V4(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(cfg.validate().is_ok());
    }
}
