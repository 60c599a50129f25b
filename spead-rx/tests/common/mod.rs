//! Shared helpers for integration tests: SPEAD packet and Ethernet frame
//! construction, plus an in-memory bypass technology.

#![allow(dead_code)]

use parking_lot::Mutex;
use spead_rx::{BypassDriver, BypassTechnology};
use std::io;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

pub mod item_id {
    pub const HEAP_CNT: u64 = 0x01;
    pub const HEAP_LENGTH: u64 = 0x02;
    pub const PAYLOAD_OFFSET: u64 = 0x03;
    pub const PAYLOAD_LENGTH: u64 = 0x04;
    pub const STREAM_CTRL: u64 = 0x06;
}

pub const CTRL_HEAP_END: u64 = 0x1;
pub const CTRL_STREAM_STOP: u64 = 0x2;

fn pointer(immediate: bool, id: u64, value: u64) -> u64 {
    ((immediate as u64) << 63) | (id << 48) | (value & ((1u64 << 48) - 1))
}

fn build(pointers: Vec<u64>, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x53, 0x04, 2, 6, 0, 0, 0, pointers.len() as u8];
    for p in pointers {
        out.extend_from_slice(&p.to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

/// One packet carrying a payload fragment of heap `cnt`.
pub fn packet(cnt: i64, offset: u64, heap_length: u64, payload: &[u8]) -> Vec<u8> {
    build(
        vec![
            pointer(true, item_id::HEAP_CNT, cnt as u64),
            pointer(true, item_id::PAYLOAD_OFFSET, offset),
            pointer(true, item_id::PAYLOAD_LENGTH, payload.len() as u64),
            pointer(true, item_id::HEAP_LENGTH, heap_length),
        ],
        payload,
    )
}

/// A payload-less control packet.
pub fn ctrl_packet(cnt: i64, flags: u64) -> Vec<u8> {
    build(
        vec![
            pointer(true, item_id::HEAP_CNT, cnt as u64),
            pointer(true, item_id::PAYLOAD_OFFSET, 0),
            pointer(true, item_id::PAYLOAD_LENGTH, 0),
            pointer(true, item_id::STREAM_CTRL, flags),
        ],
        &[],
    )
}

/// Wrap a UDP payload in Ethernet + IPv4 + UDP headers, as a bypass driver
/// would deliver it.
pub fn udp_frame(destination: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(42 + payload.len());
    frame.extend_from_slice(&[0u8; 12]);
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    let total = (20 + 8 + payload.len()) as u16;
    frame.push(0x45);
    frame.push(0);
    frame.extend_from_slice(&total.to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0, 0]);
    frame.push(64);
    frame.push(17);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&[10, 0, 0, 1]);
    frame.extend_from_slice(&destination.ip().octets());
    frame.extend_from_slice(&40000u16.to_be_bytes());
    frame.extend_from_slice(&destination.port().to_be_bytes());
    frame.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(payload);
    frame
}

/// Bypass technology fed from a channel, recording unconsumed frames.
pub struct MockTech {
    name: &'static str,
    frames: crossbeam_channel::Receiver<Vec<u8>>,
    pub forwarded: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockTech {
    /// Returns the technology and the sender used to inject frames.
    pub fn new(name: &'static str) -> (Arc<MockTech>, crossbeam_channel::Sender<Vec<u8>>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let tech = Arc::new(MockTech {
            name,
            frames: rx,
            forwarded: Arc::new(Mutex::new(Vec::new())),
        });
        (tech, tx)
    }
}

impl BypassTechnology for MockTech {
    fn name(&self) -> &'static str {
        self.name
    }

    fn open(&self, _interface: &str) -> io::Result<Box<dyn BypassDriver>> {
        Ok(Box::new(MockDriver {
            frames: self.frames.clone(),
            forwarded: self.forwarded.clone(),
        }))
    }
}

struct MockDriver {
    frames: crossbeam_channel::Receiver<Vec<u8>>,
    forwarded: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BypassDriver for MockDriver {
    fn poll(
        &mut self,
        timeout: Duration,
        sink: &mut dyn FnMut(&[u8]) -> bool,
    ) -> io::Result<usize> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => {
                let mut count = 1;
                if !sink(&frame) {
                    self.forwarded.lock().push(frame);
                }
                while let Ok(frame) = self.frames.try_recv() {
                    count += 1;
                    if !sink(&frame) {
                        self.forwarded.lock().push(frame);
                    }
                }
                Ok(count)
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(0),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                Ok(0)
            }
        }
    }
}

/// Poll `predicate` until it holds or the deadline passes.
pub async fn wait_until(predicate: impl Fn() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(
            std::time::Instant::now() < deadline,
            "condition not reached within deadline"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
