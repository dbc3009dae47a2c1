//! Pooled packet buffers and the core flow identity types.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn protocol_number(self) -> u8 {
        match self {
            Transport::Tcp => 6,
            Transport::Udp => 17,
        }
    }
}

/// The 6-field tuple identifying a flow. Derived from each IP packet and
/// never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub version: IpVersion,
    pub transport: Transport,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(transport: Transport, src: IpAddr, src_port: u16, dst: IpAddr, dst_port: u16) -> Self {
        Self {
            version: IpVersion::of(&src),
            transport,
            src,
            dst,
            src_port,
            dst_port,
        }
    }

    /// Stable byte serialisation used by the FNV-1a flow hash.
    pub fn hash_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(38);
        bytes.push(match self.version {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        });
        bytes.push(self.transport.protocol_number());
        match self.src {
            IpAddr::V4(v4) => bytes.extend_from_slice(&v4.octets()),
            IpAddr::V6(v6) => bytes.extend_from_slice(&v6.octets()),
        }
        match self.dst {
            IpAddr::V4(v4) => bytes.extend_from_slice(&v4.octets()),
            IpAddr::V6(v6) => bytes.extend_from_slice(&v6.octets()),
        }
        bytes.extend_from_slice(&self.src_port.to_be_bytes());
        bytes.extend_from_slice(&self.dst_port.to_be_bytes());
        bytes
    }
}

struct PoolInner {
    free: Vec<Vec<u8>>,
    in_flight_bytes: usize,
}

/// Bounded pool of reusable byte buffers. Exhaustion is a drop with a counter
/// bump at the call site, never a failure.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    budget_bytes: usize,
    buffer_capacity: usize,
}

impl BufferPool {
    pub fn new(budget_bytes: usize, buffer_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                in_flight_bytes: 0,
            }),
            budget_bytes: budget_bytes.max(buffer_capacity),
            buffer_capacity: buffer_capacity.max(64),
        }
    }

    /// Hands out an empty buffer with at least `self.buffer_capacity` bytes of
    /// capacity, or `None` once the byte budget is exhausted.
    pub fn acquire(&self) -> Option<Vec<u8>> {
        let mut guard = self.inner.lock();
        if let Some(mut buffer) = guard.free.pop() {
            buffer.clear();
            return Some(buffer);
        }
        if guard.in_flight_bytes + self.buffer_capacity > self.budget_bytes {
            return None;
        }
        guard.in_flight_bytes += self.buffer_capacity;
        Some(Vec::with_capacity(self.buffer_capacity))
    }

    pub fn release(&self, buffer: Vec<u8>) {
        let mut guard = self.inner.lock();
        if buffer.capacity() <= self.buffer_capacity * 2 {
            guard.free.push(buffer);
        } else {
            // Oversized buffers are returned to the allocator.
            guard.in_flight_bytes = guard.in_flight_bytes.saturating_sub(self.buffer_capacity);
        }
    }

    pub fn in_flight_bytes(&self) -> usize {
        self.inner.lock().in_flight_bytes
    }
}
