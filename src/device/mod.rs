//! Virtual tun device: a bounded, bidirectional queue of IP frames between
//! the host packet flow and the engine. Provides the smoltcp `Device`
//! implementation driven by the poll loop plus a lightweight handle the host
//! and engine threads use to inject inbound packets or flush emitted frames.

use crate::logger::{self, BreadcrumbFlags};
use parking_lot::Mutex;
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};
use tokio::sync::Notify;

pub const DEFAULT_MTU: usize = 1500;
pub const RING_CAPACITY: usize = 512;
/// Emit at most this many frames per flush batch.
pub const MAX_EMIT_BATCH: usize = 64;
/// Flush a partial batch once its oldest frame is this old.
pub const MAX_BATCH_AGE: Duration = Duration::from_micros(100);
/// Pending-byte ceiling multiplier over the MTU.
pub const PENDING_BYTES_PER_MTU: usize = 512;

/// Address-family words prepended to emitted frames for datagram socket
/// pairs. These are the Darwin values the packet-tunnel facility expects.
pub const AF_INET_WORD: u32 = 2;
pub const AF_INET6_WORD: u32 = 30;

/// Host-installed consumer of emitted IP frames.
pub trait PacketSink: Send + Sync {
    fn emit_frames(&self, frames: &[Vec<u8>]);
}

struct SharedRing {
    inbound: VecDeque<Vec<u8>>,
    inbound_bytes: usize,
    outbound: VecDeque<(Vec<u8>, StdInstant)>,
    outbound_bytes: usize,
    capacity: usize,
}

impl SharedRing {
    fn new(capacity: usize) -> Self {
        Self {
            inbound: VecDeque::with_capacity(capacity),
            inbound_bytes: 0,
            outbound: VecDeque::with_capacity(capacity),
            outbound_bytes: 0,
            capacity,
        }
    }

    fn pending_bytes(&self) -> usize {
        self.inbound_bytes + self.outbound_bytes
    }
}

struct DeviceShared {
    ring: Mutex<SharedRing>,
    wake: Arc<Notify>,
    stopped: AtomicBool,
    inbound_drops: AtomicU64,
    outbound_drops: AtomicU64,
    sink: Mutex<Option<Arc<dyn PacketSink>>>,
    mtu: usize,
    max_pending_bytes: usize,
    /// Prepend the 4-byte AF word when the host reads from a datagram
    /// socket pair.
    af_prefix: bool,
}

/// Device exposed to smoltcp. All state lives in the shared core so the
/// device itself stays `Clone` + lightweight.
#[derive(Clone)]
pub struct TunDevice {
    shared: Arc<DeviceShared>,
}

/// Handle used by the host side and engine threads without borrowing the
/// smoltcp device mutably.
#[derive(Clone)]
pub struct TunHandle {
    shared: Arc<DeviceShared>,
}

impl TunDevice {
    pub fn new(mtu: usize, wake: Arc<Notify>, ring_capacity: usize, af_prefix: bool) -> Self {
        let mtu = mtu.max(576);
        let shared = Arc::new(DeviceShared {
            ring: Mutex::new(SharedRing::new(ring_capacity.max(16))),
            wake,
            stopped: AtomicBool::new(false),
            inbound_drops: AtomicU64::new(0),
            outbound_drops: AtomicU64::new(0),
            sink: Mutex::new(None),
            mtu,
            max_pending_bytes: mtu * PENDING_BYTES_PER_MTU,
            af_prefix,
        });
        Self { shared }
    }

    pub fn handle(&self) -> TunHandle {
        TunHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn device_capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = self.shared.mtu;
        caps.medium = Medium::Ip;
        caps
    }
}

impl TunHandle {
    /// Installs the host callback that receives emitted frames.
    pub fn start_read_loop(&self, sink: Arc<dyn PacketSink>) {
        *self.shared.sink.lock() = Some(sink);
        logger::breadcrumb(
            BreadcrumbFlags::DEVICE,
            "packet sink installed".to_string(),
        );
    }

    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.wake.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// True while pending bytes exceed the device ceiling.
    pub fn is_backpressured(&self) -> bool {
        self.shared.ring.lock().pending_bytes() > self.shared.max_pending_bytes
    }

    pub fn inbound_drops(&self) -> u64 {
        self.shared.inbound_drops.load(Ordering::Relaxed)
    }

    pub fn outbound_drops(&self) -> u64 {
        self.shared.outbound_drops.load(Ordering::Relaxed)
    }

    /// Non-blocking inject from the host read loop. A full queue or a
    /// stopped device drops the packet with a counter bump.
    pub fn inject(&self, packet: &[u8]) -> bool {
        if packet.is_empty() {
            return true;
        }
        if self.is_stopped() || !validate_packet(packet) {
            self.shared.inbound_drops.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let capped = packet.len().min(self.shared.mtu);
        {
            let mut ring = self.shared.ring.lock();
            if ring.pending_bytes() + capped > self.shared.max_pending_bytes
                || ring.inbound.len() >= ring.capacity
            {
                drop(ring);
                self.shared.inbound_drops.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            ring.inbound_bytes += capped;
            ring.inbound.push_back(packet[..capped].to_vec());
        }
        self.shared.wake.notify_one();
        true
    }

    /// Enqueues a frame generated by the stack for emission to the host.
    /// Never blocks; drops with a counter bump when the ceiling is hit.
    pub fn write(&self, frame: Vec<u8>) -> bool {
        if self.is_stopped() {
            self.shared.outbound_drops.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let len = frame.len();
        {
            let mut ring = self.shared.ring.lock();
            if ring.pending_bytes() + len > self.shared.max_pending_bytes {
                drop(ring);
                self.shared.outbound_drops.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            ring.outbound_bytes += len;
            ring.outbound.push_back((frame, StdInstant::now()));
        }
        self.shared.wake.notify_one();
        true
    }

    /// Flushes due outbound frames to the installed sink. A batch is due once
    /// it reaches `MAX_EMIT_BATCH` frames or its oldest frame exceeds
    /// `MAX_BATCH_AGE`; `force` flushes whatever is queued. Returns the number
    /// of frames emitted.
    pub fn flush(&self, now: StdInstant, force: bool) -> usize {
        let sink = {
            let guard = self.shared.sink.lock();
            guard.clone()
        };
        let Some(sink) = sink else { return 0 };

        let frames: Vec<Vec<u8>> = {
            let mut ring = self.shared.ring.lock();
            let due = force
                || ring.outbound.len() >= MAX_EMIT_BATCH
                || ring
                    .outbound
                    .front()
                    .map(|(_, enqueued)| now.saturating_duration_since(*enqueued) >= MAX_BATCH_AGE)
                    .unwrap_or(false);
            if !due {
                return 0;
            }
            let count = ring.outbound.len().min(MAX_EMIT_BATCH);
            let mut drained = Vec::with_capacity(count);
            for _ in 0..count {
                if let Some((frame, _)) = ring.outbound.pop_front() {
                    ring.outbound_bytes = ring.outbound_bytes.saturating_sub(frame.len());
                    drained.push(frame);
                }
            }
            drained
        };
        if frames.is_empty() {
            return 0;
        }
        let emitted = frames.len();
        if self.shared.af_prefix {
            let prefixed: Vec<Vec<u8>> = frames.into_iter().map(prepend_af_word).collect();
            sink.emit_frames(&prefixed);
        } else {
            sink.emit_frames(&frames);
        }
        emitted
    }

    /// Number of queued inbound packets (test and telemetry probe).
    pub fn inbound_queue_len(&self) -> usize {
        self.shared.ring.lock().inbound.len()
    }

    pub fn outbound_queue_len(&self) -> usize {
        self.shared.ring.lock().outbound.len()
    }
}

fn prepend_af_word(frame: Vec<u8>) -> Vec<u8> {
    let word = if frame.first().map(|byte| byte >> 4) == Some(6) {
        AF_INET6_WORD
    } else {
        AF_INET_WORD
    };
    let mut prefixed = Vec::with_capacity(frame.len() + 4);
    prefixed.extend_from_slice(&word.to_be_bytes());
    prefixed.extend_from_slice(&frame);
    prefixed
}

fn validate_packet(packet: &[u8]) -> bool {
    match packet.first().map(|byte| byte >> 4) {
        Some(4) => validate_ipv4(packet),
        Some(6) => validate_ipv6(packet),
        _ => false,
    }
}

fn validate_ipv4(packet: &[u8]) -> bool {
    if packet.len() < 20 {
        return false;
    }
    let ihl = (packet[0] & 0x0F) as usize;
    let header_len = ihl * 4;
    if ihl < 5 || header_len > packet.len() {
        return false;
    }
    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    total_len >= header_len && total_len <= packet.len()
}

fn validate_ipv6(packet: &[u8]) -> bool {
    if packet.len() < 40 {
        return false;
    }
    let payload_len = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    40 + payload_len <= packet.len()
}

impl Device for TunDevice {
    type RxToken<'a>
        = TunRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = TunTxToken
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let mut ring = self.shared.ring.lock();
        ring.inbound.pop_front().map(|packet| {
            ring.inbound_bytes = ring.inbound_bytes.saturating_sub(packet.len());
            let rx = TunRxToken { buffer: packet };
            let tx = TunTxToken {
                shared: Arc::clone(&self.shared),
            };
            (rx, tx)
        })
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TunTxToken {
            shared: Arc::clone(&self.shared),
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.device_capabilities()
    }
}

pub struct TunRxToken {
    buffer: Vec<u8>,
}

pub struct TunTxToken {
    shared: Arc<DeviceShared>,
}

impl RxToken for TunRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = self.buffer;
        f(&mut buffer)
    }
}

impl TxToken for TunTxToken {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len.min(self.shared.mtu)];
        let result = f(&mut frame);

        // iOS rejects SYN-ACK carrying ECE when ECN was never negotiated in
        // the SYN; smoltcp does not negotiate ECN, so strip the flags here.
        strip_syn_ack_ecn(&mut frame);

        let handle = TunHandle {
            shared: Arc::clone(&self.shared),
        };
        handle.write(frame);
        result
    }
}

fn strip_syn_ack_ecn(frame: &mut [u8]) {
    if frame.len() < 40 {
        return;
    }
    let version = frame[0] >> 4;
    if version != 4 || frame[9] != 6 {
        return;
    }
    let header_len = ((frame[0] & 0x0F) as usize) * 4;
    if frame.len() < header_len + 20 {
        return;
    }
    let flags = frame[header_len + 13];
    let is_syn_ack = (flags & 0x12) == 0x12;
    let has_ecn = (flags & 0xC0) != 0;
    if is_syn_ack && has_ecn {
        frame[header_len + 13] &= !0xC0;
        rewrite_tcp_checksum_ipv4(frame, header_len);
    }
}

fn rewrite_tcp_checksum_ipv4(packet: &mut [u8], ip_header_len: usize) {
    let ip_total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    let tcp_len = ip_total_len.saturating_sub(ip_header_len);
    if tcp_len < 20 || packet.len() < ip_header_len + tcp_len {
        return;
    }
    packet[ip_header_len + 16] = 0;
    packet[ip_header_len + 17] = 0;
    let src = std::net::Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst = std::net::Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    let checksum =
        crate::stack::checksum::tcp_ipv4(src, dst, &packet[ip_header_len..ip_header_len + tcp_len]);
    packet[ip_header_len + 16..ip_header_len + 18].copy_from_slice(&checksum.to_be_bytes());
}
