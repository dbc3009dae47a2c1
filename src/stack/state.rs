use crate::buffer::Transport;
use crate::stack::policy::ShapingConfig;
use smoltcp::iface::SocketHandle;
use smoltcp::wire::IpAddress;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub(super) const TCP_FLOW_CAP: usize = 128;
pub(super) const UDP_FLOW_CAP: usize = 128;
pub(super) const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
pub(super) const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub(super) const DIAL_PENDING_TIMEOUT: Duration = Duration::from_secs(15);
pub(super) const MAX_SHAPED_PAYLOADS: usize = 32;
pub(super) const MAX_SHAPED_BYTES: usize = 256 * 1024;
/// Outbound payload a flow may buffer while its dial is in flight.
pub(super) const PENDING_DIAL_BUFFER_BYTES: usize = 1500;

/// Admission lifecycle of a flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionState {
    /// Waiting on the outbound dial.
    Pending,
    /// Dial succeeded; payload moves in both directions.
    Admitted,
    /// Refused by policy; an RST/drop is on its way out.
    Blocked,
    /// Teardown started, FIN exchange in progress.
    Closing,
    Closed,
}

#[derive(Hash, Eq, PartialEq, Clone, Copy, Debug)]
pub(super) struct EndpointKey {
    pub(super) src_ip: IpAddress,
    pub(super) src_port: u16,
    pub(super) dst_ip: IpAddress,
    pub(super) dst_port: u16,
    pub(super) transport: Transport,
}

pub(super) struct FlowEntry {
    pub(super) handle: u64,
    pub(super) transport: Transport,
    pub(super) state: AdmissionState,
    /// TCP flows own one pooled smoltcp socket once admitted.
    pub(super) socket: Option<SocketHandle>,
    pub(super) host: String,
    pub(super) port: u16,
    pub(super) last_activity: Instant,
    pub(super) dial_started_at: Option<Instant>,
    /// Raw SYN frames (TCP) held until the dial completes.
    pub(super) held_frames: Vec<Vec<u8>>,
    /// Client payload awaiting an admitted dial (UDP) or a writable host
    /// socket (TCP partial writes).
    pub(super) outbound_buffer: VecDeque<Vec<u8>>,
    pub(super) outbound_buffered_bytes: usize,
    /// Remote payload that could not enter the socket yet.
    pub(super) inbound_buffer: VecDeque<Vec<u8>>,
    pub(super) inbound_buffered_bytes: usize,
    /// Host reported its write side blocked; stop draining the socket so the
    /// receive window closes instead of ACKing bytes we cannot forward.
    pub(super) send_paused: bool,
    pub(super) client_closed: bool,
    pub(super) dialer_closed: bool,
    pub(super) shaper: Option<FlowShaper>,
}

impl FlowEntry {
    pub(super) fn new(
        handle: u64,
        transport: Transport,
        host: String,
        port: u16,
        shaper: Option<FlowShaper>,
        now: Instant,
    ) -> Self {
        Self {
            handle,
            transport,
            state: AdmissionState::Pending,
            socket: None,
            host,
            port,
            last_activity: now,
            dial_started_at: Some(now),
            held_frames: Vec::new(),
            outbound_buffer: VecDeque::new(),
            outbound_buffered_bytes: 0,
            inbound_buffer: VecDeque::new(),
            inbound_buffered_bytes: 0,
            send_paused: false,
            client_closed: false,
            dialer_closed: false,
            shaper,
        }
    }

    pub(super) fn idle_timeout(&self) -> Duration {
        match self.transport {
            Transport::Tcp => TCP_IDLE_TIMEOUT,
            Transport::Udp => UDP_IDLE_TIMEOUT,
        }
    }

    pub(super) fn buffer_outbound(&mut self, payload: &[u8], limit: usize) -> bool {
        if payload.is_empty() {
            return true;
        }
        if self.outbound_buffered_bytes + payload.len() > limit {
            return false;
        }
        self.outbound_buffer.push_back(payload.to_vec());
        self.outbound_buffered_bytes += payload.len();
        true
    }

    pub(super) fn buffer_inbound(&mut self, payload: &[u8], limit: usize) -> bool {
        if payload.is_empty() {
            return true;
        }
        if self.inbound_buffered_bytes + payload.len() > limit {
            return false;
        }
        self.inbound_buffer.push_back(payload.to_vec());
        self.inbound_buffered_bytes += payload.len();
        true
    }
}

pub(super) fn ip_string(ip: IpAddress) -> String {
    match ip {
        IpAddress::Ipv4(addr) => addr.to_string(),
        IpAddress::Ipv6(addr) => addr.to_string(),
    }
}

pub(super) fn ip_address_from_std(addr: std::net::IpAddr) -> IpAddress {
    match addr {
        std::net::IpAddr::V4(v4) => IpAddress::Ipv4(smoltcp::wire::Ipv4Address::from_bytes(&v4.octets())),
        std::net::IpAddr::V6(v6) => IpAddress::Ipv6(smoltcp::wire::Ipv6Address::from_bytes(&v6.octets())),
    }
}

pub(super) fn smolt_to_std_ip(addr: IpAddress) -> std::net::IpAddr {
    match addr {
        IpAddress::Ipv4(v4) => std::net::IpAddr::V4(std::net::Ipv4Addr::from(v4.0)),
        IpAddress::Ipv6(v6) => std::net::IpAddr::V6(std::net::Ipv6Addr::from(v6.0)),
    }
}

/// Delays remote payloads for flows under a latency rule. The queue is
/// bounded; overruns drop the newest payload.
#[derive(Debug, Clone)]
pub(super) struct FlowShaper {
    pub(super) config: ShapingConfig,
    queue: VecDeque<ShapedPayload>,
    queued_bytes: usize,
}

#[derive(Debug, Clone)]
struct ShapedPayload {
    ready_at: Instant,
    payload: Vec<u8>,
}

impl FlowShaper {
    pub(super) fn new(config: ShapingConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            queued_bytes: 0,
        }
    }

    pub(super) fn enqueue(&mut self, payload: &[u8], ready_at: Instant) -> bool {
        if payload.is_empty() {
            return true;
        }
        if payload.len() > MAX_SHAPED_BYTES
            || self.queue.len() >= MAX_SHAPED_PAYLOADS
            || self.queued_bytes + payload.len() > MAX_SHAPED_BYTES
        {
            return false;
        }
        self.queue.push_back(ShapedPayload {
            ready_at,
            payload: payload.to_vec(),
        });
        self.queued_bytes += payload.len();
        true
    }

    pub(super) fn drain_ready<F>(&mut self, now: Instant, mut visitor: F)
    where
        F: FnMut(Vec<u8>),
    {
        while let Some(front) = self.queue.front() {
            if front.ready_at > now {
                break;
            }
            if let Some(item) = self.queue.pop_front() {
                self.queued_bytes = self.queued_bytes.saturating_sub(item.payload.len());
                visitor(item.payload);
            }
        }
    }

    pub(super) fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }
}
