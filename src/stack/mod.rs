//! Userspace TCP/IP stack and flow management.
//!
//! One poll thread owns everything here. TCP flows terminate in pooled
//! smoltcp sockets; UDP bypasses smoltcp and is framed by hand. Outbound
//! sockets live on the host side of the [`Dialer`] boundary and are only
//! ever named by opaque handles.
//!
//! A TCP SYN is held until the outbound dial succeeds: only then does the
//! flow get a listening socket and the SYN replayed into the interface, so
//! the client sees SYN-ACK exactly when the remote is reachable. Dial
//! failures and policy blocks answer with RST (TCP) or ICMP prohibited
//! (UDP).

pub mod policy;

pub(crate) mod checksum;
mod interface;
mod packet_builder;
mod state;

#[cfg(test)]
mod tests;

pub use state::AdmissionState;

use crate::buffer::{FlowKey, Transport};
use crate::device::{TunDevice, TunHandle};
use crate::dialer::{DialError, Dialer, LifecycleEvent, LifecycleSink};
use crate::dns::ForwardHostTracker;
use crate::error::DialErrorKind;
use crate::logger::{self, BreadcrumbFlags};
use crate::metrics::{EngineCounters, MetricsCollector};
use crate::parser::{self, ParsedFrame, TcpSegment, UdpDatagram};
use crate::pipeline::SamplePipeline;
use interface::build_interface_and_sockets;
use packet_builder::{build_icmp_block, build_tcp_reset, build_udp_response};
use policy::{PolicyDecision, PolicyManager, RuleAction, ShapingConfig};
use rustc_hash::FxHashMap;
use smoltcp::iface::{Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{SendError as TcpSendError, Socket as TcpSocket, State as TcpState};
use smoltcp::time::Instant as SmoltInstant;
use smoltcp::wire::IpListenEndpoint;
use state::{
    ip_address_from_std, ip_string, smolt_to_std_ip, AdmissionState as Admission, EndpointKey,
    FlowEntry, FlowShaper, DIAL_PENDING_TIMEOUT, PENDING_DIAL_BUFFER_BYTES, TCP_FLOW_CAP,
    UDP_FLOW_CAP,
};
use std::cell::Cell;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy)]
pub struct FlowLimits {
    pub tcp_cap: usize,
    pub udp_cap: usize,
    pub max_flows: usize,
    pub per_flow_buffer_bytes: usize,
}

impl Default for FlowLimits {
    fn default() -> Self {
        Self {
            tcp_cap: TCP_FLOW_CAP,
            udp_cap: UDP_FLOW_CAP,
            max_flows: 512,
            per_flow_buffer_bytes: 16 * 1024,
        }
    }
}

pub struct StackParams {
    pub device: TunDevice,
    pub wake: Arc<Notify>,
    pub dialer: Arc<dyn Dialer>,
    pub lifecycle: Arc<dyn LifecycleSink>,
    pub policy: Arc<PolicyManager>,
    pub forward_hosts: Arc<ForwardHostTracker>,
    pub metrics: Arc<MetricsCollector>,
    pub pipeline: Arc<parking_lot::Mutex<SamplePipeline>>,
    pub limits: FlowLimits,
    pub ipv4_gateway: IpAddr,
    pub ipv6_gateway: Option<IpAddr>,
    pub tcp_buffer_size: usize,
}

pub struct FlowManager {
    dialer: Arc<dyn Dialer>,
    lifecycle: Arc<dyn LifecycleSink>,
    policy: Arc<PolicyManager>,
    forward_hosts: Arc<ForwardHostTracker>,
    metrics: Arc<MetricsCollector>,
    pipeline: Arc<parking_lot::Mutex<SamplePipeline>>,
    interface: Interface,
    sockets: SocketSet<'static>,
    device: TunDevice,
    tun: TunHandle,
    tcp_pool: Vec<SocketHandle>,
    flows: FxHashMap<EndpointKey, FlowEntry>,
    handle_map: FxHashMap<u64, EndpointKey>,
    next_handle: u64,
    counters: EngineCounters,
    last_reported: EngineCounters,
    limits: FlowLimits,
    tcp_active: usize,
    udp_active: usize,
    wake: Arc<Notify>,
    jitter_state: Cell<u32>,
    flush_buffer: Vec<u8>,
}

impl FlowManager {
    pub fn new(params: StackParams) -> Self {
        let tun = params.device.handle();
        let (device, interface, sockets, tcp_pool) = build_interface_and_sockets(
            params.device,
            params.ipv4_gateway,
            params.ipv6_gateway,
            params.limits.tcp_cap,
            params.tcp_buffer_size,
        );
        Self {
            dialer: params.dialer,
            lifecycle: params.lifecycle,
            policy: params.policy,
            forward_hosts: params.forward_hosts,
            metrics: params.metrics,
            pipeline: params.pipeline,
            interface,
            sockets,
            device,
            tun,
            tcp_pool,
            flows: FxHashMap::default(),
            handle_map: FxHashMap::default(),
            next_handle: 1,
            counters: EngineCounters::default(),
            last_reported: EngineCounters::default(),
            limits: params.limits,
            tcp_active: 0,
            udp_active: 0,
            wake: params.wake,
            jitter_state: Cell::new(0x9e37_79b9),
            flush_buffer: Vec::with_capacity(4096),
        }
    }

    pub fn counters(&self) -> EngineCounters {
        self.counters
    }

    pub fn active_flows(&self) -> (usize, usize) {
        (self.tcp_active, self.udp_active)
    }

    // ------------------------------------------------------------------
    // Tunnel-side ingest
    // ------------------------------------------------------------------

    /// Processes one raw IP frame read from the tunnel.
    pub fn ingest(&mut self, frame: &[u8]) {
        match parser::parse_frame(frame) {
            Ok(ParsedFrame::Tcp(segment)) => self.ingest_tcp(frame, &segment),
            Ok(ParsedFrame::Udp(datagram)) => self.ingest_udp(&datagram),
            Ok(ParsedFrame::Other) => {}
            Err(error) => {
                logger::breadcrumb(
                    BreadcrumbFlags::DEVICE,
                    format!("dropping frame: {}", error.description()),
                );
                self.counters.inbound_frame_drops += 1;
            }
        }
    }

    fn ingest_tcp(&mut self, frame: &[u8], segment: &TcpSegment<'_>) {
        let key = EndpointKey {
            src_ip: ip_address_from_std(segment.src),
            src_port: segment.src_port,
            dst_ip: ip_address_from_std(segment.dst),
            dst_port: segment.dst_port,
            transport: Transport::Tcp,
        };
        if let Some(entry) = self.flows.get_mut(&key) {
            entry.last_activity = StdInstant::now();
            if segment.flags.fin || segment.flags.rst {
                entry.client_closed = true;
            }
            match entry.state {
                Admission::Pending => {
                    if segment.flags.syn {
                        // Keep only the latest SYN for replay after the dial.
                        entry.held_frames.clear();
                        entry.held_frames.push(frame.to_vec());
                    }
                }
                Admission::Admitted | Admission::Closing => {
                    self.tun.inject(frame);
                }
                Admission::Blocked | Admission::Closed => {}
            }
            return;
        }

        // Only a fresh SYN may open a flow.
        if !segment.flags.syn || segment.flags.ack {
            return;
        }

        let host = self.dial_host_for(segment.dst, segment.dst_port);
        let mut shaper = None;
        match self.policy.decision_for_host(&host) {
            Some(PolicyDecision {
                host: blocked_host,
                action: RuleAction::Block,
            }) => {
                self.reject_tcp(segment, &blocked_host);
                return;
            }
            Some(PolicyDecision {
                action: RuleAction::Shape(config),
                ..
            }) => shaper = Some(FlowShaper::new(config)),
            None => {}
        }

        if self.tcp_active >= self.limits.tcp_cap || self.total_flows() >= self.limits.max_flows {
            self.counters.tcp_admission_fail += 1;
            logger::warn("FlowManager: TCP admission failed (flow cap reached)");
            if let Some(reset) = build_tcp_reset(segment) {
                self.tun.write(reset);
            }
            return;
        }

        let handle = self.allocate_handle();
        let now = StdInstant::now();
        let mut entry = FlowEntry::new(handle, Transport::Tcp, host.clone(), key.dst_port, shaper, now);
        entry.held_frames.push(frame.to_vec());
        entry.client_closed = segment.flags.fin || segment.flags.rst;
        self.flows.insert(key, entry);
        self.handle_map.insert(handle, key);
        self.tcp_active += 1;
        self.metrics.adjust_active_connections(Transport::Tcp, 1);
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!(
                "TCP flow {}:{} -> {}:{} pending dial to {} (handle {})",
                ip_string(key.src_ip),
                key.src_port,
                ip_string(key.dst_ip),
                key.dst_port,
                host,
                handle
            ),
        );
        self.dialer
            .tcp_dial(&host, key.dst_port, handle, dial_deadline_ms());
    }

    fn ingest_udp(&mut self, datagram: &UdpDatagram<'_>) {
        let key = EndpointKey {
            src_ip: ip_address_from_std(datagram.src),
            src_port: datagram.src_port,
            dst_ip: ip_address_from_std(datagram.dst),
            dst_port: datagram.dst_port,
            transport: Transport::Udp,
        };
        if let Some(entry) = self.flows.get_mut(&key) {
            entry.last_activity = StdInstant::now();
            match entry.state {
                Admission::Pending => {
                    if !entry.buffer_outbound(datagram.payload, PENDING_DIAL_BUFFER_BYTES) {
                        self.counters.udp_backpressure_drops += 1;
                    }
                }
                Admission::Admitted => {
                    let handle = entry.handle;
                    if self.dialer.udp_write(handle, datagram.payload).is_err() {
                        self.close_flow_abrupt(handle, "udp_write_failed");
                    }
                }
                Admission::Blocked | Admission::Closing | Admission::Closed => {}
            }
            return;
        }

        let host = self.dial_host_for(datagram.dst, datagram.dst_port);
        let mut shaper = None;
        match self.policy.decision_for_host(&host) {
            Some(PolicyDecision {
                host: blocked_host,
                action: RuleAction::Block,
            }) => {
                self.reject_udp(datagram, &blocked_host);
                return;
            }
            Some(PolicyDecision {
                action: RuleAction::Shape(config),
                ..
            }) => shaper = Some(FlowShaper::new(config)),
            None => {}
        }

        if self.udp_active >= self.limits.udp_cap || self.total_flows() >= self.limits.max_flows {
            self.counters.udp_admission_fail += 1;
            logger::warn("FlowManager: UDP admission failed (flow cap reached)");
            return;
        }

        let handle = self.allocate_handle();
        let now = StdInstant::now();
        let mut entry = FlowEntry::new(handle, Transport::Udp, host.clone(), key.dst_port, shaper, now);
        let _ = entry.buffer_outbound(datagram.payload, PENDING_DIAL_BUFFER_BYTES);
        self.flows.insert(key, entry);
        self.handle_map.insert(handle, key);
        self.udp_active += 1;
        self.metrics.adjust_active_connections(Transport::Udp, 1);
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!(
                "UDP flow {}:{} -> {}:{} pending dial to {} (handle {})",
                ip_string(key.src_ip),
                key.src_port,
                ip_string(key.dst_ip),
                key.dst_port,
                host,
                handle
            ),
        );
        self.dialer
            .udp_dial(&host, key.dst_port, handle, dial_deadline_ms());
    }

    /// Preferred dial target: the hostname the client originally asked for,
    /// falling back to the literal address.
    fn dial_host_for(&self, dst: IpAddr, _port: u16) -> String {
        self.forward_hosts
            .lookup(dst)
            .unwrap_or_else(|| dst.to_string())
    }

    fn reject_tcp(&mut self, segment: &TcpSegment<'_>, host: &str) {
        let message = format!(
            "flow to {}:{} blocked by policy (host={host})",
            segment.dst, segment.dst_port
        );
        logger::warn(message.as_str());
        if let Some(reset) = build_tcp_reset(segment) {
            self.tun.write(reset);
        }
        self.metrics.record_error(message);
        self.lifecycle
            .on_event(LifecycleEvent::DidFail(format!("blocked host {host}")));
        self.wake.notify_one();
    }

    fn reject_udp(&mut self, datagram: &UdpDatagram<'_>, host: &str) {
        let message = format!(
            "flow to {}:{} blocked by policy (host={host})",
            datagram.dst, datagram.dst_port
        );
        logger::warn(message.as_str());
        if let Some(icmp) = build_icmp_block(datagram) {
            self.tun.write(icmp);
        }
        self.metrics.record_error(message);
        self.lifecycle
            .on_event(LifecycleEvent::DidFail(format!("blocked host {host}")));
        self.wake.notify_one();
    }

    // ------------------------------------------------------------------
    // Host-side entry points
    // ------------------------------------------------------------------

    pub fn on_dial_result(&mut self, handle: u64, result: Result<(), DialError>) {
        let Some(key) = self.handle_map.get(&handle).copied() else {
            logger::warn(format!("FlowManager: dial result for unknown handle {handle}"));
            return;
        };
        match result {
            Ok(()) => self.dial_succeeded(key, handle),
            Err(error) => self.dial_failed(key, handle, error),
        }
        self.wake.notify_one();
    }

    fn dial_succeeded(&mut self, key: EndpointKey, handle: u64) {
        let transport = match self.flows.get_mut(&key) {
            Some(entry) if entry.state == Admission::Pending => {
                entry.state = Admission::Admitted;
                entry.last_activity = StdInstant::now();
                entry.dial_started_at = None;
                entry.transport
            }
            _ => return,
        };
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!("{transport:?} dial ready for handle {handle}"),
        );
        match transport {
            Transport::Tcp => {
                let Some(socket) = self.tcp_pool.pop() else {
                    self.counters.tcp_admission_fail += 1;
                    self.close_flow_abrupt(handle, "tcp_socket_pool_exhausted");
                    return;
                };
                {
                    let tcp = self.sockets.get_mut::<TcpSocket>(socket);
                    tcp.abort();
                    let endpoint = IpListenEndpoint {
                        addr: Some(key.dst_ip),
                        port: key.dst_port,
                    };
                    if tcp.listen(endpoint).is_err() {
                        self.tcp_pool.push(socket);
                        self.close_flow_abrupt(handle, "tcp_listen_failed");
                        return;
                    }
                }
                let held = match self.flows.get_mut(&key) {
                    Some(entry) => {
                        entry.socket = Some(socket);
                        std::mem::take(&mut entry.held_frames)
                    }
                    None => Vec::new(),
                };
                // Replay the SYN so smoltcp answers SYN-ACK now that the
                // remote leg exists.
                for frame in held {
                    self.tun.inject(&frame);
                }
            }
            Transport::Udp => {
                let buffered: Vec<Vec<u8>> = match self.flows.get_mut(&key) {
                    Some(entry) => {
                        entry.outbound_buffered_bytes = 0;
                        entry.outbound_buffer.drain(..).collect()
                    }
                    None => Vec::new(),
                };
                for payload in buffered {
                    if self.dialer.udp_write(handle, &payload).is_err() {
                        self.close_flow_abrupt(handle, "udp_write_failed");
                        return;
                    }
                }
            }
        }
    }

    fn dial_failed(&mut self, key: EndpointKey, handle: u64, error: DialError) {
        let message = error
            .message
            .clone()
            .unwrap_or_else(|| error.kind.as_str().to_string());
        let (host, port, transport) = match self.flows.get_mut(&key) {
            Some(entry) => {
                entry.state = Admission::Blocked;
                (entry.host.clone(), entry.port, entry.transport)
            }
            None => return,
        };
        logger::warn(format!(
            "FlowManager: {transport:?} dial to {host}:{port} failed ({message})"
        ));
        self.metrics.record_error(format!(
            "dial to {host}:{port} failed ({})",
            error.kind.as_str()
        ));
        if error.kind == DialErrorKind::Blocked {
            self.lifecycle
                .on_event(LifecycleEvent::DidFail(format!("blocked host {host}")));
        }
        // Answer the held SYN with a reset; the dial never produced a host
        // socket, so there is nothing to close on the other side.
        if transport == Transport::Tcp {
            self.reset_from_held_syn(&key);
        }
        if let Some(entry) = self.flows.get_mut(&key) {
            entry.dialer_closed = true;
        }
        self.remove_flow(handle);
    }

    fn reset_from_held_syn(&mut self, key: &EndpointKey) {
        let Some(entry) = self.flows.get(key) else { return };
        let Some(frame) = entry.held_frames.last() else { return };
        if let Ok(ParsedFrame::Tcp(segment)) = parser::parse_frame(frame) {
            if let Some(reset) = build_tcp_reset(&segment) {
                self.tun.write(reset);
            }
        }
    }

    pub fn on_tcp_receive(&mut self, handle: u64, payload: &[u8]) -> bool {
        self.forward_remote_payload(handle, payload, Transport::Tcp, false)
    }

    pub fn on_udp_receive(&mut self, handle: u64, payload: &[u8]) -> bool {
        self.forward_remote_payload(handle, payload, Transport::Udp, false)
    }

    pub fn on_tcp_close(&mut self, handle: u64, reason: Option<&str>) {
        let Some(key) = self.handle_map.get(&handle).copied() else {
            return;
        };
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!(
                "host closed tcp handle {handle} ({})",
                reason.unwrap_or("remote_close")
            ),
        );
        if let Some(entry) = self.flows.get_mut(&key) {
            // The host already tore its side down.
            entry.dialer_closed = true;
            if let Some(socket) = entry.socket {
                entry.state = Admission::Closing;
                // Flush whatever smoltcp still buffers, then FIN.
                self.sockets.get_mut::<TcpSocket>(socket).close();
            } else {
                self.remove_flow(handle);
            }
        }
        self.wake.notify_one();
    }

    pub fn on_udp_close(&mut self, handle: u64, _reason: Option<&str>) {
        if let Some(key) = self.handle_map.get(&handle).copied() {
            if let Some(entry) = self.flows.get_mut(&key) {
                entry.dialer_closed = true;
            }
        }
        self.remove_flow(handle);
        self.wake.notify_one();
    }

    /// Host reports its write side blocked: stop ACKing new client bytes.
    pub fn on_write_blocked(&mut self, handle: u64) {
        if let Some(key) = self.handle_map.get(&handle).copied() {
            if let Some(entry) = self.flows.get_mut(&key) {
                entry.send_paused = true;
            }
        }
    }

    pub fn on_write_ready(&mut self, handle: u64) {
        if let Some(key) = self.handle_map.get(&handle).copied() {
            if let Some(entry) = self.flows.get_mut(&key) {
                entry.send_paused = false;
                entry.last_activity = StdInstant::now();
            }
            self.pump_tcp_flow(key);
        }
        self.wake.notify_one();
    }

    // ------------------------------------------------------------------
    // Remote payload toward the client
    // ------------------------------------------------------------------

    fn forward_remote_payload(
        &mut self,
        handle: u64,
        payload: &[u8],
        transport: Transport,
        bypass_shaping: bool,
    ) -> bool {
        if payload.is_empty() {
            return true;
        }
        let Some(key) = self.handle_map.get(&handle).copied() else {
            return false;
        };
        if key.transport != transport {
            return false;
        }

        if !bypass_shaping {
            let flow_key = std_flow_key(&key);
            self.pipeline.lock().observe_inbound_payload(&flow_key, payload);
        }

        if !bypass_shaping {
            let delay = match self.flows.get(&key).and_then(|entry| entry.shaper.as_ref()) {
                Some(shaper) => Some(self.shaping_delay(&shaper.config)),
                None => None,
            };
            if let Some(delay) = delay {
                let ready_at = StdInstant::now() + delay;
                if let Some(entry) = self.flows.get_mut(&key) {
                    let accepted = entry
                        .shaper
                        .as_mut()
                        .map(|shaper| shaper.enqueue(payload, ready_at))
                        .unwrap_or(false);
                    if accepted {
                        entry.last_activity = StdInstant::now();
                        self.wake.notify_one();
                        return true;
                    }
                }
                match transport {
                    Transport::Tcp => self.counters.tcp_backpressure_drops += 1,
                    Transport::Udp => self.counters.udp_backpressure_drops += 1,
                }
                return false;
            }
        }

        match transport {
            Transport::Tcp => self.deliver_tcp_to_client(key, handle, payload),
            Transport::Udp => self.deliver_udp_to_client(key, payload),
        }
    }

    fn deliver_tcp_to_client(&mut self, key: EndpointKey, handle: u64, payload: &[u8]) -> bool {
        let (state, socket) = match self.flows.get(&key) {
            Some(entry) => (entry.state, entry.socket),
            None => return false,
        };
        match (state, socket) {
            (Admission::Pending, _) => {
                let limit = self.limits.per_flow_buffer_bytes;
                let accepted = self
                    .flows
                    .get_mut(&key)
                    .map(|entry| entry.buffer_inbound(payload, limit))
                    .unwrap_or(false);
                if !accepted {
                    self.counters.tcp_backpressure_drops += 1;
                }
                accepted
            }
            (Admission::Admitted | Admission::Closing, Some(socket)) => {
                let written = {
                    let tcp = self.sockets.get_mut::<TcpSocket>(socket);
                    if !tcp.can_send() {
                        Ok(0)
                    } else {
                        tcp.send_slice(payload)
                    }
                };
                match written {
                    Ok(written) if written == payload.len() => {
                        if let Some(entry) = self.flows.get_mut(&key) {
                            entry.last_activity = StdInstant::now();
                        }
                        self.wake.notify_one();
                        true
                    }
                    Ok(written) => {
                        let limit = self.limits.per_flow_buffer_bytes;
                        let accepted = self
                            .flows
                            .get_mut(&key)
                            .map(|entry| entry.buffer_inbound(&payload[written..], limit))
                            .unwrap_or(false);
                        if !accepted {
                            logger::info(format!(
                                "BACKPRESSURE Tcp handle={handle} reason=\"socket_buffer_full\""
                            ));
                            self.counters.tcp_backpressure_drops += 1;
                        }
                        self.wake.notify_one();
                        accepted
                    }
                    Err(TcpSendError::InvalidState) => {
                        self.close_flow_abrupt(handle, "tcp_invalid_state");
                        false
                    }
                }
            }
            _ => false,
        }
    }

    fn deliver_udp_to_client(&mut self, key: EndpointKey, payload: &[u8]) -> bool {
        let Some(frame) = build_udp_response(&key, payload) else {
            return false;
        };
        if self.tun.write(frame) {
            if let Some(entry) = self.flows.get_mut(&key) {
                entry.last_activity = StdInstant::now();
            }
            self.wake.notify_one();
            true
        } else {
            self.counters.udp_backpressure_drops += 1;
            false
        }
    }

    fn shaping_delay(&self, config: &ShapingConfig) -> Duration {
        let mut delay = Duration::from_millis(u64::from(config.latency_ms));
        if config.jitter_ms > 0 {
            delay += Duration::from_millis(u64::from(self.fast_jitter(config.jitter_ms)));
        }
        delay
    }

    /// xorshift32; cheap enough for the poll path.
    fn fast_jitter(&self, max: u32) -> u32 {
        let mut x = self.jitter_state.get();
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.jitter_state.set(x);
        x % (max + 1)
    }

    // ------------------------------------------------------------------
    // Poll cycle
    // ------------------------------------------------------------------

    pub fn poll(&mut self, now: SmoltInstant) -> bool {
        self.counters.poll_iterations += 1;
        let mut did_work = self
            .interface
            .poll(now, &mut self.device, &mut self.sockets);

        if self.pump_all_tcp_flows() {
            did_work = true;
        }
        if self.retry_inbound_buffers() {
            did_work = true;
        }
        self.finalize_tcp_flows();
        if self.drain_shapers(StdInstant::now()) {
            did_work = true;
        }
        self.prune_idle_flows(StdInstant::now());
        self.prune_timed_out_dials(StdInstant::now());

        let emitted = self.tun.flush(StdInstant::now(), false);
        if emitted > 0 {
            did_work = true;
            self.counters.frames_emitted += emitted as u64;
            self.counters.flush_events += 1;
        }
        self.counters.inbound_frame_drops = self.tun.inbound_drops();
        self.counters.outbound_frame_drops = self.tun.outbound_drops();

        if self.counters != self.last_reported {
            self.last_reported = self.counters;
            self.metrics.record_engine(self.counters);
        }
        did_work
    }

    /// Drains client bytes out of every admitted TCP socket toward the host.
    fn pump_all_tcp_flows(&mut self) -> bool {
        let keys: Vec<EndpointKey> = self
            .flows
            .iter()
            .filter(|(_, entry)| {
                entry.transport == Transport::Tcp
                    && entry.socket.is_some()
                    && matches!(entry.state, Admission::Admitted | Admission::Closing)
            })
            .map(|(key, _)| *key)
            .collect();
        let mut did_work = false;
        for key in keys {
            if self.pump_tcp_flow(key) {
                did_work = true;
            }
        }
        did_work
    }

    fn pump_tcp_flow(&mut self, key: EndpointKey) -> bool {
        let (handle, socket) = match self.flows.get(&key) {
            Some(entry) if entry.transport == Transport::Tcp => match entry.socket {
                Some(socket) => (entry.handle, socket),
                None => return false,
            },
            _ => return false,
        };
        let mut did_work = false;

        // Backlogged bytes from a previous partial write go first.
        loop {
            let chunk = match self.flows.get_mut(&key) {
                Some(entry) => {
                    if entry.send_paused {
                        return did_work;
                    }
                    match entry.outbound_buffer.pop_front() {
                        Some(chunk) => {
                            entry.outbound_buffered_bytes =
                                entry.outbound_buffered_bytes.saturating_sub(chunk.len());
                            chunk
                        }
                        None => break,
                    }
                }
                None => return did_work,
            };
            match self.dialer.tcp_write(handle, &chunk) {
                Ok(written) if written == chunk.len() => {
                    did_work = true;
                }
                Ok(written) => {
                    if let Some(entry) = self.flows.get_mut(&key) {
                        let remainder = chunk[written..].to_vec();
                        entry.outbound_buffered_bytes += remainder.len();
                        entry.outbound_buffer.push_front(remainder);
                        entry.send_paused = true;
                    }
                    return did_work;
                }
                Err(error) => {
                    self.close_flow_abrupt(handle, &format!("tcp_write_failed: {error}"));
                    return did_work;
                }
            }
        }

        // Fresh bytes from the socket. While the flow is send-paused the
        // socket is left alone so its receive window closes.
        loop {
            let paused = self
                .flows
                .get(&key)
                .map(|entry| entry.send_paused)
                .unwrap_or(true);
            if paused {
                return did_work;
            }
            self.flush_buffer.clear();
            {
                let flush_buffer = &mut self.flush_buffer;
                let tcp = self.sockets.get_mut::<TcpSocket>(socket);
                if !tcp.can_recv() {
                    break;
                }
                let result = tcp.recv(|payload| {
                    flush_buffer.extend_from_slice(payload);
                    (payload.len(), ())
                });
                if result.is_err() {
                    break;
                }
            }
            if self.flush_buffer.is_empty() {
                break;
            }
            let chunk = std::mem::take(&mut self.flush_buffer);
            match self.dialer.tcp_write(handle, &chunk) {
                Ok(written) if written == chunk.len() => {
                    did_work = true;
                    self.counters.bytes_emitted += chunk.len() as u64;
                    if let Some(entry) = self.flows.get_mut(&key) {
                        entry.last_activity = StdInstant::now();
                    }
                }
                Ok(written) => {
                    self.counters.bytes_emitted += written as u64;
                    if let Some(entry) = self.flows.get_mut(&key) {
                        let remainder = chunk[written..].to_vec();
                        entry.outbound_buffered_bytes += remainder.len();
                        entry.outbound_buffer.push_back(remainder);
                        entry.send_paused = true;
                    }
                    self.flush_buffer = chunk;
                    self.flush_buffer.clear();
                    return true;
                }
                Err(error) => {
                    self.close_flow_abrupt(handle, &format!("tcp_write_failed: {error}"));
                    return did_work;
                }
            }
            self.flush_buffer = chunk;
            self.flush_buffer.clear();
        }
        did_work
    }

    /// Retries remote payload that could not enter a socket earlier.
    fn retry_inbound_buffers(&mut self) -> bool {
        let keys: Vec<EndpointKey> = self
            .flows
            .iter()
            .filter(|(_, entry)| {
                !entry.inbound_buffer.is_empty()
                    && entry.socket.is_some()
                    && matches!(entry.state, Admission::Admitted | Admission::Closing)
            })
            .map(|(key, _)| *key)
            .collect();
        let mut did_work = false;
        for key in keys {
            loop {
                let (socket, chunk) = match self.flows.get_mut(&key) {
                    Some(entry) => match (entry.socket, entry.inbound_buffer.pop_front()) {
                        (Some(socket), Some(chunk)) => {
                            entry.inbound_buffered_bytes =
                                entry.inbound_buffered_bytes.saturating_sub(chunk.len());
                            (socket, chunk)
                        }
                        _ => break,
                    },
                    None => break,
                };
                let written = {
                    let tcp = self.sockets.get_mut::<TcpSocket>(socket);
                    if !tcp.can_send() {
                        Ok(0)
                    } else {
                        tcp.send_slice(&chunk)
                    }
                };
                match written {
                    Ok(written) if written == chunk.len() => {
                        did_work = true;
                    }
                    Ok(written) => {
                        if let Some(entry) = self.flows.get_mut(&key) {
                            let remainder = chunk[written..].to_vec();
                            entry.inbound_buffered_bytes += remainder.len();
                            entry.inbound_buffer.push_front(remainder);
                        }
                        break;
                    }
                    Err(TcpSendError::InvalidState) => {
                        let handle = self.flows.get(&key).map(|entry| entry.handle);
                        if let Some(handle) = handle {
                            self.close_flow_abrupt(handle, "tcp_invalid_state");
                        }
                        break;
                    }
                }
            }
        }
        did_work
    }

    /// Walks TCP sockets toward teardown: a client FIN or abort moves the
    /// flow to Closing, and a fully closed socket releases back to the pool.
    fn finalize_tcp_flows(&mut self) {
        enum Action {
            StartClosing(EndpointKey, u64),
            Release(EndpointKey, u64),
        }
        let mut actions = Vec::new();
        for (key, entry) in &self.flows {
            let Some(socket) = entry.socket else { continue };
            if entry.transport != Transport::Tcp {
                continue;
            }
            let socket_state = self.sockets.get::<TcpSocket>(socket).state();
            match entry.state {
                Admission::Admitted => match socket_state {
                    TcpState::Closed => actions.push(Action::Release(*key, entry.handle)),
                    TcpState::CloseWait if entry.client_closed => {
                        actions.push(Action::StartClosing(*key, entry.handle))
                    }
                    _ => {}
                },
                Admission::Closing => match socket_state {
                    TcpState::Closed | TcpState::TimeWait => {
                        actions.push(Action::Release(*key, entry.handle))
                    }
                    _ => {}
                },
                _ => {}
            }
        }
        for action in actions {
            match action {
                Action::StartClosing(key, handle) => {
                    self.notify_dialer_close_once(handle);
                    if let Some(entry) = self.flows.get_mut(&key) {
                        entry.state = Admission::Closing;
                        if let Some(socket) = entry.socket {
                            self.sockets.get_mut::<TcpSocket>(socket).close();
                        }
                    }
                    logger::breadcrumb(
                        BreadcrumbFlags::FLOW,
                        format!("tcp handle {handle} closing (client fin)"),
                    );
                }
                Action::Release(_, handle) => {
                    self.notify_dialer_close_once(handle);
                    self.remove_flow(handle);
                    logger::breadcrumb(
                        BreadcrumbFlags::FLOW,
                        format!("tcp handle {handle} finalized"),
                    );
                }
            }
        }
    }

    fn drain_shapers(&mut self, now: StdInstant) -> bool {
        let mut ready: smallvec::SmallVec<[(u64, Transport, Vec<u8>); 16]> =
            smallvec::SmallVec::new();
        for entry in self.flows.values_mut() {
            if let Some(shaper) = entry.shaper.as_mut() {
                let handle = entry.handle;
                let transport = entry.transport;
                shaper.drain_ready(now, |payload| {
                    ready.push((handle, transport, payload));
                });
            }
        }
        let mut did_work = false;
        for (handle, transport, payload) in ready {
            if self.forward_remote_payload(handle, &payload, transport, true) {
                did_work = true;
            }
        }
        did_work
    }

    fn prune_idle_flows(&mut self, now: StdInstant) {
        let idle: Vec<(u64, Transport)> = self
            .flows
            .values()
            .filter_map(|entry| {
                if entry.state != Admission::Admitted {
                    return None;
                }
                let timeout = entry.idle_timeout();
                if now.saturating_duration_since(entry.last_activity) >= timeout {
                    Some((entry.handle, entry.transport))
                } else {
                    None
                }
            })
            .collect();
        for (handle, transport) in idle {
            logger::breadcrumb(
                BreadcrumbFlags::FLOW,
                format!("{transport:?} idle timeout for handle {handle}"),
            );
            match transport {
                Transport::Tcp => self.begin_graceful_close(handle),
                Transport::Udp => {
                    self.notify_dialer_close_once(handle);
                    self.remove_flow(handle);
                }
            }
        }
    }

    fn prune_timed_out_dials(&mut self, now: StdInstant) {
        let stale: Vec<u64> = self
            .flows
            .values()
            .filter_map(|entry| {
                if entry.state != Admission::Pending {
                    return None;
                }
                let started = entry.dial_started_at?;
                if now.saturating_duration_since(started) >= DIAL_PENDING_TIMEOUT {
                    Some(entry.handle)
                } else {
                    None
                }
            })
            .collect();
        for handle in stale {
            logger::warn(format!(
                "FlowManager: dial timeout for handle {handle} (pending > {DIAL_PENDING_TIMEOUT:?})"
            ));
            let Some(key) = self.handle_map.get(&handle).copied() else {
                continue;
            };
            // The host never reported back; synthesize the timeout and take
            // the ordinary dial-failure path (reset, error event, removal).
            self.dial_failed(
                key,
                handle,
                DialError::new(DialErrorKind::Timeout),
            );
            self.wake.notify_one();
        }
    }

    // ------------------------------------------------------------------
    // Teardown helpers
    // ------------------------------------------------------------------

    fn begin_graceful_close(&mut self, handle: u64) {
        let Some(key) = self.handle_map.get(&handle).copied() else {
            return;
        };
        self.notify_dialer_close_once(handle);
        let socket = self.flows.get(&key).and_then(|entry| entry.socket);
        match socket {
            Some(socket) => {
                if let Some(entry) = self.flows.get_mut(&key) {
                    entry.state = Admission::Closing;
                }
                self.sockets.get_mut::<TcpSocket>(socket).close();
            }
            None => self.remove_flow(handle),
        }
    }

    fn close_flow_abrupt(&mut self, handle: u64, reason: &str) {
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!("closing handle {handle} ({reason})"),
        );
        self.notify_dialer_close_once(handle);
        self.remove_flow(handle);
        self.wake.notify_one();
    }

    fn notify_dialer_close_once(&mut self, handle: u64) {
        let Some(key) = self.handle_map.get(&handle).copied() else {
            return;
        };
        let Some(entry) = self.flows.get_mut(&key) else {
            return;
        };
        if entry.dialer_closed {
            return;
        }
        entry.dialer_closed = true;
        match entry.transport {
            Transport::Tcp => self.dialer.tcp_close(handle),
            Transport::Udp => self.dialer.udp_close(handle),
        }
    }

    fn remove_flow(&mut self, handle: u64) {
        let Some(key) = self.handle_map.remove(&handle) else {
            return;
        };
        if let Some(entry) = self.flows.remove(&key) {
            if let Some(socket) = entry.socket {
                // Force the socket back to a listenable state.
                self.sockets.get_mut::<TcpSocket>(socket).abort();
                self.tcp_pool.push(socket);
            }
            match entry.transport {
                Transport::Tcp => {
                    self.tcp_active = self.tcp_active.saturating_sub(1);
                    self.metrics.adjust_active_connections(Transport::Tcp, -1);
                }
                Transport::Udp => {
                    self.udp_active = self.udp_active.saturating_sub(1);
                    self.metrics.adjust_active_connections(Transport::Udp, -1);
                }
            }
        }
    }

    /// Tears down every flow; used on engine stop.
    pub fn shutdown(&mut self) {
        let handles: Vec<u64> = self.handle_map.keys().copied().collect();
        for handle in handles {
            self.close_flow_abrupt(handle, "engine_stopped");
        }
        self.tun.flush(StdInstant::now(), true);
        self.tun.stop();
    }

    fn total_flows(&self) -> usize {
        self.flows.len()
    }

    fn allocate_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        handle
    }

    #[cfg(test)]
    pub(crate) fn flow_state(&self, handle: u64) -> Option<AdmissionState> {
        let key = self.handle_map.get(&handle)?;
        self.flows.get(key).map(|entry| entry.state)
    }

    #[cfg(test)]
    pub(crate) fn tun_handle(&self) -> TunHandle {
        self.tun.clone()
    }

    #[cfg(test)]
    pub(crate) fn is_send_paused(&self, handle: u64) -> Option<bool> {
        let key = self.handle_map.get(&handle)?;
        self.flows.get(key).map(|entry| entry.send_paused)
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&mut self, handle: u64, age: Duration) {
        if let Some(key) = self.handle_map.get(&handle).copied() {
            if let Some(entry) = self.flows.get_mut(&key) {
                entry.last_activity = StdInstant::now() - age;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_dial(&mut self, handle: u64, age: Duration) {
        if let Some(key) = self.handle_map.get(&handle).copied() {
            if let Some(entry) = self.flows.get_mut(&key) {
                entry.dial_started_at = Some(StdInstant::now() - age);
            }
        }
    }
}

fn dial_deadline_ms() -> u64 {
    DIAL_PENDING_TIMEOUT.as_millis() as u64
}

fn std_flow_key(key: &EndpointKey) -> FlowKey {
    FlowKey::new(
        key.transport,
        smolt_to_std_ip(key.src_ip),
        key.src_port,
        smolt_to_std_ip(key.dst_ip),
        key.dst_port,
    )
}
