use super::policy::{PolicyManager, RuleAction, ShapingConfig};
use super::*;
use crate::classify::TrafficClassifier;
use crate::config::PolicySettings;
use crate::device::{PacketSink, TunDevice};
use crate::metrics::{MetricsSink, MetricsSnapshot};
use crate::stream::{SampleStream, StreamConfig};
use crate::trackers::{BurstTracker, FlowTracker, DEFAULT_BURST_GAP, DEFAULT_FLOW_TTL};
use parking_lot::Mutex as PlMutex;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Mutex;

const CLIENT: [u8; 4] = [10, 0, 0, 2];
const SERVER: [u8; 4] = [203, 0, 113, 80];

struct NullMetricsSink;
impl MetricsSink for NullMetricsSink {
    fn emit(&self, _snapshot: &MetricsSnapshot) {}
}

#[derive(Default)]
struct CaptureSink {
    frames: PlMutex<Vec<Vec<u8>>>,
}

impl CaptureSink {
    fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }
}

impl PacketSink for CaptureSink {
    fn emit_frames(&self, frames: &[Vec<u8>]) {
        self.frames.lock().extend(frames.iter().cloned());
    }
}

#[derive(Default)]
struct TestDialer {
    dials: Mutex<Vec<(Transport, String, u16, u64)>>,
    writes: Mutex<Vec<(Transport, u64, Vec<u8>)>>,
    closes: Mutex<Vec<(Transport, u64)>>,
    /// `Some(n)` caps each tcp_write at `n` accepted bytes.
    tcp_accept_limit: Mutex<Option<usize>>,
}

impl TestDialer {
    fn dials(&self) -> Vec<(Transport, String, u16, u64)> {
        self.dials.lock().unwrap().clone()
    }

    fn writes(&self) -> Vec<(Transport, u64, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    fn closes(&self) -> Vec<(Transport, u64)> {
        self.closes.lock().unwrap().clone()
    }

    fn set_tcp_accept_limit(&self, limit: Option<usize>) {
        *self.tcp_accept_limit.lock().unwrap() = limit;
    }
}

impl Dialer for TestDialer {
    fn tcp_dial(&self, host: &str, port: u16, handle: u64, _deadline_ms: u64) {
        self.dials
            .lock()
            .unwrap()
            .push((Transport::Tcp, host.to_string(), port, handle));
    }

    fn tcp_write(&self, handle: u64, payload: &[u8]) -> io::Result<usize> {
        let limit = self.tcp_accept_limit.lock().unwrap();
        let accepted = limit.map_or(payload.len(), |cap| cap.min(payload.len()));
        if accepted > 0 {
            self.writes
                .lock()
                .unwrap()
                .push((Transport::Tcp, handle, payload[..accepted].to_vec()));
        }
        Ok(accepted)
    }

    fn tcp_close(&self, handle: u64) {
        self.closes.lock().unwrap().push((Transport::Tcp, handle));
    }

    fn udp_dial(&self, host: &str, port: u16, handle: u64, _deadline_ms: u64) {
        self.dials
            .lock()
            .unwrap()
            .push((Transport::Udp, host.to_string(), port, handle));
    }

    fn udp_write(&self, handle: u64, payload: &[u8]) -> io::Result<usize> {
        self.writes
            .lock()
            .unwrap()
            .push((Transport::Udp, handle, payload.to_vec()));
        Ok(payload.len())
    }

    fn udp_close(&self, handle: u64) {
        self.closes.lock().unwrap().push((Transport::Udp, handle));
    }
}

#[derive(Default)]
struct TestLifecycle {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl TestLifecycle {
    fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl LifecycleSink for TestLifecycle {
    fn on_event(&self, event: LifecycleEvent) {
        self.events.lock().unwrap().push(event);
    }
}

struct Harness {
    manager: FlowManager,
    dialer: Arc<TestDialer>,
    lifecycle: Arc<TestLifecycle>,
    sink: Arc<CaptureSink>,
    forward_hosts: Arc<ForwardHostTracker>,
    now_ms: i64,
}

fn harness_with(policy_settings: PolicySettings, limits: FlowLimits) -> Harness {
    let wake = Arc::new(Notify::new());
    let device = TunDevice::new(1500, Arc::clone(&wake), 256, false);
    let sink = Arc::new(CaptureSink::default());
    device
        .handle()
        .start_read_loop(Arc::clone(&sink) as Arc<dyn PacketSink>);

    let dialer = Arc::new(TestDialer::default());
    let lifecycle = Arc::new(TestLifecycle::default());
    let forward_hosts = Arc::new(ForwardHostTracker::new(64));
    let metrics = MetricsCollector::new(
        Arc::new(NullMetricsSink) as Arc<dyn crate::metrics::MetricsSink>,
        Duration::from_secs(5),
        true,
    );
    let stream = SampleStream::spawn(StreamConfig::default(), &tokio::runtime::Handle::current());
    let pipeline = Arc::new(parking_lot::Mutex::new(SamplePipeline::new(
        FlowTracker::new(DEFAULT_FLOW_TTL, 256),
        BurstTracker::new(DEFAULT_BURST_GAP, 256),
        TrafficClassifier::new(&[], 256),
        Arc::clone(&forward_hosts),
        stream,
        Arc::clone(&metrics),
    )));

    let manager = FlowManager::new(StackParams {
        device,
        wake,
        dialer: Arc::clone(&dialer) as Arc<dyn Dialer>,
        lifecycle: Arc::clone(&lifecycle) as Arc<dyn LifecycleSink>,
        policy: PolicyManager::new(&policy_settings),
        forward_hosts: Arc::clone(&forward_hosts),
        metrics,
        pipeline,
        limits,
        ipv4_gateway: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        ipv6_gateway: None,
        tcp_buffer_size: 16 * 1024,
    });
    Harness {
        manager,
        dialer,
        lifecycle,
        sink,
        forward_hosts,
        now_ms: 0,
    }
}

fn harness() -> Harness {
    harness_with(PolicySettings::default(), FlowLimits::default())
}

fn tcp_frame(
    src: [u8; 4],
    src_port: u16,
    dst: [u8; 4],
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = 20 + 20 + payload.len();
    let mut frame = vec![0u8; total_len];
    frame[0] = 0x45;
    frame[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    frame[8] = 64;
    frame[9] = 6;
    frame[12..16].copy_from_slice(&src);
    frame[16..20].copy_from_slice(&dst);

    let tcp = 20;
    frame[tcp..tcp + 2].copy_from_slice(&src_port.to_be_bytes());
    frame[tcp + 2..tcp + 4].copy_from_slice(&dst_port.to_be_bytes());
    frame[tcp + 4..tcp + 8].copy_from_slice(&seq.to_be_bytes());
    frame[tcp + 8..tcp + 12].copy_from_slice(&ack.to_be_bytes());
    frame[tcp + 12] = 5 << 4;
    frame[tcp + 13] = flags;
    frame[tcp + 14..tcp + 16].copy_from_slice(&0xFFFFu16.to_be_bytes());
    frame[tcp + 20..].copy_from_slice(payload);

    let tcp_checksum = checksum::tcp_ipv4(
        Ipv4Addr::from(src),
        Ipv4Addr::from(dst),
        &frame[tcp..],
    );
    frame[tcp + 16..tcp + 18].copy_from_slice(&tcp_checksum.to_be_bytes());
    let ip_checksum = checksum::ipv4_header(&frame[..20]);
    frame[10..12].copy_from_slice(&ip_checksum.to_be_bytes());
    frame
}

fn udp_frame(src: [u8; 4], src_port: u16, dst: [u8; 4], dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let total_len = 20 + udp_len;
    let mut frame = vec![0u8; total_len];
    frame[0] = 0x45;
    frame[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    frame[8] = 64;
    frame[9] = 17;
    frame[12..16].copy_from_slice(&src);
    frame[16..20].copy_from_slice(&dst);
    frame[20..22].copy_from_slice(&src_port.to_be_bytes());
    frame[22..24].copy_from_slice(&dst_port.to_be_bytes());
    frame[24..26].copy_from_slice(&(udp_len as u16).to_be_bytes());
    frame[28..].copy_from_slice(payload);
    let udp_checksum = checksum::udp_ipv4(Ipv4Addr::from(src), Ipv4Addr::from(dst), &frame[20..]);
    frame[26..28].copy_from_slice(&udp_checksum.to_be_bytes());
    let ip_checksum = checksum::ipv4_header(&frame[..20]);
    frame[10..12].copy_from_slice(&ip_checksum.to_be_bytes());
    frame
}

/// (flags, seq, ack) of the first TCP frame matching `predicate`.
fn find_tcp_frame(frames: &[Vec<u8>], predicate: impl Fn(u8) -> bool) -> Option<(u8, u32, u32)> {
    frames.iter().find_map(|frame| {
        if frame.len() < 40 || frame[9] != 6 {
            return None;
        }
        let header_len = ((frame[0] & 0x0F) as usize) * 4;
        let flags = frame[header_len + 13];
        if !predicate(flags) {
            return None;
        }
        let seq = u32::from_be_bytes([
            frame[header_len + 4],
            frame[header_len + 5],
            frame[header_len + 6],
            frame[header_len + 7],
        ]);
        let ack = u32::from_be_bytes([
            frame[header_len + 8],
            frame[header_len + 9],
            frame[header_len + 10],
            frame[header_len + 11],
        ]);
        Some((flags, seq, ack))
    })
}

fn poll_n(harness: &mut Harness, count: usize) {
    for _ in 0..count {
        harness.now_ms += 10;
        harness
            .manager
            .poll(SmoltInstant::from_millis(harness.now_ms));
    }
    harness.manager.tun_handle().flush(StdInstant::now(), true);
}

/// Drives the SYN -> dial -> SYN-ACK -> ACK handshake and returns
/// (handle, client_next_seq, server_next_seq).
fn establish_tcp(mut harness: &mut Harness, src_port: u16) -> (u64, u32, u32) {
    let iss = 1000;
    let syn = tcp_frame(CLIENT, src_port, SERVER, 80, iss, 0, 0x02, &[]);
    harness.manager.ingest(&syn);
    let handle = harness.dialer.dials().last().expect("dial request").3;
    assert_eq!(
        harness.manager.flow_state(handle),
        Some(AdmissionState::Pending)
    );
    harness.manager.on_dial_result(handle, Ok(()));
    poll_n(&mut harness, 3);

    let frames = harness.sink.frames();
    let (_, server_iss, ack) =
        find_tcp_frame(&frames, |flags| flags & 0x12 == 0x12).expect("SYN-ACK emitted");
    assert_eq!(ack, iss + 1);

    let ack_frame = tcp_frame(
        CLIENT,
        src_port,
        SERVER,
        80,
        iss + 1,
        server_iss.wrapping_add(1),
        0x10,
        &[],
    );
    harness.manager.ingest(&ack_frame);
    poll_n(&mut harness, 2);
    (handle, iss + 1, server_iss.wrapping_add(1))
}

#[tokio::test]
async fn tcp_syn_is_answered_only_after_dial_succeeds() {
    let mut harness = harness();
    let syn = tcp_frame(CLIENT, 40000, SERVER, 80, 7000, 0, 0x02, &[]);
    harness.manager.ingest(&syn);

    let dials = harness.dialer.dials();
    assert_eq!(dials.len(), 1);
    assert_eq!(dials[0].1, "203.0.113.80");
    assert_eq!(dials[0].2, 80);

    poll_n(&mut harness, 3);
    assert!(
        find_tcp_frame(&harness.sink.frames(), |flags| flags & 0x12 == 0x12).is_none(),
        "no SYN-ACK before the dial completes"
    );

    harness.manager.on_dial_result(dials[0].3, Ok(()));
    assert_eq!(
        harness.manager.flow_state(dials[0].3),
        Some(AdmissionState::Admitted)
    );
    poll_n(&mut harness, 3);
    let (_, _, ack) = find_tcp_frame(&harness.sink.frames(), |flags| flags & 0x12 == 0x12)
        .expect("SYN-ACK after dial");
    assert_eq!(ack, 7001);
}

#[tokio::test]
async fn dials_use_the_forward_host_name_when_known() {
    let mut harness = harness();
    harness.forward_hosts.observe(
        IpAddr::V4(Ipv4Addr::from(SERVER)),
        "api.example.com",
        None,
    );
    let syn = tcp_frame(CLIENT, 40001, SERVER, 443, 1, 0, 0x02, &[]);
    harness.manager.ingest(&syn);
    let dials = harness.dialer.dials();
    assert_eq!(dials[0].1, "api.example.com");
}

#[tokio::test]
async fn blocked_host_gets_rst_and_did_fail_without_admission_counters() {
    let settings = PolicySettings {
        blocked_hosts: vec!["Example.com".to_string()],
        latency_rules: Vec::new(),
    };
    let mut harness = harness_with(settings, FlowLimits::default());
    harness.forward_hosts.observe(
        IpAddr::V4(Ipv4Addr::from(SERVER)),
        "sub.example.COM",
        None,
    );

    let syn = tcp_frame(CLIENT, 40002, SERVER, 443, 50, 0, 0x02, &[]);
    harness.manager.ingest(&syn);

    assert!(harness.dialer.dials().is_empty(), "no dial for blocked host");
    assert_eq!(harness.manager.counters().tcp_admission_fail, 0);

    harness.manager.tun_handle().flush(StdInstant::now(), true);
    let (flags, _, ack) = find_tcp_frame(&harness.sink.frames(), |flags| flags & 0x04 != 0)
        .expect("RST emitted");
    assert_eq!(flags & 0x14, 0x14);
    assert_eq!(ack, 51, "RST acknowledges the SYN");

    let events = harness.lifecycle.events();
    assert!(events.iter().any(|event| matches!(
        event,
        LifecycleEvent::DidFail(message) if message.contains("sub.example.COM")
    )));
}

#[tokio::test]
async fn dial_failure_resets_the_flow_and_records_an_error() {
    let mut harness = harness();
    let syn = tcp_frame(CLIENT, 40003, SERVER, 80, 90, 0, 0x02, &[]);
    harness.manager.ingest(&syn);
    let handle = harness.dialer.dials()[0].3;

    harness.manager.on_dial_result(
        handle,
        Err(DialError::new(crate::error::DialErrorKind::Refused)),
    );
    harness.manager.tun_handle().flush(StdInstant::now(), true);
    assert!(
        find_tcp_frame(&harness.sink.frames(), |flags| flags & 0x04 != 0).is_some(),
        "RST after dial failure"
    );
    assert!(harness.manager.flow_state(handle).is_none(), "flow removed");
    assert!(harness.dialer.closes().is_empty(), "nothing to close host-side");
}

#[tokio::test]
async fn tcp_admission_cap_resets_excess_flows() {
    let limits = FlowLimits {
        tcp_cap: 1,
        ..FlowLimits::default()
    };
    let mut harness = harness_with(PolicySettings::default(), limits);
    harness
        .manager
        .ingest(&tcp_frame(CLIENT, 41000, SERVER, 80, 1, 0, 0x02, &[]));
    harness
        .manager
        .ingest(&tcp_frame(CLIENT, 41001, SERVER, 80, 1, 0, 0x02, &[]));

    assert_eq!(harness.dialer.dials().len(), 1);
    assert_eq!(harness.manager.counters().tcp_admission_fail, 1);
    harness.manager.tun_handle().flush(StdInstant::now(), true);
    assert!(find_tcp_frame(&harness.sink.frames(), |flags| flags & 0x04 != 0).is_some());
}

#[tokio::test]
async fn established_flow_forwards_client_bytes_to_the_dialer() {
    let mut harness = harness();
    let (handle, seq, ack) = establish_tcp(&mut harness, 42000);

    let data = tcp_frame(CLIENT, 42000, SERVER, 80, seq, ack, 0x18, b"hello remote");
    harness.manager.ingest(&data);
    poll_n(&mut harness, 3);

    let writes = harness.dialer.writes();
    let tcp_writes: Vec<_> = writes
        .iter()
        .filter(|(transport, write_handle, _)| {
            *transport == Transport::Tcp && *write_handle == handle
        })
        .collect();
    assert_eq!(tcp_writes.len(), 1);
    assert_eq!(tcp_writes[0].2, b"hello remote");
}

#[tokio::test]
async fn remote_bytes_come_back_as_in_order_tcp_segments() {
    let mut harness = harness();
    let (handle, seq, ack) = establish_tcp(&mut harness, 42001);

    assert!(harness.manager.on_tcp_receive(handle, b"first "));
    assert!(harness.manager.on_tcp_receive(handle, b"second"));
    poll_n(&mut harness, 4);

    // Collect data segments (PSH or plain ACK with payload) addressed to the
    // client and verify ordered payload bytes.
    let mut collected: Vec<(u32, Vec<u8>)> = Vec::new();
    for frame in harness.sink.frames() {
        if frame.len() < 40 || frame[9] != 6 {
            continue;
        }
        let header_len = ((frame[0] & 0x0F) as usize) * 4;
        let total_len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
        let data_offset = ((frame[header_len + 12] >> 4) as usize) * 4;
        let payload = &frame[header_len + data_offset..total_len];
        if payload.is_empty() {
            continue;
        }
        let frame_seq = u32::from_be_bytes([
            frame[header_len + 4],
            frame[header_len + 5],
            frame[header_len + 6],
            frame[header_len + 7],
        ]);
        collected.push((frame_seq, payload.to_vec()));
    }
    assert!(!collected.is_empty(), "data segments emitted");
    collected.sort_by_key(|(frame_seq, _)| *frame_seq);
    let bytes: Vec<u8> = collected.into_iter().flat_map(|(_, payload)| payload).collect();
    assert_eq!(&bytes, b"first second");
    let _ = (seq, ack);
}

#[tokio::test]
async fn send_pause_stops_acking_and_resumes_on_write_ready() {
    let mut harness = harness();
    let (handle, seq, ack) = establish_tcp(&mut harness, 42002);

    // Host cannot accept bytes: writes are truncated to zero.
    harness.dialer.set_tcp_accept_limit(Some(0));
    harness.manager.on_write_blocked(handle);
    assert_eq!(harness.manager.is_send_paused(handle), Some(true));

    let data = tcp_frame(CLIENT, 42002, SERVER, 80, seq, ack, 0x18, b"held bytes");
    harness.manager.ingest(&data);
    poll_n(&mut harness, 3);
    assert!(
        harness
            .dialer
            .writes()
            .iter()
            .all(|(transport, _, _)| *transport != Transport::Tcp),
        "no client bytes reach the host while paused"
    );

    harness.dialer.set_tcp_accept_limit(None);
    harness.manager.on_write_ready(handle);
    poll_n(&mut harness, 3);
    let writes = harness.dialer.writes();
    assert!(writes
        .iter()
        .any(|(transport, write_handle, payload)| *transport == Transport::Tcp
            && *write_handle == handle
            && payload == b"held bytes"));
}

#[tokio::test]
async fn client_fin_notifies_the_dialer_exactly_once() {
    let mut harness = harness();
    let (handle, seq, ack) = establish_tcp(&mut harness, 42003);

    let fin = tcp_frame(CLIENT, 42003, SERVER, 80, seq, ack, 0x11, &[]);
    harness.manager.ingest(&fin);
    poll_n(&mut harness, 5);

    let closes: Vec<_> = harness
        .dialer
        .closes()
        .into_iter()
        .filter(|(transport, close_handle)| {
            *transport == Transport::Tcp && *close_handle == handle
        })
        .collect();
    assert_eq!(closes.len(), 1);
}

#[tokio::test]
async fn udp_payload_buffers_until_dial_then_flushes_in_order() {
    let mut harness = harness();
    harness
        .manager
        .ingest(&udp_frame(CLIENT, 50000, SERVER, 9000, b"one"));
    let dials = harness.dialer.dials();
    assert_eq!(dials.len(), 1);
    assert_eq!(dials[0].0, Transport::Udp);
    let handle = dials[0].3;

    harness
        .manager
        .ingest(&udp_frame(CLIENT, 50000, SERVER, 9000, b"two"));
    assert!(harness.dialer.writes().is_empty(), "buffered while pending");

    harness.manager.on_dial_result(handle, Ok(()));
    let payloads: Vec<Vec<u8>> = harness
        .dialer
        .writes()
        .into_iter()
        .filter(|(transport, write_handle, _)| {
            *transport == Transport::Udp && *write_handle == handle
        })
        .map(|(_, _, payload)| payload)
        .collect();
    assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);

    // Later datagrams forward immediately.
    harness
        .manager
        .ingest(&udp_frame(CLIENT, 50000, SERVER, 9000, b"three"));
    assert_eq!(
        harness.dialer.writes().len(),
        3,
        "admitted datagrams skip the buffer"
    );
}

#[tokio::test]
async fn udp_remote_payload_is_framed_back_to_the_client() {
    let mut harness = harness();
    harness
        .manager
        .ingest(&udp_frame(CLIENT, 50001, SERVER, 9001, b"ping"));
    let handle = harness.dialer.dials()[0].3;
    harness.manager.on_dial_result(handle, Ok(()));

    assert!(harness.manager.on_udp_receive(handle, b"pong"));
    harness.manager.tun_handle().flush(StdInstant::now(), true);

    let frames = harness.sink.frames();
    let frame = frames
        .iter()
        .find(|frame| frame.len() >= 28 && frame[9] == 17)
        .expect("UDP response frame");
    assert_eq!(&frame[12..16], &SERVER, "source is the remote");
    assert_eq!(&frame[16..20], &CLIENT, "destination is the client");
    let src_port = u16::from_be_bytes([frame[20], frame[21]]);
    let dst_port = u16::from_be_bytes([frame[22], frame[23]]);
    assert_eq!(src_port, 9001);
    assert_eq!(dst_port, 50001);
    assert_eq!(&frame[28..], b"pong");
}

#[tokio::test]
async fn idle_udp_flows_are_evicted_with_a_close() {
    let mut harness = harness();
    harness
        .manager
        .ingest(&udp_frame(CLIENT, 50002, SERVER, 9002, b"x"));
    let handle = harness.dialer.dials()[0].3;
    harness.manager.on_dial_result(handle, Ok(()));

    harness
        .manager
        .backdate_activity(handle, Duration::from_secs(61));
    poll_n(&mut harness, 1);

    assert!(harness.manager.flow_state(handle).is_none());
    assert_eq!(
        harness.dialer.closes(),
        vec![(Transport::Udp, handle)]
    );
}

#[tokio::test]
async fn stuck_dials_time_out_and_reset() {
    let mut harness = harness();
    harness
        .manager
        .ingest(&tcp_frame(CLIENT, 43000, SERVER, 80, 5, 0, 0x02, &[]));
    let handle = harness.dialer.dials()[0].3;
    harness
        .manager
        .backdate_dial(handle, Duration::from_secs(20));
    poll_n(&mut harness, 1);

    assert!(harness.manager.flow_state(handle).is_none());
    assert!(
        find_tcp_frame(&harness.sink.frames(), |flags| flags & 0x04 != 0).is_some(),
        "RST emitted for timed out dial"
    );
    // The dial never completed, so there is no host-side socket to close.
    assert!(harness.dialer.closes().is_empty());
}

#[tokio::test]
async fn shaped_flows_delay_remote_payload() {
    let mut harness = harness();
    harness.forward_hosts.observe(
        IpAddr::V4(Ipv4Addr::from(SERVER)),
        "slow.example.com",
        None,
    );
    harness.manager.policy.install_rule(
        "slow.example.com",
        RuleAction::Shape(ShapingConfig {
            latency_ms: 0,
            jitter_ms: 0,
        }),
    );

    harness
        .manager
        .ingest(&udp_frame(CLIENT, 50003, SERVER, 9003, b"hi"));
    let handle = harness.dialer.dials()[0].3;
    harness.manager.on_dial_result(handle, Ok(()));

    assert!(harness.manager.on_udp_receive(handle, b"delayed"));
    harness.manager.tun_handle().flush(StdInstant::now(), true);
    assert!(
        harness
            .sink
            .frames()
            .iter()
            .all(|frame| frame.len() < 28 || frame[9] != 17),
        "payload still queued in the shaper"
    );

    // Zero-latency shaping releases on the next poll.
    poll_n(&mut harness, 1);
    let frames = harness.sink.frames();
    assert!(
        frames
            .iter()
            .any(|frame| frame.len() >= 28 && frame[9] == 17 && frame.ends_with(b"delayed")),
        "shaped payload released"
    );
}
