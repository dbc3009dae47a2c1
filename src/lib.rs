//! Userspace packet-tunnel engine.
//!
//! The engine terminates every TCP and UDP flow the operating system routes
//! into a tun-like device, relaying payload through host-supplied outbound
//! sockets while classifying traffic, enforcing policy, and emitting
//! metrics. The host talks to the engine through capability traits
//! ([`Dialer`], [`PacketSink`], [`LifecycleSink`], [`MetricsSink`]) and a
//! handful of message-oriented entry points; the engine never performs
//! blocking I/O itself.

#![forbid(unsafe_code)]

mod buffer;
mod classify;
mod config;
mod controller;
mod device;
mod dialer;
mod dns;
mod error;
mod events;
pub mod logger;
mod metrics;
mod parser;
mod pipeline;
mod sample;
mod socks;
mod stack;
mod stream;
mod trackers;

pub use buffer::{BufferPool, FlowKey, IpVersion, Transport};
pub use classify::{TrafficClassifier, TrafficSignature};
pub use config::{Configuration, MemoryBudget};
pub use controller::{ControllerParams, ProviderController};
pub use device::{PacketSink, TunHandle, AF_INET6_WORD, AF_INET_WORD};
pub use dialer::{DialError, Dialer, LifecycleEvent, LifecycleSink, NullLifecycleSink};
pub use dns::{EngineResolver, ForwardHostTracker, HostResolverFn};
pub use error::{DialErrorKind, EngineError};
pub use events::{
    EventCategory, EventConfidence, EventListener, Redactor, TrafficEvent, TrafficEventBus,
};
pub use metrics::store::{SnapshotStore, StoreFormat};
pub use metrics::{EngineCounters, MetricsCollector, MetricsSink, MetricsSnapshot};
pub use parser::{parse, registrable_domain};
pub use sample::{Direction, PacketMetadata, PacketSample, TrafficClassification};
pub use socks::{
    DirectConnector, Socks5Server, SocksAddress, SocksBind, SocksConnector, SocksDatagram,
    SocksStream,
};
pub use stack::policy::{PolicyManager, RuleAction, ShapingConfig};
pub use stack::{AdmissionState, FlowLimits};
pub use stream::{SampleStream, StreamConfig};

use crate::pipeline::SamplePipeline;
use crate::stack::{FlowManager, StackParams};
use crate::trackers::{BurstTracker, FlowTracker};
use parking_lot::Mutex;
use smoltcp::time::Instant as SmoltInstant;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

const POLL_TICK: Duration = Duration::from_millis(5);
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Work items pushed from host threads onto the poll thread.
enum EngineEvent {
    Frame(Vec<u8>),
    DialResult {
        handle: u64,
        result: Result<(), DialError>,
    },
    TcpReceive {
        handle: u64,
        payload: Vec<u8>,
    },
    UdpReceive {
        handle: u64,
        payload: Vec<u8>,
    },
    TcpClose {
        handle: u64,
        reason: Option<String>,
    },
    UdpClose {
        handle: u64,
        reason: Option<String>,
    },
    WriteBlocked {
        handle: u64,
    },
    WriteReady {
        handle: u64,
    },
}

pub struct EngineParams {
    pub config: Configuration,
    pub dialer: Arc<dyn Dialer>,
    pub lifecycle: Arc<dyn LifecycleSink>,
    pub packet_sink: Arc<dyn PacketSink>,
    pub metrics_sink: Arc<dyn MetricsSink>,
    pub host_resolver: Option<HostResolverFn>,
    pub signatures: Vec<TrafficSignature>,
    pub stream_config: StreamConfig,
    /// Prepend the 4-byte address-family word to emitted frames.
    pub af_prefix: bool,
}

/// The tunnel engine: device, stack, flow manager, and observation pipeline
/// wired together. Constructed stopped; [`Engine::start`] spawns the poll
/// loop.
pub struct Engine {
    runtime: Runtime,
    events_tx: crossbeam_channel::Sender<EngineEvent>,
    events_rx: Mutex<Option<crossbeam_channel::Receiver<EngineEvent>>>,
    wake: Arc<Notify>,
    tun: TunHandle,
    pool: Arc<BufferPool>,
    pool_drops: AtomicU64,
    pipeline: Arc<Mutex<SamplePipeline>>,
    manager: Mutex<Option<FlowManager>>,
    running: Arc<AtomicBool>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    metrics_task: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Arc<dyn LifecycleSink>,
    stream: SampleStream,
    bus: TrafficEventBus,
    metrics: Arc<MetricsCollector>,
    forward_hosts: Arc<ForwardHostTracker>,
    policy: Arc<PolicyManager>,
    resolver: Arc<EngineResolver>,
}

impl Engine {
    pub fn new(params: EngineParams) -> Result<Self, EngineError> {
        let EngineParams {
            config,
            dialer,
            lifecycle,
            packet_sink,
            metrics_sink,
            host_resolver,
            signatures,
            stream_config,
            af_prefix,
        } = params;

        let warnings = config.validate()?;
        for warning in &warnings {
            logger::warn(format!("configuration: {warning}"));
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .enable_time()
            .enable_io()
            .build()
            .map_err(|error| EngineError::EngineStartFailed(error.to_string()))?;

        let mtu = config.effective_mtu();
        let memory = config.memory.effective();
        let wake = Arc::new(Notify::new());
        let device =
            device::TunDevice::new(mtu, Arc::clone(&wake), device::RING_CAPACITY, af_prefix);
        let tun = device.handle();
        tun.start_read_loop(packet_sink);

        let pool = Arc::new(BufferPool::new(memory.packet_pool_bytes as usize, mtu));
        let forward_hosts = Arc::new(ForwardHostTracker::new(dns::FORWARD_HOST_CAPACITY));
        let policy = PolicyManager::new(&config.policies);
        let interval = Duration::from_secs_f64(config.metrics.reporting_interval.max(0.0));
        let metrics = MetricsCollector::new(metrics_sink, interval, config.metrics.is_enabled);
        let stream = SampleStream::spawn(stream_config, runtime.handle());
        let bus = TrafficEventBus::spawn(
            Redactor::new(false, Vec::<String>::new()),
            runtime.handle(),
        );
        let resolver = Arc::new(EngineResolver::new(
            host_resolver,
            config.dns.use_system_resolver,
            Arc::clone(&forward_hosts),
        ));
        let pipeline = Arc::new(Mutex::new(SamplePipeline::new(
            FlowTracker::new(trackers::DEFAULT_FLOW_TTL, memory.max_flows as usize * 8),
            BurstTracker::new(trackers::DEFAULT_BURST_GAP, memory.max_flows as usize * 8),
            TrafficClassifier::new(&signatures, classify::DEFAULT_MAX_ENTRIES),
            Arc::clone(&forward_hosts),
            stream.clone(),
            Arc::clone(&metrics),
        )));

        let limits = FlowLimits {
            max_flows: memory.max_flows as usize,
            per_flow_buffer_bytes: memory.per_flow_buffer_bytes as usize,
            ..FlowLimits::default()
        };
        let ipv4_gateway: IpAddr = config
            .ipv4
            .remote_address
            .parse()
            .map_err(|_| EngineError::NetworkSettingsFailed("bad ipv4 gateway".to_string()))?;
        let ipv6_gateway = config
            .ipv6
            .as_ref()
            .and_then(|ipv6| ipv6.address.parse::<IpAddr>().ok());

        let manager = FlowManager::new(StackParams {
            device,
            wake: Arc::clone(&wake),
            dialer,
            lifecycle: Arc::clone(&lifecycle),
            policy: Arc::clone(&policy),
            forward_hosts: Arc::clone(&forward_hosts),
            metrics: Arc::clone(&metrics),
            pipeline: Arc::clone(&pipeline),
            limits,
            ipv4_gateway,
            ipv6_gateway,
            tcp_buffer_size: memory.per_flow_buffer_bytes as usize,
        });

        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_QUEUE_CAPACITY);
        logger::breadcrumb(
            logger::BreadcrumbFlags::DEVICE,
            format!("engine initialized (mtu={mtu}, max_flows={})", memory.max_flows),
        );

        Ok(Self {
            runtime,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            wake,
            tun,
            pool,
            pool_drops: AtomicU64::new(0),
            pipeline,
            manager: Mutex::new(Some(manager)),
            running: Arc::new(AtomicBool::new(false)),
            poll_task: Mutex::new(None),
            metrics_task: Mutex::new(None),
            lifecycle,
            stream,
            bus,
            metrics,
            forward_hosts,
            policy,
            resolver,
        })
    }

    /// Spawns the poll loop. A second call is an error.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut manager = match self.manager.lock().take() {
            Some(manager) => manager,
            None => {
                return Err(EngineError::EngineStartFailed(
                    "engine already started".to_string(),
                ))
            }
        };
        let events_rx = match self.events_rx.lock().take() {
            Some(rx) => rx,
            None => {
                return Err(EngineError::EngineStartFailed(
                    "engine already started".to_string(),
                ))
            }
        };

        self.lifecycle.on_event(LifecycleEvent::WillStart);
        self.running.store(true, Ordering::SeqCst);

        let running = Arc::clone(&self.running);
        let wake = Arc::clone(&self.wake);
        let lifecycle = Arc::clone(&self.lifecycle);
        let pool = Arc::clone(&self.pool);
        let handle = self.runtime.spawn(async move {
            lifecycle.on_event(LifecycleEvent::DidStart);
            let epoch = StdInstant::now();
            let mut ticker = time::interval(POLL_TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = wake.notified() => {}
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                while let Ok(event) = events_rx.try_recv() {
                    match event {
                        EngineEvent::Frame(frame) => {
                            manager.ingest(&frame);
                            pool.release(frame);
                        }
                        EngineEvent::DialResult { handle, result } => {
                            manager.on_dial_result(handle, result)
                        }
                        EngineEvent::TcpReceive { handle, payload } => {
                            manager.on_tcp_receive(handle, &payload);
                        }
                        EngineEvent::UdpReceive { handle, payload } => {
                            manager.on_udp_receive(handle, &payload);
                        }
                        EngineEvent::TcpClose { handle, reason } => {
                            manager.on_tcp_close(handle, reason.as_deref())
                        }
                        EngineEvent::UdpClose { handle, reason } => {
                            manager.on_udp_close(handle, reason.as_deref())
                        }
                        EngineEvent::WriteBlocked { handle } => manager.on_write_blocked(handle),
                        EngineEvent::WriteReady { handle } => manager.on_write_ready(handle),
                    }
                }
                let millis = epoch.elapsed().as_millis().min(i64::MAX as u128) as i64;
                manager.poll(SmoltInstant::from_millis(millis));
            }
            manager.shutdown();
            lifecycle.on_event(LifecycleEvent::DidStop);
        });
        *self.poll_task.lock() = Some(handle);
        *self.metrics_task.lock() = self.metrics.spawn_timer(self.runtime.handle());
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.wake.notify_waiters();
        if let Some(task) = self.metrics_task.lock().take() {
            task.abort();
        }
        // The poll task observes the flag, shuts flows down, and reports
        // DidStop on its own.
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Host entry points
    // ------------------------------------------------------------------

    /// One raw IP frame read from the tunnel. Returns `false` when the frame
    /// was dropped (unparseable, budget exhausted, or queue full).
    pub fn handle_packet(&self, frame: &[u8]) -> bool {
        if frame.is_empty() {
            return false;
        }
        let parsed = self.pipeline.lock().observe_outbound_frame(frame).is_some();
        if !parsed {
            return false;
        }
        let Some(mut buffer) = self.pool.acquire() else {
            self.pool_drops.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        buffer.extend_from_slice(frame);
        if self
            .events_tx
            .try_send(EngineEvent::Frame(buffer))
            .is_err()
        {
            self.pool_drops.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.wake.notify_one();
        true
    }

    pub fn on_dial_result(&self, handle: u64, result: Result<(), DialError>) {
        self.push_event(EngineEvent::DialResult { handle, result });
    }

    pub fn on_tcp_receive(&self, handle: u64, payload: &[u8]) {
        self.push_event(EngineEvent::TcpReceive {
            handle,
            payload: payload.to_vec(),
        });
    }

    pub fn on_udp_receive(&self, handle: u64, payload: &[u8]) {
        self.push_event(EngineEvent::UdpReceive {
            handle,
            payload: payload.to_vec(),
        });
    }

    pub fn on_tcp_close(&self, handle: u64, reason: Option<&str>) {
        self.push_event(EngineEvent::TcpClose {
            handle,
            reason: reason.map(str::to_string),
        });
    }

    pub fn on_udp_close(&self, handle: u64, reason: Option<&str>) {
        self.push_event(EngineEvent::UdpClose {
            handle,
            reason: reason.map(str::to_string),
        });
    }

    pub fn on_write_blocked(&self, handle: u64) {
        self.push_event(EngineEvent::WriteBlocked { handle });
    }

    pub fn on_write_ready(&self, handle: u64) {
        self.push_event(EngineEvent::WriteReady { handle });
    }

    fn push_event(&self, event: EngineEvent) {
        if self.events_tx.try_send(event).is_err() {
            logger::warn("engine event queue full, dropping event");
        }
        self.wake.notify_one();
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn sample_stream(&self) -> &SampleStream {
        &self.stream
    }

    pub fn event_bus(&self) -> &TrafficEventBus {
        &self.bus
    }

    pub fn policy(&self) -> &Arc<PolicyManager> {
        &self.policy
    }

    pub fn forward_hosts(&self) -> &Arc<ForwardHostTracker> {
        &self.forward_hosts
    }

    pub fn resolver(&self) -> &Arc<EngineResolver> {
        &self.resolver
    }

    pub fn runtime_handle(&self) -> tokio::runtime::Handle {
        self.runtime.handle().clone()
    }

    pub fn is_backpressured(&self) -> bool {
        self.tun.is_backpressured()
    }

    pub fn buffer_pool_drops(&self) -> u64 {
        self.pool_drops.load(Ordering::Relaxed)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::io;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDialer {
        dials: PlMutex<Vec<(Transport, String, u16, u64)>>,
        writes: PlMutex<Vec<(u64, Vec<u8>)>>,
    }

    impl Dialer for RecordingDialer {
        fn tcp_dial(&self, host: &str, port: u16, handle: u64, _deadline_ms: u64) {
            self.dials
                .lock()
                .push((Transport::Tcp, host.to_string(), port, handle));
        }
        fn tcp_write(&self, handle: u64, payload: &[u8]) -> io::Result<usize> {
            self.writes.lock().push((handle, payload.to_vec()));
            Ok(payload.len())
        }
        fn tcp_close(&self, _handle: u64) {}
        fn udp_dial(&self, host: &str, port: u16, handle: u64, _deadline_ms: u64) {
            self.dials
                .lock()
                .push((Transport::Udp, host.to_string(), port, handle));
        }
        fn udp_write(&self, handle: u64, payload: &[u8]) -> io::Result<usize> {
            self.writes.lock().push((handle, payload.to_vec()));
            Ok(payload.len())
        }
        fn udp_close(&self, _handle: u64) {}
    }

    #[derive(Default)]
    struct FrameCapture {
        frames: PlMutex<Vec<Vec<u8>>>,
    }

    impl PacketSink for FrameCapture {
        fn emit_frames(&self, frames: &[Vec<u8>]) {
            self.frames.lock().extend(frames.iter().cloned());
        }
    }

    struct NullMetrics;
    impl MetricsSink for NullMetrics {
        fn emit(&self, _snapshot: &MetricsSnapshot) {}
    }

    #[derive(Default)]
    struct EventLog {
        events: PlMutex<Vec<LifecycleEvent>>,
    }

    impl LifecycleSink for EventLog {
        fn on_event(&self, event: LifecycleEvent) {
            self.events.lock().push(event);
        }
    }

    fn udp_frame(payload: &[u8]) -> Vec<u8> {
        let udp_len = 8 + payload.len();
        let total_len = 20 + udp_len;
        let mut frame = vec![0u8; total_len];
        frame[0] = 0x45;
        frame[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        frame[8] = 64;
        frame[9] = 17;
        frame[12..16].copy_from_slice(&[10, 0, 0, 2]);
        frame[16..20].copy_from_slice(&[203, 0, 113, 40]);
        frame[20..22].copy_from_slice(&47000u16.to_be_bytes());
        frame[22..24].copy_from_slice(&9999u16.to_be_bytes());
        frame[24..26].copy_from_slice(&(udp_len as u16).to_be_bytes());
        frame[28..].copy_from_slice(payload);
        frame
    }

    fn wait_until(mut probe: impl FnMut() -> bool) -> bool {
        let deadline = StdInstant::now() + Duration::from_secs(2);
        while StdInstant::now() < deadline {
            if probe() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn engine_relays_a_udp_flow_end_to_end() {
        let dialer = Arc::new(RecordingDialer::default());
        let sink = Arc::new(FrameCapture::default());
        let lifecycle = Arc::new(EventLog::default());
        let engine = Engine::new(EngineParams {
            config: Configuration::default(),
            dialer: Arc::clone(&dialer) as Arc<dyn Dialer>,
            lifecycle: Arc::clone(&lifecycle) as Arc<dyn LifecycleSink>,
            packet_sink: Arc::clone(&sink) as Arc<dyn PacketSink>,
            metrics_sink: Arc::new(NullMetrics) as Arc<dyn MetricsSink>,
            host_resolver: None,
            signatures: Vec::new(),
            stream_config: StreamConfig::default(),
            af_prefix: false,
        })
        .expect("engine builds");
        engine.start().expect("engine starts");

        assert!(engine.handle_packet(&udp_frame(b"query")));
        assert!(
            wait_until(|| !dialer.dials.lock().is_empty()),
            "dial requested"
        );
        let (transport, host, port, handle) = dialer.dials.lock()[0].clone();
        assert_eq!(transport, Transport::Udp);
        assert_eq!(host, "203.0.113.40");
        assert_eq!(port, 9999);

        engine.on_dial_result(handle, Ok(()));
        assert!(
            wait_until(|| dialer.writes.lock().iter().any(|(_, p)| p == b"query")),
            "buffered payload forwarded after dial"
        );

        engine.on_udp_receive(handle, b"answer");
        assert!(
            wait_until(|| sink
                .frames
                .lock()
                .iter()
                .any(|frame| frame.ends_with(b"answer"))),
            "response framed back to the tunnel"
        );

        engine.stop();
        assert!(
            wait_until(|| lifecycle
                .events
                .lock()
                .iter()
                .any(|event| *event == LifecycleEvent::DidStop)),
            "DidStop delivered"
        );
        let events = lifecycle.events.lock().clone();
        assert_eq!(events[0], LifecycleEvent::WillStart);
        assert!(events.contains(&LifecycleEvent::DidStart));
    }

    #[test]
    fn engine_rejects_invalid_configuration() {
        let mut config = Configuration::default();
        config.ipv4.address = "bogus".to_string();
        let result = Engine::new(EngineParams {
            config,
            dialer: Arc::new(RecordingDialer::default()) as Arc<dyn Dialer>,
            lifecycle: Arc::new(NullLifecycleSink) as Arc<dyn LifecycleSink>,
            packet_sink: Arc::new(FrameCapture::default()) as Arc<dyn PacketSink>,
            metrics_sink: Arc::new(NullMetrics) as Arc<dyn MetricsSink>,
            host_resolver: None,
            signatures: Vec::new(),
            stream_config: StreamConfig::default(),
            af_prefix: false,
        });
        assert!(matches!(
            result,
            Err(EngineError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn second_start_is_rejected() {
        let engine = Engine::new(EngineParams {
            config: Configuration::default(),
            dialer: Arc::new(RecordingDialer::default()) as Arc<dyn Dialer>,
            lifecycle: Arc::new(NullLifecycleSink) as Arc<dyn LifecycleSink>,
            packet_sink: Arc::new(FrameCapture::default()) as Arc<dyn PacketSink>,
            metrics_sink: Arc::new(NullMetrics) as Arc<dyn MetricsSink>,
            host_resolver: None,
            signatures: Vec::new(),
            stream_config: StreamConfig::default(),
            af_prefix: false,
        })
        .expect("engine builds");
        engine.start().expect("first start");
        assert!(engine.start().is_err());
        engine.stop();
    }
}
