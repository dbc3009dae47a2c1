//! Session metrics: cumulative counters, recent errors, and snapshot
//! emission toward a host-installed sink.

pub mod store;

use crate::buffer::Transport;
use crate::sample::Direction;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_ERROR_EVENTS: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineCounters {
    pub tcp_admission_fail: u64,
    pub udp_admission_fail: u64,
    pub tcp_backpressure_drops: u64,
    pub udp_backpressure_drops: u64,
    pub poll_iterations: u64,
    pub frames_emitted: u64,
    pub bytes_emitted: u64,
    pub flush_events: u64,
    pub inbound_frame_drops: u64,
    pub outbound_frame_drops: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub message: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsSnapshot {
    pub timestamp_ms: u64,
    pub inbound_packets: u64,
    pub inbound_bytes: u64,
    pub outbound_packets: u64,
    pub outbound_bytes: u64,
    pub active_tcp_flows: i64,
    pub active_udp_flows: i64,
    pub engine: EngineCounters,
    pub errors: Vec<ErrorEvent>,
}

pub trait MetricsSink: Send + Sync {
    fn emit(&self, snapshot: &MetricsSnapshot);
}

#[derive(Default)]
struct CollectorState {
    inbound_packets: u64,
    inbound_bytes: u64,
    outbound_packets: u64,
    outbound_bytes: u64,
    active_tcp_flows: i64,
    active_udp_flows: i64,
    engine: EngineCounters,
    errors: VecDeque<ErrorEvent>,
    dirty: bool,
}

/// Cumulative session counters. Every mutation either emits immediately
/// (`interval == 0`, used by tests) or marks the state dirty for the
/// coalescing timer. Counters are never zeroed on emit.
pub struct MetricsCollector {
    state: Mutex<CollectorState>,
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
    enabled: bool,
}

impl MetricsCollector {
    pub fn new(sink: Arc<dyn MetricsSink>, interval: Duration, enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CollectorState::default()),
            sink,
            interval,
            enabled,
        })
    }

    pub fn record(&self, direction: Direction, packets: u64, bytes: u64) {
        if !self.enabled {
            return;
        }
        {
            let mut state = self.state.lock();
            match direction {
                Direction::Inbound => {
                    state.inbound_packets += packets;
                    state.inbound_bytes += bytes;
                }
                Direction::Outbound => {
                    state.outbound_packets += packets;
                    state.outbound_bytes += bytes;
                }
            }
            state.dirty = true;
        }
        self.emit_if_immediate();
    }

    pub fn adjust_active_connections(&self, transport: Transport, delta: i64) {
        if !self.enabled {
            return;
        }
        {
            let mut state = self.state.lock();
            match transport {
                Transport::Tcp => state.active_tcp_flows += delta,
                Transport::Udp => state.active_udp_flows += delta,
            }
            state.dirty = true;
        }
        self.emit_if_immediate();
    }

    pub fn record_error(&self, message: impl Into<String>) {
        if !self.enabled {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.errors.len() >= MAX_ERROR_EVENTS {
                state.errors.pop_front();
            }
            state.errors.push_back(ErrorEvent {
                message: message.into(),
                timestamp_ms: unix_millis(),
            });
            state.dirty = true;
        }
        self.emit_if_immediate();
    }

    /// Replaces the engine counter block with the manager's cumulative view.
    pub fn record_engine(&self, counters: EngineCounters) {
        if !self.enabled {
            return;
        }
        {
            let mut state = self.state.lock();
            state.engine = counters;
            state.dirty = true;
        }
        self.emit_if_immediate();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        MetricsSnapshot {
            timestamp_ms: unix_millis(),
            inbound_packets: state.inbound_packets,
            inbound_bytes: state.inbound_bytes,
            outbound_packets: state.outbound_packets,
            outbound_bytes: state.outbound_bytes,
            active_tcp_flows: state.active_tcp_flows,
            active_udp_flows: state.active_udp_flows,
            engine: state.engine,
            errors: state.errors.iter().cloned().collect(),
        }
    }

    fn emit_if_immediate(&self) {
        if !self.interval.is_zero() {
            return;
        }
        let snapshot = self.snapshot();
        self.state.lock().dirty = false;
        self.sink.emit(&snapshot);
    }

    /// Emits a coalesced snapshot when anything changed since the last one.
    pub fn flush_if_dirty(&self) {
        let was_dirty = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.dirty)
        };
        if was_dirty {
            let snapshot = self.snapshot();
            self.sink.emit(&snapshot);
        }
    }

    /// Spawns the coalescing timer for `interval > 0` configurations.
    pub fn spawn_timer(
        self: &Arc<Self>,
        runtime: &tokio::runtime::Handle,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if self.interval.is_zero() || !self.enabled {
            return None;
        }
        let collector = Arc::clone(self);
        let interval = self.interval;
        Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                collector.flush_if_dirty();
            }
        }))
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}
