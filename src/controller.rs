//! Wires the engine together for a host session: configuration intake,
//! lifecycle routing, the optional SOCKS egress, and the app-message control
//! channel.

use crate::config::Configuration;
use crate::dialer::{Dialer, LifecycleEvent, LifecycleSink};
use crate::device::PacketSink;
use crate::dns::HostResolverFn;
use crate::error::EngineError;
use crate::events::{EventCategory, EventConfidence, TrafficEvent};
use crate::logger;
use crate::metrics::store::SnapshotStore;
use crate::metrics::{MetricsSink, MetricsSnapshot};
use crate::socks::{Socks5Server, SocksConnector};
use crate::stack::policy::{RuleAction, ShapingConfig};
use crate::stream::StreamConfig;
use crate::{Engine, EngineParams, TrafficSignature};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::io;
use std::sync::Arc;

pub struct ControllerParams {
    pub configuration: Configuration,
    pub dialer: Arc<dyn Dialer>,
    pub lifecycle: Arc<dyn LifecycleSink>,
    pub packet_sink: Arc<dyn PacketSink>,
    pub metrics_sink: Option<Arc<dyn MetricsSink>>,
    pub snapshot_store: Option<Arc<SnapshotStore>>,
    pub host_resolver: Option<HostResolverFn>,
    pub signatures: Vec<TrafficSignature>,
    pub stream_config: StreamConfig,
    pub af_prefix: bool,
}

/// Metrics sink that persists every snapshot into the store; errors are
/// logged and never fatal.
struct StoreSink {
    store: Arc<SnapshotStore>,
    forward: Option<Arc<dyn MetricsSink>>,
}

impl MetricsSink for StoreSink {
    fn emit(&self, snapshot: &MetricsSnapshot) {
        if let Err(error) = self.store.append(snapshot) {
            logger::warn(format!("metrics store append failed: {error}"));
        }
        if let Some(forward) = &self.forward {
            forward.emit(snapshot);
        }
    }
}

struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn emit(&self, _snapshot: &MetricsSnapshot) {}
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum ControlRequest {
    DnsHistory,
    InstallHostRules {
        rules: Vec<HostRuleRequest>,
    },
    #[serde(rename_all = "camelCase")]
    RemoveHostRule {
        rule_id: u64,
    },
    TelemetryDrain,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostRuleRequest {
    pattern: String,
    #[serde(default)]
    block: bool,
    #[serde(default)]
    latency_ms: u32,
    #[serde(default)]
    jitter_ms: u32,
}

/// Top-level session object handed to the host: builds and starts the
/// engine, exposes control messages, and owns the alternate SOCKS egress.
pub struct ProviderController {
    engine: Arc<Engine>,
    socks: Mutex<Option<Socks5Server>>,
}

impl ProviderController {
    /// Validates configuration, builds every subsystem, and starts the poll
    /// loop. Fatal errors surface exactly once through `didFail`.
    pub fn start(params: ControllerParams) -> Result<Self, EngineError> {
        let lifecycle = Arc::clone(&params.lifecycle);
        let metrics_sink: Arc<dyn MetricsSink> = match (params.snapshot_store, params.metrics_sink)
        {
            (Some(store), forward) => Arc::new(StoreSink { store, forward }),
            (None, Some(sink)) => sink,
            (None, None) => Arc::new(NullMetricsSink),
        };
        let log_level = params.configuration.log_level().to_string();
        logger::set_breadcrumb_mask(if params.configuration.logging.enable_debug {
            u32::MAX
        } else {
            0
        });
        logger::info(format!("starting tunnel session (logLevel={log_level})"));

        let build = Engine::new(EngineParams {
            config: params.configuration,
            dialer: params.dialer,
            lifecycle: Arc::clone(&lifecycle),
            packet_sink: params.packet_sink,
            metrics_sink,
            host_resolver: params.host_resolver,
            signatures: params.signatures,
            stream_config: params.stream_config,
            af_prefix: params.af_prefix,
        });
        let engine = match build {
            Ok(engine) => engine,
            Err(error) => {
                lifecycle.on_event(LifecycleEvent::DidFail(error.to_string()));
                return Err(error);
            }
        };
        if let Err(error) = engine.start() {
            lifecycle.on_event(LifecycleEvent::DidFail(error.to_string()));
            return Err(error);
        }

        // Classified samples surface as observation events on the bus.
        let bus = engine.event_bus().clone();
        engine.sample_stream().add_stage(
            Box::new(|sample| sample.classification.is_some()),
            Box::new(move |sample| {
                let Some(classification) = sample.classification.as_ref() else {
                    return;
                };
                let confidence = if classification.confidence >= 0.8 {
                    EventConfidence::High
                } else if classification.confidence >= 0.5 {
                    EventConfidence::Medium
                } else {
                    EventConfidence::Low
                };
                let mut event = TrafficEvent::new(EventCategory::Observation, confidence);
                event = event
                    .with_detail("flowId", sample.flow_id)
                    .with_detail("burstId", sample.burst_id)
                    .with_detail("byteCount", sample.byte_count);
                if let Some(domain) = &classification.domain {
                    event = event.with_detail("domain", domain.as_str());
                }
                if let Some(label) = &classification.label {
                    event = event.with_detail("label", label.as_str());
                }
                if let Some(cdn) = &classification.cdn {
                    event = event.with_detail("cdn", cdn.as_str());
                }
                if let Some(asn) = &classification.asn {
                    event = event.with_detail("asn", asn.as_str());
                }
                bus.publish(event);
            }),
        );

        Ok(Self {
            engine: Arc::new(engine),
            socks: Mutex::new(None),
        })
    }

    pub fn stop(&self) {
        self.stop_socks();
        self.engine.stop();
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Brings up the loopback SOCKS5 egress; returns the bound port.
    pub fn start_socks(
        &self,
        connector: Arc<dyn SocksConnector>,
        port: u16,
    ) -> io::Result<u16> {
        let mut slot = self.socks.lock();
        if let Some(server) = slot.as_ref() {
            if let Some(bound) = server.bound_port() {
                return Ok(bound);
            }
        }
        let server = Socks5Server::new(connector);
        let bound = self
            .engine
            .runtime_handle()
            .block_on(server.start(port))?;
        *slot = Some(server);
        Ok(bound)
    }

    pub fn stop_socks(&self) {
        if let Some(server) = self.socks.lock().take() {
            server.stop();
        }
    }

    /// Control channel: JSON request in, JSON response out. Unknown or
    /// malformed requests answer with an `error` object instead of failing.
    pub fn handle_app_message(&self, request: &[u8]) -> Vec<u8> {
        let parsed: Result<ControlRequest, _> = serde_json::from_slice(request);
        let response = match parsed {
            Ok(ControlRequest::DnsHistory) => {
                let entries: Vec<serde_json::Value> = self
                    .engine
                    .forward_hosts()
                    .snapshot()
                    .into_iter()
                    .map(|(address, entry)| {
                        json!({
                            "address": address.to_string(),
                            "host": entry.host,
                            "ageSeconds": entry.observed_at.elapsed().as_secs(),
                        })
                    })
                    .collect();
                json!({ "kind": "dnsHistory", "entries": entries })
            }
            Ok(ControlRequest::InstallHostRules { rules }) => {
                let ids: Vec<u64> = rules
                    .into_iter()
                    .map(|rule| {
                        let action = if rule.block {
                            RuleAction::Block
                        } else {
                            RuleAction::Shape(ShapingConfig {
                                latency_ms: rule.latency_ms,
                                jitter_ms: rule.jitter_ms,
                            })
                        };
                        self.engine.policy().install_rule(&rule.pattern, action)
                    })
                    .collect();
                json!({ "kind": "installHostRules", "ruleIds": ids })
            }
            Ok(ControlRequest::RemoveHostRule { rule_id }) => {
                let removed = self.engine.policy().remove_rule(rule_id);
                json!({ "kind": "removeHostRule", "removed": removed })
            }
            Ok(ControlRequest::TelemetryDrain) => {
                let snapshot = self.engine.metrics_snapshot();
                json!({ "kind": "telemetryDrain", "metrics": snapshot })
            }
            Err(error) => json!({ "error": format!("unrecognized control message: {error}") }),
        };
        serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec())
    }
}

impl Drop for ProviderController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::NullLifecycleSink;
    use parking_lot::Mutex as PlMutex;
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    #[derive(Default)]
    struct IdleDialer;

    impl Dialer for IdleDialer {
        fn tcp_dial(&self, _host: &str, _port: u16, _handle: u64, _deadline_ms: u64) {}
        fn tcp_write(&self, _handle: u64, payload: &[u8]) -> io::Result<usize> {
            Ok(payload.len())
        }
        fn tcp_close(&self, _handle: u64) {}
        fn udp_dial(&self, _host: &str, _port: u16, _handle: u64, _deadline_ms: u64) {}
        fn udp_write(&self, _handle: u64, payload: &[u8]) -> io::Result<usize> {
            Ok(payload.len())
        }
        fn udp_close(&self, _handle: u64) {}
    }

    #[derive(Default)]
    struct DropSink;
    impl PacketSink for DropSink {
        fn emit_frames(&self, _frames: &[Vec<u8>]) {}
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

    fn controller() -> ProviderController {
        ProviderController::start(ControllerParams {
            configuration: Configuration::default(),
            dialer: Arc::new(IdleDialer),
            lifecycle: Arc::new(NullLifecycleSink),
            packet_sink: Arc::new(DropSink),
            metrics_sink: None,
            snapshot_store: None,
            host_resolver: None,
            signatures: Vec::new(),
            stream_config: StreamConfig::default(),
            af_prefix: false,
        })
        .expect("controller starts")
    }

    #[test]
    fn install_and_remove_host_rules_round_trip() {
        let controller = controller();
        let response = controller.handle_app_message(
            br#"{"kind":"installHostRules","rules":[{"pattern":"*.ads.example","block":true}]}"#,
        );
        let value: serde_json::Value = serde_json::from_slice(&response).unwrap();
        let ids = value["ruleIds"].as_array().unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(controller.engine().policy().rule_count(), 1);

        let rule_id = ids[0].as_u64().unwrap();
        let response = controller.handle_app_message(
            format!(r#"{{"kind":"removeHostRule","ruleId":{rule_id}}}"#).as_bytes(),
        );
        let value: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(value["removed"], serde_json::Value::Bool(true));
        assert_eq!(controller.engine().policy().rule_count(), 0);
        controller.stop();
    }

    #[test]
    fn dns_history_reports_observed_mappings() {
        let controller = controller();
        controller.engine().forward_hosts().observe(
            IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)),
            "seen.example.com",
            Some(Duration::from_secs(600)),
        );
        let response = controller.handle_app_message(br#"{"kind":"dnsHistory"}"#);
        let value: serde_json::Value = serde_json::from_slice(&response).unwrap();
        let entries = value["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["host"], "seen.example.com");
        assert_eq!(entries[0]["address"], "203.0.113.5");
        controller.stop();
    }

    #[test]
    fn telemetry_drain_returns_metrics_snapshot() {
        let controller = controller();
        let response = controller.handle_app_message(br#"{"kind":"telemetryDrain"}"#);
        let value: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(value["kind"], "telemetryDrain");
        assert!(value["metrics"]["inboundPackets"].is_u64());
        controller.stop();
    }

    #[test]
    fn malformed_control_messages_answer_with_an_error() {
        let controller = controller();
        let response = controller.handle_app_message(b"{\"kind\":\"unknownThing\"}");
        let value: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert!(value["error"].is_string());
        controller.stop();
    }

    #[test]
    fn invalid_configuration_emits_did_fail_once() {
        let lifecycle = Arc::new(EventLog::default());
        let mut configuration = Configuration::default();
        configuration.ipv4.subnet_mask = "not-a-mask".to_string();
        let result = ProviderController::start(ControllerParams {
            configuration,
            dialer: Arc::new(IdleDialer),
            lifecycle: Arc::clone(&lifecycle) as Arc<dyn LifecycleSink>,
            packet_sink: Arc::new(DropSink),
            metrics_sink: None,
            snapshot_store: None,
            host_resolver: None,
            signatures: Vec::new(),
            stream_config: StreamConfig::default(),
            af_prefix: false,
        });
        assert!(result.is_err());
        let events = lifecycle.events.lock();
        let failures = events
            .iter()
            .filter(|event| matches!(event, LifecycleEvent::DidFail(_)))
            .count();
        assert_eq!(failures, 1);
    }
}
