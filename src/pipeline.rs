//! Per-packet observation pipeline: parse, assign flow/burst ids, classify,
//! update the forward-host map, and feed the sample stream and metrics.

use crate::buffer::FlowKey;
use crate::classify::TrafficClassifier;
use crate::dns::ForwardHostTracker;
use crate::metrics::MetricsCollector;
use crate::parser;
use crate::sample::{unix_nanos_now, Direction, DnsMetadata, PacketMetadata, PacketSample};
use crate::stream::SampleStream;
use crate::trackers::{BurstTracker, FlowTracker};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct SamplePipeline {
    flow_tracker: FlowTracker,
    burst_tracker: BurstTracker,
    classifier: TrafficClassifier,
    forward_hosts: Arc<ForwardHostTracker>,
    stream: SampleStream,
    metrics: Arc<MetricsCollector>,
    epoch: Instant,
}

impl SamplePipeline {
    pub fn new(
        flow_tracker: FlowTracker,
        burst_tracker: BurstTracker,
        classifier: TrafficClassifier,
        forward_hosts: Arc<ForwardHostTracker>,
        stream: SampleStream,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            flow_tracker,
            burst_tracker,
            classifier,
            forward_hosts,
            stream,
            metrics,
            epoch: Instant::now(),
        }
    }

    /// Full treatment for a raw IP frame read from the tunnel.
    /// Returns the metadata so callers can reuse the parse.
    pub fn observe_outbound_frame(&mut self, frame: &[u8]) -> Option<PacketMetadata> {
        let metadata = parser::parse(frame)?;
        self.record(&metadata, Direction::Outbound);
        Some(metadata)
    }

    /// Remote payload delivered by the host for a known flow. The payload is
    /// not an IP frame, so only DNS responses (port 53 flows) yield metadata
    /// beyond sizes.
    pub fn observe_inbound_payload(&mut self, key: &FlowKey, payload: &[u8]) {
        let dns = if key.dst_port == 53 || key.src_port == 53 {
            parser::parse_dns_payload(payload)
        } else {
            None
        };
        // Inbound flows reverse the key orientation: the remote speaks.
        let metadata = PacketMetadata {
            version: key.version,
            transport: key.transport,
            src: key.dst,
            dst: key.src,
            src_port: key.dst_port,
            dst_port: key.src_port,
            length: payload.len(),
            payload_length: payload.len(),
            dns,
            tls_server_name: None,
            quic: None,
            registrable_domain: None,
        };
        self.record(&metadata, Direction::Inbound);
    }

    fn record(&mut self, metadata: &PacketMetadata, direction: Direction) {
        let now = Instant::now();
        self.update_forward_hosts(metadata, direction);

        // Flow ids are keyed on the client-oriented tuple so both directions
        // of one flow share an id.
        let key = match direction {
            Direction::Outbound => FlowKey::new(
                metadata.transport,
                metadata.src,
                metadata.src_port,
                metadata.dst,
                metadata.dst_port,
            ),
            Direction::Inbound => FlowKey::new(
                metadata.transport,
                metadata.dst,
                metadata.dst_port,
                metadata.src,
                metadata.src_port,
            ),
        };
        let flow_id = self.flow_tracker.flow_id(&key, now);
        let burst = self
            .burst_tracker
            .record(flow_id, self.elapsed(), metadata.length as u64);
        let classification = self.classifier.classify(metadata, direction, now);

        let sample = PacketSample {
            timestamp_ns: unix_nanos_now(),
            direction,
            ip_version: metadata.version,
            transport: metadata.transport,
            byte_count: metadata.length as u32,
            flow_id,
            burst_id: burst.burst_id,
            src: Some(metadata.src),
            dst: Some(metadata.dst),
            src_port: Some(metadata.src_port),
            dst_port: Some(metadata.dst_port),
            dns: metadata.dns.clone(),
            tls_server_name: metadata.tls_server_name.clone(),
            quic: metadata.quic.clone(),
            burst: Some(burst),
            classification,
        };
        self.stream.append(sample);
        self.metrics.record(direction, 1, metadata.length as u64);
    }

    fn update_forward_hosts(&self, metadata: &PacketMetadata, direction: Direction) {
        if let Some(dns) = &metadata.dns {
            if dns.is_response {
                let ttl = dns.ttl.map(|seconds| Duration::from_secs(u64::from(seconds)));
                for address in &dns.addresses {
                    // CDN edges reached through a CNAME chain still map back
                    // to the originally requested name, which is recorded
                    // last so it wins.
                    if let Some(cname) = dns.cname.as_deref() {
                        if cname != dns.query_name {
                            self.forward_hosts.observe(*address, cname, ttl);
                        }
                    }
                    self.forward_hosts.observe(*address, &dns.query_name, ttl);
                }
            }
        }
        let remote = match direction {
            Direction::Outbound => metadata.dst,
            Direction::Inbound => metadata.src,
        };
        if let Some(sni) = metadata.tls_server_name.as_deref() {
            self.forward_hosts.observe(remote, sni, None);
        }
        if let Some(sni) = metadata
            .quic
            .as_ref()
            .and_then(|quic| quic.server_name.as_deref())
        {
            self.forward_hosts.observe(remote, sni, None);
        }
    }

    fn elapsed(&self) -> Duration {
        self.epoch.elapsed()
    }
}
