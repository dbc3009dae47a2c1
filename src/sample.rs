//! Per-packet observation records produced by the parsing pipeline.

use crate::buffer::{IpVersion, Transport};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// Client toward the network (read from the tunnel).
    Outbound,
    /// Network toward the client (written back as IP frames).
    Inbound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsMetadata {
    pub query_name: String,
    pub is_response: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub addresses: Vec<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuicPacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuicMetadata {
    pub version: u32,
    pub packet_type: QuicPacketType,
    pub dcid: Vec<u8>,
    pub scid: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

/// Everything the stateless parser can recover from a single IP frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketMetadata {
    pub version: IpVersion,
    pub transport: Transport,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub length: usize,
    pub payload_length: usize,
    pub dns: Option<DnsMetadata>,
    pub tls_server_name: Option<String>,
    pub quic: Option<QuicMetadata>,
    pub registrable_domain: Option<String>,
}

impl PacketMetadata {
    /// The hostname this packet reveals, preferring TLS/QUIC SNI over DNS.
    pub fn observed_host(&self) -> Option<&str> {
        self.tls_server_name
            .as_deref()
            .or_else(|| {
                self.quic
                    .as_ref()
                    .and_then(|quic| quic.server_name.as_deref())
            })
            .or_else(|| self.dns.as_ref().map(|dns| dns.query_name.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficClassification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cdn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asn: Option<String>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BurstSummary {
    pub burst_id: u64,
    pub packet_count: u64,
    pub byte_count: u64,
}

/// One entry in the time-windowed sample ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketSample {
    pub timestamp_ns: u64,
    pub direction: Direction,
    pub ip_version: IpVersion,
    pub transport: Transport,
    pub byte_count: u32,
    pub flow_id: u64,
    pub burst_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quic: Option<QuicMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burst: Option<BurstSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<TrafficClassification>,
}

pub fn unix_nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn metadata() -> PacketMetadata {
        PacketMetadata {
            version: IpVersion::V4,
            transport: Transport::Udp,
            src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            dst: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            src_port: 40000,
            dst_port: 53,
            length: 64,
            payload_length: 36,
            dns: Some(DnsMetadata {
                query_name: "example.com".into(),
                is_response: false,
                cname: None,
                addresses: Vec::new(),
                ttl: None,
            }),
            tls_server_name: None,
            quic: None,
            registrable_domain: Some("example.com".into()),
        }
    }

    #[test]
    fn observed_host_prefers_sni_over_dns() {
        let mut meta = metadata();
        assert_eq!(meta.observed_host(), Some("example.com"));
        meta.tls_server_name = Some("www.apple.com".into());
        assert_eq!(meta.observed_host(), Some("www.apple.com"));
    }

    #[test]
    fn samples_serialize_without_empty_fields() {
        let sample = PacketSample {
            timestamp_ns: 1,
            direction: Direction::Outbound,
            ip_version: IpVersion::V4,
            transport: Transport::Tcp,
            byte_count: 40,
            flow_id: 7,
            burst_id: 1,
            src: None,
            dst: None,
            src_port: None,
            dst_port: None,
            dns: None,
            tls_server_name: None,
            quic: None,
            burst: None,
            classification: None,
        };
        let json = serde_json::to_string(&sample).expect("serialize");
        assert!(!json.contains("dns"));
        assert!(json.contains("\"flowId\":7"));
    }
}
