//! Stateless packet decoding: IPv4/IPv6 framing, TCP/UDP transport headers,
//! and the metadata extractors (DNS, TLS SNI, QUIC Initial) layered on top.
//!
//! Every entry point returns `Option`/`Err` on malformed input; nothing here
//! panics or keeps state, so the parser is safe to call from any thread.

mod dns;
mod tls;
pub mod quic;

pub use dns::parse_dns_payload;
pub use tls::sni_from_tls_record;

use crate::buffer::{IpVersion, Transport};
use crate::sample::PacketMetadata;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const DNS_PORT: u16 = 53;
const QUIC_PORT: u16 = 443;
const MAX_IPV6_EXTENSION_HEADERS: usize = 8;

/// Detailed error information for framing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    EmptyPacket,
    UnsupportedIpVersion(u8),
    MalformedIpv4Header,
    MalformedIpv6Header,
    MalformedTcpSegment,
    MalformedUdpDatagram,
}

impl FrameError {
    pub fn description(&self) -> &'static str {
        match self {
            Self::EmptyPacket => "empty packet",
            Self::UnsupportedIpVersion(_) => "unsupported IP version",
            Self::MalformedIpv4Header => "malformed IPv4 header",
            Self::MalformedIpv6Header => "malformed IPv6 header",
            Self::MalformedTcpSegment => "malformed TCP segment",
            Self::MalformedUdpDatagram => "malformed UDP datagram",
        }
    }

    #[allow(dead_code)]
    pub fn is_ip_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyPacket
                | Self::UnsupportedIpVersion(_)
                | Self::MalformedIpv4Header
                | Self::MalformedIpv6Header
        )
    }
}

#[derive(Debug, Clone)]
pub enum ParsedFrame<'a> {
    Tcp(TcpSegment<'a>),
    Udp(UdpDatagram<'a>),
    Other,
}

#[derive(Debug, Clone)]
pub struct TcpSegment<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub flags: TcpFlags,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

#[derive(Debug, Clone)]
pub struct UdpDatagram<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

/// Frames an IP packet down to the transport payload.
pub fn parse_frame(packet: &[u8]) -> Result<ParsedFrame<'_>, FrameError> {
    if packet.is_empty() {
        return Err(FrameError::EmptyPacket);
    }
    let version = packet[0] >> 4;
    match version {
        4 => parse_ipv4(packet),
        6 => parse_ipv6(packet),
        _ => Err(FrameError::UnsupportedIpVersion(version)),
    }
}

/// Full metadata extraction over a raw IP frame. Returns `None` on any
/// bounds failure.
pub fn parse(packet: &[u8]) -> Option<PacketMetadata> {
    let frame = parse_frame(packet).ok()?;
    let mut metadata = match &frame {
        ParsedFrame::Tcp(segment) => PacketMetadata {
            version: IpVersion::of(&segment.src),
            transport: Transport::Tcp,
            src: segment.src,
            dst: segment.dst,
            src_port: segment.src_port,
            dst_port: segment.dst_port,
            length: packet.len(),
            payload_length: segment.payload.len(),
            dns: None,
            tls_server_name: tls::sni_from_tls_record(segment.payload),
            quic: None,
            registrable_domain: None,
        },
        ParsedFrame::Udp(datagram) => {
            let dns = if datagram.src_port == DNS_PORT || datagram.dst_port == DNS_PORT {
                dns::parse_dns_payload(datagram.payload)
            } else {
                None
            };
            let quic = if datagram.dst_port == QUIC_PORT && dns.is_none() {
                quic::parse_quic_packet(datagram.payload)
            } else {
                None
            };
            PacketMetadata {
                version: IpVersion::of(&datagram.src),
                transport: Transport::Udp,
                src: datagram.src,
                dst: datagram.dst,
                src_port: datagram.src_port,
                dst_port: datagram.dst_port,
                length: packet.len(),
                payload_length: datagram.payload.len(),
                dns,
                tls_server_name: None,
                quic,
                registrable_domain: None,
            }
        }
        ParsedFrame::Other => return None,
    };
    metadata.registrable_domain = metadata.observed_host().map(registrable_domain);
    Some(metadata)
}

fn parse_ipv4(packet: &[u8]) -> Result<ParsedFrame<'_>, FrameError> {
    if packet.len() < 20 {
        return Err(FrameError::MalformedIpv4Header);
    }
    let header_len = usize::from(packet[0] & 0x0F) * 4;
    if header_len < 20 || header_len > packet.len() {
        return Err(FrameError::MalformedIpv4Header);
    }
    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if total_len < header_len || total_len > packet.len() {
        return Err(FrameError::MalformedIpv4Header);
    }
    let protocol = packet[9];
    let src = IpAddr::V4(Ipv4Addr::new(
        packet[12], packet[13], packet[14], packet[15],
    ));
    let dst = IpAddr::V4(Ipv4Addr::new(
        packet[16], packet[17], packet[18], packet[19],
    ));
    let payload = &packet[header_len..total_len];
    match protocol {
        6 => parse_tcp(src, dst, payload),
        17 => parse_udp(src, dst, payload),
        _ => Ok(ParsedFrame::Other),
    }
}

fn parse_ipv6(packet: &[u8]) -> Result<ParsedFrame<'_>, FrameError> {
    if packet.len() < 40 {
        return Err(FrameError::MalformedIpv6Header);
    }
    let payload_len = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    if 40 + payload_len > packet.len() {
        return Err(FrameError::MalformedIpv6Header);
    }
    let src = IpAddr::V6(ipv6_from_slice(&packet[8..24]));
    let dst = IpAddr::V6(ipv6_from_slice(&packet[24..40]));

    let mut next_header = packet[6];
    let mut offset = 40usize;
    let end = 40 + payload_len;
    for _ in 0..MAX_IPV6_EXTENSION_HEADERS {
        match next_header {
            6 => return parse_tcp(src, dst, &packet[offset..end]),
            17 => return parse_udp(src, dst, &packet[offset..end]),
            // Hop-by-hop, routing, destination options: 8-octet units.
            0 | 43 | 60 => {
                if offset + 2 > end {
                    return Err(FrameError::MalformedIpv6Header);
                }
                let ext_len = 8 + usize::from(packet[offset + 1]) * 8;
                next_header = packet[offset];
                offset = offset.checked_add(ext_len).filter(|o| *o <= end).ok_or(
                    FrameError::MalformedIpv6Header,
                )?;
            }
            // Fragment header: fixed 8 octets.
            44 => {
                if offset + 8 > end {
                    return Err(FrameError::MalformedIpv6Header);
                }
                next_header = packet[offset];
                offset += 8;
            }
            // ESP: everything after is opaque.
            50 => return Ok(ParsedFrame::Other),
            // Authentication header: length in 4-octet units plus two.
            51 => {
                if offset + 2 > end {
                    return Err(FrameError::MalformedIpv6Header);
                }
                let ext_len = (usize::from(packet[offset + 1]) + 2) * 4;
                next_header = packet[offset];
                offset = offset.checked_add(ext_len).filter(|o| *o <= end).ok_or(
                    FrameError::MalformedIpv6Header,
                )?;
            }
            _ => return Ok(ParsedFrame::Other),
        }
    }
    Ok(ParsedFrame::Other)
}

fn ipv6_from_slice(bytes: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(bytes);
    Ipv6Addr::from(octets)
}

fn parse_tcp<'a>(src: IpAddr, dst: IpAddr, payload: &'a [u8]) -> Result<ParsedFrame<'a>, FrameError> {
    if payload.len() < 20 {
        return Err(FrameError::MalformedTcpSegment);
    }
    let src_port = u16::from_be_bytes([payload[0], payload[1]]);
    let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
    let seq_number = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let ack_number = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
    let data_offset = usize::from(payload[12] >> 4) * 4;
    if data_offset < 20 || data_offset > payload.len() {
        return Err(FrameError::MalformedTcpSegment);
    }
    let flags_byte = payload[13];
    let flags = TcpFlags {
        syn: flags_byte & 0x02 != 0,
        ack: flags_byte & 0x10 != 0,
        fin: flags_byte & 0x01 != 0,
        rst: flags_byte & 0x04 != 0,
    };
    Ok(ParsedFrame::Tcp(TcpSegment {
        src,
        dst,
        src_port,
        dst_port,
        seq_number,
        ack_number,
        flags,
        payload: &payload[data_offset..],
    }))
}

fn parse_udp<'a>(src: IpAddr, dst: IpAddr, payload: &'a [u8]) -> Result<ParsedFrame<'a>, FrameError> {
    if payload.len() < 8 {
        return Err(FrameError::MalformedUdpDatagram);
    }
    let src_port = u16::from_be_bytes([payload[0], payload[1]]);
    let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
    let length = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    if length < 8 || length > payload.len() {
        return Err(FrameError::MalformedUdpDatagram);
    }
    Ok(ParsedFrame::Udp(UdpDatagram {
        src,
        dst,
        src_port,
        dst_port,
        payload: &payload[8..length],
    }))
}

/// Two-part public suffixes that keep a third label in the registrable
/// domain. Deliberately small; this is an approximation, not a PSL mirror.
const TWO_PART_TLDS: &[&str] = &[
    "co.uk", "org.uk", "gov.uk", "ac.uk", "com.au", "net.au", "org.au", "co.jp", "co.kr",
    "co.nz", "co.in", "co.za", "com.br", "com.cn", "com.tw", "com.mx", "com.ar", "com.sg",
    "com.hk",
];

/// Strips a hostname down to its registrable domain.
pub fn registrable_domain(host: &str) -> String {
    let normalized = host.trim().trim_end_matches('.').to_ascii_lowercase();
    let labels: Vec<&str> = normalized.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() <= 2 {
        return labels.join(".");
    }
    let last_two = labels[labels.len() - 2..].join(".");
    let keep = if TWO_PART_TLDS.contains(&last_two.as_str()) {
        3
    } else {
        2
    };
    labels[labels.len().saturating_sub(keep)..].join(".")
}

#[cfg(test)]
mod tests;
