//! Hand-built frames the engine emits outside of smoltcp: TCP resets for
//! refused flows, ICMP administratively-prohibited for blocked UDP, and UDP
//! responses carrying remote payload back to the client.

use super::checksum;
use super::state::EndpointKey;
use crate::parser::{TcpSegment, UdpDatagram};
use smoltcp::wire::IpAddress;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// RST+ACK answering `segment`, addressed server -> client.
pub(super) fn build_tcp_reset(segment: &TcpSegment<'_>) -> Option<Vec<u8>> {
    match (segment.src, segment.dst) {
        (IpAddr::V4(client), IpAddr::V4(server)) => {
            Some(build_ipv4_tcp_reset(client, server, segment))
        }
        (IpAddr::V6(client), IpAddr::V6(server)) => {
            Some(build_ipv6_tcp_reset(client, server, segment))
        }
        _ => None,
    }
}

/// ICMP destination-unreachable (administratively prohibited) answering a
/// blocked UDP datagram.
pub(super) fn build_icmp_block(datagram: &UdpDatagram<'_>) -> Option<Vec<u8>> {
    match (datagram.src, datagram.dst) {
        (IpAddr::V4(client), IpAddr::V4(server)) => {
            Some(build_ipv4_icmp_block(client, server, datagram))
        }
        (IpAddr::V6(client), IpAddr::V6(server)) => {
            Some(build_ipv6_icmp_block(client, server, datagram))
        }
        _ => None,
    }
}

fn tcp_ack_number(segment: &TcpSegment<'_>) -> u32 {
    (segment.payload.len() as u32)
        .wrapping_add(segment.seq_number)
        .wrapping_add(u32::from(segment.flags.syn))
        .wrapping_add(u32::from(segment.flags.fin))
}

fn build_ipv4_tcp_reset(client: Ipv4Addr, server: Ipv4Addr, segment: &TcpSegment<'_>) -> Vec<u8> {
    const IPV4_HEADER_LEN: usize = 20;
    const TCP_HEADER_LEN: usize = 20;
    let total_len = IPV4_HEADER_LEN + TCP_HEADER_LEN;
    let mut buffer = vec![0u8; total_len];

    buffer[0] = 0x45;
    buffer[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buffer[8] = 64;
    buffer[9] = 6;
    buffer[12..16].copy_from_slice(&server.octets());
    buffer[16..20].copy_from_slice(&client.octets());

    let offset = IPV4_HEADER_LEN;
    write_reset_tcp_header(&mut buffer[offset..], segment);

    let tcp_checksum = checksum::tcp_ipv4(server, client, &buffer[offset..]);
    buffer[offset + 16..offset + 18].copy_from_slice(&tcp_checksum.to_be_bytes());
    let ip_cksum = checksum::ipv4_header(&buffer[..IPV4_HEADER_LEN]);
    buffer[10..12].copy_from_slice(&ip_cksum.to_be_bytes());
    buffer
}

fn build_ipv6_tcp_reset(client: Ipv6Addr, server: Ipv6Addr, segment: &TcpSegment<'_>) -> Vec<u8> {
    const IPV6_HEADER_LEN: usize = 40;
    const TCP_HEADER_LEN: usize = 20;
    let mut buffer = vec![0u8; IPV6_HEADER_LEN + TCP_HEADER_LEN];

    buffer[0] = 0x60;
    buffer[4..6].copy_from_slice(&(TCP_HEADER_LEN as u16).to_be_bytes());
    buffer[6] = 6;
    buffer[7] = 64;
    buffer[8..24].copy_from_slice(&server.octets());
    buffer[24..40].copy_from_slice(&client.octets());

    let offset = IPV6_HEADER_LEN;
    write_reset_tcp_header(&mut buffer[offset..], segment);

    let tcp_checksum = checksum::tcp_ipv6(server, client, &buffer[offset..]);
    buffer[offset + 16..offset + 18].copy_from_slice(&tcp_checksum.to_be_bytes());
    buffer
}

fn write_reset_tcp_header(tcp: &mut [u8], segment: &TcpSegment<'_>) {
    tcp[0..2].copy_from_slice(&segment.dst_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&segment.src_port.to_be_bytes());
    let seq_number = if segment.flags.ack {
        segment.ack_number
    } else {
        0
    };
    tcp[4..8].copy_from_slice(&seq_number.to_be_bytes());
    tcp[8..12].copy_from_slice(&tcp_ack_number(segment).to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = 0x14; // RST + ACK
}

fn build_ipv4_icmp_block(client: Ipv4Addr, server: Ipv4Addr, datagram: &UdpDatagram<'_>) -> Vec<u8> {
    const IPV4_HEADER_LEN: usize = 20;
    const UDP_HEADER_LEN: usize = 8;
    const ICMP_HEADER_LEN: usize = 8;
    let quoted_payload = datagram.payload.len().min(8);
    let quoted_udp_len = UDP_HEADER_LEN + quoted_payload;
    let mut original = vec![0u8; IPV4_HEADER_LEN + quoted_udp_len];
    let original_len = original.len() as u16;

    // Quoted fragment of the blocked packet.
    original[0] = 0x45;
    original[2..4].copy_from_slice(&original_len.to_be_bytes());
    original[8] = 64;
    original[9] = 17;
    original[12..16].copy_from_slice(&client.octets());
    original[16..20].copy_from_slice(&server.octets());
    let orig_checksum = checksum::ipv4_header(&original[..IPV4_HEADER_LEN]);
    original[10..12].copy_from_slice(&orig_checksum.to_be_bytes());

    let udp_start = IPV4_HEADER_LEN;
    original[udp_start..udp_start + 2].copy_from_slice(&datagram.src_port.to_be_bytes());
    original[udp_start + 2..udp_start + 4].copy_from_slice(&datagram.dst_port.to_be_bytes());
    original[udp_start + 4..udp_start + 6].copy_from_slice(&(quoted_udp_len as u16).to_be_bytes());
    if quoted_payload > 0 {
        original[udp_start + UDP_HEADER_LEN..]
            .copy_from_slice(&datagram.payload[..quoted_payload]);
    }

    let icmp_payload_len = ICMP_HEADER_LEN + original.len();
    let total_len = IPV4_HEADER_LEN + icmp_payload_len;
    let mut buffer = vec![0u8; total_len];

    buffer[0] = 0x45;
    buffer[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buffer[8] = 64;
    buffer[9] = 1; // ICMP
    buffer[12..16].copy_from_slice(&server.octets());
    buffer[16..20].copy_from_slice(&client.octets());

    let icmp_offset = IPV4_HEADER_LEN;
    buffer[icmp_offset] = 3; // destination unreachable
    buffer[icmp_offset + 1] = 13; // administratively prohibited
    buffer[icmp_offset + 8..icmp_offset + 8 + original.len()].copy_from_slice(&original);

    let icmp_checksum =
        checksum::ones_complement(0, &buffer[icmp_offset..icmp_offset + icmp_payload_len]);
    buffer[icmp_offset + 2..icmp_offset + 4].copy_from_slice(&icmp_checksum.to_be_bytes());
    let ip_cksum = checksum::ipv4_header(&buffer[..IPV4_HEADER_LEN]);
    buffer[10..12].copy_from_slice(&ip_cksum.to_be_bytes());
    buffer
}

fn build_ipv6_icmp_block(client: Ipv6Addr, server: Ipv6Addr, datagram: &UdpDatagram<'_>) -> Vec<u8> {
    const IPV6_HEADER_LEN: usize = 40;
    const UDP_HEADER_LEN: usize = 8;
    const ICMPV6_HEADER_LEN: usize = 8;
    let quoted_payload = datagram.payload.len().min(8);
    let quoted_udp_len = UDP_HEADER_LEN + quoted_payload;
    let mut original = vec![0u8; IPV6_HEADER_LEN + quoted_udp_len];

    original[0] = 0x60;
    original[4..6].copy_from_slice(&(quoted_udp_len as u16).to_be_bytes());
    original[6] = 17;
    original[7] = 64;
    original[8..24].copy_from_slice(&client.octets());
    original[24..40].copy_from_slice(&server.octets());

    let udp_start = IPV6_HEADER_LEN;
    original[udp_start..udp_start + 2].copy_from_slice(&datagram.src_port.to_be_bytes());
    original[udp_start + 2..udp_start + 4].copy_from_slice(&datagram.dst_port.to_be_bytes());
    original[udp_start + 4..udp_start + 6].copy_from_slice(&(quoted_udp_len as u16).to_be_bytes());
    if quoted_payload > 0 {
        original[udp_start + UDP_HEADER_LEN..]
            .copy_from_slice(&datagram.payload[..quoted_payload]);
    }

    let icmp_payload_len = ICMPV6_HEADER_LEN + original.len();
    let total_len = IPV6_HEADER_LEN + icmp_payload_len;
    let mut buffer = vec![0u8; total_len];

    buffer[0] = 0x60;
    buffer[4..6].copy_from_slice(&(icmp_payload_len as u16).to_be_bytes());
    buffer[6] = 58; // ICMPv6
    buffer[7] = 64;
    buffer[8..24].copy_from_slice(&server.octets());
    buffer[24..40].copy_from_slice(&client.octets());

    let icmp_offset = IPV6_HEADER_LEN;
    buffer[icmp_offset] = 1; // destination unreachable
    buffer[icmp_offset + 1] = 1; // administratively prohibited
    buffer[icmp_offset + 8..icmp_offset + 8 + original.len()].copy_from_slice(&original);

    let icmp_checksum =
        checksum::icmpv6(server, client, &buffer[icmp_offset..icmp_offset + icmp_payload_len]);
    buffer[icmp_offset + 2..icmp_offset + 4].copy_from_slice(&icmp_checksum.to_be_bytes());
    buffer
}

/// UDP response (server -> client) for the flow identified by `key`.
/// The key stores src = client, dst = server, so both swap here.
pub(super) fn build_udp_response(key: &EndpointKey, payload: &[u8]) -> Option<Vec<u8>> {
    match (key.src_ip, key.dst_ip) {
        (IpAddress::Ipv4(client), IpAddress::Ipv4(server)) => Some(build_ipv4_udp_response(
            Ipv4Addr::from(server.0),
            Ipv4Addr::from(client.0),
            key.dst_port,
            key.src_port,
            payload,
        )),
        (IpAddress::Ipv6(client), IpAddress::Ipv6(server)) => Some(build_ipv6_udp_response(
            Ipv6Addr::from(server.0),
            Ipv6Addr::from(client.0),
            key.dst_port,
            key.src_port,
            payload,
        )),
        _ => None,
    }
}

fn build_ipv4_udp_response(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    const IPV4_HEADER_LEN: usize = 20;
    const UDP_HEADER_LEN: usize = 8;

    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    let mut buffer = vec![0u8; total_len];

    buffer[0] = 0x45;
    buffer[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buffer[8] = 64;
    buffer[9] = 17;
    buffer[12..16].copy_from_slice(&src.octets());
    buffer[16..20].copy_from_slice(&dst.octets());

    let udp_offset = IPV4_HEADER_LEN;
    buffer[udp_offset..udp_offset + 2].copy_from_slice(&src_port.to_be_bytes());
    buffer[udp_offset + 2..udp_offset + 4].copy_from_slice(&dst_port.to_be_bytes());
    buffer[udp_offset + 4..udp_offset + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buffer[udp_offset + UDP_HEADER_LEN..].copy_from_slice(payload);

    let udp_checksum = checksum::udp_ipv4(src, dst, &buffer[udp_offset..]);
    buffer[udp_offset + 6..udp_offset + 8].copy_from_slice(&udp_checksum.to_be_bytes());
    let ip_cksum = checksum::ipv4_header(&buffer[..IPV4_HEADER_LEN]);
    buffer[10..12].copy_from_slice(&ip_cksum.to_be_bytes());
    buffer
}

fn build_ipv6_udp_response(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    const IPV6_HEADER_LEN: usize = 40;
    const UDP_HEADER_LEN: usize = 8;

    let udp_len = UDP_HEADER_LEN + payload.len();
    let mut buffer = vec![0u8; IPV6_HEADER_LEN + udp_len];

    buffer[0] = 0x60;
    buffer[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buffer[6] = 17;
    buffer[7] = 64;
    buffer[8..24].copy_from_slice(&src.octets());
    buffer[24..40].copy_from_slice(&dst.octets());

    let udp_offset = IPV6_HEADER_LEN;
    buffer[udp_offset..udp_offset + 2].copy_from_slice(&src_port.to_be_bytes());
    buffer[udp_offset + 2..udp_offset + 4].copy_from_slice(&dst_port.to_be_bytes());
    buffer[udp_offset + 4..udp_offset + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buffer[udp_offset + UDP_HEADER_LEN..].copy_from_slice(payload);

    // UDP checksum is mandatory over IPv6.
    let udp_checksum = checksum::udp_ipv6(src, dst, &buffer[udp_offset..]);
    buffer[udp_offset + 6..udp_offset + 8].copy_from_slice(&udp_checksum.to_be_bytes());
    buffer
}
