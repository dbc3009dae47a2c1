use super::*;
use crate::buffer::Transport;
use crate::sample::QuicPacketType;

fn build_ipv4(protocol: u8, ihl: usize, src: [u8; 4], dst: [u8; 4], l4: &[u8]) -> Vec<u8> {
    let header_len = ihl * 4;
    let total_len = header_len + l4.len();
    let mut packet = vec![0u8; total_len];
    packet[0] = 0x40 | ihl as u8;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = protocol;
    packet[12..16].copy_from_slice(&src);
    packet[16..20].copy_from_slice(&dst);
    packet[header_len..].copy_from_slice(l4);
    packet
}

fn build_tcp_l4(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut segment = vec![0u8; 20 + payload.len()];
    segment[0..2].copy_from_slice(&src_port.to_be_bytes());
    segment[2..4].copy_from_slice(&dst_port.to_be_bytes());
    segment[12] = 5 << 4;
    segment[13] = 0x18; // PSH + ACK
    segment[20..].copy_from_slice(payload);
    segment
}

fn build_udp_l4(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut datagram = vec![0u8; 8 + payload.len()];
    datagram[0..2].copy_from_slice(&src_port.to_be_bytes());
    datagram[2..4].copy_from_slice(&dst_port.to_be_bytes());
    datagram[4..6].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    datagram[8..].copy_from_slice(payload);
    datagram
}

fn build_dns_query(host: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&[0x12, 0x34]); // id
    payload.extend_from_slice(&[0x01, 0x00]); // RD
    payload.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
    payload.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    dns::encode_name(host, &mut payload);
    payload.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // QTYPE A, QCLASS IN
    payload
}

fn build_dns_response(host: &str, cname: Option<&str>, addr: [u8; 4], ttl: u32) -> Vec<u8> {
    let an_count: u16 = if cname.is_some() { 2 } else { 1 };
    let mut payload = Vec::new();
    payload.extend_from_slice(&[0x12, 0x34]);
    payload.extend_from_slice(&[0x81, 0x80]); // QR + RD + RA
    payload.extend_from_slice(&[0x00, 0x01]);
    payload.extend_from_slice(&an_count.to_be_bytes());
    payload.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    dns::encode_name(host, &mut payload);
    payload.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    if let Some(target) = cname {
        payload.extend_from_slice(&[0xC0, 0x0C]); // pointer to question name
        payload.extend_from_slice(&[0x00, 0x05, 0x00, 0x01]);
        payload.extend_from_slice(&ttl.to_be_bytes());
        let mut encoded = Vec::new();
        dns::encode_name(target, &mut encoded);
        payload.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
        payload.extend_from_slice(&encoded);
    }
    payload.extend_from_slice(&[0xC0, 0x0C]);
    payload.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    payload.extend_from_slice(&ttl.to_be_bytes());
    payload.extend_from_slice(&[0x00, 0x04]);
    payload.extend_from_slice(&addr);
    payload
}

#[test]
fn ipv4_tcp_round_trips_for_every_ihl() {
    for ihl in 5..=15usize {
        let l4 = build_tcp_l4(40000, 443, b"hello");
        let packet = build_ipv4(6, ihl, [10, 0, 0, 2], [93, 184, 216, 34], &l4);
        let metadata = parse(&packet).expect("parse");
        assert_eq!(metadata.transport, Transport::Tcp);
        assert_eq!(metadata.src.to_string(), "10.0.0.2");
        assert_eq!(metadata.dst.to_string(), "93.184.216.34");
        assert_eq!(metadata.src_port, 40000);
        assert_eq!(metadata.dst_port, 443);
        assert_eq!(metadata.length, packet.len());
    }
}

#[test]
fn truncated_headers_return_none() {
    assert!(parse(&[]).is_none());
    assert!(parse(&[0x45, 0x00]).is_none());
    // IHL larger than the packet.
    let l4 = build_tcp_l4(1, 2, &[]);
    let mut packet = build_ipv4(6, 5, [10, 0, 0, 2], [10, 0, 0, 3], &l4);
    packet[0] = 0x4F;
    assert!(parse(&packet).is_none());
    // Version nibble neither 4 nor 6.
    packet[0] = 0x55;
    assert!(parse(&packet).is_none());
}

#[test]
fn dns_query_yields_name_and_registrable_domain() {
    let payload = build_dns_query("example.com");
    let l4 = build_udp_l4(40000, 53, &payload);
    let packet = build_ipv4(17, 5, [10, 0, 0, 2], [8, 8, 8, 8], &l4);
    let metadata = parse(&packet).expect("parse");
    assert_eq!(metadata.transport, Transport::Udp);
    assert_eq!(metadata.dst_port, 53);
    let dns = metadata.dns.as_ref().expect("dns metadata");
    assert_eq!(dns.query_name, "example.com");
    assert!(!dns.is_response);
    assert_eq!(metadata.registrable_domain.as_deref(), Some("example.com"));
}

#[test]
fn dns_response_carries_cname_and_addresses() {
    let payload = build_dns_response("www.example.com", Some("edge.cdn.net"), [203, 0, 113, 5], 120);
    let l4 = build_udp_l4(53, 40000, &payload);
    let packet = build_ipv4(17, 5, [8, 8, 8, 8], [10, 0, 0, 2], &l4);
    let metadata = parse(&packet).expect("parse");
    let dns = metadata.dns.expect("dns metadata");
    assert!(dns.is_response);
    assert_eq!(dns.cname.as_deref(), Some("edge.cdn.net"));
    assert_eq!(dns.addresses.len(), 1);
    assert_eq!(dns.addresses[0].to_string(), "203.0.113.5");
    assert_eq!(dns.ttl, Some(120));
}

#[test]
fn tls_client_hello_sni_is_recovered() {
    let hello = tls::build_client_hello("www.apple.com");
    let record = tls::wrap_in_record(&hello);
    let l4 = build_tcp_l4(40000, 443, &record);
    let packet = build_ipv4(6, 5, [10, 0, 0, 2], [17, 253, 144, 10], &l4);
    let metadata = parse(&packet).expect("parse");
    assert_eq!(metadata.tls_server_name.as_deref(), Some("www.apple.com"));
    assert_eq!(metadata.registrable_domain.as_deref(), Some("apple.com"));
}

#[test]
fn quic_v1_initial_sni_is_recovered() {
    let hello = tls::build_client_hello("video.example.org");
    let quic_payload = quic::seal_initial(quic::QUIC_V1, &[0xAA; 8], &[0xBB; 4], &hello);
    let l4 = build_udp_l4(50000, 443, &quic_payload);
    let packet = build_ipv4(17, 5, [10, 0, 0, 2], [151, 101, 1, 57], &l4);
    let metadata = parse(&packet).expect("parse");
    let quic = metadata.quic.expect("quic metadata");
    assert_eq!(quic.version, quic::QUIC_V1);
    assert_eq!(quic.packet_type, QuicPacketType::Initial);
    assert_eq!(quic.dcid, vec![0xAA; 8]);
    assert_eq!(quic.server_name.as_deref(), Some("video.example.org"));
    assert_eq!(
        metadata.registrable_domain.as_deref(),
        Some("example.org")
    );
}

#[test]
fn quic_v2_initial_sni_is_recovered() {
    let hello = tls::build_client_hello("cdn.shop.co.uk");
    let quic_payload = quic::seal_initial(quic::QUIC_V2, &[0x01, 0x02, 0x03, 0x04], &[], &hello);
    let l4 = build_udp_l4(50001, 443, &quic_payload);
    let packet = build_ipv4(17, 5, [10, 0, 0, 2], [151, 101, 1, 58], &l4);
    let metadata = parse(&packet).expect("parse");
    let quic = metadata.quic.expect("quic metadata");
    assert_eq!(quic.version, quic::QUIC_V2);
    assert_eq!(quic.packet_type, QuicPacketType::Initial);
    assert_eq!(quic.server_name.as_deref(), Some("cdn.shop.co.uk"));
    assert_eq!(
        metadata.registrable_domain.as_deref(),
        Some("shop.co.uk")
    );
}

#[test]
fn quic_with_flipped_dcid_loses_the_sni_but_not_the_header() {
    let hello = tls::build_client_hello("secret.example.com");
    let mut quic_payload = quic::seal_initial(quic::QUIC_V1, &[0xAA; 8], &[0xBB; 4], &hello);
    // Corrupt the DCID: key derivation now mismatches and AEAD open fails.
    quic_payload[6] ^= 0xFF;
    let metadata = quic::parse_quic_packet(&quic_payload).expect("header still parses");
    assert_eq!(metadata.packet_type, QuicPacketType::Initial);
    assert!(metadata.server_name.is_none());
}

#[test]
fn ipv6_extension_headers_are_walked() {
    let l4 = build_udp_l4(5000, 53, &build_dns_query("six.example.com"));
    // destination options header (type 60), one 8-octet unit.
    let mut ext = vec![0u8; 8];
    ext[0] = 17; // next header: UDP
    ext[1] = 0;
    let payload_len = ext.len() + l4.len();
    let mut packet = vec![0u8; 40];
    packet[0] = 0x60;
    packet[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
    packet[6] = 60;
    packet[7] = 64;
    packet[8] = 0xfd;
    packet[24] = 0xfd;
    packet[39] = 0x02;
    packet.extend_from_slice(&ext);
    packet.extend_from_slice(&l4);
    let metadata = parse(&packet).expect("parse");
    assert_eq!(metadata.transport, Transport::Udp);
    assert_eq!(metadata.dst_port, 53);
    assert_eq!(
        metadata.dns.map(|dns| dns.query_name).as_deref(),
        Some("six.example.com")
    );
}

#[test]
fn esp_terminates_the_extension_walk() {
    let mut packet = vec![0u8; 40 + 16];
    packet[0] = 0x60;
    packet[4..6].copy_from_slice(&16u16.to_be_bytes());
    packet[6] = 50; // ESP directly after the fixed header
    assert!(parse(&packet).is_none());
    assert!(matches!(
        parse_frame(&packet),
        Ok(ParsedFrame::Other)
    ));
}

#[test]
fn registrable_domain_strips_to_suffix_boundaries() {
    assert_eq!(registrable_domain("www.apple.com"), "apple.com");
    assert_eq!(registrable_domain("a.b.example.com"), "example.com");
    assert_eq!(registrable_domain("shop.example.co.uk"), "example.co.uk");
    assert_eq!(registrable_domain("example.com"), "example.com");
    assert_eq!(registrable_domain("localhost"), "localhost");
    assert_eq!(registrable_domain("EXAMPLE.Com."), "example.com");
}
