//! DNS message decoding for the metadata pipeline.

use crate::sample::DnsMetadata;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const HEADER_LEN: usize = 12;
const MAX_POINTER_DEPTH: usize = 8;
const MAX_LABELS: usize = 32;

/// Decodes a DNS payload into metadata. Queries yield the question name;
/// responses additionally yield CNAME and A/AAAA records.
pub fn parse_dns_payload(payload: &[u8]) -> Option<DnsMetadata> {
    if payload.len() < HEADER_LEN {
        return None;
    }
    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    let is_response = (flags & 0x8000) != 0;
    let qd_count = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    let an_count = u16::from_be_bytes([payload[6], payload[7]]) as usize;
    if qd_count == 0 {
        return None;
    }

    let mut offset = HEADER_LEN;
    let query_name = read_name(payload, &mut offset)?;
    if offset + 4 > payload.len() {
        return None;
    }
    offset += 4; // QTYPE + QCLASS
    for _ in 1..qd_count {
        read_name(payload, &mut offset)?;
        if offset + 4 > payload.len() {
            return None;
        }
        offset += 4;
    }

    let mut metadata = DnsMetadata {
        query_name,
        is_response,
        cname: None,
        addresses: Vec::new(),
        ttl: None,
    };
    if !is_response {
        return Some(metadata);
    }

    for _ in 0..an_count {
        let _owner = read_name(payload, &mut offset)?;
        if offset + 10 > payload.len() {
            break;
        }
        let record_type = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
        let ttl = u32::from_be_bytes([
            payload[offset + 4],
            payload[offset + 5],
            payload[offset + 6],
            payload[offset + 7],
        ]);
        let rdlength = u16::from_be_bytes([payload[offset + 8], payload[offset + 9]]) as usize;
        offset += 10;
        if offset + rdlength > payload.len() {
            break;
        }
        let rdata = &payload[offset..offset + rdlength];
        match record_type {
            1 if rdlength == 4 => {
                metadata
                    .addresses
                    .push(IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])));
                metadata.ttl = Some(metadata.ttl.map_or(ttl, |current| current.min(ttl)));
            }
            28 if rdlength == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                metadata.addresses.push(IpAddr::V6(Ipv6Addr::from(octets)));
                metadata.ttl = Some(metadata.ttl.map_or(ttl, |current| current.min(ttl)));
            }
            5 => {
                let mut rdata_offset = offset;
                if let Some(target) = read_name(payload, &mut rdata_offset) {
                    if metadata.cname.is_none() {
                        metadata.cname = Some(target);
                    }
                }
            }
            _ => {}
        }
        offset += rdlength;
    }
    Some(metadata)
}

/// Reads a possibly-compressed domain name. Pointer chains deeper than
/// `MAX_POINTER_DEPTH` are treated as malformed.
fn read_name(buf: &[u8], offset: &mut usize) -> Option<String> {
    let mut labels: Vec<String> = Vec::new();
    let mut position = *offset;
    let mut jumps = 0usize;
    let mut jumped = false;
    loop {
        if position >= buf.len() || labels.len() >= MAX_LABELS {
            return None;
        }
        let len = buf[position] as usize;
        if len == 0 {
            position += 1;
            if !jumped {
                *offset = position;
            }
            break;
        }
        if len & 0xC0 == 0xC0 {
            if position + 1 >= buf.len() {
                return None;
            }
            jumps += 1;
            if jumps > MAX_POINTER_DEPTH {
                return None;
            }
            let pointer = (((len & 0x3F) as usize) << 8) | buf[position + 1] as usize;
            if !jumped {
                *offset = position + 2;
            }
            if pointer >= position {
                // Forward pointers would loop; only backward references are legal.
                return None;
            }
            position = pointer;
            jumped = true;
            continue;
        }
        if len > 63 {
            return None;
        }
        position += 1;
        if position + len > buf.len() {
            return None;
        }
        let label = &buf[position..position + len];
        if !label.is_ascii() {
            return None;
        }
        labels.push(String::from_utf8_lossy(label).to_string());
        position += len;
        if !jumped {
            *offset = position;
        }
    }
    if labels.is_empty() {
        None
    } else {
        Some(labels.join("."))
    }
}

#[cfg(test)]
pub(crate) fn encode_name(host: &str, out: &mut Vec<u8>) {
    for label in host.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
}
