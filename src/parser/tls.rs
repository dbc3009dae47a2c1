//! TLS ClientHello inspection: walks the handshake structure far enough to
//! recover the server_name extension.

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SNI_NAME_TYPE_HOST: u8 = 0;

/// SNI from a TCP payload that begins with a TLS handshake record.
pub fn sni_from_tls_record(payload: &[u8]) -> Option<String> {
    if payload.len() < 5 || payload[0] != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    let record_len = u16::from_be_bytes([payload[3], payload[4]]) as usize;
    let body = payload.get(5..)?;
    // Partial records still carry a complete ClientHello head often enough;
    // cap the walk at whichever boundary comes first.
    let limit = record_len.min(body.len());
    sni_from_client_hello(&body[..limit])
}

/// SNI from a raw handshake message (no record layer), as carried by QUIC
/// CRYPTO frames.
pub fn sni_from_client_hello(handshake: &[u8]) -> Option<String> {
    if handshake.len() < 4 || handshake[0] != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let body_len =
        ((handshake[1] as usize) << 16) | ((handshake[2] as usize) << 8) | handshake[3] as usize;
    let body = handshake.get(4..)?;
    let body = &body[..body_len.min(body.len())];

    // client_version(2) + random(32)
    let mut cursor = 34usize;
    if cursor >= body.len() {
        return None;
    }
    let session_len = body[cursor] as usize;
    cursor = cursor.checked_add(1 + session_len)?;
    if cursor + 2 > body.len() {
        return None;
    }
    let cipher_len = u16::from_be_bytes([body[cursor], body[cursor + 1]]) as usize;
    cursor = cursor.checked_add(2 + cipher_len)?;
    if cursor + 1 > body.len() {
        return None;
    }
    let compression_len = body[cursor] as usize;
    cursor = cursor.checked_add(1 + compression_len)?;
    if cursor + 2 > body.len() {
        return None;
    }
    let extensions_len = u16::from_be_bytes([body[cursor], body[cursor + 1]]) as usize;
    cursor += 2;
    let extensions_end = (cursor + extensions_len).min(body.len());

    while cursor + 4 <= extensions_end {
        let extension_type = u16::from_be_bytes([body[cursor], body[cursor + 1]]);
        let extension_len = u16::from_be_bytes([body[cursor + 2], body[cursor + 3]]) as usize;
        cursor += 4;
        if cursor + extension_len > extensions_end {
            return None;
        }
        if extension_type == EXTENSION_SERVER_NAME {
            return parse_sni_extension(&body[cursor..cursor + extension_len]);
        }
        cursor += extension_len;
    }
    None
}

fn parse_sni_extension(data: &[u8]) -> Option<String> {
    if data.len() < 2 {
        return None;
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if list_len + 2 > data.len() {
        return None;
    }
    let mut cursor = 2usize;
    while cursor + 3 <= data.len() {
        let name_type = data[cursor];
        let name_len = u16::from_be_bytes([data[cursor + 1], data[cursor + 2]]) as usize;
        cursor += 3;
        if cursor + name_len > data.len() {
            return None;
        }
        if name_type == SNI_NAME_TYPE_HOST {
            return std::str::from_utf8(&data[cursor..cursor + name_len])
                .ok()
                .map(str::to_string);
        }
        cursor += name_len;
    }
    None
}

/// Builds a minimal ClientHello handshake message carrying `host` as SNI.
/// Shared by the parser and QUIC tests.
#[cfg(test)]
pub(crate) fn build_client_hello(host: &str) -> Vec<u8> {
    let mut sni_entry = Vec::new();
    sni_entry.push(SNI_NAME_TYPE_HOST);
    sni_entry.extend_from_slice(&(host.len() as u16).to_be_bytes());
    sni_entry.extend_from_slice(host.as_bytes());

    let mut sni_ext = Vec::new();
    sni_ext.extend_from_slice(&(sni_entry.len() as u16).to_be_bytes());
    sni_ext.extend_from_slice(&sni_entry);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
    extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni_ext);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // legacy version
    body.extend_from_slice(&[0u8; 32]); // random
    body.push(0); // session id
    body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites length
    body.extend_from_slice(&[0x13, 0x01]); // TLS_AES_128_GCM_SHA256
    body.push(1); // compression methods length
    body.push(0); // null compression
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = Vec::new();
    handshake.push(HANDSHAKE_CLIENT_HELLO);
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..4]);
    handshake.extend_from_slice(&body);
    handshake
}

/// Wraps a handshake message in a TLS record.
#[cfg(test)]
pub(crate) fn wrap_in_record(handshake: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(handshake.len() + 5);
    record.push(CONTENT_TYPE_HANDSHAKE);
    record.extend_from_slice(&[0x03, 0x01]);
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(handshake);
    record
}
