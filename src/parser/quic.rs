//! QUIC long-header inspection and Initial packet decryption.
//!
//! Initial packets are protected with keys derived solely from the
//! destination connection id, so the engine can open them without any
//! session state and recover the TLS ClientHello (and its SNI) from the
//! CRYPTO stream.

use super::tls;
use crate::sample::{QuicMetadata, QuicPacketType};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::BlockEncrypt;
use aes::Aes128;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

pub const QUIC_V1: u32 = 0x0000_0001;
pub const QUIC_V2: u32 = 0x6b33_43cf;

const V1_INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];
const V2_INITIAL_SALT: [u8; 20] = [
    0x0d, 0xed, 0xe3, 0xde, 0xf7, 0x00, 0xa6, 0xdb, 0x81, 0x93, 0x81, 0xbe, 0x6e, 0x26, 0x9d,
    0xcb, 0xf9, 0xbd, 0x2e, 0xd9,
];

const MAX_CID_LEN: usize = 20;
const SAMPLE_LEN: usize = 16;
const KEY_LEN: usize = 16;
const IV_LEN: usize = 12;

const FRAME_PADDING: u8 = 0x00;
const FRAME_PING: u8 = 0x01;
const FRAME_CRYPTO: u8 = 0x06;

/// Parses a UDP payload as a QUIC long-header packet. For Initial packets the
/// payload is decrypted and searched for a ClientHello SNI; decryption
/// failures degrade to metadata without a server name, never an error.
pub fn parse_quic_packet(payload: &[u8]) -> Option<QuicMetadata> {
    if payload.len() < 7 {
        return None;
    }
    let first = payload[0];
    // Long header with the fixed bit set.
    if first & 0x80 == 0 || first & 0x40 == 0 {
        return None;
    }
    let version = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    let packet_type = packet_type_for(version, (first >> 4) & 0x03)?;

    let mut cursor = 5usize;
    let dcid_len = *payload.get(cursor)? as usize;
    cursor += 1;
    if dcid_len > MAX_CID_LEN || cursor + dcid_len > payload.len() {
        return None;
    }
    let dcid = payload[cursor..cursor + dcid_len].to_vec();
    cursor += dcid_len;
    let scid_len = *payload.get(cursor)? as usize;
    cursor += 1;
    if scid_len > MAX_CID_LEN || cursor + scid_len > payload.len() {
        return None;
    }
    let scid = payload[cursor..cursor + scid_len].to_vec();
    cursor += scid_len;

    let server_name = if packet_type == QuicPacketType::Initial {
        decrypt_initial(payload, cursor, version, &dcid)
            .and_then(|plaintext| crypto_stream(&plaintext))
            .and_then(|stream| tls::sni_from_client_hello(&stream))
    } else {
        None
    };

    Some(QuicMetadata {
        version,
        packet_type,
        dcid,
        scid,
        server_name,
    })
}

fn packet_type_for(version: u32, bits: u8) -> Option<QuicPacketType> {
    match version {
        QUIC_V1 => Some(match bits {
            0 => QuicPacketType::Initial,
            1 => QuicPacketType::ZeroRtt,
            2 => QuicPacketType::Handshake,
            _ => QuicPacketType::Retry,
        }),
        QUIC_V2 => Some(match bits {
            0 => QuicPacketType::Retry,
            1 => QuicPacketType::Initial,
            2 => QuicPacketType::ZeroRtt,
            _ => QuicPacketType::Handshake,
        }),
        _ => None,
    }
}

struct InitialKeys {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
    hp: [u8; KEY_LEN],
}

fn initial_keys(version: u32, dcid: &[u8]) -> Option<InitialKeys> {
    let (salt, prefix) = match version {
        QUIC_V1 => (&V1_INITIAL_SALT, "quic"),
        QUIC_V2 => (&V2_INITIAL_SALT, "quicv2"),
        _ => return None,
    };
    let (initial_secret, _) = Hkdf::<Sha256>::extract(Some(&salt[..]), dcid);
    let mut client_secret = [0u8; 32];
    hkdf_expand_label(&initial_secret, "client in", &mut client_secret)?;

    let mut keys = InitialKeys {
        key: [0u8; KEY_LEN],
        iv: [0u8; IV_LEN],
        hp: [0u8; KEY_LEN],
    };
    hkdf_expand_label(&client_secret, &format!("{prefix} key"), &mut keys.key)?;
    hkdf_expand_label(&client_secret, &format!("{prefix} iv"), &mut keys.iv)?;
    hkdf_expand_label(&client_secret, &format!("{prefix} hp"), &mut keys.hp)?;
    Some(keys)
}

/// HKDF-Expand-Label with the TLS 1.3 "tls13 " prefix and empty context.
fn hkdf_expand_label(secret: &[u8], label: &str, out: &mut [u8]) -> Option<()> {
    let hk = Hkdf::<Sha256>::from_prk(secret).ok()?;
    let full_label = format!("tls13 {label}");
    let mut info = Vec::with_capacity(4 + full_label.len());
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push(full_label.len() as u8);
    info.extend_from_slice(full_label.as_bytes());
    info.push(0);
    hk.expand(&info, out).ok()
}

/// Removes header protection and opens the AEAD payload of an Initial packet.
/// `cursor` points just past the source connection id.
fn decrypt_initial(payload: &[u8], mut cursor: usize, version: u32, dcid: &[u8]) -> Option<Vec<u8>> {
    let keys = initial_keys(version, dcid)?;

    let (token_len, consumed) = read_varint(payload, cursor)?;
    cursor = cursor
        .checked_add(consumed)?
        .checked_add(usize::try_from(token_len).ok()?)?;
    let (length, consumed) = read_varint(payload, cursor)?;
    cursor += consumed;
    let length = usize::try_from(length).ok()?;
    let pn_offset = cursor;
    if pn_offset + length > payload.len() || length < 4 + SAMPLE_LEN {
        return None;
    }

    // Header protection sample assumes a 4-byte packet number.
    let sample_start = pn_offset + 4;
    let mut block = GenericArray::clone_from_slice(&payload[sample_start..sample_start + SAMPLE_LEN]);
    let hp_cipher = Aes128::new_from_slice(&keys.hp).ok()?;
    hp_cipher.encrypt_block(&mut block);
    let mask = block;

    let mut header = payload[..pn_offset].to_vec();
    header[0] ^= mask[0] & 0x0F;
    let pn_len = usize::from(header[0] & 0x03) + 1;
    let mut pn_bytes = [0u8; 4];
    for i in 0..pn_len {
        pn_bytes[i] = payload[pn_offset + i] ^ mask[1 + i];
    }
    header.extend_from_slice(&pn_bytes[..pn_len]);

    let mut nonce = keys.iv;
    for i in 0..pn_len {
        nonce[IV_LEN - pn_len + i] ^= pn_bytes[i];
    }

    let ciphertext = &payload[pn_offset + pn_len..pn_offset + length];
    let cipher = Aes128Gcm::new_from_slice(&keys.key).ok()?;
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad: &header,
            },
        )
        .ok()
}

/// Reassembles the CRYPTO stream from a decrypted Initial payload, starting
/// at offset zero. Frames other than PADDING, PING, and CRYPTO end the walk.
fn crypto_stream(plaintext: &[u8]) -> Option<Vec<u8>> {
    let mut segments: Vec<(u64, &[u8])> = Vec::new();
    let mut cursor = 0usize;
    while cursor < plaintext.len() {
        match plaintext[cursor] {
            FRAME_PADDING | FRAME_PING => cursor += 1,
            FRAME_CRYPTO => {
                cursor += 1;
                let (offset, consumed) = read_varint(plaintext, cursor)?;
                cursor += consumed;
                let (data_len, consumed) = read_varint(plaintext, cursor)?;
                cursor += consumed;
                let data_len = usize::try_from(data_len).ok()?;
                if cursor + data_len > plaintext.len() {
                    return None;
                }
                segments.push((offset, &plaintext[cursor..cursor + data_len]));
                cursor += data_len;
            }
            _ => break,
        }
    }
    if segments.is_empty() {
        return None;
    }
    segments.sort_by_key(|(offset, _)| *offset);
    let mut stream = Vec::new();
    for (offset, data) in segments {
        if offset != stream.len() as u64 {
            break;
        }
        stream.extend_from_slice(data);
    }
    if stream.is_empty() {
        None
    } else {
        Some(stream)
    }
}

fn read_varint(buf: &[u8], offset: usize) -> Option<(u64, usize)> {
    let first = *buf.get(offset)?;
    let len = 1usize << (first >> 6);
    if offset + len > buf.len() {
        return None;
    }
    let mut value = u64::from(first & 0x3F);
    for i in 1..len {
        value = (value << 8) | u64::from(buf[offset + i]);
    }
    Some((value, len))
}

#[cfg(test)]
fn encode_varint(value: u64, out: &mut Vec<u8>) {
    if value < 1 << 6 {
        out.push(value as u8);
    } else if value < 1 << 14 {
        out.extend_from_slice(&((value as u16) | 0x4000).to_be_bytes());
    } else if value < 1 << 30 {
        out.extend_from_slice(&((value as u32) | 0x8000_0000).to_be_bytes());
    } else {
        out.extend_from_slice(&(value | 0xC000_0000_0000_0000).to_be_bytes());
    }
}

/// Builds and seals a client Initial carrying `crypto_data` at offset zero.
/// Exercises the same key schedule as the decryptor.
#[cfg(test)]
pub(crate) fn seal_initial(version: u32, dcid: &[u8], scid: &[u8], crypto_data: &[u8]) -> Vec<u8> {
    let type_bits: u8 = match version {
        QUIC_V2 => 1,
        _ => 0,
    };
    // Long header, fixed bit, type bits, 1-byte packet number.
    let first = 0xC0 | (type_bits << 4);

    let mut frames = Vec::new();
    frames.push(FRAME_CRYPTO);
    encode_varint(0, &mut frames);
    encode_varint(crypto_data.len() as u64, &mut frames);
    frames.extend_from_slice(crypto_data);
    // Pad so the sampling window always exists.
    while frames.len() < 64 {
        frames.push(FRAME_PADDING);
    }

    let keys = initial_keys(version, dcid).expect("initial keys");
    let pn: u8 = 0;
    let pn_len = 1usize;
    let payload_len = pn_len + frames.len() + 16; // pn + ciphertext + tag

    let mut header = Vec::new();
    header.push(first);
    header.extend_from_slice(&version.to_be_bytes());
    header.push(dcid.len() as u8);
    header.extend_from_slice(dcid);
    header.push(scid.len() as u8);
    header.extend_from_slice(scid);
    encode_varint(0, &mut header); // token length
    encode_varint(payload_len as u64, &mut header);
    let pn_offset = header.len();
    header.push(pn);

    let mut nonce = keys.iv;
    nonce[IV_LEN - 1] ^= pn;
    let cipher = Aes128Gcm::new_from_slice(&keys.key).expect("aead key");
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: frames.as_slice(),
                aad: header.as_slice(),
            },
        )
        .expect("seal");

    let mut packet = header;
    packet.extend_from_slice(&ciphertext);

    // Apply header protection over the finished packet.
    let sample_start = pn_offset + 4;
    let mut block =
        GenericArray::clone_from_slice(&packet[sample_start..sample_start + SAMPLE_LEN]);
    let hp_cipher = Aes128::new_from_slice(&keys.hp).expect("hp key");
    hp_cipher.encrypt_block(&mut block);
    packet[0] ^= block[0] & 0x0F;
    packet[pn_offset] ^= block[1];
    packet
}
