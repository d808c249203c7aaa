//! Key encodings. Signed values are stored with the sign bit flipped so that
//! lexicographic byte order in RocksDB matches numeric order.

use crate::{PersistenceError, Result};

const SIGN_BIT: u64 = 1 << 63;

pub(crate) fn encode_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ SIGN_BIT).to_be_bytes()
}

pub(crate) fn decode_i64(bytes: &[u8]) -> Result<i64> {
    Ok((u64::from_be_bytes(to_array(bytes)?) ^ SIGN_BIT) as i64)
}

pub(crate) fn encode_u64(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

pub(crate) fn decode_u64(bytes: &[u8]) -> Result<u64> {
    Ok(u64::from_be_bytes(to_array(bytes)?))
}

/// Pending index value: item id followed by chat id
pub(crate) fn encode_pending(id: u64, chat_id: i64) -> [u8; 16] {
    let mut value = [0u8; 16];
    value[..8].copy_from_slice(&encode_u64(id));
    value[8..].copy_from_slice(&encode_i64(chat_id));
    value
}

pub(crate) fn decode_pending(bytes: &[u8]) -> Result<(u64, i64)> {
    if bytes.len() != 16 {
        return Err(PersistenceError::Corrupt(format!(
            "pending entry has {} bytes",
            bytes.len()
        )));
    }
    Ok((decode_u64(&bytes[..8])?, decode_i64(&bytes[8..])?))
}

/// Per-chat pending index key: chat id followed by source sequence, so a
/// prefix seek on the chat lands on its lowest pending sequence
pub(crate) fn encode_chat_seq(chat_id: i64, source_seq: i64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&encode_i64(chat_id));
    key[8..].copy_from_slice(&encode_i64(source_seq));
    key
}

pub(crate) fn decode_chat_seq(bytes: &[u8]) -> Result<(i64, i64)> {
    if bytes.len() != 16 {
        return Err(PersistenceError::Corrupt(format!(
            "pending_by_chat key has {} bytes",
            bytes.len()
        )));
    }
    Ok((decode_i64(&bytes[..8])?, decode_i64(&bytes[8..])?))
}

fn to_array(bytes: &[u8]) -> Result<[u8; 8]> {
    bytes
        .try_into()
        .map_err(|_| PersistenceError::Corrupt(format!("expected 8-byte key, got {}", bytes.len())))
}
