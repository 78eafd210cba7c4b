//! Opaque keyset pagination tokens
//!
//! A token encodes the `(created_at, id)` of the last row a client has seen in
//! a `(created_at desc, id desc)` ordering. The next page starts strictly
//! after it. Tokens carry a short checksum so that corrupted or hand-edited
//! values are detected; anything that does not decode cleanly is treated as
//! "no cursor" and pagination restarts from the top.

use data_encoding::BASE64URL_NOPAD;

use crate::Timestamp;

const PAYLOAD_LEN: usize = 16;
const CHECKSUM_LEN: usize = 4;
const TOKEN_LEN: usize = PAYLOAD_LEN + CHECKSUM_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    pub created_at: Timestamp,
    pub id: u64,
}

impl Cursor {
    pub fn new(created_at: Timestamp, id: impl Into<u64>) -> Self {
        Self {
            created_at,
            id: id.into(),
        }
    }

    pub fn encode(&self) -> String {
        let mut bytes = [0u8; TOKEN_LEN];
        bytes[..8].copy_from_slice(&self.created_at.as_millis().to_be_bytes());
        bytes[8..PAYLOAD_LEN].copy_from_slice(&self.id.to_be_bytes());
        let checksum = checksum(&bytes[..PAYLOAD_LEN]);
        bytes[PAYLOAD_LEN..].copy_from_slice(&checksum);
        BASE64URL_NOPAD.encode(&bytes)
    }

    pub fn decode(token: &str) -> Option<Self> {
        let bytes = BASE64URL_NOPAD.decode(token.trim().as_bytes()).ok()?;
        let bytes: [u8; TOKEN_LEN] = bytes.try_into().ok()?;

        if checksum(&bytes[..PAYLOAD_LEN]) != bytes[PAYLOAD_LEN..] {
            return None;
        }

        let created_at = u64::from_be_bytes(bytes[..8].try_into().ok()?);
        let id = u64::from_be_bytes(bytes[8..PAYLOAD_LEN].try_into().ok()?);

        Some(Self {
            created_at: Timestamp::from_millis(created_at),
            id,
        })
    }

    /// Like [`Self::decode`], accepting an absent token
    pub fn decode_opt(token: Option<&str>) -> Option<Self> {
        token.and_then(Self::decode)
    }
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let hash = blake3::hash(payload);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&hash.as_bytes()[..CHECKSUM_LEN]);
    out
}

/// Token for the page after `results`
///
/// A page shorter than `limit` means the end of data was reached.
pub fn next_cursor<T>(results: &[T], limit: usize, key: impl Fn(&T) -> Cursor) -> Option<String> {
    if results.len() < limit {
        return None;
    }
    results.last().map(|last| key(last).encode())
}

#[cfg(test)]
mod tests;
