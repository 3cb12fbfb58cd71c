//! Composite key codec for the partitioned store.
//!
//! Two key shapes exist:
//!
//! - posting keys: `tenant:u64 | centroid:u32 | doc_id | [token_ord:u32]`,
//!   20 bytes (24 with the per-token ordinal used by V2 posting payloads);
//! - forward keys: `tenant:u64 | doc_id`, 16 bytes, shared by the forward,
//!   mapping, and metadata partitions.
//!
//! Every field is big-endian so byte-wise lexicographic comparison equals
//! tuple comparison, which is what gives posting range scans their ascending
//! `doc_id` order. Signed `doc_id` values are biased by flipping the sign
//! bit before encoding; raw two's-complement big-endian bytes would sort
//! negative ids after positive ones.

use crate::error::{Error, Result};

/// Byte length of the `(tenant, centroid)` posting prefix.
pub const POSTING_PREFIX_LEN: usize = 12;
/// Byte length of a V1 posting key.
pub const POSTING_KEY_LEN: usize = 20;
/// Byte length of a V2 (token-level) posting key.
pub const TOKEN_KEY_LEN: usize = 24;
/// Byte length of a forward key.
pub const FORWARD_KEY_LEN: usize = 16;

const DOC_ID_BIAS: u64 = 1 << 63;

#[inline]
fn bias(doc_id: i64) -> u64 {
    (doc_id as u64) ^ DOC_ID_BIAS
}

#[inline]
fn unbias(raw: u64) -> i64 {
    (raw ^ DOC_ID_BIAS) as i64
}

/// Key into the inverted (posting) partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostingKey {
    pub tenant: u64,
    pub centroid: u32,
    pub doc_id: i64,
    /// Present only for token-level entries that carry a residual payload.
    pub token_ord: Option<u32>,
}

impl PostingKey {
    pub fn new(tenant: u64, centroid: u32, doc_id: i64) -> Self {
        PostingKey {
            tenant,
            centroid,
            doc_id,
            token_ord: None,
        }
    }

    pub fn with_token(tenant: u64, centroid: u32, doc_id: i64, token_ord: u32) -> Self {
        PostingKey {
            tenant,
            centroid,
            doc_id,
            token_ord: Some(token_ord),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TOKEN_KEY_LEN);
        out.extend_from_slice(&self.tenant.to_be_bytes());
        out.extend_from_slice(&self.centroid.to_be_bytes());
        out.extend_from_slice(&bias(self.doc_id).to_be_bytes());
        if let Some(ord) = self.token_ord {
            out.extend_from_slice(&ord.to_be_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != POSTING_KEY_LEN && bytes.len() != TOKEN_KEY_LEN {
            return Err(Error::corrupt(format!(
                "posting key must be {POSTING_KEY_LEN} or {TOKEN_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let tenant = u64::from_be_bytes(bytes[0..8].try_into().expect("sized slice"));
        let centroid = u32::from_be_bytes(bytes[8..12].try_into().expect("sized slice"));
        let doc_id = unbias(u64::from_be_bytes(bytes[12..20].try_into().expect("sized slice")));
        let token_ord = if bytes.len() == TOKEN_KEY_LEN {
            Some(u32::from_be_bytes(bytes[20..24].try_into().expect("sized slice")))
        } else {
            None
        };
        Ok(PostingKey {
            tenant,
            centroid,
            doc_id,
            token_ord,
        })
    }

    /// The `(tenant, centroid)` scan prefix.
    pub fn prefix(tenant: u64, centroid: u32) -> [u8; POSTING_PREFIX_LEN] {
        let mut out = [0u8; POSTING_PREFIX_LEN];
        out[0..8].copy_from_slice(&tenant.to_be_bytes());
        out[8..12].copy_from_slice(&centroid.to_be_bytes());
        out
    }

    /// Smallest key strictly greater than every key under `prefix`, or
    /// `None` when the prefix is all ones and the scan is unbounded above.
    pub fn prefix_upper_bound(
        tenant: u64,
        centroid: u32,
    ) -> Option<[u8; POSTING_PREFIX_LEN]> {
        let mut out = Self::prefix(tenant, centroid);
        for byte in out.iter_mut().rev() {
            if *byte == u8::MAX {
                *byte = 0;
            } else {
                *byte += 1;
                return Some(out);
            }
        }
        None
    }
}

/// Key into the forward, mapping, and metadata partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardKey {
    pub tenant: u64,
    pub doc_id: i64,
}

impl ForwardKey {
    pub fn new(tenant: u64, doc_id: i64) -> Self {
        ForwardKey { tenant, doc_id }
    }

    pub fn encode(&self) -> [u8; FORWARD_KEY_LEN] {
        let mut out = [0u8; FORWARD_KEY_LEN];
        out[0..8].copy_from_slice(&self.tenant.to_be_bytes());
        out[8..16].copy_from_slice(&bias(self.doc_id).to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != FORWARD_KEY_LEN {
            return Err(Error::corrupt(format!(
                "forward key must be {FORWARD_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let tenant = u64::from_be_bytes(bytes[0..8].try_into().expect("sized slice"));
        let doc_id = unbias(u64::from_be_bytes(bytes[8..16].try_into().expect("sized slice")));
        Ok(ForwardKey { tenant, doc_id })
    }
}
