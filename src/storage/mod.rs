//! Partitioned ordered-KV layer.
//!
//! One redb database holds five logical partitions, each its own table:
//!
//! | table               | key          | value                                  |
//! |---------------------|--------------|----------------------------------------|
//! | `posting`           | posting key  | empty, or one token's residual code    |
//! | `forward_codes`     | forward key  | packed `u32` centroid codes            |
//! | `forward_residuals` | forward key  | `num_tokens:u32` + residual bytes      |
//! | `mapping`           | forward key  | sorted distinct `u32` centroids        |
//! | `doc_metadata`      | forward key  | JSON map bytes                         |
//!
//! All writes for one document happen inside a single write transaction, so
//! a crash mid-add leaves the previous committed state. Read transactions
//! are snapshots; a posting scan never observes half a document.

use std::collections::BTreeSet;
use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::keys::{ForwardKey, PostingKey};

/// File name inside the index directory.
pub const STORE_FILENAME: &str = "index.redb";

const POSTING: TableDefinition<&[u8], &[u8]> = TableDefinition::new("posting");
const FORWARD_CODES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("forward_codes");
const FORWARD_RESIDUALS: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("forward_residuals");
const MAPPING: TableDefinition<&[u8], &[u8]> = TableDefinition::new("mapping");
const DOC_METADATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("doc_metadata");

const ALL_TABLES: [TableDefinition<'static, &'static [u8], &'static [u8]>; 5] =
    [POSTING, FORWARD_CODES, FORWARD_RESIDUALS, MAPPING, DOC_METADATA];

/// Arbitrary per-document metadata, stored as a JSON object.
pub type MetadataMap = serde_json::Map<String, serde_json::Value>;

/// A fully quantized document, ready to persist.
#[derive(Debug, Clone)]
pub struct EncodedDocument {
    pub doc_id: i64,
    /// One centroid code per token.
    pub codes: Vec<u32>,
    /// `num_tokens * code_size` residual bytes.
    pub residuals: Vec<u8>,
    pub num_tokens: usize,
    /// Bytes per token residual.
    pub code_size: usize,
    pub metadata: Option<MetadataMap>,
}

impl EncodedDocument {
    /// Distinct centroids touched by this document, ascending.
    pub fn distinct_centroids(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = self.codes.iter().copied().collect();
        set.into_iter().collect()
    }

    fn check(&self) -> Result<()> {
        if self.codes.len() != self.num_tokens {
            return Err(Error::config(format!(
                "document {}: {} codes for {} tokens",
                self.doc_id,
                self.codes.len(),
                self.num_tokens
            )));
        }
        if self.residuals.len() != self.num_tokens * self.code_size {
            return Err(Error::config(format!(
                "document {}: {} residual bytes for {} tokens of code size {}",
                self.doc_id,
                self.residuals.len(),
                self.num_tokens,
                self.code_size
            )));
        }
        Ok(())
    }
}

/// One token-level posting entry (V2 layout).
#[derive(Debug, Clone)]
pub struct PostingEntry {
    pub doc_id: i64,
    pub token_ord: u32,
    /// The token's residual code; empty for V1 entries.
    pub payload: Vec<u8>,
}

/// The partitioned store. Reads and writes are internally synchronized by
/// redb; the handle is freely shared across threads.
pub struct Storage {
    db: Database,
    read_only: bool,
}

impl Storage {
    /// Open (or create, unless `read_only`) the store inside `dir`.
    pub fn open(dir: &Path, read_only: bool) -> Result<Self> {
        let path = dir.join(STORE_FILENAME);
        let db = if read_only {
            Database::open(&path)
                .map_err(|_| Error::not_found(format!("store at {}", path.display())))?
        } else {
            let db = Database::create(&path)?;
            // Touching every table creates the missing ones.
            let txn = db.begin_write()?;
            for def in ALL_TABLES {
                txn.open_table(def)?;
            }
            txn.commit()?;
            db
        };
        Ok(Storage { db, read_only })
    }

    fn require_writable(&self) -> Result<()> {
        if self.read_only {
            Err(Error::config("index was opened read-only"))
        } else {
            Ok(())
        }
    }

    /// Persist one document across all partitions, atomically.
    pub fn add(&self, tenant: u64, doc: &EncodedDocument, posting_payloads: bool) -> Result<()> {
        self.add_batch(tenant, std::slice::from_ref(doc), posting_payloads)
    }

    /// Persist a batch of documents in one write transaction. With
    /// `posting_payloads`, posting entries are token-level and carry the
    /// token's residual code, and the forward-codes row is skipped (the
    /// imputation retriever never reads it).
    pub fn add_batch(
        &self,
        tenant: u64,
        docs: &[EncodedDocument],
        posting_payloads: bool,
    ) -> Result<()> {
        self.require_writable()?;
        for doc in docs {
            doc.check()?;
        }

        let txn = self.db.begin_write()?;
        {
            let mut posting = txn.open_table(POSTING)?;
            let mut codes_table = txn.open_table(FORWARD_CODES)?;
            let mut residuals_table = txn.open_table(FORWARD_RESIDUALS)?;
            let mut mapping_table = txn.open_table(MAPPING)?;
            let mut metadata_table = txn.open_table(DOC_METADATA)?;

            for doc in docs {
                let centroids = doc.distinct_centroids();
                let forward_key = ForwardKey::new(tenant, doc.doc_id).encode();

                if posting_payloads {
                    for (ord, &code) in doc.codes.iter().enumerate() {
                        let key =
                            PostingKey::with_token(tenant, code, doc.doc_id, ord as u32).encode();
                        let payload =
                            &doc.residuals[ord * doc.code_size..(ord + 1) * doc.code_size];
                        posting.insert(key.as_slice(), payload)?;
                    }
                } else {
                    const EMPTY: &[u8] = &[];
                    for &code in &centroids {
                        let key = PostingKey::new(tenant, code, doc.doc_id).encode();
                        posting.insert(key.as_slice(), EMPTY)?;
                    }
                    codes_table
                        .insert(forward_key.as_slice(), codes_to_bytes(&doc.codes).as_slice())?;
                }

                residuals_table.insert(
                    forward_key.as_slice(),
                    residuals_to_bytes(doc.num_tokens, &doc.residuals).as_slice(),
                )?;
                mapping_table
                    .insert(forward_key.as_slice(), codes_to_bytes(&centroids).as_slice())?;
                if let Some(metadata) = &doc.metadata {
                    metadata_table
                        .insert(forward_key.as_slice(), serde_json::to_vec(metadata)?.as_slice())?;
                }
            }
        }
        txn.commit()?;
        debug!(tenant, docs = docs.len(), "documents persisted");
        Ok(())
    }

    /// Remove documents point-wise: the mapping row names the centroids
    /// whose posting ranges must be purged, then every forward row goes.
    pub fn remove(&self, tenant: u64, doc_ids: &[i64]) -> Result<()> {
        self.require_writable()?;
        let txn = self.db.begin_write()?;
        {
            let mut posting = txn.open_table(POSTING)?;
            let mut codes_table = txn.open_table(FORWARD_CODES)?;
            let mut residuals_table = txn.open_table(FORWARD_RESIDUALS)?;
            let mut mapping_table = txn.open_table(MAPPING)?;
            let mut metadata_table = txn.open_table(DOC_METADATA)?;

            for &doc_id in doc_ids {
                let forward_key = ForwardKey::new(tenant, doc_id).encode();
                let centroids = match mapping_table.get(forward_key.as_slice())? {
                    Some(guard) => bytes_to_codes(guard.value())?,
                    None => {
                        warn!(tenant, doc_id, "no mapping record for removed document");
                        Vec::new()
                    }
                };

                for centroid in centroids {
                    // One range covers the 20-byte entry and any 24-byte
                    // token entries beneath it.
                    let start = PostingKey::new(tenant, centroid, doc_id).encode();
                    let keys: Vec<Vec<u8>> = match increment_key(&start) {
                        Some(end) => posting
                            .range(start.as_slice()..end.as_slice())?
                            .map(|item| item.map(|(k, _)| k.value().to_vec()))
                            .collect::<std::result::Result<_, _>>()?,
                        None => posting
                            .range(start.as_slice()..)?
                            .map(|item| item.map(|(k, _)| k.value().to_vec()))
                            .collect::<std::result::Result<_, _>>()?,
                    };
                    for key in keys {
                        posting.remove(key.as_slice())?;
                    }
                }

                codes_table.remove(forward_key.as_slice())?;
                residuals_table.remove(forward_key.as_slice())?;
                mapping_table.remove(forward_key.as_slice())?;
                metadata_table.remove(forward_key.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Ascending distinct `doc_id`s under one `(tenant, centroid)` prefix.
    pub fn posting_docs(&self, tenant: u64, centroid: u32) -> Result<Vec<i64>> {
        let mut out = Vec::new();
        self.scan_posting(tenant, centroid, |key, _| {
            if out.last() != Some(&key.doc_id) {
                out.push(key.doc_id);
            }
            Ok(())
        })?;
        Ok(out)
    }

    /// Every entry under one `(tenant, centroid)` prefix, with payloads.
    pub fn posting_entries(&self, tenant: u64, centroid: u32) -> Result<Vec<PostingEntry>> {
        let mut out = Vec::new();
        self.scan_posting(tenant, centroid, |key, payload| {
            out.push(PostingEntry {
                doc_id: key.doc_id,
                token_ord: key.token_ord.unwrap_or(0),
                payload: payload.to_vec(),
            });
            Ok(())
        })?;
        Ok(out)
    }

    fn scan_posting(
        &self,
        tenant: u64,
        centroid: u32,
        mut visit: impl FnMut(PostingKey, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(POSTING)?;
        let prefix = PostingKey::prefix(tenant, centroid);
        match PostingKey::prefix_upper_bound(tenant, centroid) {
            Some(upper) => {
                for item in table.range(prefix.as_slice()..upper.as_slice())? {
                    let (k, v) = item?;
                    visit(PostingKey::decode(k.value())?, v.value())?;
                }
            }
            None => {
                for item in table.range(prefix.as_slice()..)? {
                    let (k, v) = item?;
                    visit(PostingKey::decode(k.value())?, v.value())?;
                }
            }
        }
        Ok(())
    }

    /// Centroid set for one document, if present.
    pub fn mapping(&self, tenant: u64, doc_id: i64) -> Result<Option<Vec<u32>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(MAPPING)?;
        let key = ForwardKey::new(tenant, doc_id).encode();
        match table.get(key.as_slice())? {
            Some(guard) => Ok(Some(bytes_to_codes(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Bulk-load forward code sequences; `None` marks missing documents.
    pub fn codes_many(&self, tenant: u64, doc_ids: &[i64]) -> Result<Vec<Option<Vec<u32>>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FORWARD_CODES)?;
        doc_ids
            .iter()
            .map(|&doc_id| {
                let key = ForwardKey::new(tenant, doc_id).encode();
                match table.get(key.as_slice())? {
                    Some(guard) => Ok(Some(bytes_to_codes(guard.value())?)),
                    None => Ok(None),
                }
            })
            .collect()
    }

    /// Bulk-load residual blobs as `(num_tokens, bytes)` pairs.
    pub fn residuals_many(
        &self,
        tenant: u64,
        doc_ids: &[i64],
    ) -> Result<Vec<Option<(usize, Vec<u8>)>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FORWARD_RESIDUALS)?;
        doc_ids
            .iter()
            .map(|&doc_id| {
                let key = ForwardKey::new(tenant, doc_id).encode();
                match table.get(key.as_slice())? {
                    Some(guard) => Ok(Some(bytes_to_residuals(guard.value())?)),
                    None => Ok(None),
                }
            })
            .collect()
    }

    /// Bulk-load metadata maps.
    pub fn metadata_many(
        &self,
        tenant: u64,
        doc_ids: &[i64],
    ) -> Result<Vec<Option<MetadataMap>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOC_METADATA)?;
        doc_ids
            .iter()
            .map(|&doc_id| {
                let key = ForwardKey::new(tenant, doc_id).encode();
                match table.get(key.as_slice())? {
                    Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
                    None => Ok(None),
                }
            })
            .collect()
    }

    /// Upsert every row of every partition from `other` into this store.
    pub fn merge_from(&self, other: &Storage) -> Result<()> {
        self.require_writable()?;
        let other_txn = other.db.begin_read()?;
        let txn = self.db.begin_write()?;
        for def in ALL_TABLES {
            let source = other_txn.open_table(def)?;
            let mut target = txn.open_table(def)?;
            for item in source.range::<&[u8]>(..)? {
                let (k, v) = item?;
                target.insert(k.value(), v.value())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Commits are synchronously durable, so there is nothing buffered to
    /// push out.
    pub fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Smallest byte string strictly greater than every extension of `key`.
fn increment_key(key: &[u8]) -> Option<Vec<u8>> {
    let mut out = key.to_vec();
    while let Some(last) = out.last_mut() {
        if *last == u8::MAX {
            out.pop();
        } else {
            *last += 1;
            return Some(out);
        }
    }
    None
}

fn codes_to_bytes(codes: &[u32]) -> Vec<u8> {
    bytemuck::cast_slice(codes).to_vec()
}

fn bytes_to_codes(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % size_of::<u32>() != 0 {
        return Err(Error::corrupt(format!(
            "code stream length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytemuck::pod_collect_to_vec(bytes))
}

fn residuals_to_bytes(num_tokens: usize, residuals: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + residuals.len());
    out.extend_from_slice(&(num_tokens as u32).to_le_bytes());
    out.extend_from_slice(residuals);
    out
}

fn bytes_to_residuals(bytes: &[u8]) -> Result<(usize, Vec<u8>)> {
    if bytes.len() < 4 {
        return Err(Error::corrupt("residual record shorter than its header"));
    }
    let num_tokens = u32::from_le_bytes(bytes[0..4].try_into().expect("sized slice")) as usize;
    Ok((num_tokens, bytes[4..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(doc_id: i64, codes: Vec<u32>, code_size: usize) -> EncodedDocument {
        let num_tokens = codes.len();
        EncodedDocument {
            doc_id,
            residuals: vec![doc_id as u8; num_tokens * code_size],
            num_tokens,
            code_size,
            codes,
            metadata: None,
        }
    }

    fn open_store(dir: &TempDir) -> Storage {
        Storage::open(dir.path(), false).expect("open store")
    }

    #[test]
    fn add_then_read_back_every_partition() {
        let dir = TempDir::new().expect("tempdir");
        let store = open_store(&dir);

        let mut document = doc(7, vec![3, 1, 3], 2);
        document.metadata = Some(
            json!({ "title": "test" })
                .as_object()
                .expect("object")
                .clone(),
        );
        store.add(1, &document, false).expect("add");

        assert_eq!(store.posting_docs(1, 1).expect("scan"), vec![7]);
        assert_eq!(store.posting_docs(1, 3).expect("scan"), vec![7]);
        assert_eq!(store.posting_docs(1, 2).expect("scan"), Vec::<i64>::new());

        assert_eq!(store.mapping(1, 7).expect("mapping"), Some(vec![1, 3]));
        assert_eq!(
            store.codes_many(1, &[7]).expect("codes")[0],
            Some(vec![3, 1, 3])
        );
        let (num_tokens, residuals) = store.residuals_many(1, &[7]).expect("residuals")[0]
            .clone()
            .expect("present");
        assert_eq!(num_tokens, 3);
        assert_eq!(residuals.len(), 6);
        let metadata = store.metadata_many(1, &[7]).expect("metadata")[0]
            .clone()
            .expect("present");
        assert_eq!(metadata.get("title"), Some(&json!("test")));
    }

    #[test]
    fn tenants_are_isolated() {
        let dir = TempDir::new().expect("tempdir");
        let store = open_store(&dir);
        store.add(1, &doc(5, vec![2], 2), false).expect("add");
        store.add(2, &doc(6, vec![2], 2), false).expect("add");

        assert_eq!(store.posting_docs(1, 2).expect("scan"), vec![5]);
        assert_eq!(store.posting_docs(2, 2).expect("scan"), vec![6]);
        assert_eq!(store.codes_many(2, &[5]).expect("codes")[0], None);
    }

    #[test]
    fn posting_scan_is_ascending_and_prefix_bounded() {
        let dir = TempDir::new().expect("tempdir");
        let store = open_store(&dir);
        for doc_id in [30i64, -2, 14, 0, 7] {
            store.add(1, &doc(doc_id, vec![9], 1), false).expect("add");
        }
        // A neighboring centroid must not leak into the scan.
        store.add(1, &doc(99, vec![10], 1), false).expect("add");

        assert_eq!(store.posting_docs(1, 9).expect("scan"), vec![-2, 0, 7, 14, 30]);
    }

    #[test]
    fn token_level_entries_carry_payloads() {
        let dir = TempDir::new().expect("tempdir");
        let store = open_store(&dir);
        let document = EncodedDocument {
            doc_id: 4,
            codes: vec![8, 8, 5],
            residuals: vec![10, 11, 20, 21, 30, 31],
            num_tokens: 3,
            code_size: 2,
            metadata: None,
        };
        store.add(1, &document, true).expect("add");

        let entries = store.posting_entries(1, 8).expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].token_ord, 0);
        assert_eq!(entries[0].payload, vec![10, 11]);
        assert_eq!(entries[1].token_ord, 1);
        assert_eq!(entries[1].payload, vec![20, 21]);

        // Token entries still deduplicate into one doc id.
        assert_eq!(store.posting_docs(1, 8).expect("scan"), vec![4]);
        // XTR-style adds skip the forward-codes row.
        assert_eq!(store.codes_many(1, &[4]).expect("codes")[0], None);
    }

    #[test]
    fn remove_purges_every_reference() {
        let dir = TempDir::new().expect("tempdir");
        let store = open_store(&dir);
        let mut document = doc(11, vec![1, 2], 2);
        document.metadata = Some(json!({ "k": "v" }).as_object().expect("object").clone());
        store.add(1, &document, false).expect("add");
        store.add(1, &doc(12, vec![2], 2), false).expect("add");

        store.remove(1, &[11]).expect("remove");

        assert_eq!(store.posting_docs(1, 1).expect("scan"), Vec::<i64>::new());
        assert_eq!(store.posting_docs(1, 2).expect("scan"), vec![12]);
        assert_eq!(store.mapping(1, 11).expect("mapping"), None);
        assert_eq!(store.codes_many(1, &[11]).expect("codes")[0], None);
        assert_eq!(store.residuals_many(1, &[11]).expect("residuals")[0], None);
        assert_eq!(store.metadata_many(1, &[11]).expect("metadata")[0], None);
    }

    #[test]
    fn remove_purges_token_level_entries() {
        let dir = TempDir::new().expect("tempdir");
        let store = open_store(&dir);
        store.add(1, &doc(3, vec![6, 6, 7], 1), true).expect("add");
        store.remove(1, &[3]).expect("remove");
        assert!(store.posting_entries(1, 6).expect("entries").is_empty());
        assert!(store.posting_entries(1, 7).expect("entries").is_empty());
    }

    #[test]
    fn merge_upserts_other_store() {
        let dir_a = TempDir::new().expect("tempdir");
        let dir_b = TempDir::new().expect("tempdir");
        let a = open_store(&dir_a);
        let b = open_store(&dir_b);
        a.add(1, &doc(1, vec![4], 2), false).expect("add a");
        b.add(1, &doc(2, vec![4], 2), false).expect("add b");

        a.merge_from(&b).expect("merge");
        assert_eq!(store_docs(&a), vec![1, 2]);
    }

    fn store_docs(store: &Storage) -> Vec<i64> {
        store.posting_docs(1, 4).expect("scan")
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = TempDir::new().expect("tempdir");
        {
            let store = open_store(&dir);
            store.add(1, &doc(1, vec![0], 2), false).expect("add");
        }
        let store = Storage::open(dir.path(), true).expect("open read-only");
        assert!(matches!(
            store.add(1, &doc(2, vec![0], 2), false),
            Err(Error::Config(_))
        ));
        assert_eq!(store.posting_docs(1, 0).expect("scan"), vec![1]);
    }

    #[test]
    fn mismatched_value_lengths_are_corrupt() {
        assert!(bytes_to_codes(&[1, 2, 3]).is_err());
        assert!(bytes_to_residuals(&[1]).is_err());
    }

    #[test]
    fn document_invariants_are_checked_on_add() {
        let dir = TempDir::new().expect("tempdir");
        let store = open_store(&dir);
        let bad = EncodedDocument {
            doc_id: 1,
            codes: vec![0, 1],
            residuals: vec![0; 3], // not num_tokens * code_size
            num_tokens: 2,
            code_size: 2,
            metadata: None,
        };
        assert!(matches!(store.add(1, &bad, false), Err(Error::Config(_))));
    }
}
