//! The index aggregate: one owner for the quantizers, the store, and the
//! configuration.
//!
//! Retrieval borrows everything read-only for the duration of a query, so a
//! shared `Index` handle supports concurrent searches; mutation takes
//! `&self` too because the store synchronizes writers internally, but
//! inter-document ordering across concurrent `add` calls is undefined.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::coarse::CoarseQuantizer;
use crate::config::{self, IndexConfig, QuantizerKind};
use crate::error::{Error, Result};
use crate::quantizer::{Binarizer, ProductQuantizer, ResidualCodec};
use crate::retriever::{SearchOptions, SearchResult, retrieve_plaid, retrieve_xtr};
use crate::storage::{EncodedDocument, MetadataMap, Storage};
use crate::version::Version;

/// One document to index: a packed row-major `num_tokens × dim` block of
/// unit-norm token embeddings plus optional metadata.
#[derive(Debug, Clone)]
pub struct EmbeddingPassage {
    pub doc_id: i64,
    pub embeddings: Vec<f32>,
    pub num_tokens: usize,
    pub metadata: Option<MetadataMap>,
}

impl EmbeddingPassage {
    pub fn new(doc_id: i64, embeddings: Vec<f32>, num_tokens: usize) -> Self {
        EmbeddingPassage {
            doc_id,
            embeddings,
            num_tokens,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A tenant-isolated late-interaction index over one directory.
pub struct Index {
    path: PathBuf,
    config: IndexConfig,
    version: Version,
    coarse: CoarseQuantizer,
    codec: ResidualCodec,
    storage: Storage,
    pool: Option<rayon::ThreadPool>,
    read_only: bool,
}

impl Index {
    /// Create a fresh, untrained index at `path`.
    pub fn create(path: impl AsRef<Path>, config: IndexConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        config.validate()?;
        let codec = build_codec(&config)?;
        fs::create_dir_all(&path)?;

        let storage = Storage::open(&path, false)?;
        let index = Index {
            coarse: CoarseQuantizer::new(config.dim),
            pool: build_pool(&config)?,
            version: Version::current(),
            config,
            codec,
            storage,
            path,
            read_only: false,
        };
        config::write_metadata(&index.path, &index.config)?;
        info!(path = %index.path.display(), "created index");
        Ok(index)
    }

    /// Open an existing index directory.
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (config, version) = config::read_metadata(&path)?;
        let storage = Storage::open(&path, read_only)?;

        // An index saves its quantizers at train time; before that only the
        // metadata and the (empty) store exist.
        let coarse = match CoarseQuantizer::load(&path, version) {
            Ok(q) => q,
            Err(Error::NotFound(_)) => CoarseQuantizer::new(config.dim),
            Err(e) => return Err(e),
        };
        let codec = if coarse.is_trained() {
            let expect_none = matches!(config.quantizer_kind, QuantizerKind::None)
                .then_some(config.dim);
            ResidualCodec::load(&path, expect_none)?
        } else {
            build_codec(&config)?
        };

        info!(path = %path.display(), trained = coarse.is_trained(), "opened index");
        Ok(Index {
            pool: build_pool(&config)?,
            coarse,
            version,
            config,
            codec,
            storage,
            path,
            read_only,
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn is_trained(&self) -> bool {
        self.coarse.is_trained() && self.codec.is_trained()
    }

    /// Train the coarse centroids and the residual codec on `n` packed
    /// `dim`-length vectors. `nlist`/`niter` override the configured values
    /// when given. Training twice is an error; re-create instead.
    pub fn train(
        &mut self,
        vectors: &[f32],
        n: usize,
        dim: usize,
        nlist: Option<usize>,
        niter: Option<usize>,
    ) -> Result<()> {
        if self.coarse.is_trained() {
            return Err(Error::AlreadyTrained);
        }
        self.require_writable()?;
        if dim != self.config.dim {
            return Err(Error::config(format!(
                "training vectors have dim {dim}, index expects {}",
                self.config.dim
            )));
        }
        if let Some(nlist) = nlist {
            self.config.nlist = nlist;
        }
        if let Some(niter) = niter {
            self.config.niter = niter;
        }
        self.config.validate()?;

        let run = |index: &mut Self| -> Result<()> {
            index.coarse.train(
                vectors,
                n,
                index.config.nlist,
                index.config.niter,
                index.config.seed,
            )?;

            // The residual codec trains on what it will actually see:
            // residuals against the assigned centroids.
            let codes = index.coarse.assign(vectors, n)?;
            let mut residuals = vec![0.0f32; n * dim];
            for (i, &code) in codes.iter().enumerate() {
                let vector = &vectors[i * dim..(i + 1) * dim];
                let out = &mut residuals[i * dim..(i + 1) * dim];
                index.coarse.residual(vector, code, out)?;
            }
            index.codec.train(&residuals, n, index.config.seed)
        };
        if let Some(pool) = self.pool.take() {
            let result = pool.install(|| run(self));
            self.pool = Some(pool);
            result?;
        } else {
            run(self)?;
        }

        self.save()?;
        info!(nlist = self.config.nlist, dim, n, "index trained");
        Ok(())
    }

    /// Replace the coarse centroid table wholesale (shared-codebook builds).
    pub fn set_centroids(&mut self, data: &[f32], n: usize) -> Result<()> {
        self.require_writable()?;
        self.coarse.reset();
        self.coarse.add(data, n)
    }

    /// Install externally fitted binarizer parameters. Fails on any other
    /// codec variant.
    pub fn set_binarizer_parameters(
        &mut self,
        weights: Vec<f32>,
        cutoffs: Vec<f32>,
        avg_residual: f32,
    ) -> Result<()> {
        self.require_writable()?;
        match &mut self.codec {
            ResidualCodec::Binarizer(b) => b.set_parameters(weights, cutoffs, avg_residual),
            _ => Err(Error::config(
                "binarizer parameters on a non-binarizer index",
            )),
        }
    }

    /// Add documents for `tenant`. The batch's writes across all partitions
    /// commit atomically; ordering between concurrent `add` calls is
    /// unspecified.
    pub fn add(&self, tenant: u64, docs: &[EmbeddingPassage]) -> Result<()> {
        self.require_writable()?;
        self.require_trained()?;
        let encoded: Vec<_> = docs
            .iter()
            .map(|doc| self.encode_passage(doc))
            .collect::<Result<_>>()?;
        self.storage
            .add_batch(tenant, &encoded, self.config.quantizer_kind.posting_payloads())
    }

    /// Remove documents point-wise.
    pub fn remove(&self, tenant: u64, doc_ids: &[i64]) -> Result<()> {
        self.require_writable()?;
        self.storage.remove(tenant, doc_ids)
    }

    /// Replace documents: remove then add.
    pub fn update(&self, tenant: u64, docs: &[EmbeddingPassage]) -> Result<()> {
        let ids: Vec<i64> = docs.iter().map(|d| d.doc_id).collect();
        self.remove(tenant, &ids)?;
        self.add(tenant, docs)
    }

    /// Top-`k` MaxSim search with `num_tokens` packed query vectors.
    pub fn search(
        &self,
        tenant: u64,
        query: &[f32],
        num_tokens: usize,
        k: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        self.require_trained()?;
        if query.len() != num_tokens * self.config.dim {
            return Err(Error::config(format!(
                "query has {} floats for {num_tokens} tokens of dim {}",
                query.len(),
                self.config.dim
            )));
        }

        let run = || -> Result<Vec<SearchResult>> {
            match (&self.codec, self.config.quantizer_kind) {
                (ResidualCodec::Pq(pq), QuantizerKind::Xtr) => retrieve_xtr(
                    &self.coarse,
                    pq,
                    &self.storage,
                    tenant,
                    query,
                    num_tokens,
                    k,
                    opts,
                ),
                _ => retrieve_plaid(
                    &self.coarse,
                    &self.codec,
                    &self.storage,
                    tenant,
                    query,
                    num_tokens,
                    k,
                    opts,
                ),
            }
        };
        let mut results = match &self.pool {
            Some(pool) => pool.install(run)?,
            None => run()?,
        };

        if self.version.metadata_enabled() && !results.is_empty() {
            let ids: Vec<i64> = results.iter().map(|r| r.doc_id).collect();
            let metadata = self.storage.metadata_many(tenant, &ids)?;
            for (result, metadata) in results.iter_mut().zip(metadata) {
                result.metadata = metadata;
            }
        }
        debug!(tenant, k, hits = results.len(), "search complete");
        Ok(results)
    }

    /// Create a new, empty, writeable index at `path` that shares this
    /// index's configuration and trained quantizers. The natural partner of
    /// [`Index::merge`]: shard builders clone the structure, add their
    /// slice, and merge back.
    pub fn clone_structure(&self, path: impl AsRef<Path>) -> Result<Index> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        let storage = Storage::open(&path, false)?;
        let clone = Index {
            coarse: self.coarse.clone(),
            codec: self.codec.clone(),
            pool: build_pool(&self.config)?,
            version: Version::current(),
            config: self.config.clone(),
            storage,
            path,
            read_only: false,
        };
        clone.save()?;
        info!(path = %clone.path.display(), "cloned index structure");
        Ok(clone)
    }

    /// Merge another index's documents into this one. Both must share the
    /// same training configuration and centroid table.
    pub fn merge(&self, other_path: impl AsRef<Path>) -> Result<()> {
        self.require_writable()?;
        self.require_trained()?;
        let other = Index::open(other_path.as_ref(), true)?;
        if self.config.training_fingerprint() != other.config.training_fingerprint() {
            return Err(Error::config(format!(
                "merge requires identical training configuration: {:?} vs {:?}",
                self.config.training_fingerprint(),
                other.config.training_fingerprint()
            )));
        }
        if self.coarse.centroids() != other.coarse.centroids() {
            return Err(Error::config(
                "merge requires an identical centroid table",
            ));
        }
        self.storage.merge_from(&other.storage)?;
        info!(other = %other_path.as_ref().display(), "merge complete");
        Ok(())
    }

    /// Persist quantizers and metadata. Document writes are already durable
    /// when `add` returns.
    pub fn save(&self) -> Result<()> {
        self.require_writable()?;
        if self.coarse.is_trained() {
            self.coarse.save(&self.path)?;
            self.codec.save(&self.path)?;
        }
        config::write_metadata(&self.path, &self.config)
    }

    /// Push buffered store state to disk.
    pub fn flush(&self) -> Result<()> {
        self.storage.flush()
    }

    /// Close the index, releasing the store's file lock. Equivalent to
    /// dropping the handle.
    pub fn close(self) {}

    fn encode_passage(&self, doc: &EmbeddingPassage) -> Result<EncodedDocument> {
        let dim = self.config.dim;
        if doc.embeddings.len() != doc.num_tokens * dim {
            return Err(Error::config(format!(
                "document {}: {} floats for {} tokens of dim {dim}",
                doc.doc_id,
                doc.embeddings.len(),
                doc.num_tokens
            )));
        }

        let codes = self.coarse.assign(&doc.embeddings, doc.num_tokens)?;
        let mut residuals = vec![0.0f32; doc.num_tokens * dim];
        for (i, &code) in codes.iter().enumerate() {
            let vector = &doc.embeddings[i * dim..(i + 1) * dim];
            let out = &mut residuals[i * dim..(i + 1) * dim];
            self.coarse.residual(vector, code, out)?;
        }
        let residual_codes = self.codec.encode(&residuals, doc.num_tokens)?;

        Ok(EncodedDocument {
            doc_id: doc.doc_id,
            codes,
            residuals: residual_codes,
            num_tokens: doc.num_tokens,
            code_size: self.codec.code_size(),
            metadata: doc.metadata.clone(),
        })
    }

    fn require_trained(&self) -> Result<()> {
        if self.is_trained() {
            Ok(())
        } else {
            Err(Error::NotTrained)
        }
    }

    fn require_writable(&self) -> Result<()> {
        if self.read_only {
            Err(Error::config("index was opened read-only"))
        } else {
            Ok(())
        }
    }
}

fn build_codec(config: &IndexConfig) -> Result<ResidualCodec> {
    Ok(match config.quantizer_kind {
        QuantizerKind::None => ResidualCodec::None { dim: config.dim },
        QuantizerKind::Binarizer => {
            ResidualCodec::Binarizer(Binarizer::new(config.nbits, config.dim)?)
        }
        QuantizerKind::Product | QuantizerKind::Xtr => ResidualCodec::Pq(ProductQuantizer::new(
            config.dim,
            config.nbits,
            config.num_subquantizers,
        )?),
    })
}

fn build_pool(config: &IndexConfig) -> Result<Option<rayon::ThreadPool>> {
    match config.threads {
        None => Ok(None),
        Some(threads) => rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map(Some)
            .map_err(|e| Error::config(format!("thread pool: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::normalize_rows;
    use rand::Rng;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::TempDir;

    fn random_unit_vectors(n: usize, dim: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data: Vec<f32> = (0..n * dim).map(|_| rng.random_range(-1.0..1.0)).collect();
        normalize_rows(&mut data, dim);
        data
    }

    fn small_config(kind: QuantizerKind) -> IndexConfig {
        IndexConfig::new()
            .with_dim(16)
            .with_nlist(8)
            .with_nbits(1)
            .with_niter(4)
            .with_num_subquantizers(4)
            .with_quantizer_kind(kind)
    }

    fn trained_index(dir: &TempDir, kind: QuantizerKind) -> Index {
        let mut index = Index::create(dir.path(), small_config(kind)).expect("create");
        let training = random_unit_vectors(512, 16, 7);
        index.train(&training, 512, 16, None, None).expect("train");
        index
    }

    #[test]
    fn create_then_open_preserves_config() {
        let dir = TempDir::new().expect("tempdir");
        {
            Index::create(dir.path(), small_config(QuantizerKind::Binarizer)).expect("create");
        }
        let index = Index::open(dir.path(), false).expect("open");
        assert_eq!(index.config().dim, 16);
        assert_eq!(index.config().nlist, 8);
        assert!(!index.is_trained());
    }

    #[test]
    fn add_before_train_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let index = Index::create(dir.path(), small_config(QuantizerKind::None)).expect("create");
        let doc = EmbeddingPassage::new(1, random_unit_vectors(4, 16, 1), 4);
        assert!(matches!(index.add(1, &[doc]), Err(Error::NotTrained)));
    }

    #[test]
    fn train_twice_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let mut index = trained_index(&dir, QuantizerKind::None);
        let data = random_unit_vectors(64, 16, 2);
        assert!(matches!(
            index.train(&data, 64, 16, None, None),
            Err(Error::AlreadyTrained)
        ));
    }

    #[test]
    fn train_override_applies_nlist() {
        let dir = TempDir::new().expect("tempdir");
        let mut index =
            Index::create(dir.path(), small_config(QuantizerKind::None)).expect("create");
        let data = random_unit_vectors(128, 16, 3);
        index.train(&data, 128, 16, Some(4), Some(2)).expect("train");
        assert_eq!(index.config().nlist, 4);
        assert_eq!(index.config().niter, 2);
    }

    #[test]
    fn trained_state_survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let centroids_before;
        {
            let index = trained_index(&dir, QuantizerKind::Binarizer);
            centroids_before = index.coarse.centroids().to_vec();
        }
        let index = Index::open(dir.path(), false).expect("open");
        assert!(index.is_trained());
        assert_eq!(index.coarse.centroids(), centroids_before.as_slice());
    }

    #[test]
    fn search_finds_indexed_document() {
        let dir = TempDir::new().expect("tempdir");
        let index = trained_index(&dir, QuantizerKind::None);
        let doc_vectors = random_unit_vectors(6, 16, 11);
        index
            .add(1, &[EmbeddingPassage::new(5, doc_vectors.clone(), 6)])
            .expect("add");

        let opts = SearchOptions {
            k_top_centroids: 8,
            centroid_score_threshold: 0.0,
            n_probe: 8,
            ..Default::default()
        };
        let results = index.search(1, &doc_vectors, 6, 3, &opts).expect("search");
        assert_eq!(results.first().map(|r| r.doc_id), Some(5));
        // Exact self-match: every query token scores 1 against itself.
        let top = results.first().expect("hit");
        assert!((top.score - 6.0).abs() < 1e-3, "score {}", top.score);
    }

    #[test]
    fn search_is_tenant_scoped() {
        let dir = TempDir::new().expect("tempdir");
        let index = trained_index(&dir, QuantizerKind::None);
        let vectors = random_unit_vectors(4, 16, 21);
        index
            .add(7, &[EmbeddingPassage::new(1, vectors.clone(), 4)])
            .expect("add");

        let opts = SearchOptions {
            k_top_centroids: 8,
            centroid_score_threshold: 0.0,
            n_probe: 8,
            ..Default::default()
        };
        assert!(index.search(8, &vectors, 4, 3, &opts).expect("search").is_empty());
        assert_eq!(index.search(7, &vectors, 4, 3, &opts).expect("search").len(), 1);
    }

    #[test]
    fn update_replaces_document() {
        let dir = TempDir::new().expect("tempdir");
        let index = trained_index(&dir, QuantizerKind::None);
        let old = random_unit_vectors(4, 16, 31);
        let new = random_unit_vectors(4, 16, 32);
        index.add(1, &[EmbeddingPassage::new(9, old, 4)]).expect("add");
        index
            .update(1, &[EmbeddingPassage::new(9, new.clone(), 4)])
            .expect("update");

        let opts = SearchOptions {
            k_top_centroids: 8,
            centroid_score_threshold: 0.0,
            n_probe: 8,
            ..Default::default()
        };
        let results = index.search(1, &new, 4, 1, &opts).expect("search");
        assert_eq!(results[0].doc_id, 9);
        assert!((results[0].score - 4.0).abs() < 1e-3);
    }

    #[test]
    fn merge_rejects_mismatched_configs() {
        let dir_a = TempDir::new().expect("tempdir");
        let dir_b = TempDir::new().expect("tempdir");
        let a = trained_index(&dir_a, QuantizerKind::None);
        {
            let mut config = small_config(QuantizerKind::None);
            config.nlist = 4;
            let mut b = Index::create(dir_b.path(), config).expect("create");
            let data = random_unit_vectors(128, 16, 4);
            b.train(&data, 128, 16, None, None).expect("train");
        }
        assert!(matches!(a.merge(dir_b.path()), Err(Error::Config(_))));
    }

    #[test]
    fn cancelled_search_returns_empty() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicBool;

        let dir = TempDir::new().expect("tempdir");
        let index = trained_index(&dir, QuantizerKind::None);
        let vectors = random_unit_vectors(4, 16, 51);
        index
            .add(1, &[EmbeddingPassage::new(1, vectors.clone(), 4)])
            .expect("add");

        let opts = SearchOptions {
            k_top_centroids: 8,
            centroid_score_threshold: 0.0,
            n_probe: 8,
            cancel_flag: Some(Arc::new(AtomicBool::new(true))),
            ..Default::default()
        };
        assert!(index.search(1, &vectors, 4, 5, &opts).expect("search").is_empty());
    }

    #[test]
    fn xtr_round_trip_finds_document() {
        let dir = TempDir::new().expect("tempdir");
        let mut config = small_config(QuantizerKind::Xtr);
        config.nbits = 4;
        config.num_subquantizers = 4;
        let mut index = Index::create(dir.path(), config).expect("create");
        let training = random_unit_vectors(512, 16, 8);
        index.train(&training, 512, 16, None, None).expect("train");

        let vectors = random_unit_vectors(5, 16, 41);
        index
            .add(1, &[EmbeddingPassage::new(3, vectors.clone(), 5)])
            .expect("add");

        let opts = SearchOptions {
            k_top_centroids: 8,
            centroid_score_threshold: 0.0,
            n_probe: 8,
            ..Default::default()
        };
        let results = index.search(1, &vectors, 5, 2, &opts).expect("search");
        assert_eq!(results.first().map(|r| r.doc_id), Some(3));
    }
}
