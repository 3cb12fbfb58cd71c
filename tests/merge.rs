//! Merging identically-configured indexes.

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tempfile::TempDir;

use lire::{
    EmbeddingPassage, Index, IndexConfig, QuantizerKind, SearchOptions, math::normalize_rows,
};

const DIM: usize = 16;

fn random_unit_vectors(n: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data: Vec<f32> = (0..n * DIM).map(|_| rng.random_range(-1.0f32..1.0)).collect();
    normalize_rows(&mut data, DIM);
    data
}

fn config() -> IndexConfig {
    IndexConfig::new()
        .with_dim(DIM)
        .with_nlist(8)
        .with_niter(4)
        .with_quantizer_kind(QuantizerKind::Binarizer)
}

fn wide_open_options() -> SearchOptions {
    SearchOptions {
        k_top_centroids: 8,
        centroid_score_threshold: 0.0,
        n_probe: 8,
        ..Default::default()
    }
}

#[test]
fn merge_returns_documents_from_both_indexes() {
    let dir_a = TempDir::new().expect("tempdir");
    let dir_b = TempDir::new().expect("tempdir");

    let training = random_unit_vectors(512, 1234);

    let mut a = Index::create(dir_a.path(), config()).expect("create a");
    a.train(&training, 512, DIM, None, None).expect("train a");
    let vectors_one = random_unit_vectors(4, 10);
    a.add(1, &[EmbeddingPassage::new(1, vectors_one.clone(), 4)])
        .expect("add to a");

    // B is a structural clone of A: same codebook, no documents.
    let vectors_two = random_unit_vectors(4, 20);
    {
        let b = a.clone_structure(dir_b.path()).expect("clone structure");
        b.add(1, &[EmbeddingPassage::new(2, vectors_two.clone(), 4)])
            .expect("add to b");
    }

    a.merge(dir_b.path()).expect("merge");

    let hits_one = a.search(1, &vectors_one, 4, 5, &wide_open_options()).expect("search");
    let hits_two = a.search(1, &vectors_two, 4, 5, &wide_open_options()).expect("search");
    assert!(hits_one.iter().any(|r| r.doc_id == 1));
    assert!(hits_two.iter().any(|r| r.doc_id == 2));
    // Both documents are now visible in a single search.
    assert_eq!(hits_two.len(), 2);
}

#[test]
fn merge_keeps_existing_documents_on_id_collision() {
    let dir_a = TempDir::new().expect("tempdir");
    let dir_b = TempDir::new().expect("tempdir");
    let training = random_unit_vectors(512, 77);

    let mut a = Index::create(dir_a.path(), config()).expect("create a");
    a.train(&training, 512, DIM, None, None).expect("train a");
    let vectors = random_unit_vectors(4, 30);
    a.add(1, &[EmbeddingPassage::new(5, vectors.clone(), 4)])
        .expect("add to a");

    {
        let mut b = Index::create(dir_b.path(), config()).expect("create b");
        b.train(&training, 512, DIM, None, None).expect("train b");
        b.add(1, &[EmbeddingPassage::new(5, vectors.clone(), 4)])
            .expect("add to b");
    }

    a.merge(dir_b.path()).expect("merge");
    let hits = a.search(1, &vectors, 4, 10, &wide_open_options()).expect("search");
    assert_eq!(hits.iter().filter(|r| r.doc_id == 5).count(), 1);
}
