use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tempfile::TempDir;

use lire::{
    EmbeddingPassage, Index, IndexConfig, QuantizerKind, SearchOptions, math::normalize_rows,
};

const DIM: usize = 128;

fn random_unit_vectors(n: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data: Vec<f32> = (0..n * DIM).map(|_| rng.random_range(-1.0f32..1.0)).collect();
    normalize_rows(&mut data, DIM);
    data
}

fn bench_search(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let config = IndexConfig::new()
        .with_dim(DIM)
        .with_nlist(128)
        .with_nbits(2)
        .with_niter(4)
        .with_quantizer_kind(QuantizerKind::Binarizer);
    let mut index = Index::create(dir.path(), config).expect("create");
    index
        .train(&random_unit_vectors(8192, 1), 8192, DIM, None, None)
        .expect("train");

    let num_tokens = 48;
    let docs: Vec<EmbeddingPassage> = (0..512i64)
        .map(|doc_id| {
            let vectors = random_unit_vectors(num_tokens, 100 + doc_id as u64);
            EmbeddingPassage::new(doc_id, vectors, num_tokens)
        })
        .collect();
    index.add(1, &docs).expect("add");

    let query = random_unit_vectors(8, 9999);
    let opts = SearchOptions {
        k_top_centroids: 4,
        centroid_score_threshold: 0.3,
        n_probe: 32,
        ..Default::default()
    };

    c.bench_function("search_512_docs_top10", |b| {
        b.iter(|| {
            index
                .search(1, black_box(&query), 8, 10, &opts)
                .expect("search")
        })
    });
}

criterion_group!(benches, bench_search);
criterion_main!(benches);
