use std::fs;
use std::io::Cursor;
use std::sync::Arc;

use artsearch::embed::embed_bytes;
use artsearch::*;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::Array2;
use rand::prelude::*;
use rstest::*;
use tempfile::TempDir;

const SPEC: EmbedderSpec = EmbedderSpec::Grid { grid: 2, size: 16 };

fn encode(img: RgbImage) -> Vec<u8> {
    let mut buf = vec![];
    DynamicImage::ImageRgb8(img).write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
    buf
}

#[fixture]
fn temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

#[fixture]
fn images() -> Vec<(String, Vec<u8>)> {
    let cat = RgbImage::from_fn(32, 32, |x, _| if x < 16 { Rgb([230, 120, 40]) } else { Rgb([250, 250, 250]) });
    let dog = RgbImage::from_fn(32, 32, |x, y| Rgb([20, (x * 8) as u8, (y * 8) as u8]));
    let tree = RgbImage::from_fn(32, 32, |_, y| if y < 20 { Rgb([30, 160, 40]) } else { Rgb([100, 60, 20]) });
    let sky = RgbImage::from_pixel(32, 32, Rgb([135, 206, 235]));
    let night = RgbImage::from_fn(32, 32, |x, y| if (x * y) % 7 == 0 { Rgb([255, 255, 200]) } else { Rgb([5, 5, 30]) });
    vec![
        ("cat.jpg".to_owned(), encode(cat)),
        ("dog.png".to_owned(), encode(dog)),
        ("tree.png".to_owned(), encode(tree)),
        ("sky.png".to_owned(), encode(sky)),
        ("night.png".to_owned(), encode(night)),
    ]
}

#[fixture]
fn embedder() -> Arc<dyn Embedder> {
    SPEC.create().unwrap()
}

#[fixture]
fn pipeline(images: Vec<(String, Vec<u8>)>, embedder: Arc<dyn Embedder>) -> QueryPipeline {
    let store = FeatureStore::build(&images, embedder.as_ref());
    let catalog = Catalog::build(store, IndexKind::Flat, SPEC).unwrap();
    QueryPipeline::new(Arc::new(catalog), embedder).unwrap()
}

/// 随机生成的特征，维数与 SPEC 一致
fn random_pipeline(n: usize, kind: IndexKind) -> QueryPipeline {
    let mut rng = StdRng::seed_from_u64(42);
    let dim = SPEC.dim();
    let vectors = Array2::from_shape_fn((n, dim), |_| rng.random_range(-1.0..1.0f32));
    let ids = (0..n).map(|i| format!("{i:03}.jpg")).collect();
    let store = FeatureStore::new(ids, vectors).unwrap();
    let catalog = Catalog::build(store, kind, SPEC).unwrap();
    QueryPipeline::new(Arc::new(catalog), SPEC.create().unwrap()).unwrap()
}

#[rstest]
fn test_embed_dim_finite(images: Vec<(String, Vec<u8>)>, embedder: Arc<dyn Embedder>) {
    for (_, bytes) in &images {
        let v = embed_bytes(embedder.as_ref(), bytes).unwrap();
        assert_eq!(v.len(), SPEC.dim());
        assert!(v.iter().all(|x| x.is_finite()));
    }
}

#[rstest]
#[case::index(RankMode::Index)]
#[case::cosine(RankMode::Cosine)]
#[case::two_stage(RankMode::TwoStage)]
fn test_query_finds_itself(
    #[case] mode: RankMode,
    images: Vec<(String, Vec<u8>)>,
    pipeline: QueryPipeline,
) {
    let opts = QueryOptions { mode, ..Default::default() };
    let result = pipeline.query(&images[0].1, &opts).unwrap();
    assert_eq!(result.method, mode);
    assert_eq!(result.matches.len(), 3);
    assert_eq!(result.matches[0].id, "cat.jpg");
    match result.score_kind {
        ScoreKind::Distance => assert!(result.matches[0].score.abs() < 1e-6),
        ScoreKind::Cosine => assert!((result.matches[0].score - 1.0).abs() < 1e-5),
    }
}

#[rstest]
fn test_build_skips_undecodable(mut images: Vec<(String, Vec<u8>)>, embedder: Arc<dyn Embedder>) {
    images.insert(2, ("broken.jpg".to_owned(), b"definitely not an image".to_vec()));
    let store = FeatureStore::build(&images, embedder.as_ref());
    assert_eq!(store.len(), 5);
    assert_eq!(store.ids(), &["cat.jpg", "dog.png", "tree.png", "sky.png", "night.png"]);
}

#[rstest]
fn test_persist_load_same_results(temp_dir: TempDir, images: Vec<(String, Vec<u8>)>, pipeline: QueryPipeline) {
    let dir = temp_dir.path().join("catalog");
    pipeline.catalog().save(&dir).unwrap();
    let loaded = QueryPipeline::open(&dir).unwrap();

    for mode in [RankMode::Index, RankMode::Cosine, RankMode::TwoStage] {
        let opts = QueryOptions { mode, top_k: Some(5), coarse_k: None };
        for (_, bytes) in &images {
            assert_eq!(pipeline.query(bytes, &opts).unwrap(), loaded.query(bytes, &opts).unwrap());
        }
    }
}

#[rstest]
#[case::flat(IndexKind::Flat)]
#[case::hnsw(IndexKind::Hnsw)]
fn test_k_larger_than_total(#[case] kind: IndexKind) {
    let pipeline = random_pipeline(10, kind);
    let query = vec![0.5; SPEC.dim()];
    assert_eq!(pipeline.catalog().search(&query, 20).unwrap().len(), 10);

    for mode in [RankMode::Index, RankMode::Cosine, RankMode::TwoStage] {
        let opts = QueryOptions { mode, top_k: Some(20), coarse_k: None };
        assert_eq!(pipeline.query_vector(&query, &opts).unwrap().matches.len(), 10);
    }
}

#[rstest]
fn test_zero_vector_is_degenerate() {
    let pipeline = random_pipeline(10, IndexKind::Flat);
    let query = vec![0.0; SPEC.dim()];
    for mode in [RankMode::Cosine, RankMode::TwoStage] {
        let opts = QueryOptions { mode, ..Default::default() };
        let err = pipeline.query_vector(&query, &opts).unwrap_err();
        assert!(matches!(err, RetrievalError::DegenerateVector));
    }
    // 只使用欧氏距离时零向量是合法的
    let opts = QueryOptions { mode: RankMode::Index, ..Default::default() };
    assert!(pipeline.query_vector(&query, &opts).is_ok());
}

#[rstest]
fn test_two_stage_within_coarse() {
    let pipeline = random_pipeline(200, IndexKind::Flat);
    let mut rng = StdRng::seed_from_u64(7);
    for coarse_k in [1, 3, 10, 50] {
        let query = (0..SPEC.dim()).map(|_| rng.random_range(-1.0..1.0f32)).collect::<Vec<_>>();
        let opts = QueryOptions { mode: RankMode::TwoStage, top_k: Some(3), coarse_k: Some(coarse_k) };
        let result = pipeline.query_vector(&query, &opts).unwrap();

        let coarse = pipeline.catalog().search(&query, coarse_k.max(3)).unwrap();
        let coarse_ids = coarse
            .iter()
            .map(|n| pipeline.catalog().identifier(n.row).unwrap().to_owned())
            .collect::<Vec<_>>();
        assert_eq!(result.matches.len(), 3);
        assert!(result.matches.iter().all(|m| coarse_ids.contains(&m.id)));
        assert!(result.matches.windows(2).all(|w| w[0].score >= w[1].score));
    }
}

#[rstest]
fn test_repeated_queries_identical(images: Vec<(String, Vec<u8>)>, pipeline: QueryPipeline) {
    for mode in [RankMode::Index, RankMode::Cosine, RankMode::TwoStage] {
        let opts = QueryOptions { mode, top_k: Some(5), coarse_k: Some(5) };
        let first = pipeline.query(&images[3].1, &opts).unwrap();
        for _ in 0..5 {
            assert_eq!(pipeline.query(&images[3].1, &opts).unwrap(), first);
        }
    }
}

#[rstest]
fn test_hnsw_catalog_roundtrip(temp_dir: TempDir) {
    let pipeline = random_pipeline(100, IndexKind::Hnsw);
    let dir = temp_dir.path().join("hnsw");
    pipeline.catalog().save(&dir).unwrap();
    let loaded = QueryPipeline::open(&dir).unwrap();
    assert_eq!(loaded.catalog().index_kind(), IndexKind::Hnsw);
    assert_eq!(loaded.catalog().len(), 100);

    // 查询库中已有的向量，最近邻一定是它自身
    let row = pipeline.catalog().store().vector(17).to_vec();
    let opts = QueryOptions { mode: RankMode::Index, top_k: Some(1), coarse_k: None };
    assert_eq!(loaded.query_vector(&row, &opts).unwrap().matches[0].id, "017.jpg");
}

#[rstest]
fn test_corrupted_catalog(temp_dir: TempDir, pipeline: QueryPipeline) {
    let dir = temp_dir.path().join("catalog");
    pipeline.catalog().save(&dir).unwrap();

    // 标识符文件被替换为其他内容
    let paths = dir.join(artsearch::store::PATHS_FILE);
    let ids = vec!["a.jpg".to_owned(), "b.jpg".to_owned()];
    fs::write(&paths, bincode::serialize(&ids).unwrap()).unwrap();
    let err = Catalog::open(&dir).err().unwrap();
    assert!(matches!(err, RetrievalError::IndexCorruption(_)));

    // 索引文件缺失
    pipeline.catalog().save(&dir).unwrap();
    fs::remove_file(dir.join(artsearch::index::FLAT_INDEX_FILE)).unwrap();
    let err = Catalog::open(&dir).err().unwrap();
    assert!(matches!(err, RetrievalError::IndexCorruption(_)));

    let err = QueryPipeline::open(&dir).err().unwrap();
    assert!(matches!(err.downcast_ref::<RetrievalError>(), Some(RetrievalError::IndexCorruption(_))));
}
