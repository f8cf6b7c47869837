use std::path::Path;

use hnsw_rs::prelude::*;
use log::debug;
use ndarray::ArrayView2;
use rayon::prelude::*;

use super::{IndexKind, Neighbor, VectorIndex};
use crate::error::{Result, RetrievalError};

const BASENAME: &str = "index";
pub const HNSW_GRAPH_FILE: &str = "index.hnsw.graph";
pub const HNSW_DATA_FILE: &str = "index.hnsw.data";
const MAX_NB_CONNECTION: usize = 32;
const MAX_LAYER: usize = 16;
const EF_CONSTRUCTION: usize = 128;
const EF_SEARCH: usize = 64;

/// HNSW 近似搜索索引
///
/// 行号作为 HNSW 中的数据 ID。返回的距离为平方欧氏距离，
/// 与 [`FlatIndex`](super::FlatIndex) 保持一致。
pub struct HnswIndex {
    hnsw: Hnsw<'static, f32, DistL2>,
    dim: usize,
}

impl HnswIndex {
    pub fn build(vectors: ArrayView2<f32>) -> Self {
        let dim = vectors.ncols();
        let rows = vectors.rows().into_iter().map(|row| row.to_vec()).collect::<Vec<_>>();

        let hnsw = Hnsw::<f32, DistL2>::new(
            MAX_NB_CONNECTION,
            rows.len().max(1),
            MAX_LAYER,
            EF_CONSTRUCTION,
            DistL2 {},
        );
        rows.par_iter().enumerate().for_each(|(i, row)| {
            hnsw.insert((row.as_slice(), i));
        });

        let mut index = Self { hnsw, dim };
        index.hnsw.set_searching_mode(true);
        index
    }

    /// 从目录中加载索引
    pub fn open(dir: &Path, dim: usize) -> Result<Self> {
        for file in [HNSW_GRAPH_FILE, HNSW_DATA_FILE] {
            let path = dir.join(file);
            if !path.exists() {
                return Err(RetrievalError::corruption(format!("缺少文件 {}", path.display())));
            }
        }
        let reloader = HnswIo::new(dir, BASENAME);
        // NOTE: reloader 加载的 HNSW 生命周期依赖于 reloader 的引用，所以需要使用 Box::leak 来延长生命周期
        // 每次加载泄漏一个 reloader，服务端只在目录变化时重新加载
        let reloader = Box::leak(Box::new(reloader));
        let hnsw = reloader
            .load_hnsw_with_dist(DistL2 {})
            .map_err(|e| RetrievalError::corruption(format!("无法加载 HNSW 索引: {e}")))?;
        debug!("HNSW 索引已加载，共 {} 个向量", hnsw.get_nb_point());
        Ok(Self { hnsw, dim })
    }
}

impl VectorIndex for HnswIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Hnsw
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn ntotal(&self) -> usize {
        self.hnsw.get_nb_point()
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        RetrievalError::check_dim(self.dim, query.len())?;
        let k = k.min(self.ntotal());
        if k == 0 {
            return Ok(vec![]);
        }

        // DistL2 返回的是欧氏距离，这里转换为平方距离
        let mut neighbors = self
            .hnsw
            .search(query, k, EF_SEARCH.max(k))
            .into_iter()
            .map(|n| Neighbor { row: n.d_id, distance: n.distance * n.distance })
            .collect::<Vec<_>>();
        neighbors.sort_unstable();
        Ok(neighbors)
    }

    fn save(&self, dir: &Path) -> anyhow::Result<()> {
        self.hnsw.file_dump(dir, BASENAME)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;
    use tempfile::TempDir;

    use super::*;

    fn grid_vectors() -> Array2<f32> {
        Array2::from_shape_fn((64, 2), |(i, j)| if j == 0 { (i % 8) as f32 } else { (i / 8) as f32 })
    }

    #[test]
    fn test_hnsw_finds_exact_point() {
        let index = HnswIndex::build(grid_vectors().view());
        assert_eq!(index.ntotal(), 64);
        let result = index.search(&[3., 5.], 1).unwrap();
        assert_eq!(result[0].row, 5 * 8 + 3);
        assert_eq!(result[0].distance, 0.);
    }

    #[test]
    fn test_hnsw_save_open() {
        let dir = TempDir::new().unwrap();
        let index = HnswIndex::build(grid_vectors().view());
        index.save(dir.path()).unwrap();

        let loaded = HnswIndex::open(dir.path(), 2).unwrap();
        assert_eq!(loaded.ntotal(), 64);
        let result = loaded.search(&[7., 7.], 1).unwrap();
        assert_eq!(result[0].row, 63);
    }

    #[test]
    fn test_hnsw_open_missing() {
        let dir = TempDir::new().unwrap();
        let err = HnswIndex::open(dir.path(), 2).err().unwrap();
        assert!(matches!(err, RetrievalError::IndexCorruption(_)));
    }
}
