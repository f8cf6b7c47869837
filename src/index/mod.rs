mod flat;
mod hnsw;
mod topk;

use std::cmp::Ordering;
use std::path::Path;

use clap::ValueEnum;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

pub use self::flat::*;
pub use self::hnsw::*;
pub use self::topk::*;
use crate::error::Result;

/// 索引搜索结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// 向量在索引中的行号
    pub row: usize,
    /// 与查询向量的平方欧氏距离
    pub distance: f32,
}

impl Eq for Neighbor {}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance.total_cmp(&other.distance).then(self.row.cmp(&other.row))
    }
}

/// 索引类型
#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// 暴力搜索，结果精确
    Flat,
    /// HNSW 近似搜索
    Hnsw,
}

impl IndexKind {
    /// 使用向量矩阵构建索引，每行一个向量，行号即为搜索结果中的 ID
    pub fn build(self, vectors: ArrayView2<f32>) -> Box<dyn VectorIndex> {
        match self {
            Self::Flat => Box::new(FlatIndex::build(vectors)),
            Self::Hnsw => Box::new(HnswIndex::build(vectors)),
        }
    }

    /// 索引写入目录时产生的文件
    pub fn files(self) -> &'static [&'static str] {
        match self {
            Self::Flat => &[FLAT_INDEX_FILE],
            Self::Hnsw => &[HNSW_GRAPH_FILE, HNSW_DATA_FILE],
        }
    }

    /// 从目录中加载索引
    pub fn open(self, dir: &Path, ntotal: usize, dim: usize) -> Result<Box<dyn VectorIndex>> {
        Ok(match self {
            Self::Flat => Box::new(FlatIndex::open(dir, ntotal, dim)?),
            Self::Hnsw => Box::new(HnswIndex::open(dir, dim)?),
        })
    }
}

/// 基于距离的最近邻索引
///
/// 构建后不可修改。索引本身不知道图片 ID，行号到 ID 的映射由 [`Catalog`](crate::Catalog) 负责。
pub trait VectorIndex: Send + Sync {
    fn kind(&self) -> IndexKind;

    /// 向量维数
    fn dim(&self) -> usize;

    /// 索引中的向量数量
    fn ntotal(&self) -> usize;

    /// 搜索平方欧氏距离最小的 k 个向量，按距离升序排列，距离相同时按行号升序
    ///
    /// k 超过向量数量时返回全部向量。
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>>;

    /// 将索引写入目录
    fn save(&self, dir: &Path) -> anyhow::Result<()>;
}
