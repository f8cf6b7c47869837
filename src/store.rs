use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::OnceLock;

use log::{info, warn};
use ndarray::{Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;

use crate::embed::{Embedder, embed_bytes};
use crate::error::{Result, RetrievalError};

pub const FEATURES_FILE: &str = "features.bin";
pub const PATHS_FILE: &str = "paths.bin";

/// 一张参考图片及其特征
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    /// 图片 ID，通常为图片路径
    pub id: String,
    /// 特征向量
    pub vector: Vec<f32>,
}

/// 特征库
///
/// 保存所有参考图片的 ID 和特征，第 i 个 ID 对应矩阵的第 i 行。
/// 归一化后的特征矩阵只在需要计算余弦相似度时生成，不会写入磁盘。
pub struct FeatureStore {
    ids: Vec<String>,
    vectors: Array2<f32>,
    normalized: OnceLock<Array2<f32>>,
}

impl FeatureStore {
    /// 使用 ID 列表和特征矩阵创建特征库，两者长度必须一致
    pub fn new(ids: Vec<String>, vectors: Array2<f32>) -> Result<Self> {
        if ids.len() != vectors.nrows() {
            return Err(RetrievalError::corruption(format!(
                "ID 数量 {} 与特征数量 {} 不一致",
                ids.len(),
                vectors.nrows()
            )));
        }
        let vectors = if vectors.is_standard_layout() {
            vectors
        } else {
            vectors.as_standard_layout().into_owned()
        };
        Ok(Self { ids, vectors, normalized: OnceLock::new() })
    }

    /// 提取所有图片的特征并创建特征库
    ///
    /// 无法解码或提取特征的图片会被跳过，不会中断整个过程。
    pub fn build<S, B>(images: &[(S, B)], embedder: &dyn Embedder) -> Self
    where
        S: AsRef<str> + Sync,
        B: AsRef<[u8]> + Sync,
    {
        let results = images
            .par_iter()
            .map(|(id, bytes)| (id.as_ref(), embed_bytes(embedder, bytes.as_ref())))
            .collect::<Vec<_>>();

        let mut builder = FeatureStoreBuilder::new(embedder.dim());
        for (id, result) in results {
            let pushed = result.and_then(|vector| builder.push(id.to_owned(), vector));
            if let Err(e) = pushed {
                warn!("跳过图片 {}: {}", id, e);
            }
        }

        let store = builder.finish();
        info!("特征提取完成: {}/{}", store.len(), images.len());
        store
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// 特征维数
    pub fn dim(&self) -> usize {
        self.vectors.ncols()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// 第 row 行对应的图片 ID
    pub fn identifier(&self, row: usize) -> Option<&str> {
        self.ids.get(row).map(String::as_str)
    }

    /// 原始特征矩阵
    pub fn vectors(&self) -> ArrayView2<'_, f32> {
        self.vectors.view()
    }

    pub fn vector(&self, row: usize) -> ArrayView1<'_, f32> {
        self.vectors.row(row)
    }

    /// 逐行归一化到单位长度的特征矩阵，首次调用时计算
    ///
    /// 零向量会保持为零向量，它与任何查询的相似度都是 0。
    pub fn normalized(&self) -> &Array2<f32> {
        self.normalized.get_or_init(|| {
            let mut normalized = self.vectors.clone();
            let mut degenerate = 0;
            for mut row in normalized.rows_mut() {
                let norm = row.dot(&row).sqrt();
                if norm > 0.0 && norm.is_finite() {
                    row.mapv_inplace(|x| x / norm);
                } else {
                    row.fill(0.0);
                    degenerate += 1;
                }
            }
            if degenerate > 0 {
                warn!("特征库中有 {} 个零向量", degenerate);
            }
            normalized
        })
    }

    /// 将 ID 列表和特征矩阵写入目录
    pub fn persist(&self, dir: &Path) -> anyhow::Result<()> {
        let flat = self.vectors.iter().copied().collect::<Vec<f32>>();
        let file = BufWriter::new(File::create(dir.join(FEATURES_FILE))?);
        bincode::serialize_into(file, &(self.dim() as u64, flat))?;

        let file = BufWriter::new(File::create(dir.join(PATHS_FILE))?);
        bincode::serialize_into(file, &self.ids)?;
        Ok(())
    }

    /// 从目录中加载特征库，两个文件必须同时存在且长度匹配
    pub fn load(dir: &Path) -> Result<Self> {
        let (dim, flat): (u64, Vec<f32>) = read_bincode(&dir.join(FEATURES_FILE))?;
        let ids: Vec<String> = read_bincode(&dir.join(PATHS_FILE))?;

        let dim = dim as usize;
        if ids.len().checked_mul(dim) != Some(flat.len()) {
            return Err(RetrievalError::corruption(format!(
                "{} 个 ID 与 {} 个特征值（{} 维）不匹配",
                ids.len(),
                flat.len(),
                dim
            )));
        }
        let vectors = Array2::from_shape_vec((ids.len(), dim), flat)
            .map_err(|e| RetrievalError::corruption(e.to_string()))?;
        Self::new(ids, vectors)
    }

    /// 将特征矩阵导出为 npy 文件
    pub fn export_npy(&self, path: &Path) -> anyhow::Result<()> {
        ndarray_npy::write_npy(path, &self.vectors)?;
        Ok(())
    }
}

fn read_bincode<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)
        .map_err(|e| RetrievalError::corruption(format!("无法打开 {}: {e}", path.display())))?;
    bincode::deserialize_from(BufReader::new(file))
        .map_err(|e| RetrievalError::corruption(format!("无法解析 {}: {e}", path.display())))
}

/// 逐条添加记录的特征库构建器
pub struct FeatureStoreBuilder {
    dim: usize,
    records: Vec<ImageRecord>,
}

impl FeatureStoreBuilder {
    pub fn new(dim: usize) -> Self {
        Self { dim, records: vec![] }
    }

    pub fn push(&mut self, id: String, vector: Vec<f32>) -> Result<()> {
        RetrievalError::check_dim(self.dim, vector.len())?;
        self.records.push(ImageRecord { id, vector });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 按 ID 排序，使并发入库的结果与完成顺序无关
    pub fn sort_by_id(&mut self) {
        self.records.sort_by(|a, b| a.id.cmp(&b.id));
    }

    /// 按添加顺序生成特征库
    pub fn finish(self) -> FeatureStore {
        let n = self.records.len();
        let mut ids = Vec::with_capacity(n);
        let mut flat = Vec::with_capacity(n * self.dim);
        for record in self.records {
            ids.push(record.id);
            flat.extend(record.vector);
        }
        let vectors = Array2::from_shape_vec((n, self.dim), flat)
            .expect("vector length is checked on push");
        FeatureStore { ids, vectors, normalized: OnceLock::new() }
    }
}
