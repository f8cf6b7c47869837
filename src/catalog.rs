use std::ffi::OsString;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use log::info;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::embed::EmbedderSpec;
use crate::error::{Result, RetrievalError};
use crate::index::{IndexKind, Neighbor, VectorIndex};
use crate::store::{FEATURES_FILE, FeatureStore, PATHS_FILE};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

/// 索引清单，记录构建索引时的参数以及各个文件的校验和
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Manifest {
    pub version: u32,
    pub embedder: EmbedderSpec,
    pub index: IndexKind,
    pub count: usize,
    pub dim: usize,
    pub features_blake3: String,
    pub paths_blake3: String,
    /// 索引的全部文件按顺序计算的校验和
    pub index_blake3: String,
    /// 构建时间，UNIX 时间戳
    pub created_at: u64,
}

impl Manifest {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let file = File::open(&path)
            .map_err(|e| RetrievalError::corruption(format!("无法打开 {}: {e}", path.display())))?;
        let manifest: Self = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| RetrievalError::corruption(format!("无法解析 {}: {e}", path.display())))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(RetrievalError::corruption(format!("不支持的清单版本 {}", manifest.version)));
        }
        Ok(manifest)
    }
}

/// 图片目录
///
/// 同时持有特征库和索引，保证索引的第 i 行始终对应特征库的第 i 条记录。
/// 外部只能通过行号查询图片 ID，不能单独替换其中任何一部分。
pub struct Catalog {
    store: FeatureStore,
    index: Box<dyn VectorIndex>,
    embedder: EmbedderSpec,
    /// 从目录加载时读取的清单，内存中构建的目录没有清单
    manifest: Option<Manifest>,
}

impl Catalog {
    /// 使用特征库构建索引
    pub fn build(store: FeatureStore, kind: IndexKind, embedder: EmbedderSpec) -> Result<Self> {
        RetrievalError::check_dim(embedder.dim(), store.dim())?;
        info!("正在构建 {:?} 索引，共 {} 个向量", kind, store.len());
        let index = kind.build(store.vectors());
        Ok(Self { store, index, embedder, manifest: None })
    }

    /// 从目录中加载，任何文件缺失、校验失败或互相不匹配都视为索引损坏
    pub fn open(dir: &Path) -> Result<Self> {
        let manifest = Manifest::load(dir)?;
        verify_checksum(dir, &[FEATURES_FILE], &manifest.features_blake3)?;
        verify_checksum(dir, &[PATHS_FILE], &manifest.paths_blake3)?;
        verify_checksum(dir, manifest.index.files(), &manifest.index_blake3)?;

        let store = FeatureStore::load(dir)?;
        if store.len() != manifest.count || store.dim() != manifest.dim {
            return Err(RetrievalError::corruption(format!(
                "特征库为 {}x{}，清单记录为 {}x{}",
                store.len(),
                store.dim(),
                manifest.count,
                manifest.dim
            )));
        }
        if manifest.embedder.dim() != manifest.dim {
            return Err(RetrievalError::corruption(format!(
                "特征提取器维数 {} 与特征库维数 {} 不一致",
                manifest.embedder.dim(),
                manifest.dim
            )));
        }

        let index = manifest.index.open(dir, manifest.count, manifest.dim)?;
        if index.ntotal() != manifest.count || index.dim() != manifest.dim {
            return Err(RetrievalError::corruption(format!(
                "索引为 {}x{}，清单记录为 {}x{}",
                index.ntotal(),
                index.dim(),
                manifest.count,
                manifest.dim
            )));
        }

        info!("已加载 {}: {} 张图片，{} 维，{:?} 索引", dir.display(), store.len(), store.dim(), manifest.index);
        let embedder = manifest.embedder.clone();
        Ok(Self { store, index, embedder, manifest: Some(manifest) })
    }

    /// 写入目录
    ///
    /// 先写入 `<dir>.tmp`，全部完成后再替换 `dir`，读取方不会看到写了一半的目录。
    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        let tmp = with_suffix(dir, ".tmp");
        let old = with_suffix(dir, ".old");
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)?;

        self.store.persist(&tmp)?;
        self.index.save(&tmp)?;

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            embedder: self.embedder.clone(),
            index: self.index.kind(),
            count: self.len(),
            dim: self.dim(),
            features_blake3: checksum(&tmp, &[FEATURES_FILE])?,
            paths_blake3: checksum(&tmp, &[PATHS_FILE])?,
            index_blake3: checksum(&tmp, self.index.kind().files())?,
            created_at: SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs(),
        };
        fs::write(tmp.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?)?;

        if dir.exists() {
            if old.exists() {
                fs::remove_dir_all(&old)?;
            }
            fs::rename(dir, &old)?;
            fs::rename(&tmp, dir)?;
            fs::remove_dir_all(&old)?;
        } else {
            if let Some(parent) = dir.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&tmp, dir)?;
        }

        info!("已保存到 {}", dir.display());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.store.dim()
    }

    pub fn embedder(&self) -> &EmbedderSpec {
        &self.embedder
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    pub fn index_kind(&self) -> IndexKind {
        self.index.kind()
    }

    /// 第 row 行对应的图片 ID
    pub fn identifier(&self, row: usize) -> Result<&str> {
        self.store
            .identifier(row)
            .ok_or_else(|| RetrievalError::corruption(format!("行号 {row} 超出范围 {}", self.len())))
    }

    /// 在索引中搜索平方欧氏距离最近的 k 个向量
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.index.search(query, k)
    }

    /// 逐行归一化的特征矩阵
    pub fn normalized(&self) -> &Array2<f32> {
        self.store.normalized()
    }

    pub fn store(&self) -> &FeatureStore {
        &self.store
    }
}

fn with_suffix(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(dir.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// 依次读取目录中的若干文件，计算整体的校验和
fn checksum(dir: &Path, files: &[&str]) -> anyhow::Result<String> {
    let mut hasher = blake3::Hasher::new();
    for file in files {
        let path = dir.join(file);
        let mut file = File::open(&path).with_context(|| format!("无法读取 {}", path.display()))?;
        std::io::copy(&mut file, &mut hasher)?;
    }
    Ok(hasher.finalize().to_hex().to_string())
}

fn verify_checksum(dir: &Path, files: &[&str], expected: &str) -> Result<()> {
    let actual = checksum(dir, files).map_err(|e| RetrievalError::corruption(format!("{e:#}")))?;
    if actual != expected {
        return Err(RetrievalError::corruption(format!("{} 校验失败: {}", dir.display(), files.join(", "))));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ndarray::{Axis, array};
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    fn sample() -> Catalog {
        sample_with(IndexKind::Flat, array![[0., 0., 0.], [1., 0., 0.], [0., 2., 0.], [0., 0., 3.]])
    }

    fn sample_with(kind: IndexKind, vectors: Array2<f32>) -> Catalog {
        let ids = ["a.jpg", "b.jpg", "c.jpg", "d.jpg"].map(String::from).to_vec();
        // Grid { grid: 1 } 对应 3 维特征
        let store = FeatureStore::new(ids, vectors).unwrap();
        Catalog::build(store, kind, EmbedderSpec::Grid { grid: 1, size: 8 }).unwrap()
    }

    #[test]
    fn test_build_dim_mismatch() {
        let store = FeatureStore::new(vec!["a".to_owned()], array![[1., 2.]]).unwrap();
        let err = Catalog::build(store, IndexKind::Flat, EmbedderSpec::Grid { grid: 1, size: 8 })
            .err()
            .unwrap();
        assert!(matches!(err, RetrievalError::DimensionMismatch { expected: 3, actual: 2 }));
    }

    #[test]
    fn test_save_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog");
        let catalog = sample();
        catalog.save(&path).unwrap();
        assert!(!with_suffix(&path, ".tmp").exists());

        let loaded = Catalog::open(&path).unwrap();
        assert!(catalog.manifest().is_none());
        assert_eq!(loaded.manifest(), Some(&Manifest::load(&path).unwrap()));
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded.embedder(), catalog.embedder());
        assert_eq!(loaded.identifier(2).unwrap(), "c.jpg");
        let query = [0.1, 1.9, 0.];
        assert_eq!(loaded.search(&query, 4).unwrap(), catalog.search(&query, 4).unwrap());
    }

    #[test]
    fn test_save_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog");
        sample().save(&path).unwrap();

        let store = FeatureStore::new(vec!["z.jpg".to_owned()], array![[1., 1., 1.]]).unwrap();
        let catalog = Catalog::build(store, IndexKind::Flat, EmbedderSpec::Grid { grid: 1, size: 8 }).unwrap();
        catalog.save(&path).unwrap();
        assert!(!with_suffix(&path, ".old").exists());

        let loaded = Catalog::open(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.identifier(0).unwrap(), "z.jpg");
    }

    #[test]
    fn test_open_tampered_features() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog");
        sample().save(&path).unwrap();
        let features = path.join(FEATURES_FILE);
        let mut bytes = fs::read(&features).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&features, bytes).unwrap();

        let err = Catalog::open(&path).err().unwrap();
        assert!(matches!(err, RetrievalError::IndexCorruption(_)));
    }

    #[rstest]
    #[case::flat(IndexKind::Flat)]
    #[case::hnsw(IndexKind::Hnsw)]
    fn test_open_foreign_index(#[case] kind: IndexKind) {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let vectors = array![[1., 0., 0.], [0., 1., 0.], [0., 0., 1.], [1., 1., 1.]];
        let mut reversed = vectors.clone();
        reversed.invert_axis(Axis(0));
        sample_with(kind, vectors).save(&a).unwrap();
        sample_with(kind, reversed).save(&b).unwrap();

        // 形状相同但行顺序不同的索引文件
        for file in kind.files() {
            fs::copy(b.join(file), a.join(file)).unwrap();
        }
        let err = Catalog::open(&a).err().unwrap();
        assert!(matches!(err, RetrievalError::IndexCorruption(_)));
    }

    #[test]
    fn test_open_missing_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog");
        sample().save(&path).unwrap();
        fs::remove_file(path.join(crate::index::FLAT_INDEX_FILE)).unwrap();

        let err = Catalog::open(&path).err().unwrap();
        assert!(matches!(err, RetrievalError::IndexCorruption(_)));
    }

    #[test]
    fn test_open_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let err = Catalog::open(dir.path()).err().unwrap();
        assert!(matches!(err, RetrievalError::IndexCorruption(_)));
    }

    #[test]
    fn test_identifier_out_of_range() {
        let catalog = sample();
        assert!(matches!(catalog.identifier(4), Err(RetrievalError::IndexCorruption(_))));
    }
}
