use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::ArrayView2;
use rayon::prelude::*;

use super::{IndexKind, Neighbor, TopKNeighbors, VectorIndex};
use crate::error::{Result, RetrievalError};
use crate::utils::squared_l2;

const MAGIC: &[u8; 4] = b"ASFL";
const VERSION: u32 = 1;
pub const FLAT_INDEX_FILE: &str = "index.flat";

/// 暴力搜索索引，返回精确的平方欧氏距离
///
/// 文件格式（小端序）：
///
/// ```text
/// "ASFL" | version: u32 | dim: u64 | ntotal: u64 | ntotal * dim 个 f32
/// ```
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dim: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    /// 使用向量矩阵构建索引，每行一个向量
    pub fn build(vectors: ArrayView2<f32>) -> Self {
        let dim = vectors.ncols();
        let data = vectors.iter().copied().collect();
        Self { dim, data }
    }

    /// 从目录中读取索引，文件头中的向量数量和维数必须与 `ntotal`、`dim` 一致
    pub fn open(dir: &Path, ntotal: usize, dim: usize) -> Result<Self> {
        let path = dir.join(FLAT_INDEX_FILE);
        let file = File::open(&path)
            .map_err(|e| RetrievalError::corruption(format!("无法打开 {}: {e}", path.display())))?;
        Self::read(BufReader::new(file), ntotal, dim)
            .map_err(|e| RetrievalError::corruption(format!("无法读取 {}: {e}", path.display())))
    }

    fn read(mut r: impl Read, expected_ntotal: usize, expected_dim: usize) -> std::io::Result<Self> {
        let invalid = |msg: &str| std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_owned());

        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(invalid("文件头错误"));
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(invalid("不支持的索引版本"));
        }
        let dim = r.read_u64::<LittleEndian>()?;
        let ntotal = r.read_u64::<LittleEndian>()?;
        // 先检查文件头再分配内存
        if dim != expected_dim as u64 || ntotal != expected_ntotal as u64 {
            return Err(invalid(&format!(
                "索引为 {ntotal}x{dim}，期望 {expected_ntotal}x{expected_dim}"
            )));
        }
        let dim = expected_dim;
        let len = dim.checked_mul(expected_ntotal).ok_or_else(|| invalid("索引大小溢出"))?;

        let mut data = vec![0f32; len];
        r.read_f32_into::<LittleEndian>(&mut data)?;

        // 文件尾部不应该有多余的数据
        if r.read(&mut [0u8; 1])? != 0 {
            return Err(invalid("索引文件长度不正确"));
        }
        Ok(Self { dim, data })
    }

    fn write(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_all(MAGIC)?;
        w.write_u32::<LittleEndian>(VERSION)?;
        w.write_u64::<LittleEndian>(self.dim as u64)?;
        w.write_u64::<LittleEndian>(self.ntotal() as u64)?;
        if cfg!(target_endian = "little") {
            w.write_all(bytemuck::cast_slice(&self.data))?;
        } else {
            for &v in &self.data {
                w.write_f32::<LittleEndian>(v)?;
            }
        }
        w.flush()
    }
}

impl VectorIndex for FlatIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Flat
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn ntotal(&self) -> usize {
        if self.dim == 0 { 0 } else { self.data.len() / self.dim }
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        RetrievalError::check_dim(self.dim, query.len())?;
        let k = k.min(self.ntotal());
        if k == 0 {
            return Ok(vec![]);
        }

        let topk = self
            .data
            .par_chunks_exact(self.dim)
            .enumerate()
            .fold(
                || TopKNeighbors::new(k),
                |mut acc, (row, v)| {
                    acc.push(Neighbor { row, distance: squared_l2(query, v) });
                    acc
                },
            )
            .reduce(
                || TopKNeighbors::new(k),
                |mut a, b| {
                    a.extend(b.into_sorted_vec());
                    a
                },
            );

        Ok(topk.into_sorted_vec())
    }

    fn save(&self, dir: &Path) -> anyhow::Result<()> {
        let file = File::create(dir.join(FLAT_INDEX_FILE))?;
        self.write(BufWriter::new(file))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_flat_search_order() {
        let vectors = array![[0., 0.], [3., 4.], [1., 0.], [0., 2.]];
        let index = FlatIndex::build(vectors.view());
        let result = index.search(&[0., 0.], 3).unwrap();
        let rows: Vec<_> = result.iter().map(|n| n.row).collect();
        assert_eq!(rows, vec![0, 2, 3]);
        assert_eq!(result[2].distance, 4.);
    }

    #[test]
    fn test_flat_search_ties() {
        let vectors = array![[1., 0.], [0., 1.], [-1., 0.], [0., -1.]];
        let index = FlatIndex::build(vectors.view());
        let result = index.search(&[0., 0.], 4).unwrap();
        let rows: Vec<_> = result.iter().map(|n| n.row).collect();
        assert_eq!(rows, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_flat_search_dim_mismatch() {
        let index = FlatIndex::build(array![[0., 0.]].view());
        let err = index.search(&[0., 0., 0.], 1).unwrap_err();
        assert!(matches!(err, RetrievalError::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[test]
    fn test_flat_read_truncated() {
        let index = FlatIndex::build(array![[1., 2.], [3., 4.]].view());
        let mut buf = vec![];
        index.write(&mut buf).unwrap();
        buf.truncate(buf.len() - 2);
        assert!(FlatIndex::read(&buf[..], 2, 2).is_err());
    }

    #[test]
    fn test_flat_read_trailing() {
        let index = FlatIndex::build(array![[1., 2.]].view());
        let mut buf = vec![];
        index.write(&mut buf).unwrap();
        buf.push(0);
        assert!(FlatIndex::read(&buf[..], 1, 2).is_err());
    }

    #[test]
    fn test_flat_read_oversized_header() {
        let index = FlatIndex::build(array![[1., 2.]].view());
        let mut buf = vec![];
        index.write(&mut buf).unwrap();
        // dim = 2^62, ntotal = 1
        buf[8..16].copy_from_slice(&(1u64 << 62).to_le_bytes());
        let err = FlatIndex::read(&buf[..], 1, 2).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        // 文件头合法但与期望的形状不一致
        let mut buf = vec![];
        index.write(&mut buf).unwrap();
        assert!(FlatIndex::read(&buf[..], 2, 2).is_err());
        assert!(FlatIndex::read(&buf[..], 1, 2).is_ok());
    }

    #[test]
    fn test_flat_open_oversized_header() {
        let dir = tempfile::TempDir::new().unwrap();
        FlatIndex::build(array![[1., 2.], [3., 4.]].view()).save(dir.path()).unwrap();
        let path = dir.path().join(FLAT_INDEX_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[16..24].copy_from_slice(&u64::MAX.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        let err = FlatIndex::open(dir.path(), 2, 2).unwrap_err();
        assert!(matches!(err, RetrievalError::IndexCorruption(_)));
    }
}
