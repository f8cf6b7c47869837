mod grid;
#[cfg(feature = "onnx")]
mod onnx;
mod preprocess;

use std::path::PathBuf;
use std::sync::Arc;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

pub use self::grid::GridEmbedder;
#[cfg(feature = "onnx")]
pub use self::onnx::OnnxEmbedder;
pub use self::preprocess::*;
use crate::error::{Result, RetrievalError};

/// 图片特征提取器
///
/// 对同一张图片和同一个模型，输出必须确定，维数固定为 `dim()`。
/// 实现需要保证可以被多个线程同时调用。
pub trait Embedder: Send + Sync {
    /// 特征向量维数
    fn dim(&self) -> usize;

    /// 用于重建该特征提取器的描述，会被写入索引清单
    fn descriptor(&self) -> EmbedderSpec;

    /// 提取一张已解码图片的特征
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>>;
}

/// 特征提取器描述
///
/// 入库时写入清单，查询时据此重建特征提取器，以保证两端预处理和模型完全一致。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmbedderSpec {
    /// 网格池化特征
    Grid { grid: usize, size: u32 },
    /// ONNX 模型特征
    Onnx { model: PathBuf, input: String, dim: usize, size: u32 },
}

impl EmbedderSpec {
    pub fn dim(&self) -> usize {
        match self {
            Self::Grid { grid, .. } => 3 * grid * grid,
            Self::Onnx { dim, .. } => *dim,
        }
    }

    /// 根据描述创建特征提取器
    pub fn create(&self) -> anyhow::Result<Arc<dyn Embedder>> {
        match self {
            Self::Grid { grid, size } => Ok(Arc::new(GridEmbedder::new(*grid, *size)?)),
            #[cfg(feature = "onnx")]
            Self::Onnx { model, input, dim, size } => {
                Ok(Arc::new(OnnxEmbedder::open(model, input, *dim, *size)?))
            }
            #[cfg(not(feature = "onnx"))]
            Self::Onnx { .. } => Err(anyhow::anyhow!("使用 ONNX 模型需要启用 onnx 特性重新编译")),
        }
    }
}

/// 解码图片字节
pub fn decode_image(bytes: &[u8]) -> image::ImageResult<DynamicImage> {
    image::load_from_memory(bytes)
}

/// 调用特征提取器，并检查输出的维数和数值
pub fn checked_embed(embedder: &dyn Embedder, image: &DynamicImage) -> Result<Vec<f32>> {
    let v = embedder.embed(image)?;
    if v.len() != embedder.dim() {
        return Err(RetrievalError::embedding(format!(
            "特征维数为 {}，期望 {}",
            v.len(),
            embedder.dim()
        )));
    }
    if v.iter().any(|x| !x.is_finite()) {
        return Err(RetrievalError::embedding("特征中包含 NaN 或 Inf"));
    }
    Ok(v)
}

/// 解码并提取特征，任何一步失败都视为 `EmbeddingFailure`
pub fn embed_bytes(embedder: &dyn Embedder, bytes: &[u8]) -> Result<Vec<f32>> {
    let image = decode_image(bytes).map_err(|e| RetrievalError::embedding(format!("无法解码图片: {e}")))?;
    checked_embed(embedder, &image)
}
