use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, ensure};
use image::DynamicImage;
use log::info;
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;

use super::{Embedder, EmbedderSpec, Preprocessor};
use crate::error::{Result, RetrievalError};

/// 基于 ONNX 模型的特征提取器
///
/// 模型输入为预处理后的 `(1, 3, size, size)` 张量，输出展平后即为特征向量。
/// 例如去掉分类层的 ResNet-50，输出 `(1, 2048, 1, 1)`。
pub struct OnnxEmbedder {
    // NOTE: Session::run 需要 &mut self，所以这里需要加锁
    session: Mutex<Session>,
    model: PathBuf,
    input: String,
    dim: usize,
    pre: Preprocessor,
}

impl OnnxEmbedder {
    pub fn open(model: impl AsRef<Path>, input: &str, dim: usize, size: u32) -> anyhow::Result<Self> {
        let model = model.as_ref();
        ensure!(size > 0, "图片边长必须大于 0");
        ensure!(model.exists(), "模型文件不存在: {}", model.display());

        info!("加载 ONNX 模型: {}", model.display());
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(model)
            .with_context(|| format!("无法加载模型 {}", model.display()))?;

        Ok(Self {
            session: Mutex::new(session),
            model: model.to_path_buf(),
            input: input.to_owned(),
            dim,
            pre: Preprocessor::new(size),
        })
    }
}

impl Embedder for OnnxEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn descriptor(&self) -> EmbedderSpec {
        EmbedderSpec::Onnx {
            model: self.model.clone(),
            input: self.input.clone(),
            dim: self.dim,
            size: self.pre.size(),
        }
    }

    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let tensor = self.pre.tensor(image)?;
        let value = ort::value::Tensor::from_array(tensor)
            .map_err(|e| RetrievalError::embedding(format!("无法创建输入张量: {e}")))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| RetrievalError::embedding(format!("模型会话锁已损坏: {e}")))?;
        let outputs = session
            .run(ort::inputs![self.input.as_str() => value])
            .map_err(|e| RetrievalError::embedding(format!("模型推理失败: {e}")))?;

        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RetrievalError::embedding(format!("无法读取模型输出: {e}")))?;

        if data.len() != self.dim {
            return Err(RetrievalError::embedding(format!(
                "模型输出维数为 {}，期望 {}",
                data.len(),
                self.dim
            )));
        }
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_zero_size() {
        let dir = tempfile::TempDir::new().unwrap();
        let model = dir.path().join("model.onnx");
        std::fs::write(&model, b"").unwrap();
        let err = OnnxEmbedder::open(&model, "input", 2048, 0).err().unwrap();
        assert!(err.to_string().contains("边长"));
    }
}
