use thiserror::Error;

pub type Result<T> = std::result::Result<T, RetrievalError>;

/// 检索核心的错误类型
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// 查询图片无法解码，或无法提取特征
    #[error("无效的输入: {0}")]
    InvalidInput(String),

    /// 模型无法处理一张格式正确的图片
    #[error("特征提取失败: {0}")]
    EmbeddingFailure(String),

    /// 查询向量与索引的维数不一致
    #[error("向量维数不一致: 期望 {expected}，实际 {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// 余弦相似度计算中出现零向量
    #[error("无法对零向量计算余弦相似度")]
    DegenerateVector,

    /// 持久化的索引或特征文件缺失、损坏或互相不匹配
    #[error("索引损坏: {0}")]
    IndexCorruption(String),
}

impl RetrievalError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::EmbeddingFailure(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::IndexCorruption(msg.into())
    }

    /// 检查维数，不一致时返回 `DimensionMismatch`
    pub fn check_dim(expected: usize, actual: usize) -> Result<()> {
        if expected != actual {
            return Err(Self::DimensionMismatch { expected, actual });
        }
        Ok(())
    }

    /// 是否由调用方的输入导致
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_) | Self::DimensionMismatch { .. } | Self::DegenerateVector
        )
    }
}
