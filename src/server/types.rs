use axum::body::Bytes;
use axum_typed_multipart::TryFromMultipart;
use serde::Serialize;
use utoipa::ToSchema;

use crate::pipeline::{QueryResult, RankMode};

/// 搜索请求参数
#[derive(TryFromMultipart)]
pub struct SearchRequest {
    pub file: Bytes,
    pub mode: Option<String>,
    pub k: Option<usize>,
    pub coarse_k: Option<usize>,
}

/// 搜索表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct SearchForm {
    /// 上传的图片文件
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub file: String,
    /// 排序方式，默认使用服务启动时的设置
    pub mode: Option<RankMode>,
    /// 返回的结果数量
    pub k: Option<usize>,
    /// 两阶段搜索时从索引中取出的候选数量
    pub coarse_k: Option<usize>,
}

/// 搜索响应
#[derive(Debug, Serialize, ToSchema)]
pub struct SearchResponse {
    /// 搜索耗时，单位为毫秒
    pub time: u64,
    pub result: QueryResult,
}

/// 重新加载响应
#[derive(Debug, Serialize, ToSchema)]
pub struct ReloadResponse {
    /// 重新加载后的图片数量
    pub count: usize,
    /// 目录未变化时为 false
    pub reloaded: bool,
}

/// 健康检查响应
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    /// 当前的图片数量
    pub count: usize,
}
