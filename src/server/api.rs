use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum_auth::AuthBearer;
use axum_typed_multipart::TypedMultipart;
use clap::ValueEnum;
use log::info;
use tokio::task::block_in_place;

use super::error::{Result, Unauthorized};
use super::state::AppState;
use super::types::*;
use crate::error::RetrievalError;
use crate::pipeline::{QueryOptions, RankMode};

/// 搜索一张图片
#[utoipa::path(
    post,
    path = "/search",
    request_body(content = SearchForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = SearchResponse),
        (status = 400, description = "图片无法解码或参数错误"),
    )
)]
pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    data: TypedMultipart<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    let mode = match &data.mode {
        Some(mode) => <RankMode as ValueEnum>::from_str(mode, true)
            .map_err(|_| RetrievalError::invalid_input(format!("未知的排序方式: {mode}")))?,
        None => state.search.mode,
    };
    let opts = QueryOptions {
        mode,
        top_k: Some(data.k.unwrap_or(state.search.k)),
        coarse_k: Some(data.coarse_k.unwrap_or(state.search.coarse_k)),
    };

    let start = Instant::now();

    info!("正在搜索上传图片: {:?}", opts);

    let pipeline = state.pipeline().await;
    let result = block_in_place(|| pipeline.query(&data.file, &opts))?;

    Ok(Json(SearchResponse { time: start.elapsed().as_millis() as u64, result }))
}

/// 重新加载图片目录
///
/// 新的图片目录加载完成后才会替换旧的，加载失败时继续使用旧的图片目录。
#[utoipa::path(
    post,
    path = "/reload",
    responses(
        (status = 200, body = ReloadResponse),
        (status = 401, description = "token 错误"),
    )
)]
pub async fn reload_handler(
    State(state): State<Arc<AppState>>,
    AuthBearer(token): AuthBearer,
) -> Result<Json<ReloadResponse>> {
    if token != state.token {
        return Err(Unauthorized.into());
    }

    let current = state.pipeline().await;
    let Some(pipeline) = block_in_place(|| current.reopen(&state.catalog_dir))? else {
        info!("图片目录未变化，共 {} 张图片", current.catalog().len());
        return Ok(Json(ReloadResponse { count: current.catalog().len(), reloaded: false }));
    };
    let count = pipeline.catalog().len();
    *state.pipeline.write().await = Arc::new(pipeline);

    info!("重新加载图片目录完成，共 {} 张图片", count);
    Ok(Json(ReloadResponse { count, reloaded: true }))
}

/// 健康检查
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, body = HealthResponse),
    )
)]
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let count = state.pipeline().await.catalog().len();
    Json(HealthResponse { status: "ok", count })
}
