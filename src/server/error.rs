use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::error::RetrievalError;

/// 鉴权失败
#[derive(Debug, Error)]
#[error("无效的 token")]
pub struct Unauthorized;

/// API错误类型
pub struct AppError(pub anyhow::Error);

impl AppError {
    /// 调用方的输入错误返回 400，鉴权失败返回 401，其余都是服务端错误
    pub fn status(&self) -> StatusCode {
        if self.0.is::<Unauthorized>() {
            return StatusCode::UNAUTHORIZED;
        }
        match self.0.downcast_ref::<RetrievalError>() {
            Some(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("请求处理失败: {:#}", self.0);
        }
        (status, format!("Something went wrong: {}", self.0)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;
