use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::cli::server::ServerCommand;
use crate::config::SearchOptions;
use crate::pipeline::QueryPipeline;

/// 应用状态
pub struct AppState {
    /// 当前使用的查询流程，重新加载时整体替换
    pub pipeline: RwLock<Arc<QueryPipeline>>,
    /// 图片目录路径
    pub catalog_dir: PathBuf,
    /// 默认搜索参数
    pub search: SearchOptions,
    /// 鉴权 token
    pub token: String,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(pipeline: QueryPipeline, catalog_dir: PathBuf, opts: ServerCommand) -> Arc<Self> {
        Arc::new(AppState {
            pipeline: RwLock::new(Arc::new(pipeline)),
            catalog_dir,
            search: opts.search,
            token: opts.token,
        })
    }

    /// 获取当前的查询流程，不会阻塞重新加载
    pub async fn pipeline(&self) -> Arc<QueryPipeline> {
        self.pipeline.read().await.clone()
    }
}
