use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use clap::ValueEnum;
use log::debug;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::catalog::{Catalog, Manifest};
use crate::embed::{Embedder, checked_embed, decode_image};
use crate::error::{Result, RetrievalError};
use crate::metrics;
use crate::ranker::{rank, rank_rows};

/// 默认返回的结果数量
pub const DEFAULT_TOP_K: usize = 3;
/// 两阶段搜索时默认的候选数量
pub const DEFAULT_COARSE_K: usize = 10;

/// 排序方式
#[derive(ValueEnum, Serialize, Deserialize, ToSchema, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RankMode {
    /// 对全部图片计算余弦相似度
    Cosine,
    /// 只使用索引的欧氏距离
    Index,
    /// 先用索引取出候选，再按余弦相似度重新排序
    #[default]
    TwoStage,
}

impl RankMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::Index => "index",
            Self::TwoStage => "two-stage",
        }
    }
}

/// 分数的含义
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKind {
    /// 平方欧氏距离，越小越相似
    Distance,
    /// 余弦相似度，越大越相似
    Cosine,
}

impl ScoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Distance => "distance",
            Self::Cosine => "cosine",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    pub mode: RankMode,
    /// 返回的结果数量，默认为 [`DEFAULT_TOP_K`]
    pub top_k: Option<usize>,
    /// 两阶段搜索的候选数量，默认为 [`DEFAULT_COARSE_K`]，小于 top_k 时使用 top_k
    pub coarse_k: Option<usize>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct Match {
    /// 图片 ID
    pub id: String,
    pub score: f32,
}

/// 查询结果，按相似程度从高到低排列
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub method: RankMode,
    pub score_kind: ScoreKind,
    pub matches: Vec<Match>,
}

/// 查询流程：解码、提取特征、搜索、排序、转换为图片 ID
///
/// 自身不保存任何请求状态，可以在多个线程中同时使用。
pub struct QueryPipeline {
    catalog: Arc<Catalog>,
    embedder: Arc<dyn Embedder>,
}

impl QueryPipeline {
    /// 特征提取器必须与构建目录时使用的完全一致
    pub fn new(catalog: Arc<Catalog>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        if &embedder.descriptor() != catalog.embedder() {
            return Err(RetrievalError::corruption(format!(
                "特征提取器 {:?} 与构建索引时使用的 {:?} 不一致",
                embedder.descriptor(),
                catalog.embedder()
            )));
        }
        RetrievalError::check_dim(catalog.dim(), embedder.dim())?;
        Ok(Self { catalog, embedder })
    }

    /// 加载目录，并按照清单重建特征提取器
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        let catalog = Catalog::open(dir)?;
        let embedder = catalog.embedder().create()?;
        Ok(Self::new(Arc::new(catalog), embedder)?)
    }

    /// 目录清单发生变化时重新加载，未变化时返回 None
    pub fn reopen(&self, dir: &Path) -> anyhow::Result<Option<Self>> {
        let latest = Manifest::load(dir)?;
        if self.catalog.manifest() == Some(&latest) {
            debug!("{} 未变化，跳过加载", dir.display());
            return Ok(None);
        }
        Self::open(dir).map(Some)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    /// 搜索一张编码后的图片
    pub fn query(&self, bytes: &[u8], opts: &QueryOptions) -> Result<QueryResult> {
        let start = Instant::now();
        let result = self.embed(bytes).and_then(|v| self.rank(&v, opts));
        observe(opts.mode, start, &result);
        result
    }

    /// 使用已有的特征向量搜索
    pub fn query_vector(&self, vector: &[f32], opts: &QueryOptions) -> Result<QueryResult> {
        let start = Instant::now();
        let result = self.rank(vector, opts);
        observe(opts.mode, start, &result);
        result
    }

    fn embed(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let image = decode_image(bytes)
            .map_err(|e| RetrievalError::invalid_input(format!("无法解码图片: {e}")))?;
        checked_embed(self.embedder.as_ref(), &image).map_err(|e| RetrievalError::invalid_input(e.to_string()))
    }

    fn rank(&self, vector: &[f32], opts: &QueryOptions) -> Result<QueryResult> {
        let top_k = opts.top_k.unwrap_or(DEFAULT_TOP_K);
        let (score_kind, scored) = match opts.mode {
            RankMode::Cosine => (ScoreKind::Cosine, rank(vector, self.catalog.normalized().view(), top_k)?),
            RankMode::Index => {
                let neighbors = self.catalog.search(vector, top_k)?;
                (ScoreKind::Distance, neighbors.into_iter().map(|n| (n.row, n.distance)).collect())
            }
            RankMode::TwoStage => {
                let coarse_k = opts.coarse_k.unwrap_or(DEFAULT_COARSE_K).max(top_k);
                let rows = self.catalog.search(vector, coarse_k)?.iter().map(|n| n.row).collect::<Vec<_>>();
                debug!("索引返回 {} 个候选", rows.len());
                (ScoreKind::Cosine, rank_rows(vector, self.catalog.normalized().view(), &rows, top_k)?)
            }
        };

        let matches = scored
            .into_iter()
            .map(|(row, score)| Ok(Match { id: self.catalog.identifier(row)?.to_owned(), score }))
            .collect::<Result<Vec<_>>>()?;
        Ok(QueryResult { method: opts.mode, score_kind, matches })
    }
}

fn observe(mode: RankMode, start: Instant, result: &Result<QueryResult>) {
    let mode_label = mode.as_str();
    metrics::inc_query_count(mode_label);
    metrics::inc_query_duration(mode_label, start.elapsed().as_secs_f32());
    match result {
        Ok(result) => {
            if let Some(best) = result.matches.first() {
                metrics::inc_query_best_score(mode_label, result.score_kind.as_str(), best.score);
            }
        }
        Err(_) => metrics::inc_query_error_count(mode_label),
    }
}
