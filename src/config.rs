use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;

use crate::cli::*;
use crate::embed::{EmbedderSpec, IMAGE_SIZE};
use crate::pipeline::{DEFAULT_COARSE_K, DEFAULT_TOP_K, QueryOptions, RankMode};

static CONF_DIR: LazyLock<ConfDir> = LazyLock::new(|| {
    let proj_dirs = ProjectDirs::from("", "artsearch", "artsearch").expect("failed to get project dir");
    ConfDir { path: proj_dirs.config_dir().to_path_buf() }
});

fn default_config_dir() -> &'static str {
    CONF_DIR.path().to_str().unwrap()
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderKind {
    /// 网格池化，不需要模型文件
    Grid,
    /// ONNX 模型，需要启用 onnx 特性
    Onnx,
}

#[derive(Parser, Debug, Clone)]
pub struct EmbedOptions {
    /// 特征提取器
    #[arg(long, value_enum, default_value_t = EmbedderKind::Grid)]
    pub embedder: EmbedderKind,
    /// 网格池化的网格边长，特征维数为 3 * N * N
    #[arg(long, value_name = "N", default_value_t = 16)]
    pub grid: usize,
    /// 预处理时图片缩放到的边长
    #[arg(long, value_name = "SIZE", default_value_t = IMAGE_SIZE, value_parser = clap::value_parser!(u32).range(1..))]
    pub size: u32,
    /// ONNX 模型路径
    #[arg(long, value_name = "FILE", required_if_eq("embedder", "onnx"))]
    pub model: Option<PathBuf>,
    /// ONNX 模型的输入名称
    #[arg(long, value_name = "NAME", default_value = "input")]
    pub input: String,
    /// ONNX 模型输出的特征维数
    #[arg(long, value_name = "DIM", default_value_t = 2048)]
    pub dim: usize,
}

impl EmbedOptions {
    /// 生成特征提取器描述，模型路径会被转换为绝对路径
    pub fn spec(&self) -> anyhow::Result<EmbedderSpec> {
        Ok(match self.embedder {
            EmbedderKind::Grid => EmbedderSpec::Grid { grid: self.grid, size: self.size },
            EmbedderKind::Onnx => {
                let model = self.model.as_ref().ok_or_else(|| anyhow::anyhow!("缺少 --model 参数"))?;
                EmbedderSpec::Onnx {
                    model: model.canonicalize()?,
                    input: self.input.clone(),
                    dim: self.dim,
                    size: self.size,
                }
            }
        })
    }
}

#[derive(Parser, Debug, Clone)]
pub struct SearchOptions {
    /// 排序方式
    #[arg(long, value_enum, default_value_t = RankMode::TwoStage)]
    pub mode: RankMode,
    /// 返回的结果数量
    #[arg(short, value_name = "K", default_value_t = DEFAULT_TOP_K)]
    pub k: usize,
    /// 两阶段搜索时从索引中取出的候选数量
    #[arg(long, value_name = "K", default_value_t = DEFAULT_COARSE_K)]
    pub coarse_k: usize,
}

impl SearchOptions {
    pub fn query_options(&self) -> QueryOptions {
        QueryOptions { mode: self.mode, top_k: Some(self.k), coarse_k: Some(self.coarse_k) }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "artsearch", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// artsearch 配置文件目录
    #[arg(short, long, default_value = default_config_dir())]
    pub conf_dir: ConfDir,
    /// 图片目录名称，同一配置目录下可以保存多个图片目录
    #[arg(short = 'n', long, default_value = "default")]
    pub catalog: String,
}

impl Opts {
    /// 当前使用的图片目录路径
    pub fn catalog_dir(&self) -> PathBuf {
        self.conf_dir.catalog(&self.catalog)
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 提取图片特征并构建图片目录
    Build(BuildCommand),
    /// 从图片目录中搜索图片
    Search(SearchCommand),
    /// 启动 HTTP 搜索服务
    Server(ServerCommand),
    /// 导出特征矩阵
    Export(ExportCommand),
    /// 显示图片目录信息
    Show(ShowCommand),
}

#[derive(Debug, Clone)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回图片目录的路径
    pub fn catalog(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}
