use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::task::block_in_place;

use crate::Opts;
use crate::catalog::Catalog;
use crate::cli::SubCommandExtend;

#[derive(Parser, Debug, Clone)]
pub struct ExportCommand {
    /// 特征矩阵的输出路径，格式为 npy
    #[arg(default_value = "features.npy")]
    pub output: PathBuf,
    /// 同时导出图片 ID，每行一个，顺序与特征矩阵的行一致
    #[arg(long, value_name = "FILE")]
    pub ids: Option<PathBuf>,
}

impl SubCommandExtend for ExportCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let catalog = block_in_place(|| Catalog::open(&opts.catalog_dir()))?;
        let store = catalog.store();
        block_in_place(|| store.export_npy(&self.output))?;
        if let Some(ids) = &self.ids {
            let mut content = store.ids().join("\n");
            content.push('\n');
            tokio::fs::write(ids, content).await?;
        }
        info!("导出成功: {} 张图片，{} 维", store.len(), store.dim());
        Ok(())
    }
}
