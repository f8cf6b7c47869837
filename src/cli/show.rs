use anyhow::Result;
use clap::Parser;

use crate::catalog::Manifest;
use crate::cli::SubCommandExtend;
use crate::config::Opts;

#[derive(Parser, Debug, Clone)]
pub struct ShowCommand {
    /// 以 JSON 格式输出
    #[arg(long)]
    pub json: bool,
}

impl SubCommandExtend for ShowCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let dir = opts.catalog_dir();
        let manifest = Manifest::load(&dir)?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&manifest)?);
            return Ok(());
        }

        println!("路径        : {}", dir.display());
        println!("图片数量    : {}", manifest.count);
        println!("特征维数    : {}", manifest.dim);
        println!("索引类型    : {:?}", manifest.index);
        println!("特征提取器  : {:?}", manifest.embedder);
        println!("构建时间    : {}", manifest.created_at);
        Ok(())
    }
}
