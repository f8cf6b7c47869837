use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::debug;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::{Opts, SearchOptions};
use crate::pipeline::{QueryPipeline, QueryResult};

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub search: SearchOptions,
    /// 被搜索的图片路径
    pub image: PathBuf,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let pipeline = block_in_place(|| QueryPipeline::open(&opts.catalog_dir()))?;
        let bytes = tokio::fs::read(&self.image).await?;

        let query = self.search.query_options();
        debug!("查询参数: {:?}", query);
        let result = block_in_place(|| pipeline.query(&bytes, &query))?;

        print_result(&result, self.output_format)
    }
}

fn print_result(result: &QueryResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?)
        }
        OutputFormat::Table => {
            for m in &result.matches {
                println!("{:.4}\t{}", m.score, m.id);
            }
        }
    }
    Ok(())
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OutputFormat {
    Json,
    Table,
}
