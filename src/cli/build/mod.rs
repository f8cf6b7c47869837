use std::path::PathBuf;

use anyhow::bail;
use clap::Parser;
use indicatif::ProgressBar;
use log::info;
use regex::Regex;
use tasks::*;
use tokio::task::block_in_place;

mod tasks;
mod types;

use crate::catalog::Catalog;
use crate::cli::SubCommandExtend;
use crate::config::{EmbedOptions, Opts};
use crate::index::IndexKind;
use crate::utils::pb_style;

#[derive(Parser, Debug, Clone)]
pub struct BuildCommand {
    #[command(flatten)]
    pub embed: EmbedOptions,
    /// 图片所在目录，也支持扫描 tar 归档文件
    pub path: PathBuf,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,jpeg,png,webp")]
    pub suffix: String,
    /// 在保存之前使用正则表达式对图片路径进行处理
    /// 例：--replace '/path/to/image/(?<name>[0-9]+).jpg' '$name'
    #[arg(short, long, num_args = 2, value_names = ["REGEX", "REPLACE"], verbatim_doc_comment)]
    pub replace: Vec<String>,
    /// 索引类型
    #[arg(long, value_enum, default_value_t = IndexKind::Flat)]
    pub index: IndexKind,
}

impl SubCommandExtend for BuildCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let spec = self.embed.spec()?;
        let embedder = spec.create()?;
        info!("特征提取器: {:?}，{} 维", spec, embedder.dim());

        let re_suf = format!("(?i)^({})$", self.suffix.replace(',', "|"));
        let re_suf = Regex::new(&re_suf)?;
        let replace = match self.replace.as_slice() {
            [re, replace] => Some((Regex::new(re)?, replace.clone())),
            _ => None,
        };

        let pb = ProgressBar::no_length().with_style(pb_style());

        let (t1, rx) = task_scan(self.path.clone(), pb.clone(), re_suf);
        let (t2, rx) = task_embed(rx, embedder.clone(), pb.clone());
        let t3 = task_collect(rx, pb.clone(), embedder.dim(), replace);

        let (scanned, _, mut builder) = tokio::try_join!(t1, t2, t3)?;
        scanned?;

        pb.finish_with_message("特征提取完成");

        if builder.is_empty() {
            bail!("没有找到可用的图片: {}", self.path.display());
        }
        info!("共提取 {} 张图片的特征", builder.len());

        builder.sort_by_id();
        let store = builder.finish();
        let dir = opts.catalog_dir();
        block_in_place(|| -> anyhow::Result<()> {
            let catalog = Catalog::build(store, self.index, spec)?;
            catalog.save(&dir)
        })?;

        info!("构建图片目录成功: {}", dir.display());
        Ok(())
    }
}
