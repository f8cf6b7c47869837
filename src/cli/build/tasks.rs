use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressIterator};
use log::{info, warn};
use rayon::prelude::*;
use regex::Regex;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::{Receiver, Sender, channel};
use tokio::task::{JoinHandle, spawn_blocking};
use tokio_tar::Archive;
use walkdir::WalkDir;

use super::types::*;
use crate::embed::{Embedder, embed_bytes};
use crate::store::FeatureStoreBuilder;
use crate::utils::{pb_style, pb_style_speed};

pub fn task_scan(
    path: PathBuf,
    pb: ProgressBar,
    regex_suf: Regex,
) -> (JoinHandle<Result<()>>, Receiver<ImageData>) {
    let (tx, rx) = channel(num_cpus::get());
    let t = tokio::spawn(async move {
        if path.is_file() {
            scan_tar(path, tx, regex_suf, pb).await
        } else {
            scan_directory(path, tx, regex_suf, pb).await
        }
    });
    (t, rx)
}

pub fn task_embed(
    mut lrx: Receiver<ImageData>,
    embedder: Arc<dyn Embedder>,
    pb: ProgressBar,
) -> (JoinHandle<()>, Receiver<EmbeddedImage>) {
    let (tx, rx) = channel(num_cpus::get());
    let t = spawn_blocking(move || {
        let mut buffer = vec![];
        // NOTE: 一次最多读取 cpu * 10 张图片，计算完成后再读取下一批，避免内存占用过高
        while lrx.blocking_recv_many(&mut buffer, num_cpus::get() * 10) != 0 {
            let results = buffer
                .par_drain(..)
                .map(|data| {
                    let vector = embed_bytes(embedder.as_ref(), &data.data);
                    (data.path, vector)
                })
                .collect::<Vec<_>>();

            for (path, vector) in results {
                match vector {
                    Ok(vector) => {
                        if tx.blocking_send(EmbeddedImage { path, vector }).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("跳过图片 {}: {}", path, e);
                        pb.inc(1);
                    }
                }
            }
        }
    });
    (t, rx)
}

pub fn task_collect(
    mut lrx: Receiver<EmbeddedImage>,
    pb: ProgressBar,
    dim: usize,
    replace: Option<(Regex, String)>,
) -> JoinHandle<FeatureStoreBuilder> {
    tokio::spawn(async move {
        let mut builder = FeatureStoreBuilder::new(dim);
        while let Some(data) = lrx.recv().await {
            let path = match &replace {
                Some((re, replace)) => re.replace(&data.path, replace).into_owned(),
                None => data.path,
            };
            pb.set_message(path.clone());
            if let Err(e) = builder.push(path, data.vector) {
                warn!("{}", e);
            }
            pb.inc(1);
        }
        builder
    })
}

async fn scan_directory(
    path: PathBuf,
    tx: Sender<ImageData>,
    regex_suf: Regex,
    pb: ProgressBar,
) -> Result<()> {
    info!("开始扫描目录: {}", path.display());
    let pb2 = ProgressBar::no_length().with_style(pb_style());
    let entries = WalkDir::new(path)
        .sort_by_file_name()
        .into_iter()
        .progress_with(pb2)
        .filter_map(|entry| {
            entry.ok().and_then(|entry| {
                let path = entry.path();
                if path.is_file() {
                    if let Some(ext) = path.extension() {
                        if regex_suf.is_match(&ext.to_string_lossy()) {
                            return Some(path.to_string_lossy().to_string());
                        }
                    }
                }
                None
            })
        })
        .collect::<Vec<_>>();
    info!("扫描完成，共 {} 张图片", entries.len());

    pb.set_length(entries.len() as u64);

    futures::stream::iter(entries)
        .for_each_concurrent(32, |entry| {
            let tx = tx.clone();
            let pb = pb.clone();
            async move {
                match tokio::fs::read(&entry).await {
                    Ok(data) => {
                        let _ = tx.send(ImageData { path: entry, data }).await;
                    }
                    Err(e) => {
                        warn!("无法读取 {}: {}", entry, e);
                        pb.inc(1);
                    }
                }
            }
        })
        .await;

    Ok(())
}

async fn scan_tar(path: PathBuf, tx: Sender<ImageData>, re_suf: Regex, pb: ProgressBar) -> Result<()> {
    info!("开始扫描归档: {}", path.display());
    let file = File::open(path).await?;
    let mut archive = Archive::new(file);
    let mut entries = archive.entries()?;

    pb.set_style(pb_style_speed());

    // NOTE: tar 的 entries 必须按顺序读取，不能乱序并发
    while let Some(entry) = entries.next().await {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().to_string();
        let matched = std::path::Path::new(&path)
            .extension()
            .is_some_and(|ext| re_suf.is_match(&ext.to_string_lossy()));
        if !matched {
            continue;
        }

        let mut data = Vec::with_capacity(entry.header().size()? as usize);
        entry.read_to_end(&mut data).await?;

        if tx.send(ImageData { path, data }).await.is_err() {
            break;
        }
    }
    Ok(())
}
