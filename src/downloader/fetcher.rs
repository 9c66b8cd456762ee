// src/downloader/fetcher.rs

use crate::{client::RobustClient, error::*};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use log::{debug, info};
use std::{
    fs,
    io::Write as IoWrite,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;

/// 下载进度回调，参数为 0..=100 的百分比
pub type ProgressFn<'a> = dyn Fn(u8) + Send + Sync + 'a;

/// 按地址获取文件内容，可通过取消句柄中止
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
        on_progress: &ProgressFn<'_>,
    ) -> AppResult<Bytes>;
}

/// 把下载到的内容交给本地保存机制
#[async_trait]
pub trait SaveSink: Send + Sync {
    async fn save(&self, bytes: Bytes, suggested_filename: &str) -> AppResult<PathBuf>;
}

pub struct HttpFetcher {
    client: Arc<RobustClient>,
}

impl HttpFetcher {
    pub fn new(client: Arc<RobustClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
        on_progress: &ProgressFn<'_>,
    ) -> AppResult<Bytes> {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            res = self.client.get(url).send() => res?,
        };
        let res = res.error_for_status()?;
        let total = res.content_length().filter(|len| *len > 0);
        let mut buffer = BytesMut::with_capacity(total.unwrap_or(0) as usize);
        let mut last_percent = 0u8;

        let mut stream = res.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("下载 '{}' 已取消，已接收 {} 字节", url, buffer.len());
                    return Err(AppError::Cancelled);
                }
                next = stream.next() => next,
            };
            match next {
                Some(chunk) => {
                    buffer.extend_from_slice(&chunk?);
                    if let Some(total) = total {
                        let percent = ((buffer.len() as u64 * 100) / total).min(100) as u8;
                        if percent != last_percent {
                            last_percent = percent;
                            on_progress(percent);
                        }
                    }
                }
                None => break,
            }
        }
        on_progress(100);
        Ok(buffer.freeze())
    }
}

/// 先写入同目录下的临时文件，再原子地重命名为最终文件名
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl SaveSink for DirectorySink {
    async fn save(&self, bytes: Bytes, suggested_filename: &str) -> AppResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let target = self.dir.join(suggested_filename);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&bytes)?;
        tmp.flush()?;
        tmp.persist(&target)?;
        info!("已保存 '{}' ({} 字节)", target.display(), bytes.len());
        Ok(target)
    }
}
