// src/models/mod.rs

pub mod api;

use crate::downloader::DownloadItem;
use crate::symbols;
use chrono::{DateTime, Local};
use colored::{ColoredString, Colorize};
use serde::{Deserialize, Serialize};

/// 外部曲库中的一首曲目，批次运行期间只读
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: u64,
    pub display_name: String,
    pub artist: String,
    #[serde(rename = "sourceURL", alias = "sourceUrl")]
    pub source_url: String,
}

// 1. 单个下载项的状态
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
pub enum ItemStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    /// 冷却期内跳过，既不算成功也不算失败
    Skipped,
}

impl ItemStatus {
    pub fn get_display_info(
        &self,
    ) -> (
        &'static ColoredString,
        fn(ColoredString) -> ColoredString,
        &'static str,
    ) {
        match self {
            ItemStatus::Pending => (&symbols::INFO, |s| s.normal(), "等待中"),
            ItemStatus::Downloading => (&symbols::INFO, |s| s.cyan(), "下载中"),
            ItemStatus::Completed => (&symbols::OK, |s| s.green(), "下载成功"),
            ItemStatus::Failed => (&symbols::ERROR, |s| s.red(), "下载失败"),
            ItemStatus::Skipped => (&symbols::WARN, |s| s.yellow(), "冷却期内已下载，跳过"),
        }
    }
}

/// 一个下载项的最终结果，由编排器或事件桥上报
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    Failed(String),
    Skipped(String),
}

impl ItemOutcome {
    pub fn status(&self) -> ItemStatus {
        match self {
            ItemOutcome::Completed => ItemStatus::Completed,
            ItemOutcome::Failed(_) => ItemStatus::Failed,
            ItemOutcome::Skipped(_) => ItemStatus::Skipped,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ItemOutcome::Completed => None,
            ItemOutcome::Failed(msg) | ItemOutcome::Skipped(msg) => Some(msg),
        }
    }
}

// 2. 批次状态
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
pub enum BatchStatus {
    Active,
    Completed,
    Cancelled,
}

/// 批次的聚合计数器
///
/// 静止时满足 `total == pending + downloading + completed + failed + skipped`。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    pub pending: usize,
    pub downloading: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            pending: total,
            ..Default::default()
        }
    }

    pub fn settled(&self) -> usize {
        self.completed + self.failed + self.skipped
    }

    pub fn is_consistent(&self) -> bool {
        self.total == self.pending + self.downloading + self.settled()
    }
}

/// 聚合器中批次记录的只读快照
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: String,
    pub name: String,
    pub tracks: Vec<Track>,
    pub source_page_id: String,
    pub source_page_label: String,
    pub status: BatchStatus,
    pub progress: BatchProgress,
    pub started_at: DateTime<Local>,
    pub items: Vec<DownloadItem>,
}

impl Batch {
    pub fn item_for_track(&self, track_id: u64) -> Option<&DownloadItem> {
        self.items.iter().find(|item| item.track.id == track_id)
    }
}

/// 批次结束时的汇总
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub batch_id: String,
    pub name: String,
    pub status: BatchStatus,
    pub progress: BatchProgress,
    /// (文件名, 原因)
    pub failed: Vec<(String, String)>,
    pub skipped: Vec<(String, String)>,
}

impl BatchSummary {
    pub fn did_all_succeed(&self) -> bool {
        self.status == BatchStatus::Completed && self.progress.failed == 0
    }
}

/// 已登录用户
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub token_hint: String,
}
