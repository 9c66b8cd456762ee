// src/downloader/item.rs

use crate::{
    error::{AppError, AppResult},
    models::{ItemOutcome, ItemStatus, Track},
};
use serde::Serialize;

/// 批次中的单个下载项。只由处理它的编排任务通过聚合器修改。
#[derive(Debug, Clone, Serialize)]
pub struct DownloadItem {
    pub id: String,
    pub track: Track,
    pub status: ItemStatus,
    pub error: Option<String>,
    /// 0..=100
    pub progress: u8,
    pub attempts: u32,
}

/// 一次状态转换需要在批次计数器上做的搬移
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shift {
    pub from: ItemStatus,
    pub to: ItemStatus,
}

impl DownloadItem {
    pub fn new(batch_id: &str, track: Track) -> Self {
        Self {
            id: format!("{}_{}", batch_id, track.id),
            track,
            status: ItemStatus::Pending,
            error: None,
            progress: 0,
            attempts: 0,
        }
    }

    /// Pending -> Downloading
    pub fn begin(&mut self) -> AppResult<Shift> {
        self.transition(&[ItemStatus::Pending], ItemStatus::Downloading)?;
        self.progress = 0;
        Ok(Shift { from: ItemStatus::Pending, to: ItemStatus::Downloading })
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn set_progress(&mut self, percent: u8) {
        if self.status == ItemStatus::Downloading {
            self.progress = percent.min(100);
        }
    }

    /// Downloading -> Completed | Failed | Skipped
    pub fn settle(&mut self, outcome: &ItemOutcome) -> AppResult<Shift> {
        self.finish(&[ItemStatus::Downloading], outcome)
    }

    /// 来自批次之外的结果，允许直接从 Pending 结束
    pub fn settle_out_of_band(&mut self, outcome: &ItemOutcome) -> AppResult<Shift> {
        self.finish(&[ItemStatus::Pending, ItemStatus::Downloading], outcome)
    }

    fn finish(&mut self, allowed: &[ItemStatus], outcome: &ItemOutcome) -> AppResult<Shift> {
        let from = self.status;
        let to = outcome.status();
        self.transition(allowed, to)?;
        self.error = outcome.message().map(str::to_string);
        if to == ItemStatus::Completed {
            self.progress = 100;
        }
        Ok(Shift { from, to })
    }

    fn transition(&mut self, allowed: &[ItemStatus], to: ItemStatus) -> AppResult<()> {
        if !allowed.contains(&self.status) {
            return Err(AppError::InvalidTransition(format!(
                "下载项 '{}' 无法从 {:?} 转换到 {:?}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants;

    fn item() -> DownloadItem {
        DownloadItem::new(
            "batch_1",
            Track {
                id: 42,
                display_name: "Song".into(),
                artist: "Band".into(),
                source_url: "https://h/s.mp3".into(),
            },
        )
    }

    #[test]
    fn test_happy_path() {
        let mut it = item();
        assert_eq!(it.id, "batch_1_42");
        assert_eq!(it.status, ItemStatus::Pending);

        let shift = it.begin().unwrap();
        assert_eq!(shift, Shift { from: ItemStatus::Pending, to: ItemStatus::Downloading });
        it.set_progress(140);
        assert_eq!(it.progress, 100);
        it.set_progress(40);

        let shift = it.settle(&ItemOutcome::Completed).unwrap();
        assert_eq!(shift.to, ItemStatus::Completed);
        assert_eq!(it.progress, 100);
        assert!(it.error.is_none());
    }

    #[test]
    fn test_cancel_is_failure_with_message() {
        let mut it = item();
        it.begin().unwrap();
        let shift = it
            .settle(&ItemOutcome::Failed(constants::CANCELLED_BY_USER.to_string()))
            .unwrap();
        assert_eq!(shift.to, ItemStatus::Failed);
        assert_eq!(it.error.as_deref(), Some(constants::CANCELLED_BY_USER));
    }

    #[test]
    fn test_invalid_transitions_leave_item_unchanged() {
        let mut it = item();
        assert!(it.settle(&ItemOutcome::Completed).is_err());
        assert_eq!(it.status, ItemStatus::Pending);

        it.begin().unwrap();
        assert!(it.begin().is_err());
        it.settle(&ItemOutcome::Skipped("cooldown".into())).unwrap();
        assert!(it.settle(&ItemOutcome::Completed).is_err());
        assert!(it.settle_out_of_band(&ItemOutcome::Completed).is_err());
        assert_eq!(it.status, ItemStatus::Skipped);
    }

    #[test]
    fn test_out_of_band_settles_pending() {
        let mut it = item();
        let shift = it.settle_out_of_band(&ItemOutcome::Failed("403".into())).unwrap();
        assert_eq!(shift, Shift { from: ItemStatus::Pending, to: ItemStatus::Failed });
        assert_eq!(it.error.as_deref(), Some("403"));
    }
}
