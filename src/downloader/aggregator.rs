// src/downloader/aggregator.rs

use super::item::DownloadItem;
use crate::{
    error::{AppError, AppResult},
    models::{Batch, BatchProgress, BatchStatus, ItemOutcome, ItemStatus},
};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// 批次计数器中的一个字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressField {
    Pending,
    Downloading,
    Completed,
    Failed,
    Skipped,
}

impl From<ItemStatus> for ProgressField {
    fn from(status: ItemStatus) -> Self {
        match status {
            ItemStatus::Pending => ProgressField::Pending,
            ItemStatus::Downloading => ProgressField::Downloading,
            ItemStatus::Completed => ProgressField::Completed,
            ItemStatus::Failed => ProgressField::Failed,
            ItemStatus::Skipped => ProgressField::Skipped,
        }
    }
}

/// 对计数器的一次有符号修改，整体在一个临界区内生效
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressDelta {
    pub pending: i64,
    pub downloading: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl ProgressDelta {
    pub fn single(field: ProgressField, delta: i64) -> Self {
        let mut d = Self::default();
        *d.slot(field) += delta;
        d
    }

    /// 把一个下载项从 `from` 桶搬到 `to` 桶
    pub fn shift(from: ItemStatus, to: ItemStatus) -> Self {
        let mut d = Self::single(from.into(), -1);
        *d.slot(to.into()) += 1;
        d
    }

    fn slot(&mut self, field: ProgressField) -> &mut i64 {
        match field {
            ProgressField::Pending => &mut self.pending,
            ProgressField::Downloading => &mut self.downloading,
            ProgressField::Completed => &mut self.completed,
            ProgressField::Failed => &mut self.failed,
            ProgressField::Skipped => &mut self.skipped,
        }
    }
}

/// `begin_item` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    Started,
    /// 该曲目已被计入 (例如事件桥先一步上报了结果)
    AlreadyCounted,
    /// 批次已不再进行中，不能开始新的下载项
    Closed,
}

struct BatchRecord {
    batch: Batch,
    index: HashMap<u64, usize>,
    counted: HashSet<u64>,
    /// 编排器的后台任务已结束，不会再有结果写入
    finished: bool,
}

impl BatchRecord {
    fn position(&self, track_id: u64) -> AppResult<usize> {
        self.index.get(&track_id).copied().ok_or_else(|| {
            AppError::UserInputError(format!(
                "曲目 {} 不属于批次 '{}'",
                track_id, self.batch.id
            ))
        })
    }

    /// 在副本上执行转换，计数器校验通过后再写回
    fn transition(
        &mut self,
        track_id: u64,
        f: impl FnOnce(&mut DownloadItem) -> AppResult<super::item::Shift>,
    ) -> AppResult<()> {
        let pos = self.position(track_id)?;
        let mut item = self.batch.items[pos].clone();
        let shift = f(&mut item)?;
        apply_locked(
            &self.batch.id,
            &mut self.batch.progress,
            ProgressDelta::shift(shift.from, shift.to),
        )?;
        debug!(
            "批次 '{}' 中的曲目 {}: {:?} -> {:?}",
            self.batch.id, track_id, shift.from, shift.to
        );
        self.batch.items[pos] = item;
        Ok(())
    }
}

fn apply_locked(
    batch_id: &str,
    progress: &mut BatchProgress,
    delta: ProgressDelta,
) -> AppResult<()> {
    let adjust = |value: usize, d: i64| -> Option<usize> {
        let next = value as i64 + d;
        (next >= 0).then_some(next as usize)
    };
    let next = (|| {
        Some(BatchProgress {
            total: progress.total,
            pending: adjust(progress.pending, delta.pending)?,
            downloading: adjust(progress.downloading, delta.downloading)?,
            completed: adjust(progress.completed, delta.completed)?,
            failed: adjust(progress.failed, delta.failed)?,
            skipped: adjust(progress.skipped, delta.skipped)?,
        })
    })()
    .ok_or_else(|| {
        AppError::InvariantViolation(format!(
            "批次 '{}' 的计数器将变为负数: {:?} + {:?}",
            batch_id, progress, delta
        ))
    })?;
    if !next.is_consistent() {
        return Err(AppError::InvariantViolation(format!(
            "批次 '{}' 的计数器之和不再等于总数: {:?}",
            batch_id, next
        )));
    }
    *progress = next;
    Ok(())
}

/// 批次进度聚合器：批次记录的唯一持有者。
///
/// 每个批次一把锁，编排器和事件桥的所有修改都经过这里。
#[derive(Default)]
pub struct ProgressAggregator {
    batches: DashMap<String, Arc<Mutex<BatchRecord>>>,
    /// 来源页面 -> 按开始顺序排列的批次 ID
    pages: DashMap<String, Vec<String>>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, batch_id: &str) -> AppResult<Arc<Mutex<BatchRecord>>> {
        self.batches
            .get(batch_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::BatchNotFound(batch_id.to_string()))
    }

    fn lock(record: &Mutex<BatchRecord>) -> MutexGuard<'_, BatchRecord> {
        record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_record<T>(
        &self,
        batch_id: &str,
        f: impl FnOnce(&mut BatchRecord) -> AppResult<T>,
    ) -> AppResult<T> {
        let record = self.record(batch_id)?;
        let mut guard = Self::lock(&record);
        f(&mut guard)
    }

    /// 登记新批次。同一页面上后台任务已结束的旧批次会被新批次取代并移除，
    /// 返回被移除的批次 ID。
    pub fn register(&self, batch: Batch) -> AppResult<Vec<String>> {
        if !batch.progress.is_consistent() || batch.items.len() != batch.progress.total {
            return Err(AppError::InvariantViolation(format!(
                "批次 '{}' 的初始计数器无效: {:?}",
                batch.id, batch.progress
            )));
        }
        let batch_id = batch.id.clone();
        let page_id = batch.source_page_id.clone();
        let index = batch
            .items
            .iter()
            .enumerate()
            .map(|(pos, item)| (item.track.id, pos))
            .collect();
        let record = BatchRecord {
            batch,
            index,
            counted: HashSet::new(),
            finished: false,
        };
        if self.get_active_batch_for_page(&page_id).is_some() {
            warn!("页面 '{}' 已有进行中的批次，新批次 '{}' 将成为当前批次", page_id, batch_id);
        }
        self.batches
            .insert(batch_id.clone(), Arc::new(Mutex::new(record)));

        let superseded: Vec<String> = {
            let mut ids = self.pages.entry(page_id.clone()).or_default();
            let (old, keep): (Vec<String>, Vec<String>) = ids.drain(..).partition(|id| {
                self.batches
                    .get(id)
                    .map(|r| Self::lock(r.value()).finished)
                    .unwrap_or(true)
            });
            *ids = keep;
            ids.push(batch_id.clone());
            old
        };
        for id in &superseded {
            self.batches.remove(id);
            debug!("已移除页面 '{}' 上被取代的批次 '{}'", page_id, id);
        }
        info!("已登记批次 '{}' (页面: '{}')", batch_id, page_id);
        Ok(superseded)
    }

    /// 标记批次的后台任务已结束。之后登记同一页面的新批次时，该记录才可被移除。
    pub fn mark_finished(&self, batch_id: &str) -> AppResult<()> {
        self.with_record(batch_id, |record| {
            record.finished = true;
            Ok(())
        })
    }

    pub fn get_batch(&self, batch_id: &str) -> Option<Batch> {
        let record = self.record(batch_id).ok()?;
        let snapshot = Self::lock(&record).batch.clone();
        Some(snapshot)
    }

    pub fn progress(&self, batch_id: &str) -> Option<BatchProgress> {
        let record = self.record(batch_id).ok()?;
        let progress = Self::lock(&record).batch.progress;
        Some(progress)
    }

    pub fn status(&self, batch_id: &str) -> Option<BatchStatus> {
        let record = self.record(batch_id).ok()?;
        let status = Self::lock(&record).batch.status;
        Some(status)
    }

    /// 该页面最近开始且仍在进行中的批次
    pub fn get_active_batch_for_page(&self, source_page_id: &str) -> Option<Batch> {
        let ids = self.pages.get(source_page_id)?.value().clone();
        ids.iter().rev().find_map(|id| {
            self.get_batch(id)
                .filter(|batch| batch.status == BatchStatus::Active)
        })
    }

    /// 所有包含该曲目的进行中批次
    pub fn active_batches_with_track(&self, track_id: u64) -> Vec<String> {
        let records: Vec<(String, Arc<Mutex<BatchRecord>>)> = self
            .batches
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        records
            .into_iter()
            .filter(|(_, record)| {
                let guard = Self::lock(record);
                guard.batch.status == BatchStatus::Active && guard.index.contains_key(&track_id)
            })
            .map(|(id, _)| id)
            .collect()
    }

    pub fn apply_delta(&self, batch_id: &str, delta: ProgressDelta) -> AppResult<BatchProgress> {
        self.with_record(batch_id, |record| {
            apply_locked(&record.batch.id, &mut record.batch.progress, delta)?;
            Ok(record.batch.progress)
        })
    }

    /// 只允许 Active -> Completed | Cancelled；返回状态是否真的发生了变化
    pub fn mark_status(&self, batch_id: &str, status: BatchStatus) -> AppResult<bool> {
        self.with_record(batch_id, |record| {
            if record.batch.status != BatchStatus::Active || status == BatchStatus::Active {
                return Ok(false);
            }
            record.batch.status = status;
            info!("批次 '{}' 状态变为 {:?}", batch_id, status);
            Ok(true)
        })
    }

    pub fn is_counted(&self, batch_id: &str, track_id: u64) -> bool {
        self.with_record(batch_id, |record| Ok(record.counted.contains(&track_id)))
            .unwrap_or(false)
    }

    /// Pending -> Downloading，同时 pending-1 / downloading+1
    pub fn begin_item(&self, batch_id: &str, track_id: u64) -> AppResult<BeginOutcome> {
        self.with_record(batch_id, |record| {
            if record.counted.contains(&track_id) {
                return Ok(BeginOutcome::AlreadyCounted);
            }
            if record.batch.status != BatchStatus::Active {
                return Ok(BeginOutcome::Closed);
            }
            record.transition(track_id, DownloadItem::begin)?;
            Ok(BeginOutcome::Started)
        })
    }

    pub fn record_attempt(&self, batch_id: &str, track_id: u64) -> AppResult<u32> {
        self.with_record(batch_id, |record| {
            let pos = record.position(track_id)?;
            let item = &mut record.batch.items[pos];
            item.record_attempt();
            Ok(item.attempts)
        })
    }

    pub fn set_item_progress(&self, batch_id: &str, track_id: u64, percent: u8) {
        if let Err(e) = self.with_record(batch_id, |record| {
            let pos = record.position(track_id)?;
            record.batch.items[pos].set_progress(percent);
            Ok(())
        }) {
            debug!("无法更新批次 '{}' 中曲目 {} 的进度: {}", batch_id, track_id, e);
        }
    }

    /// 编排器上报下载项的最终结果。已被计入时不做任何修改并返回 `false`。
    pub fn settle_item(&self, batch_id: &str, track_id: u64, outcome: &ItemOutcome) -> AppResult<bool> {
        self.with_record(batch_id, |record| {
            if record.counted.contains(&track_id) {
                debug!("曲目 {} 已在批次 '{}' 中计入，忽略重复结果", track_id, batch_id);
                return Ok(false);
            }
            record.transition(track_id, |item| item.settle(outcome))?;
            record.counted.insert(track_id);
            Ok(true)
        })
    }

    /// 批次之外的单曲下载结果，仅对进行中的批次生效
    pub fn settle_out_of_band(&self, batch_id: &str, track_id: u64, outcome: &ItemOutcome) -> AppResult<bool> {
        self.with_record(batch_id, |record| {
            if record.batch.status != BatchStatus::Active || record.counted.contains(&track_id) {
                return Ok(false);
            }
            record.transition(track_id, |item| item.settle_out_of_band(outcome))?;
            record.counted.insert(track_id);
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Track;
    use chrono::Local;

    fn batch(id: &str, page: &str, n: u64) -> Batch {
        let tracks: Vec<Track> = (1..=n)
            .map(|i| Track {
                id: i,
                display_name: format!("t{}", i),
                artist: "a".into(),
                source_url: format!("https://h/{}.mp3", i),
            })
            .collect();
        Batch {
            id: id.to_string(),
            name: "test".into(),
            items: tracks.iter().cloned().map(|t| DownloadItem::new(id, t)).collect(),
            tracks,
            source_page_id: page.to_string(),
            source_page_label: "Page".into(),
            status: BatchStatus::Active,
            progress: BatchProgress::new(n as usize),
            started_at: Local::now(),
        }
    }

    #[test]
    fn test_apply_delta_rejects_broken_invariant() {
        let agg = ProgressAggregator::new();
        agg.register(batch("b1", "/p", 3)).unwrap();

        let p = agg
            .apply_delta("b1", ProgressDelta::shift(ItemStatus::Pending, ItemStatus::Downloading))
            .unwrap();
        assert_eq!((p.pending, p.downloading), (2, 1));

        // 单独增加一个字段会破坏总数
        assert!(agg.apply_delta("b1", ProgressDelta::single(ProgressField::Completed, 1)).is_err());
        // 计数器不能为负
        assert!(agg
            .apply_delta("b1", ProgressDelta::shift(ItemStatus::Failed, ItemStatus::Pending))
            .is_err());
        assert!(agg.progress("b1").unwrap().is_consistent());
        assert!(matches!(
            agg.apply_delta("nope", ProgressDelta::default()),
            Err(AppError::BatchNotFound(_))
        ));
    }

    #[test]
    fn test_item_lifecycle_moves_counters() {
        let agg = ProgressAggregator::new();
        agg.register(batch("b1", "/p", 2)).unwrap();

        assert_eq!(agg.begin_item("b1", 1).unwrap(), BeginOutcome::Started);
        assert!(agg.settle_item("b1", 1, &ItemOutcome::Completed).unwrap());
        // 重复上报不会重复计数
        assert!(!agg.settle_item("b1", 1, &ItemOutcome::Completed).unwrap());
        assert_eq!(agg.begin_item("b1", 1).unwrap(), BeginOutcome::AlreadyCounted);

        // 未开始的下载项不能直接由编排器结束
        assert!(agg.settle_item("b1", 2, &ItemOutcome::Completed).is_err());

        let p = agg.progress("b1").unwrap();
        assert_eq!(p, BatchProgress { total: 2, pending: 1, downloading: 0, completed: 1, failed: 0, skipped: 0 });
    }

    #[test]
    fn test_active_batch_for_page_prefers_latest() {
        let agg = ProgressAggregator::new();
        agg.register(batch("b1", "/p", 1)).unwrap();
        agg.register(batch("b2", "/p", 1)).unwrap();
        agg.register(batch("b3", "/other", 1)).unwrap();

        assert_eq!(agg.get_active_batch_for_page("/p").unwrap().id, "b2");
        assert!(agg.mark_status("b2", BatchStatus::Completed).unwrap());
        assert_eq!(agg.get_active_batch_for_page("/p").unwrap().id, "b1");
        assert!(agg.mark_status("b1", BatchStatus::Cancelled).unwrap());
        assert!(agg.get_active_batch_for_page("/p").is_none());
        assert!(agg.get_active_batch_for_page("/missing").is_none());
    }

    #[test]
    fn test_status_is_sticky_once_terminal() {
        let agg = ProgressAggregator::new();
        agg.register(batch("b1", "/p", 1)).unwrap();
        assert!(agg.mark_status("b1", BatchStatus::Cancelled).unwrap());
        assert!(!agg.mark_status("b1", BatchStatus::Completed).unwrap());
        assert_eq!(agg.status("b1"), Some(BatchStatus::Cancelled));
    }

    #[test]
    fn test_register_supersedes_finished_batches_of_page() {
        let agg = ProgressAggregator::new();
        agg.register(batch("b1", "/p", 1)).unwrap();
        agg.mark_status("b1", BatchStatus::Completed).unwrap();
        agg.mark_finished("b1").unwrap();
        assert_eq!(agg.register(batch("b2", "/p", 1)).unwrap(), vec!["b1".to_string()]);
        assert!(agg.get_batch("b1").is_none());
        assert!(agg.get_batch("b2").is_some());
    }

    #[test]
    fn test_cancelled_batch_still_running_is_kept() {
        let agg = ProgressAggregator::new();
        agg.register(batch("b1", "/p", 2)).unwrap();
        assert_eq!(agg.begin_item("b1", 1).unwrap(), BeginOutcome::Started);
        agg.mark_status("b1", BatchStatus::Cancelled).unwrap();

        assert!(agg.register(batch("b2", "/p", 1)).unwrap().is_empty());
        // 取消后的进行中项仍能落账，未开始的项不能再开始
        assert!(agg.settle_item("b1", 1, &ItemOutcome::Failed("cancelled by user".into())).unwrap());
        assert_eq!(agg.begin_item("b1", 2).unwrap(), BeginOutcome::Closed);
        let p = agg.progress("b1").unwrap();
        assert_eq!((p.failed, p.pending, p.downloading), (1, 1, 0));

        agg.mark_finished("b1").unwrap();
        assert_eq!(agg.register(batch("b3", "/p", 1)).unwrap(), vec!["b1".to_string()]);
        assert!(agg.get_batch("b2").is_some());
    }

    #[test]
    fn test_out_of_band_only_counts_once() {
        let agg = ProgressAggregator::new();
        agg.register(batch("b1", "/p", 2)).unwrap();
        assert_eq!(agg.active_batches_with_track(2), vec!["b1".to_string()]);
        assert!(agg.settle_out_of_band("b1", 2, &ItemOutcome::Completed).unwrap());
        assert!(!agg.settle_out_of_band("b1", 2, &ItemOutcome::Completed).unwrap());
        assert!(agg.is_counted("b1", 2));
        let p = agg.progress("b1").unwrap();
        assert_eq!((p.pending, p.completed), (1, 1));
        assert!(agg.active_batches_with_track(99).is_empty());
    }
}
