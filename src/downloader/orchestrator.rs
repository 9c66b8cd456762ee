// src/downloader/orchestrator.rs

use super::{
    aggregator::{BeginOutcome, ProgressAggregator},
    auth::{Authorizer, CurrentUser},
    bridge::{BatchEvent, EventBridge},
    cancel::CancellationRegistry,
    fetcher::{Fetcher, SaveSink},
    item::DownloadItem,
    notify::{Notifier, NotifyLevel},
    retry::RetryPolicy,
};
use crate::{
    config::AppConfig,
    constants,
    error::*,
    models::{Batch, BatchProgress, BatchStatus, BatchSummary, ItemOutcome, ItemStatus, Track},
    utils,
};
use anyhow::anyhow;
use chrono::Local;
use futures::{StreamExt, stream};
use log::{debug, error, info, warn};
use std::{collections::HashSet, path::PathBuf, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 编排器依赖的外部协作者
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub authorizer: Arc<dyn Authorizer>,
    pub fetcher: Arc<dyn Fetcher>,
    pub sink: Arc<dyn SaveSink>,
    pub identity: Arc<dyn CurrentUser>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// 每组的曲目数，也是单个批次同时进行的网络操作上限
    pub group_size: usize,
    /// 单次网络调用的超时
    pub call_timeout: Duration,
    pub policy: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            group_size: constants::batch::DEFAULT_GROUP_SIZE,
            call_timeout: Duration::from_secs(constants::network::CALL_TIMEOUT_SECS),
            policy: RetryPolicy::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            group_size: config.group_size.max(1),
            call_timeout: config.timeout,
            policy: RetryPolicy::from_config(config),
        }
    }
}

/// 已开始的批次。`wait` 在批次结束 (完成或取消) 后返回汇总。
pub struct BatchHandle {
    pub batch_id: String,
    join: JoinHandle<AppResult<BatchSummary>>,
}

impl BatchHandle {
    pub async fn wait(self) -> AppResult<BatchSummary> {
        self.join.await.map_err(|e| {
            AppError::Other(anyhow!("批次 '{}' 的后台任务异常退出: {}", self.batch_id, e))
        })?
    }
}

struct Inner {
    aggregator: Arc<ProgressAggregator>,
    bridge: EventBridge,
    registry: Arc<CancellationRegistry>,
    deps: OrchestratorDeps,
    settings: OrchestratorSettings,
}

/// 批量下载编排器：把一个批次拆成固定大小的组，组内并发、组间串行地下载，
/// 按重试策略处理失败，并把每一项的结果写入聚合器。
#[derive(Clone)]
pub struct BatchOrchestrator {
    inner: Arc<Inner>,
}

impl BatchOrchestrator {
    pub fn new(deps: OrchestratorDeps, settings: OrchestratorSettings) -> Self {
        let aggregator = Arc::new(ProgressAggregator::new());
        let bridge = EventBridge::new(aggregator.clone());
        Self::with_parts(deps, settings, aggregator, bridge)
    }

    /// 与其他调用方共享同一个聚合器和事件桥
    pub fn with_parts(
        deps: OrchestratorDeps,
        settings: OrchestratorSettings,
        aggregator: Arc<ProgressAggregator>,
        bridge: EventBridge,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                aggregator,
                bridge,
                registry: Arc::new(CancellationRegistry::new()),
                deps,
                settings,
            }),
        }
    }

    pub fn aggregator(&self) -> &Arc<ProgressAggregator> {
        &self.inner.aggregator
    }

    pub fn bridge(&self) -> &EventBridge {
        &self.inner.bridge
    }

    pub fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.inner.registry
    }

    pub fn is_cancelled(&self, batch_id: &str) -> bool {
        self.inner.registry.is_cancelled(batch_id)
    }

    pub fn get_active_batch_for_page(&self, source_page_id: &str) -> Option<Batch> {
        self.inner.aggregator.get_active_batch_for_page(source_page_id)
    }

    pub fn get_batch(&self, batch_id: &str) -> Option<Batch> {
        self.inner.aggregator.get_batch(batch_id)
    }

    /// 登记批次后立即返回，下载在后台进行。
    pub fn start_batch(
        &self,
        tracks: Vec<Track>,
        name: &str,
        source_page_id: &str,
        source_page_label: &str,
    ) -> AppResult<BatchHandle> {
        if self.inner.deps.identity.current_user().is_none() {
            warn!("未登录用户尝试开始批量下载 '{}'", name);
            return Err(AppError::Unauthenticated);
        }
        let tracks = dedup_tracks(tracks);
        if tracks.is_empty() {
            return Err(AppError::EmptySelection);
        }

        let batch_id = utils::generate_batch_id();
        let total = tracks.len();
        let batch = Batch {
            id: batch_id.clone(),
            name: name.to_string(),
            items: tracks
                .iter()
                .cloned()
                .map(|t| DownloadItem::new(&batch_id, t))
                .collect(),
            tracks: tracks.clone(),
            source_page_id: source_page_id.to_string(),
            source_page_label: source_page_label.to_string(),
            status: BatchStatus::Active,
            progress: BatchProgress::new(total),
            started_at: Local::now(),
        };
        for superseded in self.inner.aggregator.register(batch)? {
            self.inner.registry.forget(&superseded);
        }
        self.inner.registry.register_batch(&batch_id);

        info!(
            "开始批次 '{}' ({}): {} 首曲目，来源页面 '{}'",
            name, batch_id, total, source_page_id
        );
        self.inner.deps.notifier.notify(
            &format!("开始下载 '{}'，共 {} 首曲目 (来自 {})", name, total, source_page_label),
            NotifyLevel::Info,
        );
        self.inner.bridge.publish(BatchEvent::BatchStarted {
            batch_id: batch_id.clone(),
            source_page_id: source_page_id.to_string(),
            total,
        });

        let this = self.clone();
        let run_id = batch_id.clone();
        let join = tokio::spawn(async move { this.run_batch(run_id, tracks).await });
        Ok(BatchHandle { batch_id, join })
    }

    /// 幂等：对已取消、已完成或不存在的批次调用不会产生任何效果。
    pub fn cancel_batch(&self, batch_id: &str) -> bool {
        // 先改状态：与批次自然完成竞争时，只有一方生效
        match self.inner.aggregator.mark_status(batch_id, BatchStatus::Cancelled) {
            Ok(true) => {}
            Ok(false) => {
                debug!("批次 '{}' 已结束，忽略取消请求", batch_id);
                return false;
            }
            Err(e) => {
                warn!("忽略取消请求: {}", e);
                return false;
            }
        }
        self.inner.registry.cancel(batch_id);
        if let Some(batch) = self.inner.aggregator.get_batch(batch_id) {
            let p = batch.progress;
            self.inner.deps.notifier.notify(
                &format!(
                    "已取消 '{}': 完成 {}，跳过 {}，失败 {}，未开始 {}",
                    batch.name, p.completed, p.skipped, p.failed, p.pending
                ),
                NotifyLevel::Warning,
            );
        }
        true
    }

    /// 批次之外的单曲下载。与批次共享授权、下载和重试逻辑，结果经事件桥回写。
    pub async fn download_single(&self, track: Track) -> AppResult<ItemOutcome> {
        if self.inner.deps.identity.current_user().is_none() {
            return Err(AppError::Unauthenticated);
        }
        let token = CancellationToken::new();
        let outcome = self.download_with_retry(&track, &token, None).await;
        let credited = self.inner.bridge.on_track_result(track.id, outcome.clone());
        if !credited.is_empty() {
            info!("单曲 {} 的结果已计入批次: {:?}", track.id, credited);
        }
        Ok(outcome)
    }

    async fn run_batch(self, batch_id: String, tracks: Vec<Track>) -> AppResult<BatchSummary> {
        let group_size = self.inner.settings.group_size;
        let group_count = tracks.len().div_ceil(group_size);

        for (index, group) in tracks.chunks(group_size).enumerate() {
            if self.is_cancelled(&batch_id) {
                info!(
                    "批次 '{}' 已取消，剩余 {} 组不再开始",
                    batch_id,
                    group_count - index
                );
                break;
            }
            debug!("批次 '{}' 开始第 {}/{} 组 ({} 首)", batch_id, index + 1, group_count, group.len());
            stream::iter(group.iter().cloned())
                .for_each_concurrent(group_size, |track| self.process_item(&batch_id, track))
                .await;
        }

        let completed = matches!(
            self.inner.aggregator.mark_status(&batch_id, BatchStatus::Completed),
            Ok(true)
        );
        self.inner.registry.release(&batch_id);

        let summary = self.summarize(&batch_id)?;
        if completed {
            let p = summary.progress;
            let level = if p.failed > 0 { NotifyLevel::Warning } else { NotifyLevel::Success };
            self.inner.deps.notifier.notify(
                &format!(
                    "'{}' 下载结束: 完成 {}，跳过 {}，失败 {}",
                    summary.name, p.completed, p.skipped, p.failed
                ),
                level,
            );
        }
        info!("批次 '{}' 结束，状态 {:?}，进度 {:?}", batch_id, summary.status, summary.progress);
        self.inner.bridge.publish(BatchEvent::BatchFinished {
            batch_id: batch_id.clone(),
            status: summary.status,
            progress: summary.progress,
        });
        if let Err(e) = self.inner.aggregator.mark_finished(&batch_id) {
            warn!("无法标记批次 '{}' 的后台任务已结束: {}", batch_id, e);
        }
        Ok(summary)
    }

    async fn process_item(&self, batch_id: &str, track: Track) {
        if self.is_cancelled(batch_id) {
            return;
        }
        match self.inner.aggregator.begin_item(batch_id, track.id) {
            Ok(BeginOutcome::Started) => {}
            Ok(BeginOutcome::AlreadyCounted) => {
                debug!("曲目 {} 已在批次 '{}' 之外完成，跳过下载", track.id, batch_id);
                return;
            }
            Ok(BeginOutcome::Closed) => {
                debug!("批次 '{}' 已不在进行中，曲目 {} 保持等待", batch_id, track.id);
                return;
            }
            Err(e) => {
                error!("无法开始批次 '{}' 中的曲目 {}: {}", batch_id, track.id, e);
                return;
            }
        }

        let handle = self.inner.registry.operation_handle(batch_id);
        let outcome = self
            .download_with_retry(&track, handle.token(), Some(batch_id))
            .await;
        drop(handle);

        match self.inner.aggregator.settle_item(batch_id, track.id, &outcome) {
            Ok(true) => {
                if let Some(progress) = self.inner.aggregator.progress(batch_id) {
                    self.inner.bridge.publish(BatchEvent::ItemSettled {
                        batch_id: batch_id.to_string(),
                        track_id: track.id,
                        status: outcome.status(),
                        progress,
                    });
                }
            }
            Ok(false) => debug!("曲目 {} 的结果已由其他调用方计入批次 '{}'", track.id, batch_id),
            Err(e) => error!("无法记录批次 '{}' 中曲目 {} 的结果: {}", batch_id, track.id, e),
        }
    }

    async fn download_with_retry(
        &self,
        track: &Track,
        token: &CancellationToken,
        batch_id: Option<&str>,
    ) -> ItemOutcome {
        let policy = &self.inner.settings.policy;
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(id) = batch_id
                && let Err(e) = self.inner.aggregator.record_attempt(id, track.id)
            {
                debug!("无法记录曲目 {} 的尝试次数: {}", track.id, e);
            }
            if token.is_cancelled() {
                return cancelled_outcome();
            }

            let err = match self.attempt_once(track, token, batch_id).await {
                Ok(path) if token.is_cancelled() => {
                    warn!("曲目 {} 已保存到 {:?}，但批次在保存期间被取消", track.id, path);
                    return cancelled_outcome();
                }
                Ok(path) => {
                    debug!("曲目 {} 已保存到 {:?} (第 {} 次尝试)", track.id, path, attempt);
                    return ItemOutcome::Completed;
                }
                Err(e) => e,
            };
            if token.is_cancelled() || err.failure_class() == FailureClass::Cancelled {
                return cancelled_outcome();
            }

            let decision = policy.decide(attempt, &err);
            if decision.counts_as_skip {
                info!("曲目 {} 处于冷却期，跳过: {}", track.id, err.detail_message());
                return ItemOutcome::Skipped(err.detail_message());
            }
            if !decision.retry {
                error!("曲目 {} 在第 {} 次尝试后失败: {}", track.id, attempt, err);
                return ItemOutcome::Failed(err.to_string());
            }
            warn!(
                "曲目 {} 第 {} 次尝试失败: {}，{:?} 后重试",
                track.id, attempt, err, decision.delay
            );
            tokio::select! {
                biased;
                _ = token.cancelled() => return cancelled_outcome(),
                _ = tokio::time::sleep(decision.delay) => {}
            }
        }
    }

    async fn attempt_once(
        &self,
        track: &Track,
        token: &CancellationToken,
        batch_id: Option<&str>,
    ) -> AppResult<PathBuf> {
        let deps = &self.inner.deps;
        let auth = self.guarded(token, deps.authorizer.authorize(track.id)).await?;

        let aggregator = &self.inner.aggregator;
        let on_progress = move |percent: u8| {
            if let Some(id) = batch_id {
                aggregator.set_item_progress(id, track.id, percent);
            }
        };
        let bytes = self
            .guarded(token, deps.fetcher.fetch(&auth.download_url, token, &on_progress))
            .await?;

        // 内容已收到但批次被取消时，不保存也不算成功
        if token.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        deps.sink.save(bytes, &utils::suggested_filename(track)).await
    }

    /// 给一次网络调用加上超时，并在取消时立即放弃
    async fn guarded<T>(
        &self,
        token: &CancellationToken,
        call: impl Future<Output = AppResult<T>>,
    ) -> AppResult<T> {
        let limit = self.inner.settings.call_timeout;
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(AppError::Cancelled),
            res = tokio::time::timeout(limit, call) => res.unwrap_or(Err(AppError::Timeout(limit))),
        }
    }

    fn summarize(&self, batch_id: &str) -> AppResult<BatchSummary> {
        let batch = self
            .inner
            .aggregator
            .get_batch(batch_id)
            .ok_or_else(|| AppError::BatchNotFound(batch_id.to_string()))?;
        let collect = |status: ItemStatus| -> Vec<(String, String)> {
            batch
                .items
                .iter()
                .filter(|item| item.status == status)
                .map(|item| {
                    (
                        utils::suggested_filename(&item.track),
                        item.error.clone().unwrap_or_default(),
                    )
                })
                .collect()
        };
        Ok(BatchSummary {
            batch_id: batch.id.clone(),
            name: batch.name.clone(),
            status: batch.status,
            progress: batch.progress,
            failed: collect(ItemStatus::Failed),
            skipped: collect(ItemStatus::Skipped),
        })
    }
}

fn cancelled_outcome() -> ItemOutcome {
    ItemOutcome::Failed(constants::CANCELLED_BY_USER.to_string())
}

/// 同一首曲目只保留第一次出现
fn dedup_tracks(tracks: Vec<Track>) -> Vec<Track> {
    let original = tracks.len();
    let mut seen = HashSet::new();
    let unique: Vec<Track> = tracks.into_iter().filter(|t| seen.insert(t.id)).collect();
    if unique.len() < original {
        warn!("选择中包含 {} 首重复曲目，已忽略", original - unique.len());
    }
    unique
}
