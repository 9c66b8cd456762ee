// src/downloader/bridge.rs

use super::aggregator::ProgressAggregator;
use crate::models::{BatchProgress, BatchStatus, ItemOutcome, ItemStatus};
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    BatchStarted {
        batch_id: String,
        source_page_id: String,
        total: usize,
    },
    ItemSettled {
        batch_id: String,
        track_id: u64,
        status: ItemStatus,
        progress: BatchProgress,
    },
    /// 批次之外的单曲下载结果
    TrackResult {
        track_id: u64,
        status: ItemStatus,
    },
    BatchFinished {
        batch_id: String,
        status: BatchStatus,
        progress: BatchProgress,
    },
}

/// 事件桥：让批次之外的单曲下载结果回写到包含该曲目的进行中批次，
/// 同时向订阅者广播批次进度事件。
#[derive(Clone)]
pub struct EventBridge {
    aggregator: Arc<ProgressAggregator>,
    tx: broadcast::Sender<BatchEvent>,
}

impl EventBridge {
    pub fn new(aggregator: Arc<ProgressAggregator>) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { aggregator, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: BatchEvent) {
        // 没有订阅者时发送失败是正常情况
        let _ = self.tx.send(event);
    }

    /// 单曲下载完成后的入口。返回被计入的批次 ID。
    ///
    /// 每个批次对每首曲目最多计入一次，编排器已经计入的曲目不会被重复计数。
    pub fn on_track_result(&self, track_id: u64, outcome: ItemOutcome) -> Vec<String> {
        let mut credited = Vec::new();
        for batch_id in self.aggregator.active_batches_with_track(track_id) {
            match self
                .aggregator
                .settle_out_of_band(&batch_id, track_id, &outcome)
            {
                Ok(true) => {
                    debug!("单曲 {} 的结果 {:?} 已计入批次 '{}'", track_id, outcome.status(), batch_id);
                    if let Some(progress) = self.aggregator.progress(&batch_id) {
                        self.publish(BatchEvent::ItemSettled {
                            batch_id: batch_id.clone(),
                            track_id,
                            status: outcome.status(),
                            progress,
                        });
                    }
                    credited.push(batch_id);
                }
                Ok(false) => {}
                Err(e) => warn!("无法将单曲 {} 的结果计入批次 '{}': {}", track_id, batch_id, e),
            }
        }
        self.publish(BatchEvent::TrackResult {
            track_id,
            status: outcome.status(),
        });
        credited
    }
}
