// src/downloader/cancel.rs

use dashmap::{DashMap, DashSet};
use log::{debug, info};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct BatchHandles {
    root: CancellationToken,
    in_flight: HashMap<u64, CancellationToken>,
}

/// 取消登记表：批次 -> 正在进行的网络操作句柄，以及已取消批次的集合。
///
/// 已取消集合是 "不再为该批次发起新工作" 的唯一依据。
#[derive(Default)]
pub struct CancellationRegistry {
    handles: DashMap<String, BatchHandles>,
    cancelled: DashSet<String>,
    next_id: AtomicU64,
}

/// 一次网络操作的取消句柄，drop 时从登记表中移除
pub struct InFlightHandle {
    registry: Arc<CancellationRegistry>,
    batch_id: String,
    op_id: u64,
    token: CancellationToken,
}

impl InFlightHandle {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for InFlightHandle {
    fn drop(&mut self) {
        if let Some(mut handles) = self.registry.handles.get_mut(&self.batch_id) {
            handles.in_flight.remove(&self.op_id);
        }
    }
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_batch(&self, batch_id: &str) {
        self.handles.entry(batch_id.to_string()).or_default();
    }

    pub fn is_cancelled(&self, batch_id: &str) -> bool {
        self.cancelled.contains(batch_id)
    }

    /// 为一次网络操作登记取消句柄。批次已取消时返回的句柄立即处于取消状态。
    pub fn operation_handle(self: &Arc<Self>, batch_id: &str) -> InFlightHandle {
        let op_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = {
            let mut handles = self.handles.entry(batch_id.to_string()).or_default();
            let token = handles.root.child_token();
            handles.in_flight.insert(op_id, token.clone());
            token
        };
        if self.is_cancelled(batch_id) {
            token.cancel();
        }
        InFlightHandle {
            registry: self.clone(),
            batch_id: batch_id.to_string(),
            op_id,
            token,
        }
    }

    pub fn in_flight(&self, batch_id: &str) -> usize {
        self.handles
            .get(batch_id)
            .map(|h| h.in_flight.len())
            .unwrap_or(0)
    }

    /// 幂等。返回本次调用是否是第一次取消该批次。
    pub fn cancel(&self, batch_id: &str) -> bool {
        let first = self.cancelled.insert(batch_id.to_string());
        let aborted = match self.handles.get(batch_id) {
            Some(handles) => {
                handles.root.cancel();
                handles.in_flight.len()
            }
            None => 0,
        };
        if first {
            info!("批次 '{}' 已取消，中止 {} 个进行中的网络操作", batch_id, aborted);
        }
        first
    }

    /// 批次结束后释放其句柄。已取消标记保留到批次记录被移除为止，
    /// 在此之前 `is_cancelled` 对仍可查询的批次保持准确。
    pub fn release(&self, batch_id: &str) {
        if self.handles.remove(batch_id).is_some() {
            debug!("已释放批次 '{}' 的取消句柄", batch_id);
        }
    }

    /// 批次记录被移除后，清除它的全部痕迹
    pub fn forget(&self, batch_id: &str) {
        self.handles.remove(batch_id);
        if self.cancelled.remove(batch_id).is_some() {
            debug!("已清除批次 '{}' 的取消标记", batch_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_signals_in_flight_handles() {
        let registry = Arc::new(CancellationRegistry::new());
        registry.register_batch("b1");
        let a = registry.operation_handle("b1");
        let b = registry.operation_handle("b1");
        let other = registry.operation_handle("b2");
        assert_eq!(registry.in_flight("b1"), 2);

        assert!(registry.cancel("b1"));
        assert!(!registry.cancel("b1"));
        assert!(registry.is_cancelled("b1"));
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(!other.is_cancelled());

        drop(a);
        assert_eq!(registry.in_flight("b1"), 1);
    }

    #[test]
    fn test_forget_drops_cancel_mark() {
        let registry = Arc::new(CancellationRegistry::new());
        registry.register_batch("b1");
        registry.cancel("b1");
        registry.release("b1");
        assert!(registry.is_cancelled("b1"));

        registry.forget("b1");
        assert!(!registry.is_cancelled("b1"));
        assert_eq!(registry.in_flight("b1"), 0);
    }

    #[test]
    fn test_handle_after_cancel_starts_cancelled() {
        let registry = Arc::new(CancellationRegistry::new());
        registry.cancel("b1");
        assert!(registry.operation_handle("b1").is_cancelled());
    }
}
