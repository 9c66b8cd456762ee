// src/downloader/mod.rs

// 1. 声明子模块
pub mod aggregator;
pub mod auth;
pub mod bridge;
pub mod cancel;
pub mod fetcher;
pub mod item;
pub mod notify;
pub mod orchestrator;
pub mod retry;

// 2. 从子模块中导出公共接口
pub use aggregator::ProgressAggregator;
pub use auth::{Authorizer, CurrentUser, DownloadAuthorization, HttpAuthorizer, TokenIdentity};
pub use bridge::{BatchEvent, EventBridge};
pub use cancel::CancellationRegistry;
pub use fetcher::{DirectorySink, Fetcher, HttpFetcher, SaveSink};
pub use item::DownloadItem;
pub use notify::{ConsoleNotifier, Notifier, NotifyLevel};
pub use orchestrator::{BatchHandle, BatchOrchestrator, OrchestratorDeps, OrchestratorSettings};
pub use retry::{RetryDecision, RetryPolicy};

// 3. 批次结束后的终端报告
use crate::{
    models::{BatchStatus, BatchSummary},
    symbols, ui,
};
use colored::*;
use log::info;
use std::collections::BTreeMap;

pub fn print_report(summary: &BatchSummary) {
    let p = summary.progress;
    info!(
        "下载报告 '{}': Total={}, Completed={}, Skipped={}, Failed={}, Pending={}",
        summary.batch_id, p.total, p.completed, p.skipped, p.failed, p.pending
    );

    if !summary.skipped.is_empty() || !summary.failed.is_empty() {
        ui::print_sub_header("下载详情报告");
        if !summary.skipped.is_empty() {
            println!("\n{} 跳过的曲目 ({}首):", *symbols::INFO, summary.skipped.len());
            print_grouped_report(&summary.skipped, |s| s.cyan());
        }
        if !summary.failed.is_empty() {
            println!("\n{} 失败的曲目 ({}首):", *symbols::ERROR, summary.failed.len());
            print_grouped_report(&summary.failed, |s| s.red());
        }
    }

    ui::print_sub_header("任务总结");
    if summary.status == BatchStatus::Cancelled {
        println!(
            "{} 批次已取消，{} 首曲目未开始下载。",
            *symbols::WARN,
            p.pending
        );
    }
    if p.total > 0 && p.completed + p.skipped == p.total {
        println!(
            "{} 所有 {} 首曲目均已完成 ({} 首已跳过)。",
            *symbols::OK,
            p.total,
            p.skipped
        );
    } else {
        let line = format!(
            "{} | {} | {}",
            format!("成功: {}", p.completed).green(),
            format!("失败: {}", p.failed).red(),
            format!("跳过: {}", p.skipped).yellow()
        );
        println!("{}", line);
    }
}

fn print_grouped_report(items: &[(String, String)], color_fn: fn(ColoredString) -> ColoredString) {
    let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (filename, reason) in items {
        grouped.entry(reason).or_default().push(filename);
    }
    for (reason, mut filenames) in grouped {
        println!("  - {}", color_fn(format!("原因: {}", reason).into()));
        filenames.sort_unstable();
        for filename in filenames {
            println!("    - {}", filename);
        }
    }
}
