// src/lib.rs

pub mod cli;
pub mod client;
pub mod config;
pub mod constants;
pub mod downloader;
pub mod error;
pub mod models;
pub mod symbols;
pub mod ui;
pub mod utils;

use crate::{
    cli::Cli,
    client::RobustClient,
    config::{
        AppConfig,
        token::{ConfigStore, ResolvedToken, TokenSource, resolve_token},
    },
    downloader::{
        BatchEvent, BatchOrchestrator, ConsoleNotifier, DirectorySink, HttpAuthorizer,
        HttpFetcher, OrchestratorDeps, OrchestratorSettings, TokenIdentity,
    },
    error::{AppError, AppResult},
    models::{BatchStatus, ItemOutcome, Track},
};
use anyhow::anyhow;
use colored::*;
use log::{debug, info, warn};
use std::{path::Path, sync::Arc};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// 用真实的 HTTP 授权与下载、目录保存和终端通知组装编排器
pub fn build_orchestrator(
    config: Arc<AppConfig>,
    client: Arc<RobustClient>,
    token: Option<String>,
) -> BatchOrchestrator {
    let deps = OrchestratorDeps {
        authorizer: Arc::new(HttpAuthorizer::new(client.clone())),
        fetcher: Arc::new(HttpFetcher::new(client)),
        sink: Arc::new(DirectorySink::new(&config.output_dir)),
        identity: Arc::new(TokenIdentity::new(token)),
        notifier: Arc::new(ConsoleNotifier),
    };
    BatchOrchestrator::new(deps, OrchestratorSettings::from_config(&config))
}

/// 库的公共入口点，由 `main.rs` 调用。`interrupt` 在用户按下 Ctrl+C 时被触发。
pub async fn run_from_cli(args: Arc<Cli>, interrupt: CancellationToken) -> AppResult<()> {
    debug!("CLI 参数: {:?}", args);
    if args.token_help {
        ui::box_message(
            "获取 Access Token 指南",
            constants::HELP_TOKEN_GUIDE
                .lines()
                .collect::<Vec<_>>()
                .as_slice(),
            |s| s.cyan(),
        );
        println!(
            "\n{} 安全提醒: 请妥善保管你的 Token，不要分享给他人。",
            *symbols::INFO
        );
        return Ok(());
    }

    let config = Arc::new(AppConfig::new(&args)?);
    debug!("加载的应用配置: {:?}", config);

    let store = ConfigStore::in_home()?;
    let token = match resolve_token(args.token.as_deref(), &store) {
        Some(ResolvedToken { value, source }) => {
            info!("从 {} 加载 Access Token", source);
            println!("\n{} 已从 {} 加载 Access Token。", *symbols::INFO, source);
            if args.save_token && source != TokenSource::ConfigFile {
                store.save_token(&value)?;
                println!(
                    "{} Token 已保存至: {}",
                    *symbols::OK,
                    store.path().display()
                );
            }
            Some(value)
        }
        None => {
            info!("未找到本地 Access Token");
            println!(
                "\n{}",
                format!(
                    "{} 未找到 Access Token，请使用 --token 或设置环境变量 {}。",
                    *symbols::WARN,
                    constants::TOKEN_ENV_VAR
                )
                .yellow()
            );
            None
        }
    };

    let client = Arc::new(RobustClient::new(config.clone(), token.clone())?);
    let orchestrator = build_orchestrator(config, client, token);

    if let Some(batch_file) = &args.batch_file {
        run_batch_file(batch_file, &args, &orchestrator, &interrupt).await
    } else if let Some(track_id) = args.track {
        run_single_track(track_id, &args, &orchestrator, &interrupt).await
    } else {
        Err(AppError::UserInputError("未指定运行模式".to_string()))
    }
}

async fn run_batch_file(
    batch_file: &Path,
    args: &Cli,
    orchestrator: &BatchOrchestrator,
    interrupt: &CancellationToken,
) -> AppResult<()> {
    let content = std::fs::read_to_string(batch_file).map_err(|e| {
        log::error!("读取批量文件 '{}' 失败: {}", batch_file.display(), e);
        AppError::from(e)
    })?;
    let tracks = utils::parse_track_list(&content)?;
    ui::print_header(&format!(
        "开始批量下载 '{}' (按 {} 可取消)",
        args.name,
        *symbols::CTRL_C
    ));

    // 先订阅，避免错过后台任务最早发出的事件
    let mut events = orchestrator.bridge().subscribe();
    let handle = orchestrator.start_batch(tracks, &args.name, &args.page_id, &args.page_label)?;
    let batch_id = handle.batch_id.clone();
    let total = orchestrator
        .get_batch(&batch_id)
        .map(|b| b.progress.total)
        .unwrap_or_default();

    let pbar = ui::new_tasks_progress_bar(total as u64, "下载");
    let wait = handle.wait();
    tokio::pin!(wait);
    let mut cancel_requested = false;
    let mut events_open = true;

    let summary = loop {
        tokio::select! {
            summary = &mut wait => break summary?,
            _ = interrupt.cancelled(), if !cancel_requested => {
                cancel_requested = true;
                warn!("用户请求取消批次 '{}'", batch_id);
                pbar.set_message("正在取消...");
                orchestrator.cancel_batch(&batch_id);
            }
            event = events.recv(), if events_open => match event {
                Ok(BatchEvent::ItemSettled { batch_id: id, progress, .. }) if id == batch_id => {
                    pbar.set_position(progress.settled() as u64);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => events_open = false,
            },
        }
    };
    pbar.finish_and_clear();

    downloader::print_report(&summary);
    match summary.status {
        BatchStatus::Cancelled => Err(AppError::Cancelled),
        _ if summary.progress.failed > 0 => Err(AppError::Other(anyhow!(
            "{} 首曲目下载失败。",
            summary.progress.failed
        ))),
        _ => Ok(()),
    }
}

async fn run_single_track(
    track_id: u64,
    args: &Cli,
    orchestrator: &BatchOrchestrator,
    interrupt: &CancellationToken,
) -> AppResult<()> {
    let track = Track {
        id: track_id,
        display_name: args.title.clone().unwrap_or_default(),
        artist: args.artist.clone().unwrap_or_default(),
        source_url: args.source_url.clone().unwrap_or_default(),
    };
    let filename = utils::suggested_filename(&track);
    ui::print_sub_header(&format!(
        "下载曲目 {} - {}",
        track_id,
        utils::truncate_text(&filename, constants::FILENAME_TRUNCATE_LENGTH)
    ));

    let outcome = tokio::select! {
        outcome = orchestrator.download_single(track) => outcome?,
        _ = interrupt.cancelled() => return Err(AppError::Cancelled),
    };
    let (symbol, color, label) = outcome.status().get_display_info();
    match &outcome {
        ItemOutcome::Completed => {
            println!("{} {}: {}", symbol, color(label.into()), filename);
            Ok(())
        }
        ItemOutcome::Skipped(reason) => {
            println!("{} {}: {}", symbol, color(label.into()), reason);
            Ok(())
        }
        ItemOutcome::Failed(reason) => {
            println!("{} {}: {}", symbol, color(label.into()), reason);
            Err(AppError::Other(anyhow!("曲目 {} 下载失败: {}", track_id, reason)))
        }
    }
}
