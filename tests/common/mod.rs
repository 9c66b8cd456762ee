// tests/common/mod.rs

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use track_dl::{
    downloader::{
        Authorizer, BatchOrchestrator, CurrentUser, DownloadAuthorization, Fetcher, Notifier,
        NotifyLevel, OrchestratorDeps, OrchestratorSettings, RetryPolicy, SaveSink,
        fetcher::ProgressFn,
    },
    error::{AppError, AppResult, AuthFailureKind},
    models::{Track, UserIdentity},
};

pub const PAGE: &str = "/playlist/7";

pub fn track(id: u64) -> Track {
    Track {
        id,
        display_name: format!("Song {}", id),
        artist: "Band".to_string(),
        source_url: format!("https://cdn.example/audio/{}.mp3", id),
    }
}

pub fn tracks(ids: impl IntoIterator<Item = u64>) -> Vec<Track> {
    ids.into_iter().map(track).collect()
}

/// 授权失败的种类，每次调用都生成新的错误
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Transport,
    Forbidden,
    Cooldown,
}

impl Failure {
    fn error(self) -> AppError {
        match self {
            Failure::Transport => AppError::Transport("connection reset".into()),
            Failure::Forbidden => AppError::AuthorizationFailed {
                kind: AuthFailureKind::Forbidden,
                message: "license revoked".into(),
            },
            Failure::Cooldown => AppError::AuthorizationFailed {
                kind: AuthFailureKind::Rejected,
                message: "Track already downloaded in the last 24 hours".into(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Script {
    FailTimes(u32, Failure),
    Always(Failure),
}

#[derive(Default)]
pub struct FakeAuthorizer {
    scripts: Mutex<HashMap<u64, Script>>,
    calls: Mutex<HashMap<u64, u32>>,
}

impl FakeAuthorizer {
    pub fn fail_times(&self, track_id: u64, times: u32, failure: Failure) {
        self.scripts.lock().unwrap().insert(track_id, Script::FailTimes(times, failure));
    }

    pub fn always_fail(&self, track_id: u64, failure: Failure) {
        self.scripts.lock().unwrap().insert(track_id, Script::Always(failure));
    }

    pub fn calls(&self, track_id: u64) -> u32 {
        self.calls.lock().unwrap().get(&track_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Authorizer for FakeAuthorizer {
    async fn authorize(&self, track_id: u64) -> AppResult<DownloadAuthorization> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(track_id).or_insert(0);
            *n += 1;
            *n
        };
        let script = self.scripts.lock().unwrap().get(&track_id).copied();
        match script {
            Some(Script::FailTimes(times, failure)) if call <= times => Err(failure.error()),
            Some(Script::Always(failure)) => Err(failure.error()),
            _ => Ok(DownloadAuthorization {
                track_id,
                download_url: format!("https://cdn.example/signed/{}", track_id),
            }),
        }
    }
}

/// 记录并发度和被下载的曲目；可让指定曲目在闸门处等待，或按脚本返回网络错误
#[derive(Default)]
pub struct FakeFetcher {
    pub delay: Duration,
    gate: Option<(Arc<Semaphore>, HashSet<u64>)>,
    current: AtomicUsize,
    max_seen: AtomicUsize,
    fetched: Mutex<Vec<u64>>,
    /// 曲目 -> 剩余的失败次数
    failures: Mutex<HashMap<u64, u32>>,
    calls: Mutex<HashMap<u64, u32>>,
}

impl FakeFetcher {
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay, ..Default::default() }
    }

    pub fn gated(gate: Arc<Semaphore>, ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            gate: Some((gate, ids.into_iter().collect())),
            ..Default::default()
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }

    pub fn fetched(&self) -> Vec<u64> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn fail_times(&self, track_id: u64, times: u32) {
        self.failures.lock().unwrap().insert(track_id, times);
    }

    pub fn always_fail(&self, track_id: u64) {
        self.fail_times(track_id, u32::MAX);
    }

    pub fn calls(&self, track_id: u64) -> u32 {
        self.calls.lock().unwrap().get(&track_id).copied().unwrap_or(0)
    }

    fn scripted_failure(&self, track_id: u64) -> Option<AppError> {
        *self.calls.lock().unwrap().entry(track_id).or_insert(0) += 1;
        let mut failures = self.failures.lock().unwrap();
        let remaining = failures.get_mut(&track_id).filter(|n| **n > 0)?;
        if *remaining != u32::MAX {
            *remaining -= 1;
        }
        Some(AppError::Transport(format!("stream reset while fetching {}", track_id)))
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
        on_progress: &ProgressFn<'_>,
    ) -> AppResult<Bytes> {
        let track_id: u64 = url.rsplit('/').next().unwrap().parse().unwrap();
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);

        let result = async {
            if let Some(err) = self.scripted_failure(track_id) {
                return Err(err);
            }
            if let Some((gate, ids)) = &self.gate
                && ids.contains(&track_id)
            {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AppError::Cancelled),
                    permit = gate.acquire() => drop(permit),
                }
            }
            if !self.delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AppError::Cancelled),
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }
            on_progress(50);
            on_progress(100);
            self.fetched.lock().unwrap().push(track_id);
            Ok(Bytes::from(format!("audio-{}", track_id)))
        }
        .await;

        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// 只记录文件名；可在第 N 次保存时取消所在页面的进行中批次
#[derive(Default)]
pub struct RecordingSink {
    saved: Mutex<Vec<String>>,
    count: AtomicUsize,
    cancel_on: Option<usize>,
    orchestrator: OnceLock<BatchOrchestrator>,
}

impl RecordingSink {
    pub fn cancelling_on(save_number: usize) -> Self {
        Self {
            cancel_on: Some(save_number),
            ..Default::default()
        }
    }

    pub fn attach(&self, orchestrator: BatchOrchestrator) {
        let _ = self.orchestrator.set(orchestrator);
    }

    pub fn saved(&self) -> Vec<String> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl SaveSink for RecordingSink {
    async fn save(&self, _bytes: Bytes, suggested_filename: &str) -> AppResult<PathBuf> {
        self.saved.lock().unwrap().push(suggested_filename.to_string());
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.cancel_on == Some(n)
            && let Some(orchestrator) = self.orchestrator.get()
            && let Some(batch) = orchestrator.get_active_batch_for_page(PAGE)
        {
            orchestrator.cancel_batch(&batch.id);
        }
        Ok(PathBuf::from(suggested_filename))
    }
}

pub struct FakeUser(pub bool);

impl CurrentUser for FakeUser {
    fn current_user(&self) -> Option<UserIdentity> {
        self.0.then(|| UserIdentity { token_hint: "tok…".into() })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(String, NotifyLevel)>>,
}

impl RecordingNotifier {
    pub fn count(&self, level: NotifyLevel) -> usize {
        self.messages.lock().unwrap().iter().filter(|(_, l)| *l == level).count()
    }

    pub fn messages(&self) -> Vec<(String, NotifyLevel)> {
        self.messages.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str, level: NotifyLevel) {
        self.messages.lock().unwrap().push((message.to_string(), level));
    }
}

/// 轮询直到条件成立，最多等待 5 秒
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub struct Harness {
    pub orchestrator: BatchOrchestrator,
    pub authorizer: Arc<FakeAuthorizer>,
    pub fetcher: Arc<FakeFetcher>,
    pub sink: Arc<RecordingSink>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        group_size: 10,
        call_timeout: Duration::from_secs(5),
        policy: RetryPolicy::linear(3, Duration::from_millis(1), Duration::from_millis(2)),
    }
}

pub fn harness(fetcher: FakeFetcher, sink: RecordingSink) -> Harness {
    harness_with(fetcher, sink, true, settings())
}

pub fn harness_with(
    fetcher: FakeFetcher,
    sink: RecordingSink,
    logged_in: bool,
    settings: OrchestratorSettings,
) -> Harness {
    let authorizer = Arc::new(FakeAuthorizer::default());
    let fetcher = Arc::new(fetcher);
    let sink = Arc::new(sink);
    let notifier = Arc::new(RecordingNotifier::default());
    let deps = OrchestratorDeps {
        authorizer: authorizer.clone(),
        fetcher: fetcher.clone(),
        sink: sink.clone(),
        identity: Arc::new(FakeUser(logged_in)),
        notifier: notifier.clone(),
    };
    let orchestrator = BatchOrchestrator::new(deps, settings);
    sink.attach(orchestrator.clone());
    Harness {
        orchestrator,
        authorizer,
        fetcher,
        sink,
        notifier,
    }
}
