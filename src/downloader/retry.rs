// src/downloader/retry.rs

use crate::{
    config::{AppConfig, BackoffStrategy},
    constants,
    error::{AppError, FailureClass},
};
use reqwest_retry::{
    Jitter, RetryDecision as BackoffDecision, RetryPolicy as _, policies::ExponentialBackoff,
};
use std::time::{Duration, SystemTime};

/// 一次失败之后的处理决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
    /// 冷却期跳过：不算成功，也不算失败
    pub counts_as_skip: bool,
}

impl RetryDecision {
    fn retry_after(delay: Duration) -> Self {
        Self { retry: true, delay, counts_as_skip: false }
    }

    fn give_up() -> Self {
        Self { retry: false, delay: Duration::ZERO, counts_as_skip: false }
    }

    fn skip() -> Self {
        Self { retry: false, delay: Duration::ZERO, counts_as_skip: true }
    }
}

/// 逐项重试策略。纯函数：(第几次尝试, 错误) -> 决定。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    application_base: Duration,
    transport_base: Duration,
    strategy: BackoffStrategy,
    cooldown_markers: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(
            constants::retry::MAX_ATTEMPTS,
            Duration::from_millis(constants::retry::APPLICATION_BASE_DELAY_MS),
            Duration::from_millis(constants::retry::TRANSPORT_BASE_DELAY_MS),
        )
    }
}

impl RetryPolicy {
    pub fn linear(max_attempts: u32, application_base: Duration, transport_base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            application_base,
            transport_base,
            strategy: BackoffStrategy::Linear,
            cooldown_markers: vec![constants::retry::COOLDOWN_MARKER.to_lowercase()],
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::linear(
            config.max_attempts,
            config.application_base_delay,
            config.transport_base_delay,
        )
        .with_strategy(config.backoff_strategy)
        .with_cooldown_markers(&config.cooldown_markers)
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_cooldown_markers(mut self, markers: &[String]) -> Self {
        self.cooldown_markers = markers
            .iter()
            .map(|m| m.trim().to_lowercase())
            .filter(|m| !m.is_empty())
            .collect();
        self
    }

    /// 错误是否表示冷却期 (显式的 Cooldown 类型，或错误信息中包含冷却标记)
    pub fn is_cooldown(&self, error: &AppError) -> bool {
        if error.failure_class() == FailureClass::Cooldown {
            return true;
        }
        let message = error.detail_message().to_lowercase();
        self.cooldown_markers.iter().any(|m| message.contains(m.as_str()))
    }

    /// `attempt` 从 1 开始，表示刚刚失败的是第几次尝试。
    pub fn decide(&self, attempt: u32, error: &AppError) -> RetryDecision {
        if self.is_cooldown(error) {
            return RetryDecision::skip();
        }
        let base = match error.failure_class() {
            FailureClass::Application => self.application_base,
            FailureClass::Transport => self.transport_base,
            FailureClass::Cooldown | FailureClass::Cancelled | FailureClass::Fatal => {
                return RetryDecision::give_up();
            }
        };
        if attempt >= self.max_attempts {
            return RetryDecision::give_up();
        }
        RetryDecision::retry_after(self.backoff(attempt, base))
    }

    fn backoff(&self, attempt: u32, base: Duration) -> Duration {
        match self.strategy {
            BackoffStrategy::Linear => base * attempt.max(1),
            BackoffStrategy::Exponential => {
                let ceiling = base * 2u32.saturating_pow(self.max_attempts);
                let policy = ExponentialBackoff::builder()
                    .retry_bounds(base, ceiling)
                    .jitter(Jitter::None)
                    .base(2)
                    .build_with_max_retries(self.max_attempts);
                let now = SystemTime::now();
                match policy.should_retry(now, attempt.saturating_sub(1)) {
                    BackoffDecision::Retry { execute_after } => {
                        execute_after.duration_since(now).unwrap_or(base)
                    }
                    BackoffDecision::DoNotRetry => base * attempt.max(1),
                }
            }
        }
    }
}
