// src/error.rs

use std::{fmt, time::Duration};
use thiserror::Error;

/// 授权接口拒绝下载时的具体原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailureKind {
    /// 冷却期内已下载过该曲目
    Cooldown,
    Forbidden,
    NotFound,
    /// 其他带结构化错误体的非 2xx 响应
    Rejected,
}

impl fmt::Display for AuthFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthFailureKind::Cooldown => "冷却期",
            AuthFailureKind::Forbidden => "无权限",
            AuthFailureKind::NotFound => "不存在",
            AuthFailureKind::Rejected => "被拒绝",
        };
        f.write_str(s)
    }
}

/// 重试策略所关心的错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 应用层拒绝 (带结构化错误体的非 2xx)
    Application,
    /// 传输层失败 (网络错误、超时、未预期的错误)
    Transport,
    Cooldown,
    Cancelled,
    /// 不应进入逐项重试流程的错误
    Fatal,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("未选择任何曲目")]
    EmptySelection,
    #[error("未登录或 Access Token 无效，无法开始批量下载")]
    Unauthenticated,
    #[error("下载授权失败 ({kind}): {message}")]
    AuthorizationFailed {
        kind: AuthFailureKind,
        message: String,
    },
    #[error("传输失败: {0}")]
    Transport(String),
    #[error("请求超时 ({0:?})")]
    Timeout(Duration),
    #[error("cancelled by user")]
    Cancelled,
    #[error("网络请求失败: {0}")]
    Network(#[from] reqwest::Error),
    #[error("网络中间件错误: {0}")]
    NetworkMiddleware(#[from] reqwest_middleware::Error),
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("临时文件持久化失败: {0}")]
    TempFilePersist(#[from] tempfile::PersistError),
    #[error("JSON 解析错误: {0}")]
    Json(#[from] serde_json::Error),
    #[error("无法解析来自 '{url}' 的API响应: {source}")]
    ApiParseFailed {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("URL 解析错误: {0}")]
    Url(#[from] url::ParseError),
    #[error("批次 '{0}' 不存在")]
    BatchNotFound(String),
    #[error("批次计数器不一致: {0}")]
    InvariantViolation(String),
    #[error("状态转换无效: {0}")]
    InvalidTransition(String),
    #[error("{0}")]
    UserInputError(String),
    #[error("未知错误: {0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            AppError::AuthorizationFailed {
                kind: AuthFailureKind::Cooldown,
                ..
            } => FailureClass::Cooldown,
            AppError::AuthorizationFailed { .. } => FailureClass::Application,
            AppError::Cancelled => FailureClass::Cancelled,
            AppError::EmptySelection
            | AppError::Unauthenticated
            | AppError::BatchNotFound(_)
            | AppError::InvariantViolation(_)
            | AppError::InvalidTransition(_)
            | AppError::UserInputError(_) => FailureClass::Fatal,
            _ => FailureClass::Transport,
        }
    }

    /// 用于冷却期标记匹配的原始错误信息
    pub fn detail_message(&self) -> String {
        match self {
            AppError::AuthorizationFailed { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
