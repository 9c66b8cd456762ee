// src/downloader/auth.rs

use crate::{
    client::RobustClient,
    error::*,
    models::{
        UserIdentity,
        api::{ApiErrorBody, AuthorizeResponse},
    },
};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::StatusCode;
use std::sync::Arc;
use url::Url;

/// 授权接口返回的限时下载地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadAuthorization {
    pub track_id: u64,
    pub download_url: String,
}

/// 调用 "authorize download" 接口。服务端会顺带记录下载，需能安全地重试。
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, track_id: u64) -> AppResult<DownloadAuthorization>;
}

/// 当前会话的用户，仅用于拒绝未登录的批量下载请求
pub trait CurrentUser: Send + Sync {
    fn current_user(&self) -> Option<UserIdentity>;
}

/// 以解析到的 Access Token 作为登录凭据
pub struct TokenIdentity {
    token: Option<String>,
}

impl TokenIdentity {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }
}

impl CurrentUser for TokenIdentity {
    fn current_user(&self) -> Option<UserIdentity> {
        self.token.as_ref().map(|token| UserIdentity {
            token_hint: format!("{}…", token.chars().take(4).collect::<String>()),
        })
    }
}

pub struct HttpAuthorizer {
    client: Arc<RobustClient>,
}

impl HttpAuthorizer {
    pub fn new(client: Arc<RobustClient>) -> Self {
        Self { client }
    }

    fn classify(&self, status: StatusCode, reason: Option<String>) -> AppError {
        let is_cooldown_reason = reason.as_deref().is_some_and(|r| {
            let r = r.to_lowercase();
            self.client
                .config()
                .cooldown_markers
                .iter()
                .any(|m| r.contains(&m.to_lowercase()))
        });
        let Some(message) = reason else {
            // 没有结构化错误体的 5xx 视为传输层失败
            if status.is_server_error() {
                return AppError::Transport(format!("服务器返回 {}", status));
            }
            return AppError::AuthorizationFailed {
                kind: kind_for_status(status),
                message: status.to_string(),
            };
        };
        let kind = if is_cooldown_reason {
            AuthFailureKind::Cooldown
        } else {
            kind_for_status(status)
        };
        AppError::AuthorizationFailed { kind, message }
    }
}

fn kind_for_status(status: StatusCode) -> AuthFailureKind {
    match status {
        StatusCode::TOO_MANY_REQUESTS => AuthFailureKind::Cooldown,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AuthFailureKind::Forbidden,
        StatusCode::NOT_FOUND => AuthFailureKind::NotFound,
        _ => AuthFailureKind::Rejected,
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn authorize(&self, track_id: u64) -> AppResult<DownloadAuthorization> {
        let url = self.client.config().authorize_url(track_id);
        debug!("请求曲目 {} 的下载授权: {}", track_id, url);
        let res = self.client.post(&url).send().await?;
        let status = res.status();
        let body = res.text().await?;

        if status.is_success() {
            let parsed: AuthorizeResponse =
                serde_json::from_str(&body).map_err(|source| AppError::ApiParseFailed {
                    url: url.clone(),
                    source,
                })?;
            // 服务端可能返回相对路径
            let download_url = Url::parse(&url)?.join(&parsed.download_url)?.to_string();
            return Ok(DownloadAuthorization {
                track_id,
                download_url,
            });
        }

        let reason = serde_json::from_str::<ApiErrorBody>(&body)
            .ok()
            .and_then(|b| b.reason().map(str::to_string));
        let err = self.classify(status, reason);
        warn!("曲目 {} 的下载授权被拒绝 ({}): {}", track_id, status, err);
        Err(err)
    }
}
