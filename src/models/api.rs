// src/models/api.rs

use serde::Deserialize;

// --- 授权接口 (authorize download) 响应结构体 ---

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    #[serde(alias = "downloadURL", alias = "url")]
    pub download_url: String,
}

/// 非 2xx 响应的结构化错误体，服务端在 `error` 或 `message` 中给出原因
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ApiErrorBody {
    pub error: Option<String>,
    pub message: Option<String>,
    pub code: Option<String>,
}

impl ApiErrorBody {
    pub fn reason(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or(self.message.as_deref())
            .filter(|s| !s.trim().is_empty())
    }
}
