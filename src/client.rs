// src/client.rs

use crate::{config::AppConfig, error::*};
use reqwest::{IntoUrl, header};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use std::sync::Arc;

/// 带超时和认证头的 HTTP 客户端。
///
/// 这里不挂载重试中间件：重试由逐项的重试策略负责，避免两层重试叠加。
#[derive(Clone)]
pub struct RobustClient {
    pub client: ClientWithMiddleware,
    token: Option<String>,
    config: Arc<AppConfig>,
}

impl RobustClient {
    pub fn new(config: Arc<AppConfig>, token: Option<String>) -> AppResult<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.group_size * 2)
            .build()?;
        let client = ClientBuilder::new(inner).build();

        Ok(Self {
            client,
            token: token.filter(|t| !t.is_empty()),
            config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn with_auth(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.header(header::AUTHORIZATION, format!("Bearer {}", token)),
            None => builder,
        }
    }

    pub fn get<T: IntoUrl>(&self, url: T) -> RequestBuilder {
        self.with_auth(self.client.get(url))
    }

    pub fn post<T: IntoUrl>(&self, url: T) -> RequestBuilder {
        self.with_auth(self.client.post(url))
    }
}
