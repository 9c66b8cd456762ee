// src/config.rs

pub mod token;

use self::token::ConfigStore;
use crate::{cli::Cli, constants, error::AppResult};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkConfig {
    pub connect_timeout_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BatchConfig {
    pub group_size: Option<usize>,
}

/// 退避方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base * attempt`
    #[default]
    Linear,
    /// `base * 2^(attempt - 1)`
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub application_base_delay_ms: Option<u64>,
    pub transport_base_delay_ms: Option<u64>,
    #[serde(default)]
    pub strategy: BackoffStrategy,
    pub cooldown_markers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiConfig {
    pub base_url: Option<String>,
    pub authorize_path_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accesstoken: Option<String>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl ExternalConfig {
    pub(crate) fn default_app_config() -> Self {
        Self {
            accesstoken: None,
            network: NetworkConfig {
                connect_timeout_secs: Some(constants::network::CONNECT_TIMEOUT_SECS),
                timeout_secs: Some(constants::network::CALL_TIMEOUT_SECS),
            },
            batch: BatchConfig {
                group_size: Some(constants::batch::DEFAULT_GROUP_SIZE),
            },
            retry: RetryConfig {
                max_attempts: Some(constants::retry::MAX_ATTEMPTS),
                application_base_delay_ms: Some(constants::retry::APPLICATION_BASE_DELAY_MS),
                transport_base_delay_ms: Some(constants::retry::TRANSPORT_BASE_DELAY_MS),
                strategy: BackoffStrategy::Linear,
                cooldown_markers: Some(vec![constants::retry::COOLDOWN_MARKER.into()]),
            },
            api: ApiConfig {
                base_url: Some(constants::api::DEFAULT_BASE_URL.into()),
                authorize_path_template: Some(constants::api::AUTHORIZE_PATH_TEMPLATE.into()),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub group_size: usize,
    pub output_dir: PathBuf,
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// 单次网络调用的超时，超时按传输层失败处理
    pub timeout: Duration,
    pub max_attempts: u32,
    pub application_base_delay: Duration,
    pub transport_base_delay: Duration,
    pub backoff_strategy: BackoffStrategy,
    pub cooldown_markers: Vec<String>,
    pub api_base_url: String,
    pub authorize_path_template: String,
}

impl AppConfig {
    pub fn new(args: &Cli) -> AppResult<Self> {
        let external_config = ConfigStore::in_home()?.load_or_create()?;
        Ok(Self::from_external(external_config, args))
    }

    pub(crate) fn from_external(external_config: ExternalConfig, args: &Cli) -> Self {
        let ExternalConfig {
            network,
            batch,
            retry,
            api,
            ..
        } = external_config;

        Self {
            group_size: args
                .group_size
                .or(batch.group_size)
                .unwrap_or(constants::batch::DEFAULT_GROUP_SIZE)
                .max(1),
            output_dir: args.output.clone(),
            user_agent: constants::USER_AGENT.into(),
            connect_timeout: Duration::from_secs(
                network
                    .connect_timeout_secs
                    .unwrap_or(constants::network::CONNECT_TIMEOUT_SECS),
            ),
            timeout: Duration::from_secs(
                network
                    .timeout_secs
                    .unwrap_or(constants::network::CALL_TIMEOUT_SECS),
            ),
            max_attempts: retry
                .max_attempts
                .unwrap_or(constants::retry::MAX_ATTEMPTS)
                .max(1),
            application_base_delay: Duration::from_millis(
                retry
                    .application_base_delay_ms
                    .unwrap_or(constants::retry::APPLICATION_BASE_DELAY_MS),
            ),
            transport_base_delay: Duration::from_millis(
                retry
                    .transport_base_delay_ms
                    .unwrap_or(constants::retry::TRANSPORT_BASE_DELAY_MS),
            ),
            backoff_strategy: retry.strategy,
            cooldown_markers: retry
                .cooldown_markers
                .unwrap_or_else(|| vec![constants::retry::COOLDOWN_MARKER.into()]),
            api_base_url: args
                .server
                .clone()
                .or(api.base_url)
                .unwrap_or_else(|| constants::api::DEFAULT_BASE_URL.into()),
            authorize_path_template: api
                .authorize_path_template
                .unwrap_or_else(|| constants::api::AUTHORIZE_PATH_TEMPLATE.into()),
        }
    }

    /// 拼出某首曲目的授权接口地址
    pub fn authorize_url(&self, track_id: u64) -> String {
        let path = self
            .authorize_path_template
            .replace("{track_id}", &track_id.to_string());
        format!("{}{}", self.api_base_url.trim_end_matches('/'), path)
    }
}

#[cfg(feature = "testing")]
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            group_size: constants::batch::DEFAULT_GROUP_SIZE,
            output_dir: PathBuf::from(constants::DEFAULT_SAVE_DIR),
            user_agent: "test-agent/1.0".to_string(),
            connect_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(15),
            max_attempts: constants::retry::MAX_ATTEMPTS,
            application_base_delay: Duration::from_millis(1),
            transport_base_delay: Duration::from_millis(2),
            backoff_strategy: BackoffStrategy::Linear,
            cooldown_markers: vec![constants::retry::COOLDOWN_MARKER.to_string()],
            api_base_url: constants::api::DEFAULT_BASE_URL.to_string(),
            authorize_path_template: constants::api::AUTHORIZE_PATH_TEMPLATE.to_string(),
        }
    }
}
