// src/config/token.rs

use crate::{
    config::ExternalConfig,
    constants,
    error::{AppError, AppResult},
};
use anyhow::{Context, anyhow};
use log::{debug, info, warn};
use std::{
    fmt, fs,
    io::Write as IoWrite,
    path::{Path, PathBuf},
};

/// Access Token 的来源，按优先级从高到低排列
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    CommandLine,
    Environment,
    ConfigFile,
}

impl fmt::Display for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenSource::CommandLine => write!(f, "命令行参数"),
            TokenSource::Environment => write!(f, "环境变量 ({})", constants::TOKEN_ENV_VAR),
            TokenSource::ConfigFile => write!(f, "本地配置文件"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedToken {
    pub value: String,
    pub source: TokenSource,
}

/// 配置文件的读写入口。默认位于 `~/.track-dl/config.json`。
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_home() -> AppResult<Self> {
        let dir = dirs::home_dir()
            .ok_or_else(|| AppError::Other(anyhow!("无法获取用户主目录")))?
            .join(constants::CONFIG_DIR_NAME);
        Ok(Self::at(dir.join(constants::CONFIG_FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取配置；文件不存在时先写入一份默认配置
    pub fn load_or_create(&self) -> AppResult<ExternalConfig> {
        if self.path.is_file() {
            return self.read();
        }
        info!("配置文件 {:?} 不存在，将创建默认配置。", self.path);
        let config = ExternalConfig::default_app_config();
        self.write(&config)?;
        Ok(config)
    }

    /// 只读取已保存的 Token，不会创建配置文件
    pub fn stored_token(&self) -> Option<String> {
        if !self.path.is_file() {
            return None;
        }
        match self.read() {
            Ok(config) => config.accesstoken.as_deref().and_then(non_empty),
            Err(e) => {
                warn!("无法从配置文件读取 Token: {}", e);
                None
            }
        }
    }

    /// 保存 Token，保留配置文件中的其他字段
    pub fn save_token(&self, token: &str) -> AppResult<()> {
        let Some(token) = non_empty(token) else {
            return Ok(());
        };
        let mut config = self.load_or_create()?;
        config.accesstoken = Some(token);
        self.write(&config).map_err(|e| {
            AppError::Other(anyhow!("保存 Token 到 '{}' 失败: {}", self.path.display(), e))
        })?;
        info!("用户已将 Token 保存至配置文件: {}", self.path.display());
        Ok(())
    }

    fn read(&self) -> AppResult<ExternalConfig> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("读取配置文件 '{}' 失败", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件 '{}' 失败", self.path.display()))
            .map_err(AppError::from)
    }

    /// 写入同目录的临时文件后替换，中途失败不会留下半个配置文件
    fn write(&self, config: &ExternalConfig) -> AppResult<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(serde_json::to_string_pretty(config)?.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.path)?;
        debug!("已写入配置文件 {:?}", self.path);
        Ok(())
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// 按 命令行参数 > 环境变量 > 配置文件 的顺序解析 Access Token
pub fn resolve_token(cli_token: Option<&str>, store: &ConfigStore) -> Option<ResolvedToken> {
    let env_token = std::env::var(constants::TOKEN_ENV_VAR).ok();
    resolve_from(cli_token, env_token.as_deref(), store)
}

fn resolve_from(
    cli_token: Option<&str>,
    env_token: Option<&str>,
    store: &ConfigStore,
) -> Option<ResolvedToken> {
    let found = cli_token
        .and_then(non_empty)
        .map(|value| (value, TokenSource::CommandLine))
        .or_else(|| env_token.and_then(non_empty).map(|value| (value, TokenSource::Environment)))
        .or_else(|| store.stored_token().map(|value| (value, TokenSource::ConfigFile)));

    match found {
        Some((value, source)) => {
            debug!("使用来自 {} 的 Token", source);
            Some(ResolvedToken { value, source })
        }
        None => {
            debug!("未在任何位置找到可用的 Token");
            None
        }
    }
}
