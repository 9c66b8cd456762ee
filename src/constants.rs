// src/constants.rs

pub const UI_WIDTH: usize = 88;
pub const FILENAME_TRUNCATE_LENGTH: usize = 50;
pub const MAX_FILENAME_BYTES: usize = 200;
pub const CONFIG_DIR_NAME: &str = concat!(".", clap::crate_name!());
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const LOG_FILE_NAME: &str = "track-dl.log";
pub const LOG_FALLBACK_FILE_NAME: &str = "fallback.log";
pub const TOKEN_ENV_VAR: &str = "TRACK_DL_TOKEN";
pub const DEFAULT_SAVE_DIR: &str = "downloads";
pub const DEFAULT_BATCH_NAME: &str = "批量下载";
pub const DEFAULT_PAGE_ID: &str = "/cli";
pub const DEFAULT_PAGE_LABEL: &str = "命令行";
pub const DEFAULT_AUDIO_EXT: &str = "mp3";
pub const USER_AGENT: &str = concat!(clap::crate_name!(), "/", clap::crate_version!());

pub const CANCELLED_BY_USER: &str = "cancelled by user";

pub mod batch {
    /// 每组同时进行的网络操作上限
    pub const DEFAULT_GROUP_SIZE: usize = 10;
}

pub mod retry {
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const APPLICATION_BASE_DELAY_MS: u64 = 1000;
    pub const TRANSPORT_BASE_DELAY_MS: u64 = 2000;
    pub const COOLDOWN_MARKER: &str = "already downloaded in the last 24 hours";
}

pub mod network {
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;
    pub const CALL_TIMEOUT_SECS: u64 = 30;
}

pub mod api {
    pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";
    pub const AUTHORIZE_PATH_TEMPLATE: &str = "/api/tracks/{track_id}/download";
}

pub const HELP_TOKEN_GUIDE: &str = r#"
1. 在浏览器中登录曲库站点。
2. 打开 "账户设置" -> "API 访问"。
3. 点击 "生成 Access Token"，复制生成的字符串。
4. 通过以下任一方式提供给本工具:
   - 命令行参数:   --token <TOKEN>
   - 环境变量:     TRACK_DL_TOKEN=<TOKEN>
   - 配置文件:     ~/.track-dl/config.json 中的 "accesstoken" 字段
5. 没有 Token 时无法开始批量下载。"#;
