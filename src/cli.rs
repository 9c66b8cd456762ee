// src/cli.rs

use crate::constants;
use clap::{Parser, ValueEnum, crate_version};
use std::path::PathBuf;

/// 定义日志输出级别
#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    version = crate_version!(),
    about,
    long_about = None,
    arg_required_else_help = true,
    disable_help_flag = true,
    disable_version_flag = true,
)]
#[command(group(
    clap::ArgGroup::new("mode")
        .required(true)
        .args(&["batch_file", "track", "token_help"]),
))]
pub struct Cli {
    // --- 运行模式 (Mode) ---
    /// 从文件批量下载曲目 (JSON 数组，或每行 `id<TAB>曲名<TAB>艺人<TAB>地址`)
    #[arg(short, long, value_name = "FILE", help_heading = "Mode")]
    pub batch_file: Option<PathBuf>,
    /// 单独下载一首曲目 (需配合 --source-url 使用)
    #[arg(long, value_name = "ID", help_heading = "Mode", requires = "source_url")]
    pub track: Option<u64>,
    /// 显示如何获取 Access Token 的指南并退出
    #[arg(long, action = clap::ArgAction::SetTrue, help_heading = "Mode")]
    pub token_help: bool,

    // --- 下载选项 (Options) ---
    /// [单曲模式] 曲目的源地址，用于推断文件扩展名
    #[arg(long, value_name = "URL", help_heading = "Options")]
    pub source_url: Option<String>,
    /// [单曲模式] 曲目名称
    #[arg(long, help_heading = "Options")]
    pub title: Option<String>,
    /// [单曲模式] 艺人
    #[arg(long, help_heading = "Options")]
    pub artist: Option<String>,
    /// 批次名称
    #[arg(long, default_value_t = constants::DEFAULT_BATCH_NAME.to_string(), help_heading = "Options")]
    pub name: String,
    /// 发起批次的来源页面 ID
    #[arg(long, default_value_t = constants::DEFAULT_PAGE_ID.to_string(), help_heading = "Options")]
    pub page_id: String,
    /// 来源页面的显示名称
    #[arg(long, default_value_t = constants::DEFAULT_PAGE_LABEL.to_string(), help_heading = "Options")]
    pub page_label: String,
    /// 曲库服务地址，覆盖配置文件中的 api.base_url
    #[arg(long, value_name = "URL", help_heading = "Options")]
    pub server: Option<String>,
    /// 提供访问令牌 (Access Token)，优先级最高
    #[arg(long, help_heading = "Options")]
    pub token: Option<String>,
    /// 将 --token 提供的 Token 保存到配置文件
    #[arg(long, action = clap::ArgAction::SetTrue, requires = "token", help_heading = "Options")]
    pub save_token: bool,
    /// 每组并发下载数
    #[arg(short = 'g', long, value_parser = clap::value_parser!(usize), help_heading = "Options")]
    pub group_size: Option<usize>,
    /// 设置文件保存目录
    #[arg(short, long, value_name = "DIR", default_value_os_t = PathBuf::from(constants::DEFAULT_SAVE_DIR), help_heading = "Options")]
    pub output: PathBuf,

    // --- 通用选项 (General) ---
    /// 显示此帮助信息并退出
    #[arg(short = 'h', long, action = clap::ArgAction::Help, global = true, help_heading = "General")]
    _help: Option<bool>,
    /// 显示版本信息并退出
    #[arg(short = 'V', long, action = clap::ArgAction::Version, global = true, help_heading = "General")]
    _version: Option<bool>,
    /// (隐藏参数) 设置日志文件的输出级别，用于调试
    #[arg(long, value_enum, default_value_t = LogLevel::Off, global = true, hide = true)]
    pub log_level: LogLevel,
}
