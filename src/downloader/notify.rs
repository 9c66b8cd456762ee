// src/downloader/notify.rs

use crate::{symbols, ui};
use colored::Colorize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// 展示层的通知出口。编排器只在批次开始、完成、取消时调用，且不等待它。
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str, level: NotifyLevel);
}

/// 在终端打印通知
#[derive(Default)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, message: &str, level: NotifyLevel) {
        let line = match level {
            NotifyLevel::Info => format!("{} {}", *symbols::INFO, message),
            NotifyLevel::Success => format!("{} {}", *symbols::OK, message.green()),
            NotifyLevel::Warning => format!("{} {}", *symbols::WARN, message.yellow()),
            NotifyLevel::Error => format!("{} {}", *symbols::ERROR, message.red()),
        };
        ui::plain(&line);
    }
}
