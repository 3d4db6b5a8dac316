use std::fmt;
use tracing::{debug, error, info};
use crate::types::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// 单次转发运行的内存日志
///
/// 运行期间只收集，结束时一次性输出：成功时为 debug，失败时为 error。
#[derive(Debug, Clone)]
pub struct RunLog {
    name: String,
    prefix: String,
    lines: Vec<(LogLevel, String)>,
}

impl RunLog {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            lines: Vec::new(),
        }
    }

    /// 形如 `M2S/#7-doTransfer-A-Mainnet-->chain1`
    pub fn for_transfer(direction: Direction, loop_counter: u64, src: &str, dst: &str) -> Self {
        let short = format!("{}/#{} ", direction, loop_counter);
        Self::new(
            format!("{}/#{}-doTransfer-A-{}-->{}", direction, loop_counter, src, dst),
            format!("{}transfer loop from {} to {}: ", short, src, dst),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn push(&mut self, level: LogLevel, message: impl AsRef<str>) {
        self.lines
            .push((level, format!("{}{}", self.prefix, message.as_ref())));
    }

    pub fn trace(&mut self, message: impl AsRef<str>) {
        self.push(LogLevel::Trace, message);
    }

    pub fn debug(&mut self, message: impl AsRef<str>) {
        self.push(LogLevel::Debug, message);
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl AsRef<str>) {
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        self.push(LogLevel::Error, message);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        self.lines.iter().any(|(level, _)| *level == LogLevel::Error)
    }

    /// 存入错误记录的文本
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|(level, line)| format!("[{}] {}", level, line))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn flush(&self, success: bool, expose_details: bool) {
        if self.lines.is_empty() {
            return;
        }
        let text = self.text();
        if !success {
            error!("Details of {}:\n{}", self.name, text);
        } else if expose_details {
            info!("Details of {}:\n{}", self.name, text);
        } else {
            debug!("Details of {}:\n{}", self.name, text);
        }
    }
}
