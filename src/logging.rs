//! # Packet Logging
//!
//! Optional hook that receives request/response packet dumps from a client.
//! Without a callback the messages go to `tracing`.
//!
//! | Mode | Output |
//! |------|--------|
//! | `Disabled` | nothing |
//! | `Summary` | command, session handle, payload length |
//! | `Full` | summary plus a hex dump of the payload |

use std::fmt::{self, Write as _};
use std::sync::Arc;

use chrono::Local;

use crate::encapsulation::Command;

/// Severity attached to a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingMode {
    Disabled,
    #[default]
    Summary,
    Full,
}

/// Receives formatted log lines
pub type LogCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Packet logger with a level filter
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<LogCallback>,
    level: LogLevel,
    mode: LoggingMode,
}

impl fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("callback", &self.callback.is_some())
            .field("level", &self.level)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self {
            callback: None,
            level: LogLevel::Debug,
            mode: LoggingMode::Summary,
        }
    }
}

impl CallbackLogger {
    pub fn new(callback: LogCallback, level: LogLevel) -> Self {
        Self {
            callback: Some(callback),
            level,
            mode: LoggingMode::Summary,
        }
    }

    /// Print timestamped lines to stdout
    pub fn console(level: LogLevel) -> Self {
        Self::new(
            Arc::new(|level, message| {
                println!("{} [{}] {}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"), level, message);
            }),
            level,
        )
    }

    pub fn disabled() -> Self {
        Self::default().with_mode(LoggingMode::Disabled)
    }

    pub fn with_mode(mut self, mode: LoggingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    pub fn is_enabled(&self, level: LogLevel) -> bool {
        self.mode != LoggingMode::Disabled && level <= self.level
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if !self.is_enabled(level) {
            return;
        }
        match &self.callback {
            Some(callback) => callback(level, message),
            None => match level {
                LogLevel::Error => tracing::error!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Trace => tracing::trace!("{}", message),
            },
        }
    }

    pub fn log_request(&self, command: Command, session_handle: u32, payload: &[u8]) {
        if self.is_enabled(LogLevel::Debug) {
            self.log(LogLevel::Debug, &self.format_packet("->", command, session_handle, payload));
        }
    }

    pub fn log_response(&self, command: Command, session_handle: u32, payload: &[u8]) {
        if self.is_enabled(LogLevel::Debug) {
            self.log(LogLevel::Debug, &self.format_packet("<-", command, session_handle, payload));
        }
    }

    fn format_packet(&self, direction: &str, command: Command, session_handle: u32, payload: &[u8]) -> String {
        let mut line = format!(
            "{} {} session=0x{:08X} len={}",
            direction,
            command,
            session_handle,
            payload.len()
        );
        if self.mode == LoggingMode::Full && !payload.is_empty() {
            line.push_str(" data=");
            line.push_str(&hex_dump(payload));
        }
        line
    }
}

/// Space-separated uppercase hex
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", byte);
    }
    out
}
