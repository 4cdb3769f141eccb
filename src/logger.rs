//! Level-filtered line logger shared by the pool manager and its workers.
//!
//! Every event becomes one newline-terminated line on the sink (stdout by
//! default), written with a single `write` call: after a fork the parent
//! and its children share the same file descriptor, and whole-line writes
//! are what keeps their output from interleaving.

use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// Syslog-style severity ladder. `Emergency` is the most severe and
/// `Debug` the least; the discriminant grows as severity falls, so an
/// event passes the filter when `event_level <= threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Emergency => "emergency",
            Level::Alert => "alert",
            Level::Critical => "critical",
            Level::Error => "error",
            Level::Warning => "warning",
            Level::Notice => "notice",
            Level::Info => "info",
            Level::Debug => "debug",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "emergency" | "emerg" => Ok(Level::Emergency),
            "alert" => Ok(Level::Alert),
            "critical" | "crit" => Ok(Level::Critical),
            "error" | "err" => Ok(Level::Error),
            "warning" | "warn" => Ok(Level::Warning),
            "notice" => Ok(Level::Notice),
            "info" => Ok(Level::Info),
            "debug" => Ok(Level::Debug),
            other => Err(anyhow::anyhow!("unknown log level: {other}")),
        }
    }
}

/// Per-event context: `{key}` placeholders in the message template are
/// substituted from these pairs. The reserved keys `role` and `pid`
/// additionally override the line prefix.
pub type Context<'a> = &'a [(&'a str, String)];

/// Line emitter with a severity threshold and a fixed prefix identifying
/// the process: `resque-pool-<role>[<app>][<pid>]`.
#[derive(Clone)]
pub struct Logger {
    level: Level,
    role: &'static str,
    app: String,
    sink: Option<Arc<Mutex<Vec<u8>>>>,
}

impl Logger {
    /// A stdout logger with the default `worker` role.
    pub fn new(level: Level, app: impl Into<String>) -> Logger {
        Logger {
            level,
            role: "worker",
            app: app.into(),
            sink: None,
        }
    }

    /// Same logger with a different prefix role (the pool manager logs as
    /// `manager`).
    pub fn with_role(mut self, role: &'static str) -> Logger {
        self.role = role;
        self
    }

    /// Capture lines into a shared buffer instead of stdout.
    pub fn with_memory_sink(mut self) -> (Logger, Arc<Mutex<Vec<u8>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        self.sink = Some(Arc::clone(&buffer));
        (self, buffer)
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Emit one line, unless `level` falls below the threshold.
    pub fn log(&self, level: Level, message: &str, ctx: Context) {
        if level > self.level {
            return;
        }

        let role = ctx
            .iter()
            .find(|(key, _)| *key == "role")
            .map_or(self.role, |(_, value)| value.as_str());
        let pid = ctx
            .iter()
            .find(|(key, _)| *key == "pid")
            .map_or_else(|| std::process::id().to_string(), |(_, value)| value.clone());
        let app_tag = if self.app.is_empty() {
            String::new()
        } else {
            format!("[{}]", self.app)
        };

        let message = interpolate(message, ctx);
        let line = format!("resque-pool-{role}{app_tag}[{pid}] {message}\n");
        self.write_line(line.as_bytes());
    }

    pub fn error(&self, message: &str, ctx: Context) {
        self.log(Level::Error, message, ctx);
    }

    pub fn warning(&self, message: &str, ctx: Context) {
        self.log(Level::Warning, message, ctx);
    }

    pub fn notice(&self, message: &str, ctx: Context) {
        self.log(Level::Notice, message, ctx);
    }

    pub fn info(&self, message: &str, ctx: Context) {
        self.log(Level::Info, message, ctx);
    }

    pub fn debug(&self, message: &str, ctx: Context) {
        self.log(Level::Debug, message, ctx);
    }

    fn write_line(&self, line: &[u8]) {
        match &self.sink {
            Some(buffer) => {
                if let Ok(mut buffer) = buffer.lock() {
                    buffer.extend_from_slice(line);
                }
            }
            None => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(line);
                let _ = out.flush();
            }
        }
    }
}

/// Replace `{key}` placeholders from the context. Unknown placeholders are
/// left as written.
fn interpolate(template: &str, ctx: Context) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match ctx.iter().find(|(k, _)| *k == key) {
                    Some((_, value)) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
