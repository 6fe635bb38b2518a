use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::error::Error;
use crate::notify::Notifier;
use crate::store::RunStore;

/// How many trailing log lines the progress notification shows.
pub const LOG_TAIL_LINES: usize = 10;

/// Per-run leveled logging. Every call lands in two places: the durable
/// per-run log (append-only, via [`RunStore`]) and the process-wide
/// `tracing` sink prefixed with the run id. A bounded tail buffer feeds
/// the progress notification.
pub struct RunOutput {
    run_id: u64,
    store: Arc<RunStore>,
    notifier: Arc<dyn Notifier>,
    target: Option<String>,
    state: Mutex<LogState>,
}

#[derive(Default)]
struct LogState {
    last_time: String,
    last_level: String,
    tail: VecDeque<String>,
}

impl LogState {
    /// Format a message into durable-log lines. When consecutive lines
    /// share the previous timestamp or level, blank padding is emitted
    /// instead of repeating the prefix. Cosmetic, but part of the log
    /// format downstream tooling reads.
    fn format_chunk(&mut self, time: &str, level: &str, message: &str) -> String {
        let justified = format!("{:<5}", level.to_uppercase());
        let mut chunk = String::new();
        for line in message.lines() {
            let time_col = if time == self.last_time {
                " ".repeat(time.len())
            } else {
                self.last_time = time.to_string();
                time.to_string()
            };
            let level_col = if justified == self.last_level {
                " ".repeat(justified.len())
            } else {
                self.last_level = justified.clone();
                justified.clone()
            };
            let rendered = format!("[{time_col} {level_col}] {line}\n");
            self.tail.push_back(rendered.clone());
            if self.tail.len() > LOG_TAIL_LINES {
                self.tail.pop_front();
            }
            chunk.push_str(&rendered);
        }
        chunk
    }
}

impl RunOutput {
    pub fn new(
        run_id: u64,
        store: Arc<RunStore>,
        notifier: Arc<dyn Notifier>,
        target: Option<String>,
    ) -> Self {
        Self {
            run_id,
            store,
            notifier,
            target,
            state: Mutex::new(LogState::default()),
        }
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn error(&self, message: &str) {
        self.log("error", message);
    }

    pub fn warn(&self, message: &str) {
        self.log("warn", message);
    }

    pub fn info(&self, message: &str) {
        self.log("info", message);
    }

    pub fn debug(&self, message: &str) {
        self.log("debug", message);
    }

    /// Last few durable-log lines, oldest first.
    pub fn tail(&self) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.tail.iter().cloned().collect()
    }

    /// Tell the user something and record it at info level.
    pub async fn inform(&self, message: &str) {
        self.info(message);
        if let Some(target) = &self.target {
            if let Err(e) = self.notifier.send(target, message).await {
                tracing::warn!("[{}] failed to send message: {e}", self.run_id);
            }
        }
    }

    /// Tell the user about an error and record it at error level.
    pub async fn inform_error(&self, message: &str) {
        self.error(message);
        if let Some(target) = &self.target {
            let text = format!("**ERROR:** {message}");
            if let Err(e) = self.notifier.send(target, &text).await {
                tracing::warn!("[{}] failed to send error message: {e}", self.run_id);
            }
        }
    }

    /// Report an error and hand back the sentinel that stops outer layers
    /// from reporting it again.
    pub async fn raise(&self, message: &str) -> Error {
        self.inform_error(message).await;
        Error::AlreadyReported(message.to_string())
    }

    fn log(&self, level: &str, message: &str) {
        let time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
        let chunk = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.format_chunk(&time, level, message)
        };
        if let Err(e) = self.store.append_log(self.run_id, &chunk) {
            tracing::warn!("[{}] failed to append run log: {e}", self.run_id);
        }
        for line in message.lines() {
            match level {
                "error" => tracing::error!("[{}] {line}", self.run_id),
                "warn" => tracing::warn!("[{}] {line}", self.run_id),
                "debug" => tracing::debug!("[{}] {line}", self.run_id),
                _ => tracing::info!("[{}] {line}", self.run_id),
            }
        }
    }
}

/// "2 hours, 10 minutes and 3 seconds ago" style rendering for elapsed
/// seconds; "just now" under a second.
pub fn how_long_ago(elapsed_s: i64) -> String {
    let elapsed_s = elapsed_s.max(0);
    let (days, rem) = (elapsed_s / 86_400, elapsed_s % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (minutes, seconds) = (rem / 60, rem % 60);

    let mut parts = Vec::new();
    for (count, unit) in [
        (days, "day"),
        (hours, "hour"),
        (minutes, "minute"),
        (seconds, "second"),
    ] {
        if count > 0 {
            let plural = if count > 1 { "s" } else { "" };
            parts.push(format!("{count} {unit}{plural}"));
        }
    }
    match parts.len() {
        0 => "just now".to_string(),
        1 => format!("{} ago", parts[0]),
        n => format!("{} and {} ago", parts[..n - 1].join(", "), parts[n - 1]),
    }
}

/// HH:MM:SS rendering of a duration in seconds.
pub fn format_duration(duration_s: i64) -> String {
    let duration_s = duration_s.max(0);
    format!(
        "{:02}:{:02}:{:02}",
        duration_s / 3_600,
        (duration_s % 3_600) / 60,
        duration_s % 60
    )
}
