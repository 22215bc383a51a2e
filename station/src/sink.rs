//! sink.rs — structured platform event log
//!
//! Everything user-visible the station does ends up here as an
//! [`EventRecord`] and is fanned out to the configured outputs: the
//! broker's event routing key, the terminal, rotating and daily log
//! files, a transactional mail endpoint, a chat bot, and an in-memory
//! buffer (tests, tail ring). One output failing never blocks another;
//! failures are downgraded to process diagnostics.
//!
//! Downstream dashboards pattern-match on event messages, so handler code
//! must emit the fixed templates from `reader::ReaderError` verbatim.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::config::OutputConfig;

// ── Levels ────────────────────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Half-open admission window: a record passes iff
/// `min ≤ level < max` (no upper bound when `max` is `None`).
#[derive(Debug, Clone, Copy, Default)]
pub struct LevelWindow {
    pub min: Level,
    pub max: Option<Level>,
}

impl LevelWindow {
    pub fn from(min: Level) -> Self {
        Self { min, max: None }
    }

    pub fn admits(&self, level: Level) -> bool {
        level >= self.min && self.max.map_or(true, |max| level < max)
    }
}

// ── Event record ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub source_name: String,
    pub level: Level,
    pub message: String,
    pub context: Value,
    pub emitted_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(source_name: impl Into<String>, level: Level, message: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            level,
            message: message.into(),
            context: Value::Null,
            emitted_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    fn render_line(&self) -> String {
        format!(
            "{} {:<7} {}: {}",
            self.emitted_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level.to_string(),
            self.source_name,
            self.message
        )
    }

    /// The broker event shape: `{status, msg, level, source_name,
    /// timestamp}`. `msg` prefers the handler's structured response when
    /// the context carries one.
    fn broker_payload(&self) -> Value {
        let msg = match self.context.get("response") {
            Some(response) => response.clone(),
            None => Value::String(self.message.clone()),
        };
        serde_json::json!({
            "status": if self.level >= Level::Warning { "ERROR" } else { "OK" },
            "msg": msg,
            "level": self.level,
            "source_name": self.source_name,
            "timestamp": self.emitted_at,
        })
    }
}

// ── Outputs ───────────────────────────────────────────────────────────────────

pub enum Output {
    /// Republish on the broker's event routing key.
    Broker {
        conn: MultiplexedConnection,
        routing_key: String,
        window: LevelWindow,
    },
    Terminal {
        window: LevelWindow,
    },
    /// Size-rotating file: `path`, `path.1` … `path.{backups}`.
    RotatingFile {
        path: PathBuf,
        max_bytes: u64,
        backups: u32,
        window: LevelWindow,
    },
    /// Daily file: the previous day is renamed to `path.YYYY-MM-DD`.
    TimedRotatingFile {
        path: PathBuf,
        current_day: tokio::sync::Mutex<Option<String>>,
        window: LevelWindow,
    },
    /// Transactional mail over an HTTP JSON API.
    Mailer {
        client: reqwest::Client,
        endpoint: String,
        token: String,
        from: String,
        to: String,
        window: LevelWindow,
    },
    /// Chat bot webhook (`{chat_id, text}` POST).
    ChatBot {
        client: reqwest::Client,
        endpoint: String,
        chat_id: String,
        window: LevelWindow,
    },
    /// In-memory ring, inspectable; the test sink of choice.
    Buffer {
        records: Arc<Mutex<Vec<EventRecord>>>,
        window: LevelWindow,
    },
}

impl Output {
    pub fn buffer(window: LevelWindow) -> (Self, Arc<Mutex<Vec<EventRecord>>>) {
        let records = Arc::new(Mutex::new(Vec::new()));
        (
            Self::Buffer {
                records: records.clone(),
                window,
            },
            records,
        )
    }

    fn kind(&self) -> &'static str {
        match self {
            Output::Broker { .. } => "broker",
            Output::Terminal { .. } => "terminal",
            Output::RotatingFile { .. } => "file",
            Output::TimedRotatingFile { .. } => "timed_file",
            Output::Mailer { .. } => "mailer",
            Output::ChatBot { .. } => "chat",
            Output::Buffer { .. } => "buffer",
        }
    }

    fn window(&self) -> &LevelWindow {
        match self {
            Output::Broker { window, .. }
            | Output::Terminal { window }
            | Output::RotatingFile { window, .. }
            | Output::TimedRotatingFile { window, .. }
            | Output::Mailer { window, .. }
            | Output::ChatBot { window, .. }
            | Output::Buffer { window, .. } => window,
        }
    }

    async fn emit(&self, record: &EventRecord) -> anyhow::Result<()> {
        match self {
            Output::Broker {
                conn, routing_key, ..
            } => {
                let mut conn = conn.clone();
                conn.publish::<_, _, ()>(routing_key, record.broker_payload().to_string())
                    .await?;
            }
            Output::Terminal { .. } => {
                eprintln!("{}", record.render_line());
            }
            Output::RotatingFile {
                path,
                max_bytes,
                backups,
                ..
            } => {
                append_line(path, &record.render_line()).await?;
                rotate_by_size(path, *max_bytes, *backups).await?;
            }
            Output::TimedRotatingFile {
                path, current_day, ..
            } => {
                let day = record.emitted_at.format("%Y-%m-%d").to_string();
                let mut guard = current_day.lock().await;
                if let Some(previous) = guard.as_ref() {
                    if previous != &day && tokio::fs::try_exists(path).await.unwrap_or(false) {
                        let rotated = rotated_name(path, previous);
                        tokio::fs::rename(path, rotated).await?;
                    }
                }
                *guard = Some(day);
                append_line(path, &record.render_line()).await?;
            }
            Output::Mailer {
                client,
                endpoint,
                token,
                from,
                to,
                ..
            } => {
                let body = serde_json::json!({
                    "from": from,
                    "to": to,
                    "subject": format!("[{}] {}", record.level, record.source_name),
                    "text": format!("{}\n\n{}", record.message, record.context),
                });
                client
                    .post(endpoint)
                    .bearer_auth(token)
                    .json(&body)
                    .send()
                    .await?
                    .error_for_status()?;
            }
            Output::ChatBot {
                client,
                endpoint,
                chat_id,
                ..
            } => {
                let body = serde_json::json!({
                    "chat_id": chat_id,
                    "text": record.render_line(),
                });
                client
                    .post(endpoint)
                    .json(&body)
                    .send()
                    .await?
                    .error_for_status()?;
            }
            Output::Buffer { records, .. } => {
                if let Ok(mut guard) = records.lock() {
                    guard.push(record.clone());
                }
            }
        }
        Ok(())
    }
}

async fn append_line(path: &Path, line: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(format!("{line}\n").as_bytes()).await?;
    Ok(())
}

async fn rotate_by_size(path: &Path, max_bytes: u64, backups: u32) -> anyhow::Result<()> {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(()),
    };
    if size <= max_bytes {
        return Ok(());
    }
    for index in (1..backups).rev() {
        let older = rotated_name(path, &index.to_string());
        let newer = rotated_name(path, &(index + 1).to_string());
        if tokio::fs::try_exists(&older).await.unwrap_or(false) {
            tokio::fs::rename(&older, &newer).await?;
        }
    }
    if backups > 0 {
        tokio::fs::rename(path, rotated_name(path, "1")).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

fn rotated_name(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

// ── Sink ──────────────────────────────────────────────────────────────────────

/// Concurrency-safe fan-out shared by every Reader and Dispatcher in the
/// process. Emission order from one source is preserved; outputs that
/// fail are reported through `tracing` and skipped.
#[derive(Clone)]
pub struct EventSink {
    outputs: Arc<Vec<Output>>,
}

impl EventSink {
    pub fn new(outputs: Vec<Output>) -> Self {
        Self {
            outputs: Arc::new(outputs),
        }
    }

    /// A sink that swallows everything (CLI `send` path, tests).
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    pub async fn emit(&self, record: &EventRecord) {
        for output in self.outputs.iter() {
            if !output.window().admits(record.level) {
                continue;
            }
            if let Err(e) = output.emit(record).await {
                warn!("log output {} failed: {e}", output.kind());
            }
        }
    }
}

/// Assemble the sink from configuration. Broker-backed outputs need the
/// shared connection; without one they are skipped with a warning.
pub fn build_sink(
    configs: &[OutputConfig],
    broker: Option<(MultiplexedConnection, String)>,
) -> EventSink {
    let mut outputs = Vec::new();
    for config in configs {
        let window = config.window();
        match config {
            OutputConfig::Terminal { .. } => outputs.push(Output::Terminal { window }),
            OutputConfig::File {
                path,
                max_bytes,
                backups,
                ..
            } => outputs.push(Output::RotatingFile {
                path: path.clone(),
                max_bytes: *max_bytes,
                backups: *backups,
                window,
            }),
            OutputConfig::TimedFile { path, .. } => outputs.push(Output::TimedRotatingFile {
                path: path.clone(),
                current_day: tokio::sync::Mutex::new(None),
                window,
            }),
            OutputConfig::Broker { routing_key, .. } => match &broker {
                Some((conn, default_key)) => outputs.push(Output::Broker {
                    conn: conn.clone(),
                    routing_key: routing_key.clone().unwrap_or_else(|| default_key.clone()),
                    window,
                }),
                None => warn!("broker log output configured without a broker connection"),
            },
            OutputConfig::Mailer {
                endpoint,
                token,
                from,
                to,
                ..
            } => outputs.push(Output::Mailer {
                client: reqwest::Client::new(),
                endpoint: endpoint.clone(),
                token: token.clone(),
                from: from.clone(),
                to: to.clone(),
                window,
            }),
            OutputConfig::Chat {
                endpoint, chat_id, ..
            } => outputs.push(Output::ChatBot {
                client: reqwest::Client::new(),
                endpoint: endpoint.clone(),
                chat_id: chat_id.clone(),
                window,
            }),
        }
    }
    EventSink::new(outputs)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_half_open() {
        let window = LevelWindow {
            min: Level::Info,
            max: Some(Level::Error),
        };
        assert!(!window.admits(Level::Debug));
        assert!(window.admits(Level::Info));
        assert!(window.admits(Level::Warning));
        assert!(!window.admits(Level::Error));
    }

    #[tokio::test]
    async fn buffer_output_applies_its_window() {
        let (output, records) = Output::buffer(LevelWindow::from(Level::Warning));
        let sink = EventSink::new(vec![output]);

        sink.emit(&EventRecord::new("chain-a", Level::Info, "discovered"))
            .await;
        sink.emit(&EventRecord::new("chain-a", Level::Error, "lost"))
            .await;

        let seen = records.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].message, "lost");
    }

    #[test]
    fn broker_payload_prefers_structured_response() {
        let record = EventRecord::new("chain-a", Level::Info, "ping completed")
            .with_context(serde_json::json!({"response": {"devices": 3}}));
        let payload = record.broker_payload();
        assert_eq!(payload["status"], "OK");
        assert_eq!(payload["msg"]["devices"], 3);

        let plain = EventRecord::new("chain-a", Level::Error, "no devices could be identified");
        let payload = plain.broker_payload();
        assert_eq!(payload["status"], "ERROR");
        assert_eq!(payload["msg"], "no devices could be identified");
    }

    #[tokio::test]
    async fn rotating_file_rolls_over_at_the_size_cap() {
        let dir = std::env::temp_dir().join(format!("sram-sink-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("station.log");
        let sink = EventSink::new(vec![Output::RotatingFile {
            path: path.clone(),
            max_bytes: 64,
            backups: 2,
            window: LevelWindow::default(),
        }]);

        for i in 0..4 {
            sink.emit(&EventRecord::new("chain-a", Level::Info, format!("line {i}")))
                .await;
        }

        let rotated = PathBuf::from(format!("{}.1", path.display()));
        assert!(rotated.exists(), "expected a rotated backup at {rotated:?}");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn one_failing_output_does_not_block_the_next() {
        // A rotating file pointed at an unwritable path fails; the buffer
        // after it must still record.
        let (buffer, records) = Output::buffer(LevelWindow::default());
        let sink = EventSink::new(vec![
            Output::RotatingFile {
                path: PathBuf::from("/dev/null/not-a-dir/station.log"),
                max_bytes: 1024,
                backups: 1,
                window: LevelWindow::default(),
            },
            buffer,
        ]);
        sink.emit(&EventRecord::new("chain-a", Level::Info, "still here"))
            .await;
        assert_eq!(records.lock().unwrap().len(), 1);
    }
}
