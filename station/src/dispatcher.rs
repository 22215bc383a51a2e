//! dispatcher.rs — broker subscriber and command router for one chain
//!
//! The dispatcher owns the broker subscription end of one chain: command
//! records come off an in-process channel (fed by the redis bridge task),
//! every registered pattern that subset-matches the record fires its
//! handler on the owning Reader — in registration order, serially, because
//! the serial line is not reentrant — and each non-empty response is
//! published to the event sink together with the command that caused it.

use chain_types::ChainLink;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::reader::{Op, Reader};
use crate::sink::{EventRecord, EventSink, Level};
use crate::store::SampleStore;

// ── Patterns ──────────────────────────────────────────────────────────────────

/// Subset match over the incoming record's fields: every key in the
/// pattern must be present with exactly that value.
#[derive(Debug, Clone)]
pub struct Pattern(Map<String, Value>);

impl Pattern {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// The common case: match on the `command` field alone.
    pub fn command(name: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("command".to_string(), Value::String(name.to_string()));
        Self(fields)
    }

    pub fn matches(&self, record: &Value) -> bool {
        match record.as_object() {
            Some(object) => self
                .0
                .iter()
                .all(|(key, expected)| object.get(key) == Some(expected)),
            None => false,
        }
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

pub struct Dispatcher<L, S> {
    name: String,
    reader: Reader<L, S>,
    routes: Vec<(Pattern, Op)>,
    sink: EventSink,
}

impl<L: ChainLink, S: SampleStore> Dispatcher<L, S> {
    pub fn new(name: &str, reader: Reader<L, S>, sink: EventSink) -> Self {
        Self {
            name: name.to_string(),
            reader,
            routes: Vec::new(),
            sink,
        }
    }

    pub fn add_command(&mut self, pattern: Pattern, op: Op) {
        self.routes.push((pattern, op));
    }

    /// One route per capability, matched on the broker command name.
    pub fn with_default_routes(mut self) -> Self {
        for op in Op::ALL {
            self.add_command(Pattern::command(op.name()), op);
        }
        self
    }

    /// Consume command records until the channel closes. An in-flight
    /// handler always runs to completion; shutdown is channel closure.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Value>) {
        info!("dispatcher {} up", self.name);
        while let Some(record) = commands.recv().await {
            self.handle_record(record).await;
        }
        info!("dispatcher {} down: command channel closed", self.name);
    }

    pub async fn handle_record(&mut self, record: Value) {
        let matched: Vec<Op> = self
            .routes
            .iter()
            .filter(|(pattern, _)| pattern.matches(&record))
            .map(|(_, op)| *op)
            .collect();
        if matched.is_empty() {
            debug!("{}: no handler matched {record}", self.name);
            return;
        }

        let correlation = Uuid::new_v4();
        for op in matched {
            if !self.reader.supports(op) {
                let message = format!("Command {} is not supported by this board", op.name());
                warn!("{}: {message}", self.name);
                self.publish(Level::Error, message, &record, None, correlation)
                    .await;
                continue;
            }
            match self.reader.handle(op, &record).await {
                Ok(Value::Null) => {}
                Ok(response) => {
                    self.publish(
                        Level::Info,
                        format!("{} completed", op.name()),
                        &record,
                        Some(response),
                        correlation,
                    )
                    .await;
                }
                Err(error) => {
                    self.publish(Level::Error, error.to_string(), &record, None, correlation)
                        .await;
                }
            }
        }
    }

    async fn publish(
        &self,
        level: Level,
        message: String,
        command: &Value,
        response: Option<Value>,
        correlation: Uuid,
    ) {
        let mut context = json!({
            "command": command,
            "correlation": correlation.to_string(),
        });
        if let Some(response) = response {
            context["response"] = response;
        }
        self.sink
            .emit(&EventRecord::new(&self.name, level, message).with_context(context))
            .await;
    }
}

// ── Broker bridge ─────────────────────────────────────────────────────────────

/// Subscribe to the command topic and forward decoded records into an
/// in-process channel. Dropping the receiver ends the bridge task, which
/// drops the subscription — that is dispatcher shutdown.
pub async fn subscribe_commands(
    client: &redis::Client,
    topic: &str,
    depth: usize,
) -> anyhow::Result<mpsc::Receiver<Value>> {
    use futures_util::StreamExt;

    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(topic).await?;
    let (tx, rx) = mpsc::channel(depth);
    let topic = topic.to_string();
    tokio::spawn(async move {
        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("{topic}: unreadable message payload: {e}");
                    continue;
                }
            };
            match serde_json::from_str::<Value>(&payload) {
                Ok(record) => {
                    if tx.send(record).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("{topic}: discarding malformed command record: {e}"),
            }
        }
        info!("subscription on {topic} closed");
    });
    Ok(rx)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
