//! sram-station — station process for the SRAM chain-harvest platform
//!
//! `start` brings up one dispatcher per configured chain and runs until
//! ctrl-c; `send` publishes a command record to the broker and exits.
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 unrecoverable
//! I/O (broker, store or serial bring-up).

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use redis::AsyncCommands;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use sram_station::config::Config;
use sram_station::dispatcher::{subscribe_commands, Dispatcher};
use sram_station::reader::Reader;
use sram_station::sink::build_sink;
use sram_station::store::{MemoryStore, PgStore, Store};
use sram_station::transport::SerialLink;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "sram-station", about = "SRAM harvest station")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "station.toml")]
    config: String,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Run the dispatcher loop for every configured chain
    Start,
    /// Publish a command record to the broker
    Send {
        /// power_on | power_off | status | ping | read | write |
        /// write_invert | sensors | load | exec | retr
        command: String,
        /// Target device UID
        #[arg(long)]
        device: Option<String>,
        /// Block offset (write) or staging chunk offset (load)
        #[arg(long)]
        offset: Option<u32>,
        /// Comma-separated byte values for write
        #[arg(long)]
        data: Option<String>,
        /// Path to an interpreter source file for load
        #[arg(long)]
        source: Option<String>,
        /// Reset the interpreter output pointer before exec
        #[arg(long)]
        reset: bool,
    },
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sram_station=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration: {e}");
            return ExitCode::from(1);
        }
    };
    // Config errors are already behind us; everything below is I/O.
    let result = match args.command {
        CliCommand::Start => start(config).await,
        CliCommand::Send {
            command,
            device,
            offset,
            data,
            source,
            reset,
        } => send(config, command, device, offset, data, source, reset).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("unrecoverable i/o: {e:#}");
            ExitCode::from(2)
        }
    }
}

// ── start ─────────────────────────────────────────────────────────────────────

async fn start(config: Config) -> anyhow::Result<()> {
    info!(
        "sram-station v{} starting: {} chains",
        env!("CARGO_PKG_VERSION"),
        config.chains.len()
    );

    let client = redis::Client::open(config.broker.url.as_str())?;
    let publish_conn = client.get_multiplexed_async_connection().await?;

    let store = Arc::new(match &config.store.url {
        Some(url) => {
            let pg = PgStore::connect(url).await?;
            pg.migrate().await?;
            info!("sample store connected");
            Store::Pg(pg)
        }
        None => {
            warn!("no store url configured; samples will not survive the process");
            Store::Memory(MemoryStore::default())
        }
    });

    let sink = build_sink(
        &config.outputs,
        Some((publish_conn, config.broker.event_topic.clone())),
    );

    let mut tasks = Vec::with_capacity(config.chains.len());
    for chain in &config.chains {
        let link = SerialLink::new(&chain.port, chain.baud, config.deadlines.power_settle());
        let mut reader = Reader::new(
            &chain.name,
            &chain.board_kind,
            &chain.port,
            link,
            store.clone(),
            sink.clone(),
            config.deadlines.clone(),
        );
        if let Some(commands) = &chain.commands {
            reader = reader.restrict(commands);
        }
        let dispatcher = Dispatcher::new(&chain.name, reader, sink.clone()).with_default_routes();
        let commands = subscribe_commands(&client, &config.broker.command_topic, 64).await?;
        info!(
            "chain {} on {} ({}) subscribed to {}",
            chain.name, chain.port, chain.board_kind, config.broker.command_topic
        );
        tasks.push(tokio::spawn(dispatcher.run(commands)));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    // Dropping the tasks drops the channels and subscriptions; in-flight
    // handlers are past the point of caring.
    Ok(())
}

// ── send ──────────────────────────────────────────────────────────────────────

async fn send(
    config: Config,
    command: String,
    device: Option<String>,
    offset: Option<u32>,
    data: Option<String>,
    source: Option<String>,
    reset: bool,
) -> anyhow::Result<()> {
    let mut record = Map::new();
    record.insert("command".to_string(), Value::String(command.clone()));
    if let Some(device) = device {
        record.insert("device".to_string(), Value::String(device));
    }
    if let Some(offset) = offset {
        record.insert("offset".to_string(), Value::from(offset));
    }
    if let Some(data) = data {
        let bytes = parse_byte_list(&data)?;
        record.insert("data".to_string(), Value::from(bytes));
    }
    if let Some(path) = source {
        let text = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("cannot read source file {path}: {e}"))?;
        record.insert("source".to_string(), Value::String(text));
    }
    if reset {
        record.insert("reset".to_string(), Value::Bool(true));
    }

    let client = redis::Client::open(config.broker.url.as_str())?;
    let mut conn = client.get_multiplexed_async_connection().await?;
    conn.publish::<_, _, ()>(
        &config.broker.command_topic,
        Value::Object(record).to_string(),
    )
    .await?;
    info!("published {command} to {}", config.broker.command_topic);
    Ok(())
}

fn parse_byte_list(text: &str) -> anyhow::Result<Vec<u8>> {
    text.split(',')
        .map(|v| {
            v.trim()
                .parse::<u8>()
                .map_err(|e| anyhow::anyhow!("bad byte value {v:?}: {e}"))
        })
        .collect()
}
