//! store.rs — sample store client
//!
//! The relational store is an external collaborator; the station only
//! appends records and asks one question back: "do we hold a complete
//! reference dump of this device?". Payloads are persisted as
//! comma-separated byte values and block offsets as strings, matching the
//! platform's shared `samples` schema.

use std::collections::HashMap;
use std::sync::Mutex;

use chain_types::{SampleRecord, SensorRecord};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sample store: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result of a reference-dump lookup for `write_invert`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceDump {
    /// No samples at all for this device.
    Missing,
    /// Some blocks, not all of them.
    Partial { have: usize, want: usize },
    /// Every block, ordered by offset; most recent capture per offset.
    Complete(Vec<Vec<u8>>),
}

#[async_trait::async_trait]
pub trait SampleStore: Send + Sync {
    async fn insert_sample(&self, sample: &SampleRecord) -> Result<(), StoreError>;
    async fn insert_sensor(&self, reading: &SensorRecord) -> Result<(), StoreError>;
    async fn reference_dump(&self, uid: &str, want: usize) -> Result<ReferenceDump, StoreError>;
}

// ── Payload codec ─────────────────────────────────────────────────────────────

fn encode_payload(payload: &[u8]) -> String {
    payload
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn decode_payload(text: &str) -> Vec<u8> {
    text.split(',')
        .filter_map(|v| v.trim().parse::<u8>().ok())
        .collect()
}

// ── Postgres ──────────────────────────────────────────────────────────────────

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        Ok(Self { pool })
    }

    /// Idempotent schema bring-up.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS samples (
                 id BIGSERIAL PRIMARY KEY,
                 uid TEXT NOT NULL,
                 board_kind TEXT NOT NULL,
                 pic INT NOT NULL,
                 address TEXT NOT NULL,
                 data TEXT NOT NULL,
                 created_at TIMESTAMPTZ NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sensor_readings (
                 id BIGSERIAL PRIMARY KEY,
                 uid TEXT NOT NULL,
                 board_kind TEXT NOT NULL,
                 temperature_raw INT NOT NULL,
                 voltage_raw INT NOT NULL,
                 temp30_cal INT NOT NULL,
                 temp110_cal INT NOT NULL,
                 vdd_cal INT NOT NULL,
                 created_at TIMESTAMPTZ NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SampleStore for PgStore {
    async fn insert_sample(&self, sample: &SampleRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO samples (uid, board_kind, pic, address, data, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&sample.uid)
        .bind(&sample.board_kind)
        .bind(sample.pic as i32)
        .bind(sample.block_offset.to_string())
        .bind(encode_payload(&sample.payload))
        .bind(sample.captured_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_sensor(&self, reading: &SensorRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sensor_readings
                 (uid, board_kind, temperature_raw, voltage_raw,
                  temp30_cal, temp110_cal, vdd_cal, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&reading.uid)
        .bind(&reading.board_kind)
        .bind(reading.temperature_raw as i32)
        .bind(reading.voltage_raw as i32)
        .bind(reading.temp30_cal as i32)
        .bind(reading.temp110_cal as i32)
        .bind(reading.vdd_cal as i32)
        .bind(reading.captured_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reference_dump(&self, uid: &str, want: usize) -> Result<ReferenceDump, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT ON (address) address, data
             FROM samples WHERE uid = $1
             ORDER BY address, created_at DESC",
        )
        .bind(uid)
        .fetch_all(&self.pool)
        .await?;

        let mut by_offset: HashMap<usize, Vec<u8>> = HashMap::new();
        for row in rows {
            let address: String = row.try_get("address")?;
            let data: String = row.try_get("data")?;
            if let Ok(offset) = address.parse::<usize>() {
                by_offset.insert(offset, decode_payload(&data));
            }
        }
        Ok(assemble_dump(by_offset, want))
    }
}

fn assemble_dump(by_offset: HashMap<usize, Vec<u8>>, want: usize) -> ReferenceDump {
    if by_offset.is_empty() {
        return ReferenceDump::Missing;
    }
    let mut blocks = Vec::with_capacity(want);
    for offset in 0..want {
        match by_offset.get(&offset) {
            Some(block) => blocks.push(block.clone()),
            None => {
                return ReferenceDump::Partial {
                    have: by_offset.len().min(want),
                    want,
                }
            }
        }
    }
    ReferenceDump::Complete(blocks)
}

// ── In-memory ─────────────────────────────────────────────────────────────────

/// Broker-less bench store; also what the integration tests inspect.
#[derive(Default)]
pub struct MemoryStore {
    samples: Mutex<Vec<SampleRecord>>,
    sensors: Mutex<Vec<SensorRecord>>,
}

impl MemoryStore {
    pub fn samples(&self) -> Vec<SampleRecord> {
        self.samples.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn sensors(&self) -> Vec<SensorRecord> {
        self.sensors.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl SampleStore for MemoryStore {
    async fn insert_sample(&self, sample: &SampleRecord) -> Result<(), StoreError> {
        if let Ok(mut guard) = self.samples.lock() {
            guard.push(sample.clone());
        }
        Ok(())
    }

    async fn insert_sensor(&self, reading: &SensorRecord) -> Result<(), StoreError> {
        if let Ok(mut guard) = self.sensors.lock() {
            guard.push(reading.clone());
        }
        Ok(())
    }

    async fn reference_dump(&self, uid: &str, want: usize) -> Result<ReferenceDump, StoreError> {
        let mut by_offset: HashMap<usize, Vec<u8>> = HashMap::new();
        if let Ok(guard) = self.samples.lock() {
            // Later inserts win: most recent capture per offset.
            for sample in guard.iter().filter(|s| s.uid == uid) {
                by_offset.insert(sample.block_offset as usize, sample.payload.clone());
            }
        }
        Ok(assemble_dump(by_offset, want))
    }
}

// ── Runtime selection ─────────────────────────────────────────────────────────

/// Static dispatch over the configured backend.
pub enum Store {
    Pg(PgStore),
    Memory(MemoryStore),
}

#[async_trait::async_trait]
impl SampleStore for Store {
    async fn insert_sample(&self, sample: &SampleRecord) -> Result<(), StoreError> {
        match self {
            Store::Pg(s) => s.insert_sample(sample).await,
            Store::Memory(s) => s.insert_sample(sample).await,
        }
    }

    async fn insert_sensor(&self, reading: &SensorRecord) -> Result<(), StoreError> {
        match self {
            Store::Pg(s) => s.insert_sensor(reading).await,
            Store::Memory(s) => s.insert_sensor(reading).await,
        }
    }

    async fn reference_dump(&self, uid: &str, want: usize) -> Result<ReferenceDump, StoreError> {
        match self {
            Store::Pg(s) => s.reference_dump(uid, want).await,
            Store::Memory(s) => s.reference_dump(uid, want).await,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
