//! reader.rs — command planner and executor for one chain
//!
//! A Reader owns one chain link and one membership table for the life of
//! the process. Each handler turns a high-level command into one or more
//! packet exchanges, collects and validates the hop responses, persists
//! what it harvested, and reports per-device outcomes through the event
//! sink.
//!
//! Error posture, per the platform contract:
//! - precondition violations and fatal failures return a [`ReaderError`]
//!   whose `Display` is a fixed template (dashboards pattern-match on it);
//!   the dispatcher turns it into the ERROR event
//! - per-block corruption is a WARNING and the block is skipped
//! - a per-device timeout inside an aggregate sweep is an ERROR event and
//!   the sweep moves to the next device
//! - a Reader never panics its dispatcher

use std::collections::HashSet;
use std::sync::Arc;

use chain_types::{
    err, ping, sensors as sensor_opts, ChainLink, Command, DeviceRecord, LinkError, Packet,
    SampleRecord, SensorFrame, SensorRecord, BLOCK_LEN, OUTPUT_LEN,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::Deadlines;
use crate::sink::{EventRecord, EventSink, Level};
use crate::store::{ReferenceDump, SampleStore, StoreError};
use crate::table::ChainTable;

// ── Capability set ────────────────────────────────────────────────────────────

/// Everything a Reader can be asked to do. Board variants may restrict
/// the set via configuration; the dispatcher refuses the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    PowerOn,
    PowerOff,
    Status,
    Ping,
    Read,
    Write,
    WriteInvert,
    Sensors,
    Load,
    Exec,
    Retr,
}

impl Op {
    pub const ALL: [Op; 11] = [
        Op::PowerOn,
        Op::PowerOff,
        Op::Status,
        Op::Ping,
        Op::Read,
        Op::Write,
        Op::WriteInvert,
        Op::Sensors,
        Op::Load,
        Op::Exec,
        Op::Retr,
    ];

    /// The broker-facing command name.
    pub fn name(&self) -> &'static str {
        match self {
            Op::PowerOn => "power_on",
            Op::PowerOff => "power_off",
            Op::Status => "status",
            Op::Ping => "ping",
            Op::Read => "read",
            Op::Write => "write",
            Op::WriteInvert => "write_invert",
            Op::Sensors => "sensors",
            Op::Load => "load",
            Op::Exec => "exec",
            Op::Retr => "retr",
        }
    }
}

// ── Errors (fixed message templates) ──────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("no devices could be identified")]
    NoDevices,
    #[error("devices were connected but now none could be identified")]
    DevicesLost,
    #[error("Port {0} is not powered on")]
    NotPowered(String),
    #[error("No devices are currently managed")]
    NoneManaged,
    #[error("Device {0} is not managed")]
    NotManaged(String),
    #[error("Block offset {offset} is out of range for device {uid}")]
    OffsetOutOfRange { uid: String, offset: u32 },
    #[error("Data length {len} exceeds the {BLOCK_LEN} byte block size")]
    OversizedData { len: usize },
    #[error("Packet from device {0} is corrupted")]
    Corrupted(String),
    #[error("Response UID {got} does not match device {want}")]
    UidMismatch { want: String, got: String },
    #[error("Timed out waiting for a response from device {0}")]
    DeviceTimeout(String),
    #[error("Device {uid} rejected the request (error {code})")]
    DeviceRejected { uid: String, code: u32 },
    #[error("Unexpected response {command} from device {uid}")]
    Unexpected { uid: String, command: u8 },
    #[error("Interpreter on device {uid} returned code {code}")]
    InterpreterFailure { uid: String, code: i32 },
    #[error("Command record is missing field '{0}'")]
    MissingField(&'static str),
    #[error("Command field '{0}' is malformed")]
    MalformedField(&'static str),
    #[error("Serial link failure: {0}")]
    Link(LinkError),
    #[error(transparent)]
    Wire(#[from] chain_types::WireError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ── Reader ────────────────────────────────────────────────────────────────────

pub struct Reader<L, S> {
    name: String,
    board_kind: String,
    port_label: String,
    link: L,
    table: ChainTable,
    store: Arc<S>,
    sink: EventSink,
    deadlines: Deadlines,
    capabilities: HashSet<Op>,
}

impl<L: ChainLink, S: SampleStore> Reader<L, S> {
    pub fn new(
        name: &str,
        board_kind: &str,
        port_label: &str,
        link: L,
        store: Arc<S>,
        sink: EventSink,
        deadlines: Deadlines,
    ) -> Self {
        Self {
            name: name.to_string(),
            board_kind: board_kind.to_string(),
            port_label: port_label.to_string(),
            link,
            table: ChainTable::new(),
            store,
            sink,
            deadlines,
            capabilities: Op::ALL.into_iter().collect(),
        }
    }

    /// Board variants that cannot run the full surface keep a subset.
    pub fn restrict(mut self, ops: &[Op]) -> Self {
        self.capabilities = ops.iter().copied().collect();
        self
    }

    pub fn supports(&self, op: Op) -> bool {
        self.capabilities.contains(&op)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &ChainTable {
        &self.table
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub async fn handle(&mut self, op: Op, record: &Value) -> Result<Value, ReaderError> {
        match op {
            Op::PowerOn => self.power_on().await,
            Op::PowerOff => self.power_off().await,
            Op::Status => Ok(self.status()),
            Op::Ping => self.ping().await,
            Op::Read => self.read().await,
            Op::Write => self.write(record).await,
            Op::WriteInvert => self.write_invert().await,
            Op::Sensors => self.sensors().await,
            Op::Load => self.load(record).await,
            Op::Exec => self.exec(record).await,
            Op::Retr => self.retrieve(record).await,
        }
    }

    // ── events ──

    async fn emit(&self, level: Level, message: String, context: Value) {
        self.sink
            .emit(&EventRecord::new(&self.name, level, message).with_context(context))
            .await;
    }

    // ── preconditions ──

    fn ensure_powered(&self) -> Result<(), ReaderError> {
        if self.link.is_powered() {
            Ok(())
        } else {
            Err(ReaderError::NotPowered(self.port_label.clone()))
        }
    }

    fn ensure_managed(&self) -> Result<(), ReaderError> {
        if self.table.is_empty() {
            Err(ReaderError::NoneManaged)
        } else {
            Ok(())
        }
    }

    fn managed_device(&self, uid: &str) -> Result<DeviceRecord, ReaderError> {
        self.table
            .get(uid)
            .cloned()
            .ok_or_else(|| ReaderError::NotManaged(uid.to_string()))
    }

    fn map_send_error(&self, error: LinkError) -> ReaderError {
        match error {
            LinkError::PoweredOff => ReaderError::NotPowered(self.port_label.clone()),
            other => ReaderError::Link(other),
        }
    }

    fn touch(&mut self, uid: &str) {
        if let Some(device) = self.table.get(uid).cloned() {
            self.table.upsert(DeviceRecord {
                last_seen: Utc::now(),
                ..device
            });
        }
    }

    /// One strict request/response exchange with a known device: the
    /// answer must be an intact `ACK` from that UID within the block
    /// deadline.
    async fn exchange(&mut self, packet: &Packet, uid: &str) -> Result<Packet, ReaderError> {
        self.link
            .send(packet)
            .await
            .map_err(|e| self.map_send_error(e))?;
        match self.link.receive(self.deadlines.block()).await {
            Ok(response) => {
                if !response.verify() {
                    return Err(ReaderError::Corrupted(uid.to_string()));
                }
                match response.command() {
                    Some(Command::Ack) if response.uid_str() == uid => {
                        self.touch(uid);
                        Ok(response)
                    }
                    Some(Command::Ack) => Err(ReaderError::UidMismatch {
                        want: uid.to_string(),
                        got: response.uid_str(),
                    }),
                    Some(Command::Err) => match response.options() {
                        err::CHECKSUM_MISMATCH => Err(ReaderError::Corrupted(uid.to_string())),
                        code => Err(ReaderError::DeviceRejected {
                            uid: uid.to_string(),
                            code,
                        }),
                    },
                    _ => Err(ReaderError::Unexpected {
                        uid: uid.to_string(),
                        command: response.raw_command(),
                    }),
                }
            }
            Err(LinkError::TimedOut) => Err(ReaderError::DeviceTimeout(uid.to_string())),
            Err(e) => Err(ReaderError::Link(e)),
        }
    }

    /// Skippable protocol trouble vs. handler-fatal failures, for the
    /// aggregate sweeps.
    fn is_skippable(error: &ReaderError) -> bool {
        matches!(
            error,
            ReaderError::Corrupted(_)
                | ReaderError::UidMismatch { .. }
                | ReaderError::DeviceRejected { .. }
                | ReaderError::Unexpected { .. }
        )
    }

    // ── power / status ──

    async fn power_on(&mut self) -> Result<Value, ReaderError> {
        self.link
            .power_on()
            .await
            .map_err(ReaderError::Link)?;
        Ok(json!({ "state": "ON" }))
    }

    async fn power_off(&mut self) -> Result<Value, ReaderError> {
        self.link
            .power_off()
            .await
            .map_err(ReaderError::Link)?;
        Ok(json!({ "state": "OFF" }))
    }

    fn status(&self) -> Value {
        let devices: Vec<Value> = self
            .table
            .list()
            .into_iter()
            .map(|d| json!({ "uid": d.uid, "pic": d.pic, "sram_size": d.sram_size }))
            .collect();
        json!({
            "state": if self.link.is_powered() { "ON" } else { "OFF" },
            "devices": devices,
        })
    }

    // ── discovery ──

    async fn ping(&mut self) -> Result<Value, ReaderError> {
        self.ensure_powered()?;
        let had_devices = !self.table.is_empty();
        self.table.clear();

        let mut probe = Packet::new(Command::Ping);
        probe.set_options(ping::ALL);
        probe.set_broadcast();
        probe.finalize();
        self.link
            .send(&probe)
            .await
            .map_err(|e| self.map_send_error(e))?;

        loop {
            match self.link.receive(self.deadlines.ping_hop()).await {
                Ok(announcement) => {
                    if !announcement.verify() {
                        let uid = announcement.uid_str();
                        self.emit(
                            Level::Warning,
                            ReaderError::Corrupted(uid).to_string(),
                            json!({ "phase": "ping" }),
                        )
                        .await;
                        continue;
                    }
                    match announcement.command() {
                        Some(Command::Ack) => {
                            let uid = announcement.uid_str();
                            let pic = announcement.pic();
                            if let Some(existing) = self.table.get(&uid).cloned() {
                                // Duplicate announcement: the lower pic wins.
                                let kept = existing.pic.min(pic);
                                self.emit(
                                    Level::Warning,
                                    format!(
                                        "Device {uid} announced twice (pic {} and {pic}); keeping pic {kept}",
                                        existing.pic
                                    ),
                                    json!({ "phase": "ping" }),
                                )
                                .await;
                                if pic >= existing.pic {
                                    continue;
                                }
                            }
                            self.table.upsert(DeviceRecord {
                                uid,
                                pic,
                                sram_size: announcement.options(),
                                last_seen: Utc::now(),
                            });
                        }
                        Some(Command::Err) => {
                            self.emit(
                                Level::Warning,
                                ReaderError::Corrupted(announcement.uid_str()).to_string(),
                                json!({ "phase": "ping", "kind": announcement.options() }),
                            )
                            .await;
                        }
                        _ => debug!("ignoring stray packet during discovery: {announcement:?}"),
                    }
                }
                Err(LinkError::TimedOut) => break,
                Err(e) => return Err(ReaderError::Link(e)),
            }
        }

        if self.table.is_empty() {
            return Err(if had_devices {
                ReaderError::DevicesLost
            } else {
                ReaderError::NoDevices
            });
        }

        let devices: Vec<Value> = self
            .table
            .list()
            .into_iter()
            .map(|d| json!({ "uid": d.uid, "pic": d.pic, "sram_size": d.sram_size }))
            .collect();
        self.emit(
            Level::Info,
            format!("Identified {} devices", devices.len()),
            json!({ "devices": devices }),
        )
        .await;
        Ok(json!({ "devices": devices }))
    }

    // ── memory dump ──

    async fn read(&mut self) -> Result<Value, ReaderError> {
        self.ensure_powered()?;
        self.ensure_managed()?;

        let mut total = 0usize;
        'devices: for device in self.table.list() {
            let blocks = device.sram_size as usize / BLOCK_LEN;
            let mut captured = 0usize;
            for offset in 0..blocks {
                let mut request = Packet::new(Command::Read);
                request.set_uid(&device.uid)?;
                request.set_options(offset as u32);
                request.finalize();

                match self.exchange(&request, &device.uid).await {
                    Ok(response) => {
                        self.store
                            .insert_sample(&SampleRecord {
                                uid: device.uid.clone(),
                                board_kind: self.board_kind.clone(),
                                pic: device.pic,
                                block_offset: offset as u32,
                                payload: response.data().to_vec(),
                                captured_at: Utc::now(),
                            })
                            .await?;
                        captured += 1;
                        total += 1;
                    }
                    Err(e @ ReaderError::DeviceTimeout(_)) => {
                        self.emit(
                            Level::Error,
                            e.to_string(),
                            json!({ "device": device.uid, "block_offset": offset }),
                        )
                        .await;
                        continue 'devices;
                    }
                    Err(e) if Self::is_skippable(&e) => {
                        self.emit(
                            Level::Warning,
                            e.to_string(),
                            json!({ "device": device.uid, "block_offset": offset }),
                        )
                        .await;
                    }
                    Err(e) => return Err(e),
                }
            }
            self.emit(
                Level::Info,
                format!("Read {captured}/{blocks} blocks from device {}", device.uid),
                json!({ "device": device.uid }),
            )
            .await;
        }
        Ok(json!({ "samples": total, "devices": self.table.len() }))
    }

    // ── single-block write ──

    async fn write(&mut self, record: &Value) -> Result<Value, ReaderError> {
        self.ensure_powered()?;
        self.ensure_managed()?;
        let uid = field_str(record, "device")?.to_string();
        let offset = field_u32(record, "offset")?;
        let data = field_bytes(record, "data")?;
        let device = self.managed_device(&uid)?;

        let blocks = device.sram_size as usize / BLOCK_LEN;
        if offset as usize >= blocks {
            return Err(ReaderError::OffsetOutOfRange { uid, offset });
        }
        if data.len() > BLOCK_LEN {
            return Err(ReaderError::OversizedData { len: data.len() });
        }

        self.write_block(&uid, offset, &data).await?;
        Ok(json!({ "device": uid, "offset": offset }))
    }

    /// Callers short of a full block pad with zeros; `set_data` does that.
    async fn write_block(&mut self, uid: &str, offset: u32, data: &[u8]) -> Result<(), ReaderError> {
        let mut request = Packet::new(Command::Write);
        request.set_uid(uid)?;
        request.set_options(offset);
        request.set_data(data)?;
        request.finalize();
        self.exchange(&request, uid).await?;
        Ok(())
    }

    // ── write-invert ──

    async fn write_invert(&mut self) -> Result<Value, ReaderError> {
        self.ensure_powered()?;
        self.ensure_managed()?;

        let mut touched: Vec<String> = Vec::new();
        let mut written = 0usize;
        'devices: for (index, device) in self.table.list().into_iter().enumerate() {
            // Half the chain: devices at even positions in pic order.
            if index % 2 != 0 {
                continue;
            }
            let want = device.sram_size as usize / BLOCK_LEN;
            let reference = match self.store.reference_dump(&device.uid, want).await? {
                ReferenceDump::Complete(blocks) => blocks,
                ReferenceDump::Missing => {
                    self.emit(
                        Level::Warning,
                        format!(
                            "At least one full memory sample has to be read from device {}",
                            device.uid
                        ),
                        json!({ "device": device.uid }),
                    )
                    .await;
                    continue;
                }
                ReferenceDump::Partial { have, want } => {
                    self.emit(
                        Level::Warning,
                        format!(
                            "Memory sample of device {} is incomplete ({have}/{want} blocks)",
                            device.uid
                        ),
                        json!({ "device": device.uid }),
                    )
                    .await;
                    continue;
                }
            };

            for (offset, block) in reference.iter().enumerate() {
                let inverted: Vec<u8> = block.iter().map(|b| !b).collect();
                match self.write_block(&device.uid, offset as u32, &inverted).await {
                    Ok(()) => written += 1,
                    Err(e @ ReaderError::DeviceTimeout(_)) => {
                        self.emit(
                            Level::Error,
                            e.to_string(),
                            json!({ "device": device.uid, "block_offset": offset }),
                        )
                        .await;
                        continue 'devices;
                    }
                    Err(e) if Self::is_skippable(&e) => {
                        self.emit(
                            Level::Warning,
                            e.to_string(),
                            json!({ "device": device.uid, "block_offset": offset }),
                        )
                        .await;
                    }
                    Err(e) => return Err(e),
                }
            }
            touched.push(device.uid);
        }
        Ok(json!({ "devices": touched, "blocks": written }))
    }

    // ── sensors ──

    async fn sensors(&mut self) -> Result<Value, ReaderError> {
        self.ensure_powered()?;
        self.ensure_managed()?;

        let mut readings: Vec<Value> = Vec::new();
        for device in self.table.list() {
            let mut request = Packet::new(Command::Sensors);
            request.set_uid(&device.uid)?;
            request.set_options(sensor_opts::ALL);
            request.finalize();

            match self.exchange(&request, &device.uid).await {
                Ok(response) => {
                    let frame = SensorFrame::read_all(response.data());
                    if frame.temp110_cal == 0 && frame.temp30_cal == 0 {
                        debug!(
                            "device {} reports no temperature calibration words",
                            device.uid
                        );
                    }
                    self.store
                        .insert_sensor(&SensorRecord {
                            uid: device.uid.clone(),
                            board_kind: self.board_kind.clone(),
                            temperature_raw: frame.temperature_raw,
                            voltage_raw: frame.voltage_raw,
                            temp30_cal: frame.temp30_cal,
                            temp110_cal: frame.temp110_cal,
                            vdd_cal: frame.vdd_cal,
                            captured_at: Utc::now(),
                        })
                        .await?;
                    readings.push(json!({
                        "uid": device.uid,
                        "temperature_raw": frame.temperature_raw,
                        "voltage_raw": frame.voltage_raw,
                        "temp30_cal": frame.temp30_cal,
                        "temp110_cal": frame.temp110_cal,
                        "vdd_cal": frame.vdd_cal,
                    }));
                }
                Err(e @ ReaderError::DeviceTimeout(_)) => {
                    self.emit(Level::Error, e.to_string(), json!({ "device": device.uid }))
                        .await;
                }
                Err(e) if Self::is_skippable(&e) => {
                    self.emit(Level::Warning, e.to_string(), json!({ "device": device.uid }))
                        .await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(json!({ "readings": readings }))
    }

    // ── interpreter surface ──

    async fn load(&mut self, record: &Value) -> Result<Value, ReaderError> {
        self.ensure_powered()?;
        self.ensure_managed()?;
        let uid = field_str(record, "device")?.to_string();
        let source = field_str(record, "source")?.to_string();
        let offset = field_u32_or(record, "offset", 0)?;
        self.managed_device(&uid)?;

        let mut chunks = 0u32;
        for (index, chunk) in source.as_bytes().chunks(BLOCK_LEN).enumerate() {
            let mut request = Packet::new(Command::Load);
            request.set_uid(&uid)?;
            request.set_options(offset + index as u32);
            request.set_data(chunk)?;
            request.finalize();
            self.exchange(&request, &uid).await?;
            chunks += 1;
        }
        Ok(json!({ "device": uid, "chunks": chunks }))
    }

    async fn exec(&mut self, record: &Value) -> Result<Value, ReaderError> {
        self.ensure_powered()?;
        self.ensure_managed()?;
        let uid = field_str(record, "device")?.to_string();
        let reset = field_bool_or(record, "reset", false)?;
        self.managed_device(&uid)?;

        let mut request = Packet::new(Command::Exec);
        request.set_uid(&uid)?;
        request.set_options(reset as u32);
        request.finalize();
        let response = self.exchange(&request, &uid).await?;

        let code = response.options() as i32;
        if code != 0 {
            return Err(ReaderError::InterpreterFailure { uid, code });
        }
        Ok(json!({ "device": uid, "code": 0 }))
    }

    async fn retrieve(&mut self, record: &Value) -> Result<Value, ReaderError> {
        self.ensure_powered()?;
        self.ensure_managed()?;
        let uid = field_str(record, "device")?.to_string();
        self.managed_device(&uid)?;

        let mut raw = Vec::with_capacity(OUTPUT_LEN);
        for offset in 0..(OUTPUT_LEN / BLOCK_LEN) as u32 {
            let mut request = Packet::new(Command::Retr);
            request.set_uid(&uid)?;
            request.set_options(offset);
            request.finalize();
            let response = self.exchange(&request, &uid).await?;
            raw.extend_from_slice(response.data());
        }

        // Trailing zeros are unwritten region, not output.
        let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        raw.truncate(end);
        let text = String::from_utf8_lossy(&raw).into_owned();
        let integers: Vec<i64> = text
            .lines()
            .filter_map(|line| line.trim().parse::<i64>().ok())
            .collect();
        Ok(json!({ "device": uid, "raw": raw, "text": text, "integers": integers }))
    }
}

// ── Command record fields ─────────────────────────────────────────────────────

fn field_str<'a>(record: &'a Value, key: &'static str) -> Result<&'a str, ReaderError> {
    record
        .get(key)
        .ok_or(ReaderError::MissingField(key))?
        .as_str()
        .ok_or(ReaderError::MalformedField(key))
}

fn field_u32(record: &Value, key: &'static str) -> Result<u32, ReaderError> {
    record
        .get(key)
        .ok_or(ReaderError::MissingField(key))?
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or(ReaderError::MalformedField(key))
}

fn field_u32_or(record: &Value, key: &'static str, default: u32) -> Result<u32, ReaderError> {
    match record.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or(ReaderError::MalformedField(key)),
    }
}

fn field_bool_or(record: &Value, key: &'static str, default: bool) -> Result<bool, ReaderError> {
    match record.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value.as_bool().ok_or(ReaderError::MalformedField(key)),
    }
}

/// `data` is a list of integers 0..=255, per the broker contract.
fn field_bytes(record: &Value, key: &'static str) -> Result<Vec<u8>, ReaderError> {
    let list = record
        .get(key)
        .ok_or(ReaderError::MissingField(key))?
        .as_array()
        .ok_or(ReaderError::MalformedField(key))?;
    list.iter()
        .map(|v| {
            v.as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .ok_or(ReaderError::MalformedField(key))
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chain_sim::VirtualChain;

    fn reader(chain: VirtualChain) -> Reader<VirtualChain, MemoryStore> {
        Reader::new(
            "chain-test",
            "nucleo-f446re",
            "virtual",
            chain,
            Arc::new(MemoryStore::default()),
            EventSink::disabled(),
            Deadlines::default(),
        )
    }

    #[tokio::test]
    async fn handlers_require_power() {
        let chain = VirtualChain::uniform("NODE", 1, 4 * BLOCK_LEN);
        let mut reader = reader(chain);
        let err = reader.ping().await.unwrap_err();
        assert_eq!(err.to_string(), "Port virtual is not powered on");
    }

    #[tokio::test]
    async fn aggregates_require_devices() {
        let chain = VirtualChain::uniform("NODE", 1, 4 * BLOCK_LEN);
        let mut reader = reader(chain);
        reader.power_on().await.unwrap();
        let err = reader.read().await.unwrap_err();
        assert_eq!(err.to_string(), "No devices are currently managed");
    }

    #[tokio::test]
    async fn ping_then_status_reports_the_chain() {
        let chain = VirtualChain::uniform("NODE", 2, 4 * BLOCK_LEN);
        let mut reader = reader(chain);
        reader.power_on().await.unwrap();
        let response = reader.ping().await.unwrap();
        assert_eq!(response["devices"].as_array().unwrap().len(), 2);
        assert!(reader.table().is_consistent());

        let status = reader.status();
        assert_eq!(status["state"], "ON");
        assert_eq!(status["devices"][0]["uid"], "NODE-1");
        assert_eq!(status["devices"][1]["pic"], 2);
    }

    #[tokio::test]
    async fn write_validates_inputs() {
        let chain = VirtualChain::uniform("NODE", 1, 4 * BLOCK_LEN);
        let mut reader = reader(chain);
        reader.power_on().await.unwrap();
        reader.ping().await.unwrap();

        let err = reader
            .write(&json!({ "device": "GHOST", "offset": 0, "data": [1] }))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Device GHOST is not managed");

        let err = reader
            .write(&json!({ "device": "NODE-1", "offset": 99, "data": [1] }))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Block offset 99 is out of range for device NODE-1"
        );

        let err = reader
            .write(&json!({ "device": "NODE-1", "data": [1] }))
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::MissingField("offset")));
    }

    #[tokio::test]
    async fn exec_surfaces_interpreter_codes() {
        let chain = VirtualChain::uniform("NODE", 1, 4 * BLOCK_LEN);
        let mut reader = reader(chain);
        reader.power_on().await.unwrap();
        reader.ping().await.unwrap();

        // Stage a division by zero; the RPN engine reports code 3.
        reader
            .load(&json!({ "device": "NODE-1", "source": "1 0 /" }))
            .await
            .unwrap();
        let err = reader
            .exec(&json!({ "device": "NODE-1", "reset": true }))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Interpreter on device NODE-1 returned code 3"
        );
    }

    #[tokio::test]
    async fn restricted_reader_reports_capabilities() {
        let chain = VirtualChain::uniform("NODE", 1, 4 * BLOCK_LEN);
        let reader = reader(chain).restrict(&[Op::Ping, Op::Status]);
        assert!(reader.supports(Op::Ping));
        assert!(!reader.supports(Op::WriteInvert));
    }
}
