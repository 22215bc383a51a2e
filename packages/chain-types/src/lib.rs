//! # chain-types
//!
//! Shared wire protocol types for the SRAM chain-harvest platform.
//!
//! These types are used by:
//! - `sram-station`: crafting command packets and decoding hop responses
//! - `chain-sim`: the device-node state machine and virtual chain harness
//! - device firmware ports, which mirror this layout byte for byte
//!
//! ## Wire format
//!
//! Every packet on the wire is exactly `6 + 25 + BLOCK_LEN + 2` bytes:
//!
//! ```text
//! [ Command(1) | PIC(1) | Options(4 LE) | UID(25) | Data(BLOCK_LEN) | Checksum(2 LE) ]
//! ```
//!
//! PIC ("position in chain") is incremented by every forwarding hop away
//! from the station, so a response's PIC at the station equals the
//! originating node's distance. The checksum is CRC-16/ARC (polynomial
//! 0xA001 reflected, initial value 0) over the canonical form of the
//! packet, i.e. with the checksum field zeroed.
//!
//! ## Invariants
//! - `decode(encode(finalize(p))) == finalize(p)` for every packet `p`
//! - `finalize` is idempotent
//! - a packet that has not been `finalize`d cannot be encoded

use std::time::Duration;

use chrono::{DateTime, Utc};
use crc::{Crc, CRC_16_ARC};
use serde::{Deserialize, Serialize};

// ── Wire constants ────────────────────────────────────────────────────────────

/// UID field width. Identities are ASCII, NUL-terminated when shorter.
pub const UID_LEN: usize = 25;

/// Data payload bytes per packet — the SRAM transfer block size.
/// Build-time selected: Discovery-class boards ship 512-byte blocks.
#[cfg(feature = "block-512")]
pub const BLOCK_LEN: usize = 512;
#[cfg(not(feature = "block-512"))]
pub const BLOCK_LEN: usize = 1024;

/// Command + PIC + Options.
pub const HEADER_LEN: usize = 6;
pub const CHECKSUM_LEN: usize = 2;

/// Total packet size on the wire. Nothing shorter or longer is legal.
pub const PACKET_LEN: usize = HEADER_LEN + UID_LEN + BLOCK_LEN + CHECKSUM_LEN;

/// Broadcast identity: every node accepts all-ones as its own UID.
pub const BROADCAST_UID: [u8; UID_LEN] = [0xFF; UID_LEN];

/// Source-code staging region on a node, filled block-wise by `LOAD`.
pub const STAGING_LEN: usize = 4 * BLOCK_LEN;

/// Interpreter output region on a node, drained block-wise by `RETR`.
pub const OUTPUT_LEN: usize = 4 * BLOCK_LEN;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

// ── Command codes ─────────────────────────────────────────────────────────────

/// One-byte operation code. Unknown codes are forwarded upstream by nodes,
/// so [`Packet`] stores the raw byte and this enum is the decoded view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Ack = 1,
    Ping = 2,
    Read = 3,
    Write = 4,
    Sensors = 5,
    Load = 6,
    Exec = 7,
    Retr = 8,
    Err = 255,
}

impl Command {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Ack),
            2 => Some(Self::Ping),
            3 => Some(Self::Read),
            4 => Some(Self::Write),
            5 => Some(Self::Sensors),
            6 => Some(Self::Load),
            7 => Some(Self::Exec),
            8 => Some(Self::Retr),
            255 => Some(Self::Err),
            _ => None,
        }
    }
}

/// `Options` values for `PING`.
pub mod ping {
    /// Address one device by UID.
    pub const OWN: u32 = 0;
    /// Broadcast discovery: every node announces itself and re-emits.
    pub const ALL: u32 = 1;
}

/// `Options` values for `SENSORS`.
pub mod sensors {
    pub const ALL: u32 = 0;
    pub const TEMP: u32 = 1;
    pub const VDD: u32 = 2;
}

/// `Options` values carried by an `ERR` packet. The kind space is
/// extensible; these are the kinds nodes currently produce.
pub mod err {
    pub const CHECKSUM_MISMATCH: u32 = 1;
    pub const BAD_OFFSET: u32 = 2;
}

// ── Codec errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("packet is {actual} bytes, wire packets are exactly {expected}")]
    MalformedLength { expected: usize, actual: usize },
    #[error("packet was not finalized before transmission")]
    Uncrafted,
    #[error("uid is {0} bytes, the uid field holds at most {UID_LEN}")]
    UidOverflow(usize),
    #[error("data is {0} bytes, the data field holds at most {BLOCK_LEN}")]
    DataOverflow(usize),
}

// ── Packet ────────────────────────────────────────────────────────────────────

/// One fixed-size wire packet.
///
/// Field mutation clears the internal "crafted" bit; [`Packet::finalize`]
/// recomputes and installs the checksum and sets it again. [`Packet::encode`]
/// refuses un-crafted packets, which is what keeps stale checksums off the
/// wire as PIC mutates hop by hop.
#[derive(Clone)]
pub struct Packet {
    command: u8,
    pic: u8,
    options: u32,
    uid: [u8; UID_LEN],
    data: [u8; BLOCK_LEN],
    checksum: u16,
    crafted: bool,
}

impl Packet {
    pub fn new(command: Command) -> Self {
        Self {
            command: command as u8,
            pic: 0,
            options: 0,
            uid: [0; UID_LEN],
            data: [0; BLOCK_LEN],
            checksum: 0,
            crafted: false,
        }
    }

    // ── accessors ──

    pub fn raw_command(&self) -> u8 {
        self.command
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_u8(self.command)
    }

    pub fn pic(&self) -> u8 {
        self.pic
    }

    pub fn options(&self) -> u32 {
        self.options
    }

    pub fn uid(&self) -> &[u8; UID_LEN] {
        &self.uid
    }

    /// UID as text: bytes up to the first NUL, lossily decoded.
    pub fn uid_str(&self) -> String {
        let end = self.uid.iter().position(|&b| b == 0).unwrap_or(UID_LEN);
        String::from_utf8_lossy(&self.uid[..end]).into_owned()
    }

    pub fn is_broadcast(&self) -> bool {
        self.uid == BROADCAST_UID
    }

    pub fn data(&self) -> &[u8; BLOCK_LEN] {
        &self.data
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    pub fn is_crafted(&self) -> bool {
        self.crafted
    }

    // ── mutation (clears the crafted bit) ──

    pub fn set_command(&mut self, command: Command) {
        self.command = command as u8;
        self.crafted = false;
    }

    pub fn set_pic(&mut self, pic: u8) {
        self.pic = pic;
        self.crafted = false;
    }

    /// One forwarding hop: PIC increments away from the station.
    pub fn bump_pic(&mut self) {
        self.pic = self.pic.wrapping_add(1);
        self.crafted = false;
    }

    pub fn set_options(&mut self, options: u32) {
        self.options = options;
        self.crafted = false;
    }

    /// Install an ASCII identity, NUL-padded to the field width.
    pub fn set_uid(&mut self, uid: &str) -> Result<(), WireError> {
        let bytes = uid.as_bytes();
        if bytes.len() > UID_LEN {
            return Err(WireError::UidOverflow(bytes.len()));
        }
        self.uid = [0; UID_LEN];
        self.uid[..bytes.len()].copy_from_slice(bytes);
        self.crafted = false;
        Ok(())
    }

    pub fn set_uid_bytes(&mut self, uid: [u8; UID_LEN]) {
        self.uid = uid;
        self.crafted = false;
    }

    pub fn set_broadcast(&mut self) {
        self.uid = BROADCAST_UID;
        self.crafted = false;
    }

    /// Install a payload, zero-padded to the block size.
    pub fn set_data(&mut self, data: &[u8]) -> Result<(), WireError> {
        if data.len() > BLOCK_LEN {
            return Err(WireError::DataOverflow(data.len()));
        }
        self.data = [0; BLOCK_LEN];
        self.data[..data.len()].copy_from_slice(data);
        self.crafted = false;
        Ok(())
    }

    // ── checksum ──

    /// CRC-16/ARC over the canonical form (checksum field zeroed).
    fn canonical_checksum(&self) -> u16 {
        let mut digest = CRC16.digest();
        digest.update(&[self.command, self.pic]);
        digest.update(&self.options.to_le_bytes());
        digest.update(&self.uid);
        digest.update(&self.data);
        digest.update(&[0, 0]);
        digest.finalize()
    }

    /// Compute and install the checksum. Idempotent; required before
    /// [`Packet::encode`].
    pub fn finalize(&mut self) {
        self.checksum = self.canonical_checksum();
        self.crafted = true;
    }

    /// True when the stored checksum matches the canonical recomputation.
    pub fn verify(&self) -> bool {
        self.checksum == self.canonical_checksum()
    }

    // ── wire ──

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if !self.crafted {
            return Err(WireError::Uncrafted);
        }
        Ok(self.raw_encode())
    }

    /// Finalize and encode in one step. This is the transmit path on
    /// nodes, where every hop mutates PIC and must recompute the checksum.
    pub fn seal(&mut self) -> Vec<u8> {
        self.finalize();
        self.raw_encode()
    }

    fn raw_encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKET_LEN);
        out.push(self.command);
        out.push(self.pic);
        out.extend_from_slice(&self.options.to_le_bytes());
        out.extend_from_slice(&self.uid);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Packet, WireError> {
        if bytes.len() != PACKET_LEN {
            return Err(WireError::MalformedLength {
                expected: PACKET_LEN,
                actual: bytes.len(),
            });
        }
        let mut uid = [0u8; UID_LEN];
        uid.copy_from_slice(&bytes[HEADER_LEN..HEADER_LEN + UID_LEN]);
        let mut data = [0u8; BLOCK_LEN];
        data.copy_from_slice(&bytes[HEADER_LEN + UID_LEN..PACKET_LEN - CHECKSUM_LEN]);
        Ok(Packet {
            command: bytes[0],
            pic: bytes[1],
            options: u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            uid,
            data,
            checksum: u16::from_le_bytes([bytes[PACKET_LEN - 2], bytes[PACKET_LEN - 1]]),
            crafted: true,
        })
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("command", &self.command)
            .field("pic", &self.pic)
            .field("options", &self.options)
            .field("uid", &self.uid_str())
            .field("checksum", &format_args!("{:#06x}", self.checksum))
            .finish_non_exhaustive()
    }
}

// ── Sensor frame ──────────────────────────────────────────────────────────────

/// Telemetry words carried in a `SENSORS` response payload.
///
/// Wire layout for `SENSORS/ALL` is five little-endian u16 words:
/// `temp110_cal, temp30_cal, temperature_raw, vdd_cal, voltage_raw`.
/// The `TEMP` subset carries the first three, `VDD` the last two.
/// Boards without a calibration word report it as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorFrame {
    pub temp110_cal: u16,
    pub temp30_cal: u16,
    pub temperature_raw: u16,
    pub vdd_cal: u16,
    pub voltage_raw: u16,
}

impl SensorFrame {
    pub const ALL_WIRE_LEN: usize = 10;

    pub fn write_all(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.temp110_cal.to_le_bytes());
        out[2..4].copy_from_slice(&self.temp30_cal.to_le_bytes());
        out[4..6].copy_from_slice(&self.temperature_raw.to_le_bytes());
        out[6..8].copy_from_slice(&self.vdd_cal.to_le_bytes());
        out[8..10].copy_from_slice(&self.voltage_raw.to_le_bytes());
    }

    pub fn write_temp(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.temp110_cal.to_le_bytes());
        out[2..4].copy_from_slice(&self.temp30_cal.to_le_bytes());
        out[4..6].copy_from_slice(&self.temperature_raw.to_le_bytes());
    }

    pub fn write_vdd(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.vdd_cal.to_le_bytes());
        out[2..4].copy_from_slice(&self.voltage_raw.to_le_bytes());
    }

    pub fn read_all(data: &[u8]) -> Self {
        let word = |i: usize| u16::from_le_bytes([data[2 * i], data[2 * i + 1]]);
        Self {
            temp110_cal: word(0),
            temp30_cal: word(1),
            temperature_raw: word(2),
            vdd_cal: word(3),
            voltage_raw: word(4),
        }
    }
}

// ── Station-side records ──────────────────────────────────────────────────────

/// One known device in a chain, learned during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub uid: String,
    /// Distance from the station; 1 is the chain head.
    pub pic: u8,
    /// SRAM bytes the device announced.
    pub sram_size: u32,
    pub last_seen: DateTime<Utc>,
}

/// One captured SRAM block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub uid: String,
    pub board_kind: String,
    pub pic: u8,
    pub block_offset: u32,
    pub payload: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

/// One environmental telemetry capture. Raw and calibration words are
/// preserved as read; conversion to physical units is a consumer concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorRecord {
    pub uid: String,
    pub board_kind: String,
    pub temperature_raw: u16,
    pub voltage_raw: u16,
    pub temp30_cal: u16,
    pub temp110_cal: u16,
    pub vdd_cal: u16,
    pub captured_at: DateTime<Utc>,
}

// ── Chain link transport ──────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Deadline elapsed before a full packet arrived. Recoverable; the
    /// link retains no partial state.
    #[error("timed out waiting for a packet")]
    TimedOut,
    #[error("link is powered off")]
    PoweredOff,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("link i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Port(String),
}

/// Half-duplex framed packet transport into the head of one chain.
///
/// Implementations: the station's serial port, and the in-process virtual
/// chain used for protocol development and tests. A Reader owns its link
/// exclusively and never interleaves exchanges for different commands.
#[async_trait::async_trait]
pub trait ChainLink: Send {
    async fn send(&mut self, packet: &Packet) -> Result<(), LinkError>;

    /// Block until one full packet or the deadline. A timeout leaves the
    /// link clean; the next receive starts from an empty buffer.
    async fn receive(&mut self, deadline: Duration) -> Result<Packet, LinkError>;

    async fn power_on(&mut self) -> Result<(), LinkError>;

    async fn power_off(&mut self) -> Result<(), LinkError>;

    /// Toggle the power pin with a settle delay; devices re-run SRAM
    /// power-up, so the membership table must be re-discovered after.
    async fn power_cycle(&mut self) -> Result<(), LinkError>;

    fn is_powered(&self) -> bool;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_arc_check_vector() {
        // The standard CRC-16/ARC check value.
        assert_eq!(CRC16.checksum(b"123456789"), 0xBB3D);
    }

    #[test]
    fn packet_is_exactly_wire_sized() {
        let mut p = Packet::new(Command::Ping);
        p.finalize();
        assert_eq!(p.encode().unwrap().len(), PACKET_LEN);
        assert_eq!(PACKET_LEN, 6 + 25 + BLOCK_LEN + 2);
    }

    #[test]
    fn encode_refuses_uncrafted() {
        let p = Packet::new(Command::Read);
        assert_eq!(p.encode().unwrap_err(), WireError::Uncrafted);
    }

    #[test]
    fn mutation_clears_crafted() {
        let mut p = Packet::new(Command::Read);
        p.finalize();
        assert!(p.is_crafted());
        p.bump_pic();
        assert!(!p.is_crafted());
        assert_eq!(p.encode().unwrap_err(), WireError::Uncrafted);
    }

    #[test]
    fn decode_roundtrip() {
        let mut p = Packet::new(Command::Write);
        p.set_pic(3);
        p.set_options(7);
        p.set_uid("NUCLEO-0042").unwrap();
        p.set_data(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        p.finalize();

        let decoded = Packet::decode(&p.encode().unwrap()).unwrap();
        assert_eq!(decoded.raw_command(), Command::Write as u8);
        assert_eq!(decoded.pic(), 3);
        assert_eq!(decoded.options(), 7);
        assert_eq!(decoded.uid_str(), "NUCLEO-0042");
        assert_eq!(&decoded.data()[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(decoded.checksum(), p.checksum());
        assert!(decoded.verify());
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut p = Packet::new(Command::Sensors);
        p.set_uid("A").unwrap();
        p.finalize();
        let first = p.checksum();
        p.finalize();
        assert_eq!(p.checksum(), first);
    }

    #[test]
    fn corrupted_byte_fails_verify() {
        let mut p = Packet::new(Command::Read);
        p.set_uid("X").unwrap();
        p.finalize();
        let mut bytes = p.encode().unwrap();
        bytes[HEADER_LEN + 2] ^= 0x40;
        let decoded = Packet::decode(&bytes).unwrap();
        assert!(!decoded.verify());
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = Packet::decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, WireError::MalformedLength { actual: 10, .. }));
    }

    #[test]
    fn broadcast_sentinel() {
        let mut p = Packet::new(Command::Ping);
        p.set_broadcast();
        assert!(p.is_broadcast());
        p.set_uid("DISCO-7").unwrap();
        assert!(!p.is_broadcast());
    }

    #[test]
    fn uid_overflow_rejected() {
        let mut p = Packet::new(Command::Ping);
        let long = "X".repeat(UID_LEN + 1);
        assert!(matches!(p.set_uid(&long), Err(WireError::UidOverflow(_))));
    }

    #[test]
    fn sensor_frame_roundtrip() {
        let frame = SensorFrame {
            temp110_cal: 0x0456,
            temp30_cal: 0x0123,
            temperature_raw: 0x0311,
            vdd_cal: 0x05AA,
            voltage_raw: 0x0D05,
        };
        let mut wire = [0u8; SensorFrame::ALL_WIRE_LEN];
        frame.write_all(&mut wire);
        assert_eq!(SensorFrame::read_all(&wire), frame);
        // Little-endian word order starts with temp110_cal.
        assert_eq!(&wire[..2], &[0x56, 0x04]);
    }
}
