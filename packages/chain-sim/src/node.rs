//! node.rs — per-device forwarding state machine
//!
//! Every node in a chain runs this loop, regardless of position:
//!
//! 1. a full packet lands in the upstream DMA buffer
//! 2. CRC over the canonical form; mismatch answers `ERR`/checksum upstream
//! 3. `pic += 1` — every hop away from the station increments
//! 4. dispatch: commands addressed to this UID (or broadcast) are answered
//!    upstream, everything else is re-sealed and forwarded downstream
//!
//! The downstream buffer is a side channel: whatever arrives there is the
//! return traffic of a node further down and is retransmitted upstream
//! verbatim, without inspection. The two buffers are never mixed, which is
//! the only concurrency discipline the device needs.

use chain_types::{
    err, ping, sensors, Command, Packet, SensorFrame, BLOCK_LEN, OUTPUT_LEN, PACKET_LEN,
    STAGING_LEN, UID_LEN,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tracing::trace;

use crate::interp::{Interpreter, RpnInterpreter};
use crate::sram::PowerUpModel;

// ── Frames ────────────────────────────────────────────────────────────────────

/// One wire transmission leaving a node, tagged with its direction of
/// travel. Upstream is toward the station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Upstream(Vec<u8>),
    Downstream(Vec<u8>),
}

// ── DMA receive buffer ────────────────────────────────────────────────────────

/// One-packet receive buffer with the byte counter the DMA completion
/// handler maintains on hardware.
struct DmaBuffer {
    buf: [u8; PACKET_LEN],
    fill: usize,
}

impl DmaBuffer {
    fn new() -> Self {
        Self {
            buf: [0; PACKET_LEN],
            fill: 0,
        }
    }

    /// Accept bytes off the line; returns how many were consumed before
    /// the buffer filled.
    fn push(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(PACKET_LEN - self.fill);
        self.buf[self.fill..self.fill + take].copy_from_slice(&bytes[..take]);
        self.fill += take;
        take
    }

    fn is_full(&self) -> bool {
        self.fill == PACKET_LEN
    }

    /// Take the completed packet and rearm for the next one.
    fn drain(&mut self) -> [u8; PACKET_LEN] {
        let out = self.buf;
        self.fill = 0;
        out
    }

    fn clear(&mut self) {
        self.fill = 0;
    }
}

// ── Sensor bank ───────────────────────────────────────────────────────────────

struct SensorBank {
    base: SensorFrame,
    jitter: Option<Normal<f64>>,
    rng: StdRng,
}

impl SensorBank {
    fn new(base: SensorFrame, jitter: f64, seed: u64) -> Self {
        Self {
            base,
            jitter: if jitter > 0.0 {
                Normal::new(0.0, jitter).ok()
            } else {
                None
            },
            rng: StdRng::seed_from_u64(seed ^ 0x5EB5),
        }
    }

    /// Calibration words are factory constants; only the raw readings move.
    fn read(&mut self) -> SensorFrame {
        let mut frame = self.base;
        if let Some(noise) = &self.jitter {
            let wobble = |raw: u16, n: f64| (raw as f64 + n).clamp(0.0, u16::MAX as f64) as u16;
            frame.temperature_raw = wobble(frame.temperature_raw, noise.sample(&mut self.rng));
            frame.voltage_raw = wobble(frame.voltage_raw, noise.sample(&mut self.rng));
        }
        frame
    }
}

// ── Node ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub uid: String,
    /// SRAM bytes; a whole multiple of [`BLOCK_LEN`].
    pub sram_size: usize,
    /// Seed for the device-characteristic power-up pattern.
    pub seed: u64,
    /// Per-bit flip probability between power cycles.
    pub flip_prob: f64,
    pub sensors: SensorFrame,
    /// Gaussian standard deviation on the raw sensor words, 0 = static.
    pub sensor_jitter: f64,
}

impl NodeConfig {
    /// A stable, noiseless device — the default for protocol tests.
    pub fn basic(uid: &str, sram_size: usize) -> Self {
        let seed = uid
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
                (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
            });
        Self {
            uid: uid.to_string(),
            sram_size,
            seed,
            flip_prob: 0.0,
            sensors: SensorFrame {
                temp110_cal: 0x04E6,
                temp30_cal: 0x03DE,
                temperature_raw: 0x0401,
                vdd_cal: 0x059C,
                voltage_raw: 0x05B2,
            },
            sensor_jitter: 0.0,
        }
    }
}

/// One simulated device.
pub struct Node {
    uid: [u8; UID_LEN],
    sram: Vec<u8>,
    power_up: PowerUpModel,
    sensors: SensorBank,
    staging: Box<[u8]>,
    output: Box<[u8]>,
    out_ptr: usize,
    interpreter: Box<dyn Interpreter>,
    up: DmaBuffer,
    down: DmaBuffer,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        Self::with_interpreter(config, Box::new(RpnInterpreter))
    }

    pub fn with_interpreter(config: NodeConfig, interpreter: Box<dyn Interpreter>) -> Self {
        let mut uid = [0u8; UID_LEN];
        let take = config.uid.len().min(UID_LEN);
        uid[..take].copy_from_slice(&config.uid.as_bytes()[..take]);
        let mut power_up = PowerUpModel::new(config.seed, config.sram_size, config.flip_prob);
        let sram = power_up.sample();
        Self {
            uid,
            sram,
            power_up,
            sensors: SensorBank::new(config.sensors, config.sensor_jitter, config.seed),
            staging: vec![0u8; STAGING_LEN].into_boxed_slice(),
            output: vec![0u8; OUTPUT_LEN].into_boxed_slice(),
            out_ptr: 0,
            interpreter,
            up: DmaBuffer::new(),
            down: DmaBuffer::new(),
        }
    }

    pub fn uid_str(&self) -> String {
        let end = self.uid.iter().position(|&b| b == 0).unwrap_or(UID_LEN);
        String::from_utf8_lossy(&self.uid[..end]).into_owned()
    }

    pub fn sram(&self) -> &[u8] {
        &self.sram
    }

    /// Overwrite the SRAM image wholesale (bench seeding in tests).
    pub fn set_sram(&mut self, image: &[u8]) {
        let take = image.len().min(self.sram.len());
        self.sram[..take].copy_from_slice(&image[..take]);
    }

    fn sram_size(&self) -> u32 {
        self.sram.len() as u32
    }

    fn block_count(&self) -> usize {
        self.sram.len() / BLOCK_LEN
    }

    /// Power loss and restore: fresh SRAM power-up draw, everything else
    /// volatile is cleared.
    pub fn power_cycle(&mut self) {
        self.sram = self.power_up.sample();
        self.staging.fill(0);
        self.output.fill(0);
        self.out_ptr = 0;
        self.up.clear();
        self.down.clear();
    }

    // ── receive paths ──

    /// Bytes arriving from the station side. Returns every frame the node
    /// transmits in response, in emission order.
    pub fn feed_upstream(&mut self, mut bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        while !bytes.is_empty() {
            let consumed = self.up.push(bytes);
            bytes = &bytes[consumed..];
            if self.up.is_full() {
                let raw = self.up.drain();
                frames.extend(self.process_upstream(&raw));
            }
        }
        frames
    }

    /// Bytes arriving from the node below: return-path traffic. The
    /// side-channel retransmits completed packets upstream verbatim.
    pub fn feed_downstream(&mut self, mut bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        while !bytes.is_empty() {
            let consumed = self.down.push(bytes);
            bytes = &bytes[consumed..];
            if self.down.is_full() {
                frames.push(Frame::Upstream(self.down.drain().to_vec()));
            }
        }
        frames
    }

    // ── main loop ──

    fn process_upstream(&mut self, raw: &[u8; PACKET_LEN]) -> Vec<Frame> {
        let mut pkt = match Packet::decode(raw) {
            Ok(p) => p,
            // The buffer is exactly packet-sized; decode can only fail on
            // length, which cannot happen here.
            Err(_) => return Vec::new(),
        };

        if !pkt.verify() {
            trace!(uid = %self.uid_str(), "checksum mismatch, answering ERR");
            pkt.set_command(Command::Err);
            pkt.set_options(err::CHECKSUM_MISMATCH);
            pkt.bump_pic();
            return vec![Frame::Upstream(pkt.seal())];
        }

        pkt.bump_pic();
        self.dispatch(pkt)
    }

    fn matches(&self, pkt: &Packet) -> bool {
        pkt.is_broadcast() || pkt.uid() == &self.uid
    }

    fn answer_up(mut pkt: Packet) -> Vec<Frame> {
        vec![Frame::Upstream(pkt.seal())]
    }

    fn forward_down(mut pkt: Packet) -> Vec<Frame> {
        vec![Frame::Downstream(pkt.seal())]
    }

    fn answer_err(mut pkt: Packet, kind: u32) -> Vec<Frame> {
        pkt.set_command(Command::Err);
        pkt.set_options(kind);
        vec![Frame::Upstream(pkt.seal())]
    }

    fn dispatch(&mut self, mut pkt: Packet) -> Vec<Frame> {
        let command = match pkt.command() {
            Some(c) => c,
            // Unknown opcode: station-bound, let the operator see it.
            None => return Self::answer_up(pkt),
        };

        match command {
            Command::Ping => self.on_ping(pkt),
            Command::Read => {
                if !self.matches(&pkt) {
                    return Self::forward_down(pkt);
                }
                let block = pkt.options() as usize;
                if block >= self.block_count() {
                    return Self::answer_err(pkt, err::BAD_OFFSET);
                }
                let span = &self.sram[block * BLOCK_LEN..(block + 1) * BLOCK_LEN];
                // Block length always fits the data field.
                let _ = pkt.set_data(span);
                pkt.set_command(Command::Ack);
                Self::answer_up(pkt)
            }
            Command::Write => {
                if !self.matches(&pkt) {
                    return Self::forward_down(pkt);
                }
                let block = pkt.options() as usize;
                if block >= self.block_count() {
                    return Self::answer_err(pkt, err::BAD_OFFSET);
                }
                self.sram[block * BLOCK_LEN..(block + 1) * BLOCK_LEN].copy_from_slice(pkt.data());
                pkt.set_command(Command::Ack);
                Self::answer_up(pkt)
            }
            Command::Sensors => {
                if !self.matches(&pkt) {
                    return Self::forward_down(pkt);
                }
                let frame = self.sensors.read();
                let mut payload = [0u8; SensorFrame::ALL_WIRE_LEN];
                match pkt.options() {
                    sensors::TEMP => frame.write_temp(&mut payload),
                    sensors::VDD => frame.write_vdd(&mut payload),
                    _ => frame.write_all(&mut payload),
                }
                let _ = pkt.set_data(&payload);
                pkt.set_command(Command::Ack);
                Self::answer_up(pkt)
            }
            Command::Load => {
                if !self.matches(&pkt) {
                    return Self::forward_down(pkt);
                }
                let offset = pkt.options() as usize * BLOCK_LEN;
                if offset + BLOCK_LEN > STAGING_LEN {
                    return Self::answer_err(pkt, err::BAD_OFFSET);
                }
                self.staging[offset..offset + BLOCK_LEN].copy_from_slice(pkt.data());
                pkt.set_command(Command::Ack);
                Self::answer_up(pkt)
            }
            Command::Exec => {
                if !self.matches(&pkt) {
                    return Self::forward_down(pkt);
                }
                if pkt.options() == 1 {
                    self.out_ptr = 0;
                }
                let end = self
                    .staging
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(STAGING_LEN);
                let source = String::from_utf8_lossy(&self.staging[..end]).into_owned();
                let Self {
                    interpreter,
                    output,
                    out_ptr,
                    ..
                } = self;
                let mut sink = |bytes: &[u8]| {
                    let take = bytes.len().min(OUTPUT_LEN - *out_ptr);
                    output[*out_ptr..*out_ptr + take].copy_from_slice(&bytes[..take]);
                    *out_ptr += take;
                };
                let code = interpreter.eval(&source, &mut sink);
                pkt.set_options(code as u32);
                pkt.set_command(Command::Ack);
                Self::answer_up(pkt)
            }
            Command::Retr => {
                if !self.matches(&pkt) {
                    return Self::forward_down(pkt);
                }
                let block = pkt.options() as usize;
                if block >= OUTPUT_LEN / BLOCK_LEN {
                    return Self::answer_err(pkt, err::BAD_OFFSET);
                }
                let span = &self.output[block * BLOCK_LEN..(block + 1) * BLOCK_LEN];
                let _ = pkt.set_data(span);
                pkt.set_command(Command::Ack);
                Self::answer_up(pkt)
            }
            // Station-bound traffic that landed on the upstream buffer
            // keeps heading to the station.
            Command::Ack | Command::Err => Self::answer_up(pkt),
        }
    }

    /// `PING/OWN` answers only when addressed; `PING/ALL` makes every node
    /// announce itself and re-emit the probe so the rest of the chain does
    /// the same.
    fn on_ping(&mut self, mut pkt: Packet) -> Vec<Frame> {
        match pkt.options() {
            ping::ALL => {
                let mut ack = pkt.clone();
                ack.set_uid_bytes(self.uid);
                ack.set_command(Command::Ack);
                ack.set_options(self.sram_size());
                let mut frames = vec![Frame::Upstream(ack.seal())];
                frames.push(Frame::Downstream(pkt.seal()));
                frames
            }
            _ => {
                if self.matches(&pkt) {
                    pkt.set_command(Command::Ack);
                    pkt.set_options(self.sram_size());
                    Self::answer_up(pkt)
                } else {
                    Self::forward_down(pkt)
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
