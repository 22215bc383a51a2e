//! chain.rs — a daisy chain of simulated nodes behind the station link
//!
//! `VirtualChain` wires N nodes head-to-tail and implements [`ChainLink`],
//! so the station's Reader drives it exactly like a serial port. Frame
//! propagation is a FIFO bucket brigade: a node's emissions are delivered
//! in order, downstream frames to the next node's upstream buffer and
//! upstream frames to the previous node's downstream buffer (or to the
//! station queue at the head). The last node's downstream line is
//! unterminated; frames that reach it fall off the end, as on hardware.
//!
//! Fault injection covers the Reader's error paths: responses from a given
//! device can be corrupted in flight or dropped entirely.

use std::collections::VecDeque;
use std::time::Duration;

use chain_types::{ChainLink, LinkError, Packet, PACKET_LEN};
use tracing::debug;

use crate::node::{Frame, Node, NodeConfig};

// ── Fault injection ───────────────────────────────────────────────────────────

/// What goes wrong on the return path. Matched against the responding
/// packet's UID field.
#[derive(Debug, Default, Clone)]
pub struct FaultPlan {
    /// Flip a payload byte of every response from this device.
    pub corrupt_from: Option<String>,
    /// Swallow every response from this device.
    pub drop_from: Option<String>,
}

// ── Virtual chain ─────────────────────────────────────────────────────────────

enum Delivery {
    FromAbove(Vec<u8>),
    FromBelow(Vec<u8>),
}

pub struct VirtualChain {
    nodes: Vec<Node>,
    station_rx: VecDeque<Vec<u8>>,
    powered: bool,
    faults: FaultPlan,
    /// Command byte of every packet the station injected, in order.
    injected: Vec<u8>,
}

impl VirtualChain {
    pub fn new(configs: Vec<NodeConfig>) -> Self {
        Self {
            nodes: configs.into_iter().map(Node::new).collect(),
            station_rx: VecDeque::new(),
            powered: false,
            faults: FaultPlan::default(),
            injected: Vec::new(),
        }
    }

    /// Uniform chain of stable devices `{prefix}-1 … {prefix}-N`.
    pub fn uniform(prefix: &str, count: usize, sram_size: usize) -> Self {
        Self::new(
            (1..=count)
                .map(|i| NodeConfig::basic(&format!("{prefix}-{i}"), sram_size))
                .collect(),
        )
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut Node {
        &mut self.nodes[index]
    }

    pub fn faults_mut(&mut self) -> &mut FaultPlan {
        &mut self.faults
    }

    /// Command codes injected so far (tests assert on what actually went
    /// onto the wire, e.g. "no WRITE was emitted").
    pub fn injected_commands(&self) -> &[u8] {
        &self.injected
    }

    /// Push raw bytes onto the head node's upstream line and run the
    /// brigade to quiescence. Accepts corrupt frames, which is the point:
    /// tests exercise the nodes' checksum path through here.
    pub fn inject_raw(&mut self, bytes: &[u8]) {
        if let Some(&command) = bytes.first() {
            self.injected.push(command);
        }
        if self.nodes.is_empty() {
            return;
        }

        let mut work = VecDeque::new();
        work.push_back((0usize, Delivery::FromAbove(bytes.to_vec())));
        while let Some((index, delivery)) = work.pop_front() {
            let frames = match delivery {
                Delivery::FromAbove(b) => self.nodes[index].feed_upstream(&b),
                Delivery::FromBelow(b) => self.nodes[index].feed_downstream(&b),
            };
            for frame in frames {
                match frame {
                    Frame::Upstream(b) => {
                        if index == 0 {
                            self.deliver_to_station(b);
                        } else {
                            work.push_back((index - 1, Delivery::FromBelow(b)));
                        }
                    }
                    Frame::Downstream(b) => {
                        if index + 1 < self.nodes.len() {
                            work.push_back((index + 1, Delivery::FromAbove(b)));
                        }
                    }
                }
            }
        }
    }

    fn deliver_to_station(&mut self, mut bytes: Vec<u8>) {
        if bytes.len() == PACKET_LEN {
            if let Ok(pkt) = Packet::decode(&bytes) {
                let uid = pkt.uid_str();
                if self.faults.drop_from.as_deref() == Some(uid.as_str()) {
                    debug!(%uid, "fault plan: dropping response");
                    return;
                }
                if self.faults.corrupt_from.as_deref() == Some(uid.as_str()) {
                    debug!(%uid, "fault plan: corrupting response");
                    bytes[PACKET_LEN / 2] ^= 0x55;
                }
            }
        }
        self.station_rx.push_back(bytes);
    }
}

#[async_trait::async_trait]
impl ChainLink for VirtualChain {
    async fn send(&mut self, packet: &Packet) -> Result<(), LinkError> {
        if !self.powered {
            return Err(LinkError::PoweredOff);
        }
        let bytes = packet.encode()?;
        self.inject_raw(&bytes);
        Ok(())
    }

    async fn receive(&mut self, _deadline: Duration) -> Result<Packet, LinkError> {
        if !self.powered {
            return Err(LinkError::PoweredOff);
        }
        // The virtual chain settles synchronously inside send(), so an
        // empty queue is already a timeout.
        match self.station_rx.pop_front() {
            Some(bytes) => Ok(Packet::decode(&bytes)?),
            None => Err(LinkError::TimedOut),
        }
    }

    async fn power_on(&mut self) -> Result<(), LinkError> {
        self.powered = true;
        Ok(())
    }

    async fn power_off(&mut self) -> Result<(), LinkError> {
        self.powered = false;
        self.station_rx.clear();
        Ok(())
    }

    async fn power_cycle(&mut self) -> Result<(), LinkError> {
        for node in &mut self.nodes {
            node.power_cycle();
        }
        self.station_rx.clear();
        self.powered = true;
        Ok(())
    }

    fn is_powered(&self) -> bool {
        self.powered
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chain_types::{ping, Command, BLOCK_LEN};

    fn broadcast_ping() -> Packet {
        let mut probe = Packet::new(Command::Ping);
        probe.set_options(ping::ALL);
        probe.set_broadcast();
        probe.finalize();
        probe
    }

    #[tokio::test]
    async fn discovery_walks_the_whole_chain_in_order() {
        let mut chain = VirtualChain::uniform("NODE", 3, 4 * BLOCK_LEN);
        chain.power_on().await.unwrap();
        chain.send(&broadcast_ping()).await.unwrap();

        for expected_pic in 1..=3u8 {
            let ack = chain.receive(Duration::from_millis(10)).await.unwrap();
            assert_eq!(ack.command(), Some(Command::Ack));
            assert_eq!(ack.pic(), expected_pic);
            assert_eq!(ack.uid_str(), format!("NODE-{expected_pic}"));
            assert!(ack.verify());
        }
        assert!(matches!(
            chain.receive(Duration::from_millis(10)).await,
            Err(LinkError::TimedOut)
        ));
    }

    #[tokio::test]
    async fn addressed_read_reaches_a_mid_chain_device() {
        let mut chain = VirtualChain::uniform("NODE", 3, 4 * BLOCK_LEN);
        chain.power_on().await.unwrap();
        chain.node_mut(1).set_sram(&vec![0x5A; 4 * BLOCK_LEN]);

        let mut req = Packet::new(Command::Read);
        req.set_uid("NODE-2").unwrap();
        req.set_options(0);
        req.finalize();
        chain.send(&req).await.unwrap();

        let ack = chain.receive(Duration::from_millis(10)).await.unwrap();
        assert_eq!(ack.command(), Some(Command::Ack));
        assert_eq!(ack.uid_str(), "NODE-2");
        assert_eq!(ack.pic(), 2, "response pic is the originator's distance");
        assert!(ack.data().iter().all(|&b| b == 0x5A));
    }

    #[tokio::test]
    async fn powered_off_link_refuses_traffic() {
        let mut chain = VirtualChain::uniform("NODE", 1, 4 * BLOCK_LEN);
        assert!(matches!(
            chain.send(&broadcast_ping()).await,
            Err(LinkError::PoweredOff)
        ));
    }

    #[tokio::test]
    async fn power_cycle_redraws_noisy_sram() {
        let mut chain = VirtualChain::new(vec![NodeConfig {
            flip_prob: 0.2,
            ..NodeConfig::basic("NODE-1", BLOCK_LEN)
        }]);
        chain.power_on().await.unwrap();
        let before = chain.node(0).sram().to_vec();
        chain.power_cycle().await.unwrap();
        assert!(chain.is_powered());
        assert_ne!(
            chain.node(0).sram(),
            &before[..],
            "a noisy device must not power up identically"
        );
    }

    #[tokio::test]
    async fn fault_plan_corrupts_responses() {
        let mut chain = VirtualChain::uniform("NODE", 2, 4 * BLOCK_LEN);
        chain.power_on().await.unwrap();
        chain.faults_mut().corrupt_from = Some("NODE-2".into());
        chain.send(&broadcast_ping()).await.unwrap();

        let first = chain.receive(Duration::from_millis(10)).await.unwrap();
        assert!(first.verify());
        let second = chain.receive(Duration::from_millis(10)).await.unwrap();
        assert!(!second.verify(), "NODE-2's announcement must be corrupted");
    }
}
