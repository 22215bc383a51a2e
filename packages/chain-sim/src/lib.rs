//! # chain-sim
//!
//! Hardware-accurate simulator for daisy-chained SRAM harvest devices.
//!
//! Every physical node in a chain runs the same firmware loop: two
//! one-packet DMA receive buffers (one per direction), a CRC check, a
//! position-in-chain increment, and a command dispatch that either answers
//! upstream or forwards downstream. [`node::Node`] reproduces that loop
//! byte for byte; [`chain::VirtualChain`] wires N nodes head-to-tail and
//! implements the station's [`chain_types::ChainLink`] transport, so the
//! full station stack can be developed and tested with no hardware on the
//! bench.
//!
//! The parts a real board brings along are modeled too:
//! - [`sram::PowerUpModel`] — per-device seeded power-up pattern with
//!   Bernoulli bit-flip noise between power cycles (the statistical object
//!   this platform harvests)
//! - a sensor bank with optional Gaussian jitter on the raw words
//! - a pluggable [`interp::Interpreter`] behind the LOAD/EXEC/RETR surface

pub mod chain;
pub mod interp;
pub mod node;
pub mod sram;

pub use chain::{FaultPlan, VirtualChain};
pub use interp::{Interpreter, RpnInterpreter};
pub use node::{Frame, Node, NodeConfig};
pub use sram::PowerUpModel;
