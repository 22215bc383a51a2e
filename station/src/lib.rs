//! # sram-station
//!
//! Station-side half of the SRAM chain-harvest platform: everything that
//! runs on the workstation end of a serial line into a daisy chain of
//! harvest devices.
//!
//! One [`dispatcher::Dispatcher`] per chain subscribes to command records
//! on the message broker and hands each one to its [`reader::Reader`],
//! which plans the packet exchanges over the [`transport::SerialLink`],
//! keeps the [`table::ChainTable`] membership current, persists samples
//! through [`store::SampleStore`], and reports every outcome through the
//! [`sink::EventSink`].

pub mod config;
pub mod dispatcher;
pub mod reader;
pub mod sink;
pub mod store;
pub mod table;
pub mod transport;
