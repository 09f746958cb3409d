//! wallmon - firewall traffic monitor.
//!
//! Captures packets on every eligible interface, keeps only the link,
//! network and transport headers, and pushes them in batches to a remote
//! collector over an encrypted ZeroMQ channel. Traffic to the agent's own
//! configuration server and collector is excluded on the management interface.

pub mod buffer;
pub mod capture;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod shutdown;
pub mod sniffer;
pub mod stats;
pub mod transmitter;
pub mod wire;

pub use capture::{capture_loop, CaptureSource, FrameCallback, Listener, NextPacket};
pub use config::{CaptureSettings, Config};
pub use dispatcher::Dispatcher;
pub use error::{
    CaptureError, ConfigError, DecodeError, DispatchError, FilterError, SnifferError, TransmitError,
};
pub use shutdown::RunSignal;
pub use sniffer::{Sniffer, SnifferState};
pub use transmitter::{BatchSink, Transmitter};
pub use wire::{decode_batch, FrameRecord};
