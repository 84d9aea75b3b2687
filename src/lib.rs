//! Link-layer protocol engine for the LEGO RCX over a serial or USB IR tower.
//!
//! Layers, leaf first: [`transport`], [`port`] and [`usb`] move bytes,
//! [`proto::codec`] frames them, [`transceiver`] runs one request/reply
//! exchange, [`brick`] names the commands, [`transfer`] sends buffers in
//! blocks and [`download`] sequences whole firmware and program downloads.

pub mod brick;
pub mod download;
pub mod error;
pub mod image;
pub mod port;
pub mod proto;
pub mod stats;
pub mod transceiver;
pub mod transfer;
pub mod transport;
pub mod usb;

#[cfg(test)]
mod testing;

pub use brick::Brick;
pub use error::{RcxError, Result};
pub use transceiver::{EchoPolicy, LinkConfig, Reply, Transceiver};
pub use transport::{LineSpeed, Transport};
