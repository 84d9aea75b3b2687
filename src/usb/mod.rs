//! LEGO USB IR tower.
//!
//! The tower is driven with vendor requests, all of them control IN
//! transfers. Each reply starts with its own length (u16, little endian) and
//! an error code; request specific fields follow. IR traffic goes over the
//! interrupt endpoints of interface 0. The device side lives behind the
//! `usb` feature.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::transport::LineSpeed;

#[cfg(feature = "usb")]
mod tower;
#[cfg(feature = "usb")]
pub use tower::UsbTowerTransport;

pub const VENDOR_ID: u16 = 0x0694;
pub const PRODUCT_ID: u16 = 0x0001;
/// High power configuration.
pub const CONFIGURATION: u8 = 2;
pub const INTERFACE: u8 = 0;

/// `Flush` value bits.
pub const FLUSH_TX: u16 = 0x01;
pub const FLUSH_RX: u16 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Request {
    Flush = 0x03,
    Reset = 0x04,
    SetTxSpeed = 0xEF,
    SetRxSpeed = 0xF1,
    GetTxState = 0xF2,
    GetVersion = 0xFD,
}

impl Request {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Length the tower announces in its reply.
    pub fn reply_len(self) -> usize {
        match self {
            Request::Flush | Request::Reset => 4,
            Request::SetTxSpeed | Request::SetRxSpeed | Request::GetTxState => 6,
            Request::GetVersion => 8,
        }
    }
}

/// Error code of a refused request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TowerStatus {
    BadParameter,
    Busy,
    NoPower,
    WrongMode,
    Internal,
    BadRequest,
    Unknown(u8),
}

impl From<u8> for TowerStatus {
    fn from(b: u8) -> Self {
        match b {
            0x01 => TowerStatus::BadParameter,
            0x02 => TowerStatus::Busy,
            0x03 => TowerStatus::NoPower,
            0x04 => TowerStatus::WrongMode,
            0xFE => TowerStatus::Internal,
            0xFF => TowerStatus::BadRequest,
            other => TowerStatus::Unknown(other),
        }
    }
}

impl fmt::Display for TowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TowerStatus::BadParameter => f.write_str("bad parameter"),
            TowerStatus::Busy => f.write_str("busy"),
            TowerStatus::NoPower => f.write_str("no power"),
            TowerStatus::WrongMode => f.write_str("wrong mode"),
            TowerStatus::Internal => f.write_str("internal error"),
            TowerStatus::BadRequest => f.write_str("bad request"),
            TowerStatus::Unknown(b) => write!(f, "error 0x{b:02X}"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TowerError {
    #[error("{request:?}: reply of {got} bytes, expected {expected}")]
    ShortReply {
        request: Request,
        expected: usize,
        got: usize,
    },
    #[error("{request:?} refused: {status}")]
    Refused {
        request: Request,
        status: TowerStatus,
    },
    #[error("{request:?}: speed code 0x{got:04X} set, wanted 0x{wanted:04X}")]
    SpeedNotApplied {
        request: Request,
        wanted: u16,
        got: u16,
    },
}

impl From<TowerError> for io::Error {
    fn from(e: TowerError) -> Self {
        io::Error::other(e)
    }
}

/// Tower encoding of a line speed.
pub fn speed_code(speed: LineSpeed) -> u16 {
    match speed {
        LineSpeed::Standard => 0x0008,
        LineSpeed::Fast => 0x0010,
    }
}

/// Check the length and error code every reply starts with.
pub fn check_reply(request: Request, reply: &[u8]) -> Result<(), TowerError> {
    let expected = request.reply_len();
    if reply.len() < expected {
        return Err(TowerError::ShortReply {
            request,
            expected,
            got: reply.len(),
        });
    }
    let size = usize::from(u16::from_le_bytes([reply[0], reply[1]]));
    if size != expected {
        return Err(TowerError::ShortReply {
            request,
            expected,
            got: size,
        });
    }
    match reply[2] {
        0 => Ok(()),
        code => Err(TowerError::Refused {
            request,
            status: code.into(),
        }),
    }
}

/// A speed request is applied when the tower echoes the speed code back.
pub fn check_speed(request: Request, reply: &[u8], speed: LineSpeed) -> Result<(), TowerError> {
    check_reply(request, reply)?;
    let wanted = speed_code(speed);
    let got = u16::from_le_bytes([reply[4], reply[5]]);
    if reply[3] != 0 || got != wanted {
        return Err(TowerError::SpeedNotApplied {
            request,
            wanted,
            got,
        });
    }
    Ok(())
}

/// Whether the transmitter can take another frame.
pub fn tx_ready(reply: &[u8]) -> Result<bool, TowerError> {
    check_reply(Request::GetTxState, reply)?;
    Ok(reply[4] == 0x01)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TowerVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
}

impl TowerVersion {
    pub fn parse(reply: &[u8]) -> Result<Self, TowerError> {
        check_reply(Request::GetVersion, reply)?;
        Ok(Self {
            major: reply[4],
            minor: reply[5],
            build: u16::from_le_bytes([reply[6], reply[7]]),
        })
    }
}

impl fmt::Display for TowerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} build {}", self.major, self.minor, self.build)
    }
}
