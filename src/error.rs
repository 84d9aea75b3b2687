use std::io;

use thiserror::Error;

use crate::download::Stage;
use crate::proto::codec::DecodeError;
use crate::proto::opcode::DownloadStatus;

#[derive(Debug, Error)]
pub enum RcxError {
    #[error("opcode 0x{opcode:02X} takes {expected} parameter bytes, got {got}")]
    ParameterCountMismatch {
        opcode: u8,
        expected: usize,
        got: usize,
    },
    #[error("encoding error: {0}")]
    Encoding(&'static str),
    #[error("no echo of the sent frame ({received} bytes received)")]
    NoEcho { received: usize },
    #[error("reply does not start with the preamble")]
    MissingPreamble,
    #[error("reply decode error: {reason}")]
    Decode {
        reason: DecodeError,
        payload: Vec<u8>,
    },
    #[error("reply opcode 0x{got:02X} does not complement sent opcode 0x{sent:02X}")]
    OpcodeMismatch { sent: u8, got: u8, payload: Vec<u8> },
    #[error("reply payload too short: expected {expected} bytes, got {got}")]
    ShortReply { expected: usize, got: usize },
    #[error("channel error (parity/framing) and reconnect failed")]
    ChannelError(#[source] io::Error),
    #[error("channel error (parity/framing); transport reconnected, reply dropped")]
    ChannelReset,
    #[error("brick reported {0}")]
    Status(DownloadStatus),
    #[error("block {index} failed after {attempts} attempts")]
    BlockTransferFailed {
        index: u16,
        attempts: u32,
        #[source]
        last: Box<RcxError>,
    },
    #[error("link lost: wake-up probe failed during block {index}")]
    LinkLost {
        index: u16,
        #[source]
        source: Box<RcxError>,
    },
    #[error("unsupported chunk type {0}")]
    UnsupportedChunkType(u8),
    #[error("{name} out of range: {value} (valid {min}..={max})")]
    OutOfRangeParameter {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("{stage} failed")]
    StageFailed {
        stage: Stage,
        #[source]
        source: Box<RcxError>,
    },
    #[error("transport: {0}")]
    Transport(#[from] io::Error),
}

impl RcxError {
    /// Raw reply bytes attached to decode and opcode failures.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            RcxError::Decode { payload, .. } | RcxError::OpcodeMismatch { payload, .. } => {
                Some(payload)
            }
            _ => None,
        }
    }

    /// Innermost error behind stage and block wrappers.
    pub fn root(&self) -> &RcxError {
        match self {
            RcxError::StageFailed { source, .. } | RcxError::LinkLost { source, .. } => {
                source.root()
            }
            RcxError::BlockTransferFailed { last, .. } => last.root(),
            other => other,
        }
    }
}

pub type Result<T, E = RcxError> = std::result::Result<T, E>;
