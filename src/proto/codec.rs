// src/proto/codec.rs
use log::trace;
use thiserror::Error;

use super::opcode::{OpCode, PREAMBLE, PREAMBLE_FAST, TOGGLE_MASK};
use crate::error::RcxError;

/// Why a received reply frame was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("reply does not start with the preamble")]
    MissingPreamble,
    #[error("reply too short: {0} bytes after preamble")]
    TooShort(usize),
    #[error("odd reply length: {0} bytes after preamble")]
    OddLength(usize),
    #[error("complement mismatch at offset {0}")]
    Complement(usize),
    #[error("checksum mismatch: got 0x{got:02X}, computed 0x{computed:02X}")]
    Checksum { got: u8, computed: u8 },
}

/// A rejected reply plus the bytes that were left after stripping, kept for
/// diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub reason: DecodeError,
    pub bytes: Vec<u8>,
}

/// Wire layout of outgoing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameProfile {
    pub preamble: &'static [u8],
    pub complements: bool,
}

impl FrameProfile {
    /// `55 FF 00 | OP ~OP | (P ~P)* | CK ~CK`
    pub const STANDARD: FrameProfile = FrameProfile {
        preamble: &PREAMBLE,
        complements: true,
    };
    /// `FF | OP | P* | CK`, only understood by the fast download stub.
    pub const FAST: FrameProfile = FrameProfile {
        preamble: &PREAMBLE_FAST,
        complements: false,
    };

    pub fn frame_len(&self, params: usize) -> usize {
        let body = 1 + params + 1;
        self.preamble.len() + if self.complements { body * 2 } else { body }
    }
}

impl Default for FrameProfile {
    fn default() -> Self {
        FrameProfile::STANDARD
    }
}

/// Alternating bit the brick uses to drop duplicated commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToggleBit(bool);

impl ToggleBit {
    pub fn get(self) -> bool {
        self.0
    }

    /// Returns the current value and flips it for the next frame.
    pub fn advance(&mut self) -> bool {
        let cur = self.0;
        self.0 = !cur;
        cur
    }

    pub fn reset(&mut self) {
        self.0 = false;
    }
}

/// Sum of all bytes modulo 256.
pub fn checksum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Encoder/decoder for one link. Owns the toggle bit of the session.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    profile: FrameProfile,
    toggle: ToggleBit,
}

impl FrameCodec {
    pub fn new(profile: FrameProfile) -> Self {
        Self {
            profile,
            toggle: ToggleBit::default(),
        }
    }

    pub fn profile(&self) -> FrameProfile {
        self.profile
    }

    /// Change framing mid-session. The toggle bit carries over.
    pub fn set_profile(&mut self, profile: FrameProfile) {
        self.profile = profile;
    }

    pub fn toggle(&self) -> ToggleBit {
        self.toggle
    }

    pub fn reset_toggle(&mut self) {
        self.toggle.reset();
    }

    /// Build a frame for `op`. The toggle bit only advances when a frame is
    /// actually produced.
    pub fn encode(&mut self, op: OpCode, params: &[u8]) -> Result<Vec<u8>, RcxError> {
        if !op.has_free_length() && op.declared_params() != params.len() {
            return Err(RcxError::ParameterCountMismatch {
                opcode: op.byte(),
                expected: op.declared_params(),
                got: params.len(),
            });
        }

        let mut tx_op = op.byte();
        if self.toggle.advance() {
            tx_op |= TOGGLE_MASK;
        }

        let mut frame = Vec::with_capacity(self.profile.frame_len(params.len()));
        frame.extend_from_slice(self.profile.preamble);
        let mut push = |b: u8| {
            frame.push(b);
            if self.profile.complements {
                frame.push(!b);
            }
        };
        push(tx_op);
        for &p in params {
            push(p);
        }
        push(tx_op.wrapping_add(checksum8(params)));

        trace!("[enc] op=0x{:02X} (0x{:02X}) {:02X?}", tx_op, op.byte(), frame);
        Ok(frame)
    }

    pub fn decode(&self, raw: &[u8]) -> Result<Vec<u8>, Rejected> {
        decode(raw, self.profile)
    }
}

/// Validate a reply frame and return its payload (opcode complement first,
/// checksum removed).
///
/// Replies always carry the 3-byte preamble. When it is missing the input is
/// handed back untouched; any later failure hands back the bytes after the
/// preamble.
pub fn decode(raw: &[u8], profile: FrameProfile) -> Result<Vec<u8>, Rejected> {
    let Some(body) = raw.strip_prefix(&PREAMBLE[..]) else {
        return Err(reject(DecodeError::MissingPreamble, raw));
    };

    if !profile.complements {
        let Some((&got, data)) = body.split_last() else {
            return Err(reject(DecodeError::TooShort(0), body));
        };
        let computed = checksum8(data);
        if got != computed {
            return Err(reject(DecodeError::Checksum { got, computed }, body));
        }
        return Ok(data.to_vec());
    }

    if body.len() < 2 {
        return Err(reject(DecodeError::TooShort(body.len()), body));
    }
    if body.len() % 2 != 0 {
        return Err(reject(DecodeError::OddLength(body.len()), body));
    }

    for (i, pair) in body.chunks_exact(2).enumerate() {
        if pair[0] ^ pair[1] != 0xFF {
            return Err(reject(DecodeError::Complement(i * 2), body));
        }
    }

    let values: Vec<u8> = body.iter().step_by(2).copied().collect();
    let (&got, data) = values
        .split_last()
        .ok_or_else(|| reject(DecodeError::TooShort(body.len()), body))?;
    let computed = checksum8(data);
    if got != computed {
        return Err(reject(DecodeError::Checksum { got, computed }, body));
    }

    Ok(data.to_vec())
}

fn reject(reason: DecodeError, bytes: &[u8]) -> Rejected {
    trace!("[xtr] {}: {:02X?}", reason, bytes);
    Rejected {
        reason,
        bytes: bytes.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// What a brick sends back for a payload (opcode complement first).
    fn reply_frame(payload: &[u8]) -> Vec<u8> {
        let mut out = PREAMBLE.to_vec();
        for &b in payload.iter().chain(std::iter::once(&checksum8(payload))) {
            out.push(b);
            out.push(!b);
        }
        out
    }

    #[test]
    fn ping_frame_layout() {
        let mut codec = FrameCodec::default();
        let first = codec.encode(OpCode::Ping, &[]).unwrap();
        assert_eq!(first, vec![0x55, 0xFF, 0x00, 0x10, 0xEF, 0x10, 0xEF]);
        let second = codec.encode(OpCode::Ping, &[]).unwrap();
        assert_eq!(second, vec![0x55, 0xFF, 0x00, 0x18, 0xE7, 0x18, 0xE7]);
    }

    #[test]
    fn toggle_alternates_across_opcodes() {
        let mut codec = FrameCodec::default();
        let ops: [(OpCode, Vec<u8>); 5] = [
            (OpCode::Ping, vec![]),
            (OpCode::SelectProgram, vec![2]),
            (OpCode::PlayTone, vec![0x10, 0x02, 0x32]),
            (OpCode::GoIntoBootMode, vec![1, 3, 5, 7, 11]),
            (OpCode::PollBattery, vec![]),
        ];
        for (i, (op, params)) in ops.iter().enumerate() {
            let frame = codec.encode(*op, params).unwrap();
            let toggled = frame[3] & TOGGLE_MASK != 0;
            assert_eq!(toggled, i % 2 == 1, "frame {i}");
        }
    }

    #[test]
    fn checksum_and_complements() {
        let mut codec = FrameCodec::default();
        let params = [0xF0, 0x80, 0x7F, 0x01, 0x00];
        let frame = codec.encode(OpCode::BeginFwDownload, &params).unwrap();
        assert_eq!(frame.len(), 3 + 2 + 2 * params.len() + 2);
        let ck = frame[frame.len() - 2];
        let nck = frame[frame.len() - 1];
        assert_eq!(ck.wrapping_add(nck), 0xFF);
        let expected = params
            .iter()
            .fold(OpCode::BeginFwDownload.byte(), |a, &p| a.wrapping_add(p));
        assert_eq!(ck, expected);
        for pair in frame[3..].chunks_exact(2) {
            assert_eq!(pair[0] ^ pair[1], 0xFF);
        }
    }

    #[test]
    fn parameter_count_is_enforced() {
        let mut codec = FrameCodec::default();
        for op in OpCode::ALL {
            let wrong = vec![0u8; op.declared_params() + 1];
            let res = codec.encode(op, &wrong);
            if op.has_free_length() {
                assert!(res.is_ok(), "{op:?}");
            } else {
                assert!(
                    matches!(res, Err(RcxError::ParameterCountMismatch { .. })),
                    "{op:?}"
                );
            }
        }
        assert!(codec.encode(OpCode::RemoteCommand, &[0x00, 0x80, 0x01]).is_ok());
    }

    #[test]
    fn failed_encode_keeps_toggle() {
        let mut codec = FrameCodec::default();
        assert!(codec.encode(OpCode::SelectProgram, &[]).is_err());
        assert!(!codec.toggle().get());
        codec.encode(OpCode::Ping, &[]).unwrap();
        assert!(codec.toggle().get());
    }

    #[test]
    fn fast_frame_layout() {
        let mut codec = FrameCodec::new(FrameProfile::FAST);
        let frame = codec.encode(OpCode::PlaySystemSound, &[5]).unwrap();
        assert_eq!(frame, vec![0xFF, 0x51, 0x05, 0x56]);
        assert_eq!(frame.len(), FrameProfile::FAST.frame_len(1));
    }

    #[test]
    fn decode_valid_reply() {
        let payload = decode(&reply_frame(&[0xEF]), FrameProfile::STANDARD).unwrap();
        assert_eq!(payload, vec![0xEF]);
        let payload = decode(&reply_frame(&[0xBA, 0x00]), FrameProfile::STANDARD).unwrap();
        assert_eq!(payload, vec![0xBA, 0x00]);
    }

    #[test]
    fn decode_without_preamble_returns_input() {
        let raw = vec![0x10, 0xEF, 0x10, 0xEF];
        let err = decode(&raw, FrameProfile::STANDARD).unwrap_err();
        assert_eq!(err.reason, DecodeError::MissingPreamble);
        assert_eq!(err.bytes, raw);
    }

    #[test]
    fn decode_rejects_broken_frames() {
        let short = [0x55, 0xFF, 0x00, 0xEF];
        assert!(matches!(
            decode(&short, FrameProfile::STANDARD).unwrap_err().reason,
            DecodeError::TooShort(1)
        ));

        let odd = [0x55, 0xFF, 0x00, 0xEF, 0x10, 0xEF];
        assert!(matches!(
            decode(&odd, FrameProfile::STANDARD).unwrap_err().reason,
            DecodeError::OddLength(3)
        ));

        let mut bad_pair = reply_frame(&[0xEF, 0x02]);
        bad_pair[6] ^= 0x01;
        let err = decode(&bad_pair, FrameProfile::STANDARD).unwrap_err();
        assert_eq!(err.reason, DecodeError::Complement(2));
        assert_eq!(err.bytes, bad_pair[3..].to_vec());

        let mut bad_sum = reply_frame(&[0xEF]);
        bad_sum[5] = 0x00;
        bad_sum[6] = 0xFF;
        assert!(matches!(
            decode(&bad_sum, FrameProfile::STANDARD).unwrap_err().reason,
            DecodeError::Checksum { got: 0x00, computed: 0xEF }
        ));
    }

    #[test]
    fn decode_fast_reply() {
        let raw = [0x55, 0xFF, 0x00, 0xEF, 0x02, 0xF1];
        assert_eq!(decode(&raw, FrameProfile::FAST).unwrap(), vec![0xEF, 0x02]);
        let bad = [0x55, 0xFF, 0x00, 0xEF, 0x02, 0xF0];
        assert!(decode(&bad, FrameProfile::FAST).is_err());
    }
}
