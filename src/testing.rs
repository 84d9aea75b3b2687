//! Scripted tower/brick used by the unit tests.

use std::io;
use std::time::Duration;

use crate::proto::codec::checksum8;
use crate::proto::opcode::{OpCode, PREAMBLE, PREAMBLE_FAST, TOGGLE_MASK};
use crate::transport::{LineSpeed, ReadOutcome, Transport};

type Responder = Box<dyn FnMut(&[u8]) -> ReadOutcome>;

pub(crate) struct MockTransport {
    pub writes: Vec<Vec<u8>>,
    pub delays: Vec<Duration>,
    pub read_timeouts: Vec<Duration>,
    pub reconnects: usize,
    pub fail_reconnect: bool,
    pub fail_writes: bool,
    /// Writes of this base opcode fail.
    pub fail_op: Option<u8>,
    pub echoes: bool,
    /// Refuse line speed changes.
    pub fixed_speed: bool,
    pub speeds: Vec<LineSpeed>,
    pending: Option<ReadOutcome>,
    responder: Responder,
}

impl MockTransport {
    pub fn new(responder: impl FnMut(&[u8]) -> ReadOutcome + 'static) -> Self {
        Self {
            writes: Vec::new(),
            delays: Vec::new(),
            read_timeouts: Vec::new(),
            reconnects: 0,
            fail_reconnect: false,
            fail_writes: false,
            fail_op: None,
            echoes: true,
            fixed_speed: false,
            speeds: Vec::new(),
            pending: None,
            responder: Box::new(responder),
        }
    }

    /// Nothing ever comes back, not even the echo.
    pub fn silent() -> Self {
        Self::new(|_| ReadOutcome::default())
    }

    /// A healthy brick that accepts everything.
    pub fn brick() -> Self {
        Self::new(healthy_reply)
    }

    /// Base opcodes (toggle bit cleared) of every frame written so far.
    pub fn sent_ops(&self) -> Vec<u8> {
        self.writes.iter().map(|w| base_opcode(w)).collect()
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.fail_writes || self.fail_op.is_some_and(|op| op == base_opcode(bytes)) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tower unplugged"));
        }
        self.writes.push(bytes.to_vec());
        self.pending = Some((self.responder)(bytes));
        Ok(())
    }

    fn read_with_timeout(&mut self, timeout: Duration) -> io::Result<ReadOutcome> {
        self.read_timeouts.push(timeout);
        Ok(self.pending.take().unwrap_or_default())
    }

    fn reconnect(&mut self) -> io::Result<()> {
        self.reconnects += 1;
        if self.fail_reconnect {
            return Err(io::Error::new(io::ErrorKind::NotFound, "port vanished"));
        }
        Ok(())
    }

    fn delay(&mut self, duration: Duration) {
        self.delays.push(duration);
    }

    fn echoes(&self) -> bool {
        self.echoes
    }

    fn set_line_speed(&mut self, speed: LineSpeed) -> io::Result<()> {
        if self.fixed_speed {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "fixed speed"));
        }
        self.speeds.push(speed);
        Ok(())
    }
}

fn is_fast(frame: &[u8]) -> bool {
    !frame.starts_with(&PREAMBLE)
}

/// Opcode byte as transmitted, toggle bit included.
pub(crate) fn sent_opcode(frame: &[u8]) -> u8 {
    if is_fast(frame) {
        frame[PREAMBLE_FAST.len()]
    } else {
        frame[PREAMBLE.len()]
    }
}

pub(crate) fn base_opcode(frame: &[u8]) -> u8 {
    sent_opcode(frame) & !TOGGLE_MASK
}

/// Regular reply frame for `payload` (opcode complement first).
pub(crate) fn reply_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = PREAMBLE.to_vec();
    for &b in payload.iter().chain(std::iter::once(&checksum8(payload))) {
        out.push(b);
        out.push(!b);
    }
    out
}

/// Reply as the fast download stub sends it: preamble, payload, checksum.
pub(crate) fn fast_reply_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = PREAMBLE.to_vec();
    out.extend_from_slice(payload);
    out.push(checksum8(payload));
    out
}

/// Echo of `frame` followed by a correct reply carrying `extra` after the
/// opcode complement. The reply format follows the framing of `frame`.
pub(crate) fn echo_and_reply(frame: &[u8], extra: &[u8]) -> ReadOutcome {
    let mut payload = vec![!sent_opcode(frame)];
    payload.extend_from_slice(extra);
    let mut bytes = frame.to_vec();
    if is_fast(frame) {
        bytes.extend(fast_reply_frame(&payload));
    } else {
        bytes.extend(reply_frame(&payload));
    }
    ReadOutcome::bytes(bytes)
}

/// Echo only; the brick did not answer.
pub(crate) fn echo_only(frame: &[u8]) -> ReadOutcome {
    ReadOutcome::bytes(frame.to_vec())
}

pub(crate) fn healthy_reply(frame: &[u8]) -> ReadOutcome {
    let op = OpCode::try_from(base_opcode(frame));
    match op {
        Ok(OpCode::ContinueDownload | OpCode::BeginOfTask | OpCode::BeginFwDownload) => {
            echo_and_reply(frame, &[0])
        }
        Ok(OpCode::GetFwVersion) => echo_and_reply(frame, &[0, 3, 0, 1, 0, 3, 3, 2]),
        // 9000 mV
        Ok(OpCode::PollBattery) => echo_and_reply(frame, &[0x28, 0x23]),
        Ok(OpCode::RemoteCommand) => ReadOutcome::default(),
        _ => echo_and_reply(frame, &[]),
    }
}
