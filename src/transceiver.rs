use log::{debug, info, trace, warn};
use std::time::Duration;

use crate::error::{RcxError, Result};
use crate::proto::codec::{FrameCodec, FrameProfile, decode};
use crate::proto::opcode::{DownloadStatus, OpCode, PREAMBLE};
use crate::transport::{LineSpeed, Transport};

/// Default bound for the post-write settle time and for the read.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// How strictly the echo of a sent frame is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoPolicy {
    /// Reply must start with the exact frame.
    Strict,
    /// Also accept the echo after exactly one leading noise byte.
    AllowLeadingNoise,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub profile: FrameProfile,
    pub echo: EchoPolicy,
    pub command_timeout: Duration,
    /// Start over with toggle bit 0 after a transport reconnect.
    pub reset_toggle_on_reconnect: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            profile: FrameProfile::STANDARD,
            echo: EchoPolicy::AllowLeadingNoise,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            reset_toggle_on_reconnect: false,
        }
    }
}

/// Outcome of a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Opcode as transmitted, toggle bit included.
    pub sent_opcode: u8,
    /// Decoded reply payload, starting with the opcode complement. `None`
    /// when the reply was ignored.
    pub payload: Option<Vec<u8>>,
}

impl Reply {
    /// Reply bytes after the opcode complement.
    pub fn data(&self) -> &[u8] {
        match &self.payload {
            Some(p) if !p.is_empty() => &p[1..],
            _ => &[],
        }
    }

    /// Status byte of download related replies.
    pub fn status(&self) -> Result<DownloadStatus> {
        self.data()
            .first()
            .map(|&b| DownloadStatus::from(b))
            .ok_or(RcxError::ShortReply {
                expected: 2,
                got: self.payload.as_ref().map_or(0, Vec::len),
            })
    }
}

/// Drives single request/reply exchanges with the brick. Owns the
/// transport and the toggle bit for the lifetime of a session.
pub struct Transceiver<T: Transport> {
    transport: T,
    codec: FrameCodec,
    config: LinkConfig,
}

impl<T: Transport> Transceiver<T> {
    pub fn new(transport: T, config: LinkConfig) -> Self {
        Self {
            transport,
            codec: FrameCodec::new(config.profile),
            config,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Explicit session start: the toggle bit goes back to 0.
    pub fn reset_session(&mut self) {
        self.codec.reset_toggle();
    }

    pub fn delay(&mut self, duration: Duration) {
        self.transport.delay(duration);
    }

    /// Retune the transport and switch framing to match. Nothing changes
    /// when the transport refuses the speed.
    pub fn switch_speed(&mut self, speed: LineSpeed) -> Result<()> {
        self.transport.set_line_speed(speed)?;
        self.config.profile = speed.profile();
        self.codec.set_profile(speed.profile());
        info!("[cmd] line at {} baud", speed.baud());
        Ok(())
    }

    /// Exchange with the configured default timeout.
    pub fn command(&mut self, op: OpCode, params: &[u8]) -> Result<Reply> {
        self.transceive(op, params, self.config.command_timeout, false)
    }

    pub fn transceive(
        &mut self,
        op: OpCode,
        params: &[u8],
        timeout: Duration,
        ignore_reply: bool,
    ) -> Result<Reply> {
        let frame = self.codec.encode(op, params)?;
        let preamble_len = self.config.profile.preamble.len();
        if frame.len() <= preamble_len {
            return Err(RcxError::Encoding("frame shorter than preamble"));
        }
        let sent_opcode = frame[preamble_len];

        trace!("[txm] {:02X?}", frame);
        self.transport.write(&frame)?;

        self.transport.delay(timeout);
        let rx = self.transport.read_with_timeout(timeout)?;
        trace!("[rxm] {:02X?}", rx.bytes);

        if rx.channel_error {
            warn!("[cmd] channel error, reconnecting transport");
            self.transport.reconnect().map_err(RcxError::ChannelError)?;
            if self.config.reset_toggle_on_reconnect {
                self.codec.reset_toggle();
            }
        }

        if ignore_reply {
            debug!("[cmd] {:?}: reply ignored", op);
            return Ok(Reply {
                sent_opcode,
                payload: None,
            });
        }

        // bytes read across a line fault are not trusted
        if rx.channel_error {
            return Err(RcxError::ChannelReset);
        }

        let rest = if self.transport.echoes() {
            strip_echo(&frame, &rx.bytes, self.config.echo)?
        } else {
            &rx.bytes[..]
        };
        if !rest.starts_with(&PREAMBLE) {
            return Err(RcxError::MissingPreamble);
        }

        let payload = decode(rest, self.config.profile).map_err(|r| RcxError::Decode {
            reason: r.reason,
            payload: r.bytes,
        })?;

        match payload.first() {
            None => Err(RcxError::ShortReply {
                expected: 1,
                got: 0,
            }),
            Some(&first) if first ^ sent_opcode != 0xFF => Err(RcxError::OpcodeMismatch {
                sent: sent_opcode,
                got: first,
                payload,
            }),
            Some(_) => {
                debug!("[cmd] {:?}: ok {:02X?}", op, payload);
                Ok(Reply {
                    sent_opcode,
                    payload: Some(payload),
                })
            }
        }
    }
}

/// Remove the echo of `frame` from the start of `rx`.
fn strip_echo<'a>(frame: &[u8], rx: &'a [u8], policy: EchoPolicy) -> Result<&'a [u8]> {
    if rx.len() < frame.len() {
        return Err(RcxError::NoEcho { received: rx.len() });
    }
    if let Some(rest) = rx.strip_prefix(frame) {
        return Ok(rest);
    }
    if policy == EchoPolicy::AllowLeadingNoise
        && let Some(rest) = rx[1..].strip_prefix(frame)
    {
        debug!("[cmd] echo after one noise byte 0x{:02X}", rx[0]);
        return Ok(rest);
    }
    Err(RcxError::NoEcho { received: rx.len() })
}
