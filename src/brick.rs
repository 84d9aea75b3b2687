use log::{debug, info, warn};
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::error::{RcxError, Result};
use crate::proto::opcode::{
    DownloadStatus, FIRMWARE_START_ADDRESS, ODD_PRIMES, OpCode, SystemSound,
    UNLOCK_FIRMWARE_MAGIC,
};
use crate::transceiver::{Reply, Transceiver};
use crate::transport::Transport;

pub const WAKEUP_TIMEOUT: Duration = Duration::from_millis(500);
pub const UNLOCK_TIMEOUT: Duration = Duration::from_millis(1500);

pub const PROGRAM_SLOTS: RangeInclusive<u8> = 0..=5;

/// Remote message that makes the brick play a sound.
const REMOTE_SOUND: u16 = 0x8000;

/// `major.minor` pair as reported by GetFwVersion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    /// Two raw bytes read as decimal digits: `[0, 3]` is 3, `[3, 2]` is 32.
    fn from_digits(major: &[u8], minor: &[u8]) -> Self {
        Self {
            major: join_digits(major),
            minor: join_digits(minor),
        }
    }
}

fn join_digits(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .map(u8::to_string)
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Versions {
    pub rom: Version,
    pub firmware: Version,
}

impl Versions {
    /// Firmware 0.0 means only the ROM is running.
    pub fn has_firmware(&self) -> bool {
        self.firmware != Version::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryLevel {
    pub millivolts: u16,
}

impl BatteryLevel {
    /// Rough charge estimate. Six fresh AA cells read about 9 V.
    pub fn percent(&self) -> f32 {
        f32::from(self.millivolts) / 100.0
    }
}

/// Named commands on top of a [`Transceiver`].
pub struct Brick<T: Transport> {
    link: Transceiver<T>,
}

impl<T: Transport> Brick<T> {
    pub fn new(link: Transceiver<T>) -> Self {
        Self { link }
    }

    pub fn link(&self) -> &Transceiver<T> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut Transceiver<T> {
        &mut self.link
    }

    pub fn into_link(self) -> Transceiver<T> {
        self.link
    }

    pub fn ping(&mut self) -> Result<()> {
        self.link.command(OpCode::Ping, &[]).map(drop)
    }

    /// Ping up to `attempts` times, returning the last failure.
    pub fn ping_with_retries(&mut self, attempts: u32) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.ping() {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!("[cmd] ping {}/{} failed: {}", attempt, attempts, e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Nudge the brick's receiver. Only the write has to succeed.
    pub fn wakeup(&mut self) -> Result<()> {
        wakeup(&mut self.link)
    }

    pub fn get_versions(&mut self) -> Result<Versions> {
        let reply = self.link.command(OpCode::GetFwVersion, &ODD_PRIMES)?;
        let d = expect_data(&reply, 8)?;
        let versions = Versions {
            rom: Version::from_digits(&d[0..2], &d[2..4]),
            firmware: Version::from_digits(&d[4..6], &d[6..8]),
        };
        debug!(
            "[cmd] rom {} firmware {}",
            versions.rom, versions.firmware
        );
        Ok(versions)
    }

    pub fn get_battery_level(&mut self) -> Result<BatteryLevel> {
        let reply = self.link.command(OpCode::PollBattery, &[])?;
        let d = expect_data(&reply, 2)?;
        Ok(BatteryLevel {
            millivolts: u16::from_le_bytes([d[0], d[1]]),
        })
    }

    pub fn play_system_sound(&mut self, sound: SystemSound) -> Result<()> {
        self.link
            .command(OpCode::PlaySystemSound, &[sound as u8])
            .map(drop)
    }

    /// `duration` is in units of 10 ms.
    pub fn play_tone(&mut self, frequency: u16, duration: u16) -> Result<()> {
        let duration = check_range("tone duration", duration.into(), 0..=255)?;
        let [lo, hi] = frequency.to_le_bytes();
        self.link
            .command(OpCode::PlayTone, &[lo, hi, duration])
            .map(drop)
    }

    /// Message as sent by the LEGO remote. The brick never answers these.
    pub fn remote_command(&mut self, word: u16) -> Result<()> {
        let timeout = self.link.config().command_timeout;
        self.link
            .transceive(OpCode::RemoteCommand, &word.to_be_bytes(), timeout, true)
            .map(drop)
    }

    pub fn remote_sound(&mut self) -> Result<()> {
        self.remote_command(0)?;
        self.remote_command(REMOTE_SOUND)
    }

    pub fn select_program(&mut self, slot: u8) -> Result<()> {
        let slot = check_range("program slot", slot.into(), PROGRAM_SLOTS)?;
        self.link.command(OpCode::SelectProgram, &[slot]).map(drop)
    }

    pub fn stop_all_tasks(&mut self) -> Result<()> {
        self.link.command(OpCode::StopAllTasks, &[]).map(drop)
    }

    pub fn delete_all_tasks(&mut self) -> Result<()> {
        self.link.command(OpCode::DeleteAllTasks, &[]).map(drop)
    }

    pub fn delete_all_subs(&mut self) -> Result<()> {
        self.link.command(OpCode::DeleteAllSubs, &[]).map(drop)
    }

    /// Announce a task of `size` bytes. The brick answers Okay,
    /// NotEnoughMemory or IllegalNumber.
    pub fn begin_task_download(&mut self, task: u8, size: u16) -> Result<()> {
        let [lo, hi] = size.to_le_bytes();
        let reply = self
            .link
            .command(OpCode::BeginOfTask, &[0, task, 0, lo, hi])?;
        match reply.status()? {
            DownloadStatus::Okay => Ok(()),
            status => Err(RcxError::Status(status)),
        }
    }

    pub fn go_into_boot_mode(&mut self) -> Result<()> {
        self.link
            .command(OpCode::GoIntoBootMode, &ODD_PRIMES)
            .map(drop)
    }

    pub fn begin_firmware_download(&mut self, checksum: u16) -> Result<()> {
        let [a_lo, a_hi] = FIRMWARE_START_ADDRESS.to_le_bytes();
        let [c_lo, c_hi] = checksum.to_le_bytes();
        let reply = self
            .link
            .command(OpCode::BeginFwDownload, &[a_lo, a_hi, c_lo, c_hi, 0])?;
        let got = reply.payload.as_ref().map_or(0, Vec::len);
        if got != 2 {
            return Err(RcxError::ShortReply { expected: 2, got });
        }
        match reply.status()? {
            DownloadStatus::Okay => Ok(()),
            status => Err(RcxError::Status(status)),
        }
    }

    /// Start the freshly loaded firmware. The brick is busy checking the
    /// image and does not answer.
    pub fn unlock_firmware(&mut self) -> Result<()> {
        self.link
            .transceive(
                OpCode::UnlockFirmware,
                &UNLOCK_FIRMWARE_MAGIC,
                UNLOCK_TIMEOUT,
                true,
            )
            .map(drop)?;
        info!("[cmd] firmware unlocked");
        Ok(())
    }
}

pub(crate) fn wakeup<T: Transport>(link: &mut Transceiver<T>) -> Result<()> {
    link.transceive(OpCode::Ping, &[], WAKEUP_TIMEOUT, true)
        .map(drop)
}

fn expect_data(reply: &Reply, len: usize) -> Result<&[u8]> {
    let data = reply.data();
    if data.len() < len {
        return Err(RcxError::ShortReply {
            expected: len + 1,
            got: reply.payload.as_ref().map_or(0, Vec::len),
        });
    }
    Ok(&data[..len])
}

fn check_range(name: &'static str, value: i64, range: RangeInclusive<u8>) -> Result<u8> {
    let (min, max) = (i64::from(*range.start()), i64::from(*range.end()));
    if (min..=max).contains(&value) {
        Ok(value as u8)
    } else {
        Err(RcxError::OutOfRangeParameter {
            name,
            value,
            min,
            max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockTransport, base_opcode, echo_and_reply, healthy_reply};
    use crate::transceiver::LinkConfig;
    use crate::transport::ReadOutcome;

    fn brick(mock: MockTransport) -> Brick<MockTransport> {
        Brick::new(Transceiver::new(mock, LinkConfig::default()))
    }

    fn mock(b: &mut Brick<MockTransport>) -> &mut MockTransport {
        b.link_mut().transport_mut()
    }

    #[test]
    fn versions_from_digit_pairs() {
        let mut b = brick(MockTransport::brick());
        let v = b.get_versions().unwrap();
        assert_eq!(v.rom.to_string(), "3.1");
        assert_eq!(v.firmware.to_string(), "3.32");
        assert!(v.has_firmware());

        let sent = &mock(&mut b).writes[0];
        assert_eq!(base_opcode(sent), 0x15);
    }

    #[test]
    fn rom_only_brick_has_no_firmware() {
        let mut b = brick(MockTransport::new(|frame| {
            echo_and_reply(frame, &[0, 3, 0, 1, 0, 0, 0, 0])
        }));
        let v = b.get_versions().unwrap();
        assert_eq!(v.firmware, Version::default());
        assert!(!v.has_firmware());
    }

    #[test]
    fn short_version_reply() {
        let mut b = brick(MockTransport::new(|frame| echo_and_reply(frame, &[0, 3])));
        assert!(matches!(
            b.get_versions(),
            Err(RcxError::ShortReply { expected: 9, got: 3 })
        ));
    }

    #[test]
    fn battery_millivolts() {
        let mut b = brick(MockTransport::brick());
        let level = b.get_battery_level().unwrap();
        assert_eq!(level.millivolts, 9000);
        assert_eq!(level.percent(), 90.0);
    }

    #[test]
    fn tone_duration_checked_before_io() {
        let mut b = brick(MockTransport::brick());
        let err = b.play_tone(440, 256).unwrap_err();
        assert!(matches!(
            err,
            RcxError::OutOfRangeParameter { value: 256, max: 255, .. }
        ));
        assert!(mock(&mut b).writes.is_empty());

        b.play_tone(440, 50).unwrap();
        let sent = &mock(&mut b).writes[0];
        // 440 = 0x01B8
        assert_eq!(&sent[5..11], &[0xB8, 0x47, 0x01, 0xFE, 50, !50]);
    }

    // A brick that rejects SelectProgram(6) must never see the frame.
    #[test]
    fn invalid_program_slot_does_no_io() {
        let mut b = brick(MockTransport::brick());
        let err = b.select_program(6).unwrap_err();
        assert!(matches!(
            err,
            RcxError::OutOfRangeParameter {
                name: "program slot",
                value: 6,
                min: 0,
                max: 5
            }
        ));
        assert!(mock(&mut b).writes.is_empty());
        assert!(mock(&mut b).delays.is_empty());
    }

    #[test]
    fn remote_sound_sends_two_words_without_reply() {
        let mut b = brick(MockTransport::silent());
        b.remote_sound().unwrap();
        let writes = &mock(&mut b).writes;
        assert_eq!(writes.len(), 2);
        assert_eq!(&writes[0][5..9], &[0x00, 0xFF, 0x00, 0xFF]);
        assert_eq!(&writes[1][5..9], &[0x80, 0x7F, 0x00, 0xFF]);
    }

    #[test]
    fn task_download_status() {
        let mut b = brick(MockTransport::new(|frame| echo_and_reply(frame, &[1])));
        let err = b.begin_task_download(0, 40).unwrap_err();
        assert!(matches!(err, RcxError::Status(DownloadStatus::NotEnoughMemory)));

        let mut b = brick(MockTransport::brick());
        b.begin_task_download(2, 0x0123).unwrap();
        let sent = &mock(&mut b).writes[0];
        let params: Vec<u8> = sent[5..15].iter().step_by(2).copied().collect();
        assert_eq!(params, vec![0, 2, 0, 0x23, 0x01]);
    }

    #[test]
    fn firmware_download_handshake_needs_two_bytes() {
        let mut b = brick(MockTransport::brick());
        b.begin_firmware_download(0x4C00).unwrap();
        let sent = &mock(&mut b).writes[0];
        let params: Vec<u8> = sent[5..15].iter().step_by(2).copied().collect();
        assert_eq!(params, vec![0x00, 0x80, 0x00, 0x4C, 0x00]);

        let mut b = brick(MockTransport::new(|frame| echo_and_reply(frame, &[0, 0])));
        assert!(matches!(
            b.begin_firmware_download(1),
            Err(RcxError::ShortReply { expected: 2, got: 3 })
        ));

        let mut b = brick(MockTransport::new(|frame| echo_and_reply(frame, &[4])));
        assert!(matches!(
            b.begin_firmware_download(1),
            Err(RcxError::Status(DownloadStatus::FwChecksumError))
        ));
    }

    #[test]
    fn unlock_ignores_reply_and_waits_longer() {
        let mut b = brick(MockTransport::silent());
        b.unlock_firmware().unwrap();
        let m = mock(&mut b);
        assert_eq!(m.delays, vec![UNLOCK_TIMEOUT]);
        assert_eq!(base_opcode(&m.writes[0]), 0xA5);
    }

    #[test]
    fn ping_gives_up_after_attempts() {
        let mut b = brick(MockTransport::silent());
        assert!(matches!(
            b.ping_with_retries(3),
            Err(RcxError::NoEcho { received: 0 })
        ));
        assert_eq!(mock(&mut b).writes.len(), 3);

        let mut calls = 0;
        let mut b = brick(MockTransport::new(move |frame| {
            calls += 1;
            if calls < 3 {
                ReadOutcome::default()
            } else {
                healthy_reply(frame)
            }
        }));
        b.ping_with_retries(3).unwrap();
        assert_eq!(mock(&mut b).writes.len(), 3);
    }
}
