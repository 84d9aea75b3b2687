//! Firmware and program download sequences.
//!
//! Each sequence is a fixed list of stages. Progress goes to a caller
//! supplied event sink; the first failing stage aborts the sequence and is
//! reported as [`RcxError::StageFailed`].

use log::{error, info, warn};
use std::fmt;
use std::time::{Duration, Instant};

use crate::brick::Brick;
use crate::error::{RcxError, Result};
use crate::image::ProgramImage;
use crate::proto::opcode::{FIRMWARE_CHECKSUM_SPAN, FIRMWARE_START_ADDRESS};
use crate::stats::{BlockProgress, TransferStats};
use crate::transfer::{TransferOptions, send_buffer};
use crate::transport::{LineSpeed, Transport};

pub const PING_ATTEMPTS: u32 = 3;
/// Firmware occupies 0x8000..=0xFFFF.
pub const FIRMWARE_MAX_SIZE: usize = 0x10000 - FIRMWARE_START_ADDRESS as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Preparing,
    Transferring,
    Finalizing,
    Complete,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Ping,
    EnterBootMode,
    BeginFirmwareDownload,
    FirmwareTransfer,
    UnlockFirmware,
    SwitchSpeed,
    SelectProgram,
    StopTasks,
    DeleteTasks,
    DeleteSubroutines,
    BeginTask(u8),
    TaskTransfer(u8),
}

impl Stage {
    pub fn phase(self) -> Phase {
        match self {
            Stage::Ping => Phase::Connecting,
            Stage::FirmwareTransfer | Stage::TaskTransfer(_) => Phase::Transferring,
            Stage::UnlockFirmware => Phase::Finalizing,
            _ => Phase::Preparing,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Ping => f.write_str("ping"),
            Stage::EnterBootMode => f.write_str("enter boot mode"),
            Stage::BeginFirmwareDownload => f.write_str("begin firmware download"),
            Stage::FirmwareTransfer => f.write_str("firmware transfer"),
            Stage::UnlockFirmware => f.write_str("unlock firmware"),
            Stage::SwitchSpeed => f.write_str("switch line speed"),
            Stage::SelectProgram => f.write_str("select program"),
            Stage::StopTasks => f.write_str("stop all tasks"),
            Stage::DeleteTasks => f.write_str("delete all tasks"),
            Stage::DeleteSubroutines => f.write_str("delete all subroutines"),
            Stage::BeginTask(n) => write!(f, "begin task {n}"),
            Stage::TaskTransfer(n) => write!(f, "task {n} transfer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Phase(Phase),
    Started(Stage),
    Block(Stage, BlockProgress),
    Finished(Stage),
    Failed(Stage),
}

/// Totals over every buffer sent during one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Summary {
    pub blocks: usize,
    pub bytes: usize,
    pub retries: u32,
    pub elapsed: Duration,
}

/// 16-bit sum over the first 19 KiB of the image.
pub fn firmware_checksum(image: &[u8]) -> u16 {
    image[..image.len().min(FIRMWARE_CHECKSUM_SPAN)]
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

struct Session<'e> {
    phase: Phase,
    summary: Summary,
    t0: Instant,
    on_event: &'e mut dyn FnMut(Event),
}

impl<'e> Session<'e> {
    fn new(on_event: &'e mut dyn FnMut(Event)) -> Self {
        Self {
            phase: Phase::Idle,
            summary: Summary::default(),
            t0: Instant::now(),
            on_event,
        }
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            self.phase = phase;
            (self.on_event)(Event::Phase(phase));
        }
    }

    /// Run one stage. `f` gets the event sink for block progress.
    fn step<R>(
        &mut self,
        stage: Stage,
        f: impl FnOnce(&mut dyn FnMut(Event)) -> Result<R>,
    ) -> Result<R> {
        self.enter(stage.phase());
        info!("[dl] {}", stage);
        (self.on_event)(Event::Started(stage));

        match f(&mut *self.on_event) {
            Ok(v) => {
                (self.on_event)(Event::Finished(stage));
                Ok(v)
            }
            Err(e) => {
                error!("[dl] {} failed: {}", stage, e);
                (self.on_event)(Event::Failed(stage));
                self.enter(Phase::Aborted);
                Err(RcxError::StageFailed {
                    stage,
                    source: Box::new(e),
                })
            }
        }
    }

    fn absorb(&mut self, stats: &TransferStats) {
        self.summary.blocks += stats.blocks_ok;
        self.summary.bytes += stats.bytes;
        self.summary.retries += stats.retries;
    }

    fn finish(mut self) -> Summary {
        self.enter(Phase::Complete);
        self.summary.elapsed = self.t0.elapsed();
        info!(
            "[dl] complete: {} bytes in {} blocks, {} retries, {:.1}s",
            self.summary.bytes,
            self.summary.blocks,
            self.summary.retries,
            self.summary.elapsed.as_secs_f64()
        );
        self.summary
    }
}

/// Replace the firmware in the brick's RAM with `image`.
pub fn download_firmware<T: Transport>(
    brick: &mut Brick<T>,
    image: &[u8],
    opts: &TransferOptions,
    on_event: &mut dyn FnMut(Event),
) -> Result<Summary> {
    check_firmware_size(image)?;
    let checksum = firmware_checksum(image);
    info!(
        "[dl] firmware: {} bytes, checksum 0x{:04X}",
        image.len(),
        checksum
    );

    let mut s = Session::new(on_event);
    s.step(Stage::Ping, |_| brick.ping_with_retries(PING_ATTEMPTS))?;
    s.step(Stage::EnterBootMode, |_| {
        brick.go_into_boot_mode().or_else(|e| {
            warn!("[dl] boot mode not acknowledged ({}), retrying", e);
            brick.go_into_boot_mode()
        })
    })?;
    s.step(Stage::BeginFirmwareDownload, |_| {
        brick.begin_firmware_download(checksum)
    })?;
    let stats = s.step(Stage::FirmwareTransfer, |report| {
        send_buffer(brick.link_mut(), image, opts, &mut |p| {
            report(Event::Block(Stage::FirmwareTransfer, *p))
        })
    })?;
    s.absorb(&stats);
    s.step(Stage::UnlockFirmware, |_| brick.unlock_firmware())?;

    Ok(s.finish())
}

/// Firmware download through the fast download stub. `stub` goes out as
/// ordinary firmware, then the line moves to 4800 baud and `image` follows
/// in fast frames, talking to the stub.
pub fn download_firmware_fast<T: Transport>(
    brick: &mut Brick<T>,
    stub: &[u8],
    image: &[u8],
    opts: &TransferOptions,
    on_event: &mut dyn FnMut(Event),
) -> Result<Summary> {
    check_firmware_size(stub)?;
    check_firmware_size(image)?;
    let t0 = Instant::now();

    info!("[dl] fast download stub first");
    let stub_pass = download_firmware(brick, stub, opts, on_event)?;
    Session::new(on_event).step(Stage::SwitchSpeed, |_| {
        brick.link_mut().switch_speed(LineSpeed::Fast)
    })?;
    let image_pass = download_firmware(brick, image, opts, on_event)?;

    Ok(Summary {
        blocks: stub_pass.blocks + image_pass.blocks,
        bytes: stub_pass.bytes + image_pass.bytes,
        retries: stub_pass.retries + image_pass.retries,
        elapsed: t0.elapsed(),
    })
}

fn check_firmware_size(image: &[u8]) -> Result<()> {
    if image.is_empty() || image.len() > FIRMWARE_MAX_SIZE {
        return Err(RcxError::OutOfRangeParameter {
            name: "firmware size",
            value: image.len() as i64,
            min: 1,
            max: FIRMWARE_MAX_SIZE as i64,
        });
    }
    Ok(())
}

/// Replace the program in `slot` with the task chunks of `program`.
pub fn download_program<T: Transport>(
    brick: &mut Brick<T>,
    slot: u8,
    program: &ProgramImage,
    opts: &TransferOptions,
    on_event: &mut dyn FnMut(Event),
) -> Result<Summary> {
    // task numbers are one byte on the wire
    let max_tasks = usize::from(u8::MAX) + 1;
    if program.chunks.len() > max_tasks {
        return Err(RcxError::OutOfRangeParameter {
            name: "task count",
            value: program.chunks.len() as i64,
            min: 0,
            max: max_tasks as i64,
        });
    }

    let mut s = Session::new(on_event);
    s.step(Stage::SelectProgram, |_| brick.select_program(slot))?;
    s.step(Stage::StopTasks, |_| brick.stop_all_tasks())?;
    s.step(Stage::DeleteTasks, |_| brick.delete_all_tasks())?;
    s.step(Stage::DeleteSubroutines, |_| brick.delete_all_subs())?;

    for (task, chunk) in (0..=u8::MAX).zip(&program.chunks) {
        s.step(Stage::BeginTask(task), |_| {
            if !chunk.is_task() {
                return Err(RcxError::UnsupportedChunkType(chunk.kind));
            }
            let size = u16::try_from(chunk.data.len()).map_err(|_| {
                RcxError::OutOfRangeParameter {
                    name: "task size",
                    value: chunk.data.len() as i64,
                    min: 0,
                    max: i64::from(u16::MAX),
                }
            })?;
            brick.begin_task_download(task, size)
        })?;

        let stage = Stage::TaskTransfer(task);
        let stats = s.step(stage, |report| {
            send_buffer(brick.link_mut(), &chunk.data, opts, &mut |p| {
                report(Event::Block(stage, *p))
            })
        })?;
        s.absorb(&stats);
    }

    Ok(s.finish())
}
