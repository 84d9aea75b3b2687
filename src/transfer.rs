//! Chunked buffer transfer over `ContinueDownload`.
//!
//! A buffer is cut into blocks of `block_size` bytes. Blocks go out numbered
//! 1, 2, ... and the final remainder is always sent last as block 0, which
//! tells the brick the download is complete. A failed block triggers one
//! wake-up ping and then a bounded number of retries.

use log::{debug, error, warn};
use std::str::FromStr;
use std::time::Duration;

use crate::brick::wakeup;
use crate::error::{RcxError, Result};
use crate::proto::codec::checksum8;
use crate::proto::opcode::{DownloadStatus, OpCode};
use crate::stats::{BlockProgress, TransferStats};
use crate::transceiver::Transceiver;
use crate::transport::Transport;

pub const DEFAULT_BLOCK_SIZE: usize = 20;
pub const BLOCK_TIMEOUT: Duration = Duration::from_millis(300);
/// For slow links or a brick busy writing flash.
pub const EXTENDED_BLOCK_TIMEOUT: Duration = Duration::from_millis(1800);
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// One `ContinueDownload` unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block<'a> {
    pub index: u16,
    pub data: &'a [u8],
}

impl Block<'_> {
    pub fn checksum(&self) -> u8 {
        checksum8(self.data)
    }

    /// `idx_lo idx_hi len_lo len_hi data.. checksum`
    pub fn params(&self) -> Vec<u8> {
        let mut p = Vec::with_capacity(self.data.len() + 5);
        p.extend_from_slice(&self.index.to_le_bytes());
        p.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        p.extend_from_slice(self.data);
        p.push(self.checksum());
        p
    }
}

/// Cut `buffer` into blocks in send order. An empty buffer still yields
/// one empty terminal block.
pub fn segment(buffer: &[u8], block_size: usize) -> Result<Vec<Block<'_>>> {
    if block_size == 0 || block_size > usize::from(u16::MAX) {
        return Err(RcxError::OutOfRangeParameter {
            name: "block size",
            value: block_size as i64,
            min: 1,
            max: i64::from(u16::MAX),
        });
    }
    if buffer.is_empty() {
        return Ok(vec![Block {
            index: 0,
            data: &[],
        }]);
    }

    let count = buffer.len().div_ceil(block_size);
    if count > usize::from(u16::MAX) {
        return Err(RcxError::Encoding("buffer needs more blocks than can be numbered"));
    }

    Ok(buffer
        .chunks(block_size)
        .enumerate()
        .map(|(i, data)| Block {
            index: if i + 1 == count { 0 } else { (i + 1) as u16 },
            data,
        })
        .collect())
}

/// Wait before retry number `retry` (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `retry * step`
    Linear(Duration),
}

impl Backoff {
    pub fn delay(self, retry: u32) -> Duration {
        match self {
            Backoff::Fixed(d) => d,
            Backoff::Linear(step) => step * retry,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Linear(Duration::from_millis(100))
    }
}

/// `linear`, `linear:<ms>` or a fixed wait in `<ms>`.
impl FromStr for Backoff {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let ms = |v: &str| {
            v.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| format!("backoff must be 'linear', 'linear:<ms>' or <ms>, got '{s}'"))
        };
        if s.eq_ignore_ascii_case("linear") {
            Ok(Backoff::default())
        } else if let Some(step) = s.strip_prefix("linear:") {
            Ok(Backoff::Linear(ms(step)?))
        } else {
            Ok(Backoff::Fixed(ms(s)?))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub block_size: usize,
    pub extended_timeout: bool,
    pub retry: RetryPolicy,
}

impl TransferOptions {
    pub fn block_timeout(&self) -> Duration {
        if self.extended_timeout {
            EXTENDED_BLOCK_TIMEOUT
        } else {
            BLOCK_TIMEOUT
        }
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            extended_timeout: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Send `buffer` block by block. The brick must already expect a download
/// (BeginOfTask or BeginFwDownload acknowledged).
pub fn send_buffer<T: Transport>(
    link: &mut Transceiver<T>,
    buffer: &[u8],
    opts: &TransferOptions,
    progress: &mut dyn FnMut(&BlockProgress),
) -> Result<TransferStats> {
    let blocks = segment(buffer, opts.block_size)?;
    let timeout = opts.block_timeout();
    let policy = opts.retry;
    let mut stats = TransferStats::new(blocks.len());

    for block in &blocks {
        stats.start_block(block.index);
        let params = block.params();

        loop {
            let err = match send_block(link, block.index, &params, timeout) {
                Ok(()) => break,
                Err(e) => e,
            };

            if stats.block_retries >= policy.max_retries {
                error!(
                    "[xfer] block {} failed after {} attempts: {}",
                    block.index,
                    stats.block_retries + 1,
                    err
                );
                return Err(RcxError::BlockTransferFailed {
                    index: block.index,
                    attempts: stats.block_retries + 1,
                    last: Box::new(err),
                });
            }

            if stats.block_retries == 0 {
                wakeup(link).map_err(|probe| {
                    error!("[xfer] wake-up failed at block {}: {}", block.index, probe);
                    RcxError::LinkLost {
                        index: block.index,
                        source: Box::new(probe),
                    }
                })?;
            }

            stats.inc_retry();
            let wait = policy.backoff.delay(stats.block_retries);
            warn!(
                "[xfer] block {}: {}; retry {}/{} in {:?}",
                block.index, err, stats.block_retries, policy.max_retries, wait
            );
            link.delay(wait);
        }

        let p = stats.block_done(block.data.len());
        debug!(
            "[xfer] block {} ok ({}/{})",
            block.index, p.done, p.total
        );
        progress(&p);
    }

    stats.log_summary();
    Ok(stats)
}

fn send_block<T: Transport>(
    link: &mut Transceiver<T>,
    index: u16,
    params: &[u8],
    timeout: Duration,
) -> Result<()> {
    let reply = link.transceive(OpCode::ContinueDownload, params, timeout, false)?;
    match reply.status()? {
        DownloadStatus::Okay => Ok(()),
        status => {
            debug!("[xfer] block {} rejected: {}", index, status);
            Err(RcxError::Status(status))
        }
    }
}
