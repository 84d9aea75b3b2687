use log::info;
use std::time::{Duration, Instant};

/// Snapshot handed to progress callbacks after each acknowledged block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockProgress {
    /// Blocks acknowledged so far, 1-based.
    pub done: usize,
    pub total: usize,
    /// Wire index of the block just acknowledged (0 for the terminal one).
    pub index: u16,
    pub bytes: usize,
    pub retries: u32,
    pub elapsed: Duration,
}

impl BlockProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.done as f64 * 100.0 / self.total as f64
    }
}

/// Running state of one buffer transfer.
#[derive(Debug, Clone)]
pub struct TransferStats {
    pub total_blocks: usize,
    pub blocks_ok: usize,
    pub bytes: usize,
    /// Retries over the whole transfer.
    pub retries: u32,
    /// Retries spent on the block in flight.
    pub block_retries: u32,
    pub current_block: u16,
    t0: Instant,
}

impl TransferStats {
    pub fn new(total_blocks: usize) -> Self {
        Self {
            total_blocks,
            blocks_ok: 0,
            bytes: 0,
            retries: 0,
            block_retries: 0,
            current_block: 0,
            t0: Instant::now(),
        }
    }

    pub fn start_block(&mut self, index: u16) {
        self.current_block = index;
        self.block_retries = 0;
    }

    pub fn inc_retry(&mut self) {
        self.retries += 1;
        self.block_retries += 1;
    }

    pub fn block_done(&mut self, len: usize) -> BlockProgress {
        self.blocks_ok += 1;
        self.bytes += len;
        self.progress()
    }

    pub fn elapsed(&self) -> Duration {
        self.t0.elapsed()
    }

    pub fn progress(&self) -> BlockProgress {
        BlockProgress {
            done: self.blocks_ok,
            total: self.total_blocks,
            index: self.current_block,
            bytes: self.bytes,
            retries: self.retries,
            elapsed: self.elapsed(),
        }
    }

    pub fn log_summary(&self) {
        let dur = self.elapsed().as_secs_f64().max(1e-3);
        info!(
            "[xfer] {} blocks, {} bytes, {} retries in {:.1}s ({:.0} B/s)",
            self.blocks_ok,
            self.bytes,
            self.retries,
            dur,
            self.bytes as f64 / dur
        );
    }
}
