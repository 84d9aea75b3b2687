use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use rcx_link::port::SerialSettings;
use rcx_link::proto::opcode::SystemSound;
use rcx_link::transfer::{
    Backoff, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_RETRIES, RetryPolicy, TransferOptions,
};
use rcx_link::{EchoPolicy, LineSpeed, LinkConfig};

#[derive(Parser, Debug, Clone)]
#[command(name = "rcxlink", about = "Talk to a LEGO RCX through an IR tower")]
pub struct Cli {
    #[command(flatten)]
    pub ser: SerialOpts,
    /// More log output (-v debug, -vv trace with raw frames)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Check that a brick answers
    Ping,
    /// Show ROM/firmware versions and battery level
    Info,
    /// Play a built-in sound
    Sound {
        /// key-click, beep, sweep-up, sweep-down, error, fast-sweep-up
        #[arg(default_value = "beep")]
        sound: SystemSound,
    },
    /// Play a tone
    Tone {
        /// Frequency in Hz
        freq: u16,
        /// Duration in 1/100 s (0..=255)
        #[arg(default_value_t = 50)]
        duration: u16,
    },
    /// Sound message as sent by the LEGO remote
    RemoteSound,
    /// Download an RCXI program image into a program slot
    Program(ProgramOpts),
    /// Download firmware (raw binary image)
    Firmware(FirmwareOpts),
}

#[derive(Args, Debug, Clone)]
pub struct SerialOpts {
    /// Serial device of the IR tower
    #[arg(long, global = true, env = "RCX_PORT", default_value = "/dev/ttyUSB0")]
    pub dev: String,
    /// Baud rate (default 2400, 4800 with --fast)
    #[arg(long, global = true, env = "RCX_BAUD")]
    pub baud: Option<u32>,
    /// Fast framing at 4800 baud, for a brick already running the fast
    /// download stub
    #[arg(long, global = true)]
    pub fast: bool,
    /// Use the LEGO USB tower instead of a serial port
    #[cfg(feature = "usb")]
    #[arg(long, global = true)]
    pub usb: bool,
    /// Reject replies with a noise byte before the echo
    #[arg(long, global = true)]
    pub strict_echo: bool,
    /// Settle and read timeout per command, in ms
    #[arg(long, global = true, default_value_t = 500)]
    pub timeout_ms: u64,
    /// Reset the toggle bit after a reconnect
    #[arg(long, global = true)]
    pub reset_toggle: bool,
}

impl SerialOpts {
    pub fn line_speed(&self) -> LineSpeed {
        if self.fast {
            LineSpeed::Fast
        } else {
            LineSpeed::Standard
        }
    }

    pub fn settings(&self) -> SerialSettings {
        let mut s = SerialSettings::at(&self.dev, self.line_speed());
        if let Some(baud) = self.baud {
            s.baud = baud;
        }
        s
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            profile: self.line_speed().profile(),
            echo: if self.strict_echo {
                EchoPolicy::Strict
            } else {
                EchoPolicy::AllowLeadingNoise
            },
            command_timeout: Duration::from_millis(self.timeout_ms),
            reset_toggle_on_reconnect: self.reset_toggle,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct TransferArgs {
    /// Retries per block before giving up
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub retries: u32,
    /// "linear" (retry * 100 ms), "linear:<ms>" or a fixed wait in ms
    #[arg(long, default_value = "linear")]
    pub backoff: Backoff,
    /// Payload bytes per block
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: usize,
    /// Wait 1800 ms per block instead of 300 ms
    #[arg(long)]
    pub slow: bool,
}

impl TransferArgs {
    pub fn options(&self) -> TransferOptions {
        TransferOptions {
            block_size: self.block_size,
            extended_timeout: self.slow,
            retry: RetryPolicy {
                max_retries: self.retries,
                backoff: self.backoff,
            },
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ProgramOpts {
    /// .rcx image
    pub file: PathBuf,
    /// Program slot, 0-based (slot 0 is program 1 on the display)
    #[arg(long, default_value_t = 0)]
    pub slot: u8,
    #[command(flatten)]
    pub xfer: TransferArgs,
}

#[derive(Args, Debug, Clone)]
pub struct FirmwareOpts {
    /// Firmware image as raw bytes, loaded at 0x8000
    pub file: PathBuf,
    /// Fast download stub, sent first at 2400 baud. The firmware then goes
    /// to the stub at 4800 baud
    #[arg(long, value_name = "STUB")]
    pub fast_stub: Option<PathBuf>,
    #[command(flatten)]
    pub xfer: TransferArgs,
}
