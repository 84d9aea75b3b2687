use std::fmt;
use std::str::FromStr;

/// Every frame sent in the regular form starts with these bytes. Replies use
/// them in both framing modes.
pub const PREAMBLE: [u8; 3] = [0x55, 0xFF, 0x00];
/// Preamble of the fast (no complement bytes) request form.
pub const PREAMBLE_FAST: [u8; 1] = [0xFF];

/// Parameter block for `GoIntoBootMode` and `GetFwVersion`.
pub const ODD_PRIMES: [u8; 5] = [1, 3, 5, 7, 11];
/// Parameter block for `UnlockFirmware`: "LEGO" followed by 0xAE.
pub const UNLOCK_FIRMWARE_MAGIC: [u8; 5] = [0x4C, 0x45, 0x47, 0x4F, 0xAE];

/// Firmware is always loaded at this address.
pub const FIRMWARE_START_ADDRESS: u16 = 0x8000;
/// Only the first 19 KiB of a firmware image are covered by its checksum.
pub const FIRMWARE_CHECKSUM_SPAN: usize = 19 * 1024;

/// Bit of the transmitted opcode that carries the toggle bit.
pub const TOGGLE_MASK: u8 = 0x08;

/// RCX commands reachable directly over the IR link.
///
/// For regular opcodes the low three bits give the number of parameter
/// bytes. `ContinueDownload` and `RemoteCommand` do not follow that rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // ---- no parameters
    Ping = 0x10,
    MemMap = 0x20,
    PollBattery = 0x30,
    DeleteAllTasks = 0x40,
    StopAllTasks = 0x50,
    TurnOff = 0x60,
    DeleteAllSubs = 0x70,
    ClearSound = 0x80,
    ClearMsgBuf = 0x90,
    MuteSound = 0xD0,
    UnmuteSound = 0xE0,

    // ---- one parameter byte
    MotorOnOffFloat = 0x21,
    SetTxPower = 0x31,
    PlaySystemSound = 0x51,
    DeleteTask = 0x61,
    StartTask = 0x71,
    StopTask = 0x81,
    SelectProgram = 0x91,
    ClearTimer = 0xA1,
    SetPowerDownTime = 0xB1,
    DeleteSub = 0xC1,
    ClearSensorVal = 0xD1,
    SetMotorDir = 0xE1,

    // ---- two parameter bytes
    PlayToneVar = 0x02,
    Poll = 0x12,
    SetWatch = 0x22,
    SetSensorType = 0x32,
    SetSensorMode = 0x42,
    SetDataLog = 0x52,
    DataLogNext = 0x62,

    // ---- three parameter bytes
    DirectEvent = 0x03,
    SetPower = 0x13,
    PlayTone = 0x23,
    SelectDisplay = 0x33,
    UploadRam = 0x63,
    SetEvent = 0x93,
    SetMotorMaxPwr = 0xA3,

    // ---- four parameter bytes
    SetVar = 0x14,
    SumVar = 0x24,
    SubVar = 0x34,
    DivVar = 0x44,
    MulVar = 0x54,
    SignVar = 0x64,
    AbsVar = 0x74,
    AndVar = 0x84,
    OrVar = 0x94,
    Upload = 0xA4,

    // ---- five parameter bytes
    SetSourceValue = 0x05,
    GetFwVersion = 0x15,
    BeginOfTask = 0x25,
    BeginOfSub = 0x35,
    GoIntoBootMode = 0x65,
    BeginFwDownload = 0x75,
    UnlockFirmware = 0xA5,
    ViewSourceVal = 0xE5,

    // ---- exceptions
    ContinueDownload = 0x45,
    RemoteCommand = 0xD2,
}

impl OpCode {
    pub const ALL: [OpCode; 56] = [
        OpCode::Ping,
        OpCode::MemMap,
        OpCode::PollBattery,
        OpCode::DeleteAllTasks,
        OpCode::StopAllTasks,
        OpCode::TurnOff,
        OpCode::DeleteAllSubs,
        OpCode::ClearSound,
        OpCode::ClearMsgBuf,
        OpCode::MuteSound,
        OpCode::UnmuteSound,
        OpCode::MotorOnOffFloat,
        OpCode::SetTxPower,
        OpCode::PlaySystemSound,
        OpCode::DeleteTask,
        OpCode::StartTask,
        OpCode::StopTask,
        OpCode::SelectProgram,
        OpCode::ClearTimer,
        OpCode::SetPowerDownTime,
        OpCode::DeleteSub,
        OpCode::ClearSensorVal,
        OpCode::SetMotorDir,
        OpCode::PlayToneVar,
        OpCode::Poll,
        OpCode::SetWatch,
        OpCode::SetSensorType,
        OpCode::SetSensorMode,
        OpCode::SetDataLog,
        OpCode::DataLogNext,
        OpCode::DirectEvent,
        OpCode::SetPower,
        OpCode::PlayTone,
        OpCode::SelectDisplay,
        OpCode::UploadRam,
        OpCode::SetEvent,
        OpCode::SetMotorMaxPwr,
        OpCode::SetVar,
        OpCode::SumVar,
        OpCode::SubVar,
        OpCode::DivVar,
        OpCode::MulVar,
        OpCode::SignVar,
        OpCode::AbsVar,
        OpCode::AndVar,
        OpCode::OrVar,
        OpCode::Upload,
        OpCode::SetSourceValue,
        OpCode::GetFwVersion,
        OpCode::BeginOfTask,
        OpCode::BeginOfSub,
        OpCode::GoIntoBootMode,
        OpCode::BeginFwDownload,
        OpCode::UnlockFirmware,
        OpCode::ViewSourceVal,
        OpCode::ContinueDownload,
    ];

    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Parameter count encoded in the low three bits.
    pub fn declared_params(self) -> usize {
        (self.byte() & 0x07) as usize
    }

    /// Opcodes whose parameter count is not described by the low bits.
    pub fn has_free_length(self) -> bool {
        matches!(self, OpCode::ContinueDownload | OpCode::RemoteCommand)
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op.byte()
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;
    fn try_from(b: u8) -> Result<Self, Self::Error> {
        if b == OpCode::RemoteCommand.byte() {
            return Ok(OpCode::RemoteCommand);
        }
        OpCode::ALL.iter().copied().find(|op| op.byte() == b).ok_or(b)
    }
}

/// Status byte returned by the download related commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Okay,
    NotEnoughMemory,
    IllegalNumber,
    BlockChecksumError,
    FwChecksumError,
    DownloadNotActive,
    Unexpected(u8),
}

impl DownloadStatus {
    pub fn byte(self) -> u8 {
        match self {
            DownloadStatus::Okay => 0,
            DownloadStatus::NotEnoughMemory => 1,
            DownloadStatus::IllegalNumber => 2,
            DownloadStatus::BlockChecksumError => 3,
            DownloadStatus::FwChecksumError => 4,
            DownloadStatus::DownloadNotActive => 6,
            DownloadStatus::Unexpected(b) => b,
        }
    }
}

impl From<u8> for DownloadStatus {
    fn from(b: u8) -> Self {
        match b {
            0 => DownloadStatus::Okay,
            1 => DownloadStatus::NotEnoughMemory,
            2 => DownloadStatus::IllegalNumber,
            3 => DownloadStatus::BlockChecksumError,
            4 => DownloadStatus::FwChecksumError,
            6 => DownloadStatus::DownloadNotActive,
            other => DownloadStatus::Unexpected(other),
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadStatus::Okay => f.write_str("okay"),
            DownloadStatus::NotEnoughMemory => f.write_str("not enough memory"),
            DownloadStatus::IllegalNumber => f.write_str("illegal number"),
            DownloadStatus::BlockChecksumError => f.write_str("block checksum error"),
            DownloadStatus::FwChecksumError => f.write_str("firmware checksum error"),
            DownloadStatus::DownloadNotActive => f.write_str("download not active"),
            DownloadStatus::Unexpected(b) => write!(f, "unexpected status 0x{b:02X}"),
        }
    }
}

/// Built-in sounds of the RCX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemSound {
    KeyClick = 0,
    Beep = 1,
    SweepUp = 2,
    SweepDown = 3,
    Error = 4,
    FastSweepUp = 5,
}

impl FromStr for SystemSound {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "key-click" | "click" => Ok(SystemSound::KeyClick),
            "beep" => Ok(SystemSound::Beep),
            "sweep-up" => Ok(SystemSound::SweepUp),
            "sweep-down" => Ok(SystemSound::SweepDown),
            "error" => Ok(SystemSound::Error),
            "fast-sweep-up" => Ok(SystemSound::FastSweepUp),
            _ => Err(format!("unknown sound '{s}'")),
        }
    }
}
