use std::io;
use std::time::{Duration, Instant};

use crate::proto::codec::FrameProfile;

/// Quiet time after the last received byte that ends a read early.
pub const INTER_BYTE_GAP: Duration = Duration::from_millis(40);

/// IR line speed, paired with the framing the brick expects at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineSpeed {
    /// 2400 baud, regular frames.
    #[default]
    Standard,
    /// 4800 baud, fast frames. Only the fast download stub listens here.
    Fast,
}

impl LineSpeed {
    pub fn baud(self) -> u32 {
        match self {
            LineSpeed::Standard => 2400,
            LineSpeed::Fast => 4800,
        }
    }

    pub fn profile(self) -> FrameProfile {
        match self {
            LineSpeed::Standard => FrameProfile::STANDARD,
            LineSpeed::Fast => FrameProfile::FAST,
        }
    }
}

/// Bytes collected by one bounded read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes: Vec<u8>,
    /// Parity or framing fault seen on the line while reading. Only transports
    /// that can observe line faults ever set it.
    pub channel_error: bool,
}

impl ReadOutcome {
    pub fn bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            channel_error: false,
        }
    }
}

/// Link to an IR tower. The protocol engine only talks to the tower through
/// this trait.
pub trait Transport {
    fn open(&mut self) -> io::Result<()>;

    fn close(&mut self);

    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Collect whatever arrives within `timeout`. Fewer bytes than expected
    /// (or none) is not an error.
    fn read_with_timeout(&mut self, timeout: Duration) -> io::Result<ReadOutcome>;

    /// Drop and reopen the link to resynchronise the receiver.
    fn reconnect(&mut self) -> io::Result<()> {
        self.close();
        self.open()
    }

    /// Wait on the link's behalf (turnaround time, retry backoff).
    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }

    /// Whether sent frames come back ahead of the reply.
    fn echoes(&self) -> bool {
        true
    }

    /// Retune the line without dropping the link.
    fn set_line_speed(&mut self, speed: LineSpeed) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("line speed {} baud not supported", speed.baud()),
        ))
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> io::Result<()> {
        (**self).open()
    }
    fn close(&mut self) {
        (**self).close()
    }
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write(bytes)
    }
    fn read_with_timeout(&mut self, timeout: Duration) -> io::Result<ReadOutcome> {
        (**self).read_with_timeout(timeout)
    }
    fn reconnect(&mut self) -> io::Result<()> {
        (**self).reconnect()
    }
    fn delay(&mut self, duration: Duration) {
        (**self).delay(duration)
    }
    fn echoes(&self) -> bool {
        (**self).echoes()
    }
    fn set_line_speed(&mut self, speed: LineSpeed) -> io::Result<()> {
        (**self).set_line_speed(speed)
    }
}

/// Read until `timeout` runs out, or until the line stays quiet for
/// [`INTER_BYTE_GAP`] once something has arrived. `read_some` gets the wait
/// allowed for the next read and reports silence as `TimedOut`.
pub(crate) fn read_burst(
    mut read_some: impl FnMut(&mut [u8], Duration) -> io::Result<usize>,
    timeout: Duration,
) -> io::Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::new();
    let mut buf = [0u8; 256];

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let mut wait = deadline - now;
        if !out.is_empty() {
            wait = wait.min(INTER_BYTE_GAP);
        }

        match read_some(&mut buf, wait) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
            Err(e) => return Err(e),
        }
    }

    Ok(out)
}
