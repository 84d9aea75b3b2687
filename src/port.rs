use log::debug;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;

use crate::transport::{LineSpeed, ReadOutcome, Transport, read_burst};

/// Line settings of a serial IR tower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub dev: String,
    pub baud: u32,
    pub parity: Parity,
}

impl SerialSettings {
    pub fn at(dev: impl Into<String>, speed: LineSpeed) -> Self {
        Self {
            dev: dev.into(),
            baud: speed.baud(),
            parity: line_parity(speed),
        }
    }

    /// 2400 baud, 8 data bits, odd parity, 1 stop bit.
    pub fn standard(dev: impl Into<String>) -> Self {
        Self::at(dev, LineSpeed::Standard)
    }

    /// 4800 baud without parity, used with the fast download stub.
    pub fn fast(dev: impl Into<String>) -> Self {
        Self::at(dev, LineSpeed::Fast)
    }
}

fn line_parity(speed: LineSpeed) -> Parity {
    match speed {
        LineSpeed::Standard => Parity::Odd,
        LineSpeed::Fast => Parity::None,
    }
}

pub fn open_port(settings: &SerialSettings) -> io::Result<Box<dyn SerialPort>> {
    let builder = serialport::new(&settings.dev, settings.baud)
        .timeout(Duration::from_millis(100))
        .data_bits(DataBits::Eight)
        .parity(settings.parity)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None);

    builder.open().map_err(|e| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("open {}: {}", settings.dev, e),
        )
    })
}

/// Serial IR tower (LEGO serial tower or a DIY equivalent).
pub struct SerialTransport {
    settings: SerialSettings,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            port: None,
        }
    }

    /// Create and open in one step.
    pub fn connect(settings: SerialSettings) -> io::Result<Self> {
        let mut t = Self::new(settings);
        t.open()?;
        Ok(t)
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }
}

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "serial port not open")
}

impl Transport for SerialTransport {
    fn open(&mut self) -> io::Result<()> {
        let port = open_port(&self.settings)?;
        debug!(
            "[port] opened {} at {} baud, parity {:?}",
            self.settings.dev, self.settings.baud, self.settings.parity
        );
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("[port] closed {}", self.settings.dev);
        }
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let port = self.port.as_mut().ok_or_else(not_open)?;
        // stale bytes would break echo matching
        port.clear(ClearBuffer::Input)?;
        port.write_all(bytes)?;
        port.flush()
    }

    /// The serial driver hands parity and framing faults over as ordinary
    /// bytes, so `channel_error` is never set here.
    fn read_with_timeout(&mut self, timeout: Duration) -> io::Result<ReadOutcome> {
        let port = self.port.as_mut().ok_or_else(not_open)?;
        let bytes = read_burst(
            |buf, wait| {
                port.set_timeout(wait)?;
                port.read(buf)
            },
            timeout,
        )?;
        Ok(ReadOutcome::bytes(bytes))
    }

    fn set_line_speed(&mut self, speed: LineSpeed) -> io::Result<()> {
        let parity = line_parity(speed);
        if let Some(port) = self.port.as_mut() {
            port.set_baud_rate(speed.baud())?;
            port.set_parity(parity)?;
        }
        self.settings.baud = speed.baud();
        self.settings.parity = parity;
        debug!(
            "[port] {} now at {} baud, parity {:?}",
            self.settings.dev, self.settings.baud, self.settings.parity
        );
        Ok(())
    }
}
