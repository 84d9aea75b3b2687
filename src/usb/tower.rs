use log::{debug, info, warn};
use rusb::{Context, DeviceHandle, Direction, Recipient, RequestType, TransferType, UsbContext};
use std::io;
use std::time::Duration;

use super::{
    CONFIGURATION, FLUSH_RX, FLUSH_TX, INTERFACE, PRODUCT_ID, Request, TowerVersion, VENDOR_ID,
    check_reply, check_speed, speed_code, tx_ready,
};
use crate::transport::{LineSpeed, ReadOutcome, Transport, read_burst};

const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);
const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

struct Link {
    handle: DeviceHandle<Context>,
    ep_in: u8,
    ep_out: u8,
}

/// LEGO USB IR tower. The tower keeps its own transmission off the receive
/// path, so replies arrive without an echo.
pub struct UsbTowerTransport {
    context: Context,
    speed: LineSpeed,
    link: Option<Link>,
}

impl UsbTowerTransport {
    pub fn new(speed: LineSpeed) -> io::Result<Self> {
        let context = Context::new().map_err(usb_error)?;
        Ok(Self {
            context,
            speed,
            link: None,
        })
    }

    /// Create and open in one step.
    pub fn connect(speed: LineSpeed) -> io::Result<Self> {
        let mut t = Self::new(speed)?;
        t.open()?;
        Ok(t)
    }

    pub fn version(&self) -> io::Result<TowerVersion> {
        let link = self.link.as_ref().ok_or_else(not_open)?;
        let reply = vendor_request(&link.handle, Request::GetVersion, 0)?;
        Ok(TowerVersion::parse(&reply)?)
    }
}

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "USB tower not open")
}

fn usb_error(e: rusb::Error) -> io::Error {
    let kind = match e {
        rusb::Error::Timeout => io::ErrorKind::TimedOut,
        rusb::Error::NoDevice | rusb::Error::NotFound => io::ErrorKind::NotFound,
        rusb::Error::Access => io::ErrorKind::PermissionDenied,
        rusb::Error::Busy => io::ErrorKind::ResourceBusy,
        rusb::Error::NotSupported => io::ErrorKind::Unsupported,
        rusb::Error::Io | rusb::Error::Pipe => io::ErrorKind::BrokenPipe,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, e)
}

fn vendor_request(
    handle: &DeviceHandle<Context>,
    request: Request,
    value: u16,
) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; request.reply_len()];
    let kind = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
    let n = handle
        .read_control(kind, request.code(), value, 0, &mut buf, CONTROL_TIMEOUT)
        .map_err(usb_error)?;
    buf.truncate(n);
    check_reply(request, &buf)?;
    Ok(buf)
}

fn set_speed(handle: &DeviceHandle<Context>, speed: LineSpeed) -> io::Result<()> {
    for request in [Request::SetTxSpeed, Request::SetRxSpeed] {
        let reply = vendor_request(handle, request, speed_code(speed))?;
        check_speed(request, &reply, speed)?;
    }
    Ok(())
}

/// Interrupt IN and OUT endpoint addresses of the tower interface.
fn interrupt_endpoints(handle: &DeviceHandle<Context>) -> io::Result<(u8, u8)> {
    let config = handle
        .device()
        .active_config_descriptor()
        .map_err(usb_error)?;
    let mut ep_in = None;
    let mut ep_out = None;
    for interface in config.interfaces().filter(|i| i.number() == INTERFACE) {
        for desc in interface.descriptors() {
            for ep in desc.endpoint_descriptors() {
                if ep.transfer_type() != TransferType::Interrupt {
                    continue;
                }
                match ep.direction() {
                    Direction::In => ep_in = ep_in.or(Some(ep.address())),
                    Direction::Out => ep_out = ep_out.or(Some(ep.address())),
                }
            }
        }
    }
    ep_in.zip(ep_out).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "tower interface has no interrupt endpoints",
        )
    })
}

impl Transport for UsbTowerTransport {
    fn open(&mut self) -> io::Result<()> {
        let mut handle = self
            .context
            .open_device_with_vid_pid(VENDOR_ID, PRODUCT_ID)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no LEGO USB tower found"))?;

        let version = TowerVersion::parse(&vendor_request(&handle, Request::GetVersion, 0)?)?;
        info!("[usb] tower firmware {}", version);
        vendor_request(&handle, Request::Reset, 0)?;

        if handle.kernel_driver_active(INTERFACE).unwrap_or(false) {
            debug!("[usb] detaching kernel driver");
            handle.detach_kernel_driver(INTERFACE).map_err(usb_error)?;
        }
        handle
            .set_active_configuration(CONFIGURATION)
            .map_err(usb_error)?;
        handle.claim_interface(INTERFACE).map_err(usb_error)?;

        set_speed(&handle, self.speed)?;
        let (ep_in, ep_out) = interrupt_endpoints(&handle)?;
        vendor_request(&handle, Request::Flush, FLUSH_TX | FLUSH_RX)?;
        debug!(
            "[usb] opened at {} baud, endpoints in 0x{:02X} out 0x{:02X}",
            self.speed.baud(),
            ep_in,
            ep_out
        );

        self.link = Some(Link {
            handle,
            ep_in,
            ep_out,
        });
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.handle.release_interface(INTERFACE) {
                warn!("[usb] release interface: {}", e);
            }
            debug!("[usb] closed");
        }
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let link = self.link.as_ref().ok_or_else(not_open)?;
        if !tx_ready(&vendor_request(&link.handle, Request::GetTxState, 0)?)? {
            return Err(io::Error::new(
                io::ErrorKind::ResourceBusy,
                "tower transmitter busy",
            ));
        }
        // stale bytes would end up in front of the reply
        vendor_request(&link.handle, Request::Flush, FLUSH_RX)?;

        let mut sent = 0;
        while sent < bytes.len() {
            let n = link
                .handle
                .write_interrupt(link.ep_out, &bytes[sent..], WRITE_TIMEOUT)
                .map_err(usb_error)?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            sent += n;
        }
        Ok(())
    }

    fn read_with_timeout(&mut self, timeout: Duration) -> io::Result<ReadOutcome> {
        let link = self.link.as_ref().ok_or_else(not_open)?;
        let bytes = read_burst(
            |buf, wait| {
                // libusb treats a zero timeout as unlimited
                let wait = wait.max(Duration::from_millis(1));
                link.handle
                    .read_interrupt(link.ep_in, buf, wait)
                    .map_err(usb_error)
            },
            timeout,
        )?;
        Ok(ReadOutcome::bytes(bytes))
    }

    fn echoes(&self) -> bool {
        false
    }

    fn set_line_speed(&mut self, speed: LineSpeed) -> io::Result<()> {
        if let Some(link) = self.link.as_ref() {
            set_speed(&link.handle, speed)?;
        }
        self.speed = speed;
        debug!("[usb] now at {} baud", speed.baud());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_errors_keep_their_meaning() {
        assert_eq!(
            usb_error(rusb::Error::Timeout).kind(),
            io::ErrorKind::TimedOut
        );
        assert_eq!(
            usb_error(rusb::Error::NoDevice).kind(),
            io::ErrorKind::NotFound
        );
        assert_eq!(
            usb_error(rusb::Error::Overflow).kind(),
            io::ErrorKind::Other
        );
    }
}
