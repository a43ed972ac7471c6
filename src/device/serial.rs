//! Host serial backend built on the `serialport` crate.
//!
//! Desktop hosts have no interactive USB permission prompt: access means the
//! device node can be opened read/write by this process. A permission
//! request therefore resolves immediately.

use serialport::{ClearBuffer, DataBits, SerialPort, SerialPortType, StopBits};
use std::io::{self, Read};
use std::time::Duration;

use super::{
    CandidatePort, DeviceManager, Driver, LineParams, Parity, PermissionOutcome,
    PermissionTicket, Prober, SerialLink, UsbIds,
};
use crate::error::LinkError;

pub struct SerialDeviceManager {
    prober: Prober,
    configured: Option<String>,
    open_timeout: Duration,
}

impl SerialDeviceManager {
    /// `configured` names a port to use regardless of its USB identity.
    pub fn new(prober: Prober, configured: Option<String>, open_timeout: Duration) -> Self {
        Self {
            prober: prober.with_configured(configured.clone()),
            configured,
            open_timeout,
        }
    }
}

impl DeviceManager for SerialDeviceManager {
    fn enumerate(&self) -> Result<Vec<CandidatePort>, LinkError> {
        let ports = serialport::available_ports()
            .map_err(|e| LinkError::Enumerate(format!("failed to enumerate ports: {}", e)))?;
        let mut candidates: Vec<CandidatePort> = ports
            .into_iter()
            // cu.* devices on macOS; tty.* block on open waiting for carrier detect.
            .filter(|_p| {
                #[cfg(target_os = "macos")]
                {
                    !_p.port_name.starts_with("/dev/tty.")
                }
                #[cfg(not(target_os = "macos"))]
                {
                    true
                }
            })
            .map(|p| {
                let usb = match p.port_type {
                    SerialPortType::UsbPort(info) => Some(UsbIds {
                        vid: info.vid,
                        pid: info.pid,
                        manufacturer: info.manufacturer,
                        product: info.product,
                    }),
                    _ => None,
                };
                CandidatePort {
                    name: p.port_name,
                    usb,
                }
            })
            .collect();

        // A configured port may be a pty or otherwise missing from enumeration.
        if let Some(name) = &self.configured {
            if !candidates.iter().any(|c| &c.name == name) {
                candidates.push(CandidatePort {
                    name: name.clone(),
                    usb: None,
                });
            }
        }
        Ok(candidates)
    }

    fn probe(&self, port: &CandidatePort) -> Option<Driver> {
        self.prober.probe(port)
    }

    fn has_permission(&self, driver: &Driver) -> bool {
        can_access(&driver.port.name)
    }

    fn request_permission(&self, driver: &Driver) -> PermissionTicket {
        if can_access(&driver.port.name) {
            PermissionTicket::ready(PermissionOutcome::Granted)
        } else {
            log::warn!(
                "no read/write access to {}; check group membership (e.g. dialout) or udev rules",
                driver.port.name
            );
            PermissionTicket::ready(PermissionOutcome::Denied)
        }
    }

    fn open(&self, driver: &Driver) -> Result<Box<dyn SerialLink>, LinkError> {
        let name = driver.port.name.clone();
        let port = serialport::new(&name, LineParams::default().baud_rate)
            .timeout(self.open_timeout)
            .open()
            .map_err(|e| LinkError::Open {
                port: name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(HostSerialLink { name, port }))
    }
}

struct HostSerialLink {
    name: String,
    port: Box<dyn SerialPort>,
}

impl SerialLink for HostSerialLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, params: &LineParams) -> Result<(), LinkError> {
        self.port
            .set_baud_rate(params.baud_rate)
            .map_err(|e| LinkError::configure("baud rate", e))?;
        self.port
            .set_data_bits(to_serialport_data_bits(params.data_bits))
            .map_err(|e| LinkError::configure("data bits", e))?;
        self.port
            .set_stop_bits(to_serialport_stop_bits(params.stop_bits))
            .map_err(|e| LinkError::configure("stop bits", e))?;
        self.port
            .set_parity(to_serialport_parity(params.parity))
            .map_err(|e| LinkError::configure("parity", e))?;
        Ok(())
    }

    fn set_line_state(&mut self, dtr: bool, rts: bool) -> Result<(), LinkError> {
        self.port
            .write_data_terminal_ready(dtr)
            .map_err(|e| LinkError::configure("dtr", e))?;
        self.port
            .write_request_to_send(rts)
            .map_err(|e| LinkError::configure("rts", e))?;
        Ok(())
    }

    fn purge_buffers(&mut self, input: bool, output: bool) -> Result<(), LinkError> {
        let which = match (input, output) {
            (true, true) => ClearBuffer::All,
            (true, false) => ClearBuffer::Input,
            (false, true) => ClearBuffer::Output,
            (false, false) => return Ok(()),
        };
        self.port
            .clear(which)
            .map_err(|e| LinkError::configure("purge", e))
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if self.port.timeout() != timeout {
            self.port.set_timeout(timeout).map_err(io::Error::from)?;
        }
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) {
        // serialport closes the descriptor on drop; drop the control lines
        // so the peripheral sees the host go away.
        let result = self.port.write_data_terminal_ready(false);
        note_line_drop(&self.name, result);
    }
}

/// Close-time control line changes are best effort; failures are logged.
fn note_line_drop(name: &str, result: serialport::Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            log::debug!("{}: dropping DTR on close failed: {}", name, err);
            false
        }
    }
}

#[cfg(target_os = "linux")]
fn can_access(path: &str) -> bool {
    let Ok(c_path) = std::ffi::CString::new(path) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
}

#[cfg(not(target_os = "linux"))]
fn can_access(_path: &str) -> bool {
    true
}

fn to_serialport_parity(p: Parity) -> serialport::Parity {
    match p {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn to_serialport_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn to_serialport_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_param_conversions() {
        assert!(matches!(to_serialport_parity(Parity::None), serialport::Parity::None));
        assert!(matches!(to_serialport_parity(Parity::Even), serialport::Parity::Even));
        assert!(matches!(to_serialport_data_bits(7), DataBits::Seven));
        assert!(matches!(to_serialport_data_bits(9), DataBits::Eight));
        assert!(matches!(to_serialport_stop_bits(2), StopBits::Two));
        assert!(matches!(to_serialport_stop_bits(0), StopBits::One));
    }

    #[test]
    fn close_tolerates_line_drop_failure() {
        assert!(note_line_drop("/dev/ttyACM0", Ok(())));
        let unplugged = serialport::Error::new(serialport::ErrorKind::NoDevice, "unplugged");
        assert!(!note_line_drop("/dev/ttyACM0", Err(unplugged)));
    }

    #[test]
    fn configured_port_is_always_a_candidate() {
        let manager = SerialDeviceManager::new(
            Prober::new(Vec::new(), false),
            Some("/dev/does-not-exist-mjpeg".to_string()),
            Duration::from_millis(100),
        );
        // Enumeration itself may fail on hosts without serial support.
        if let Ok(candidates) = manager.enumerate() {
            let port = candidates
                .iter()
                .find(|c| c.name == "/dev/does-not-exist-mjpeg");
            assert!(port.is_some());
            let driver = port.and_then(|p| manager.probe(p));
            assert!(driver.is_some());
        }
    }
}
