use std::{fmt, io, str::FromStr};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{
    ClearBuffer, SerialPort, SerialPortBuilderExt, SerialPortInfo, SerialPortType, SerialStream,
};

use super::{ProtoError, Result};

/// Silicon Labs, vendor of the CP210x bridge inside the 2831E.
const CP210X_VID: u16 = 0x10c4;

/// Byte stream to the meter.
pub trait Link: AsyncRead + AsyncWrite + Send + Unpin {
    /// Drop everything queued in the host side input and output buffers.
    fn clear_buffers(&mut self) -> io::Result<()>;

    fn set_baud_rate(&mut self, baudrate: u32) -> io::Result<()>;
}

impl Link for SerialStream {
    fn clear_buffers(&mut self) -> io::Result<()> {
        SerialPort::clear(self, ClearBuffer::All).map_err(io::Error::from)
    }

    fn set_baud_rate(&mut self, baudrate: u32) -> io::Result<()> {
        SerialPort::set_baud_rate(self, baudrate).map_err(io::Error::from)
    }
}

/// A serial device found on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    pub name: String,
    /// Lower is probed first.
    pub priority: u8,
}

impl From<&SerialPortInfo> for PortCandidate {
    fn from(info: &SerialPortInfo) -> Self {
        let priority = match &info.port_type {
            SerialPortType::UsbPort(usb) => usb_priority(
                usb.vid,
                usb.serial_number.as_deref(),
                usb.manufacturer.as_deref(),
                usb.product.as_deref(),
            ),
            _ => 2,
        };
        Self {
            name: info.port_name.clone(),
            priority,
        }
    }
}

fn usb_priority(
    vid: u16,
    serial_number: Option<&str>,
    manufacturer: Option<&str>,
    product: Option<&str>,
) -> u8 {
    let text = format!(
        "{} {}",
        manufacturer.unwrap_or_default(),
        product.unwrap_or_default()
    )
    .to_uppercase();
    let cp210x = vid == CP210X_VID
        || text.contains("CP210")
        || (text.contains("SILICON LABS") && text.contains("UART"));
    // Unprogrammed 2831E bridges report serial number 0001.
    match (cp210x, serial_number) {
        (true, Some("0001")) => 0,
        (true, _) => 1,
        (false, _) => 2,
    }
}

/// Opens links by port name. Abstracted so the transport can reopen a
/// wedged port and tests can script the meter.
pub trait Opener: Send {
    /// Candidate ports, most likely meter first.
    fn ports(&self) -> Result<Vec<PortCandidate>>;

    fn open(&mut self, port: &str, baudrate: u32) -> Result<Box<dyn Link>>;
}

#[derive(Debug, Default)]
pub struct SerialOpener;

impl Opener for SerialOpener {
    fn ports(&self) -> Result<Vec<PortCandidate>> {
        let mut ports: Vec<PortCandidate> = tokio_serial::available_ports()?
            .iter()
            .map(PortCandidate::from)
            .collect();
        ports.sort_by_key(|p| p.priority);
        Ok(ports)
    }

    fn open(&mut self, port: &str, baudrate: u32) -> Result<Box<dyn Link>> {
        #[allow(unused_mut)]
        let mut stream = tokio_serial::new(port, baudrate)
            .open_native_async()
            .map_err(|err| ProtoError::PortBusy {
                port: port.to_string(),
                reason: err.to_string(),
            })?;

        #[cfg(unix)]
        stream.set_exclusive(false)?;

        Ok(Box::new(stream))
    }
}

/// Port choice offered to the user: a concrete device or probing all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSelector {
    Auto,
    Named(String),
}

impl fmt::Display for PortSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSelector::Auto => f.write_str("auto"),
            PortSelector::Named(name) => f.write_str(name),
        }
    }
}

impl FromStr for PortSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(PortSelector::Auto)
        } else {
            Ok(PortSelector::Named(s.trim().to_string()))
        }
    }
}

/// Selectable ports: `Auto` followed by every device in probing order.
pub fn available_ports(opener: &dyn Opener) -> Result<Vec<PortSelector>> {
    let mut selectors = vec![PortSelector::Auto];
    selectors.extend(
        opener
            .ports()?
            .into_iter()
            .map(|p| PortSelector::Named(p.name)),
    );
    Ok(selectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_priority() {
        assert_eq!(usb_priority(CP210X_VID, Some("0001"), None, None), 0);
        assert_eq!(usb_priority(CP210X_VID, Some("A5"), None, None), 1);
        assert_eq!(
            usb_priority(0x1234, None, Some("Silicon Labs"), Some("CP2102 USB to UART")),
            1
        );
        assert_eq!(usb_priority(0x0403, Some("0001"), Some("FTDI"), None), 2);

        let builtin = SerialPortInfo {
            port_name: "/dev/ttyS0".to_string(),
            port_type: SerialPortType::Unknown,
        };
        assert_eq!(PortCandidate::from(&builtin).priority, 2);
    }

    #[test]
    fn test_parse_selector() {
        assert_eq!("AUTO".parse::<PortSelector>().unwrap(), PortSelector::Auto);
        assert_eq!(
            "COM3".parse::<PortSelector>().unwrap(),
            PortSelector::Named("COM3".to_string())
        );
    }
}
