use crate::measurement::{Function, TriggerSource};

pub mod codec;
pub mod command;
pub mod port;
pub mod response;
pub mod transport;

#[cfg(test)]
pub mod fake;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("I/O error: {:?}", _0)]
    Io(#[from] std::io::Error),

    #[error("Serial I/O error: {:?}", _0)]
    Serial(#[from] tokio_serial::Error),

    #[error("No 2831E found on any serial port")]
    NoDeviceFound,
    #[error("Serial port {port} exists but cannot be opened: {reason}")]
    PortBusy { port: String, reason: String },
    #[error("Write to device failed: {:?}", _0)]
    WriteError(std::io::Error),
    #[error("No line received within {:?}", _0)]
    ReadTimeout(std::time::Duration),
    #[error("No numeric value could be recovered from the device response")]
    UnreadableResponse,
    #[error("Device does not answer the identity query")]
    NotResponding,
    #[error("Range {range} is not supported for {function}")]
    UnsupportedRange { function: Function, range: String },
    #[error("{operation} is not supported for {function}")]
    UnsupportedForFunction {
        function: Function,
        operation: &'static str,
    },
    #[error("Trigger requires BUS trigger source, current source is {}", _0)]
    TriggerModeMismatch(TriggerSource),
    #[error("NPLC {} is not one of 0.1, 1, 10", _0)]
    InvalidNplc(f64),
    #[error("Reference {value} for {function} outside of {min}..{max}")]
    ReferenceOutOfRange {
        function: Function,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("Baudrate {} is not supported", _0)]
    UnsupportedBaudRate(u32),
    #[error("Not connected")]
    NotConnected,
    #[error("Connection was closed")]
    Abort,
}

impl ProtoError {
    /// Errors caused by the request itself. Retrying them cannot succeed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProtoError::UnsupportedRange { .. }
                | ProtoError::UnsupportedForFunction { .. }
                | ProtoError::TriggerModeMismatch(_)
                | ProtoError::InvalidNplc(_)
                | ProtoError::ReferenceOutOfRange { .. }
                | ProtoError::UnsupportedBaudRate(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProtoError>;
