//!
//! This library provides communication with a BK Precision 2831E bench multimeter.
//!
//! <br>
//!
//! # Details
//!
//! - The 2831E talks SCPI-like ASCII lines over its USB port (a CP210x
//!   serial bridge). Its firmware echoes commands, truncates lines and mixes
//!   in line noise, so every reading goes through a retrying fetch that
//!   flushes and finally reopens the port when the link wedges.
//!
//! - Basic setup and connection
//!
//!   ```no_run
//!   use bk2831ctrl::{Device, Function, PortSelector, DEFAULT_BAUDRATE};
//!   #[tokio::main]
//!   async fn main() -> bk2831ctrl::Result<()> {
//!       let mut device = Device::new();
//!       let ident = device.connect(PortSelector::Auto, DEFAULT_BAUDRATE).await?;
//!       eprintln!("Connected to: {}\n", ident.model);
//!       let reading = device.read(Function::DcVoltage).await?;
//!       println!("{}", reading);
//!       device.disconnect().await;
//!       Ok(())
//!   }
//!   ```
//!
//! - Polling is up to the caller. Back off while [`Device::is_cooling_off`]
//!   reports a recovering link.
//!
//! # Supported devices
//!
//!  * BK Precision 2831E
//!

pub mod config;
pub mod device;
pub mod measurement;
pub mod proto;

pub use config::Config;
pub use device::Device;
pub use measurement::{Function, RangeSpec, Reading, TriggerSource, Validity};
pub use proto::port::PortSelector;
pub use proto::{ProtoError, Result};

#[cfg(unix)]
pub const DEFAULT_TTY: &str = "/dev/ttyUSB0";
#[cfg(windows)]
pub const DEFAULT_TTY: &str = "COM1";

/// Factory setting of the 2831E.
pub const DEFAULT_BAUDRATE: u32 = 9600;

/// Baudrates selectable on the meter's front panel.
pub const SUPPORTED_BAUDRATES: [u32; 7] = [600, 1200, 2400, 4800, 9600, 19200, 38400];
