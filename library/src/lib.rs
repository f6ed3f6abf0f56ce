//! Blocking register driver for the Panasonic GridEYE 8x8 infrared array
//! sensor.
//!
//! [`GridEye`] issues single-register writes and write-then-read
//! transactions over any [`Transport`]. [`app::Application`] drives the
//! startup sequence and the pixel polling loop on top of it.

use embedded_hal::i2c::{self, SevenBitAddress};
use std::time::Duration;
use thiserror::Error;

pub mod app;
pub mod bridge;
pub mod delay;
pub mod registers;
pub mod transport;

pub use app::{Application, Config, Shutdown, State, Strictness};
pub use bridge::{Bridge, Link, UsbLink};
pub use delay::Sleep;
pub use registers::{PowerMode, Register, ResetKind};
pub use transport::{BusConfig, HalTransport, Transport};

/// GridEYE 7-bit address with the AD_SELECT pin pulled high.
pub const DEVICE_ADDRESS: SevenBitAddress = 0b110_1001;

/// Default bound on a single bus transaction.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus initialization failed")]
    Init,
    #[error("device did not acknowledge")]
    NoAcknowledge,
    #[error("bus arbitration lost")]
    ArbitrationLoss,
    #[error("transaction timed out")]
    Timeout,
    #[error("a transaction is already in flight")]
    Busy,
    #[error("no transaction in flight")]
    Idle,
    #[error("malformed response")]
    Protocol,
    #[error("nusb error: {0}")]
    Usb(nusb::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("device not found")]
    DeviceNotFound,
    #[error("I2C bus error")]
    Other,
}

pub type Result<T> = std::result::Result<T, BusError>;

impl From<i2c::ErrorKind> for BusError {
    fn from(kind: i2c::ErrorKind) -> Self {
        match kind {
            i2c::ErrorKind::NoAcknowledge(_) => BusError::NoAcknowledge,
            i2c::ErrorKind::ArbitrationLoss => BusError::ArbitrationLoss,
            _ => BusError::Other,
        }
    }
}

impl i2c::Error for BusError {
    fn kind(&self) -> i2c::ErrorKind {
        match *self {
            BusError::NoAcknowledge => i2c::ErrorKind::NoAcknowledge(i2c::NoAcknowledgeSource::Unknown),
            BusError::ArbitrationLoss => i2c::ErrorKind::ArbitrationLoss,
            _ => i2c::ErrorKind::Other,
        }
    }
}

/// GridEYE register accessor.
///
/// Owns its transport, so transactions never interleave. Each call
/// submits one transaction and blocks in [`Transport::wait_complete`]
/// for at most the configured timeout.
pub struct GridEye<T> {
    transport: T,
    timeout: Option<Duration>,
}

impl<T: Transport> GridEye<T> {
    /// Create a driver bounded by [`DEFAULT_TIMEOUT`].
    pub fn new(transport: T) -> Self {
        Self::with_timeout(transport, Some(DEFAULT_TIMEOUT))
    }

    /// Create a driver with an explicit timeout. `None` waits forever.
    pub fn with_timeout(transport: T, timeout: Option<Duration>) -> Self {
        Self { transport, timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Write `value` to `register`.
    ///
    /// Transmits exactly `[register, value]` followed by a stop condition.
    pub fn write(&mut self, register: u8, value: u8) -> Result<()> {
        tracing::debug!("write {register:#04x} <- {value:#04x}");

        self.transport.write(DEVICE_ADDRESS, &[register, value])?;
        self.transport.wait_complete(self.timeout)?;

        Ok(())
    }

    /// Read one byte from `register`.
    ///
    /// Transmits the register address, then reads exactly one byte back.
    pub fn read(&mut self, register: u8) -> Result<u8> {
        self.transport.write_read(DEVICE_ADDRESS, &[register], 1)?;
        let data = self.transport.wait_complete(self.timeout)?;

        match data.as_slice() {
            [value] => {
                tracing::debug!("read {register:#04x} -> {value:#04x}");
                Ok(*value)
            }
            _ => {
                tracing::error!("expected 1 byte from {register:#04x}, got {}", data.len());
                Err(BusError::Protocol)
            }
        }
    }

    pub fn write_register(&mut self, register: Register, value: u8) -> Result<()> {
        self.write(register.into(), value)
    }

    pub fn read_register(&mut self, register: Register) -> Result<u8> {
        self.read(register.into())
    }

    /// Issue a software reset.
    pub fn reset(&mut self, kind: ResetKind) -> Result<()> {
        self.write_register(Register::Reset, kind.into())
    }

    pub fn set_power_mode(&mut self, mode: PowerMode) -> Result<()> {
        self.write_register(Register::PowerControl, mode.into())
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give back the transport.
    pub fn release(self) -> T {
        self.transport
    }
}
