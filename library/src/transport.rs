//! Blocking bus transport contract.
//!
//! A transaction is submitted with [`Transport::write`] or
//! [`Transport::write_read`] and finished with
//! [`Transport::wait_complete`]. Only one transaction may be in flight.
//! Every transaction ends with a stop condition, releasing the bus.

use crate::{BusError, DEFAULT_TIMEOUT, Result};
use embedded_hal::i2c::{self, SevenBitAddress};
use std::time::{Duration, Instant};

/// Bus clock the GridEYE supports in fast mode.
pub const FAST_MODE_HZ: u32 = 400_000;

/// Bus parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BusConfig {
    /// Target SCL frequency in Hz.
    pub frequency: u32,
    /// Bound on each transaction. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            frequency: FAST_MODE_HZ,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

impl BusConfig {
    pub fn with_frequency(mut self, frequency: u32) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

pub trait Transport {
    /// Configure the bus peripheral.
    fn init(&mut self, config: &BusConfig) -> Result<()>;

    /// Submit a write of `bytes` to `address`.
    fn write(&mut self, address: SevenBitAddress, bytes: &[u8]) -> Result<()>;

    /// Submit a write of `bytes` followed by a read of `read_len` bytes.
    fn write_read(&mut self, address: SevenBitAddress, bytes: &[u8], read_len: usize) -> Result<()>;

    /// Block until the submitted transaction finishes and return the
    /// bytes it read (empty for a plain write).
    fn wait_complete(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn init(&mut self, config: &BusConfig) -> Result<()> {
        T::init(self, config)
    }

    fn write(&mut self, address: SevenBitAddress, bytes: &[u8]) -> Result<()> {
        T::write(self, address, bytes)
    }

    fn write_read(&mut self, address: SevenBitAddress, bytes: &[u8], read_len: usize) -> Result<()> {
        T::write_read(self, address, bytes, read_len)
    }

    fn wait_complete(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        T::wait_complete(self, timeout)
    }
}

struct Completed {
    outcome: Result<Vec<u8>>,
    elapsed: Duration,
}

/// [`Transport`] over any blocking `embedded-hal` I2C bus.
///
/// `embedded-hal` transactions block until done, so the work happens on
/// submit and [`Transport::wait_complete`] reports the outcome. A
/// transaction that outlived the timeout is reported as
/// [`BusError::Timeout`] even if it succeeded. The bus clock is fixed by
/// whoever built the HAL instance.
pub struct HalTransport<I2C> {
    i2c: I2C,
    completed: Option<Completed>,
}

impl<I2C: i2c::I2c> HalTransport<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self { i2c, completed: None }
    }

    pub fn release(self) -> I2C {
        self.i2c
    }

    fn submit<F>(&mut self, op: F) -> Result<()>
    where
        F: FnOnce(&mut I2C) -> std::result::Result<Vec<u8>, I2C::Error>,
    {
        if self.completed.is_some() {
            return Err(BusError::Busy);
        }

        let start = Instant::now();
        let outcome = op(&mut self.i2c).map_err(|e| BusError::from(i2c::Error::kind(&e)));

        self.completed = Some(Completed {
            outcome,
            elapsed: start.elapsed(),
        });

        Ok(())
    }
}

impl<I2C: i2c::I2c> Transport for HalTransport<I2C> {
    fn init(&mut self, config: &BusConfig) -> Result<()> {
        tracing::debug!("HAL bus ready, requested {} Hz", config.frequency);
        self.completed = None;
        Ok(())
    }

    fn write(&mut self, address: SevenBitAddress, bytes: &[u8]) -> Result<()> {
        self.submit(|i2c| i2c.write(address, bytes).map(|()| Vec::new()))
    }

    fn write_read(&mut self, address: SevenBitAddress, bytes: &[u8], read_len: usize) -> Result<()> {
        self.submit(|i2c| {
            let mut read = vec![0; read_len];
            i2c.write_read(address, bytes, &mut read)?;
            Ok(read)
        })
    }

    fn wait_complete(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let completed = self.completed.take().ok_or(BusError::Idle)?;

        match timeout {
            Some(limit) if completed.elapsed > limit => {
                tracing::warn!("transaction took {:?}, limit {:?}", completed.elapsed, limit);
                Err(BusError::Timeout)
            }
            _ => completed.outcome,
        }
    }
}
