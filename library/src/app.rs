//! Startup sequence and pixel polling loop.
//!
//! ```text
//! Uninitialized --initialize--> Initialized --setup--> Polling --run--> Stopped
//! ```

use crate::registers::{PowerMode, Register, ResetKind};
use crate::transport::{BusConfig, Transport};
use crate::{BusError, GridEye};
use embedded_hal::delay::DelayNs;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

/// What to do when a bus transaction fails after initialization.
///
/// Bus initialization failures are fatal either way.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Strictness {
    /// Any failed transaction stops the application.
    #[default]
    Strict,
    /// Log the failure and carry on. A failed poll emits nothing.
    Lenient,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Config {
    pub bus: BusConfig,
    pub strictness: Strictness,
    /// Pause between polls. Zero polls back to back.
    pub poll_interval: Duration,
    /// Stop after this many polls.
    pub max_polls: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            strictness: Strictness::default(),
            // One frame at the sensor's 10 fps rate.
            poll_interval: Duration::from_millis(100),
            max_polls: None,
        }
    }
}

impl Config {
    pub fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_polls(mut self, max_polls: Option<u64>) -> Self {
        self.max_polls = max_polls;
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Uninitialized,
    Initialized,
    Polling,
    Stopped,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("bus initialization failed")]
    Init(#[source] BusError),
    #[error("startup write to register {register:#04x} failed")]
    Startup {
        register: u8,
        #[source]
        source: BusError,
    },
    #[error("pixel read failed")]
    Poll(#[source] BusError),
    #[error("output channel failed")]
    Output(#[from] io::Error),
    #[error("cannot {operation} while {state:?}")]
    InvalidState { operation: &'static str, state: State },
}

/// Cloneable stop flag, checked once per poll.
#[derive(Clone, Debug, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Reads pixel 0 forever and prints `Pixel 0 Data: <value>` per poll.
pub struct Application<T, W, D> {
    sensor: GridEye<T>,
    output: W,
    delay: D,
    config: Config,
    state: State,
    polls: u64,
}

impl<T: Transport, W: Write, D: DelayNs> Application<T, W, D> {
    pub fn new(transport: T, output: W, delay: D, config: Config) -> Self {
        Self {
            sensor: GridEye::with_timeout(transport, config.bus.timeout),
            output,
            delay,
            config,
            state: State::Uninitialized,
            polls: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Number of polls attempted so far.
    pub fn polls(&self) -> u64 {
        self.polls
    }

    fn expect_state(&self, expected: State, operation: &'static str) -> Result<(), Error> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Configure the bus peripheral.
    pub fn initialize(&mut self) -> Result<(), Error> {
        self.expect_state(State::Uninitialized, "initialize")?;

        self.sensor
            .transport_mut()
            .init(&self.config.bus)
            .map_err(Error::Init)?;

        tracing::info!("bus initialized at {} Hz", self.config.bus.frequency);
        self.state = State::Initialized;
        Ok(())
    }

    /// Reset the sensor and put it in normal power mode.
    pub fn setup(&mut self) -> Result<(), Error> {
        self.expect_state(State::Initialized, "set up")?;

        self.startup_write(Register::Reset, ResetKind::InitialReset.into())?;
        self.startup_write(Register::PowerControl, PowerMode::Normal.into())?;

        tracing::info!("sensor configured, polling");
        self.state = State::Polling;
        Ok(())
    }

    fn startup_write(&mut self, register: Register, value: u8) -> Result<(), Error> {
        match self.sensor.write_register(register, value) {
            Ok(()) => Ok(()),
            Err(source) if self.config.strictness == Strictness::Lenient => {
                tracing::warn!("ignoring failed write to {register:?}: {source}");
                Ok(())
            }
            Err(source) => Err(Error::Startup {
                register: register.into(),
                source,
            }),
        }
    }

    /// Read pixel 0 once and emit it.
    ///
    /// Returns `None` when a lenient poll failed and nothing was emitted.
    pub fn poll_once(&mut self) -> Result<Option<u8>, Error> {
        self.expect_state(State::Polling, "poll")?;
        self.polls += 1;

        match self.sensor.read_register(Register::Pixel0) {
            Ok(value) => {
                writeln!(self.output, "Pixel 0 Data: {value}")?;
                self.output.flush()?;
                Ok(Some(value))
            }
            Err(source) if self.config.strictness == Strictness::Lenient => {
                tracing::warn!("skipping poll {}: {source}", self.polls);
                Ok(None)
            }
            Err(source) => Err(Error::Poll(source)),
        }
    }

    /// Bring the sensor up if needed, then poll until `shutdown` is
    /// triggered or the poll limit is reached.
    pub fn run(&mut self, shutdown: &Shutdown) -> Result<(), Error> {
        if self.state == State::Uninitialized {
            self.initialize()?;
        }
        if self.state == State::Initialized {
            self.setup()?;
        }
        self.expect_state(State::Polling, "run")?;

        let mut first = true;
        while !self.finished(shutdown) {
            if !first {
                self.pause();
            }
            first = false;

            self.poll_once()?;
        }

        tracing::info!("stopped after {} polls", self.polls);
        self.state = State::Stopped;
        Ok(())
    }

    fn finished(&self, shutdown: &Shutdown) -> bool {
        shutdown.is_triggered() || self.config.max_polls.is_some_and(|max| self.polls >= max)
    }

    // DelayNs takes u32, so long intervals go out in millisecond chunks.
    fn pause(&mut self) {
        let interval = self.config.poll_interval;

        let mut ms = interval.as_millis();
        while ms > 0 {
            let chunk = u32::try_from(ms).unwrap_or(u32::MAX);
            self.delay.delay_ms(chunk);
            ms -= u128::from(chunk);
        }

        let us = interval.subsec_micros() % 1_000;
        if us > 0 {
            self.delay.delay_us(us);
        }
    }

    /// Give back the transport and output channel.
    pub fn release(self) -> (T, W) {
        (self.sensor.release(), self.output)
    }
}
