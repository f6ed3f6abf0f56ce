use clap::{ArgAction, Parser};
use color_eyre::{Result, eyre::WrapErr};
use grideye::{Application, Bridge, BusConfig, Config, Shutdown, Sleep, Strictness};
use std::io;
use std::thread;
use std::time::Duration;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(
    name = "grideye",
    about = "Poll pixel 0 of a GridEYE sensor through a USB-to-I2C bridge",
    version
)]
pub struct Cli {
    /// Serial number of the bridge to use
    #[arg(short, long)]
    serial_number: Option<String>,

    /// I2C bus frequency in Hz
    #[arg(short, long, default_value_t = 400_000)]
    frequency: u32,

    /// Per-transaction timeout in milliseconds, 0 waits forever
    #[arg(short, long, default_value_t = 100)]
    timeout_ms: u64,

    /// Pause between polls in milliseconds
    #[arg(short, long, default_value_t = 100)]
    interval_ms: u64,

    /// Stop after this many polls
    #[arg(short, long)]
    count: Option<u64>,

    /// Log and skip failed transactions instead of exiting
    #[arg(long, default_value_t = false)]
    lenient: bool,

    /// Increase log verbosity
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    pub fn log_level(&self) -> Level {
        match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }

    pub fn config(&self) -> Config {
        let timeout = match self.timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        let strictness = if self.lenient {
            Strictness::Lenient
        } else {
            Strictness::Strict
        };

        Config::default()
            .with_bus(
                BusConfig::default()
                    .with_frequency(self.frequency)
                    .with_timeout(timeout),
            )
            .with_strictness(strictness)
            .with_poll_interval(Duration::from_millis(self.interval_ms))
            .with_max_polls(self.count)
    }

    pub fn run(&self) -> Result<()> {
        let bridge = match &self.serial_number {
            Some(serial_number) => Bridge::open_with_serial_number(serial_number),
            None => Bridge::open(),
        }
        .wrap_err("failed to open USB-to-I2C bridge")?;

        let shutdown = Shutdown::new();
        stop_on_ctrl_c(shutdown.clone())?;

        let stdout = std::io::stdout().lock();
        let mut app = Application::new(bridge, stdout, Sleep, self.config());

        app.run(&shutdown)?;

        Ok(())
    }
}

/// Trigger `shutdown` on the first Ctrl-C and exit on the second.
///
/// The loop only notices the flag between polls, so a transaction with
/// no timeout can hold it off indefinitely.
fn stop_on_ctrl_c(shutdown: Shutdown) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .wrap_err("failed to start signal listener")?;

    thread::spawn(move || {
        runtime.block_on(async {
            if stop_when(tokio::signal::ctrl_c(), &shutdown).await && tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        })
    });

    Ok(())
}

async fn stop_when<F: Future<Output = io::Result<()>>>(signal: F, shutdown: &Shutdown) -> bool {
    match signal.await {
        Ok(()) => {
            tracing::info!("interrupted, stopping after the current poll");
            shutdown.trigger();
            true
        }
        Err(e) => {
            tracing::warn!("cannot listen for Ctrl-C: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_sensor_datasheet() {
        let cli = Cli::try_parse_from(["grideye"]).unwrap();
        let config = cli.config();

        assert_eq!(config.bus.frequency, 400_000);
        assert_eq!(config.bus.timeout, Some(Duration::from_millis(100)));
        assert_eq!(config.strictness, Strictness::Strict);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.max_polls, None);
        assert_eq!(cli.log_level(), Level::WARN);
    }

    #[tokio::test]
    async fn signal_triggers_shutdown() {
        let shutdown = Shutdown::new();

        assert!(stop_when(async { Ok(()) }, &shutdown).await);
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn failed_listener_leaves_loop_running() {
        let shutdown = Shutdown::new();

        assert!(!stop_when(async { Err(io::ErrorKind::Unsupported.into()) }, &shutdown).await);
        assert!(!shutdown.is_triggered());
    }

    #[test]
    fn flags_map_to_config() {
        let cli = Cli::try_parse_from([
            "grideye", "--timeout-ms", "0", "--interval-ms", "0", "--count", "5", "--lenient", "-vv",
        ])
        .unwrap();
        let config = cli.config();

        assert_eq!(config.bus.timeout, None);
        assert_eq!(config.poll_interval, Duration::ZERO);
        assert_eq!(config.max_polls, Some(5));
        assert_eq!(config.strictness, Strictness::Lenient);
        assert_eq!(cli.log_level(), Level::DEBUG);
    }
}
