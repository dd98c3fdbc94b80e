// Command-line flags layered over the config file
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::servo::{DeviceId, DeviceModel};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModelArg {
    XSeries,
    Pro,
}

impl From<ModelArg> for DeviceModel {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::XSeries => DeviceModel::XSeries,
            ModelArg::Pro => DeviceModel::Pro,
        }
    }
}

/// Sync read/write position control for servos sharing one bus.
///
/// Press any key to send the next goal set, ESC or q to quit.
#[derive(Debug, Parser)]
#[command(name = "servo-sync-runtime", version)]
pub struct Args {
    /// JSON config file; flags below override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Serial port of the bus adapter
    #[arg(short, long)]
    pub port: Option<String>,

    #[arg(short, long)]
    pub baudrate: Option<u32>,

    /// Device ids, comma separated (e.g. 0,1,2,3)
    #[arg(long, value_delimiter = ',')]
    pub ids: Option<Vec<DeviceId>>,

    #[arg(long, value_enum)]
    pub model: Option<ModelArg>,

    /// Arrival threshold in position units
    #[arg(long)]
    pub threshold: Option<u32>,

    /// Give up on a goal set after this many milliseconds
    #[arg(long, conflicts_with = "no_timeout")]
    pub timeout_ms: Option<u64>,

    /// Poll until arrival with no deadline
    #[arg(long)]
    pub no_timeout: bool,

    /// Give up on a goal set after this many polling passes
    #[arg(long)]
    pub max_passes: Option<u64>,

    /// Use the in-memory simulated bus
    #[arg(long)]
    pub simulate: bool,

    /// Advance N times without keyboard input, then quit
    #[arg(long)]
    pub cycles: Option<u32>,

    /// Publish poll reports over zenoh
    #[arg(long)]
    pub telemetry: bool,
}

impl Args {
    pub fn into_config(self) -> Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::from_json_file(path)?,
            None => RuntimeConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(baudrate) = self.baudrate {
            config.baudrate = baudrate;
        }
        if let Some(ids) = self.ids {
            config.ids = ids;
        }
        if let Some(model) = self.model {
            config.model = model.into();
        }
        if let Some(threshold) = self.threshold {
            config.threshold = threshold;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.convergence_timeout_ms = Some(timeout_ms);
        }
        if self.no_timeout {
            config.convergence_timeout_ms = None;
        }
        if let Some(max_passes) = self.max_passes {
            config.max_poll_passes = Some(max_passes);
        }
        if let Some(cycles) = self.cycles {
            config.auto_cycles = Some(cycles);
        }
        config.simulate |= self.simulate;
        config.telemetry |= self.telemetry;

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "servo-sync-runtime",
            "--ids",
            "1,2",
            "--model",
            "pro",
            "--threshold",
            "10",
            "--no-timeout",
            "--simulate",
        ]);
        // Goal sets still have four entries, so the roster change must be rejected
        assert!(args.into_config().is_err());

        let args = Args::parse_from(["servo-sync-runtime", "--port", "/dev/ttyACM0", "--timeout-ms", "500"]);
        let config = args.into_config().unwrap();
        assert_eq!(config.port, "/dev/ttyACM0");
        assert_eq!(config.convergence_timeout_ms, Some(500));
        assert!(!config.simulate);
    }

    #[test]
    fn test_model_and_simulation_flags() {
        let args = Args::parse_from(["servo-sync-runtime", "--model", "pro", "--simulate", "--cycles", "4"]);
        let config = args.into_config().unwrap();
        assert_eq!(config.model, DeviceModel::Pro);
        assert!(config.simulate);
        assert_eq!(config.auto_cycles, Some(4));
    }
}
