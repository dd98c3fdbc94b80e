// Bus, roster, motion profile and goal configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::messages::GoalSet;
use crate::sequencer::PollLimit;
use crate::servo::{BROADCAST_ID, DeviceId, DeviceModel, MAX_DEVICE_ID};

// Serial port for the servo bus
pub const DEVICE_PORT: &str = "/dev/ttyUSB0";
pub const BAUDRATE: u32 = 1_000_000;

// Devices on the bus, fixed for the lifetime of the process
pub const DEVICE_IDS: [DeviceId; 4] = [0, 1, 2, 3];

// Motion profile written once at startup
pub const PROFILE_ACCELERATION: i32 = 300;
pub const PROFILE_VELOCITY: i32 = 600;

// A device has arrived when |goal - present| is below this
pub const MOVING_STATUS_THRESHOLD: u32 = 5;

// Goal sets, one position per device in DEVICE_IDS order
pub const GOAL_POSITIONS: [[i32; 4]; 2] = [[1800, 2000, 2000, 2000], [2200, 2500, 1500, 2200]];

// Give up on a goal set after this long
pub const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(10);

// Keyboard poll period while waiting for input
pub const KEY_POLL_INTERVAL: Duration = Duration::from_millis(50);

// Zenoh topic for per-pass position reports
pub const TOPIC_POSITIONS: &str = "servo/state/positions";

/// Full runtime configuration, loadable from JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub port: String,
    pub baudrate: u32,
    pub model: DeviceModel,
    pub ids: Vec<DeviceId>,
    pub profile_acceleration: i32,
    pub profile_velocity: i32,
    pub threshold: u32,
    pub goal_positions: Vec<Vec<i32>>,
    /// `None` disables the deadline
    pub convergence_timeout_ms: Option<u64>,
    pub max_poll_passes: Option<u64>,
    pub poll_interval_ms: u64,
    /// Run against the in-memory bus instead of a serial port
    pub simulate: bool,
    pub sim_step: i32,
    /// Advance this many times without keyboard input, then quit
    pub auto_cycles: Option<u32>,
    pub telemetry: bool,
    pub telemetry_topic: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: DEVICE_PORT.to_string(),
            baudrate: BAUDRATE,
            model: DeviceModel::default(),
            ids: DEVICE_IDS.to_vec(),
            profile_acceleration: PROFILE_ACCELERATION,
            profile_velocity: PROFILE_VELOCITY,
            threshold: MOVING_STATUS_THRESHOLD,
            goal_positions: GOAL_POSITIONS.iter().map(|set| set.to_vec()).collect(),
            convergence_timeout_ms: Some(CONVERGENCE_TIMEOUT.as_millis() as u64),
            max_poll_passes: None,
            poll_interval_ms: 0,
            simulate: false,
            sim_step: crate::servo::sim::DEFAULT_STEP,
            auto_cycles: None,
            telemetry: false,
            telemetry_topic: TOPIC_POSITIONS.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.ids.is_empty() {
            return Err(Error::Config("device roster is empty".to_string()));
        }
        for (i, &id) in self.ids.iter().enumerate() {
            if id == BROADCAST_ID || id > MAX_DEVICE_ID {
                return Err(Error::Config(format!("device id {} is not a valid device address", id)));
            }
            if self.ids[..i].contains(&id) {
                return Err(Error::Config(format!("device id {} listed twice", id)));
            }
        }
        if self.threshold == 0 {
            return Err(Error::Config("threshold must be positive".to_string()));
        }
        if self.goal_positions.is_empty() {
            return Err(Error::Config("no goal positions configured".to_string()));
        }
        for (i, set) in self.goal_positions.iter().enumerate() {
            if set.len() != self.ids.len() {
                return Err(Error::Config(format!(
                    "goal set {} has {} positions for {} devices",
                    i,
                    set.len(),
                    self.ids.len()
                )));
            }
        }
        if self.simulate && self.sim_step <= 0 {
            return Err(Error::Config("sim_step must be positive".to_string()));
        }
        Ok(())
    }

    pub fn goal_sets(&self) -> Result<Vec<GoalSet>> {
        self.goal_positions
            .iter()
            .enumerate()
            .map(|(i, positions)| {
                GoalSet::from_positions(&self.ids, positions)
                    .ok_or_else(|| Error::Config(format!("goal set {} does not match the roster", i)))
            })
            .collect()
    }

    pub fn poll_limit(&self) -> PollLimit {
        PollLimit {
            max_passes: self.max_poll_passes,
            deadline: self.convergence_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
