// Device controller for a fixed roster on one bus
//
// Setup writes (torque, profile) go device by device and keep going past
// failures. Goal positions go out as one sync write, present positions come
// back through one sync read registered for the whole roster.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use super::group::{GroupSyncRead, GroupSyncWrite, UsageError};
use super::registers::{self, Register, RegisterMap};
use super::transport::{BusError, CommError, CommResult, PacketTransport};
use super::{DeviceId, MAX_DEVICE_ID};
use crate::error::{Error, Result};
use crate::messages::GoalSet;

/// Outcome of a roster-wide sequential operation
#[derive(Debug, Default)]
pub struct SetupReport {
    pub attempted: Vec<DeviceId>,
    pub failures: Vec<(DeviceId, BusError)>,
}

impl SetupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self, id: DeviceId) -> bool {
        self.failures.iter().any(|(failed, _)| *failed == id)
    }
}

/// Last decoded present position per device
#[derive(Debug, Default, Clone)]
pub struct PresentPositionSnapshot {
    positions: HashMap<DeviceId, i32>,
    fresh: HashSet<DeviceId>,
}

impl PresentPositionSnapshot {
    /// Last known value, possibly from an earlier pass
    pub fn get(&self, id: DeviceId) -> Option<i32> {
        self.positions.get(&id).copied()
    }

    /// Value from the most recent pass only
    pub fn fresh(&self, id: DeviceId) -> Option<i32> {
        if self.fresh.contains(&id) {
            self.get(id)
        } else {
            None
        }
    }

    fn begin_pass(&mut self) {
        self.fresh.clear();
    }

    fn update(&mut self, id: DeviceId, position: i32) {
        self.positions.insert(id, position);
        self.fresh.insert(id);
    }
}

pub struct DeviceController<T: PacketTransport> {
    transport: T,
    map: RegisterMap,
    roster: Vec<DeviceId>,
    position_read: GroupSyncRead,
    snapshot: PresentPositionSnapshot,
}

impl<T: PacketTransport> DeviceController<T> {
    /// Validate the roster and register it for present position polling
    pub fn new(transport: T, map: RegisterMap, roster: Vec<DeviceId>) -> Result<Self> {
        validate_roster(&roster)?;

        let mut position_read = GroupSyncRead::new(map.spec(Register::PresentPosition));
        for &id in &roster {
            position_read.register_device(id)?;
        }

        info!("Controller ready for devices {:?} ({:?})", roster, map.model());
        Ok(Self {
            transport,
            map,
            roster,
            position_read,
            snapshot: PresentPositionSnapshot::default(),
        })
    }

    pub fn roster(&self) -> &[DeviceId] {
        &self.roster
    }

    pub fn snapshot(&self) -> &PresentPositionSnapshot {
        &self.snapshot
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Ping every device; unreachable ones are reported, not fatal
    pub fn ping_all(&mut self) -> SetupReport {
        let mut report = SetupReport::default();
        for &id in &self.roster {
            report.attempted.push(id);
            match self.transport.ping(id) {
                Ok(()) => debug!("Device {} responding", id),
                Err(e) => {
                    warn!("Device {} not responding to ping: {}", id, e);
                    report.failures.push((id, e));
                }
            }
        }
        report
    }

    /// Enable or disable torque on every device, one write each
    pub fn set_torque(&mut self, enabled: bool) -> Result<SetupReport> {
        let action = if enabled { "enabled" } else { "disabled" };
        self.write_each(&[(Register::TorqueEnable, i32::from(enabled))], |id| {
            info!("Device {} has successfully {} torque", id, action)
        })
    }

    /// Write profile acceleration and velocity to every device
    pub fn configure_profile(&mut self, acceleration: i32, velocity: i32) -> Result<SetupReport> {
        self.write_each(
            &[
                (Register::ProfileAcceleration, acceleration),
                (Register::ProfileVelocity, velocity),
            ],
            |id| {
                info!(
                    "Device {} profile set: acceleration={}, velocity={}",
                    id, acceleration, velocity
                )
            },
        )
    }

    /// Send one sync write of goal positions for every target in `goals`
    pub fn command_positions(&mut self, goals: &GoalSet) -> Result<()> {
        let mut group = GroupSyncWrite::new(self.map.spec(Register::GoalPosition));
        for target in &goals.targets {
            if !self.roster.contains(&target.id) {
                return Err(UsageError::UnknownDevice { id: target.id }.into());
            }
            group.add_entry(target.id, target.position)?;
        }

        let result = group.transmit(&mut self.transport);
        group.clear();
        result.map_err(Error::from)
    }

    /// Sync read present positions into the snapshot.
    ///
    /// On failure the snapshot keeps its previous values and nothing is fresh.
    pub fn refresh_positions(&mut self) -> CommResult {
        self.snapshot.begin_pass();
        self.position_read.exchange(&mut self.transport)?;

        for &id in &self.roster {
            match self.position_read.value(id) {
                Ok(position) => self.snapshot.update(id, position),
                Err(_) => warn!("No present position from device {} this pass", id),
            }
        }
        Ok(())
    }

    /// Read one register from one device with a direct read
    pub fn read_register(&mut self, id: DeviceId, register: Register) -> std::result::Result<i32, BusError> {
        let spec = self.map.spec(register);
        let bytes = self.transport.read(id, spec.address, spec.width.bytes())?;
        registers::decode(&bytes).ok_or_else(|| {
            CommError::CorruptedPacket {
                reason: format!("{} bytes for {:?} from device {}", bytes.len(), register, id),
            }
            .into()
        })
    }

    /// Drop the poll roster and disable torque everywhere
    pub fn shutdown(&mut self) -> Result<SetupReport> {
        self.position_read.clear();
        self.set_torque(false)
    }

    // Writes each (register, value) to every device in roster order. Every
    // write is attempted; failures are collected, one entry per failed write.
    fn write_each(
        &mut self,
        writes: &[(Register, i32)],
        on_success: impl Fn(DeviceId),
    ) -> Result<SetupReport> {
        let encoded = writes
            .iter()
            .map(|&(register, value)| {
                let spec = self.map.spec(register);
                registers::encode(value, spec.width).map(|bytes| (register, spec.address, bytes))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut report = SetupReport::default();
        for &id in &self.roster {
            report.attempted.push(id);
            let mut ok = true;
            for (register, address, bytes) in &encoded {
                debug!("Write {:?} to device {}", register, id);
                if let Err(e) = self.transport.write(id, *address, bytes) {
                    warn!("Device {} {:?}: {}", id, register, e);
                    report.failures.push((id, e));
                    ok = false;
                }
            }
            if ok {
                on_success(id);
            }
        }
        Ok(report)
    }
}

fn validate_roster(roster: &[DeviceId]) -> Result<()> {
    if roster.is_empty() {
        return Err(Error::Config("device roster is empty".to_string()));
    }
    let mut seen = HashSet::new();
    for &id in roster {
        if id > MAX_DEVICE_ID {
            return Err(Error::Config(format!(
                "device id {} is above the maximum of {}",
                id, MAX_DEVICE_ID
            )));
        }
        if !seen.insert(id) {
            return Err(Error::Config(format!("device id {} listed twice", id)));
        }
    }
    Ok(())
}
