// In-memory bus for running without hardware
//
// Each device is a flat control table. Sync writes land in memory and every
// sync read nudges torque-enabled devices toward their goal position, which is
// enough to drive the sequencer end to end. Failures can be injected per
// device or per sync read.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use super::DeviceId;
use super::registers::{self, Register, RegisterMap, RegisterSpec};
use super::transport::{BusError, CommError, CommResult, DeviceFault, PacketTransport, StatusFrame};

const CONTROL_TABLE_SIZE: usize = 1024;

/// Default distance a device travels per sync read
pub const DEFAULT_STEP: i32 = 50;

struct SimDevice {
    memory: Vec<u8>,
    fault: u8,
}

pub struct SimulatedBus {
    map: RegisterMap,
    devices: BTreeMap<DeviceId, SimDevice>,
    step: i32,
    unresponsive: HashSet<DeviceId>,
    failing_sync_reads: usize,
    sync_read_count: usize,
    writes: Vec<(DeviceId, u16, Vec<u8>)>,
    sync_writes: Vec<(u16, u16, Vec<u8>)>,
}

impl SimulatedBus {
    pub fn new(map: RegisterMap, ids: &[DeviceId]) -> Self {
        let devices = ids
            .iter()
            .map(|&id| {
                (
                    id,
                    SimDevice {
                        memory: vec![0; CONTROL_TABLE_SIZE],
                        fault: 0,
                    },
                )
            })
            .collect();

        Self {
            map,
            devices,
            step: DEFAULT_STEP,
            unresponsive: HashSet::new(),
            failing_sync_reads: 0,
            sync_read_count: 0,
            writes: Vec::new(),
            sync_writes: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: i32) -> Self {
        self.step = step;
        self
    }

    /// Unresponsive devices time out on direct access and are missing from sync read replies
    pub fn set_unresponsive(&mut self, id: DeviceId, unresponsive: bool) {
        if unresponsive {
            self.unresponsive.insert(id);
        } else {
            self.unresponsive.remove(&id);
        }
    }

    /// Make the next `n` sync reads time out
    pub fn fail_next_sync_reads(&mut self, n: usize) {
        self.failing_sync_reads = n;
    }

    /// Error byte the device attaches to every status reply
    pub fn set_fault(&mut self, id: DeviceId, code: u8) {
        if let Some(dev) = self.devices.get_mut(&id) {
            dev.fault = code;
        }
    }

    pub fn set_present_position(&mut self, id: DeviceId, position: i32) {
        let spec = self.map.spec(Register::PresentPosition);
        self.store(id, spec, position);
    }

    pub fn present_position(&self, id: DeviceId) -> i32 {
        self.load(id, self.map.spec(Register::PresentPosition))
    }

    pub fn goal_position(&self, id: DeviceId) -> i32 {
        self.load(id, self.map.spec(Register::GoalPosition))
    }

    pub fn torque_enabled(&self, id: DeviceId) -> bool {
        self.load(id, self.map.spec(Register::TorqueEnable)) != 0
    }

    pub fn register_value(&self, id: DeviceId, register: Register) -> i32 {
        self.load(id, self.map.spec(register))
    }

    /// Every single-device write attempt, including failed ones
    pub fn writes(&self) -> &[(DeviceId, u16, Vec<u8>)] {
        &self.writes
    }

    /// Every sync write frame as (address, width, payload)
    pub fn sync_writes(&self) -> &[(u16, u16, Vec<u8>)] {
        &self.sync_writes
    }

    pub fn sync_read_count(&self) -> usize {
        self.sync_read_count
    }

    fn load(&self, id: DeviceId, spec: RegisterSpec) -> i32 {
        let Some(dev) = self.devices.get(&id) else {
            return 0;
        };
        let start = spec.address as usize;
        let end = start + spec.width.bytes() as usize;
        registers::decode(&dev.memory[start..end]).unwrap_or(0)
    }

    fn store(&mut self, id: DeviceId, spec: RegisterSpec, value: i32) {
        let Ok(bytes) = registers::encode(value, spec.width) else {
            return;
        };
        if let Some(dev) = self.devices.get_mut(&id) {
            let start = spec.address as usize;
            dev.memory[start..start + bytes.len()].copy_from_slice(&bytes);
        }
    }

    fn reachable(&mut self, id: DeviceId) -> Result<&mut SimDevice, BusError> {
        if self.unresponsive.contains(&id) {
            return Err(CommError::Timeout.into());
        }
        self.devices
            .get_mut(&id)
            .ok_or(BusError::Comm(CommError::Timeout))
    }

    fn step_motion(&mut self) {
        let torque = self.map.spec(Register::TorqueEnable);
        let goal = self.map.spec(Register::GoalPosition);
        let present = self.map.spec(Register::PresentPosition);
        let ids: Vec<DeviceId> = self.devices.keys().copied().collect();

        for id in ids {
            if self.load(id, torque) == 0 {
                continue;
            }
            let target = self.load(id, goal);
            let current = self.load(id, present);
            // Wide enough for any pair of positions and any step
            let step = i64::from(self.step).abs();
            let delta = (i64::from(target) - i64::from(current)).clamp(-step, step);
            // Lands between current and target, so it fits back into i32
            self.store(id, present, (i64::from(current) + delta) as i32);
        }
    }
}

fn in_bounds(address: u16, length: usize) -> bool {
    address as usize + length <= CONTROL_TABLE_SIZE
}

impl PacketTransport for SimulatedBus {
    fn ping(&mut self, id: DeviceId) -> Result<(), BusError> {
        self.reachable(id).map(|_| ())
    }

    fn write(&mut self, id: DeviceId, address: u16, data: &[u8]) -> Result<(), BusError> {
        self.writes.push((id, address, data.to_vec()));
        let dev = self.reachable(id)?;
        if !in_bounds(address, data.len()) {
            return Err(BusError::Device {
                id,
                fault: DeviceFault { code: 7 },
            });
        }
        let start = address as usize;
        dev.memory[start..start + data.len()].copy_from_slice(data);
        debug!("Sim write: id={}, addr={}, data={:02X?}", id, address, data);
        match dev.fault {
            0 => Ok(()),
            code => Err(BusError::Device {
                id,
                fault: DeviceFault { code },
            }),
        }
    }

    fn read(&mut self, id: DeviceId, address: u16, length: u16) -> Result<Vec<u8>, BusError> {
        let dev = self.reachable(id)?;
        if !in_bounds(address, length as usize) {
            return Err(BusError::Device {
                id,
                fault: DeviceFault { code: 7 },
            });
        }
        if dev.fault != 0 {
            return Err(BusError::Device {
                id,
                fault: DeviceFault { code: dev.fault },
            });
        }
        let start = address as usize;
        Ok(dev.memory[start..start + length as usize].to_vec())
    }

    fn sync_write(&mut self, address: u16, width: u16, payload: &[u8]) -> CommResult {
        let block = 1 + width as usize;
        if width == 0 || payload.len() % block != 0 || !in_bounds(address, width as usize) {
            return Err(CommError::CorruptedPacket {
                reason: format!("sync write payload of {} bytes, width {}", payload.len(), width),
            });
        }
        self.sync_writes.push((address, width, payload.to_vec()));

        for chunk in payload.chunks(block) {
            let id = chunk[0];
            if self.unresponsive.contains(&id) {
                continue;
            }
            if let Some(dev) = self.devices.get_mut(&id) {
                let start = address as usize;
                dev.memory[start..start + width as usize].copy_from_slice(&chunk[1..]);
            }
        }
        Ok(())
    }

    fn sync_read(&mut self, address: u16, width: u16, ids: &[DeviceId]) -> CommResult<Vec<StatusFrame>> {
        self.sync_read_count += 1;
        if self.failing_sync_reads > 0 {
            self.failing_sync_reads -= 1;
            return Err(CommError::Timeout);
        }
        if !in_bounds(address, width as usize) {
            return Err(CommError::CorruptedPacket {
                reason: format!("sync read past end of control table at {}", address),
            });
        }

        self.step_motion();

        let start = address as usize;
        let end = start + width as usize;
        let frames = ids
            .iter()
            .copied()
            .filter(|id| !self.unresponsive.contains(id))
            .filter_map(|id| {
                self.devices.get(&id).map(|dev| StatusFrame {
                    id,
                    error: dev.fault,
                    data: dev.memory[start..end].to_vec(),
                })
            })
            .collect();
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_steps_toward_goal() {
        let map = RegisterMap::X_SERIES;
        let mut bus = SimulatedBus::new(map, &[1]).with_step(100);
        let torque = map.spec(Register::TorqueEnable);
        let goal = map.spec(Register::GoalPosition);

        bus.write(1, torque.address, &[1]).unwrap();
        bus.write(1, goal.address, &registers::encode(250, goal.width).unwrap())
            .unwrap();

        let present = map.spec(Register::PresentPosition);
        for expected in [100, 200, 250, 250] {
            bus.sync_read(present.address, 4, &[1]).unwrap();
            assert_eq!(bus.present_position(1), expected);
        }
    }

    #[test]
    fn test_no_motion_without_torque() {
        let map = RegisterMap::X_SERIES;
        let mut bus = SimulatedBus::new(map, &[1]);
        let goal = map.spec(Register::GoalPosition);
        bus.write(1, goal.address, &registers::encode(500, goal.width).unwrap())
            .unwrap();
        bus.sync_read(map.spec(Register::PresentPosition).address, 4, &[1])
            .unwrap();
        assert_eq!(bus.present_position(1), 0);
    }

    #[test]
    fn test_unknown_device_times_out() {
        let mut bus = SimulatedBus::new(RegisterMap::X_SERIES, &[1]);
        assert!(matches!(
            bus.ping(9),
            Err(BusError::Comm(CommError::Timeout))
        ));
    }

    #[test]
    fn test_motion_across_full_range() {
        let map = RegisterMap::X_SERIES;
        let mut bus = SimulatedBus::new(map, &[1]).with_step(i32::MAX);
        let torque = map.spec(Register::TorqueEnable);
        let goal = map.spec(Register::GoalPosition);
        let present = map.spec(Register::PresentPosition);

        bus.write(1, torque.address, &[1]).unwrap();
        bus.set_present_position(1, 2_000_000_000);
        bus.write(1, goal.address, &registers::encode(-2_000_000_000, goal.width).unwrap())
            .unwrap();

        // One step of i32::MAX, then the rest of the way
        bus.sync_read(present.address, 4, &[1]).unwrap();
        assert_eq!(bus.present_position(1), 2_000_000_000 - i32::MAX);
        bus.sync_read(present.address, 4, &[1]).unwrap();
        assert_eq!(bus.present_position(1), -2_000_000_000);
    }

    #[test]
    fn test_read_returns_written_bytes() {
        let map = RegisterMap::X_SERIES;
        let mut bus = SimulatedBus::new(map, &[1, 2]);
        let velocity = map.spec(Register::ProfileVelocity);
        let bytes = registers::encode(600, velocity.width).unwrap();
        bus.write(1, velocity.address, &bytes).unwrap();

        assert_eq!(bus.read(1, velocity.address, 4).unwrap(), bytes);
        assert!(matches!(
            bus.read(1, 1022, 4),
            Err(BusError::Device { id: 1, fault: DeviceFault { code: 7 } })
        ));

        bus.set_fault(2, 0x02);
        assert!(matches!(
            bus.read(2, velocity.address, 4),
            Err(BusError::Device { id: 2, fault: DeviceFault { code: 0x02 } })
        ));
        bus.set_unresponsive(2, true);
        assert!(matches!(
            bus.read(2, velocity.address, 4),
            Err(BusError::Comm(CommError::Timeout))
        ));
    }
}
