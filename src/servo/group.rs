// Sync write / sync read group transactions
//
// A group covers exactly one register range for its whole life. Writes stage
// one entry per device and go out as a single broadcast frame; reads poll a
// fixed roster with one broadcast request and split the reply per device.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::DeviceId;
use super::registers::{self, RegisterSpec};
use super::transport::{CommResult, DeviceFault, PacketTransport};

/// Misuse of the group transaction API
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("Device {id} already has a staged entry")]
    DuplicateEntry { id: DeviceId },

    #[error("No data available for device {id}")]
    DataNotAvailable { id: DeviceId },

    #[error("Cannot register device {id}: {reason}")]
    RegistrationFailed { id: DeviceId, reason: &'static str },

    #[error("Value {value} does not fit in {width} byte(s)")]
    ValueOutOfRange { value: i32, width: u16 },

    #[error("Device {id} is not in the roster")]
    UnknownDevice { id: DeviceId },
}

/// Staged sync write for one register range.
///
/// A second `add_entry` for the same device is rejected rather than
/// overwriting the first, so the caller has to `clear` between cycles.
#[derive(Debug)]
pub struct GroupSyncWrite {
    spec: RegisterSpec,
    entries: Vec<(DeviceId, Vec<u8>)>,
}

impl GroupSyncWrite {
    pub fn new(spec: RegisterSpec) -> Self {
        Self {
            spec,
            entries: Vec::new(),
        }
    }

    pub fn spec(&self) -> RegisterSpec {
        self.spec
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.entries.iter().any(|(staged, _)| *staged == id)
    }

    /// Encode `value` and stage it for `id`
    pub fn add_entry(&mut self, id: DeviceId, value: i32) -> Result<(), UsageError> {
        if self.contains(id) {
            return Err(UsageError::DuplicateEntry { id });
        }
        let bytes = registers::encode(value, self.spec.width)?;
        self.entries.push((id, bytes));
        Ok(())
    }

    /// Send every staged entry in one broadcast frame.
    ///
    /// Does nothing when nothing is staged. Entries are kept; call `clear`.
    pub fn transmit<T: PacketTransport + ?Sized>(&self, transport: &mut T) -> CommResult {
        if self.entries.is_empty() {
            return Ok(());
        }

        let width = self.spec.width.bytes();
        let mut payload = Vec::with_capacity(self.entries.len() * (1 + width as usize));
        for (id, bytes) in &self.entries {
            payload.push(*id);
            payload.extend_from_slice(bytes);
        }

        debug!(
            "Sync write to {} devices: addr={}, width={}",
            self.entries.len(),
            self.spec.address,
            width
        );
        transport.sync_write(self.spec.address, width, &payload)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Sync read over a fixed roster for one register range
#[derive(Debug)]
pub struct GroupSyncRead {
    spec: RegisterSpec,
    roster: Vec<DeviceId>,
    data: HashMap<DeviceId, Vec<u8>>,
    faults: HashMap<DeviceId, DeviceFault>,
    // Set once a round trip has delivered data; the roster is frozen after that
    exchanged: bool,
    last_ok: bool,
}

impl GroupSyncRead {
    pub fn new(spec: RegisterSpec) -> Self {
        Self {
            spec,
            roster: Vec::new(),
            data: HashMap::new(),
            faults: HashMap::new(),
            exchanged: false,
            last_ok: false,
        }
    }

    pub fn spec(&self) -> RegisterSpec {
        self.spec
    }

    pub fn roster(&self) -> &[DeviceId] {
        &self.roster
    }

    /// Add `id` to the poll roster.
    ///
    /// Registering an id twice is a no-op. Registering after the first
    /// successful round trip fails.
    pub fn register_device(&mut self, id: DeviceId) -> Result<(), UsageError> {
        if self.exchanged {
            return Err(UsageError::RegistrationFailed {
                id,
                reason: "roster is frozen after the first round trip",
            });
        }
        if id == super::BROADCAST_ID {
            return Err(UsageError::RegistrationFailed {
                id,
                reason: "broadcast id cannot be polled",
            });
        }
        if !self.roster.contains(&id) {
            self.roster.push(id);
        }
        Ok(())
    }

    /// One broadcast request plus the aggregated reply.
    ///
    /// On failure the previously received data is kept but nothing reports as
    /// available until the next successful exchange.
    pub fn exchange<T: PacketTransport + ?Sized>(&mut self, transport: &mut T) -> CommResult {
        if self.roster.is_empty() {
            return Ok(());
        }

        let width = self.spec.width.bytes();
        let frames = match transport.sync_read(self.spec.address, width, &self.roster) {
            Ok(frames) => frames,
            Err(e) => {
                self.last_ok = false;
                return Err(e);
            }
        };

        self.data.clear();
        self.faults.clear();
        for frame in frames {
            if !self.roster.contains(&frame.id) {
                warn!("Sync read: unexpected reply from device {}", frame.id);
                continue;
            }
            if frame.data.len() != width as usize {
                warn!(
                    "Sync read: device {} returned {} bytes, expected {}",
                    frame.id,
                    frame.data.len(),
                    width
                );
                continue;
            }
            if self.data.contains_key(&frame.id) {
                warn!("Sync read: duplicate reply from device {}", frame.id);
                continue;
            }
            if frame.error != 0 {
                let fault = DeviceFault { code: frame.error };
                warn!("Device {} reported error status {}", frame.id, fault);
                self.faults.insert(frame.id, fault);
            }
            self.data.insert(frame.id, frame.data);
        }

        self.exchanged = true;
        self.last_ok = true;
        debug!(
            "Sync read: {}/{} devices answered",
            self.data.len(),
            self.roster.len()
        );
        Ok(())
    }

    pub fn is_available(&self, id: DeviceId) -> bool {
        self.last_ok && self.data.contains_key(&id)
    }

    /// Decoded value for `id` from the last successful exchange
    pub fn value(&self, id: DeviceId) -> Result<i32, UsageError> {
        if !self.is_available(id) {
            return Err(UsageError::DataNotAvailable { id });
        }
        self.data
            .get(&id)
            .and_then(|bytes| registers::decode(bytes))
            .ok_or(UsageError::DataNotAvailable { id })
    }

    /// Error status the device attached to its last reply, if any
    pub fn fault(&self, id: DeviceId) -> Option<DeviceFault> {
        self.faults.get(&id).copied()
    }

    /// Drop the roster and all received data
    pub fn clear(&mut self) {
        self.roster.clear();
        self.data.clear();
        self.faults.clear();
        self.exchanged = false;
        self.last_ok = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servo::registers::{Register, RegisterMap, Width};
    use crate::servo::sim::SimulatedBus;

    fn goal_spec() -> RegisterSpec {
        RegisterMap::X_SERIES.spec(Register::GoalPosition)
    }

    fn present_spec() -> RegisterSpec {
        RegisterMap::X_SERIES.spec(Register::PresentPosition)
    }

    #[test]
    fn test_duplicate_entry_rejected() {
        let mut group = GroupSyncWrite::new(goal_spec());
        group.add_entry(1, 2000).unwrap();
        assert_eq!(group.add_entry(1, 2100), Err(UsageError::DuplicateEntry { id: 1 }));
        assert_eq!(group.len(), 1);

        group.clear();
        assert!(group.is_empty());
        group.add_entry(1, 2100).unwrap();
    }

    #[test]
    fn test_transmit_carries_only_staged_devices() {
        let mut bus = SimulatedBus::new(RegisterMap::X_SERIES, &[0, 1, 2, 3]);
        let mut group = GroupSyncWrite::new(goal_spec());
        group.add_entry(1, 1800).unwrap();
        group.add_entry(3, 2200).unwrap();
        group.transmit(&mut bus).unwrap();

        let frames = bus.sync_writes();
        assert_eq!(frames.len(), 1);
        let (address, width, payload) = &frames[0];
        assert_eq!(*address, 116);
        assert_eq!(*width, 4);
        assert_eq!(
            payload,
            &vec![1, 0x08, 0x07, 0x00, 0x00, 3, 0x98, 0x08, 0x00, 0x00]
        );

        assert_eq!(bus.goal_position(1), 1800);
        assert_eq!(bus.goal_position(3), 2200);
        assert_eq!(bus.goal_position(0), 0);
        assert_eq!(bus.goal_position(2), 0);
    }

    #[test]
    fn test_transmit_empty_is_noop() {
        let mut bus = SimulatedBus::new(RegisterMap::X_SERIES, &[1]);
        let group = GroupSyncWrite::new(goal_spec());
        group.transmit(&mut bus).unwrap();
        assert!(bus.sync_writes().is_empty());
    }

    #[test]
    fn test_value_out_of_range_not_staged() {
        let spec = RegisterSpec::new(64, Width::One);
        let mut group = GroupSyncWrite::new(spec);
        assert!(group.add_entry(1, 300).is_err());
        assert!(group.is_empty());
    }

    #[test]
    fn test_not_available_before_exchange() {
        let mut read = GroupSyncRead::new(present_spec());
        read.register_device(1).unwrap();
        assert!(!read.is_available(1));
        assert!(!read.is_available(2));
        assert_eq!(read.value(1), Err(UsageError::DataNotAvailable { id: 1 }));
    }

    #[test]
    fn test_exchange_decodes_each_device() {
        let mut bus = SimulatedBus::new(RegisterMap::X_SERIES, &[1, 2, 5]);
        bus.set_present_position(1, 1998);
        bus.set_present_position(2, -40);

        let mut read = GroupSyncRead::new(present_spec());
        read.register_device(1).unwrap();
        read.register_device(2).unwrap();
        read.exchange(&mut bus).unwrap();

        assert_eq!(read.value(1), Ok(1998));
        assert_eq!(read.value(2), Ok(-40));
        // Present on the bus but never registered
        assert!(!read.is_available(5));
    }

    #[test]
    fn test_missing_reply_is_not_available() {
        let mut bus = SimulatedBus::new(RegisterMap::X_SERIES, &[1, 2]);
        bus.set_unresponsive(2, true);

        let mut read = GroupSyncRead::new(present_spec());
        read.register_device(1).unwrap();
        read.register_device(2).unwrap();
        read.exchange(&mut bus).unwrap();

        assert!(read.is_available(1));
        assert!(!read.is_available(2));
    }

    #[test]
    fn test_failed_exchange_clears_availability() {
        let mut bus = SimulatedBus::new(RegisterMap::X_SERIES, &[1]);
        let mut read = GroupSyncRead::new(present_spec());
        read.register_device(1).unwrap();
        read.exchange(&mut bus).unwrap();
        assert!(read.is_available(1));

        bus.fail_next_sync_reads(1);
        assert!(read.exchange(&mut bus).is_err());
        assert!(!read.is_available(1));
    }

    #[test]
    fn test_registration_frozen_after_exchange() {
        let mut bus = SimulatedBus::new(RegisterMap::X_SERIES, &[1, 2]);
        let mut read = GroupSyncRead::new(present_spec());
        read.register_device(1).unwrap();
        read.register_device(1).unwrap();
        assert_eq!(read.roster(), &[1]);

        read.exchange(&mut bus).unwrap();
        assert!(matches!(
            read.register_device(2),
            Err(UsageError::RegistrationFailed { id: 2, .. })
        ));

        read.clear();
        assert!(read.roster().is_empty());
        read.register_device(2).unwrap();
    }

    #[test]
    fn test_device_fault_keeps_data() {
        let mut bus = SimulatedBus::new(RegisterMap::X_SERIES, &[1]);
        bus.set_present_position(1, 512);
        bus.set_fault(1, 0x80);

        let mut read = GroupSyncRead::new(present_spec());
        read.register_device(1).unwrap();
        read.exchange(&mut bus).unwrap();

        assert_eq!(read.value(1), Ok(512));
        assert_eq!(read.fault(1), Some(DeviceFault { code: 0x80 }));
    }
}
