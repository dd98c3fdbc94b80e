// Servo bus access for position-controlled actuators
//
// Provides:
// - Control table layouts and the little-endian value codec
// - Sync write / sync read group transactions
// - Dynamixel Protocol 2.0 serial transport and an in-memory simulated bus
// - Device controller for torque, profile and position commands

pub mod controller;
pub mod group;
pub mod protocol2;
pub mod registers;
pub mod sim;
pub mod transport;

/// Bus address of one actuator
pub type DeviceId = u8;

/// Reserved id that every device listens to
pub const BROADCAST_ID: DeviceId = 0xFE;

/// Highest id a device may be configured with
pub const MAX_DEVICE_ID: DeviceId = 252;

pub use controller::{DeviceController, PresentPositionSnapshot, SetupReport};
pub use group::{GroupSyncRead, GroupSyncWrite, UsageError};
pub use protocol2::Protocol2Bus;
pub use registers::{DeviceModel, Register, RegisterMap, RegisterSpec, Width};
pub use sim::SimulatedBus;
pub use transport::{BusError, CommError, CommResult, DeviceFault, PacketTransport, StatusFrame};
