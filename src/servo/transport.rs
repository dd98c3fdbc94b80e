// Packet transport boundary
//
// Everything above this trait talks in (id, address, bytes). Framing, checksums
// and the serial port itself live behind it.

use std::fmt;

use super::DeviceId;

/// Bus-level failure of one exchange
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("Timeout waiting for status packet")]
    Timeout,

    #[error("Corrupted packet: {reason}")]
    CorruptedPacket { reason: String },

    #[error("Port error: {0}")]
    Port(#[from] std::io::Error),
}

impl From<serialport::Error> for CommError {
    fn from(e: serialport::Error) -> Self {
        CommError::Port(e.into())
    }
}

/// Outcome of a bus exchange. `Ok` is success.
pub type CommResult<T = ()> = std::result::Result<T, CommError>;

/// Non-zero error byte reported by a device in its status packet.
///
/// The exchange itself succeeded; the device is telling us it did not like
/// something. Bit 7 is the hardware alert flag, the low 7 bits are the
/// instruction error number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFault {
    pub code: u8,
}

impl DeviceFault {
    pub const ALERT_BIT: u8 = 0x80;

    pub fn hardware_alert(&self) -> bool {
        self.code & Self::ALERT_BIT != 0
    }

    fn description(&self) -> &'static str {
        match self.code & !Self::ALERT_BIT {
            0 => "no instruction error",
            1 => "result fail",
            2 => "instruction error",
            3 => "CRC error",
            4 => "data range error",
            5 => "data length error",
            6 => "data limit error",
            7 => "access error",
            _ => "unknown error",
        }
    }
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self.code, self.description())?;
        if self.hardware_alert() {
            write!(f, " + hardware alert")?;
        }
        Ok(())
    }
}

/// Failure of a single-device exchange
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error(transparent)]
    Comm(#[from] CommError),

    #[error("Device {id} reported error status {fault}")]
    Device { id: DeviceId, fault: DeviceFault },
}

/// One device's slice of an aggregated sync read reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFrame {
    pub id: DeviceId,
    pub error: u8,
    pub data: Vec<u8>,
}

/// Addressed read/write access to devices on one half-duplex bus.
///
/// A call either completes or returns an error; partial writes are never
/// observable by the caller.
pub trait PacketTransport {
    /// Check that a device answers at all
    fn ping(&mut self, id: DeviceId) -> Result<(), BusError>;

    /// Write `data` starting at `address` and wait for the status reply
    fn write(&mut self, id: DeviceId, address: u16, data: &[u8]) -> Result<(), BusError>;

    /// Read `length` bytes starting at `address`
    fn read(&mut self, id: DeviceId, address: u16, length: u16) -> Result<Vec<u8>, BusError>;

    /// Broadcast one sync write frame.
    ///
    /// `payload` is the concatenation of `[id, data[0..width]]` blocks. Devices
    /// do not reply.
    fn sync_write(&mut self, address: u16, width: u16, payload: &[u8]) -> CommResult;

    /// Broadcast one sync read request for `ids` and collect the replies
    fn sync_read(&mut self, address: u16, width: u16, ids: &[DeviceId]) -> CommResult<Vec<StatusFrame>>;
}

impl<T: PacketTransport + ?Sized> PacketTransport for Box<T> {
    fn ping(&mut self, id: DeviceId) -> Result<(), BusError> {
        (**self).ping(id)
    }

    fn write(&mut self, id: DeviceId, address: u16, data: &[u8]) -> Result<(), BusError> {
        (**self).write(id, address, data)
    }

    fn read(&mut self, id: DeviceId, address: u16, length: u16) -> Result<Vec<u8>, BusError> {
        (**self).read(id, address, length)
    }

    fn sync_write(&mut self, address: u16, width: u16, payload: &[u8]) -> CommResult {
        (**self).sync_write(address, width, payload)
    }

    fn sync_read(&mut self, address: u16, width: u16, ids: &[DeviceId]) -> CommResult<Vec<StatusFrame>> {
        (**self).sync_read(address, width, ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display() {
        let fault = DeviceFault { code: 0x84 };
        assert!(fault.hardware_alert());
        assert_eq!(fault.to_string(), "0x84 (data range error) + hardware alert");

        let fault = DeviceFault { code: 0x07 };
        assert!(!fault.hardware_alert());
        assert_eq!(fault.to_string(), "0x07 (access error)");
    }
}
