// Control table layout per device model, plus the little-endian value codec
// shared by the write and read paths.

use serde::{Deserialize, Serialize};

use super::group::UsageError;

/// Byte width of a control table item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    One = 1,
    Two = 2,
    Four = 4,
}

impl Width {
    pub fn bytes(self) -> u16 {
        self as u16
    }
}

/// Address and width of one control table item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSpec {
    pub address: u16,
    pub width: Width,
}

impl RegisterSpec {
    pub const fn new(address: u16, width: Width) -> Self {
        Self { address, width }
    }
}

/// Logical registers the controller uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    TorqueEnable,
    ProfileAcceleration,
    ProfileVelocity,
    GoalPosition,
    PresentPosition,
}

/// Device families with a known control table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceModel {
    /// X series and PRO(+) firmware with the unified table
    #[default]
    XSeries,
    /// Legacy PRO H/M/L table
    Pro,
}

/// Static register addresses for one device model.
///
/// These have to match the firmware's memory layout exactly; nothing on the
/// bus will tell us if they don't.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    model: DeviceModel,
    torque_enable: RegisterSpec,
    profile_acceleration: RegisterSpec,
    profile_velocity: RegisterSpec,
    goal_position: RegisterSpec,
    present_position: RegisterSpec,
}

impl RegisterMap {
    pub const X_SERIES: RegisterMap = RegisterMap {
        model: DeviceModel::XSeries,
        torque_enable: RegisterSpec::new(64, Width::One),
        profile_acceleration: RegisterSpec::new(108, Width::Four),
        profile_velocity: RegisterSpec::new(112, Width::Four),
        goal_position: RegisterSpec::new(116, Width::Four),
        present_position: RegisterSpec::new(132, Width::Four),
    };

    // Legacy PRO has no profile registers; goal acceleration/velocity play that role
    pub const PRO: RegisterMap = RegisterMap {
        model: DeviceModel::Pro,
        torque_enable: RegisterSpec::new(562, Width::One),
        profile_acceleration: RegisterSpec::new(606, Width::Four),
        profile_velocity: RegisterSpec::new(600, Width::Four),
        goal_position: RegisterSpec::new(596, Width::Four),
        present_position: RegisterSpec::new(611, Width::Four),
    };

    pub fn for_model(model: DeviceModel) -> RegisterMap {
        match model {
            DeviceModel::XSeries => Self::X_SERIES,
            DeviceModel::Pro => Self::PRO,
        }
    }

    pub fn model(&self) -> DeviceModel {
        self.model
    }

    pub fn spec(&self, register: Register) -> RegisterSpec {
        match register {
            Register::TorqueEnable => self.torque_enable,
            Register::ProfileAcceleration => self.profile_acceleration,
            Register::ProfileVelocity => self.profile_velocity,
            Register::GoalPosition => self.goal_position,
            Register::PresentPosition => self.present_position,
        }
    }
}

pub fn lo_word(value: u32) -> u16 {
    (value & 0xFFFF) as u16
}

pub fn hi_word(value: u32) -> u16 {
    (value >> 16) as u16
}

pub fn lo_byte(word: u16) -> u8 {
    (word & 0xFF) as u8
}

pub fn hi_byte(word: u16) -> u8 {
    (word >> 8) as u8
}

pub fn make_word(lo: u8, hi: u8) -> u16 {
    u16::from(lo) | (u16::from(hi) << 8)
}

pub fn make_dword(lo: u16, hi: u16) -> u32 {
    u32::from(lo) | (u32::from(hi) << 16)
}

/// Encode `value` into `width` little-endian bytes.
///
/// One and two byte items are unsigned; four byte items carry a signed
/// 32-bit value in two's complement.
pub fn encode(value: i32, width: Width) -> Result<Vec<u8>, UsageError> {
    let out_of_range = || UsageError::ValueOutOfRange { value, width: width.bytes() };
    match width {
        Width::One => {
            let v = u8::try_from(value).map_err(|_| out_of_range())?;
            Ok(vec![v])
        }
        Width::Two => {
            let v = u16::try_from(value).map_err(|_| out_of_range())?;
            Ok(vec![lo_byte(v), hi_byte(v)])
        }
        Width::Four => {
            let v = value as u32;
            let (lo, hi) = (lo_word(v), hi_word(v));
            Ok(vec![lo_byte(lo), hi_byte(lo), lo_byte(hi), hi_byte(hi)])
        }
    }
}

/// Decode a little-endian slice produced by [`encode`].
///
/// Returns `None` when the slice is not 1, 2 or 4 bytes long.
pub fn decode(bytes: &[u8]) -> Option<i32> {
    match *bytes {
        [b0] => Some(i32::from(b0)),
        [b0, b1] => Some(i32::from(make_word(b0, b1))),
        [b0, b1, b2, b3] => Some(make_dword(make_word(b0, b1), make_word(b2, b3)) as i32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_per_width() {
        for v in [0, 1, 127, 255] {
            assert_eq!(decode(&encode(v, Width::One).unwrap()), Some(v));
        }
        for v in [0, 300, 0x7FFF, 0xFFFF] {
            assert_eq!(decode(&encode(v, Width::Two).unwrap()), Some(v));
        }
        for v in [0, 2000, -1, -4096, i32::MAX, i32::MIN] {
            assert_eq!(decode(&encode(v, Width::Four).unwrap()), Some(v));
        }
    }

    #[test]
    fn test_little_endian_layout() {
        // 0x12345678 -> lo word 0x5678, hi word 0x1234
        assert_eq!(encode(0x1234_5678, Width::Four).unwrap(), vec![0x78, 0x56, 0x34, 0x12]);
        assert_eq!(encode(2000, Width::Two).unwrap(), vec![0xD0, 0x07]);
        assert_eq!(encode(-2, Width::Four).unwrap(), vec![0xFE, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(matches!(
            encode(256, Width::One),
            Err(UsageError::ValueOutOfRange { value: 256, width: 1 })
        ));
        assert!(encode(-1, Width::Two).is_err());
        assert!(encode(70_000, Width::Two).is_err());
    }

    #[test]
    fn test_decode_rejects_odd_lengths() {
        assert_eq!(decode(&[]), None);
        assert_eq!(decode(&[1, 2, 3]), None);
    }

    #[test]
    fn test_x_series_matches_control_table() {
        let map = RegisterMap::for_model(DeviceModel::XSeries);
        assert_eq!(map.spec(Register::TorqueEnable), RegisterSpec::new(64, Width::One));
        assert_eq!(map.spec(Register::GoalPosition), RegisterSpec::new(116, Width::Four));
        assert_eq!(map.spec(Register::PresentPosition), RegisterSpec::new(132, Width::Four));
    }
}
