// Data exchanged between the operator surface, the sequencer and telemetry

use serde::{Deserialize, Serialize};

use crate::servo::DeviceId;

/// Operator input to the sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Command the current goal set and wait for arrival
    Advance,
    /// Stop at the next opportunity
    Quit,
}

/// Target position for one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalTarget {
    pub id: DeviceId,
    pub position: i32,
}

/// Ordered per-device targets commanded together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalSet {
    pub targets: Vec<GoalTarget>,
}

impl GoalSet {
    pub fn new(targets: Vec<GoalTarget>) -> Self {
        Self { targets }
    }

    /// Pair `positions` with `roster` by index
    pub fn from_positions(roster: &[DeviceId], positions: &[i32]) -> Option<Self> {
        if roster.len() != positions.len() {
            return None;
        }
        let targets = roster
            .iter()
            .zip(positions)
            .map(|(&id, &position)| GoalTarget { id, position })
            .collect();
        Some(Self { targets })
    }

    pub fn goal(&self, id: DeviceId) -> Option<i32> {
        self.targets.iter().find(|t| t.id == id).map(|t| t.position)
    }
}

/// One device's line in a polling report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSample {
    pub id: DeviceId,
    pub goal: i32,
    /// `None` when no fresh value arrived this pass
    pub present: Option<i32>,
}

/// Published once per polling pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollReport {
    pub pass: u64,
    pub goal_index: usize,
    pub samples: Vec<PositionSample>,
    pub arrived: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_goal_set_from_positions() {
        let set = GoalSet::from_positions(&[0, 1], &[1800, 2200]).unwrap();
        assert_eq!(set.goal(0), Some(1800));
        assert_eq!(set.goal(1), Some(2200));
        assert_eq!(set.goal(2), None);

        assert!(GoalSet::from_positions(&[0, 1], &[1800]).is_none());
    }

    #[test]
    fn test_report_json_shape() {
        let report = PollReport {
            pass: 3,
            goal_index: 1,
            samples: vec![PositionSample {
                id: 2,
                goal: 2000,
                present: None,
            }],
            arrived: false,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["samples"][0]["present"], serde_json::Value::Null);
        assert_eq!(json["goal_index"], 1);
    }
}
