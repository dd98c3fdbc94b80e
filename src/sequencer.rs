// Goal sequencing with arrival detection
//
// Idle -> Commanding -> Polling -> Arrived -> Idle (next goal set) ... -> Done
//
// A goal set counts as reached only when every device is within the threshold
// in the same polling pass. Goal sets cycle forever; only a quit signal ends
// the run.

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::messages::{GoalSet, PollReport, PositionSample, Signal};
use crate::servo::{DeviceController, PacketTransport, PresentPositionSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    Commanding,
    Polling,
    Arrived,
    Done,
}

/// Upper bound on one polling phase. Both `None` means poll until arrival.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollLimit {
    pub max_passes: Option<u64>,
    pub deadline: Option<Duration>,
}

impl PollLimit {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn passes(max_passes: u64) -> Self {
        Self {
            max_passes: Some(max_passes),
            deadline: None,
        }
    }

    fn expired(&self, passes: u64, elapsed: Duration) -> bool {
        self.max_passes.is_some_and(|max| passes >= max)
            || self.deadline.is_some_and(|deadline| elapsed >= deadline)
    }
}

/// Where operator signals come from
pub trait SignalSource {
    /// Block until the next signal
    fn wait(&mut self) -> Signal;

    /// Non-blocking check between polling passes
    fn quit_requested(&mut self) -> bool;
}

impl SignalSource for UnboundedReceiver<Signal> {
    fn wait(&mut self) -> Signal {
        // Sender gone means nobody can ask us to continue
        self.blocking_recv().unwrap_or(Signal::Quit)
    }

    fn quit_requested(&mut self) -> bool {
        // Advance presses while moving are dropped
        loop {
            match self.try_recv() {
                Ok(Signal::Quit) | Err(TryRecvError::Disconnected) => return true,
                Ok(Signal::Advance) => continue,
                Err(TryRecvError::Empty) => return false,
            }
        }
    }
}

impl SignalSource for VecDeque<Signal> {
    fn wait(&mut self) -> Signal {
        self.pop_front().unwrap_or(Signal::Quit)
    }

    fn quit_requested(&mut self) -> bool {
        false
    }
}

/// True when every target has a fresh position strictly within `threshold` of its goal
pub fn converged(goals: &GoalSet, snapshot: &PresentPositionSnapshot, threshold: u32) -> bool {
    goals.targets.iter().all(|target| {
        snapshot.fresh(target.id).is_some_and(|present| {
            (i64::from(target.position) - i64::from(present)).unsigned_abs() < u64::from(threshold)
        })
    })
}

pub struct MotionSequencer {
    goal_sets: Vec<GoalSet>,
    index: usize,
    threshold: u32,
    limit: PollLimit,
    poll_interval: Duration,
    state: SequencerState,
    pass: u64,
}

impl MotionSequencer {
    pub fn new(goal_sets: Vec<GoalSet>, threshold: u32) -> Result<Self> {
        if goal_sets.is_empty() {
            return Err(Error::Config("at least one goal set is required".to_string()));
        }
        if goal_sets.iter().any(|set| set.targets.is_empty()) {
            return Err(Error::Config("goal sets must not be empty".to_string()));
        }
        if threshold == 0 {
            return Err(Error::Config("convergence threshold must be positive".to_string()));
        }

        Ok(Self {
            goal_sets,
            index: 0,
            threshold,
            limit: PollLimit::unbounded(),
            poll_interval: Duration::ZERO,
            state: SequencerState::Idle,
            pass: 0,
        })
    }

    pub fn with_limit(mut self, limit: PollLimit) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn goal_index(&self) -> usize {
        self.index
    }

    pub fn current_goal(&self) -> &GoalSet {
        &self.goal_sets[self.index]
    }

    /// Send the current goal set and enter Polling.
    ///
    /// A bus failure on the write is logged; polling still starts and will
    /// time out if the devices never got the goals.
    pub fn command<T: PacketTransport>(&mut self, ctrl: &mut DeviceController<T>) -> Result<()> {
        self.state = SequencerState::Commanding;
        self.pass = 0;
        info!("Commanding goal set {}: {:?}", self.index, self.current_goal().targets);

        match ctrl.command_positions(&self.goal_sets[self.index]) {
            Ok(()) => {}
            Err(Error::Comm(e)) => warn!("Goal position sync write failed: {}", e),
            Err(e) => return Err(e),
        }

        self.state = SequencerState::Polling;
        Ok(())
    }

    /// One sync read plus convergence check
    pub fn poll_pass<T: PacketTransport>(&mut self, ctrl: &mut DeviceController<T>) -> PollReport {
        self.pass += 1;
        if let Err(e) = ctrl.refresh_positions() {
            warn!("Present position sync read failed on pass {}: {}", self.pass, e);
        }

        let goal = &self.goal_sets[self.index];
        let snapshot = ctrl.snapshot();
        let samples = goal
            .targets
            .iter()
            .map(|target| PositionSample {
                id: target.id,
                goal: target.position,
                present: snapshot.fresh(target.id),
            })
            .collect();
        let arrived = converged(goal, snapshot, self.threshold);
        if arrived {
            self.state = SequencerState::Arrived;
        }

        PollReport {
            pass: self.pass,
            goal_index: self.index,
            samples,
            arrived,
        }
    }

    /// Poll until arrival, quit or the poll limit.
    ///
    /// Returns `Ok(true)` on arrival and `Ok(false)` when asked to quit.
    pub fn wait_for_arrival<T, S, F>(
        &mut self,
        ctrl: &mut DeviceController<T>,
        signals: &mut S,
        mut on_report: F,
    ) -> Result<bool>
    where
        T: PacketTransport,
        S: SignalSource + ?Sized,
        F: FnMut(&PollReport),
    {
        let started = Instant::now();
        loop {
            let report = self.poll_pass(ctrl);
            on_report(&report);
            if report.arrived {
                info!("Goal set {} reached after {} passes", self.index, self.pass);
                return Ok(true);
            }
            if signals.quit_requested() {
                self.state = SequencerState::Done;
                return Ok(false);
            }
            if self.limit.expired(self.pass, started.elapsed()) {
                return Err(Error::ConvergenceTimeout {
                    goal_index: self.index,
                    passes: self.pass,
                });
            }
            if !self.poll_interval.is_zero() {
                thread::sleep(self.poll_interval);
            }
        }
    }

    /// Move to the next goal set, wrapping around
    pub fn advance(&mut self) {
        self.index = (self.index + 1) % self.goal_sets.len();
        self.state = SequencerState::Idle;
    }

    /// Drive goal sets until a quit signal
    pub fn run<T, S, F>(
        &mut self,
        ctrl: &mut DeviceController<T>,
        signals: &mut S,
        mut on_report: F,
    ) -> Result<()>
    where
        T: PacketTransport,
        S: SignalSource + ?Sized,
        F: FnMut(&PollReport),
    {
        loop {
            self.state = SequencerState::Idle;
            info!("Press any key to continue! (or press ESC to quit!)");
            if signals.wait() == Signal::Quit {
                self.state = SequencerState::Done;
                return Ok(());
            }

            self.command(ctrl)?;
            if !self.wait_for_arrival(ctrl, signals, &mut on_report)? {
                return Ok(());
            }
            self.advance();
        }
    }
}
