//! Reactive behaviors.
//!
//! A [`Behavior`] is a small state machine stepped once per relevant sensor
//! reading.  It never performs I/O: every transition returns the actuator
//! commands it wants issued, and the caller sends them.
//!
//! | Behavior | States | Reacts to |
//! |---|---|---|
//! | [`Forward`] | `idle`, `driving` | enable / disable only |
//! | [`StopAtEdge`] | `table`, `edge` | line sensor readings |
//! | [`Rotate180`] | `turning`, `done` | encoder readings |
//!
//! The only cancellation signal is the enable flag: a disabled behavior
//! ignores every reading.

use hba_hal::actuator::{self, Drive, DriveMode};
use hba_hal::SensorReading;
use hba_types::{Channel, Command};
use tracing::{debug, info};

use crate::sensors::SensorCache;

/// Outcome of one [`Behavior::step`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Step {
    pub commands: Vec<Command>,
    /// The behavior just reached its terminal condition.
    pub finished: bool,
}

impl Step {
    fn idle() -> Self {
        Self::default()
    }

    fn finished(commands: Vec<Command>) -> Self {
        Self {
            commands,
            finished: true,
        }
    }
}

pub trait Behavior {
    fn name(&self) -> &'static str;

    /// Descriptive name of the current state.
    fn state(&self) -> &'static str;

    fn is_enabled(&self) -> bool;

    /// Channel whose readings this behavior consumes, if any.
    fn channel(&self) -> Option<&Channel>;

    /// Turn the behavior on.  Enabling an enabled behavior is a no-op.
    fn enable(&mut self, cache: &SensorCache) -> Vec<Command>;

    /// Turn the behavior off.  Disabling a disabled behavior is a no-op.
    fn disable(&mut self) -> Vec<Command>;

    /// Feed one reading from [`Behavior::channel`].
    fn step(&mut self, reading: &SensorReading) -> Step;
}

// ─────────────────────────────────────────────────────────────────────────────
// Forward
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Idle,
    Driving,
}

/// Drives straight ahead for as long as it is enabled.
pub struct Forward {
    drive: Drive,
    state: ForwardState,
}

impl Forward {
    pub fn new(drive: Drive) -> Self {
        Self {
            drive,
            state: ForwardState::Idle,
        }
    }
}

impl Behavior for Forward {
    fn name(&self) -> &'static str {
        "forward"
    }

    fn state(&self) -> &'static str {
        match self.state {
            ForwardState::Idle => "idle",
            ForwardState::Driving => "driving",
        }
    }

    fn is_enabled(&self) -> bool {
        self.state == ForwardState::Driving
    }

    fn channel(&self) -> Option<&Channel> {
        None
    }

    fn enable(&mut self, _cache: &SensorCache) -> Vec<Command> {
        if self.is_enabled() {
            return Vec::new();
        }
        self.state = ForwardState::Driving;
        self.drive.run(DriveMode::Forward)
    }

    fn disable(&mut self) -> Vec<Command> {
        if !self.is_enabled() {
            return Vec::new();
        }
        self.state = ForwardState::Idle;
        vec![actuator::stop()]
    }

    fn step(&mut self, _reading: &SensorReading) -> Step {
        Step::idle()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StopAtEdge
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeState {
    Table,
    Edge,
}

/// Brakes the first time the line sensors report the table edge.
///
/// Debounced: repeated edge readings do nothing until a table reading
/// re-arms it.
pub struct StopAtEdge {
    line: Channel,
    enabled: bool,
    state: EdgeState,
}

impl StopAtEdge {
    pub fn new(line: Channel) -> Self {
        Self {
            line,
            enabled: false,
            state: EdgeState::Table,
        }
    }
}

impl Behavior for StopAtEdge {
    fn name(&self) -> &'static str {
        "stop_at_edge"
    }

    fn state(&self) -> &'static str {
        match self.state {
            EdgeState::Table => "table",
            EdgeState::Edge => "edge",
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn channel(&self) -> Option<&Channel> {
        Some(&self.line)
    }

    fn enable(&mut self, _cache: &SensorCache) -> Vec<Command> {
        if !self.enabled {
            self.enabled = true;
            self.state = EdgeState::Table;
        }
        Vec::new()
    }

    fn disable(&mut self) -> Vec<Command> {
        self.enabled = false;
        Vec::new()
    }

    fn step(&mut self, reading: &SensorReading) -> Step {
        if !self.enabled || !matches!(reading, SensorReading::Line { .. }) {
            return Step::idle();
        }
        match (self.state, reading.is_edge()) {
            (EdgeState::Table, true) => {
                self.state = EdgeState::Edge;
                info!(behavior = self.name(), ?reading, "table edge reached");
                Step::finished(vec![actuator::stop()])
            }
            (EdgeState::Edge, false) => {
                self.state = EdgeState::Table;
                debug!(behavior = self.name(), "back on the table");
                Step::idle()
            }
            _ => Step::idle(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rotate180
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateState {
    Turning,
    Done,
}

/// Spins in place until the encoder has moved by `delta` counts.
///
/// The target is captured when the behavior is enabled, from the cached
/// encoder count.  If no count is known yet the first encoder reading arms
/// it instead.
pub struct Rotate180 {
    encoder: Channel,
    drive: Drive,
    delta: i32,
    enabled: bool,
    state: RotateState,
    target: Option<i32>,
}

impl Rotate180 {
    pub fn new(encoder: Channel, drive: Drive, delta: i32) -> Self {
        Self {
            encoder,
            drive,
            delta,
            enabled: false,
            state: RotateState::Done,
            target: None,
        }
    }

    pub fn target(&self) -> Option<i32> {
        self.target
    }

    fn reached(&self, count: i32, target: i32) -> bool {
        if self.delta >= 0 {
            count >= target
        } else {
            count <= target
        }
    }
}

impl Behavior for Rotate180 {
    fn name(&self) -> &'static str {
        "rotate180"
    }

    fn state(&self) -> &'static str {
        match self.state {
            RotateState::Turning => "turning",
            RotateState::Done => "done",
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn channel(&self) -> Option<&Channel> {
        Some(&self.encoder)
    }

    fn enable(&mut self, cache: &SensorCache) -> Vec<Command> {
        if self.enabled {
            return Vec::new();
        }
        self.enabled = true;
        self.state = RotateState::Turning;
        self.target = cache.last_quad.map(|quad| quad.saturating_add(self.delta));
        debug!(behavior = self.name(), target = ?self.target, "rotation armed");
        self.drive.run(DriveMode::RotateRight)
    }

    fn disable(&mut self) -> Vec<Command> {
        let was_turning = self.enabled && self.state == RotateState::Turning;
        self.enabled = false;
        self.target = None;
        if was_turning {
            vec![actuator::stop()]
        } else {
            Vec::new()
        }
    }

    fn step(&mut self, reading: &SensorReading) -> Step {
        let Some(count) = reading.encoder_count() else {
            return Step::idle();
        };
        if !self.enabled || self.state == RotateState::Done {
            return Step::idle();
        }
        let Some(target) = self.target else {
            self.target = Some(count.saturating_add(self.delta));
            return Step::idle();
        };
        if self.reached(count, target) {
            self.state = RotateState::Done;
            info!(behavior = self.name(), count, target, "rotation complete");
            return Step::finished(vec![actuator::stop()]);
        }
        Step::idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(qtr0: u8, qtr1: u8) -> SensorReading {
        SensorReading::Line { qtr0, qtr1 }
    }

    fn enc(count: i32) -> SensorReading {
        SensorReading::Encoder { count }
    }

    fn cache(quad: Option<i32>) -> SensorCache {
        let mut cache = SensorCache::new(Channel::new("hba_quad", "enc1"));
        cache.last_quad = quad;
        cache
    }

    fn lines(commands: &[Command]) -> Vec<String> {
        commands.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn forward_drives_once_and_stops_on_disable() {
        let mut fwd = Forward::new(Drive::new(0x10));
        let first = fwd.enable(&cache(None));
        assert_eq!(lines(&first).last().unwrap(), "hbaset hba_motor mode ff");
        assert_eq!(fwd.state(), "driving");
        assert!(fwd.enable(&cache(None)).is_empty());

        assert_eq!(lines(&fwd.disable()), vec!["hbaset hba_motor mode bb"]);
        assert!(fwd.disable().is_empty());
        assert_eq!(fwd.state(), "idle");
    }

    #[test]
    fn stop_at_edge_is_debounced() {
        let mut edge = StopAtEdge::new(Channel::new("hba_qtr", "qtr"));
        edge.enable(&cache(None));

        let first = edge.step(&line(0xff, 0xff));
        assert!(first.finished);
        assert_eq!(lines(&first.commands), vec!["hbaset hba_motor mode bb"]);

        let second = edge.step(&line(0xff, 0xff));
        assert_eq!(second, Step::idle());
        assert_eq!(edge.state(), "edge");

        // Back on the table re-arms without issuing anything.
        assert_eq!(edge.step(&line(0x00, 0x12)), Step::idle());
        assert_eq!(edge.state(), "table");
        assert!(edge.step(&line(0x00, 0xff)).finished);
    }

    #[test]
    fn disabled_stop_at_edge_ignores_edges() {
        let mut edge = StopAtEdge::new(Channel::new("hba_qtr", "qtr"));
        assert_eq!(edge.step(&line(0xff, 0xff)), Step::idle());
        assert_eq!(edge.state(), "table");
    }

    #[test]
    fn rotate_stops_once_at_target() {
        let mut rot = Rotate180::new(Channel::new("hba_quad", "enc1"), Drive::new(0x10), 720);
        let armed = rot.enable(&cache(Some(100)));
        assert_eq!(lines(&armed).last().unwrap(), "hbaset hba_motor mode rf");
        assert_eq!(rot.target(), Some(820));

        assert_eq!(rot.step(&enc(500)), Step::idle());
        let done = rot.step(&enc(820));
        assert!(done.finished);
        assert_eq!(lines(&done.commands), vec!["hbaset hba_motor mode bb"]);
        assert_eq!(rot.step(&enc(900)), Step::idle());
        assert_eq!(rot.state(), "done");
    }

    #[test]
    fn rotate_arms_on_first_reading_without_cached_count() {
        let mut rot = Rotate180::new(Channel::new("hba_quad", "enc1"), Drive::new(0x10), -100);
        rot.enable(&cache(None));
        assert_eq!(rot.target(), None);
        assert_eq!(rot.step(&enc(-50)), Step::idle());
        assert_eq!(rot.target(), Some(-150));
        assert!(!rot.step(&enc(-149)).finished);
        assert!(rot.step(&enc(-151)).finished);
    }

    #[test]
    fn rotate_target_saturates_at_the_count_range() {
        let mut rot = Rotate180::new(Channel::new("hba_quad", "enc1"), Drive::new(0x10), i32::MAX);
        rot.enable(&cache(Some(100)));
        assert_eq!(rot.target(), Some(i32::MAX));
        assert!(!rot.step(&enc(32767)).finished);

        let mut back = Rotate180::new(Channel::new("hba_quad", "enc1"), Drive::new(0x10), i32::MIN);
        back.enable(&cache(None));
        assert!(!back.step(&enc(-2)).finished);
        assert_eq!(back.target(), Some(i32::MIN));
    }

    #[test]
    fn disabling_mid_turn_stops_the_motors() {
        let mut rot = Rotate180::new(Channel::new("hba_quad", "enc1"), Drive::new(0x10), 720);
        rot.enable(&cache(Some(0)));
        assert_eq!(lines(&rot.disable()), vec!["hbaset hba_motor mode bb"]);
        assert!(!rot.step(&enc(1000)).finished);
    }
}
