//! [`Arbiter`] – decides which behaviors are enabled.
//!
//! Behaviors are grouped into *stages*.  Exactly one stage is active at a
//! time; its behaviors are enabled and every other behavior is disabled.
//! A stage ends when its designated behavior reports that it finished, and
//! the arbiter then moves to the next stage, wrapping around after the last.
//!
//! The arbiter owns the [`SensorCache`] and is the only code that touches
//! behavior enable flags.  It is a [`Listener`], so one instance wrapped in
//! `Rc<RefCell<_>>` can be registered on every channel it needs.
//!
//! # Example
//!
//! ```rust
//! use hba_hal::Drive;
//! use hba_runtime::arbiter::Arbiter;
//! use hba_types::Channel;
//!
//! let line = Channel::new("hba_qtr", "qtr");
//! let encoder = Channel::new("hba_quad", "enc1");
//! let mut arbiter = Arbiter::patrol(line, encoder, Drive::new(0x10), 720);
//! let commands = arbiter.start();
//! assert_eq!(arbiter.stage_name(), Some("cruise"));
//! assert!(!commands.is_empty());
//! ```

use hba_hal::{Drive, SensorReading};
use hba_middleware::Listener;
use hba_types::{Channel, Command, Record};
use tracing::{info, warn};

use crate::behavior::{Behavior, Forward, Rotate180, StopAtEdge};
use crate::sensors::SensorCache;

/// Index of a behavior inside its arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BehaviorId(usize);

struct Stage {
    name: &'static str,
    members: Vec<BehaviorId>,
    until: BehaviorId,
}

pub struct Arbiter {
    behaviors: Vec<Box<dyn Behavior>>,
    stages: Vec<Stage>,
    current: Option<usize>,
    cache: SensorCache,
    halted: bool,
}

impl Arbiter {
    pub fn new(cache: SensorCache) -> Self {
        Self {
            behaviors: Vec::new(),
            stages: Vec::new(),
            current: None,
            cache,
            halted: false,
        }
    }

    /// Cruise until the table edge, turn around, repeat.
    pub fn patrol(line: Channel, encoder: Channel, drive: Drive, turn_distance: i32) -> Self {
        let mut arbiter = Arbiter::new(SensorCache::new(encoder.clone()));
        let forward = arbiter.add_behavior(Box::new(Forward::new(drive)));
        let edge = arbiter.add_behavior(Box::new(StopAtEdge::new(line)));
        let rotate = arbiter.add_behavior(Box::new(Rotate180::new(encoder, drive, turn_distance)));
        arbiter.add_stage("cruise", &[forward, edge], edge);
        arbiter.add_stage("turn", &[rotate], rotate);
        arbiter
    }

    pub fn add_behavior(&mut self, behavior: Box<dyn Behavior>) -> BehaviorId {
        self.behaviors.push(behavior);
        BehaviorId(self.behaviors.len() - 1)
    }

    /// Append a stage that enables `members` and ends when `until` finishes.
    pub fn add_stage(&mut self, name: &'static str, members: &[BehaviorId], until: BehaviorId) {
        self.stages.push(Stage {
            name,
            members: members.to_vec(),
            until,
        });
    }

    /// Enter the first stage.
    pub fn start(&mut self) -> Vec<Command> {
        if self.current.is_some() || self.halted || self.stages.is_empty() {
            return Vec::new();
        }
        self.enter(0)
    }

    pub fn stage_name(&self) -> Option<&'static str> {
        self.current.map(|i| self.stages[i].name)
    }

    pub fn cache(&self) -> &SensorCache {
        &self.cache
    }

    pub fn behavior(&self, id: BehaviorId) -> &dyn Behavior {
        self.behaviors[id.0].as_ref()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Feed one decoded reading from `channel`.
    pub fn on_reading(&mut self, channel: &Channel, reading: &SensorReading) -> Vec<Command> {
        self.cache.apply(channel, reading);
        let Some(index) = self.current else {
            return Vec::new();
        };

        let mut commands = Vec::new();
        let mut stage_done = false;
        let until = self.stages[index].until;
        for (i, behavior) in self.behaviors.iter_mut().enumerate() {
            if !behavior.is_enabled() || behavior.channel() != Some(channel) {
                continue;
            }
            let step = behavior.step(reading);
            commands.extend(step.commands);
            stage_done |= step.finished && BehaviorId(i) == until;
        }

        if stage_done {
            commands.extend(self.enter((index + 1) % self.stages.len()));
        }
        commands
    }

    /// Disable every behavior and stop sequencing.  Runs once.
    pub fn halt(&mut self) -> Vec<Command> {
        if self.halted {
            return Vec::new();
        }
        self.halted = true;
        self.current = None;
        info!("arbiter halted");
        self.behaviors.iter_mut().flat_map(|b| b.disable()).collect()
    }

    fn enter(&mut self, index: usize) -> Vec<Command> {
        let previous = self.stage_name();
        let Stage { name, members, .. } = &self.stages[index];
        info!(from = ?previous, to = name, "stage change");

        // Disable first so two stages never drive the motors at once.
        let mut commands = Vec::new();
        for (i, behavior) in self.behaviors.iter_mut().enumerate() {
            if !members.contains(&BehaviorId(i)) {
                commands.extend(behavior.disable());
            }
        }
        for id in members {
            commands.extend(self.behaviors[id.0].enable(&self.cache));
        }
        self.current = Some(index);
        commands
    }
}

impl Listener for Arbiter {
    fn on_record(&mut self, channel: &Channel, record: &Record) -> Vec<Command> {
        match hba_hal::decode(channel, record) {
            Ok(Some(reading)) => self.on_reading(channel, &reading),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(%channel, error = %e, "skipping record");
                Vec::new()
            }
        }
    }

    fn on_closed(&mut self, channel: &Channel) -> Vec<Command> {
        warn!(%channel, "sensor link lost");
        self.halt()
    }

    fn on_shutdown(&mut self) -> Vec<Command> {
        self.halt()
    }
}
