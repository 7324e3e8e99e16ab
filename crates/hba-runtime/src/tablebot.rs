//! Tablebot – drive around a table top without falling off.
//!
//! ```text
//!   IDLE ──start──▶ MOVE ──edge──▶ BACK ──quad < end──▶ TURN
//!                    ▲                                    │
//!                    └────────────── quad > end ──────────┘
//!
//!   any state ──stop / link lost / shutdown──▶ STOP
//! ```
//!
//! Transitions look only at the cached samples (`last_qtr0/1`, `last_quad`).
//! Entry commands are issued once per state change, never while a state
//! persists.

use std::fmt;

use hba_hal::actuator::{self, Drive, DriveMode};
use hba_hal::SensorReading;
use hba_middleware::Listener;
use hba_types::{Channel, Command, Record};
use tracing::{debug, info, warn};

use crate::sensors::SensorCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotState {
    Idle,
    Move,
    Back,
    Turn,
    Stop,
}

impl fmt::Display for RobotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RobotState::Idle => "IDLE",
            RobotState::Move => "MOVE",
            RobotState::Back => "BACK",
            RobotState::Turn => "TURN",
            RobotState::Stop => "STOP",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablebotConfig {
    pub drive: Drive,
    /// Encoder counts to reverse after seeing the edge.
    pub back_distance: i32,
    /// Encoder counts to rotate before driving on.
    pub turn_distance: i32,
    pub line: Channel,
    pub encoder: Channel,
}

impl Default for TablebotConfig {
    fn default() -> Self {
        Self {
            drive: Drive::new(0x10),
            back_distance: 50,
            turn_distance: 720,
            line: Channel::new("hba_qtr", "qtr"),
            encoder: Channel::new("hba_quad", "enc1"),
        }
    }
}

pub struct Tablebot {
    config: TablebotConfig,
    state: RobotState,
    cache: SensorCache,
    start_quad: Option<i32>,
    end_quad: Option<i32>,
}

impl Tablebot {
    pub fn new(config: TablebotConfig) -> Self {
        let cache = SensorCache::new(config.encoder.clone());
        Self {
            config,
            state: RobotState::Idle,
            cache,
            start_quad: None,
            end_quad: None,
        }
    }

    pub fn config(&self) -> &TablebotConfig {
        &self.config
    }

    pub fn state(&self) -> RobotState {
        self.state
    }

    pub fn cache(&self) -> &SensorCache {
        &self.cache
    }

    pub fn start_quad(&self) -> Option<i32> {
        self.start_quad
    }

    pub fn end_quad(&self) -> Option<i32> {
        self.end_quad
    }

    /// Leave IDLE and start driving.
    pub fn start(&mut self) -> Vec<Command> {
        if self.state != RobotState::Idle {
            return Vec::new();
        }
        self.enter(RobotState::Move)
    }

    /// Manual override; STOP is never left automatically.
    pub fn stop(&mut self) -> Vec<Command> {
        self.enter(RobotState::Stop)
    }

    /// Fold one reading into the cache and take at most one transition.
    pub fn on_reading(&mut self, channel: &Channel, reading: &SensorReading) -> Vec<Command> {
        self.cache.apply(channel, reading);
        match self.next_state() {
            Some(next) => self.enter(next),
            None => Vec::new(),
        }
    }

    fn next_state(&mut self) -> Option<RobotState> {
        let quad = self.cache.last_quad;
        match self.state {
            RobotState::Move if self.cache.at_edge() => {
                self.start_quad = quad;
                self.end_quad = quad.map(|q| q.saturating_sub(self.config.back_distance));
                Some(RobotState::Back)
            }
            RobotState::Back => {
                let q = quad?;
                match self.end_quad {
                    // Edge was seen before any encoder sample: measure from here.
                    None => {
                        self.start_quad = Some(q);
                        self.end_quad = Some(q.saturating_sub(self.config.back_distance));
                        None
                    }
                    Some(end) if q < end => {
                        self.end_quad = Some(q.saturating_add(self.config.turn_distance));
                        Some(RobotState::Turn)
                    }
                    Some(_) => None,
                }
            }
            RobotState::Turn => match (quad, self.end_quad) {
                (Some(q), Some(end)) if q > end => Some(RobotState::Move),
                _ => None,
            },
            _ => None,
        }
    }

    fn enter(&mut self, next: RobotState) -> Vec<Command> {
        if next == self.state {
            return Vec::new();
        }
        info!(
            from = %self.state,
            to = %next,
            quad = ?self.cache.last_quad,
            end_quad = ?self.end_quad,
            "tablebot state"
        );
        self.state = next;
        match next {
            RobotState::Move => self.config.drive.run(DriveMode::Forward),
            RobotState::Back => vec![DriveMode::Reverse.command()],
            RobotState::Turn => vec![DriveMode::RotateRight.command()],
            RobotState::Stop => vec![actuator::stop()],
            RobotState::Idle => Vec::new(),
        }
    }
}

impl Listener for Tablebot {
    fn on_record(&mut self, channel: &Channel, record: &Record) -> Vec<Command> {
        match hba_hal::decode(channel, record) {
            Ok(Some(reading)) => {
                debug!(%channel, ?reading, "reading");
                self.on_reading(channel, &reading)
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(%channel, error = %e, "skipping record");
                Vec::new()
            }
        }
    }

    fn on_closed(&mut self, channel: &Channel) -> Vec<Command> {
        warn!(%channel, "sensor link lost, stopping");
        self.stop()
    }

    fn on_shutdown(&mut self) -> Vec<Command> {
        self.stop()
    }
}
