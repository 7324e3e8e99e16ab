//! Command builders for the motor controller and the LED bank.
//!
//! Nothing here talks to the daemon.  Builders return [`Command`]s that the
//! caller hands to the bus, so behaviors stay pure state machines.

use std::fmt;

use hba_types::{Command, encode_hex};

pub const MOTOR: &str = "hba_motor";
pub const BASICIO: &str = "hba_basicio";

/// Direction pattern written to the motor controller's `mode` register.
///
/// Each letter drives one wheel: `f` forward, `r` reverse, `b` brake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    Forward,
    Reverse,
    RotateRight,
    RotateLeft,
    Brake,
}

impl DriveMode {
    pub fn code(self) -> &'static str {
        match self {
            DriveMode::Forward => "ff",
            DriveMode::Reverse => "rr",
            DriveMode::RotateRight => "rf",
            DriveMode::RotateLeft => "fr",
            DriveMode::Brake => "bb",
        }
    }

    pub fn command(self) -> Command {
        Command::set(MOTOR, "mode", self.code())
    }
}

impl fmt::Display for DriveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Set both wheel power registers.
pub fn wheel_power(left: u8, right: u8) -> Vec<Command> {
    vec![
        Command::set(MOTOR, "motor0", encode_hex(left.into())),
        Command::set(MOTOR, "motor1", encode_hex(right.into())),
    ]
}

pub fn leds(mask: u8) -> Command {
    Command::set(BASICIO, "leds", encode_hex(mask.into()))
}

/// Brake both wheels.
pub fn stop() -> Command {
    DriveMode::Brake.command()
}

/// Everything that must be issued to leave the robot safe: LEDs off, then
/// both wheels braked.
pub fn stop_all() -> Vec<Command> {
    vec![leds(0), stop()]
}

/// A differential drive running both wheels at one power level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drive {
    pub power: u8,
}

impl Drive {
    pub fn new(power: u8) -> Self {
        Self { power }
    }

    /// Wheel power followed by the direction pattern.
    pub fn run(&self, mode: DriveMode) -> Vec<Command> {
        let mut commands = wheel_power(self.power, self.power);
        commands.push(mode.command());
        commands
    }
}
