//! # hba-hal
//!
//! Hardware vocabulary of the HBA peripherals.
//!
//! - [`sensor`] – typed readings decoded from stream records.
//! - [`actuator`] – motor and LED command builders, including the
//!   stop-all-actuators sequence.
//! - [`peripheral`] – enable/disable profiles of the streaming channels.

pub mod actuator;
pub mod peripheral;
pub mod sensor;

pub use actuator::{Drive, DriveMode, stop_all};
pub use peripheral::{PeripheralSettings, init_commands, profiles};
pub use sensor::{SensorKind, SensorReading, decode};
