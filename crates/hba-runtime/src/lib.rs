//! `hba-runtime` – what the robot does with its sensor events.
//!
//! # Modules
//!
//! - [`sensors`] – [`SensorCache`]: latest sample per input, owned by the
//!   component that drives the actuators.
//! - [`behavior`] – the reactive [`Behavior`] state machines
//!   ([`Forward`], [`StopAtEdge`], [`Rotate180`]).
//! - [`arbiter`] – [`Arbiter`]: sequences behavior stages so only one stage
//!   drives the motors at a time.
//! - [`tablebot`] – [`Tablebot`]: the MOVE / BACK / TURN / STOP table-top
//!   state machine.
//! - [`telemetry`] – [`init_tracing`]: subscriber and optional OTLP export.
//!
//! Both [`Arbiter`] and [`Tablebot`] implement
//! [`Listener`][hba_middleware::Listener]; register them with the event bus
//! wrapped in `Rc<RefCell<_>>` to receive several channels.

pub mod arbiter;
pub mod behavior;
pub mod sensors;
pub mod tablebot;
pub mod telemetry;

pub use arbiter::{Arbiter, BehaviorId};
pub use behavior::{Behavior, Forward, Rotate180, Step, StopAtEdge};
pub use sensors::SensorCache;
pub use tablebot::{RobotState, Tablebot, TablebotConfig};
pub use telemetry::{TracerProviderGuard, init_tracing};
