//! `hba-middleware` – The Sensor Event Bus
//!
//! Moves bytes between the HBA hardware daemon and the robot's reactive
//! logic without caring what the bytes mean.
//!
//! # Modules
//!
//! - [`frame`] – Frame Decoder: `\`-terminated replies and newline-terminated
//!   stream records.
//! - [`connector`] – the [`Connector`] transport seam and its TCP
//!   implementation (`localhost:8870`).
//! - [`link`] – [`Link`]: one connection in one framing mode.
//! - [`listener`] – [`Listener`] trait and the reference-counted
//!   [`ListenerRegistry`].
//! - [`bus`] – [`EventBus`]: the single-task readiness loop that decodes and
//!   dispatches records and owns the shutdown path.
//! - [`sim`] – [`SimDaemon`][sim::SimDaemon]: an in-process daemon for
//!   headless tests.

pub mod bus;
pub mod connector;
pub mod frame;
pub mod link;
pub mod listener;
pub mod sim;

pub use bus::{EventBus, EventBusBuilder, ShutdownHandle};
pub use connector::{Connector, TcpConnector, Transport};
pub use frame::FrameDecoder;
pub use link::Link;
pub use listener::{Delivery, FnListener, Listener, ListenerRegistry, ListenerToken, QueueListener, Transition};
