//! Event Bus (Sensor Hub) – the single control loop of the robot.
//!
//! The bus owns every [`Link`]: one command link for request/response
//! traffic and one stream link per active [`Channel`].  [`EventBus::run`]
//! waits for any stream link to become readable, collects every other link
//! that is readable at that moment, and decodes exactly one record from
//! each of them.  Each record goes to its channel's listeners and the
//! commands they return are issued before the next record is decoded.
//!
//! Everything runs on one task.  A record is fully dispatched, and its
//! commands are acknowledged by the daemon, before the next readiness check,
//! so command issuance is totally ordered with respect to sensor input.
//!
//! # Channel activation
//!
//! | Registry transition | Bus action |
//! |---|---|
//! | 0 → 1 listeners | issue the channel's `enable` commands, open the stream link (`hbacat`) |
//! | 1 → 0 listeners | issue the channel's `disable` commands, close the stream link |
//! | link lost | notify and drop the channel's listeners, forget the link |
//!
//! # Shutdown
//!
//! [`EventBus::shutdown`] (also reached when `run` returns) collects the
//! listeners' shutdown commands, appends the stop-all-actuators commands and
//! the disable commands of every active channel, issues them, and closes all
//! links.  It runs at most once.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::select_all;
use hba_types::{Channel, ChannelProfile, Command, HbaError, Record, Reply};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::connector::Connector;
use crate::link::Link;
use crate::listener::{Listener, ListenerRegistry, ListenerToken, Transition};

/// Cloneable, thread-safe request to stop a running bus.
///
/// Safe to trigger from a signal handler thread.
#[derive(Clone, Debug)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }
}

/// Builder for [`EventBus`].
pub struct EventBusBuilder {
    connector: Arc<dyn Connector>,
    profiles: HashMap<Channel, ChannelProfile>,
    stop_commands: Vec<Command>,
}

impl EventBusBuilder {
    /// Enable/disable commands per channel.  Channels without a profile are
    /// streamed without any extra commands.
    pub fn profiles(mut self, profiles: HashMap<Channel, ChannelProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    /// Commands that stop every actuator; always issued on shutdown.
    pub fn stop_commands(mut self, commands: Vec<Command>) -> Self {
        self.stop_commands = commands;
        self
    }

    /// Open the command link.  Failure here is fatal for the caller.
    pub async fn connect(self) -> Result<EventBus, HbaError> {
        let command = Link::open_command(self.connector.as_ref()).await?;
        let (tx, rx) = watch::channel(false);
        info!(daemon = %self.connector.describe(), "event bus connected");
        Ok(EventBus {
            connector: self.connector,
            command,
            streams: BTreeMap::new(),
            registry: ListenerRegistry::new(),
            profiles: self.profiles,
            stop_commands: self.stop_commands,
            shutdown_tx: Arc::new(tx),
            shutdown_rx: rx,
            closed: false,
        })
    }
}

/// Multiplexes daemon links and fans records out to listeners.
pub struct EventBus {
    connector: Arc<dyn Connector>,
    command: Link,
    streams: BTreeMap<Channel, Link>,
    registry: ListenerRegistry,
    profiles: HashMap<Channel, ChannelProfile>,
    stop_commands: Vec<Command>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    closed: bool,
}

impl EventBus {
    pub fn builder(connector: Arc<dyn Connector>) -> EventBusBuilder {
        EventBusBuilder {
            connector,
            profiles: HashMap::new(),
            stop_commands: Vec::new(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Register `listener` on `channel`.
    ///
    /// The first listener of a channel enables it and opens its stream link;
    /// later listeners join the existing link.
    #[instrument(skip(self, listener), fields(channel = %channel))]
    pub async fn register(&mut self, channel: Channel, listener: Box<dyn Listener>) -> Result<ListenerToken, HbaError> {
        if self.closed {
            return Err(HbaError::ShutDown);
        }
        let (token, transition) = self.registry.insert(channel.clone(), listener);
        if transition == Transition::Activated
            && let Err(e) = self.activate(&channel).await
        {
            // `activate` already undid whatever it issued.
            let _ = self.registry.remove(token);
            return Err(e);
        }
        debug!(%token, listeners = self.registry.count(&channel), "listener registered");
        Ok(token)
    }

    /// Remove a listener; the last one out disables the channel.
    #[instrument(skip(self))]
    pub async fn unregister(&mut self, token: ListenerToken) -> Result<(), HbaError> {
        let (channel, _listener, transition) = self.registry.remove(token)?;
        if transition == Transition::Deactivated && !self.closed {
            self.deactivate(&channel).await?;
        }
        debug!(%channel, "listener unregistered");
        Ok(())
    }

    /// One request/response exchange on the command link.
    #[instrument(skip(self), fields(command = %command))]
    pub async fn request(&mut self, command: &Command) -> Result<Reply, HbaError> {
        if self.closed {
            return Err(HbaError::ShutDown);
        }
        self.command.request(command).await
    }

    /// Issue commands in order, waiting for each acknowledgement.
    pub async fn issue(&mut self, commands: &[Command]) -> Result<(), HbaError> {
        for command in commands {
            let reply = self.request(command).await?;
            debug!(command = %command, reply = %reply.value(), "command acknowledged");
        }
        Ok(())
    }

    /// Run the readiness loop until shutdown is requested or the command
    /// link fails.  The shutdown path always runs before this returns.
    pub async fn run(&mut self) -> Result<(), HbaError> {
        if self.closed {
            return Err(HbaError::ShutDown);
        }
        info!(streams = self.streams.len(), "event loop started");
        let outcome = self.event_loop().await;
        if let Err(e) = &outcome {
            warn!(error = %e, "event loop failed");
        }
        let closing = self.shutdown().await;
        outcome.and(closing)
    }

    /// The guaranteed shutdown path.  Runs once; later calls are no-ops.
    pub async fn shutdown(&mut self) -> Result<(), HbaError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.shutdown_tx.send_replace(true);

        let mut commands = self.registry.shutdown_all();
        commands.extend(self.stop_commands.iter().cloned());
        for channel in self.streams.keys() {
            commands.extend(self.profile(channel).disable);
        }

        let mut first_error = None;
        for command in &commands {
            match self.command.request(command).await {
                Ok(_) => debug!(command = %command, "shutdown command acknowledged"),
                Err(e) => {
                    warn!(command = %command, error = %e, "shutdown command failed");
                    let fatal = !self.command.is_open();
                    first_error.get_or_insert(e);
                    if fatal {
                        break;
                    }
                }
            }
        }

        for link in self.streams.values_mut() {
            link.close().await;
        }
        self.streams.clear();
        self.command.close().await;
        info!("event bus shut down");
        first_error.map_or(Ok(()), Err)
    }

    pub fn listener_count(&self, channel: &Channel) -> usize {
        self.registry.count(channel)
    }

    pub fn is_streaming(&self, channel: &Channel) -> bool {
        self.streams.contains_key(channel)
    }

    /// Number of links (command link included) still open.
    pub fn open_links(&self) -> usize {
        self.streams.values().filter(|l| l.is_open()).count() + usize::from(self.command.is_open())
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    async fn event_loop(&mut self) -> Result<(), HbaError> {
        loop {
            if *self.shutdown_rx.borrow() {
                return Ok(());
            }

            let first = {
                let shutdown = &mut self.shutdown_rx;
                let streams = &mut self.streams;
                tokio::select! {
                    _ = shutdown.changed() => None,
                    ready = next_ready(streams) => Some(ready),
                }
            };
            let Some(first) = first else {
                continue;
            };

            // Every link ready in this cycle gets exactly one record, so a
            // busy channel cannot starve the others.
            let mut ready = vec![first];
            ready.extend(ready_now(&mut self.streams, &ready[0].0));
            for (channel, readiness) in ready {
                match readiness {
                    Ok(true) => self.pump(&channel).await?,
                    Ok(false) => self.link_lost(&channel, None).await?,
                    Err(e) => self.link_lost(&channel, Some(e)).await?,
                }
            }
        }
    }

    /// Decode one record from a ready link and dispatch it.
    async fn pump(&mut self, channel: &Channel) -> Result<(), HbaError> {
        let Some(link) = self.streams.get_mut(channel) else {
            return Ok(());
        };
        let record = match link.next_record().await {
            Ok(record) => record,
            Err(e) => return self.link_lost(channel, Some(e)).await,
        };
        self.dispatch(channel, &record).await
    }

    async fn dispatch(&mut self, channel: &Channel, record: &Record) -> Result<(), HbaError> {
        let commands = self.registry.dispatch(channel, record);
        debug!(%channel, %record, commands = commands.len(), "record dispatched");
        self.issue(&commands).await
    }

    async fn link_lost(&mut self, channel: &Channel, cause: Option<HbaError>) -> Result<(), HbaError> {
        match &cause {
            Some(e) => warn!(%channel, error = %e, "stream link lost"),
            None => warn!(%channel, "stream link closed by daemon"),
        }
        if let Some(mut link) = self.streams.remove(channel) {
            link.close().await;
        }
        let commands = self.registry.close_channel(channel);
        self.issue(&commands).await
    }

    async fn activate(&mut self, channel: &Channel) -> Result<(), HbaError> {
        let profile = self.profile(channel);
        self.issue(&profile.enable).await?;
        if !self.streams.contains_key(channel) {
            match Link::open_stream(self.connector.as_ref(), channel).await {
                Ok(link) => {
                    self.streams.insert(channel.clone(), link);
                }
                Err(e) => {
                    if let Err(undo) = self.issue(&profile.disable).await {
                        warn!(%channel, error = %undo, "could not disable channel after failed open");
                    }
                    return Err(e);
                }
            }
        }
        info!(%channel, "channel enabled");
        Ok(())
    }

    async fn deactivate(&mut self, channel: &Channel) -> Result<(), HbaError> {
        let profile = self.profile(channel);
        self.issue(&profile.disable).await?;
        if let Some(mut link) = self.streams.remove(channel) {
            link.close().await;
        }
        info!(%channel, "channel disabled");
        Ok(())
    }

    fn profile(&self, channel: &Channel) -> ChannelProfile {
        self.profiles.get(channel).cloned().unwrap_or_default()
    }
}

/// Wait for the first stream link with bytes (or EOF) to read.
async fn next_ready(streams: &mut BTreeMap<Channel, Link>) -> (Channel, Result<bool, HbaError>) {
    if streams.is_empty() {
        return std::future::pending().await;
    }
    let waits = streams
        .iter_mut()
        .map(|(channel, link)| Box::pin(async move { (channel.clone(), link.ready().await) }));
    let (ready, _, _) = select_all(waits).await;
    ready
}

/// Links other than `skip` that can be read without waiting.
fn ready_now(streams: &mut BTreeMap<Channel, Link>, skip: &Channel) -> Vec<(Channel, Result<bool, HbaError>)> {
    streams
        .iter_mut()
        .filter(|(channel, _)| *channel != skip)
        .filter_map(|(channel, link)| link.ready().now_or_never().map(|r| (channel.clone(), r)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{Delivery, FnListener, QueueListener};
    use crate::sim::SimDaemon;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    fn qtr() -> Channel {
        Channel::new("hba_qtr", "qtr")
    }

    fn quad() -> Channel {
        Channel::new("hba_quad", "enc1")
    }

    fn profiles() -> HashMap<Channel, ChannelProfile> {
        let mut map = HashMap::new();
        map.insert(
            qtr(),
            ChannelProfile {
                enable: vec![Command::set("hba_qtr", "ctrl", "f")],
                disable: vec![Command::set("hba_qtr", "ctrl", "0")],
            },
        );
        map
    }

    fn stop_all() -> Vec<Command> {
        vec![
            Command::set("hba_basicio", "leds", "0"),
            Command::set("hba_motor", "mode", "bb"),
        ]
    }

    async fn bus(sim: &SimDaemon) -> Result<EventBus, HbaError> {
        EventBus::builder(Arc::new(sim.clone()))
            .profiles(profiles())
            .stop_commands(stop_all())
            .connect()
            .await
    }

    fn silent() -> Box<dyn Listener> {
        Box::new(FnListener(|_: &Channel, _: &Record| Vec::new()))
    }

    #[tokio::test]
    async fn enable_and_disable_issue_once_per_transition() -> Result<(), HbaError> {
        let sim = SimDaemon::new();
        let mut bus = bus(&sim).await?;

        let a = bus.register(qtr(), silent()).await?;
        let b = bus.register(qtr(), silent()).await?;
        let c = bus.register(qtr(), silent()).await?;
        assert_eq!(bus.listener_count(&qtr()), 3);
        bus.unregister(b).await?;
        bus.unregister(a).await?;
        assert!(bus.is_streaming(&qtr()));
        bus.unregister(c).await?;
        assert!(!bus.is_streaming(&qtr()));

        let d = bus.register(qtr(), silent()).await?;
        bus.unregister(d).await?;

        assert_eq!(sim.count("hbaset hba_qtr ctrl f"), 2);
        assert_eq!(sim.count("hbaset hba_qtr ctrl 0"), 2);
        assert_eq!(sim.count("hbacat hba_qtr qtr"), 2);
        Ok(())
    }

    #[tokio::test]
    async fn records_reach_listeners_in_registration_order() -> Result<(), HbaError> {
        let sim = SimDaemon::new();
        let mut bus = bus(&sim).await?;
        let seen = Rc::new(RefCell::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            bus.register(
                qtr(),
                Box::new(FnListener(move |_: &Channel, r: &Record| {
                    seen.borrow_mut().push(format!("{tag}:{r}"));
                    Vec::new()
                })),
            )
            .await?;
        }
        let (queue, mut rx) = QueueListener::channel();
        bus.register(qtr(), Box::new(queue)).await?;

        let handle = bus.shutdown_handle();
        let driver = async {
            assert!(sim.emit(&qtr(), "ff 00").await);
            assert!(sim.emit(&qtr(), "00 00").await);
            rx.recv().await;
            rx.recv().await;
            handle.shutdown();
        };
        let (result, ()) = tokio::join!(bus.run(), driver);
        result?;

        assert_eq!(
            *seen.borrow(),
            vec!["first:ff 00", "second:ff 00", "first:00 00", "second:00 00"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn busy_channel_does_not_starve_the_others() -> Result<(), HbaError> {
        let sim = SimDaemon::new();
        let mut bus = bus(&sim).await?;
        let (queue, mut rx) = QueueListener::channel();
        let shared = Rc::new(RefCell::new(queue));
        bus.register(qtr(), Box::new(shared.clone())).await?;
        bus.register(quad(), Box::new(shared.clone())).await?;

        for _ in 0..5 {
            assert!(sim.emit(&qtr(), "00 00").await);
        }
        assert!(sim.emit(&quad(), "0032").await);
        // Let both bursts land in the link buffers before the loop starts.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let handle = bus.shutdown_handle();
        let driver = async {
            let mut order = Vec::new();
            while order.len() < 6 {
                match rx.recv().await {
                    Some(Delivery::Record { channel, .. }) => order.push(channel),
                    _ => break,
                }
            }
            handle.shutdown();
            order
        };
        let (result, order) = tokio::join!(bus.run(), driver);
        result?;

        assert_eq!(order.len(), 6);
        let first_quad = order.iter().position(|c| *c == quad());
        assert!(matches!(first_quad, Some(i) if i < 2), "{order:?}");
        Ok(())
    }

    #[tokio::test]
    async fn listener_commands_are_issued_before_next_record() -> Result<(), HbaError> {
        let sim = SimDaemon::new();
        let mut bus = bus(&sim).await?;
        bus.register(
            quad(),
            Box::new(FnListener(|_: &Channel, r: &Record| {
                vec![Command::set("hba_basicio", "leds", r.to_string())]
            })),
        )
        .await?;

        let handle = bus.shutdown_handle();
        let driver = async {
            sim.emit(&quad(), "1").await;
            sim.emit(&quad(), "2").await;
            sim.wait_for("hbaset hba_basicio leds 2").await;
            handle.shutdown();
        };
        let (result, ()) = tokio::join!(bus.run(), driver);
        result?;

        let log = sim.commands();
        let first = log.iter().position(|l| l == "hbaset hba_basicio leds 1");
        let second = log.iter().position(|l| l == "hbaset hba_basicio leds 2");
        assert!(first.is_some() && first < second);
        Ok(())
    }

    #[tokio::test]
    async fn lost_link_notifies_listeners_and_allows_reregister() -> Result<(), HbaError> {
        let sim = SimDaemon::new();
        let mut bus = bus(&sim).await?;
        let (queue, mut rx) = QueueListener::channel();
        let token = bus.register(qtr(), Box::new(queue)).await?;

        let handle = bus.shutdown_handle();
        let driver = async {
            sim.sever(&qtr()).await;
            let delivery = rx.recv().await;
            handle.shutdown();
            delivery
        };
        let (result, delivery) = tokio::join!(bus.run(), driver);
        result?;
        assert_eq!(delivery, Some(Delivery::Closed { channel: qtr() }));
        assert!(matches!(bus.unregister(token).await, Err(HbaError::UnknownListener(_))));
        Ok(())
    }

    #[tokio::test]
    async fn reregister_after_link_loss_reopens_stream() -> Result<(), HbaError> {
        let sim = SimDaemon::new();
        let mut bus = bus(&sim).await?;
        let (queue, mut rx) = QueueListener::channel();
        bus.register(qtr(), Box::new(queue)).await?;

        let driver = async {
            sim.sever(&qtr()).await;
            rx.recv().await;
        };
        // Drive the loop until the closure is observed, without shutting down the bus.
        let outcome = tokio::select! {
            r = bus.event_loop() => r,
            () = driver => Ok(()),
        };
        outcome?;
        assert!(!bus.is_streaming(&qtr()));

        bus.register(qtr(), silent()).await?;
        assert!(bus.is_streaming(&qtr()));
        assert_eq!(sim.count("hbacat hba_qtr qtr"), 2);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_stops_actuators_and_closes_links() -> Result<(), HbaError> {
        let sim = SimDaemon::new();
        let mut bus = bus(&sim).await?;
        bus.register(qtr(), silent()).await?;
        bus.register(quad(), silent()).await?;
        assert_eq!(bus.open_links(), 3);

        let handle = bus.shutdown_handle();
        handle.shutdown();
        bus.run().await?;
        bus.shutdown().await?;

        assert_eq!(bus.open_links(), 0);
        assert_eq!(sim.count("hbaset hba_motor mode bb"), 1);
        assert_eq!(sim.count("hbaset hba_basicio leds 0"), 1);
        assert_eq!(sim.count("hbaset hba_qtr ctrl 0"), 1);
        assert!(sim.wait_until_idle().await);
        assert!(matches!(bus.register(qtr(), silent()).await, Err(HbaError::ShutDown)));
        Ok(())
    }

    #[tokio::test]
    async fn startup_connection_failure_is_fatal() {
        let sim = SimDaemon::new();
        sim.refuse_connections(true);
        assert!(matches!(bus(&sim).await, Err(HbaError::Connect { .. })));
    }

    #[tokio::test]
    async fn run_without_streams_waits_for_shutdown() -> Result<(), HbaError> {
        let sim = SimDaemon::new();
        let mut bus = bus(&sim).await?;
        let handle = bus.shutdown_handle();
        let driver = async {
            tokio::task::yield_now().await;
            handle.shutdown();
        };
        let (result, ()) = tokio::join!(bus.run(), driver);
        result?;
        assert!(bus.is_shut_down());
        Ok(())
    }
}
