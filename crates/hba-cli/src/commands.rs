//! Subcommand runners.  Each one opens its own event bus against the
//! daemon and always leaves through the bus shutdown path.

use std::cell::RefCell;
use std::collections::HashSet;
use std::error::Error;
use std::rc::Rc;
use std::sync::Arc;

use colored::Colorize;
use hba_middleware::{Connector, Delivery, EventBus, EventBusBuilder, QueueListener, ShutdownHandle, TcpConnector};
use hba_runtime::{Arbiter, Tablebot};
use hba_types::{Channel, Command, HbaError};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;

type CliResult = Result<(), Box<dyn Error>>;

fn tcp(cfg: &Config) -> Arc<dyn Connector> {
    Arc::new(TcpConnector::new(&cfg.host, cfg.port))
}

fn builder(cfg: &Config) -> EventBusBuilder {
    EventBus::builder(tcp(cfg))
}

/// Bus for robot programs: channels armed on demand, actuators stopped on
/// the way out.
async fn robot_bus(cfg: &Config, connector: Arc<dyn Connector>) -> Result<EventBus, Box<dyn Error>> {
    let mut bus = EventBus::builder(connector)
        .profiles(hba_hal::profiles(&cfg.peripheral_settings()))
        .stop_commands(hba_hal::stop_all())
        .connect()
        .await?;
    if let Err(e) = bus.issue(&hba_hal::init_commands()).await {
        return Err(abandon(bus, e).await);
    }
    Ok(bus)
}

/// Take a bus whose setup failed down through its shutdown path and hand
/// back the setup error.
async fn abandon(mut bus: EventBus, error: HbaError) -> Box<dyn Error> {
    if let Err(e) = bus.shutdown().await {
        warn!(error = %e, "shutdown after failed setup also failed");
    }
    error.into()
}

/// Route Ctrl-C to the bus shutdown path.
fn install_interrupt(handle: ShutdownHandle) {
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping the robot …".yellow().bold());
        handle.shutdown();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the robot will not stop on Ctrl-C");
    }
}

pub async fn get(cfg: &Config, peripheral: &str, register: &str) -> CliResult {
    let mut bus = builder(cfg).connect().await?;
    let reply = bus.request(&Command::get(peripheral, register)).await;
    bus.shutdown().await?;
    println!("{}", reply?.value());
    Ok(())
}

pub async fn set(cfg: &Config, peripheral: &str, register: &str, value: &str) -> CliResult {
    let mut bus = builder(cfg).connect().await?;
    let reply = bus.request(&Command::set(peripheral, register, value)).await;
    bus.shutdown().await?;
    reply?;
    println!("{} {}.{} = {}", "✓".green().bold(), peripheral, register, value.bold());
    Ok(())
}

/// Print every reading of `channels` until Ctrl-C or until all of them
/// are lost.
pub async fn watch(cfg: &Config, channels: &[Channel], json: bool) -> CliResult {
    let mut bus = builder(cfg)
        .profiles(hba_hal::profiles(&cfg.peripheral_settings()))
        .connect()
        .await?;
    let (listener, rx) = QueueListener::channel();
    let shared = Rc::new(RefCell::new(listener));
    for channel in channels {
        bus.register(channel.clone(), Box::new(shared.clone())).await?;
    }
    // Only the registry may keep the queue open, so the printer sees the end.
    drop(shared);

    let handle = bus.shutdown_handle();
    install_interrupt(handle.clone());
    let watched: HashSet<Channel> = channels.iter().cloned().collect();
    let (result, ()) = tokio::join!(bus.run(), print_deliveries(rx, watched, json, handle));
    result?;
    Ok(())
}

async fn print_deliveries(
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    mut live: HashSet<Channel>,
    json: bool,
    handle: ShutdownHandle,
) {
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Record { channel, record } => match hba_hal::decode(&channel, &record) {
                Ok(Some(reading)) if json => {
                    let line = serde_json::json!({ "channel": channel.to_string(), "reading": reading });
                    println!("{line}");
                }
                Ok(Some(reading)) => println!("{} {:?}", channel.to_string().cyan(), reading),
                Ok(None) => {}
                Err(e) => warn!(%channel, error = %e, "skipping record"),
            },
            Delivery::Closed { channel } => {
                eprintln!("{} {}", "link lost:".red(), channel);
                live.remove(&channel);
                if live.is_empty() {
                    handle.shutdown();
                }
            }
        }
    }
}

/// Drive the MOVE / BACK / TURN table-top program until Ctrl-C.
pub async fn tablebot(cfg: &Config) -> CliResult {
    run_tablebot(cfg, tcp(cfg), install_interrupt).await
}

/// `on_ready` receives the shutdown handle as soon as the bus exists, before
/// any channel is armed.
async fn run_tablebot(cfg: &Config, connector: Arc<dyn Connector>, on_ready: impl FnOnce(ShutdownHandle)) -> CliResult {
    let bot_cfg = cfg.tablebot()?;
    let mut bus = robot_bus(cfg, connector).await?;
    on_ready(bus.shutdown_handle());

    let bot = Rc::new(RefCell::new(Tablebot::new(bot_cfg.clone())));
    let armed: Result<(), HbaError> = async {
        bus.register(bot_cfg.line.clone(), Box::new(bot.clone())).await?;
        bus.register(bot_cfg.encoder.clone(), Box::new(bot.clone())).await?;
        let start = bot.borrow_mut().start();
        bus.issue(&start).await
    }
    .await;
    if let Err(e) = armed {
        return Err(abandon(bus, e).await);
    }
    println!("{} tablebot running, Ctrl-C to stop", "▶".green().bold());

    let outcome = bus.run().await;
    info!(state = %bot.borrow().state(), "tablebot finished");
    outcome?;
    Ok(())
}

/// Cruise to the edge, turn around, repeat, until Ctrl-C.
pub async fn patrol(cfg: &Config) -> CliResult {
    run_patrol(cfg, tcp(cfg), install_interrupt).await
}

async fn run_patrol(cfg: &Config, connector: Arc<dyn Connector>, on_ready: impl FnOnce(ShutdownHandle)) -> CliResult {
    let line = cfg.line()?;
    let encoder = cfg.encoder()?;
    let turn = cfg.turn()?;
    let mut bus = robot_bus(cfg, connector).await?;
    on_ready(bus.shutdown_handle());

    let arbiter = Rc::new(RefCell::new(Arbiter::patrol(line.clone(), encoder.clone(), cfg.drive(), turn)));
    let armed: Result<(), HbaError> = async {
        bus.register(line, Box::new(arbiter.clone())).await?;
        bus.register(encoder, Box::new(arbiter.clone())).await?;
        let start = arbiter.borrow_mut().start();
        bus.issue(&start).await
    }
    .await;
    if let Err(e) = armed {
        return Err(abandon(bus, e).await);
    }
    println!("{} patrol running, Ctrl-C to stop", "▶".green().bold());

    bus.run().await?;
    Ok(())
}
