//! In-process simulated hardware daemon for tests without a robot.
//!
//! [`SimDaemon`] is a [`Connector`] whose connections are `tokio` duplex
//! pipes served by a small task that speaks the daemon's text protocol:
//!
//! | Received | Behaviour |
//! |---|---|
//! | `hbaset p r v` | stores `v`, answers `\` |
//! | `hbaget p r` | answers the stored value (default `0`) followed by `\n\` |
//! | `hbacat p r` | turns the connection into a stream for `p.r` |
//!
//! Every received line is appended to a shared log so tests can assert on
//! the exact command sequence.
//!
//! # Example
//!
//! ```rust
//! use hba_middleware::sim::SimDaemon;
//!
//! let sim = SimDaemon::new();
//! sim.set_register("hba_qtr", "thresh", "1f");
//! assert!(sim.commands().is_empty());
//! ```

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use hba_types::{Channel, Command, HbaError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::mpsc;

use crate::connector::{Connector, Transport};

/// How long the `wait_*` helpers poll before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(1);

enum StreamOp {
    Line(String),
    Sever,
}

#[derive(Default)]
struct SimState {
    log: Mutex<Vec<String>>,
    registers: Mutex<HashMap<Channel, String>>,
    streams: Mutex<HashMap<Channel, Vec<mpsc::UnboundedSender<StreamOp>>>>,
    refuse: AtomicBool,
    active: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking test thread must not hide the log from the others.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cheaply cloneable handle to one simulated daemon.
#[derive(Clone, Default)]
pub struct SimDaemon {
    state: Arc<SimState>,
}

impl SimDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make later `connect` calls fail like a refused TCP connection.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn set_register(&self, peripheral: &str, register: &str, value: &str) {
        lock(&self.state.registers).insert(Channel::new(peripheral, register), value.to_string());
    }

    pub fn register_value(&self, peripheral: &str, register: &str) -> Option<String> {
        lock(&self.state.registers)
            .get(&Channel::new(peripheral, register))
            .cloned()
    }

    /// Every command line received so far, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state.log).clone()
    }

    /// Number of times exactly `line` was received.
    pub fn count(&self, line: &str) -> usize {
        lock(&self.state.log).iter().filter(|l| *l == line).count()
    }

    /// Connections whose serving task is still running.
    pub fn active_connections(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Push one record line to every subscriber of `channel`.
    ///
    /// Waits for a subscriber to appear; returns `false` if none did.
    pub async fn emit(&self, channel: &Channel, line: &str) -> bool {
        if !self.wait_stream(channel).await {
            return false;
        }
        let streams = lock(&self.state.streams);
        let mut delivered = false;
        for tx in streams.get(channel).into_iter().flatten() {
            delivered |= tx.send(StreamOp::Line(line.to_string())).is_ok();
        }
        delivered
    }

    /// Drop every stream connection of `channel`, as if the daemon hung up.
    pub async fn sever(&self, channel: &Channel) -> bool {
        if !self.wait_stream(channel).await {
            return false;
        }
        let senders = lock(&self.state.streams).remove(channel).unwrap_or_default();
        for tx in senders {
            let _ = tx.send(StreamOp::Sever);
        }
        true
    }

    /// Wait until `line` has been received.
    pub async fn wait_for(&self, line: &str) -> bool {
        self.poll(|sim| sim.count(line) > 0).await
    }

    /// Wait until every connection has been closed by the client.
    pub async fn wait_until_idle(&self) -> bool {
        self.poll(|sim| sim.active_connections() == 0).await
    }

    async fn wait_stream(&self, channel: &Channel) -> bool {
        self.poll(|sim| {
            lock(&sim.state.streams)
                .get(channel)
                .is_some_and(|v| !v.is_empty())
        })
        .await
    }

    async fn poll(&self, ready: impl Fn(&SimDaemon) -> bool) -> bool {
        let waited = tokio::time::timeout(WAIT_TIMEOUT, async {
            while !ready(self) {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await;
        waited.is_ok()
    }
}

#[async_trait]
impl Connector for SimDaemon {
    async fn connect(&self) -> Result<Box<dyn Transport>, HbaError> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(HbaError::Connect {
                addr: self.describe(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            });
        }
        let (client, server) = tokio::io::duplex(4096);
        self.state.active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve(self.state.clone(), server));
        Ok(Box::new(client))
    }

    fn describe(&self) -> String {
        "sim".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection task
// ─────────────────────────────────────────────────────────────────────────────

async fn serve(state: Arc<SimState>, io: DuplexStream) {
    let (read, mut write) = tokio::io::split(io);
    let mut lines = BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        lock(&state.log).push(line.trim().to_string());
        let answer = match line.parse::<Command>() {
            Ok(Command::Set { channel, value }) => {
                lock(&state.registers).insert(channel, value);
                "\\".to_string()
            }
            Ok(Command::Get { channel }) => {
                let value = lock(&state.registers)
                    .get(&channel)
                    .cloned()
                    .unwrap_or_else(|| "0".to_string());
                format!("{value}\n\\")
            }
            Ok(Command::Cat { channel }) => {
                let (tx, rx) = mpsc::unbounded_channel();
                lock(&state.streams).entry(channel).or_default().push(tx);
                stream(rx, &mut write, &mut lines).await;
                break;
            }
            Err(_) => "unknown command\n\\".to_string(),
        };
        if write.write_all(answer.as_bytes()).await.is_err() {
            break;
        }
    }

    state.active.fetch_sub(1, Ordering::SeqCst);
}

/// Forward pushed lines until severed or until the client hangs up.
async fn stream<R>(
    mut rx: mpsc::UnboundedReceiver<StreamOp>,
    write: &mut WriteHalf<DuplexStream>,
    lines: &mut tokio::io::Lines<R>,
) where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        tokio::select! {
            op = rx.recv() => match op {
                Some(StreamOp::Line(line)) => {
                    if write.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                        return;
                    }
                }
                Some(StreamOp::Sever) | None => return,
            },
            incoming = lines.next_line() => match incoming {
                Ok(Some(_)) => continue,
                _ => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;

    #[tokio::test]
    async fn set_then_get_round_trips_through_registers() -> Result<(), HbaError> {
        let sim = SimDaemon::new();
        let mut link = Link::open_command(&sim).await?;
        link.request(&Command::set("hba_basicio", "leds", "3c")).await?;
        let reply = link.request(&Command::get("hba_basicio", "leds")).await?;
        assert_eq!(reply.value(), "3c");
        assert_eq!(sim.register_value("hba_basicio", "leds").as_deref(), Some("3c"));
        assert_eq!(
            sim.commands(),
            vec!["hbaset hba_basicio leds 3c", "hbaget hba_basicio leds"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn stream_delivers_emitted_lines() -> Result<(), HbaError> {
        let sim = SimDaemon::new();
        let channel = Channel::new("hba_quad", "enc1");
        let mut link = Link::open_stream(&sim, &channel).await?;
        assert!(sim.emit(&channel, "ffce").await);
        assert_eq!(link.next_record().await?.fields, vec!["ffce"]);

        assert!(sim.sever(&channel).await);
        assert!(link.next_record().await.unwrap_err().is_link_closed());
        Ok(())
    }

    #[tokio::test]
    async fn emit_without_subscriber_gives_up() {
        let sim = SimDaemon::new();
        assert!(!sim.emit(&Channel::new("hba_qtr", "qtr"), "ff ff").await);
    }

    #[tokio::test]
    async fn closing_the_client_ends_the_connection() -> Result<(), HbaError> {
        let sim = SimDaemon::new();
        let mut link = Link::open_command(&sim).await?;
        assert_eq!(sim.active_connections(), 1);
        link.close().await;
        assert!(sim.wait_until_idle().await);
        Ok(())
    }
}
