//! [`Link`] – one logical connection to the daemon.
//!
//! A link is created in one framing mode and stays in it:
//!
//! * a **command** link carries request/response exchanges
//!   ([`Link::request`]),
//! * a **stream** link has sent `hbacat` for exactly one channel and from
//!   then on only yields records ([`Link::next_record`]).

use hba_types::{Channel, Command, FramingMode, HbaError, Record, Reply};
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tracing::{debug, trace};

use crate::connector::{Connector, Transport};
use crate::frame::FrameDecoder;

type Reader = BufReader<ReadHalf<Box<dyn Transport>>>;

pub struct Link {
    name: String,
    decoder: FrameDecoder<Reader>,
    writer: WriteHalf<Box<dyn Transport>>,
    open: bool,
}

impl Link {
    /// Open the request/response link used for `hbaset` / `hbaget`.
    pub async fn open_command(connector: &dyn Connector) -> Result<Link, HbaError> {
        let transport = connector.connect().await?;
        Ok(Link::from_transport(transport, "command", FramingMode::RequestReply))
    }

    /// Open a stream link and subscribe it to `channel` with `hbacat`.
    pub async fn open_stream(connector: &dyn Connector, channel: &Channel) -> Result<Link, HbaError> {
        let transport = connector.connect().await?;
        let mut link = Link::from_transport(transport, channel.to_string(), FramingMode::Stream);
        link.write_line(&Command::cat(channel.clone())).await?;
        debug!(link = %link.name, "stream subscribed");
        Ok(link)
    }

    pub fn from_transport(transport: Box<dyn Transport>, name: impl Into<String>, mode: FramingMode) -> Link {
        let name = name.into();
        let (read, writer) = tokio::io::split(transport);
        Link {
            decoder: FrameDecoder::new(BufReader::new(read), mode, name.clone()),
            name,
            writer,
            open: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> FramingMode {
        self.decoder.mode()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Send one command and wait for its `\`-terminated reply.
    pub async fn request(&mut self, command: &Command) -> Result<Reply, HbaError> {
        if self.mode() != FramingMode::RequestReply {
            return Err(HbaError::WrongMode {
                link: self.name.clone(),
                mode: self.mode(),
            });
        }
        if command.framing() == FramingMode::Stream {
            return Err(HbaError::InvalidCommand(command.to_string()));
        }
        self.write_line(command).await?;
        let reply = self.decoder.next_reply().await;
        self.track(reply)
    }

    /// Wait until the link has bytes to read; `false` means end of stream.
    pub async fn ready(&mut self) -> Result<bool, HbaError> {
        self.ensure_open()?;
        self.decoder.ready().await
    }

    pub async fn next_record(&mut self) -> Result<Record, HbaError> {
        self.ensure_open()?;
        let record = self.decoder.next_record().await;
        self.track(record)
    }

    /// Half-close the connection.  Idempotent.
    pub async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        // The peer may already be gone; nothing left to do about it.
        let _ = self.writer.shutdown().await;
        debug!(link = %self.name, "link closed");
    }

    async fn write_line(&mut self, command: &Command) -> Result<(), HbaError> {
        self.ensure_open()?;
        trace!(link = %self.name, command = %command, "send");
        let written = async {
            self.writer.write_all(command.to_line().as_bytes()).await?;
            self.writer.flush().await
        }
        .await;
        written.map_err(|source| {
            self.open = false;
            HbaError::Io {
                link: self.name.clone(),
                source,
            }
        })
    }

    fn ensure_open(&self) -> Result<(), HbaError> {
        if self.open {
            Ok(())
        } else {
            Err(HbaError::LinkClosed {
                link: self.name.clone(),
            })
        }
    }

    fn track<T>(&mut self, result: Result<T, HbaError>) -> Result<T, HbaError> {
        if matches!(result, Err(HbaError::LinkClosed { .. } | HbaError::Io { .. })) {
            self.open = false;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    fn pair(mode: FramingMode) -> (Link, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(1024);
        (Link::from_transport(Box::new(client), "test", mode), server)
    }

    #[tokio::test]
    async fn request_writes_line_and_reads_reply() -> Result<(), Box<dyn std::error::Error>> {
        let (mut link, server) = pair(FramingMode::RequestReply);
        let daemon = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = tokio::io::BufReader::new(read).lines();
            let line = lines.next_line().await?.unwrap_or_default();
            write.write_all(b"1f\n\\").await?;
            Ok::<_, std::io::Error>(line)
        });

        let reply = link.request(&Command::get("hba_qtr", "thresh")).await?;
        assert_eq!(reply.value(), "1f");
        assert_eq!(daemon.await??, "hbaget hba_qtr thresh");
        Ok(())
    }

    #[tokio::test]
    async fn stream_link_refuses_requests() {
        let (mut link, _server) = pair(FramingMode::Stream);
        let result = link.request(&Command::get("hba_qtr", "qtr")).await;
        assert!(matches!(result, Err(HbaError::WrongMode { .. })));
    }

    #[tokio::test]
    async fn cat_is_not_a_request() {
        let (mut link, _server) = pair(FramingMode::RequestReply);
        let result = link.request(&Command::cat(Channel::new("hba_qtr", "qtr"))).await;
        assert!(matches!(result, Err(HbaError::InvalidCommand(_))));
    }

    #[tokio::test]
    async fn peer_hangup_closes_link() {
        let (mut link, server) = pair(FramingMode::Stream);
        drop(server);
        assert!(link.next_record().await.unwrap_err().is_link_closed());
        assert!(!link.is_open());
        assert!(link.ready().await.unwrap_err().is_link_closed());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut link, _server) = pair(FramingMode::RequestReply);
        link.close().await;
        link.close().await;
        assert!(!link.is_open());
        assert!(link.request(&Command::get("a", "b")).await.is_err());
    }
}
