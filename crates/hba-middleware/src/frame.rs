//! Frame Decoder – cuts a daemon byte stream into replies and records.
//!
//! | Mode | Terminator | Unit |
//! |---|---|---|
//! | [`FramingMode::RequestReply`] | `\` | [`Reply`] – text, newlines kept as content |
//! | [`FramingMode::Stream`] | `\n` | [`Record`] – whitespace-separated fields |
//!
//! The terminator is never part of the decoded unit.  A closed connection
//! surfaces as [`HbaError::LinkClosed`]; the decoder never retries.

use hba_types::{FramingMode, HbaError, Record, Reply};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::trace;

/// Incremental decoder over a buffered byte source.
pub struct FrameDecoder<R> {
    reader: R,
    mode: FramingMode,
    label: String,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> FrameDecoder<R> {
    /// `label` names the link in errors and logs.
    pub fn new(reader: R, mode: FramingMode, label: impl Into<String>) -> Self {
        Self {
            reader,
            mode,
            label: label.into(),
            buf: Vec::with_capacity(64),
        }
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    /// Wait until at least one byte is buffered.
    ///
    /// Returns `false` at end of stream.  Cancel-safe, so it can sit in a
    /// `select!` next to other links.
    pub async fn ready(&mut self) -> Result<bool, HbaError> {
        let available = self.reader.fill_buf().await.map_err(|source| HbaError::Io {
            link: self.label.clone(),
            source,
        })?;
        Ok(!available.is_empty())
    }

    /// Decode the next request/response reply.
    pub async fn next_reply(&mut self) -> Result<Reply, HbaError> {
        self.require(FramingMode::RequestReply)?;
        let text = self.next_frame().await?;
        Ok(Reply(text))
    }

    /// Decode the next stream record.
    pub async fn next_record(&mut self) -> Result<Record, HbaError> {
        self.require(FramingMode::Stream)?;
        let text = self.next_frame().await?;
        Ok(Record::from_line(&text))
    }

    fn require(&self, mode: FramingMode) -> Result<(), HbaError> {
        if self.mode == mode {
            Ok(())
        } else {
            Err(HbaError::WrongMode {
                link: self.label.clone(),
                mode: self.mode,
            })
        }
    }

    async fn next_frame(&mut self) -> Result<String, HbaError> {
        let terminator = self.mode.terminator();
        self.buf.clear();
        let n = self
            .reader
            .read_until(terminator, &mut self.buf)
            .await
            .map_err(|source| HbaError::Io {
                link: self.label.clone(),
                source,
            })?;

        // EOF, or EOF in the middle of a frame: the partial frame is dropped.
        if n == 0 || self.buf.last() != Some(&terminator) {
            return Err(HbaError::LinkClosed {
                link: self.label.clone(),
            });
        }
        self.buf.pop();

        let text = String::from_utf8_lossy(&self.buf).into_owned();
        trace!(link = %self.label, frame = %text.escape_debug(), "frame decoded");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn decoder(bytes: &'static [u8], mode: FramingMode) -> FrameDecoder<BufReader<&'static [u8]>> {
        FrameDecoder::new(BufReader::new(bytes), mode, "test")
    }

    #[tokio::test]
    async fn reply_stops_at_sentinel_and_keeps_newlines() {
        let mut dec = decoder(b"ttyS0\n115200\n\\1f\n\\", FramingMode::RequestReply);
        assert_eq!(dec.next_reply().await.unwrap().text(), "ttyS0\n115200\n");
        assert_eq!(dec.next_reply().await.unwrap().value(), "1f");
    }

    #[tokio::test]
    async fn reply_round_trip() {
        for text in ["", "ok", "port\nconfig", "a b  c\n"] {
            let wire: &'static [u8] = Box::leak(format!("{text}\\").into_bytes().into_boxed_slice());
            let mut dec = decoder(wire, FramingMode::RequestReply);
            assert_eq!(dec.next_reply().await.unwrap().text(), text);
        }
    }

    #[tokio::test]
    async fn stream_record_round_trip() {
        for fields in [vec!["ff", "00"], vec!["ffce"], vec![]] {
            let wire = format!("{}\n", fields.join(" "));
            let wire: &'static [u8] = Box::leak(wire.into_bytes().into_boxed_slice());
            let mut dec = decoder(wire, FramingMode::Stream);
            let record = dec.next_record().await.unwrap();
            assert_eq!(record.fields, fields);
        }
    }

    #[tokio::test]
    async fn empty_line_is_an_empty_record() {
        let mut dec = decoder(b"\n00 00\n", FramingMode::Stream);
        assert!(dec.next_record().await.unwrap().is_empty());
        assert_eq!(dec.next_record().await.unwrap().fields, vec!["00", "00"]);
    }

    #[tokio::test]
    async fn eof_is_link_closed() {
        let mut dec = decoder(b"", FramingMode::Stream);
        assert!(dec.next_record().await.unwrap_err().is_link_closed());

        let mut partial = decoder(b"ff 0", FramingMode::Stream);
        assert!(partial.next_record().await.unwrap_err().is_link_closed());
    }

    #[tokio::test]
    async fn wrong_mode_is_rejected() {
        let mut dec = decoder(b"ff\n", FramingMode::Stream);
        assert!(matches!(dec.next_reply().await, Err(HbaError::WrongMode { .. })));
    }

    #[tokio::test]
    async fn ready_reports_eof() {
        let mut dec = decoder(b"01\n", FramingMode::Stream);
        assert!(dec.ready().await.unwrap());
        dec.next_record().await.unwrap();
        assert!(!dec.ready().await.unwrap());
    }
}
