//! `hba-types` – shared vocabulary of the HBA robot stack.
//!
//! Every other crate speaks in terms of these types: a [`Channel`] names a
//! `(peripheral, register)` pair on the hardware daemon, a [`Command`] is one
//! text line sent to it, and the daemon answers with either a [`Reply`]
//! (request/response) or an unbounded sequence of [`Record`]s (stream).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminator of a request/response reply (a literal backslash).
pub const REPLY_SENTINEL: u8 = b'\\';

/// Terminator of one streamed record.
pub const RECORD_TERMINATOR: u8 = b'\n';

/// Default daemon address.
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8870;

// ─────────────────────────────────────────────────────────────────────────────
// Channel
// ─────────────────────────────────────────────────────────────────────────────

/// A logical `(peripheral, register)` pair, written `peripheral.register`
/// (e.g. `hba_qtr.qtr`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Channel {
    pub peripheral: String,
    pub register: String,
}

impl Channel {
    pub fn new(peripheral: impl Into<String>, register: impl Into<String>) -> Self {
        Self {
            peripheral: peripheral.into(),
            register: register.into(),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.peripheral, self.register)
    }
}

impl FromStr for Channel {
    type Err = HbaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((p, r)) if is_word(p) && is_word(r) => Ok(Channel::new(p, r)),
            _ => Err(HbaError::InvalidChannel(s.to_string())),
        }
    }
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && !s.contains(char::is_whitespace) && !s.contains('.')
}

// ─────────────────────────────────────────────────────────────────────────────
// Command
// ─────────────────────────────────────────────────────────────────────────────

/// One command line of the daemon protocol.
///
/// `Display` renders the line without its trailing newline; use
/// [`Command::to_line`] for the bytes that go on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "lowercase")]
pub enum Command {
    /// `hbaset <peripheral> <register> <value>`
    Set { channel: Channel, value: String },
    /// `hbaget <peripheral> <register>`
    Get { channel: Channel },
    /// `hbacat <peripheral> <register>` – turns the connection into a stream.
    Cat { channel: Channel },
}

impl Command {
    pub fn set(peripheral: &str, register: &str, value: impl Into<String>) -> Self {
        Command::Set {
            channel: Channel::new(peripheral, register),
            value: value.into(),
        }
    }

    pub fn get(peripheral: &str, register: &str) -> Self {
        Command::Get {
            channel: Channel::new(peripheral, register),
        }
    }

    pub fn cat(channel: Channel) -> Self {
        Command::Cat { channel }
    }

    /// The channel this command addresses.
    pub fn channel(&self) -> &Channel {
        match self {
            Command::Set { channel, .. } | Command::Get { channel } | Command::Cat { channel } => {
                channel
            }
        }
    }

    /// Framing of the daemon's answer to this command.
    pub fn framing(&self) -> FramingMode {
        match self {
            Command::Cat { .. } => FramingMode::Stream,
            _ => FramingMode::RequestReply,
        }
    }

    /// Wire representation, newline terminated.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Set { channel, value } => {
                write!(f, "hbaset {} {} {}", channel.peripheral, channel.register, value)
            }
            Command::Get { channel } => {
                write!(f, "hbaget {} {}", channel.peripheral, channel.register)
            }
            Command::Cat { channel } => {
                write!(f, "hbacat {} {}", channel.peripheral, channel.register)
            }
        }
    }
}

impl FromStr for Command {
    type Err = HbaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = s.split_whitespace().collect();
        match words.as_slice() {
            ["hbaset", p, r, v] => Ok(Command::set(p, r, *v)),
            ["hbaget", p, r] => Ok(Command::get(p, r)),
            ["hbacat", p, r] => Ok(Command::cat(Channel::new(*p, *r))),
            _ => Err(HbaError::InvalidCommand(s.trim().to_string())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Framing and decoded units
// ─────────────────────────────────────────────────────────────────────────────

/// How the bytes coming back on a link are cut into units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FramingMode {
    /// Arbitrary text terminated by [`REPLY_SENTINEL`].
    RequestReply,
    /// Newline-terminated, whitespace-separated hex fields.
    Stream,
}

impl FramingMode {
    pub fn terminator(self) -> u8 {
        match self {
            FramingMode::RequestReply => REPLY_SENTINEL,
            FramingMode::Stream => RECORD_TERMINATOR,
        }
    }
}

impl fmt::Display for FramingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingMode::RequestReply => f.write_str("request-reply"),
            FramingMode::Stream => f.write_str("stream"),
        }
    }
}

/// Text of a request/response reply, sentinel excluded.
///
/// Newlines inside the reply are content, so a reply may carry several
/// logical lines (e.g. `"port\nconfig"`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Reply(pub String);

impl Reply {
    pub fn text(&self) -> &str {
        &self.0
    }

    /// The reply with surrounding whitespace removed; the register value for
    /// an `hbaget`.
    pub fn value(&self) -> &str {
        self.0.trim()
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.0.lines().filter(|l| !l.trim().is_empty())
    }
}

/// One streamed sample: the whitespace-separated fields of a record line.
///
/// An empty record is valid and simply uninteresting.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Record {
    pub fields: Vec<String>,
}

impl Record {
    pub fn from_line(line: &str) -> Self {
        Self {
            fields: line.split_whitespace().map(str::to_string).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parse field `index` as unsigned hex.
    pub fn hex_field(&self, index: usize) -> Result<u32, HbaError> {
        let field = self
            .fields
            .get(index)
            .ok_or(HbaError::MissingField(index))?;
        parse_hex(field)
    }

    /// Require exactly `count` fields.
    pub fn expect_fields(&self, count: usize) -> Result<(), HbaError> {
        if self.fields.len() == count {
            Ok(())
        } else {
            Err(HbaError::FieldCount {
                expected: count,
                actual: self.fields.len(),
            })
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fields.join(" "))
    }
}

/// Commands that switch a channel's hardware stream on and off.
///
/// `enable` is issued on the 0→1 listener transition, `disable` on 1→0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelProfile {
    pub enable: Vec<Command>,
    pub disable: Vec<Command>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Numeric encodings
// ─────────────────────────────────────────────────────────────────────────────

/// Parse an unsigned hex register value (no `0x` prefix on the wire, but one
/// is tolerated).
pub fn parse_hex(s: &str) -> Result<u32, HbaError> {
    let digits = s
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    if digits.is_empty() {
        return Err(HbaError::InvalidHex(s.to_string()));
    }
    u32::from_str_radix(digits, 16).map_err(|_| HbaError::InvalidHex(s.to_string()))
}

/// Sign-extend a 16-bit two's-complement register value.
///
/// Bits above 15 are ignored.
pub fn decode_signed(value: u32) -> i32 {
    -((value & 0x8000) as i32) | (value & 0x7fff) as i32
}

/// Format an unsigned value the way the daemon expects it.
pub fn encode_hex(value: u32) -> String {
    format!("{value:x}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error type shared by every HBA crate.
#[derive(Error, Debug)]
pub enum HbaError {
    #[error("Cannot reach hba daemon at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Link closed: {link}")]
    LinkClosed { link: String },

    #[error("I/O error on {link}: {source}")]
    Io {
        link: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Link {link} is a {mode} link")]
    WrongMode { link: String, mode: FramingMode },

    #[error("Malformed record on {channel}: {details}")]
    Decode { channel: Channel, details: String },

    #[error("Not a hex value: {0:?}")]
    InvalidHex(String),

    #[error("Expected {expected} field(s), got {actual}")]
    FieldCount { expected: usize, actual: usize },

    #[error("Record has no field {0}")]
    MissingField(usize),

    #[error("Invalid channel {0:?} (expected peripheral.register)")]
    InvalidChannel(String),

    #[error("Invalid command: {0:?}")]
    InvalidCommand(String),

    #[error("Unknown listener token {0}")]
    UnknownListener(u64),

    #[error("Event bus is shut down")]
    ShutDown,
}

impl HbaError {
    /// Wrap a field-level problem with the channel it was seen on.
    pub fn on_channel(self, channel: &Channel) -> HbaError {
        match self {
            HbaError::Decode { .. } => self,
            other => HbaError::Decode {
                channel: channel.clone(),
                details: other.to_string(),
            },
        }
    }

    /// True when the error means the underlying connection is gone.
    pub fn is_link_closed(&self) -> bool {
        matches!(self, HbaError::LinkClosed { .. })
    }
}
