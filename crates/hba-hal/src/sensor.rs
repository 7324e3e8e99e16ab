//! Typed sensor readings decoded from stream [`Record`]s.
//!
//! The daemon streams every peripheral as whitespace separated hex fields.
//! [`decode`] turns those into a [`SensorReading`] according to the channel
//! the record arrived on.  Channels this crate does not know about are passed
//! through as [`SensorReading::Raw`].

use hba_types::{Channel, HbaError, Record, decode_signed};
use serde::Serialize;
use tracing::trace;

/// Value of a line sensor whose bits are all asserted (the table edge).
pub const LINE_EDGE: u8 = 0xff;

/// A decoded sensor sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorReading {
    /// Both QTR line sensors, one 8-bit mask each.
    Line { qtr0: u8, qtr1: u8 },
    /// One quadrature encoder, sign extended from 16 bits.
    Encoder { count: i32 },
    /// Both encoders read through the combined `enc` register.
    EncoderPair { enc0: i32, enc1: i32 },
    /// Push button bitmap.
    Buttons { mask: u8 },
    /// Sonar echo distance in the peripheral's native units.
    Sonar { distance: u32 },
    /// Fields of a channel with no known layout.
    Raw { fields: Vec<String> },
}

impl SensorReading {
    /// True for a line reading with either sensor fully triggered.
    pub fn is_edge(&self) -> bool {
        matches!(self, SensorReading::Line { qtr0, qtr1 } if *qtr0 == LINE_EDGE || *qtr1 == LINE_EDGE)
    }

    pub fn encoder_count(&self) -> Option<i32> {
        match self {
            SensorReading::Encoder { count } => Some(*count),
            _ => None,
        }
    }
}

/// Record layout of a known streaming register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Line,
    Encoder,
    EncoderPair,
    Buttons,
    Sonar,
}

impl SensorKind {
    pub fn of(channel: &Channel) -> Option<SensorKind> {
        let kind = match (channel.peripheral.as_str(), channel.register.as_str()) {
            ("hba_qtr", "qtr") => SensorKind::Line,
            ("hba_quad", "enc0" | "enc1") => SensorKind::Encoder,
            ("hba_quad", "enc") => SensorKind::EncoderPair,
            ("hba_basicio", "buttons") => SensorKind::Buttons,
            ("hba_sonar", "sonar0" | "sonar1") => SensorKind::Sonar,
            _ => return None,
        };
        Some(kind)
    }

    fn field_count(self) -> usize {
        match self {
            SensorKind::Line | SensorKind::EncoderPair => 2,
            SensorKind::Encoder | SensorKind::Buttons | SensorKind::Sonar => 1,
        }
    }
}

/// Decode one stream record of `channel`.
///
/// Returns `Ok(None)` for an empty record, which is valid but carries
/// nothing to act on.
///
/// # Errors
///
/// [`HbaError::Decode`] when a known channel's record has the wrong number
/// of fields or a field that is not hex of the expected width.
pub fn decode(channel: &Channel, record: &Record) -> Result<Option<SensorReading>, HbaError> {
    if record.is_empty() {
        return Ok(None);
    }
    let Some(kind) = SensorKind::of(channel) else {
        trace!(%channel, %record, "no known layout, passing raw fields");
        return Ok(Some(SensorReading::Raw {
            fields: record.fields.clone(),
        }));
    };
    decode_known(kind, record)
        .map(Some)
        .map_err(|e| e.on_channel(channel))
}

fn decode_known(kind: SensorKind, record: &Record) -> Result<SensorReading, HbaError> {
    record.expect_fields(kind.field_count())?;
    let reading = match kind {
        SensorKind::Line => SensorReading::Line {
            qtr0: byte_field(record, 0)?,
            qtr1: byte_field(record, 1)?,
        },
        SensorKind::Encoder => SensorReading::Encoder {
            count: decode_signed(record.hex_field(0)?),
        },
        SensorKind::EncoderPair => SensorReading::EncoderPair {
            enc0: decode_signed(record.hex_field(0)?),
            enc1: decode_signed(record.hex_field(1)?),
        },
        SensorKind::Buttons => SensorReading::Buttons {
            mask: byte_field(record, 0)?,
        },
        SensorKind::Sonar => SensorReading::Sonar {
            distance: record.hex_field(0)?,
        },
    };
    Ok(reading)
}

fn byte_field(record: &Record, index: usize) -> Result<u8, HbaError> {
    let value = record.hex_field(index)?;
    u8::try_from(value).map_err(|_| HbaError::InvalidHex(record.fields[index].clone()))
}
