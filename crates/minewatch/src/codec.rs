//! Telemetry payload decoding and encoding.
//!
//! Inbound messages are JSON objects carrying `helmet_id`, the six sensor
//! values and an optional `timestamp`. Unknown fields are ignored so newer
//! firmware can add fields without breaking older pipelines.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Map, Number, Value};
use thiserror::Error;
use tracing::trace;

use crate::reading::{Dimension, Reading, SensorValues};

/// Numeric timestamps below this are taken as epoch seconds rather than millis.
const EPOCH_MILLIS_FLOOR: f64 = 1e11;

/// Errors raised while decoding an inbound payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload is not a JSON object.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A required field is absent or null.
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    /// The helmet id is not a non-empty string.
    #[error("invalid helmet_id: {0}")]
    InvalidHelmetId(String),

    /// A sensor field is present but not a number.
    #[error("field '{field}' is not numeric: {found}")]
    NotNumeric {
        /// The offending field.
        field: &'static str,
        /// What was found instead.
        found: String,
    },

    /// A sensor value is outside its physical range.
    #[error("field '{field}' out of range: {value} not in [{min}, {max}]")]
    OutOfRange {
        /// The offending field.
        field: &'static str,
        /// The decoded value.
        value: f64,
        /// Lower physical bound.
        min: f64,
        /// Upper physical bound.
        max: f64,
    },

    /// The timestamp is neither epoch time nor ISO-8601.
    #[error("unparseable timestamp: {0}")]
    InvalidTimestamp(String),
}

#[derive(Debug, Deserialize)]
struct RawPayload {
    helmet_id: Option<Value>,
    co2: Option<Value>,
    ch4: Option<Value>,
    o2: Option<Value>,
    h2s: Option<Value>,
    temp: Option<Value>,
    humidity: Option<Value>,
    timestamp: Option<Value>,
}

impl RawPayload {
    fn field(&self, dimension: Dimension) -> Option<&Value> {
        match dimension {
            Dimension::Co2 => self.co2.as_ref(),
            Dimension::Ch4 => self.ch4.as_ref(),
            Dimension::O2 => self.o2.as_ref(),
            Dimension::H2s => self.h2s.as_ref(),
            Dimension::Temp => self.temp.as_ref(),
            Dimension::Humidity => self.humidity.as_ref(),
        }
    }
}

/// Decode a raw payload received on `topic` into a live reading.
///
/// `received_at` stamps readings whose payload carries no timestamp.
///
/// # Errors
///
/// Returns a [`DecodeError`] if the payload is not a JSON object, a required
/// field is missing, a value is non-numeric or physically impossible, or the
/// timestamp cannot be parsed.
pub fn decode(
    topic: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<Reading, DecodeError> {
    let raw: RawPayload = serde_json::from_slice(payload)?;

    let helmet_id = match raw.helmet_id.as_ref() {
        None | Some(Value::Null) => return Err(DecodeError::MissingField("helmet_id")),
        Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
        Some(other) => return Err(DecodeError::InvalidHelmetId(other.to_string())),
    };

    let mut values = SensorValues {
        co2: 0.0,
        ch4: 0.0,
        o2: 0.0,
        h2s: 0.0,
        temp: 0.0,
        humidity: 0.0,
    };
    for dimension in Dimension::ALL {
        values.set(dimension, decode_value(dimension, raw.field(dimension))?);
    }

    let timestamp = match raw.timestamp.as_ref() {
        None | Some(Value::Null) => received_at,
        Some(value) => parse_timestamp(value)?,
    };

    trace!(topic, helmet_id = %helmet_id, "decoded telemetry payload");
    Ok(Reading::live(helmet_id, values, timestamp))
}

fn decode_value(dimension: Dimension, value: Option<&Value>) -> Result<f64, DecodeError> {
    let field = dimension.field();
    let value = match value {
        None | Some(Value::Null) => return Err(DecodeError::MissingField(field)),
        Some(Value::Number(n)) => n.as_f64().ok_or_else(|| DecodeError::NotNumeric {
            field,
            found: n.to_string(),
        })?,
        Some(other) => {
            return Err(DecodeError::NotNumeric {
                field,
                found: other.to_string(),
            })
        }
    };

    let range = dimension.physical_range();
    if !value.is_finite() || !range.contains(&value) {
        return Err(DecodeError::OutOfRange {
            field,
            value,
            min: *range.start(),
            max: *range.end(),
        });
    }
    Ok(value)
}

/// Parse an epoch (millis or seconds, numeric or as a string) or ISO-8601 timestamp.
///
/// # Errors
///
/// Returns [`DecodeError::InvalidTimestamp`] if the value cannot be interpreted.
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, DecodeError> {
    let invalid = || DecodeError::InvalidTimestamp(value.to_string());
    match value {
        Value::Number(n) => n.as_f64().and_then(from_epoch).ok_or_else(invalid),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(raw) = s.parse::<f64>() {
                return from_epoch(raw).ok_or_else(invalid);
            }
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Ok(ts.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                .map(|naive| naive.and_utc())
                .map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

/// Epoch milliseconds, or epoch seconds below [`EPOCH_MILLIS_FLOOR`].
fn from_epoch(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    let millis = if raw < EPOCH_MILLIS_FLOOR {
        raw * 1000.0
    } else {
        raw
    };
    #[allow(clippy::cast_possible_truncation)]
    let millis = millis.round() as i64;
    Utc.timestamp_millis_opt(millis).single()
}

/// Encode a reading in the inbound wire shape.
///
/// The timestamp is written as epoch milliseconds.
#[must_use]
pub fn encode(reading: &Reading) -> Vec<u8> {
    let mut object = Map::new();
    object.insert("helmet_id".to_string(), Value::String(reading.helmet_id.clone()));
    for dimension in Dimension::ALL {
        let number = Number::from_f64(reading.values.get(dimension)).unwrap_or_else(|| 0.into());
        object.insert(dimension.field().to_string(), Value::Number(number));
    }
    object.insert(
        "timestamp".to_string(),
        Value::Number(reading.timestamp.timestamp_millis().into()),
    );
    Value::Object(object).to_string().into_bytes()
}
