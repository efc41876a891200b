//! Raw sensor batches: envelope decoding and strict payload parsing.
//!
//! A raw object holds a sequence of envelope records. The sensor payload
//! travels as bytes in the envelope's `Body` field and is parsed into a typed
//! [`RawRecord`]; payload text is never interpreted beyond that schema.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const BODY_KEY: &str = "Body";
pub const RAW_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("envelope line {line} is not a JSON object: {message}")]
    Envelope { line: usize, message: String },
    #[error("envelope field {field} has unsupported type")]
    BodyType { field: &'static str },
    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("payload does not match the sensor record schema: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("invalid timestamp '{value}' (expected YYYY-MM-DD HH:MM:SS.ffffff)")]
    Timestamp { value: String },
}

/// One decoded record from a raw object: field name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvelopeRecord {
    fields: Map<String, Value>,
}

impl EnvelopeRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn with_body(body: impl AsRef<[u8]>) -> Self {
        let mut fields = Map::new();
        fields.insert(
            BODY_KEY.to_string(),
            Value::String(String::from_utf8_lossy(body.as_ref()).to_string()),
        );
        Self { fields }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Payload bytes of the `Body` field.
    ///
    /// Bodies are carried either as a string or as an array of byte values.
    pub fn body_bytes(&self) -> Result<Option<Vec<u8>>, DecodeError> {
        match self.fields.get(BODY_KEY) {
            None => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.as_bytes().to_vec())),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|byte| u8::try_from(byte).ok())
                        .ok_or(DecodeError::BodyType { field: BODY_KEY })
                })
                .collect::<Result<Vec<u8>, _>>()
                .map(Some),
            Some(_) => Err(DecodeError::BodyType { field: BODY_KEY }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub timestamp: String,
    pub power_usage: f64,
    pub voltage: f64,
    pub current: f64,
}

impl RawRecord {
    pub fn from_payload(bytes: &[u8]) -> Result<Self, DecodeError> {
        let text = String::from_utf8(bytes.to_vec())?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Decoder for the structured-record container format of raw objects.
pub trait RecordDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<EnvelopeRecord>, DecodeError>;
}

/// One JSON envelope object per line; blank lines are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesDecoder;

impl RecordDecoder for JsonLinesDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<EnvelopeRecord>, DecodeError> {
        let text = String::from_utf8(bytes.to_vec())?;
        let mut records = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let value: Value =
                serde_json::from_str(line).map_err(|err| DecodeError::Envelope {
                    line: idx + 1,
                    message: err.to_string(),
                })?;
            match value {
                Value::Object(fields) => records.push(EnvelopeRecord::new(fields)),
                other => {
                    return Err(DecodeError::Envelope {
                        line: idx + 1,
                        message: format!("expected object, found {other}"),
                    })
                }
            }
        }
        Ok(records)
    }
}

/// Encodes records in the format [`JsonLinesDecoder`] reads.
pub fn encode_json_lines(records: &[EnvelopeRecord]) -> Vec<u8> {
    let mut out = String::new();
    for record in records {
        out.push_str(&Value::Object(record.fields.clone()).to_string());
        out.push('\n');
    }
    out.into_bytes()
}
