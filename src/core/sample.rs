//! Record schemas and sample decoding
//!
//! A [`Schema`] describes one record type: the marker that identifies it
//! (a leading byte for binary records, a text prefix for text records), the
//! fields to extract, an optional embedded checksum and an optional tick
//! field. [`SampleDecoder`] picks the schema for a chunk and produces an
//! immutable [`Sample`].

use crate::core::chunker::Chunk;
use crate::core::protocol::checksum::{xor_checksum, TrailingChecksum};
use crate::core::timebase::{CounterTimeBase, TimeBaseError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Sample decoding errors. None of these stop the stream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Embedded checksum does not match
    #[error("{kind}: checksum mismatch (computed {computed:#x}, carried {carried:#x})")]
    ChecksumMismatch {
        /// Record kind
        kind: String,
        /// Computed value
        computed: u32,
        /// Value carried in the record
        carried: u32,
    },

    /// Record is missing the checksum its schema requires
    #[error("{kind}: record carries no checksum")]
    MissingChecksum {
        /// Record kind
        kind: String,
    },

    /// No schema matches the record marker
    #[error("no schema for record starting with {0}")]
    UnknownRecord(String),

    /// A field could not be extracted
    #[error("{kind}.{field}: {reason}")]
    Field {
        /// Record kind
        kind: String,
        /// Field name
        field: String,
        /// What went wrong
        reason: String,
    },

    /// Tick field did not convert to a time
    #[error(transparent)]
    TimeBase(#[from] TimeBaseError),
}

/// A decoded field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Floating point
    Float(f64),
    /// Text
    Text(String),
}

impl FieldValue {
    /// Numeric value as f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::UInt(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    /// Non-negative integer value
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int(v) => u64::try_from(*v).ok(),
            Self::UInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Text value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::UInt(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Fixed-width binary field types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryType {
    U8,
    I8,
    U16Le,
    U16Be,
    I16Le,
    I16Be,
    U32Le,
    U32Be,
    I32Le,
    I32Be,
    F32Le,
    F32Be,
}

impl BinaryType {
    /// Width in bytes
    pub fn size(&self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16Le | Self::U16Be | Self::I16Le | Self::I16Be => 2,
            _ => 4,
        }
    }

    /// Read a value from exactly `size()` bytes
    fn read(&self, b: &[u8]) -> FieldValue {
        let b2 = || [b[0], b[1]];
        let b4 = || [b[0], b[1], b[2], b[3]];
        match self {
            Self::U8 => FieldValue::UInt(u64::from(b[0])),
            Self::I8 => FieldValue::Int(i64::from(b[0] as i8)),
            Self::U16Le => FieldValue::UInt(u64::from(u16::from_le_bytes(b2()))),
            Self::U16Be => FieldValue::UInt(u64::from(u16::from_be_bytes(b2()))),
            Self::I16Le => FieldValue::Int(i64::from(i16::from_le_bytes(b2()))),
            Self::I16Be => FieldValue::Int(i64::from(i16::from_be_bytes(b2()))),
            Self::U32Le => FieldValue::UInt(u64::from(u32::from_le_bytes(b4()))),
            Self::U32Be => FieldValue::UInt(u64::from(u32::from_be_bytes(b4()))),
            Self::I32Le => FieldValue::Int(i64::from(i32::from_le_bytes(b4()))),
            Self::I32Be => FieldValue::Int(i64::from(i32::from_be_bytes(b4()))),
            Self::F32Le => FieldValue::Float(f64::from(f32::from_le_bytes(b4()))),
            Self::F32Be => FieldValue::Float(f64::from(f32::from_be_bytes(b4()))),
        }
    }
}

/// Text token types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextType {
    /// Decimal integer
    Int,
    /// Decimal float
    Float,
    /// Hexadecimal unsigned integer
    Hex,
    /// Token kept as text
    Text,
}

impl TextType {
    fn parse(&self, token: &str) -> Result<FieldValue, String> {
        match self {
            Self::Int => token.parse().map(FieldValue::Int).map_err(|e| format!("{token:?}: {e}")),
            Self::Float => token.parse().map(FieldValue::Float).map_err(|e| format!("{token:?}: {e}")),
            Self::Hex => u64::from_str_radix(token, 16)
                .map(FieldValue::UInt)
                .map_err(|e| format!("{token:?}: {e}")),
            Self::Text => Ok(FieldValue::Text(token.to_string())),
        }
    }
}

/// Custom extraction function over the raw record
pub type ExtractFn = Arc<dyn Fn(&[u8]) -> Result<FieldValue, String> + Send + Sync>;

/// How a field is pulled out of a record
#[derive(Clone)]
pub enum Extractor {
    /// Fixed offset in a binary record
    Binary {
        /// Byte offset from the record start
        offset: usize,
        /// Value type
        ty: BinaryType,
    },
    /// Delimited token in a text record (token 0 is the prefix)
    Token {
        /// Token index
        index: usize,
        /// Value type
        ty: TextType,
    },
    /// Arbitrary function
    Custom(ExtractFn),
}

impl Extractor {
    /// Binary field at `offset`
    pub fn binary(offset: usize, ty: BinaryType) -> Self {
        Self::Binary { offset, ty }
    }

    /// Text token at `index`
    pub fn token(index: usize, ty: TextType) -> Self {
        Self::Token { index, ty }
    }

    /// Custom extractor
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&[u8]) -> Result<FieldValue, String> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }
}

impl fmt::Debug for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary { offset, ty } => write!(f, "Binary({offset}, {ty:?})"),
            Self::Token { index, ty } => write!(f, "Token({index}, {ty:?})"),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// One field of a schema
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Field name
    pub name: String,
    /// Extraction rule
    pub extractor: Extractor,
    /// Engineering unit, if any
    pub unit: Option<String>,
}

/// What identifies a record type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Marker {
    /// Leading byte of a binary record
    Byte(u8),
    /// Leading text of a text record
    Prefix(String),
}

impl Marker {
    /// Whether `record` starts with this marker
    pub fn matches(&self, record: &[u8]) -> bool {
        match self {
            Self::Byte(b) => record.first() == Some(b),
            Self::Prefix(p) => record.starts_with(p.as_bytes()),
        }
    }
}

/// Checksum embedded in a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordChecksum {
    /// Binary checksum in the trailing bytes
    Trailing(TrailingChecksum),
    /// NMEA style `*HH`: XOR of the bytes between `$` and `*`
    NmeaXor,
}

/// Layout of one record type
#[derive(Debug, Clone)]
pub struct Schema {
    /// Record kind, copied into every sample
    pub kind: String,
    /// Identifying marker
    pub marker: Marker,
    /// Fields in output order
    pub fields: Vec<FieldSpec>,
    /// Embedded checksum
    pub checksum: Option<RecordChecksum>,
    /// Field holding the hardware tick counter
    pub tick_field: Option<String>,
    /// Token delimiter for text records
    pub delimiter: u8,
}

impl Schema {
    /// Binary record identified by its first byte
    pub fn binary(kind: &str, marker: u8) -> Self {
        Self::with_marker(kind, Marker::Byte(marker))
    }

    /// Text record identified by a prefix
    pub fn text(kind: &str, prefix: &str) -> Self {
        Self::with_marker(kind, Marker::Prefix(prefix.to_string()))
    }

    fn with_marker(kind: &str, marker: Marker) -> Self {
        Self {
            kind: kind.to_string(),
            marker,
            fields: Vec::new(),
            checksum: None,
            tick_field: None,
            delimiter: b',',
        }
    }

    /// Add a field
    #[must_use]
    pub fn field(mut self, name: &str, extractor: Extractor) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            extractor,
            unit: None,
        });
        self
    }

    /// Add a field with a unit
    #[must_use]
    pub fn field_with_unit(mut self, name: &str, extractor: Extractor, unit: &str) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            extractor,
            unit: Some(unit.to_string()),
        });
        self
    }

    /// Set the embedded checksum
    #[must_use]
    pub fn checksum(mut self, checksum: RecordChecksum) -> Self {
        self.checksum = Some(checksum);
        self
    }

    /// Timestamp samples from this field through the counter time base
    #[must_use]
    pub fn tick_field(mut self, name: &str) -> Self {
        self.tick_field = Some(name.to_string());
        self
    }

    /// Set the text token delimiter
    #[must_use]
    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn is_text(&self) -> bool {
        matches!(self.marker, Marker::Prefix(_))
    }
}

/// A decoded record, immutable once built
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    /// Record kind
    pub kind: String,
    /// Field values in schema order
    pub fields: Vec<(String, FieldValue)>,
    /// Engineering units of the fields that declare one
    pub units: Vec<(String, String)>,
    /// Sample time
    pub timestamp: DateTime<Utc>,
    /// Stream offset of the record
    pub offset: u64,
}

impl Sample {
    /// Look up a field
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Engineering unit of a field
    pub fn unit(&self, name: &str) -> Option<&str> {
        self.units.iter().find(|(n, _)| n == name).map(|(_, u)| u.as_str())
    }

    /// Serialize as one JSON object
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind,
            "units": self
                .units
                .iter()
                .map(|(name, unit)| (name.clone(), serde_json::Value::from(unit.as_str())))
                .collect::<serde_json::Map<String, serde_json::Value>>(),
            "timestamp": self.timestamp.to_rfc3339(),
            "offset": self.offset,
            "values": self
                .fields
                .iter()
                .map(|(name, value)| (name.clone(), serde_json::to_value(value).unwrap_or_default()))
                .collect::<serde_json::Map<String, serde_json::Value>>(),
        })
    }
}

/// Schema-driven record decoder
#[derive(Debug, Clone, Default)]
pub struct SampleDecoder {
    schemas: Vec<Schema>,
}

impl SampleDecoder {
    /// Create a decoder
    pub fn new(schemas: Vec<Schema>) -> Self {
        Self { schemas }
    }

    /// Register another schema
    pub fn add_schema(&mut self, schema: Schema) {
        self.schemas.push(schema);
    }

    /// Registered schemas
    pub fn schemas(&self) -> &[Schema] {
        &self.schemas
    }

    /// Schema matching a record; the longest text prefix wins
    pub fn schema_for(&self, record: &[u8]) -> Option<&Schema> {
        self.schemas
            .iter()
            .filter(|s| s.marker.matches(record))
            .max_by_key(|s| match &s.marker {
                Marker::Byte(_) => 1,
                Marker::Prefix(p) => p.len(),
            })
    }

    /// Decode a chunk.
    ///
    /// The sample time comes from the tick field through `timebase` when the
    /// schema declares one, otherwise from `arrival`.
    pub fn decode(
        &self,
        chunk: &Chunk,
        timebase: Option<&mut CounterTimeBase>,
        arrival: DateTime<Utc>,
    ) -> Result<Sample, DecodeError> {
        let record = chunk.bytes.as_ref();
        let schema = self.schema_for(record).ok_or_else(|| {
            let head = &record[..record.len().min(8)];
            DecodeError::UnknownRecord(hex::encode(head))
        })?;

        let fields = if schema.is_text() {
            decode_text(schema, record)?
        } else {
            decode_binary(schema, record)?
        };

        let timestamp = match (&schema.tick_field, timebase) {
            (Some(name), Some(tb)) => {
                let tick = fields
                    .iter()
                    .find(|(n, _)| n == name)
                    .and_then(|(_, v)| v.as_u64())
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| field_error(schema, name, "tick field missing or not a 32-bit count"))?;
                tb.timestamp(tick)?
            }
            _ => arrival,
        };

        let units = schema
            .fields
            .iter()
            .filter_map(|spec| Some((spec.name.clone(), spec.unit.clone()?)))
            .collect();

        Ok(Sample {
            kind: schema.kind.clone(),
            fields,
            units,
            timestamp,
            offset: chunk.start_offset,
        })
    }
}

fn field_error(schema: &Schema, field: &str, reason: impl Into<String>) -> DecodeError {
    DecodeError::Field {
        kind: schema.kind.clone(),
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn decode_binary(schema: &Schema, record: &[u8]) -> Result<Vec<(String, FieldValue)>, DecodeError> {
    if let Some(RecordChecksum::Trailing(trailer)) = &schema.checksum {
        match trailer.check(record) {
            Some((computed, carried)) if computed != carried => {
                return Err(DecodeError::ChecksumMismatch {
                    kind: schema.kind.clone(),
                    computed,
                    carried,
                })
            }
            Some(_) => {}
            None => return Err(DecodeError::MissingChecksum { kind: schema.kind.clone() }),
        }
    }

    schema
        .fields
        .iter()
        .map(|spec| {
            let value = match &spec.extractor {
                Extractor::Binary { offset, ty } => record
                    .get(*offset..*offset + ty.size())
                    .map(|b| ty.read(b))
                    .ok_or_else(|| field_error(schema, &spec.name, format!("record too short ({} bytes)", record.len())))?,
                Extractor::Custom(f) => f(record).map_err(|e| field_error(schema, &spec.name, e))?,
                Extractor::Token { .. } => return Err(field_error(schema, &spec.name, "token extractor on a binary record")),
            };
            Ok((spec.name.clone(), value))
        })
        .collect()
}

fn decode_text(schema: &Schema, record: &[u8]) -> Result<Vec<(String, FieldValue)>, DecodeError> {
    let mut body = record;
    while let [rest @ .., b'\r' | b'\n'] = body {
        body = rest;
    }

    match &schema.checksum {
        Some(RecordChecksum::NmeaXor) => {
            body = verify_nmea(schema, body)?;
        }
        Some(RecordChecksum::Trailing(trailer)) => {
            let (computed, carried) = trailer
                .check(body)
                .ok_or_else(|| DecodeError::MissingChecksum { kind: schema.kind.clone() })?;
            if computed != carried {
                return Err(DecodeError::ChecksumMismatch {
                    kind: schema.kind.clone(),
                    computed,
                    carried,
                });
            }
            body = &body[..body.len() - trailer.algorithm.size()];
        }
        None => {}
    }

    let text = String::from_utf8_lossy(body);
    let tokens: Vec<&str> = text.split(char::from(schema.delimiter)).map(str::trim).collect();

    schema
        .fields
        .iter()
        .map(|spec| {
            let value = match &spec.extractor {
                Extractor::Token { index, ty } => {
                    let token = tokens
                        .get(*index)
                        .ok_or_else(|| field_error(schema, &spec.name, format!("only {} tokens", tokens.len())))?;
                    ty.parse(token).map_err(|e| field_error(schema, &spec.name, e))?
                }
                Extractor::Custom(f) => f(record).map_err(|e| field_error(schema, &spec.name, e))?,
                Extractor::Binary { offset, ty } => record
                    .get(*offset..*offset + ty.size())
                    .map(|b| ty.read(b))
                    .ok_or_else(|| field_error(schema, &spec.name, "record too short"))?,
            };
            Ok((spec.name.clone(), value))
        })
        .collect()
}

/// Check a `$...*HH` sentence and return it without the checksum suffix
fn verify_nmea<'a>(schema: &Schema, body: &'a [u8]) -> Result<&'a [u8], DecodeError> {
    let missing = || DecodeError::MissingChecksum { kind: schema.kind.clone() };
    let star = body.iter().rposition(|&b| b == b'*').ok_or_else(missing)?;
    let carried = std::str::from_utf8(&body[star + 1..])
        .ok()
        .and_then(|s| u8::from_str_radix(s.trim(), 16).ok())
        .ok_or_else(missing)?;

    let start = usize::from(body.first() == Some(&b'$'));
    let computed = xor_checksum(&body[start..star], &[]);
    if computed != carried {
        return Err(DecodeError::ChecksumMismatch {
            kind: schema.kind.clone(),
            computed: u32::from(computed),
            carried: u32::from(carried),
        });
    }
    Ok(&body[..star])
}
