//! Time-series point model shared by the transformer registry, the dedup
//! cache, and the writer.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A field value on a time-series point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    Text(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Boolean(v) => write!(f, "{}", v),
            FieldValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

/// One measurement-DB observation: measurement name, tags, timestamp, fields.
///
/// Tags and fields live in ordered maps so that rendering and fingerprinting
/// are deterministic regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: Option<DateTime<Utc>>,
}

impl Point {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp: None,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn has_fields(&self) -> bool {
        !self.fields.is_empty()
    }

    fn timestamp_nanos(&self) -> Option<i64> {
        self.timestamp.map(|ts| {
            ts.timestamp_nanos_opt()
                .unwrap_or_else(|| ts.timestamp_micros().saturating_mul(1_000))
        })
    }

    /// Deterministic dedup identity: SHA-256 over
    /// `measurement|sorted tags|timestamp|sorted fields`, truncated to 16 hex
    /// chars. Permuting tag or field insertion order does not change the
    /// digest because both maps iterate in key order.
    pub fn fingerprint(&self) -> String {
        let mut parts: Vec<String> = vec![self.measurement.clone()];

        if !self.tags.is_empty() {
            let tag_str = self
                .tags
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("|");
            parts.push(tag_str);
        }

        if let Some(nanos) = self.timestamp_nanos() {
            parts.push(nanos.to_string());
        }

        if !self.fields.is_empty() {
            let field_str = self
                .fields
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("|");
            parts.push(field_str);
        }

        let digest = Sha256::digest(parts.join("|").as_bytes());
        let mut hex = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            hex.push_str(&format!("{:02x}", byte));
        }
        hex
    }

    /// Render the point as one InfluxDB line-protocol line.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape_measurement(&self.measurement);

        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape_tag(key));
            line.push('=');
            line.push_str(&escape_tag(value));
        }

        line.push(' ');
        let fields = self
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", escape_tag(k), render_field(v)))
            .collect::<Vec<_>>()
            .join(",");
        line.push_str(&fields);

        if let Some(nanos) = self.timestamp_nanos() {
            line.push(' ');
            line.push_str(&nanos.to_string());
        }

        line
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

fn render_field(value: &FieldValue) -> String {
    match value {
        FieldValue::Float(v) => format!("{}", v),
        FieldValue::Integer(v) => format!("{}i", v),
        FieldValue::Boolean(v) => if *v { "t" } else { "f" }.to_string(),
        FieldValue::Text(v) => format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")),
    }
}
