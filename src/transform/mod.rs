//! Transformer registry: turns raw ingest payloads into time-series points.
//!
//! Payloads arrive in one of three shapes (nested metrics, flat list, single
//! metric). The registry flattens them into per-sample items, validates each
//! item against a schema template, and dispatches to the first transformer
//! whose `can_transform` accepts the metric name. The terminal generic
//! transformer accepts everything, so dispatch always resolves.

mod activity;
mod audio;
mod body;
mod generic;
mod heart;
mod mobility;
mod schema;
mod sleep;
mod vitals;
mod workout;

pub use schema::ValidationFailure;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::point::Point;

pub type Item = serde_json::Map<String, Value>;

/// Errors the registry can surface for a whole payload. Per-item problems are
/// logged and skipped instead.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unsupported payload shape: {0}")]
    UnsupportedPayload(&'static str),
}

/// A typed transformer producing points from one normalized sample item.
pub trait Transformer: Send + Sync {
    fn measurement(&self) -> &'static str;
    fn can_transform(&self, metric_name: &str) -> bool;
    fn transform(&self, item: &Item) -> Vec<Point>;
}

/// Registry with priority-based routing (more specific transformers first).
pub struct TransformerRegistry {
    transformers: Vec<Box<dyn Transformer>>,
}

impl TransformerRegistry {
    pub fn new(default_source: &str) -> Self {
        let transformers: Vec<Box<dyn Transformer>> = vec![
            Box::new(heart::HeartTransformer::new(default_source)),
            Box::new(mobility::MobilityTransformer::new(default_source)),
            Box::new(activity::ActivityTransformer::new(default_source)),
            Box::new(sleep::SleepTransformer::new(default_source)),
            Box::new(workout::WorkoutTransformer::new(default_source)),
            Box::new(body::BodyTransformer::new(default_source)),
            Box::new(vitals::VitalsTransformer::new(default_source)),
            Box::new(audio::AudioTransformer::new(default_source)),
            // Generic transformer is always last (catches everything).
            Box::new(generic::GenericTransformer::new(default_source)),
        ];
        Self { transformers }
    }

    fn transformer_for(&self, metric_name: &str) -> &dyn Transformer {
        for transformer in &self.transformers {
            if transformer.can_transform(metric_name) {
                debug!(
                    metric_name,
                    measurement = transformer.measurement(),
                    "transformer selected"
                );
                return transformer.as_ref();
            }
        }
        // Unreachable in practice: the generic transformer accepts everything.
        self.transformers.last().expect("registry is non-empty").as_ref()
    }

    /// Transform a payload into points. An empty result for a non-empty
    /// payload means "nothing interpretable" and is not an error.
    pub fn transform(&self, data: &Value) -> Result<Vec<Point>, TransformError> {
        let items = normalize_payload(data)?;
        let (valid, failures) = schema::validate_items(items);

        for failure in &failures {
            warn!(
                schema = failure.schema,
                error = %failure.error,
                metric_name = failure.metric_name.as_deref().unwrap_or("-"),
                "metric schema validation failed"
            );
        }

        let mut points = Vec::new();
        for item in &valid {
            let Some(metric_name) = extract_metric_name(item) else {
                warn!("no metric name found in item");
                continue;
            };
            points.extend(self.transformer_for(&metric_name).transform(item));
        }

        Ok(points)
    }
}

/// Flatten any accepted payload shape into individual sample items.
///
/// Nested shape propagates the outer metric name and units into each sample:
/// `{"data": {"metrics": [{"name", "units", "data": [{...}, ...]}]}}`.
/// Flat shape merges top-level keys into each list element:
/// `{"data": [{...}, ...]}`. Anything else is treated as a single metric.
fn normalize_payload(data: &Value) -> Result<Vec<Item>, TransformError> {
    let Some(obj) = data.as_object() else {
        return Err(TransformError::UnsupportedPayload("payload is not a JSON object"));
    };

    match obj.get("data") {
        Some(Value::Object(inner)) if inner.contains_key("metrics") => {
            let mut items = Vec::new();
            let metrics = inner.get("metrics").and_then(Value::as_array);
            for metric in metrics.into_iter().flatten() {
                let Some(metric) = metric.as_object() else {
                    continue;
                };
                let name = metric.get("name").and_then(Value::as_str).unwrap_or("");
                let units = metric.get("units").and_then(Value::as_str).unwrap_or("");
                for sample in metric.get("data").and_then(Value::as_array).into_iter().flatten() {
                    let Some(sample) = sample.as_object() else {
                        continue;
                    };
                    let mut item = sample.clone();
                    item.insert("name".to_string(), Value::String(name.to_string()));
                    if !units.is_empty() {
                        item.entry("units".to_string())
                            .or_insert_with(|| Value::String(units.to_string()));
                    }
                    items.push(item);
                }
            }
            Ok(items)
        }
        Some(Value::Array(list)) => {
            let base: Item = obj
                .iter()
                .filter(|(k, _)| k.as_str() != "data")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Ok(list
                .iter()
                .filter_map(Value::as_object)
                .map(|sample| {
                    let mut item = base.clone();
                    for (k, v) in sample {
                        item.insert(k.clone(), v.clone());
                    }
                    item
                })
                .collect())
        }
        _ => Ok(vec![obj.clone()]),
    }
}

/// Extract the metric name from an item, trying the common field names.
fn extract_metric_name(item: &Item) -> Option<String> {
    for field in ["name", "type", "metric", "dataType"] {
        if let Some(value) = item.get(field).and_then(Value::as_str) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    item.get("data")
        .and_then(Value::as_array)
        .and_then(|list| list.first())
        .and_then(Value::as_object)
        .and_then(|first| first.get("name"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

/// Sanitize a tag value to `[A-Za-z0-9_.\-]`, truncated to 256 chars.
/// Empty values become `"unknown"`. This bounds measurement-DB tag
/// cardinality and prevents injection into the line protocol.
pub(crate) fn sanitize_tag(value: &str) -> String {
    if value.is_empty() {
        return "unknown".to_string();
    }
    value
        .chars()
        .take(256)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Normalize the exporter's `"2022-06-12 23:59:00 +0400"` date form to
/// RFC 3339 (`"2022-06-12T23:59:00+04:00"`). Other strings pass through.
fn normalize_date_string(s: &str) -> String {
    let b = s.as_bytes();
    let fixed_width = b.len() == 25
        && b[10] == b' '
        && b[19] == b' '
        && (b[20] == b'+' || b[20] == b'-')
        && b[21..25].iter().all(u8::is_ascii_digit);
    if fixed_width {
        format!(
            "{}T{}{}{}:{}",
            &s[..10],
            &s[11..19],
            &s[20..21],
            &s[21..23],
            &s[23..25]
        )
    } else {
        s.to_string()
    }
}

/// Parse a sample date in any of the accepted forms.
pub(crate) fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?;
    let s = normalize_date_string(s);

    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S%.f %z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

/// Numeric accessor tolerating values sent as strings.
pub(crate) fn num(item: &Item, key: &str) -> Option<f64> {
    match item.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn text<'a>(item: &'a Item, key: &str) -> Option<&'a str> {
    item.get(key).and_then(Value::as_str)
}

/// Sanitized `source` tag value: the item's own source or the default.
pub(crate) fn source_tag(item: &Item, default_source: &str) -> String {
    let source = text(item, "source").filter(|s| !s.is_empty()).unwrap_or(default_source);
    sanitize_tag(source)
}

/// Case-insensitive exact lookup of a field name in a metric table.
pub(crate) fn lookup_field(metric_name: &str, table: &[(&str, &str)], default: &str) -> String {
    let lower = metric_name.to_lowercase();
    for (key, field) in table {
        if key.to_lowercase() == lower {
            return (*field).to_string();
        }
    }
    default.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> TransformerRegistry {
        TransformerRegistry::new("health_auto_export")
    }

    #[test]
    fn nested_shape_propagates_name_and_units() {
        let payload = json!({
            "data": {
                "metrics": [{
                    "name": "heart_rate",
                    "units": "bpm",
                    "data": [
                        {"date": "2024-01-15T10:00:00+00:00", "qty": 72},
                        {"date": "2024-01-15T10:01:00+00:00", "qty": 74}
                    ]
                }]
            }
        });

        let points = registry().transform(&payload).unwrap();
        assert_eq!(points.len(), 2);
        assert!(points.iter().all(|p| p.measurement() == "heart"));
    }

    #[test]
    fn flat_shape_merges_top_level_keys() {
        let payload = json!({
            "source": "Apple Watch",
            "data": [
                {"name": "heart_rate", "date": "2024-01-15T10:00:00+00:00", "qty": 72}
            ]
        });

        let points = registry().transform(&payload).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].tags().get("source").unwrap(), "Apple_Watch");
    }

    #[test]
    fn single_metric_shape_is_accepted() {
        let payload = json!({
            "name": "step_count",
            "date": "2024-01-15T10:00:00+00:00",
            "qty": 1200
        });

        let points = registry().transform(&payload).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement(), "activity");
    }

    #[test]
    fn non_object_payload_is_an_error() {
        assert!(registry().transform(&json!("just a string")).is_err());
        assert!(registry().transform(&json!(42)).is_err());
    }

    #[test]
    fn invalid_items_are_dropped_not_fatal() {
        let payload = json!({
            "data": [
                {"name": "heart_rate", "date": "2024-01-15T10:00:00+00:00", "qty": 72},
                {"name": "heart_rate", "date": "not a date", "qty": 72},
                {"qty": 10}
            ]
        });

        let points = registry().transform(&payload).unwrap();
        assert_eq!(points.len(), 1);
    }

    #[test]
    fn registry_output_is_deterministic() {
        let payload = json!({
            "data": [
                {"name": "heart_rate", "date": "2024-01-15T10:00:00+00:00", "qty": 72, "source": "watch"}
            ]
        });
        let a = registry().transform(&payload).unwrap();
        let b = registry().transform(&payload).unwrap();
        let fps_a: Vec<String> = a.iter().map(|p| p.fingerprint()).collect();
        let fps_b: Vec<String> = b.iter().map(|p| p.fingerprint()).collect();
        assert_eq!(fps_a, fps_b);
    }

    #[test]
    fn sanitize_tag_replaces_unsafe_characters() {
        assert_eq!(sanitize_tag("Apple Watch"), "Apple_Watch");
        assert_eq!(sanitize_tag("a,b=c d"), "a_b_c_d");
        assert_eq!(sanitize_tag(""), "unknown");
        assert_eq!(sanitize_tag("ok.value-1_x"), "ok.value-1_x");
        let long = "x".repeat(300);
        assert_eq!(sanitize_tag(&long).len(), 256);
    }

    #[test]
    fn parse_date_accepts_exporter_format() {
        let parsed = parse_date(&json!("2022-06-12 23:59:00 +0400")).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2022-06-12T19:59:00+00:00");
    }

    #[test]
    fn parse_date_accepts_rfc3339_and_bare_date() {
        assert!(parse_date(&json!("2024-01-15T10:00:00Z")).is_some());
        assert!(parse_date(&json!("2024-01-15")).is_some());
        assert!(parse_date(&json!("garbage")).is_none());
        assert!(parse_date(&json!(12)).is_none());
    }

    #[test]
    fn workout_items_route_by_metric_name() {
        let payload = json!({
            "data": [{
                "name": "functional_strength_training",
                "start": "2024-01-15T10:00:00+00:00",
                "end": "2024-01-15T10:30:00+00:00",
                "activeEnergy": 210.0
            }]
        });

        let points = registry().transform(&payload).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement(), "workout");
        assert_eq!(points[0].tags().get("workout_type").unwrap(), "functional_strength_training");
    }

    #[test]
    fn unknown_metric_falls_through_to_generic() {
        let payload = json!({
            "data": [
                {"name": "mindful_minutes", "date": "2024-01-15T10:00:00+00:00", "qty": 10}
            ]
        });

        let points = registry().transform(&payload).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement(), "other");
        assert_eq!(points[0].tags().get("metric_type").unwrap(), "mindful_minutes");
    }
}
