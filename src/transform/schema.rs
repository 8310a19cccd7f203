//! Per-item schema validation applied before transformer dispatch.
//!
//! Two templates: the base metric shape (`name` + `date`, optional numeric
//! statistics) and the workout shape (`name` + `start` + `end`). Failures are
//! reported per item and dropped from the flow; they never abort the payload.

use serde_json::Value;

use super::{num, parse_date, text, Item};

/// A schema validation failure for one metric item.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub schema: &'static str,
    pub error: String,
    pub metric_name: Option<String>,
}

const BASE_NUMERIC_FIELDS: &[&str] = &["qty", "min", "max", "avg"];
const WORKOUT_NUMERIC_FIELDS: &[&str] =
    &["duration", "activeEnergy", "distance", "avgHeartRate", "maxHeartRate"];

/// Validate items, separating the valid ones from per-item failures.
pub fn validate_items(items: Vec<Item>) -> (Vec<Item>, Vec<ValidationFailure>) {
    let mut valid = Vec::new();
    let mut failures = Vec::new();

    for item in items {
        let (schema, result) = if item.contains_key("start") || item.contains_key("end") {
            ("workout", validate_workout(&item))
        } else {
            ("base", validate_base(&item))
        };

        match result {
            Ok(()) => valid.push(item),
            Err(error) => failures.push(ValidationFailure {
                schema,
                error,
                metric_name: text(&item, "name").map(|s| s.to_string()),
            }),
        }
    }

    (valid, failures)
}

fn validate_base(item: &Item) -> Result<(), String> {
    require_name(item)?;
    let date = item.get("date").ok_or("missing required field 'date'")?;
    if parse_date(date).is_none() {
        return Err(format!("unparseable date: {}", date));
    }
    require_numeric(item, BASE_NUMERIC_FIELDS)
}

fn validate_workout(item: &Item) -> Result<(), String> {
    require_name(item)?;
    for field in ["start", "end"] {
        let value = item
            .get(field)
            .ok_or_else(|| format!("missing required field '{}'", field))?;
        if parse_date(value).is_none() {
            return Err(format!("unparseable {}: {}", field, value));
        }
    }
    require_numeric(item, WORKOUT_NUMERIC_FIELDS)
}

fn require_name(item: &Item) -> Result<(), String> {
    match item.get("name") {
        Some(Value::String(s)) if !s.is_empty() => Ok(()),
        Some(_) => Err("field 'name' is not a string".to_string()),
        None => Err("missing required field 'name'".to_string()),
    }
}

/// Optional fields must be numeric (or numeric strings, or null) when present.
fn require_numeric(item: &Item, fields: &[&str]) -> Result<(), String> {
    for field in fields {
        match item.get(*field) {
            None | Some(Value::Null) => {}
            Some(_) => {
                if num(item, field).is_none() {
                    return Err(format!("field '{}' is not numeric", field));
                }
            }
        }
    }
    Ok(())
}
