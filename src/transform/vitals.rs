//! Vitals transformer: SpO2, respiratory rate, blood pressure, temperature.

use tracing::warn;

use super::{lookup_field, num, parse_date, source_tag, text, Item, Transformer};
use crate::point::Point;

const VITALS_METRICS: &[(&str, &str)] = &[
    ("oxygen_saturation", "spo2_pct"),
    ("oxygensaturation", "spo2_pct"),
    ("blood_oxygen", "spo2_pct"),
    ("bloodoxygen", "spo2_pct"),
    ("spo2", "spo2_pct"),
    ("blood_oxygen_saturation", "spo2_pct"),
    ("bloodoxygensaturation", "spo2_pct"),
    ("respiratory_rate", "respiratory_rate"),
    ("respiratoryrate", "respiratory_rate"),
    ("blood_pressure_systolic", "bp_systolic"),
    ("bloodpressuresystolic", "bp_systolic"),
    ("systolic", "bp_systolic"),
    ("blood_pressure_diastolic", "bp_diastolic"),
    ("bloodpressurediastolic", "bp_diastolic"),
    ("diastolic", "bp_diastolic"),
    ("body_temperature", "temp_c"),
    ("bodytemperature", "temp_c"),
    ("temperature", "temp_c"),
    ("vo2max", "vo2max"),
    ("vo2_max", "vo2max"),
];

fn field_bounds(field: &str) -> (f64, f64) {
    match field {
        "spo2_pct" => (0.0, 100.0),
        "respiratory_rate" => (1.0, 80.0),
        "bp_systolic" => (40.0, 300.0),
        "bp_diastolic" => (20.0, 200.0),
        "temp_c" => (25.0, 45.0),
        "vo2max" => (5.0, 100.0),
        _ => (0.0, f64::INFINITY),
    }
}

fn is_fahrenheit(units: &str) -> bool {
    matches!(units, "f" | "degf" | "fahrenheit")
}

/// Unit fixups applied before range validation: Fahrenheit temperatures are
/// converted to Celsius and fractional SpO2 readings scaled to percent.
fn adjust(value: f64, field_name: &str, units: &str) -> f64 {
    let mut value = value;
    if field_name == "temp_c" && is_fahrenheit(units) {
        value = (value - 32.0) * 5.0 / 9.0;
    }
    if field_name == "spo2_pct" && value <= 1.0 {
        value *= 100.0;
    }
    value
}

pub struct VitalsTransformer {
    default_source: String,
}

impl VitalsTransformer {
    pub fn new(default_source: &str) -> Self {
        Self {
            default_source: default_source.to_string(),
        }
    }
}

impl Transformer for VitalsTransformer {
    fn measurement(&self) -> &'static str {
        "vitals"
    }

    fn can_transform(&self, metric_name: &str) -> bool {
        let lower = metric_name.to_lowercase();
        VITALS_METRICS.iter().any(|(k, _)| *k == lower)
            || [
                "oxygen",
                "spo2",
                "respiratory",
                "blood_pressure",
                "bloodpressure",
                "systolic",
                "diastolic",
                "temperature",
                "vo2",
            ]
            .iter()
            .any(|kw| lower.contains(kw))
    }

    fn transform(&self, item: &Item) -> Vec<Point> {
        let Some(name) = text(item, "name") else {
            return Vec::new();
        };
        let Some(qty) = num(item, "qty") else {
            return Vec::new();
        };
        let Some(date) = item.get("date").and_then(|v| parse_date(v)) else {
            return Vec::new();
        };

        let normalized = name.to_lowercase().replace(' ', "_");
        let field_name = lookup_field(&normalized, VITALS_METRICS, "value");
        let units = text(item, "units").unwrap_or("").to_lowercase();

        let value = adjust(qty, &field_name, &units);
        let (lo, hi) = field_bounds(&field_name);
        if !(lo..=hi).contains(&value) {
            warn!(field = %field_name, value, lo, hi, "vitals value out of range");
            return Vec::new();
        }

        let mut point = Point::new(self.measurement())
            .tag("source", source_tag(item, &self.default_source))
            .field(field_name.clone(), value)
            .timestamp(date);

        for suffix in ["min", "max"] {
            if let Some(stat) = num(item, suffix) {
                let stat = adjust(stat, &field_name, &units);
                if (lo..=hi).contains(&stat) {
                    point = point.field(format!("{}_{}", field_name, suffix), stat);
                } else {
                    warn!(field = %field_name, stat = suffix, value = stat, lo, hi, "vitals stat out of range");
                }
            }
        }

        vec![point]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::FieldValue;
    use serde_json::json;

    fn item(value: serde_json::Value) -> Item {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn fractional_spo2_is_scaled_to_percent() {
        let t = VitalsTransformer::new("default");
        let points = t.transform(&item(json!({
            "name": "oxygen_saturation",
            "date": "2024-01-15",
            "qty": 0.97
        })));
        assert_eq!(points[0].fields().get("spo2_pct"), Some(&FieldValue::Float(97.0)));
    }

    #[test]
    fn fahrenheit_temperature_converted_to_celsius() {
        let t = VitalsTransformer::new("default");
        let points = t.transform(&item(json!({
            "name": "body_temperature",
            "date": "2024-01-15",
            "qty": 98.6,
            "units": "degF"
        })));
        let FieldValue::Float(c) = points[0].fields().get("temp_c").unwrap() else {
            panic!("expected float field");
        };
        assert!((c - 37.0).abs() < 0.01);
    }

    #[test]
    fn out_of_range_vitals_are_dropped() {
        let t = VitalsTransformer::new("default");
        let points = t.transform(&item(json!({
            "name": "respiratory_rate",
            "date": "2024-01-15",
            "qty": 200.0
        })));
        assert!(points.is_empty());
    }
}
