//! Heart rate and HRV transformer.

use tracing::warn;

use super::{lookup_field, num, parse_date, source_tag, Item, Transformer};
use crate::point::Point;

/// Metrics that map to the heart measurement.
const HEART_METRICS: &[(&str, &str)] = &[
    ("heart_rate", "bpm"),
    ("heartrate", "bpm"),
    ("resting_heart_rate", "resting_bpm"),
    ("restingheartrate", "resting_bpm"),
    ("heart_rate_variability", "hrv_ms"),
    ("heartratevariabilitysdnn", "hrv_ms"),
    ("hrv", "hrv_ms"),
];

/// Physiological bounds per field.
fn field_bounds(field: &str) -> (f64, f64) {
    match field {
        "bpm" => (20.0, 300.0),
        "resting_bpm" => (20.0, 200.0),
        "hrv_ms" => (0.0, 500.0),
        _ => (0.0, f64::INFINITY),
    }
}

pub struct HeartTransformer {
    default_source: String,
}

impl HeartTransformer {
    pub fn new(default_source: &str) -> Self {
        Self {
            default_source: default_source.to_string(),
        }
    }
}

impl Transformer for HeartTransformer {
    fn measurement(&self) -> &'static str {
        "heart"
    }

    fn can_transform(&self, metric_name: &str) -> bool {
        let lower = metric_name.to_lowercase();
        HEART_METRICS.iter().any(|(k, _)| *k == lower)
            || ["heart", "hrv", "pulse"].iter().any(|kw| lower.contains(kw))
    }

    fn transform(&self, item: &Item) -> Vec<Point> {
        let Some(name) = super::text(item, "name") else {
            return Vec::new();
        };
        let Some(qty) = num(item, "qty") else {
            return Vec::new();
        };
        let Some(date) = item.get("date").and_then(|v| parse_date(v)) else {
            return Vec::new();
        };

        let normalized = name.to_lowercase().replace(' ', "_");
        let field_name = lookup_field(&normalized, HEART_METRICS, "bpm");

        let (lo, hi) = field_bounds(&field_name);
        if !(lo..=hi).contains(&qty) {
            warn!(field = %field_name, value = qty, lo, hi, "heart value out of range");
            return Vec::new();
        }

        let mut point = Point::new(self.measurement())
            .tag("source", source_tag(item, &self.default_source))
            .field(field_name.clone(), qty)
            .timestamp(date);

        for suffix in ["min", "max", "avg"] {
            if let Some(stat) = num(item, suffix) {
                if (lo..=hi).contains(&stat) {
                    point = point.field(format!("{}_{}", field_name, suffix), stat);
                } else {
                    warn!(field = %field_name, stat = suffix, value = stat, lo, hi, "heart stat out of range");
                }
            }
        }

        vec![point]
    }
}
