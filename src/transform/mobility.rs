//! Mobility and walking analysis transformer.

use super::{lookup_field, num, parse_date, source_tag, text, Item, Transformer};
use crate::point::Point;

const MOBILITY_METRICS: &[(&str, &str)] = &[
    ("walking_speed", "speed_mps"),
    ("walkingspeed", "speed_mps"),
    ("walking_step_length", "step_length_cm"),
    ("walkingsteplength", "step_length_cm"),
    ("walking_asymmetry_percentage", "asymmetry_pct"),
    ("walkingasymmetrypercentage", "asymmetry_pct"),
    ("walking_double_support_percentage", "double_support_pct"),
    ("walkingdoublesupportpercentage", "double_support_pct"),
    ("stair_speed_up", "stair_ascent_speed"),
    ("stairspeedup", "stair_ascent_speed"),
    ("stair_speed_down", "stair_descent_speed"),
    ("stairspeeddown", "stair_descent_speed"),
    ("six_minute_walk_test_distance", "six_min_walk_m"),
    ("sixminutewalktestdistance", "six_min_walk_m"),
    ("walking_steadiness", "steadiness_pct"),
    ("walkingsteadiness", "steadiness_pct"),
];

/// Fields reported either as fractions or percentages by different exporters.
const PCT_FIELDS: &[&str] = &["asymmetry_pct", "double_support_pct", "steadiness_pct"];

pub struct MobilityTransformer {
    default_source: String,
}

impl MobilityTransformer {
    pub fn new(default_source: &str) -> Self {
        Self {
            default_source: default_source.to_string(),
        }
    }
}

impl Transformer for MobilityTransformer {
    fn measurement(&self) -> &'static str {
        "mobility"
    }

    fn can_transform(&self, metric_name: &str) -> bool {
        let lower = metric_name.to_lowercase();
        MOBILITY_METRICS.iter().any(|(k, _)| *k == lower)
            || [
                "walking_speed",
                "walking_step",
                "walking_asymmetry",
                "walking_double",
                "walking_steadiness",
                "stair_speed",
                "six_minute_walk",
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
        let field_name = lookup_field(&normalized, MOBILITY_METRICS, "value");

        let mut value = qty;
        if PCT_FIELDS.contains(&field_name.as_str()) && value <= 1.0 {
            value *= 100.0;
        }

        vec![Point::new(self.measurement())
            .tag("source", source_tag(item, &self.default_source))
            .field(field_name, value)
            .timestamp(date)]
    }
}
