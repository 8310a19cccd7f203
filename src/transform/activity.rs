//! Activity and fitness transformer.

use super::{num, parse_date, source_tag, text, Item, Transformer};
use crate::point::Point;

/// Metrics that map to the activity measurement. Matching is by substring
/// containment in either direction, so `apple_exercise_time` and
/// `exercise_time` both resolve to `exercise_min`.
const ACTIVITY_METRICS: &[(&str, &str)] = &[
    ("step_count", "steps"),
    ("stepcount", "steps"),
    ("steps", "steps"),
    ("active_energy", "active_calories"),
    ("activeenergy", "active_calories"),
    ("active_energy_burned", "active_calories"),
    ("activeenergyburned", "active_calories"),
    ("basal_energy_burned", "basal_calories"),
    ("basalenergyburned", "basal_calories"),
    ("distance_walking_running", "distance_m"),
    ("distancewalkingrunning", "distance_m"),
    ("exercise_time", "exercise_min"),
    ("exercisetime", "exercise_min"),
    ("apple_exercise_time", "exercise_min"),
    ("appleexercisetime", "exercise_min"),
    ("stand_time", "stand_min"),
    ("standtime", "stand_min"),
    ("stand_hour", "stand_hours"),
    ("standhour", "stand_hours"),
    ("apple_stand_hour", "stand_hours"),
    ("applestandhour", "stand_hours"),
    ("flights_climbed", "floors_climbed"),
    ("flightsclimbed", "floors_climbed"),
];

pub struct ActivityTransformer {
    default_source: String,
}

impl ActivityTransformer {
    pub fn new(default_source: &str) -> Self {
        Self {
            default_source: default_source.to_string(),
        }
    }
}

impl Transformer for ActivityTransformer {
    fn measurement(&self) -> &'static str {
        "activity"
    }

    fn can_transform(&self, metric_name: &str) -> bool {
        let lower = metric_name.to_lowercase();
        ACTIVITY_METRICS.iter().any(|(k, _)| *k == lower)
            || ["step", "energy", "exercise", "stand", "flight", "distance"]
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
        let mut field_name = "value";
        for (key, field) in ACTIVITY_METRICS {
            if normalized.contains(key) || key.contains(&normalized) {
                field_name = field;
                break;
            }
        }

        vec![Point::new(self.measurement())
            .tag("source", source_tag(item, &self.default_source))
            .field(field_name, qty)
            .timestamp(date)]
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
    fn maps_step_count_to_steps() {
        let t = ActivityTransformer::new("default");
        let points = t.transform(&item(json!({
            "name": "step_count",
            "date": "2024-01-15T10:00:00+00:00",
            "qty": 1200.0
        })));
        assert_eq!(points[0].fields().get("steps"), Some(&FieldValue::Float(1200.0)));
    }

    #[test]
    fn camel_case_names_resolve_through_containment() {
        let t = ActivityTransformer::new("default");
        let points = t.transform(&item(json!({
            "name": "appleExerciseTime",
            "date": "2024-01-15",
            "qty": 35.0
        })));
        assert!(points[0].fields().contains_key("exercise_min"));
    }

    #[test]
    fn unknown_activity_metric_falls_back_to_value_field() {
        let t = ActivityTransformer::new("default");
        let points = t.transform(&item(json!({
            "name": "pushups",
            "date": "2024-01-15",
            "qty": 50.0
        })));
        assert!(points[0].fields().contains_key("value"));
    }
}
