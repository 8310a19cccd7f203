//! Workout transformer.

use super::{num, parse_date, sanitize_tag, source_tag, text, Item, Transformer};
use crate::point::Point;

pub struct WorkoutTransformer {
    default_source: String,
}

impl WorkoutTransformer {
    pub fn new(default_source: &str) -> Self {
        Self {
            default_source: default_source.to_string(),
        }
    }

    /// Normalize workout type names from the exporter's HealthKit-style
    /// identifiers to consistent snake_case tags.
    fn normalize_workout_type(name: &str) -> String {
        let mut name = name.to_lowercase();
        for prefix in ["hkworkoutactivitytype", "workout_"] {
            if let Some(stripped) = name.strip_prefix(prefix) {
                name = stripped.to_string();
            }
        }

        match name.as_str() {
            "traditionalstrengthtraining" => "strength_training".to_string(),
            "functionalstrengthtraining" => "functional_training".to_string(),
            "highintensityintervaltraining" => "hiit".to_string(),
            "stairclimbing" => "stair_climbing".to_string(),
            "coretraining" => "core_training".to_string(),
            "mindandbody" => "mind_and_body".to_string(),
            other => other.replace(' ', "_"),
        }
    }
}

impl Transformer for WorkoutTransformer {
    fn measurement(&self) -> &'static str {
        "workout"
    }

    fn can_transform(&self, metric_name: &str) -> bool {
        let lower = metric_name.to_lowercase();
        ["workout", "exercise", "training"].iter().any(|kw| lower.contains(kw))
    }

    fn transform(&self, item: &Item) -> Vec<Point> {
        let Some(name) = text(item, "name") else {
            return Vec::new();
        };
        let Some(start) = item.get("start").and_then(|v| parse_date(v)) else {
            return Vec::new();
        };
        let Some(end) = item.get("end").and_then(|v| parse_date(v)) else {
            return Vec::new();
        };

        let workout_type = sanitize_tag(&Self::normalize_workout_type(name));
        let mut point = Point::new(self.measurement())
            .tag("source", source_tag(item, &self.default_source))
            .tag("workout_type", workout_type);

        // Derive duration from the interval when the exporter omitted it.
        let duration = num(item, "duration")
            .or_else(|| Some((end - start).num_seconds() as f64 / 60.0));
        if let Some(duration) = duration {
            point = point.field("duration_min", duration);
        }

        if let Some(v) = num(item, "activeEnergy") {
            point = point.field("calories", v);
        }
        if let Some(v) = num(item, "distance") {
            point = point.field("distance_m", v);
        }
        if let Some(v) = num(item, "avgHeartRate") {
            point = point.field("avg_hr", v);
        }
        if let Some(v) = num(item, "maxHeartRate") {
            point = point.field("max_hr", v);
        }

        vec![point.timestamp(start)]
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
    fn computes_duration_from_interval_when_missing() {
        let t = WorkoutTransformer::new("default");
        let points = t.transform(&item(json!({
            "name": "Running",
            "start": "2024-01-15T10:00:00+00:00",
            "end": "2024-01-15T10:45:00+00:00",
            "distance": 7500.0
        })));

        assert_eq!(points.len(), 1);
        let fields = points[0].fields();
        assert_eq!(fields.get("duration_min"), Some(&FieldValue::Float(45.0)));
        assert_eq!(fields.get("distance_m"), Some(&FieldValue::Float(7500.0)));
        assert_eq!(points[0].tags().get("workout_type").unwrap(), "running");
    }

    #[test]
    fn normalizes_healthkit_activity_types() {
        let t = WorkoutTransformer::new("default");
        let points = t.transform(&item(json!({
            "name": "HKWorkoutActivityTypeTraditionalStrengthTraining",
            "start": "2024-01-15T10:00:00+00:00",
            "end": "2024-01-15T10:30:00+00:00"
        })));
        assert_eq!(points[0].tags().get("workout_type").unwrap(), "strength_training");
    }

    #[test]
    fn explicit_duration_wins_over_interval() {
        let t = WorkoutTransformer::new("default");
        let points = t.transform(&item(json!({
            "name": "cycling",
            "start": "2024-01-15T10:00:00+00:00",
            "end": "2024-01-15T11:00:00+00:00",
            "duration": 58.5,
            "avgHeartRate": 132.0
        })));
        let fields = points[0].fields();
        assert_eq!(fields.get("duration_min"), Some(&FieldValue::Float(58.5)));
        assert_eq!(fields.get("avg_hr"), Some(&FieldValue::Float(132.0)));
    }
}
