//! Sleep analysis transformer.

use super::{num, parse_date, source_tag, text, Item, Transformer};
use crate::point::Point;

pub struct SleepTransformer {
    default_source: String,
}

impl SleepTransformer {
    pub fn new(default_source: &str) -> Self {
        Self {
            default_source: default_source.to_string(),
        }
    }

    /// Aggregated sleep analysis: one point carrying all stage durations.
    fn transform_analysis(&self, item: &Item) -> Vec<Point> {
        let Some(date) = item.get("date").and_then(|v| parse_date(v)) else {
            return Vec::new();
        };

        let mut point =
            Point::new(self.measurement()).tag("source", source_tag(item, &self.default_source));

        let asleep = num(item, "asleep");
        let in_bed = num(item, "inBed");

        if let Some(v) = asleep {
            point = point.field("duration_min", v);
        }
        if let Some(v) = num(item, "deep") {
            point = point.field("deep_min", v);
        }
        if let Some(v) = num(item, "rem") {
            point = point.field("rem_min", v);
        }
        if let Some(v) = num(item, "core") {
            point = point.field("core_min", v);
        }
        if let Some(v) = num(item, "awake") {
            point = point.field("awake_min", v);
        }
        if let Some(v) = in_bed {
            point = point.field("in_bed_min", v);
        }

        // Efficiency score when both durations are known.
        if let (Some(asleep), Some(in_bed)) = (asleep, in_bed) {
            if in_bed > 0.0 {
                let quality = (asleep / in_bed * 1000.0).round() / 10.0;
                point = point.field("quality_score", quality);
            }
        }

        if !point.has_fields() {
            return Vec::new();
        }
        vec![point.timestamp(date)]
    }

    /// Individual sleep stage samples keyed by the metric name.
    fn transform_stage(&self, item: &Item) -> Vec<Point> {
        let Some(name) = text(item, "name").map(|s| s.to_lowercase()) else {
            return Vec::new();
        };
        let Some(qty) = num(item, "qty") else {
            return Vec::new();
        };
        let Some(date) = item.get("date").and_then(|v| parse_date(v)) else {
            return Vec::new();
        };

        let field = if name.contains("asleep") && name.contains("deep") {
            "deep_min"
        } else if name.contains("asleep") && name.contains("rem") {
            "rem_min"
        } else if name.contains("asleep") && name.contains("core") {
            "core_min"
        } else if name.contains("awake") {
            "awake_min"
        } else if name.contains("inbed") || name.contains("in_bed") {
            "in_bed_min"
        } else if name.contains("asleep") {
            "duration_min"
        } else {
            return Vec::new();
        };

        vec![Point::new(self.measurement())
            .tag("source", source_tag(item, &self.default_source))
            .field(field, qty)
            .timestamp(date)]
    }
}

impl Transformer for SleepTransformer {
    fn measurement(&self) -> &'static str {
        "sleep"
    }

    fn can_transform(&self, metric_name: &str) -> bool {
        let lower = metric_name.to_lowercase();
        ["sleep", "inbed", "in_bed"].iter().any(|kw| lower.contains(kw))
    }

    fn transform(&self, item: &Item) -> Vec<Point> {
        if item.contains_key("asleep") || item.contains_key("inBed") || item.contains_key("deep") {
            self.transform_analysis(item)
        } else {
            self.transform_stage(item)
        }
    }
}
