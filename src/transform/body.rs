//! Body composition transformer.

use super::{lookup_field, num, parse_date, source_tag, text, Item, Transformer};
use crate::point::Point;

const BODY_METRICS: &[(&str, &str)] = &[
    ("body_mass", "weight_kg"),
    ("bodymass", "weight_kg"),
    ("weight", "weight_kg"),
    ("body_fat_percentage", "body_fat_pct"),
    ("bodyfatpercentage", "body_fat_pct"),
    ("body_mass_index", "bmi"),
    ("bodymassindex", "bmi"),
    ("bmi", "bmi"),
    ("lean_body_mass", "lean_mass_kg"),
    ("leanbodymass", "lean_mass_kg"),
    ("waist_circumference", "waist_cm"),
    ("waistcircumference", "waist_cm"),
    ("height", "height_cm"),
];

pub struct BodyTransformer {
    default_source: String,
}

impl BodyTransformer {
    pub fn new(default_source: &str) -> Self {
        Self {
            default_source: default_source.to_string(),
        }
    }
}

impl Transformer for BodyTransformer {
    fn measurement(&self) -> &'static str {
        "body"
    }

    fn can_transform(&self, metric_name: &str) -> bool {
        let lower = metric_name.to_lowercase();
        BODY_METRICS.iter().any(|(k, _)| *k == lower)
            || ["body", "weight", "mass", "fat", "bmi", "lean", "waist", "height"]
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
        let field_name = lookup_field(&normalized, BODY_METRICS, "value");

        let mut value = qty;
        let units = text(item, "units").unwrap_or("").to_lowercase();

        // Convert imperial units to the metric fields we store.
        if field_name == "weight_kg" && units.contains("lb") {
            value *= 0.453_592;
        }
        if (field_name == "height_cm" || field_name == "waist_cm") && units.contains("in") {
            value *= 2.54;
        }

        vec![Point::new(self.measurement())
            .tag("source", source_tag(item, &self.default_source))
            .field(field_name, value)
            .timestamp(date)]
    }
}
