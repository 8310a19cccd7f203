//! Audio exposure transformer.

use super::{lookup_field, num, parse_date, source_tag, text, Item, Transformer};
use crate::point::Point;

const AUDIO_METRICS: &[(&str, &str)] = &[
    ("headphone_audio_exposure", "headphone_db"),
    ("headphoneaudioexposure", "headphone_db"),
    ("environmental_audio_exposure", "environmental_db"),
    ("environmentalaudioexposure", "environmental_db"),
    ("headphone_audio_levels", "headphone_db"),
    ("headphoneaudiolevels", "headphone_db"),
];

pub struct AudioTransformer {
    default_source: String,
}

impl AudioTransformer {
    pub fn new(default_source: &str) -> Self {
        Self {
            default_source: default_source.to_string(),
        }
    }
}

impl Transformer for AudioTransformer {
    fn measurement(&self) -> &'static str {
        "audio"
    }

    fn can_transform(&self, metric_name: &str) -> bool {
        let lower = metric_name.to_lowercase();
        AUDIO_METRICS.iter().any(|(k, _)| *k == lower)
            || [
                "audio_exposure",
                "audio_levels",
                "headphone_audio",
                "environmental_audio",
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
        let field_name = lookup_field(&normalized, AUDIO_METRICS, "value");

        vec![Point::new(self.measurement())
            .tag("source", source_tag(item, &self.default_source))
            .field(field_name, qty)
            .timestamp(date)]
    }
}
