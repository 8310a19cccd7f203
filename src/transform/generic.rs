//! Generic transformer for unrecognized metrics. Always last in the
//! registry's priority order; accepts every metric name.

use tracing::warn;

use super::{num, parse_date, sanitize_tag, source_tag, text, Item, Transformer};
use crate::point::Point;

const MAX_METRIC_NAME_LEN: usize = 200;

pub struct GenericTransformer {
    default_source: String,
}

impl GenericTransformer {
    pub fn new(default_source: &str) -> Self {
        Self {
            default_source: default_source.to_string(),
        }
    }

    /// Normalize a metric name to snake_case: camelCase boundaries become
    /// underscores, spaces and hyphens become underscores, runs collapse,
    /// and anything outside `[a-z0-9_]` is stripped.
    fn normalize_metric_name(name: &str) -> String {
        let chars: Vec<char> = name.chars().take(MAX_METRIC_NAME_LEN).collect();
        let mut out = String::with_capacity(chars.len() + 8);

        for (i, &c) in chars.iter().enumerate() {
            if c.is_ascii_uppercase() {
                let prev = if i > 0 { Some(chars[i - 1]) } else { None };
                let next = chars.get(i + 1);
                let after_lower_or_digit =
                    prev.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit());
                let acronym_end = prev.is_some_and(|p| p.is_ascii_uppercase())
                    && next.is_some_and(|n| n.is_ascii_lowercase());
                if after_lower_or_digit || acronym_end {
                    out.push('_');
                }
                out.push(c.to_ascii_lowercase());
            } else if c == ' ' || c == '-' {
                out.push('_');
            } else {
                out.push(c);
            }
        }

        let mut result = String::with_capacity(out.len());
        let mut prev_underscore = false;
        for c in out.chars() {
            if c == '_' {
                if !prev_underscore {
                    result.push('_');
                }
                prev_underscore = true;
            } else if c.is_ascii_alphanumeric() {
                result.push(c.to_ascii_lowercase());
                prev_underscore = false;
            }
            // Anything else is dropped.
        }

        result.trim_matches('_').to_string()
    }
}

impl Transformer for GenericTransformer {
    fn measurement(&self) -> &'static str {
        "other"
    }

    fn can_transform(&self, _metric_name: &str) -> bool {
        true
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

        let metric_type = Self::normalize_metric_name(name);
        if metric_type.is_empty() {
            let raw: String = name.chars().take(MAX_METRIC_NAME_LEN).collect();
            warn!(raw_name = %raw, "invalid metric name");
            return Vec::new();
        }

        let mut point = Point::new(self.measurement())
            .tag("source", source_tag(item, &self.default_source))
            .tag("metric_type", sanitize_tag(&metric_type))
            .field("value", qty)
            .timestamp(date);

        if let Some(units) = text(item, "units").filter(|u| !u.is_empty()) {
            point = point.tag("unit", sanitize_tag(units));
        }

        for suffix in ["min", "max", "avg"] {
            if let Some(v) = num(item, suffix) {
                point = point.field(suffix, v);
            }
        }

        vec![point]
    }
}
