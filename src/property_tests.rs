//! Property-based tests for fingerprint stability and tag sanitization.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use crate::point::Point;
use crate::transform::sanitize_tag;

fn build_point(tags: &[(String, String)], fields: &[(String, f64)], reverse: bool) -> Point {
    let mut point = Point::new("prop").timestamp(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());

    let tag_iter: Box<dyn Iterator<Item = &(String, String)>> = if reverse {
        Box::new(tags.iter().rev())
    } else {
        Box::new(tags.iter())
    };
    for (k, v) in tag_iter {
        point = point.tag(k.clone(), v.clone());
    }

    let field_iter: Box<dyn Iterator<Item = &(String, f64)>> = if reverse {
        Box::new(fields.iter().rev())
    } else {
        Box::new(fields.iter())
    };
    for (k, v) in field_iter {
        point = point.field(k.clone(), *v);
    }

    point
}

proptest! {
    /// Permuting the insertion order of tags and fields never changes the
    /// fingerprint.
    #[test]
    fn fingerprint_is_insertion_order_independent(
        tags in prop::collection::btree_map("[a-z]{1,8}", "[a-zA-Z0-9_]{1,8}", 0..5),
        fields in prop::collection::btree_map("[a-z]{1,8}", -1e9f64..1e9f64, 1..5),
    ) {
        let tags: Vec<(String, String)> = tags.into_iter().collect();
        let fields: Vec<(String, f64)> = fields.into_iter().collect();

        let forward = build_point(&tags, &fields, false);
        let backward = build_point(&tags, &fields, true);

        prop_assert_eq!(forward.fingerprint(), backward.fingerprint());
    }

    /// Distinct field values produce distinct fingerprints.
    #[test]
    fn fingerprint_is_sensitive_to_field_values(a in -1e9f64..1e9f64, b in -1e9f64..1e9f64) {
        prop_assume!(a != b);
        let base = |v: f64| {
            Point::new("prop")
                .field("value", v)
                .timestamp(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
        };
        prop_assert_ne!(base(a).fingerprint(), base(b).fingerprint());
    }

    /// Sanitized tags only ever contain the allowed character set and are
    /// bounded in length.
    #[test]
    fn sanitized_tags_are_safe_for_line_protocol(value in ".{0,400}") {
        let sanitized = sanitize_tag(&value);
        prop_assert!(!sanitized.is_empty());
        prop_assert!(sanitized.chars().count() <= 256);
        prop_assert!(sanitized
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')));
    }

    /// Fingerprints are always 16 lowercase hex characters.
    #[test]
    fn fingerprint_shape_is_stable(measurement in "[a-z]{1,12}", value in -1e9f64..1e9f64) {
        let point = Point::new(measurement)
            .field("value", value)
            .timestamp(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        let fp = point.fingerprint();
        prop_assert_eq!(fp.len(), 16);
        prop_assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
