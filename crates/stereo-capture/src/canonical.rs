//! Deterministic JSON bytes for signing.

use serde::Serialize;
use serde_json::{Map, Value};

/// Compact JSON with object keys sorted at every level.
///
/// Floats use `serde_json`'s shortest round-trip formatting, so the same value
/// always produces the same bytes.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    let value = sorted(serde_json::to_value(value)?);
    serde_json::to_string(&value)
}

fn sorted(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sorted(v))).collect::<Map<_, _>>())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        timestamp: u64,
        base_image: &'static str,
        nested: Inner,
    }

    #[derive(Serialize)]
    struct Inner {
        z: Vec<f64>,
        a: i32,
    }

    #[test]
    fn keys_are_sorted_and_compact() {
        let s = Sample {
            timestamp: 7,
            base_image: "AA==",
            nested: Inner {
                z: vec![1.5, 0.1, 2.0],
                a: -1,
            },
        };
        assert_eq!(
            canonical_json(&s).unwrap(),
            r#"{"baseImage":"AA==","nested":{"a":-1,"z":[1.5,0.1,2.0]},"timestamp":7}"#
        );
    }

    #[test]
    fn float_formatting_is_shortest_round_trip() {
        let v = serde_json::json!({ "x": 0.1f32 as f64, "y": 1e-7 });
        let text = canonical_json(&v).unwrap();
        assert_eq!(text, r#"{"x":0.10000000149011612,"y":1e-7}"#);
        let back: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back["x"].as_f64(), Some(0.1f32 as f64));
    }
}
