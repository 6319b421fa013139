//! Lenient accessors for device-produced JSON.
//!
//! Recorder metadata mixes JSON numbers and numeric strings for the same
//! fields depending on firmware version, so numeric reads accept both.

use serde_json::Value;

/// Read an integer from a JSON number or a numeric string.
pub(crate) fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

/// Read a float from a JSON number or a numeric string.
pub(crate) fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lenient_i64() {
        assert_eq!(lenient_i64(&json!(42)), Some(42));
        assert_eq!(lenient_i64(&json!("42")), Some(42));
        assert_eq!(lenient_i64(&json!(" 17 ")), Some(17));
        assert_eq!(lenient_i64(&json!("4.0")), Some(4));
        assert_eq!(lenient_i64(&json!("4.5")), None);
        assert_eq!(lenient_i64(&json!(null)), None);
        assert_eq!(lenient_i64(&json!("abc")), None);
    }

    #[test]
    fn test_lenient_f64() {
        assert_eq!(lenient_f64(&json!(1.5)), Some(1.5));
        assert_eq!(lenient_f64(&json!("0.25")), Some(0.25));
        assert_eq!(lenient_f64(&json!(true)), None);
    }
}
