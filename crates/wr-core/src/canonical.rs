//! Deterministic RFC 8785-style JSON serialization.
//!
//! Object keys are sorted lexicographically by code point (byte order over
//! UTF-8), arrays preserve order, strings use minimal escaping, and numbers
//! must be finite. Two semantically equal values always canonicalize to the
//! same byte sequence, which makes the output safe to hash.

use serde::Serialize;
use serde_json::Value;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CanonicalJsonError {
    #[error("non-finite number cannot be canonicalized")]
    NonFiniteNumber,

    #[error("value cannot be represented as plain JSON: {0}")]
    Serialize(String),
}

/// Canonicalize any serializable value.
///
/// Values that do not lower to plain JSON (e.g. maps with non-string keys)
/// are rejected with [`CanonicalJsonError::Serialize`]. A number that is
/// not representable as a finite JSON number is rejected with
/// [`CanonicalJsonError::NonFiniteNumber`]; `serde_json`'s standard number
/// type cannot hold one, so JSON parsed from the wire is always accepted.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalJsonError> {
    let value = serde_json::to_value(value)
        .map_err(|err| CanonicalJsonError::Serialize(err.to_string()))?;
    to_canonical_bytes(&value)
}

/// Canonicalize a JSON value into its unique UTF-8 byte encoding.
pub fn to_canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonicalJsonError> {
    let mut out = Vec::with_capacity(128);
    write_value(&mut out, value)?;
    Ok(out)
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<(), CanonicalJsonError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(number) => {
            if !number.is_i64() && !number.is_u64() {
                let float = number
                    .as_f64()
                    .ok_or(CanonicalJsonError::NonFiniteNumber)?;
                if !float.is_finite() {
                    return Err(CanonicalJsonError::NonFiniteNumber);
                }
            }
            out.extend_from_slice(number.to_string().as_bytes());
        }
        Value::String(text) => write_string(out, text),
        Value::Array(items) => {
            out.push(b'[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(b',');
                }
                write_value(out, item)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // UTF-8 byte order equals code-point order, so a plain sort
            // satisfies the lexicographic-by-code-point requirement.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();

            out.push(b'{');
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(b',');
                }
                write_string(out, key);
                out.push(b':');
                write_value(out, &map[key.as_str()])?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn write_string(out: &mut Vec<u8>, text: &str) {
    out.push(b'"');
    for ch in text.chars() {
        match ch {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\u{0008}' => out.extend_from_slice(b"\\b"),
            '\u{0009}' => out.extend_from_slice(b"\\t"),
            '\u{000A}' => out.extend_from_slice(b"\\n"),
            '\u{000C}' => out.extend_from_slice(b"\\f"),
            '\u{000D}' => out.extend_from_slice(b"\\r"),
            ch if (ch as u32) < 0x20 => {
                let mut buf = [0_u8; 6];
                let escaped = format_control_escape(ch as u32, &mut buf);
                out.extend_from_slice(escaped);
            }
            ch => {
                let mut buf = [0_u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}

fn format_control_escape(code: u32, buf: &mut [u8; 6]) -> &[u8] {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    buf[0] = b'\\';
    buf[1] = b'u';
    buf[2] = b'0';
    buf[3] = b'0';
    buf[4] = HEX[((code >> 4) & 0xF) as usize];
    buf[5] = HEX[(code & 0xF) as usize];
    &buf[..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn canon(value: &Value) -> String {
        String::from_utf8(to_canonical_bytes(value).unwrap()).unwrap()
    }

    #[test]
    fn test_scalars() {
        assert_eq!(canon(&json!(null)), "null");
        assert_eq!(canon(&json!(true)), "true");
        assert_eq!(canon(&json!(false)), "false");
        assert_eq!(canon(&json!(42)), "42");
        assert_eq!(canon(&json!(-7)), "-7");
        assert_eq!(canon(&json!("hi")), "\"hi\"");
    }

    #[test]
    fn test_object_keys_sorted_by_code_point() {
        let value = json!({"b": 1, "a": 2, "C": 3});
        // 'C' (0x43) sorts before 'a' (0x61) and 'b' (0x62).
        assert_eq!(canon(&value), r#"{"C":3,"a":2,"b":1}"#);
    }

    #[test]
    fn test_nested_objects_sorted_recursively() {
        let value = json!({"z": {"y": 1, "x": 2}, "a": [{"q": 1, "p": 2}]});
        assert_eq!(canon(&value), r#"{"a":[{"p":2,"q":1}],"z":{"x":2,"y":1}}"#);
    }

    #[test]
    fn test_array_order_preserved() {
        let value = json!([3, 1, 2]);
        assert_eq!(canon(&value), "[3,1,2]");
    }

    #[test]
    fn test_string_escaping_is_minimal() {
        assert_eq!(canon(&json!("a\"b")), r#""a\"b""#);
        assert_eq!(canon(&json!("a\\b")), r#""a\\b""#);
        assert_eq!(canon(&json!("line\nbreak")), "\"line\\nbreak\"");
        assert_eq!(canon(&json!("tab\there")), "\"tab\\there\"");
        assert_eq!(canon(&json!("\u{0001}")), "\"\\u0001\"");
        // Non-ASCII passes through as UTF-8, unescaped.
        assert_eq!(canon(&json!("héllo")), "\"héllo\"");
    }

    #[test]
    fn test_floats_render_shortest() {
        assert_eq!(canon(&json!(1.5)), "1.5");
        assert_eq!(canon(&json!(0.1)), "0.1");
    }

    #[test]
    fn test_canonical_is_fixed_point() {
        let value = json!({"b": [1, {"d": null, "c": "x"}], "a": 0.25});
        let first = to_canonical_bytes(&value).unwrap();
        let reparsed: Value = serde_json::from_slice(&first).unwrap();
        let second = to_canonical_bytes(&reparsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_containers() {
        assert_eq!(canon(&json!({})), "{}");
        assert_eq!(canon(&json!([])), "[]");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_json(depth: u32) -> BoxedStrategy<Value> {
            let leaf = prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::from),
                any::<i64>().prop_map(Value::from),
                "[a-zA-Z0-9 _\\-\"\\\\\n]{0,12}".prop_map(Value::from),
            ];
            if depth == 0 {
                return leaf.boxed();
            }
            prop_oneof![
                leaf.clone(),
                prop::collection::vec(arb_json(depth - 1), 0..4).prop_map(Value::from),
                prop::collection::btree_map("[a-z]{1,6}", arb_json(depth - 1), 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
            .boxed()
        }

        proptest! {
            // canonical(parse(canonical(x))) == canonical(x)
            #[test]
            fn round_trip_law(value in arb_json(3)) {
                let first = to_canonical_bytes(&value).unwrap();
                let reparsed: Value = serde_json::from_slice(&first).unwrap();
                let second = to_canonical_bytes(&reparsed).unwrap();
                prop_assert_eq!(first, second);
            }
        }
    }
}
