//! Compact text encoding of [`Update`]s.
//!
//! One update encodes to one self-delimiting unit: a single-letter
//! discriminator followed by positional fields, joined by `|`. Fields
//! are compact JSON with any literal `\` or `|` escaped (`\\`, `\|`);
//! the decoder splits on unescaped delimiters and reverses the escape
//! before parsing each field. The bare token `~`, never valid JSON on
//! its own, stands for "absent/removed", distinct from the text `null`.
//!
//! A tick's flush joins units with `\n`. JSON string encoding never
//! emits a raw newline, so records need no further escaping.

use crate::update::{Update, WireValue};
use serde_json::Value;

/// Record separator between units in a batch payload.
pub const RECORD_SEPARATOR: char = '\n';

const FIELD_SEPARATOR: char = '|';
const ESCAPE: char = '\\';
const ABSENT_TOKEN: &str = "~";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty update unit")]
    Empty,
    #[error("unknown update discriminator {0:?}")]
    UnknownKind(String),
    #[error("update kind '{kind}' expects {expected} fields, got {got}")]
    FieldCount {
        kind: char,
        expected: usize,
        got: usize,
    },
    #[error("dangling or invalid escape inside unit")]
    BadEscape,
    #[error("field is not valid JSON: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error("path field is not an array of strings")]
    BadPath,
    #[error("numeric field is not in range")]
    BadNumber,
}

fn escape_into(field: &str, out: &mut String) {
    for c in field.chars() {
        if c == ESCAPE || c == FIELD_SEPARATOR {
            out.push(ESCAPE);
        }
        out.push(c);
    }
}

/// Splits one unit into unescaped fields.
fn split_fields(unit: &str) -> Result<Vec<String>, DecodeError> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = unit.chars();
    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some(e) if e == ESCAPE || e == FIELD_SEPARATOR => current.push(e),
                _ => return Err(DecodeError::BadEscape),
            },
            FIELD_SEPARATOR => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    Ok(fields)
}

fn push_json<T: serde::Serialize>(value: &T, out: &mut String) {
    out.push(FIELD_SEPARATOR);
    // Value serialization to a string cannot fail for plain JSON trees.
    let text = serde_json::to_string(value).unwrap_or_default();
    escape_into(&text, out);
}

fn push_wire_value(value: &WireValue, out: &mut String) {
    match value {
        WireValue::Json(v) => push_json(v, out),
        WireValue::Absent => {
            out.push(FIELD_SEPARATOR);
            out.push_str(ABSENT_TOKEN);
        }
    }
}

/// Encodes one update as one wire unit.
pub fn encode(update: &Update) -> String {
    let mut out = String::new();
    match update {
        Update::Edit { path, value } => {
            out.push('E');
            push_json(path, &mut out);
            push_wire_value(value, &mut out);
        }
        Update::Shift { path, from, delta } => {
            out.push('S');
            push_json(path, &mut out);
            push_json(from, &mut out);
            push_json(delta, &mut out);
        }
        Update::SelfProperty { property, data } => {
            out.push('P');
            push_json(property, &mut out);
            push_json(data, &mut out);
        }
        Update::Connect { id, snapshot } => {
            out.push('C');
            push_json(id, &mut out);
            push_json(snapshot, &mut out);
        }
        Update::Disconnect { id } => {
            out.push('D');
            push_json(id, &mut out);
        }
        Update::Response { name, payload } => {
            out.push('R');
            push_json(name, &mut out);
            push_json(payload, &mut out);
        }
        Update::Initialize {
            self_id,
            tick_rate,
            constraints,
            clients,
            teams,
            space,
        } => {
            out.push('I');
            push_json(self_id, &mut out);
            push_json(tick_rate, &mut out);
            push_json(constraints, &mut out);
            push_json(clients, &mut out);
            push_json(teams, &mut out);
            match space {
                Some(s) => push_json(s, &mut out),
                None => {
                    out.push(FIELD_SEPARATOR);
                    out.push_str(ABSENT_TOKEN);
                }
            }
        }
    }
    out
}

/// Encodes a tick's worth of updates as one flush payload.
pub fn encode_batch(updates: &[Update]) -> String {
    let mut out = String::new();
    for (i, update) in updates.iter().enumerate() {
        if i > 0 {
            out.push(RECORD_SEPARATOR);
        }
        out.push_str(&encode(update));
    }
    out
}

fn expect_fields(kind: char, fields: &[String], expected: usize) -> Result<(), DecodeError> {
    if fields.len() != expected {
        return Err(DecodeError::FieldCount {
            kind,
            expected,
            got: fields.len(),
        });
    }
    Ok(())
}

fn parse_path(field: &str) -> Result<Vec<String>, DecodeError> {
    serde_json::from_str::<Vec<String>>(field).map_err(|_| DecodeError::BadPath)
}

fn parse_string(field: &str) -> Result<String, DecodeError> {
    Ok(serde_json::from_str::<String>(field)?)
}

fn parse_value(field: &str) -> Result<Value, DecodeError> {
    Ok(serde_json::from_str::<Value>(field)?)
}

fn parse_wire_value(field: &str) -> Result<WireValue, DecodeError> {
    if field == ABSENT_TOKEN {
        return Ok(WireValue::Absent);
    }
    Ok(WireValue::Json(parse_value(field)?))
}

/// Decodes one wire unit back into an [`Update`].
///
/// Anything unrecognized or malformed becomes an error value; decoding
/// never panics, so one bad message cannot take a connection down with
/// it.
pub fn decode(unit: &str) -> Result<Update, DecodeError> {
    if unit.is_empty() {
        return Err(DecodeError::Empty);
    }
    let fields = split_fields(unit)?;
    let kind = &fields[0];
    match kind.as_str() {
        "E" => {
            expect_fields('E', &fields, 3)?;
            Ok(Update::Edit {
                path: parse_path(&fields[1])?,
                value: parse_wire_value(&fields[2])?,
            })
        }
        "S" => {
            expect_fields('S', &fields, 4)?;
            Ok(Update::Shift {
                path: parse_path(&fields[1])?,
                from: fields[2].parse().map_err(|_| DecodeError::BadNumber)?,
                delta: fields[3].parse().map_err(|_| DecodeError::BadNumber)?,
            })
        }
        "P" => {
            expect_fields('P', &fields, 3)?;
            Ok(Update::SelfProperty {
                property: parse_string(&fields[1])?,
                data: parse_value(&fields[2])?,
            })
        }
        "C" => {
            expect_fields('C', &fields, 3)?;
            Ok(Update::Connect {
                id: parse_string(&fields[1])?,
                snapshot: parse_value(&fields[2])?,
            })
        }
        "D" => {
            expect_fields('D', &fields, 2)?;
            Ok(Update::Disconnect {
                id: parse_string(&fields[1])?,
            })
        }
        "R" => {
            expect_fields('R', &fields, 3)?;
            Ok(Update::Response {
                name: parse_string(&fields[1])?,
                payload: parse_value(&fields[2])?,
            })
        }
        "I" => {
            expect_fields('I', &fields, 7)?;
            Ok(Update::Initialize {
                self_id: parse_string(&fields[1])?,
                tick_rate: fields[2].parse().map_err(|_| DecodeError::BadNumber)?,
                constraints: parse_value(&fields[3])?,
                clients: parse_value(&fields[4])?,
                teams: parse_value(&fields[5])?,
                space: match fields[6].as_str() {
                    ABSENT_TOKEN => None,
                    s => Some(parse_string(s)?),
                },
            })
        }
        other => Err(DecodeError::UnknownKind(other.to_string())),
    }
}

/// Decodes a flush payload unit by unit.
///
/// Results are per unit so a malformed record is dropped by the caller
/// without poisoning its neighbors.
pub fn decode_batch(payload: &str) -> Vec<Result<Update, DecodeError>> {
    payload
        .split(RECORD_SEPARATOR)
        .filter(|unit| !unit.is_empty())
        .map(decode)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    fn all_kinds() -> Vec<Update> {
        vec![
            Update::Edit {
                path: path(&["c1", "x"]),
                value: WireValue::Json(json!(3)),
            },
            Update::Edit {
                path: path(&["c1", "gone"]),
                value: WireValue::Absent,
            },
            Update::Shift {
                path: path(&["c1", "items"]),
                from: 2,
                delta: -1,
            },
            Update::SelfProperty {
                property: "constraint".to_string(),
                data: json!({"path": ["c1", "x"], "rules": [{"name": "min", "args": [0]}]}),
            },
            Update::Connect {
                id: "c2".to_string(),
                snapshot: json!({"score": 0}),
            },
            Update::Disconnect {
                id: "c2".to_string(),
            },
            Update::Response {
                name: "ready".to_string(),
                payload: json!(true),
            },
            Update::Initialize {
                self_id: "c1".to_string(),
                tick_rate: 30,
                constraints: json!([]),
                clients: json!({"c2": {"score": 0}}),
                teams: json!({}),
                space: Some("lobby".to_string()),
            },
            Update::Initialize {
                self_id: "c1".to_string(),
                tick_rate: 60,
                constraints: json!([]),
                clients: json!({}),
                teams: json!({}),
                space: None,
            },
        ]
    }

    #[test]
    fn round_trip_every_kind() {
        for update in all_kinds() {
            let encoded = encode(&update);
            let decoded = decode(&encoded).unwrap();
            assert_eq!(decoded, update, "round trip failed for {}", encoded);
        }
    }

    #[test]
    fn delimiter_and_backslash_values_survive() {
        let update = Update::Edit {
            path: path(&["c1", "na|me"]),
            value: WireValue::Json(json!("a|b\\c|")),
        };
        let encoded = encode(&update);
        assert_eq!(decode(&encoded).unwrap(), update);
    }

    #[test]
    fn absent_is_distinct_from_null_on_the_wire() {
        let removed = Update::Edit {
            path: path(&["c1", "x"]),
            value: WireValue::Absent,
        };
        let null = Update::Edit {
            path: path(&["c1", "x"]),
            value: WireValue::Json(Value::Null),
        };
        let removed_wire = encode(&removed);
        let null_wire = encode(&null);
        assert_ne!(removed_wire, null_wire);
        assert!(removed_wire.ends_with("|~"));
        assert!(null_wire.ends_with("|null"));
        assert_eq!(decode(&removed_wire).unwrap(), removed);
        assert_eq!(decode(&null_wire).unwrap(), null);
    }

    #[test]
    fn unknown_discriminator_is_malformed() {
        let result = decode("Z|[\"a\"]|1");
        assert!(matches!(result, Err(DecodeError::UnknownKind(_))));
    }

    #[test]
    fn wrong_field_count_is_malformed() {
        let result = decode("E|[\"a\"]");
        assert!(matches!(
            result,
            Err(DecodeError::FieldCount {
                kind: 'E',
                expected: 3,
                got: 2
            })
        ));
    }

    #[test]
    fn dangling_escape_is_malformed() {
        assert!(matches!(decode("E|[\"a\"]|\\"), Err(DecodeError::BadEscape)));
        assert!(matches!(
            decode("E|[\"a\"]|\\x"),
            Err(DecodeError::BadEscape)
        ));
    }

    #[test]
    fn non_json_field_is_malformed() {
        assert!(matches!(
            decode("E|[\"a\"]|{not json"),
            Err(DecodeError::BadJson(_))
        ));
    }

    #[test]
    fn non_string_path_is_malformed() {
        assert!(matches!(decode("E|[1,2]|3"), Err(DecodeError::BadPath)));
        assert!(matches!(decode("E|{}|3"), Err(DecodeError::BadPath)));
    }

    #[test]
    fn empty_unit_is_malformed() {
        assert!(matches!(decode(""), Err(DecodeError::Empty)));
    }

    #[test]
    fn batch_round_trip_preserves_order() {
        let updates = all_kinds();
        let payload = encode_batch(&updates);
        let decoded: Vec<Update> = decode_batch(&payload)
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(decoded, updates);
    }

    #[test]
    fn batch_isolates_malformed_units() {
        let good = Update::Disconnect {
            id: "c9".to_string(),
        };
        let payload = format!("{}\nZ|bogus\n{}", encode(&good), encode(&good));
        let results = decode_batch(&payload);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }

    #[test]
    fn batch_ignores_blank_records() {
        let payload = format!("\n{}\n\n", encode(&all_kinds()[0]));
        assert_eq!(decode_batch(&payload).len(), 1);
    }
}
