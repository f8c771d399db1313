//! Path expressions over structured payloads.
//!
//! A path is a sequence of key and index tokens parsed from text such as
//! `emeters[0].power`, `emeters.0.power` or `a.b[2][1]`. Evaluation walks a
//! `serde_json::Value` one token at a time.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};
use thiserror::Error;

/// Path parsing or evaluation failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path expression")]
    Empty,

    #[error("malformed path expression '{0}'")]
    Malformed(String),

    #[error("'{path}': no value at '{segment}'")]
    Missing { path: String, segment: String },

    #[error("'{path}': index {index} out of range")]
    IndexOutOfRange { path: String, index: usize },

    #[error("'{path}': '{segment}' is not an object or array")]
    NotContainer { path: String, segment: String },
}

/// One step of a path expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathToken {
    Key(String),
    Index(usize),
}

impl PathToken {
    fn from_segment(segment: &str) -> Self {
        if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(index) = segment.parse::<usize>() {
                return PathToken::Index(index);
            }
        }
        PathToken::Key(segment.to_string())
    }
}

impl fmt::Display for PathToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathToken::Key(k) => write!(f, "{}", k),
            PathToken::Index(i) => write!(f, "[{}]", i),
        }
    }
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathExpr {
    raw: String,
    tokens: Vec<PathToken>,
}

impl PathExpr {
    /// Parse a dotted/bracketed expression.
    ///
    /// Empty segments produced by adjacent separators (`a..b`, `a[0].b`) are
    /// skipped. A `[` without its closing `]` is malformed.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let trimmed = raw.trim();
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut chars = trimmed.chars();

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if !current.is_empty() {
                        tokens.push(PathToken::from_segment(&current));
                        current.clear();
                    }
                }
                '[' => {
                    if !current.is_empty() {
                        tokens.push(PathToken::from_segment(&current));
                        current.clear();
                    }
                    let mut inner = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == ']' {
                            closed = true;
                            break;
                        }
                        inner.push(c);
                    }
                    if !closed {
                        return Err(PathError::Malformed(raw.to_string()));
                    }
                    let inner = inner.trim().trim_matches(|c| c == '"' || c == '\'');
                    if !inner.is_empty() {
                        tokens.push(PathToken::from_segment(inner));
                    }
                }
                ']' => return Err(PathError::Malformed(raw.to_string())),
                _ => current.push(c),
            }
        }
        if !current.is_empty() {
            tokens.push(PathToken::from_segment(&current));
        }

        if tokens.is_empty() {
            return Err(PathError::Empty);
        }

        Ok(Self {
            raw: trimmed.to_string(),
            tokens,
        })
    }

    /// Build a key-only path, e.g. from CLI arguments.
    pub fn from_keys<I, S>(keys: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens: Vec<PathToken> = keys
            .into_iter()
            .map(|k| PathToken::Key(k.as_ref().to_string()))
            .collect();
        if tokens.is_empty() {
            return Err(PathError::Empty);
        }
        let raw = tokens
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(".");
        Ok(Self { raw, tokens })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn tokens(&self) -> &[PathToken] {
        &self.tokens
    }

    /// Resolve the path against `value`.
    pub fn evaluate<'a>(&self, value: &'a Value) -> Result<&'a Value, PathError> {
        resolve(value, &self.tokens, &self.raw)
    }

    /// Like [`evaluate`](Self::evaluate), discarding the failure reason.
    pub fn get<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.evaluate(value).ok()
    }

    /// Write `new_value` at the path, creating intermediate objects.
    ///
    /// A key step on a non-object replaces it with an empty object. An index
    /// step must address an existing array element (or a numeric key of an
    /// object).
    pub fn set(&self, target: &mut Value, new_value: Value) -> Result<(), PathError> {
        assign(target, &self.tokens, new_value, &self.raw)
    }
}

impl FromStr for PathExpr {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn resolve<'a>(value: &'a Value, tokens: &[PathToken], raw: &str) -> Result<&'a Value, PathError> {
    let Some((head, rest)) = tokens.split_first() else {
        return Ok(value);
    };

    let next = match (head, value) {
        (PathToken::Key(key), Value::Object(map)) => map.get(key),
        (PathToken::Index(index), Value::Array(items)) => items.get(*index),
        // Numeric keys such as `emeter.0` are common in device payloads.
        (PathToken::Index(index), Value::Object(map)) => map.get(&index.to_string()),
        _ => None,
    };

    match next {
        Some(child) => resolve(child, rest, raw),
        None => Err(PathError::Missing {
            path: raw.to_string(),
            segment: head.to_string(),
        }),
    }
}

fn assign(target: &mut Value, tokens: &[PathToken], new_value: Value, raw: &str) -> Result<(), PathError> {
    let Some((head, rest)) = tokens.split_first() else {
        *target = new_value;
        return Ok(());
    };

    match head {
        PathToken::Key(key) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            let Some(map) = target.as_object_mut() else {
                return Err(PathError::NotContainer {
                    path: raw.to_string(),
                    segment: head.to_string(),
                });
            };
            if rest.is_empty() {
                map.insert(key.clone(), new_value);
                return Ok(());
            }
            let child = map.entry(key.clone()).or_insert(Value::Null);
            assign(child, rest, new_value, raw)
        }
        PathToken::Index(index) => match target {
            Value::Array(items) => {
                let child = items.get_mut(*index).ok_or(PathError::IndexOutOfRange {
                    path: raw.to_string(),
                    index: *index,
                })?;
                assign(child, rest, new_value, raw)
            }
            Value::Object(map) => {
                let child = map.entry(index.to_string()).or_insert(Value::Null);
                assign(child, rest, new_value, raw)
            }
            _ => Err(PathError::NotContainer {
                path: raw.to_string(),
                segment: head.to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "sensor": { "temp": 21.5, "tags": ["a", "b"] },
            "emeters": [ { "power": 10 }, { "power": 42 } ],
            "emeter": { "0": { "total": 7 } },
            "params": { "em:0": { "a_act_power": 3.3 } }
        })
    }

    #[test]
    fn test_parse_dots_and_brackets() {
        let path = PathExpr::parse("emeters[1].power").unwrap();
        assert_eq!(
            path.tokens(),
            &[
                PathToken::Key("emeters".into()),
                PathToken::Index(1),
                PathToken::Key("power".into())
            ]
        );

        let dotted = PathExpr::parse("emeters.1.power").unwrap();
        assert_eq!(dotted.tokens(), path.tokens());

        let nested = PathExpr::parse("a[2][1]").unwrap();
        assert_eq!(
            nested.tokens(),
            &[PathToken::Key("a".into()), PathToken::Index(2), PathToken::Index(1)]
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(PathExpr::parse(""), Err(PathError::Empty));
        assert_eq!(PathExpr::parse(" . "), Err(PathError::Empty));
        assert!(matches!(PathExpr::parse("a[0"), Err(PathError::Malformed(_))));
        assert!(matches!(PathExpr::parse("a]0"), Err(PathError::Malformed(_))));
    }

    #[test]
    fn test_evaluate_leaf() {
        let data = sample();
        let path: PathExpr = "emeters[1].power".parse().unwrap();
        assert_eq!(path.evaluate(&data).unwrap(), &json!(42));

        let path: PathExpr = "sensor.tags[0]".parse().unwrap();
        assert_eq!(path.evaluate(&data).unwrap(), &json!("a"));

        let path: PathExpr = "params.em:0.a_act_power".parse().unwrap();
        assert_eq!(path.evaluate(&data).unwrap(), &json!(3.3));
    }

    #[test]
    fn test_evaluate_numeric_object_key() {
        let data = sample();
        let path: PathExpr = "emeter.0.total".parse().unwrap();
        assert_eq!(path.evaluate(&data).unwrap(), &json!(7));
    }

    #[test]
    fn test_evaluate_sub_structure() {
        let data = sample();
        let path: PathExpr = "sensor".parse().unwrap();
        assert_eq!(path.evaluate(&data).unwrap()["temp"], json!(21.5));
    }

    #[test]
    fn test_missing_intermediate_key() {
        let data = sample();
        let path: PathExpr = "sensor.missing.value".parse().unwrap();
        let err = path.evaluate(&data).unwrap_err();
        assert_eq!(
            err,
            PathError::Missing {
                path: "sensor.missing.value".into(),
                segment: "missing".into()
            }
        );
        assert!(path.get(&data).is_none());

        let out_of_range: PathExpr = "emeters[5].power".parse().unwrap();
        assert!(out_of_range.evaluate(&data).is_err());
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut doc = json!({ "settings": { "qos": 0 } });
        PathExpr::parse("settings.qos").unwrap().set(&mut doc, json!(1)).unwrap();
        PathExpr::parse("periodic.active").unwrap().set(&mut doc, json!(true)).unwrap();
        assert_eq!(doc, json!({ "settings": { "qos": 1 }, "periodic": { "active": true } }));
    }

    #[test]
    fn test_set_replaces_scalar_with_object() {
        let mut doc = json!({ "settings": 5 });
        PathExpr::from_keys(["settings", "auth"])
            .unwrap()
            .set(&mut doc, json!(true))
            .unwrap();
        assert_eq!(doc, json!({ "settings": { "auth": true } }));
    }

    #[test]
    fn test_set_array_element() {
        let mut doc = json!({ "topics": ["a", "b"] });
        let path = PathExpr::parse("topics[1]").unwrap();
        path.set(&mut doc, json!("c")).unwrap();
        assert_eq!(doc["topics"], json!(["a", "c"]));

        let past_end = PathExpr::parse("topics[4]").unwrap();
        assert!(matches!(
            past_end.set(&mut doc, json!("x")),
            Err(PathError::IndexOutOfRange { .. })
        ));
    }
}
