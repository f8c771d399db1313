//! Schema registry model and per-message routing.
//!
//! A [`Schema`] groups sub-schemas under a database label. Each
//! [`SubSchema`] binds device identifiers and topic filters to a collection
//! label plus two mappings:
//!
//! - `path_mapping`: how the destination collection name is derived
//! - `data_mapping`: which payload values are stored, by field name
//!
//! Routing and extraction are pure functions over a schema snapshot so the
//! ingestion worker only has to parse, call [`route`] and [`extract`], and
//! write.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::path::{PathError, PathExpr};
use crate::topic::{self, TopicMatch};

/// Reserved path-mapping key: name collections after the last wildcard
/// level of the matched topic filter.
pub const NO_SUBPATH_KEY: &str = "NOsubpath";

/// Reserved path-mapping key: one shared payload expression names the
/// collection for every field.
pub const SUBPATH_KEY: &str = "subpath";

/// Routing rules for one database label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Schema {
    pub database: String,
    #[serde(default)]
    pub sub_schemas: Vec<SubSchema>,
}

/// One routing rule inside a [`Schema`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SubSchema {
    /// Collection label recorded in metadata.
    pub collection: String,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub path_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub data_mapping: BTreeMap<String, String>,
}

/// How one data-mapping field names its destination collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamingRule {
    /// The field has its own path-mapping expression.
    Named(String),
    /// `NOsubpath`: last wildcard level of the matched filter.
    TopicWildcard,
    /// `subpath`: one shared expression evaluated once per message.
    Shared(String),
    /// No path-mapping at all; the device name is used.
    DeviceFallback,
    /// A path-mapping exists but none of its entries applies to this field.
    Unmapped,
}

/// One field of the data-mapping with its resolved naming strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRule {
    pub field: String,
    pub value_path: String,
    pub naming: NamingRule,
}

impl SubSchema {
    /// Resolve every data-mapping field to a naming strategy.
    ///
    /// Priority: the field's own path-mapping entry, then `NOsubpath`, then
    /// `subpath`.
    pub fn field_rules(&self) -> Vec<FieldRule> {
        self.data_mapping
            .iter()
            .map(|(field, value_path)| {
                let naming = if let Some(expr) = self.path_mapping.get(field) {
                    NamingRule::Named(expr.clone())
                } else if self.path_mapping.contains_key(NO_SUBPATH_KEY) {
                    NamingRule::TopicWildcard
                } else if let Some(expr) = self.path_mapping.get(SUBPATH_KEY) {
                    NamingRule::Shared(expr.clone())
                } else if self.path_mapping.is_empty() {
                    NamingRule::DeviceFallback
                } else {
                    NamingRule::Unmapped
                };
                FieldRule {
                    field: field.clone(),
                    value_path: value_path.clone(),
                    naming,
                }
            })
            .collect()
    }

    pub fn has_device(&self, segment: &str) -> bool {
        self.devices.iter().any(|d| d == segment)
    }

    /// First topic filter satisfied by `topic`.
    pub fn match_topic(&self, topic: &str) -> Option<(&str, TopicMatch)> {
        self.topics
            .iter()
            .find_map(|filter| topic::match_filter(filter, topic).map(|m| (filter.as_str(), m)))
    }
}

/// A message's resolved destination within a schema snapshot.
#[derive(Debug, Clone)]
pub struct Route<'s> {
    pub schema: &'s Schema,
    pub sub_schema: &'s SubSchema,
    /// Matched topic level. It names both the device and the destination
    /// database.
    pub device: String,
    pub filter: &'s str,
    pub topic_match: TopicMatch,
}

impl Route<'_> {
    /// Destination database. Aliases the device level of the topic.
    pub fn database(&self) -> &str {
        &self.device
    }
}

/// Resolve the destination of `topic`.
///
/// Topic levels are scanned in order and the first level that is a device of
/// any sub-schema decides the route. Among the sub-schemas claiming that
/// level, in snapshot order, the first one with a filter matching `topic`
/// wins. If none of them has a matching filter the message is unrouted; later
/// levels are not considered.
pub fn route<'s>(schemas: &'s [Schema], topic: &str) -> Option<Route<'s>> {
    let device = topic.split('/').find(|segment| {
        schemas
            .iter()
            .flat_map(|schema| &schema.sub_schemas)
            .any(|sub_schema| sub_schema.has_device(segment))
    })?;

    schemas.iter().find_map(|schema| {
        schema
            .sub_schemas
            .iter()
            .filter(|sub_schema| sub_schema.has_device(device))
            .find_map(|sub_schema| {
                let (filter, topic_match) = sub_schema.match_topic(topic)?;
                Some(Route {
                    schema,
                    sub_schema,
                    device: device.to_string(),
                    filter,
                    topic_match,
                })
            })
    })
}

/// Why a data-mapping field was left out of the stored document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FieldSkip {
    #[error("no path mapping found")]
    NoMapping,

    #[error("topic filter '{0}' has no wildcard level")]
    NoWildcard(String),

    #[error("topic filter '{0}' no longer matches")]
    FilterMismatch(String),

    #[error("value: {0}")]
    Value(PathError),

    #[error("collection name: {0}")]
    Naming(PathError),

    #[error("collection name is empty")]
    EmptyName,
}

/// Result of applying a sub-schema's mappings to one payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// Transformed field mapping, keyed by data-mapping field name.
    pub fields: Map<String, Value>,
    /// Specific collection name, if any field produced one.
    pub collection: Option<String>,
    pub skipped: Vec<(String, FieldSkip)>,
}

impl Extraction {
    /// Destination collection, falling back to the device name.
    pub fn collection_or<'a>(&'a self, device: &'a str) -> &'a str {
        self.collection.as_deref().unwrap_or(device)
    }
}

/// Apply the routed sub-schema's data-mapping to `payload`.
///
/// Failures are local to one field. When several fields name a collection,
/// the last one in field order wins.
pub fn extract(route: &Route<'_>, topic: &str, payload: &Value) -> Extraction {
    let mut out = Extraction::default();
    let mut shared: Option<Result<String, PathError>> = None;

    for rule in route.sub_schema.field_rules() {
        let fragment = match &rule.naming {
            NamingRule::Named(expr) => match evaluate(expr, payload) {
                Ok(v) => Some(fragment_of(v)),
                Err(e) => {
                    out.skipped.push((rule.field, FieldSkip::Naming(e)));
                    continue;
                }
            },
            NamingRule::TopicWildcard => {
                let Some(current) = topic::match_filter(route.filter, topic) else {
                    out.skipped
                        .push((rule.field, FieldSkip::FilterMismatch(route.filter.to_string())));
                    continue;
                };
                match current.last_wildcard() {
                    Some(level) => Some(level.to_string()),
                    None => {
                        out.skipped
                            .push((rule.field, FieldSkip::NoWildcard(route.filter.to_string())));
                        continue;
                    }
                }
            }
            NamingRule::Shared(expr) => {
                let resolved = shared
                    .get_or_insert_with(|| evaluate(expr, payload).map(fragment_of))
                    .clone();
                match resolved {
                    Ok(name) => Some(name),
                    Err(e) => {
                        out.skipped.push((rule.field, FieldSkip::Naming(e)));
                        continue;
                    }
                }
            }
            NamingRule::DeviceFallback => None,
            NamingRule::Unmapped => {
                out.skipped.push((rule.field, FieldSkip::NoMapping));
                continue;
            }
        };
        if fragment.as_deref().is_some_and(str::is_empty) {
            out.skipped.push((rule.field, FieldSkip::EmptyName));
            continue;
        }

        match evaluate(&rule.value_path, payload) {
            Ok(value) => {
                out.fields.insert(rule.field, value.clone());
                if fragment.is_some() {
                    out.collection = fragment;
                }
            }
            Err(e) => out.skipped.push((rule.field, FieldSkip::Value(e))),
        }
    }

    out
}

fn evaluate<'a>(expr: &str, payload: &'a Value) -> Result<&'a Value, PathError> {
    PathExpr::parse(expr)?.evaluate(payload)
}

fn fragment_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sub(devices: &[&str], topics: &[&str], path: &[(&str, &str)], data: &[(&str, &str)]) -> SubSchema {
        SubSchema {
            collection: "readings".to_string(),
            devices: devices.iter().map(|s| s.to_string()).collect(),
            topics: topics.iter().map(|s| s.to_string()).collect(),
            path_mapping: path.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            data_mapping: data.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn schema(subs: Vec<SubSchema>) -> Vec<Schema> {
        vec![Schema {
            database: "home".to_string(),
            sub_schemas: subs,
        }]
    }

    #[test]
    fn test_field_rule_priority() {
        let s = sub(
            &["d"],
            &["#"],
            &[("power", "meta.name"), (NO_SUBPATH_KEY, ""), (SUBPATH_KEY, "x")],
            &[("power", "p"), ("energy", "e")],
        );
        let rules = s.field_rules();
        assert_eq!(rules[0].field, "energy");
        assert_eq!(rules[0].naming, NamingRule::TopicWildcard);
        assert_eq!(rules[1].naming, NamingRule::Named("meta.name".into()));

        let shared = sub(&["d"], &["#"], &[(SUBPATH_KEY, "id")], &[("a", "a")]);
        assert_eq!(shared.field_rules()[0].naming, NamingRule::Shared("id".into()));

        let none = sub(&["d"], &["#"], &[], &[("a", "a")]);
        assert_eq!(none.field_rules()[0].naming, NamingRule::DeviceFallback);

        let unrelated = sub(&["d"], &["#"], &[("other", "x")], &[("a", "a")]);
        assert_eq!(unrelated.field_rules()[0].naming, NamingRule::Unmapped);
    }

    #[test]
    fn test_route_requires_device_and_filter() {
        let schemas = schema(vec![sub(&["kitchen"], &["home/+/power"], &[], &[("w", "watts")])]);

        let r = route(&schemas, "home/kitchen/power").unwrap();
        assert_eq!(r.device, "kitchen");
        assert_eq!(r.database(), "kitchen");
        assert_eq!(r.filter, "home/+/power");

        assert!(route(&schemas, "home/garage/power").is_none());
        assert!(route(&schemas, "home/kitchen/temp").is_none());
    }

    #[test]
    fn test_route_falls_through_to_later_sub_schema() {
        let schemas = schema(vec![
            sub(&["kitchen"], &["other/#"], &[], &[]),
            sub(&["kitchen"], &["home/#"], &[], &[]),
        ]);
        let r = route(&schemas, "home/kitchen/power").unwrap();
        assert_eq!(r.filter, "home/#");
    }

    #[test]
    fn test_route_first_device_level_wins_across_schemas() {
        let schemas = vec![
            Schema {
                database: "a".to_string(),
                sub_schemas: vec![sub(&["x"], &["#"], &[], &[])],
            },
            Schema {
                database: "b".to_string(),
                sub_schemas: vec![sub(&["home"], &["#"], &[], &[])],
            },
        ];
        let r = route(&schemas, "home/x/power").unwrap();
        assert_eq!(r.device, "home");
        assert_eq!(r.database(), "home");
        assert_eq!(r.schema.database, "b");
    }

    #[test]
    fn test_route_stops_at_first_device_level() {
        // "home" is claimed but its filter does not match; "kitchen" is
        // never considered.
        let schemas = schema(vec![
            sub(&["home"], &["other/#"], &[], &[]),
            sub(&["kitchen"], &["home/#"], &[], &[]),
        ]);
        assert!(route(&schemas, "home/kitchen/power").is_none());
    }

    #[test]
    fn test_extract_device_fallback() {
        let schemas = schema(vec![sub(&["kitchen"], &["home/+/power"], &[], &[("w", "watts")])]);
        let topic = "home/kitchen/power";
        let r = route(&schemas, topic).unwrap();
        let out = extract(&r, topic, &json!({ "watts": 120 }));
        assert_eq!(out.fields, json!({ "w": 120 }).as_object().cloned().unwrap());
        assert_eq!(out.collection, None);
        assert_eq!(out.collection_or(&r.device), "kitchen");
    }

    #[test]
    fn test_extract_topic_wildcard() {
        let schemas = schema(vec![sub(
            &["devA"],
            &["shellies/+/emeter/+/hourly-energy"],
            &[(NO_SUBPATH_KEY, "")],
            &[("energy", "total")],
        )]);
        let topic = "shellies/devA/emeter/0/hourly-energy";
        let r = route(&schemas, topic).unwrap();
        let out = extract(&r, topic, &json!({ "total": 12.5 }));
        assert_eq!(out.collection.as_deref(), Some("0"));
        assert_eq!(out.fields["energy"], json!(12.5));
    }

    #[test]
    fn test_extract_topic_wildcard_without_wildcard_filter() {
        let schemas = schema(vec![sub(
            &["devA"],
            &["shellies/devA/power"],
            &[(NO_SUBPATH_KEY, "")],
            &[("p", "p")],
        )]);
        let topic = "shellies/devA/power";
        let r = route(&schemas, topic).unwrap();
        let out = extract(&r, topic, &json!({ "p": 1 }));
        assert!(out.fields.is_empty());
        assert!(matches!(out.skipped[0].1, FieldSkip::NoWildcard(_)));
    }

    #[test]
    fn test_extract_named_and_shared() {
        let schemas = schema(vec![sub(
            &["em1"],
            &["meters/#"],
            &[("power", "channel.name")],
            &[("power", "channel.power")],
        )]);
        let topic = "meters/em1";
        let r = route(&schemas, topic).unwrap();
        let out = extract(&r, topic, &json!({ "channel": { "name": "phase_a", "power": 7 } }));
        assert_eq!(out.collection.as_deref(), Some("phase_a"));
        assert_eq!(out.fields["power"], json!(7));

        let schemas = schema(vec![sub(
            &["em1"],
            &["meters/#"],
            &[(SUBPATH_KEY, "id")],
            &[("a", "values[0]"), ("b", "values[1]")],
        )]);
        let r = route(&schemas, topic).unwrap();
        let out = extract(&r, topic, &json!({ "id": 3, "values": [1, 2] }));
        assert_eq!(out.collection.as_deref(), Some("3"));
        assert_eq!(out.fields.len(), 2);
    }

    #[test]
    fn test_extract_empty_collection_name_skips_field() {
        let schemas = schema(vec![sub(
            &["em1"],
            &["meters/#"],
            &[("a", "label"), ("b", "other")],
            &[("a", "v"), ("b", "v")],
        )]);
        let topic = "meters/em1";
        let r = route(&schemas, topic).unwrap();
        let out = extract(&r, topic, &json!({ "label": "", "other": "line", "v": 1 }));
        assert_eq!(out.skipped, vec![("a".to_string(), FieldSkip::EmptyName)]);
        assert_eq!(out.collection.as_deref(), Some("line"));
        assert_eq!(out.fields, json!({ "b": 1 }).as_object().cloned().unwrap());
    }

    #[test]
    fn test_extract_missing_field_is_local() {
        let schemas = schema(vec![sub(
            &["em1"],
            &["meters/#"],
            &[],
            &[("ok", "a"), ("bad", "missing.key")],
        )]);
        let topic = "meters/em1";
        let r = route(&schemas, topic).unwrap();
        let out = extract(&r, topic, &json!({ "a": 1 }));
        assert_eq!(out.fields.len(), 1);
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.skipped[0].0, "bad");
        assert!(matches!(out.skipped[0].1, FieldSkip::Value(PathError::Missing { .. })));
    }

    #[test]
    fn test_extract_unmapped_field_skipped() {
        let schemas = schema(vec![sub(
            &["em1"],
            &["meters/#"],
            &[("other", "x")],
            &[("a", "a")],
        )]);
        let topic = "meters/em1";
        let r = route(&schemas, topic).unwrap();
        let out = extract(&r, topic, &json!({ "a": 1 }));
        assert!(out.fields.is_empty());
        assert_eq!(out.skipped, vec![("a".to_string(), FieldSkip::NoMapping)]);
    }

    #[test]
    fn test_schema_json_shape() {
        let raw = json!({
            "database": "energy",
            "sub_schemas": [{
                "collection": "emeter",
                "devices": ["devA"],
                "topics": ["shellies/+/emeter/+/hourly-energy"],
                "path_mapping": { "NOsubpath": "" },
                "data_mapping": { "energy": "total" }
            }]
        });
        let parsed: Schema = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.sub_schemas[0].devices, vec!["devA"]);
        assert!(parsed.sub_schemas[0].path_mapping.contains_key(NO_SUBPATH_KEY));
    }
}
