//! Schema-driven configuration merge (spec §9: "reflection-driven config
//! merging becomes a data-driven merge controlled by a schema descriptor").
//!
//! Rather than reflecting over struct fields at runtime, merge rules are
//! applied to raw JSON values before they are deserialized into
//! [`super::AgentConfig`]. `serde_json::Value` plays the role the teacher's
//! `Value` enum (`common/mod.rs`) plays for SQL values: a single dynamic
//! representation that every source format normalizes into.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Last writer wins; used for scalars (bool, number, string).
    ScalarLast,
    /// Arrays are concatenated in merge order.
    SequenceConcat,
    /// Objects are merged key-by-key, recursing with the same rule set.
    MapDeep,
}

fn rule_for(value: &Value) -> MergeRule {
    match value {
        Value::Array(_) => MergeRule::SequenceConcat,
        Value::Object(_) => MergeRule::MapDeep,
        _ => MergeRule::ScalarLast,
    }
}

/// Merge `overlay` onto `base` following the schema rules above. Associative
/// on disjoint keys; last-wins on scalar conflicts (spec §8).
pub fn merge_values(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_val) => merge_values(base_val, overlay_val),
                    None => {
                        base_map.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
        }
        (base_slot, overlay_val) => {
            let rule = rule_for(overlay_val);
            match rule {
                MergeRule::SequenceConcat => {
                    if let (Value::Array(base_arr), Value::Array(overlay_arr)) =
                        (base_slot.clone(), overlay_val.clone())
                    {
                        let mut combined = base_arr;
                        combined.extend(overlay_arr);
                        *base_slot = Value::Array(combined);
                    } else {
                        *base_slot = overlay_val.clone();
                    }
                }
                MergeRule::MapDeep | MergeRule::ScalarLast => {
                    *base_slot = overlay_val.clone();
                }
            }
        }
    }
}

/// Merge a sequence of config sources in priority order:
/// `defaults -> files (alphabetical) -> flags -> overrides`.
pub fn merge_configs(sources: &[Value]) -> Value {
    let mut result = Value::Object(serde_json::Map::new());
    for source in sources {
        merge_values(&mut result, source);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_last_wins() {
        let a = json!({"datacenter": "dc1"});
        let b = json!({"datacenter": "dc2"});
        let merged = merge_configs(&[a, b]);
        assert_eq!(merged["datacenter"], "dc2");
    }

    #[test]
    fn sequences_concatenate() {
        let a = json!({"retry_join": ["a"]});
        let b = json!({"retry_join": ["b"]});
        let merged = merge_configs(&[a, b]);
        assert_eq!(merged["retry_join"], json!(["a", "b"]));
    }

    #[test]
    fn maps_deep_merge() {
        let a = json!({"acl": {"enabled": true, "default_policy": "deny"}});
        let b = json!({"acl": {"enabled": false}});
        let merged = merge_configs(&[a, b]);
        assert_eq!(merged["acl"]["enabled"], false);
        assert_eq!(merged["acl"]["default_policy"], "deny");
    }

    #[test]
    fn associative_on_disjoint_keys() {
        let a = json!({"x": 1});
        let b = json!({"y": 2});
        let c = json!({"z": 3});

        let left_first = merge_configs(&[merge_configs(&[a.clone(), b.clone()]), c.clone()]);
        let right_first = merge_configs(&[a, merge_configs(&[b, c])]);
        assert_eq!(left_first, right_first);
    }
}
