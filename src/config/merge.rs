//! Layer merge logic
//!
//! - Objects: deep-merge by key
//! - Arrays: replace (last wins)
//! - Scalars and null: override (last wins)

use serde_json::Value;

/// Deep merge `overlay` onto `base`.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Merge layers in order; later layers take precedence.
pub fn merge_layers(layers: impl IntoIterator<Item = Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sections_merge_by_key() {
        let base = json!({"storage": {"path": "/var/lib/driftgate", "hostname": "a:80"}});
        let overlay = json!({"storage": {"hostname": "b:80"}});
        let result = deep_merge(base, overlay);

        assert_eq!(result["storage"]["path"], "/var/lib/driftgate");
        assert_eq!(result["storage"]["hostname"], "b:80");
    }

    #[test]
    fn test_ignore_list_is_replaced() {
        let base = json!({"archive": {"ignore": ["*.md", "docs/"]}});
        let overlay = json!({"archive": {"ignore": ["*.tmp"]}});
        let result = deep_merge(base, overlay);

        assert_eq!(result["archive"]["ignore"], json!(["*.tmp"]));
    }

    #[test]
    fn test_null_overrides() {
        let result = deep_merge(json!({"dir": "/x"}), json!({"dir": null}));
        assert!(result["dir"].is_null());
    }

    #[test]
    fn test_last_layer_wins() {
        let result = merge_layers(vec![
            json!({"reconcile": {"max_concurrent": 4, "timeout_seconds": 600}}),
            json!({"reconcile": {"max_concurrent": 8}}),
            json!({"reconcile": {"max_concurrent": 2}}),
        ]);

        assert_eq!(result["reconcile"]["max_concurrent"], 2);
        assert_eq!(result["reconcile"]["timeout_seconds"], 600);
    }
}
