pub mod anthropic;
pub mod bedrock;
pub mod compat;
pub mod gemini;
pub mod openai;

/// Shared JSON-Schema cleaning used by OpenAI `json_schema` response formats and by the
/// Compat engine's `SupportsJSONSchema` vendors (OpenRouter). Recursively strips
/// `examples`/`default`/`const` and forces `additionalProperties: false` on every object
/// node. Idempotent: running it twice produces the same output as running it once.
pub fn clean_json_schema(schema: &mut serde_json::Value) {
    match schema {
        serde_json::Value::Object(map) => {
            map.remove("examples");
            map.remove("default");
            map.remove("const");
            if map.get("type").and_then(|t| t.as_str()) == Some("object") {
                map.insert("additionalProperties".to_string(), serde_json::json!(false));
            }
            for (_, v) in map.iter_mut() {
                clean_json_schema(v);
            }
        }
        serde_json::Value::Array(arr) => {
            for v in arr.iter_mut() {
                clean_json_schema(v);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_disallowed_keys_and_sets_additional_properties() {
        let mut schema = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "examples": ["a"], "default": "x"},
            },
            "const": "unused",
        });
        clean_json_schema(&mut schema);
        assert_eq!(schema["additionalProperties"], json!(false));
        assert!(schema.get("const").is_none());
        assert!(schema["properties"]["name"].get("examples").is_none());
        assert!(schema["properties"]["name"].get("default").is_none());
    }

    #[test]
    fn cleaning_is_idempotent() {
        let mut schema = json!({"type": "object", "properties": {"a": {"type": "object"}}});
        clean_json_schema(&mut schema);
        let once = schema.clone();
        clean_json_schema(&mut schema);
        assert_eq!(once, schema);
    }
}
