//! 工具参数 JSON Schema 生成（schemars）
//!
//! 工具用一个 `#[derive(JsonSchema, Deserialize)]` 参数结构体描述入参，schema 与反序列化共用同一定义。

use schemars::{gen::SchemaSettings, JsonSchema};
use serde_json::Value;

/// 生成参数结构体的 JSON Schema（去掉 $schema / title，便于直接放进 function 定义）
pub fn schema_of<T: JsonSchema>() -> Value {
    let settings = SchemaSettings::draft07().with(|s| {
        s.inline_subschemas = true;
        s.meta_schema = None;
    });
    let schema = settings.into_generator().into_root_schema_for::<T>();
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("title");
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct Args {
        /// 目标
        to: String,
        topic: Option<String>,
    }

    #[test]
    fn test_required_fields_follow_option() {
        let schema = schema_of::<Args>();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], serde_json::json!(["to"]));
        assert!(schema.get("$schema").is_none());
    }
}
