//! 工具参数 Schema 与参数解析
//!
//! 参数结构体 derive `JsonSchema + Deserialize`，声明与解析共用同一份类型定义，
//! 声明中的 schema 由 schemars 生成，解析失败统一为 ValidationError。

use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::ToolError;

/// 生成参数 JSON Schema（去掉 `$schema` / `title`，Option 字段不附加 null 类型）
pub fn parameters_schema<T: JsonSchema>() -> Value {
    let gen = SchemaSettings::draft07()
        .with(|s| {
            s.option_add_null_type = false;
            s.option_nullable = false;
        })
        .into_generator();
    let root = gen.into_root_schema_for::<T>();
    let mut value = serde_json::to_value(root).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
        obj.entry("properties").or_insert_with(|| serde_json::json!({}));
        obj.entry("required").or_insert_with(|| serde_json::json!([]));
    }
    value
}

/// 把模型给出的参数反序列化为具体类型；null 视为空对象
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| ToolError::Validation(format!("invalid arguments: {}", e)))
}
