use serde_json::Value;

pub enum NullableValue {
    Omitted,
    Null,
    String(String),
}

pub fn classify_nullable(optional_value: Option<&Value>) -> Result<NullableValue, String> {
    match optional_value {
        None => Ok(NullableValue::Omitted),
        Some(Value::Null) => Ok(NullableValue::Null),
        Some(Value::String(s)) => Ok(NullableValue::String(s.to_owned())),
        Some(other) => Err(format!("expected string or null, got {other}")),
    }
}

pub fn nullable_text(body: &Value, field: &str) -> Result<Option<Option<String>>, String> {
    match classify_nullable(body.get(field)).map_err(|err| format!("{field}: {err}"))? {
        NullableValue::Omitted => Ok(None),
        NullableValue::Null => Ok(Some(None)),
        NullableValue::String(value) => {
            let trimmed = value.trim();
            Ok(Some((!trimmed.is_empty()).then(|| trimmed.to_string())))
        }
    }
}

pub fn required_text(body: &Value, field: &str) -> Result<Option<String>, String> {
    match classify_nullable(body.get(field)).map_err(|err| format!("{field}: {err}"))? {
        NullableValue::Omitted => Ok(None),
        NullableValue::Null => Err(format!("{field} cannot be null")),
        NullableValue::String(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(format!("{field} must not be empty"));
            }
            Ok(Some(trimmed.to_string()))
        }
    }
}

pub fn optional_bool(body: &Value, field: &str) -> Result<Option<bool>, String> {
    match body.get(field) {
        None => Ok(None),
        Some(Value::Bool(flag)) => Ok(Some(*flag)),
        Some(other) => Err(format!("{field}: expected boolean, got {other}")),
    }
}
