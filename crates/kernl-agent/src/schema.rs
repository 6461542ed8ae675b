use serde_json::Value;

/// Validates `value` against a JSON schema. Every violation is reported,
/// joined with `; `.
pub fn validate_against_schema(schema: &Value, value: &Value) -> Result<(), String> {
    let validator =
        jsonschema::Validator::new(schema).map_err(|error| format!("invalid schema: {error}"))?;
    if validator.is_valid(value) {
        return Ok(());
    }
    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|error| error.to_string())
        .collect();
    Err(errors.join("; "))
}

/// Tool arguments must be a JSON object whatever the schema says.
pub fn validate_tool_arguments(schema: &Value, arguments: &Value) -> Result<(), String> {
    if !arguments.is_object() {
        return Err("tool arguments must be a JSON object".to_string());
    }
    validate_against_schema(schema, arguments)
}
