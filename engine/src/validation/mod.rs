//! JSON Schema (draft 7) validation.
//!
//! The cleaned-schema contract is exported as a JSON Schema by
//! [`crate::schema::DatasetSchema::to_json_schema`] and checked here on every
//! cleaned record before it reaches Silver.

use serde_json::Value;

/// Validate a JSON value against a JSON schema.
///
/// # Returns
/// * `Ok(())` if valid
/// * `Err(Vec<String>)` with every violation otherwise
///
/// # Example
/// ```ignore
/// use serde_json::json;
/// use refinery::validation::validate;
///
/// let schema = json!({
///     "type": "object",
///     "required": ["item"],
///     "properties": { "item": { "type": "string" } }
/// });
///
/// assert!(validate(&schema, &json!({ "item": "FDA15" })).is_ok());
/// assert!(validate(&schema, &json!({ "sales": 42 })).is_err());
/// ```
pub fn validate(schema: &Value, data: &Value) -> Result<(), Vec<String>> {
    Contract::compile(schema)
        .map_err(|e| vec![e])?
        .check(data)
}

/// Quick true/false check.
pub fn is_valid(schema: &Value, data: &Value) -> bool {
    jsonschema::draft7::is_valid(schema, data)
}

/// A compiled schema, reused across every row of a batch.
pub struct Contract {
    validator: jsonschema::Validator,
}

impl Contract {
    pub fn compile(schema: &Value) -> Result<Self, String> {
        let validator =
            jsonschema::draft7::new(schema).map_err(|e| format!("Invalid schema: {}", e))?;
        Ok(Self { validator })
    }

    pub fn check(&self, data: &Value) -> Result<(), Vec<String>> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(data)
            .map(|e| e.to_string())
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["item", "fat_content"],
            "properties": {
                "item": { "type": "string" },
                "fat_content": { "enum": ["Low Fat", "Regular"] },
                "sales": { "type": ["number", "null"] }
            }
        })
    }

    #[test]
    fn test_valid_record() {
        let row = json!({ "item": "FDA15", "fat_content": "Low Fat", "sales": 3735.1 });
        assert!(validate(&schema(), &row).is_ok());
        assert!(is_valid(&schema(), &row));
    }

    #[test]
    fn test_collects_all_errors() {
        let row = json!({ "fat_content": "LF", "sales": "lots" });
        let errors = validate(&schema(), &row).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_invalid_schema_reported() {
        let bad = json!({ "type": 12 });
        assert!(Contract::compile(&bad).is_err());
    }
}
