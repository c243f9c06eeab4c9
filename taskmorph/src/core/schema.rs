//! JSON Schema checks for action contracts and provider candidates.

use anyhow::{Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;

/// Validate `instance` against `schema`, returning every violation message.
///
/// An empty vector means the instance conforms. A schema that fails to
/// compile is an error rather than a violation.
pub fn schema_errors(schema: &Value, instance: &Value) -> Result<Vec<String>> {
    let compiled = validator_for(schema).map_err(|err| anyhow!("invalid schema: {err}"))?;
    if compiled.is_valid(instance) {
        return Ok(Vec::new());
    }
    Ok(compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect())
}
