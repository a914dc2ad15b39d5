//! Validation and sanitization of untrusted drawing-object payloads.
//!
//! DESIGN
//! ======
//! Three gates, in order:
//! 1. Complexity caps on the raw map (nesting depth, total key count),
//!    so a hostile payload is bounded before any deeper work.
//! 2. Schema projection: the untyped map is deserialized into the typed
//!    shape for its tag, which rejects missing required fields, then the
//!    declarative `validator` constraints reject out-of-range values.
//! 3. Sanitization: every string leaf of the original map is run through
//!    a strip-everything HTML policy, recursively.
//!
//! The shape tag set is a closed whitelist. `path` and `brush` are two
//! tags for the same freehand-stroke schema.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

use crate::config::GlobalConfig;

// =============================================================================
// ERROR TYPE
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid object type: {0}")]
    UnknownType(String),
    #[error("failed to parse object data: {0}")]
    Malformed(String),
    #[error("validation failed: {0}")]
    Constraint(String),
    #[error("object nesting too deep: {depth} levels (max {max})")]
    TooDeep { depth: usize, max: usize },
    #[error("object too complex: {keys} keys (max {max})")]
    TooComplex { keys: usize, max: usize },
}

// =============================================================================
// SHAPE SCHEMAS
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct RectData {
    #[validate(range(min = -1000000.0, max = 1000000.0))]
    x: f64,
    #[validate(range(min = -1000000.0, max = 1000000.0))]
    y: f64,
    #[validate(range(min = 0.0, max = 1000000.0))]
    width: f64,
    #[validate(range(min = 0.0, max = 1000000.0))]
    height: f64,
    #[validate(length(max = 50))]
    fill: Option<String>,
    #[validate(length(max = 50))]
    stroke: Option<String>,
    #[validate(range(min = 0.0, max = 1000.0))]
    stroke_width: Option<f64>,
    #[validate(range(min = 0.0, max = 1.0))]
    opacity: Option<f64>,
    #[validate(range(min = -360.0, max = 360.0))]
    rotation: Option<f64>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CircleData {
    #[validate(range(min = -1000000.0, max = 1000000.0))]
    cx: f64,
    #[validate(range(min = -1000000.0, max = 1000000.0))]
    cy: f64,
    #[validate(range(min = 0.0, max = 1000000.0))]
    radius: f64,
    #[validate(length(max = 50))]
    fill: Option<String>,
    #[validate(length(max = 50))]
    stroke: Option<String>,
    #[validate(range(min = 0.0, max = 1000.0))]
    stroke_width: Option<f64>,
    #[validate(range(min = 0.0, max = 1.0))]
    opacity: Option<f64>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct LineData {
    #[validate(range(min = -1000000.0, max = 1000000.0))]
    x1: f64,
    #[validate(range(min = -1000000.0, max = 1000000.0))]
    y1: f64,
    #[validate(range(min = -1000000.0, max = 1000000.0))]
    x2: f64,
    #[validate(range(min = -1000000.0, max = 1000000.0))]
    y2: f64,
    #[validate(length(max = 50))]
    stroke: Option<String>,
    #[validate(range(min = 0.0, max = 1000.0))]
    stroke_width: Option<f64>,
    #[validate(range(min = 0.0, max = 1.0))]
    opacity: Option<f64>,
}

/// Single point of a freehand stroke.
#[derive(Debug, Serialize, Deserialize, Validate)]
struct PathPoint {
    #[validate(range(min = -1000000.0, max = 1000000.0))]
    x: f64,
    #[validate(range(min = -1000000.0, max = 1000000.0))]
    y: f64,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct PathData {
    #[validate(length(min = 2, max = 10000), nested)]
    points: Vec<PathPoint>,
    #[validate(length(max = 50))]
    stroke: Option<String>,
    #[validate(range(min = 0.0, max = 1000.0))]
    stroke_width: Option<f64>,
    #[validate(length(max = 50))]
    fill: Option<String>,
    #[validate(range(min = 0.0, max = 1.0))]
    opacity: Option<f64>,
    smooth: Option<bool>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct TextData {
    #[validate(range(min = -1000000.0, max = 1000000.0))]
    x: f64,
    #[validate(range(min = -1000000.0, max = 1000000.0))]
    y: f64,
    #[validate(length(min = 1, max = 1000))]
    text: String,
    #[validate(range(min = 1.0, max = 500.0))]
    font_size: Option<f64>,
    #[validate(length(max = 100))]
    font_family: Option<String>,
    #[validate(length(max = 50))]
    fill: Option<String>,
    bold: Option<bool>,
    italic: Option<bool>,
    underline: Option<bool>,
    #[validate(range(min = -360.0, max = 360.0))]
    rotation: Option<f64>,
}

// =============================================================================
// VALIDATOR
// =============================================================================

/// Schema validation plus HTML sanitization for drawing objects.
pub struct ObjectValidator {
    sanitizer: ammonia::Builder<'static>,
    max_depth: usize,
    max_elements: usize,
}

impl ObjectValidator {
    #[must_use]
    pub fn new(config: &GlobalConfig) -> Self {
        Self {
            // Empty builder: no tags survive, text content does.
            sanitizer: ammonia::Builder::empty(),
            max_depth: config.max_object_depth,
            max_elements: config.max_object_elements,
        }
    }

    /// Validate `data` against the schema for `kind` and return a copy of
    /// the original map with every string leaf sanitized.
    ///
    /// # Errors
    ///
    /// Returns the first violation found: unknown type, complexity cap,
    /// missing/malformed field, or out-of-range value.
    pub fn validate_and_sanitize(
        &self,
        kind: &str,
        data: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ValidationError> {
        self.check_complexity(data)?;

        match kind {
            "rect" => project::<RectData>(data)?,
            "circle" => project::<CircleData>(data)?,
            "line" => project::<LineData>(data)?,
            "path" | "brush" => project::<PathData>(data)?,
            "text" => project::<TextData>(data)?,
            other => return Err(ValidationError::UnknownType(other.to_string())),
        }

        Ok(self.sanitize_map(data))
    }

    fn check_complexity(&self, data: &Map<String, Value>) -> Result<(), ValidationError> {
        let mut max_depth = 0;
        let mut keys = data.len();
        for value in data.values() {
            let (depth, nested_keys) = complexity(value, 1);
            max_depth = max_depth.max(depth);
            keys += nested_keys;
        }

        if max_depth > self.max_depth {
            return Err(ValidationError::TooDeep { depth: max_depth, max: self.max_depth });
        }
        if keys > self.max_elements {
            return Err(ValidationError::TooComplex { keys, max: self.max_elements });
        }
        Ok(())
    }

    /// Recursively sanitize every string in a map, preserving structure.
    pub fn sanitize_map(&self, data: &Map<String, Value>) -> Map<String, Value> {
        data.iter()
            .map(|(key, value)| (key.clone(), self.sanitize_value(value)))
            .collect()
    }

    fn sanitize_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.sanitize_str(s)),
            Value::Object(map) => Value::Object(self.sanitize_map(map)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.sanitize_value(item)).collect())
            }
            other => other.clone(),
        }
    }

    /// Strip all HTML tags and scripts from a string.
    pub fn sanitize_str(&self, raw: &str) -> String {
        self.sanitizer.clean(raw).to_string()
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Project the untyped map into schema `T` and run its declared
/// constraints. The typed value is only a checkpoint; callers keep
/// working with the (sanitized) original map.
fn project<T>(data: &Map<String, Value>) -> Result<(), ValidationError>
where
    T: serde::de::DeserializeOwned + Validate,
{
    let shape: T = serde_json::from_value(Value::Object(data.clone()))
        .map_err(|e| ValidationError::Malformed(e.to_string()))?;
    shape
        .validate()
        .map_err(|e| ValidationError::Constraint(first_violation(&e)))?;
    Ok(())
}

/// Recursively measure nesting depth and total key count. Array length is
/// deliberately not counted; only map keys contribute to the element cap.
fn complexity(value: &Value, current_depth: usize) -> (usize, usize) {
    let mut max_depth = current_depth;
    let mut keys = 0;

    match value {
        Value::Object(map) => {
            keys = map.len();
            for nested in map.values() {
                let (depth, nested_keys) = complexity(nested, current_depth + 1);
                max_depth = max_depth.max(depth);
                keys += nested_keys;
            }
        }
        Value::Array(items) => {
            for nested in items {
                let (depth, nested_keys) = complexity(nested, current_depth + 1);
                max_depth = max_depth.max(depth);
                keys += nested_keys;
            }
        }
        _ => {}
    }

    (max_depth, keys)
}

/// Flatten a `validator` error tree into one user-facing message.
fn first_violation(errors: &validator::ValidationErrors) -> String {
    for (field, kind) in errors.errors() {
        match kind {
            validator::ValidationErrorsKind::Field(list) => {
                if let Some(err) = list.first() {
                    return match err.code.as_ref() {
                        "range" => format!("'{field}' value out of allowed range"),
                        "length" => format!("'{field}' length out of allowed range"),
                        _ => format!("'{field}' is invalid"),
                    };
                }
            }
            validator::ValidationErrorsKind::Struct(nested) => {
                return first_violation(nested);
            }
            validator::ValidationErrorsKind::List(entries) => {
                if let Some(nested) = entries.values().next() {
                    return first_violation(nested);
                }
            }
        }
    }
    "constraint violation".to_string()
}

#[cfg(test)]
#[path = "validate_test.rs"]
mod tests;
