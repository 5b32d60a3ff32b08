//! A small JSON-schema validator for module options.
//!
//! Supported keywords: `type`, `enum`, `const`, `required`, `properties`,
//! `additionalProperties`, `items`, `minItems`, `maxItems`, `minimum`,
//! `maximum`, `minLength`, `maxLength`. Unknown keywords are ignored, so
//! richer schemas degrade to a looser check instead of failing.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// One problem found while validating a manifest, located by JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
  pub path: String,
  pub message: String,
}

impl ValidationIssue {
  pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      message: message.into(),
    }
  }
}

impl fmt::Display for ValidationIssue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let path = if self.path.is_empty() { "/" } else { &self.path };
    write!(f, "{}: {}", path, self.message)
  }
}

fn type_name(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "boolean",
    Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}

fn type_matches(expected: &str, value: &Value) -> bool {
  let actual = type_name(value);
  actual == expected || (expected == "number" && actual == "integer")
}

/// Validate `value` against `schema`, appending every problem to `issues`.
pub fn validate(schema: &Value, value: &Value, path: &str, issues: &mut Vec<ValidationIssue>) {
  let Value::Object(schema) = schema else {
    // `true`/`false` schemas
    if schema == &Value::Bool(false) {
      issues.push(ValidationIssue::new(path, "no value is allowed here"));
    }
    return;
  };

  if let Some(expected) = schema.get("type") {
    let allowed: Vec<&str> = match expected {
      Value::String(t) => vec![t.as_str()],
      Value::Array(ts) => ts.iter().filter_map(Value::as_str).collect(),
      _ => Vec::new(),
    };
    if !allowed.is_empty() && !allowed.iter().any(|t| type_matches(t, value)) {
      issues.push(ValidationIssue::new(
        path,
        format!("expected {}, found {}", allowed.join(" or "), type_name(value)),
      ));
      return;
    }
  }

  if let Some(Value::Array(choices)) = schema.get("enum")
    && !choices.contains(value)
  {
    issues.push(ValidationIssue::new(path, format!("{value} is not one of {}", Value::Array(choices.clone()))));
  }

  if let Some(expected) = schema.get("const")
    && expected != value
  {
    issues.push(ValidationIssue::new(path, format!("expected {expected}")));
  }

  match value {
    Value::Object(map) => {
      if let Some(Value::Array(required)) = schema.get("required") {
        for key in required.iter().filter_map(Value::as_str) {
          if !map.contains_key(key) {
            issues.push(ValidationIssue::new(path, format!("missing required property '{key}'")));
          }
        }
      }

      let properties = schema.get("properties").and_then(Value::as_object);
      for (key, child) in map {
        let child_path = format!("{path}/{key}");
        if let Some(child_schema) = properties.and_then(|p| p.get(key)) {
          validate(child_schema, child, &child_path, issues);
          continue;
        }
        match schema.get("additionalProperties") {
          Some(Value::Bool(false)) => {
            issues.push(ValidationIssue::new(path, format!("unexpected property '{key}'")));
          }
          Some(extra @ Value::Object(_)) => validate(extra, child, &child_path, issues),
          _ => {}
        }
      }
    }
    Value::Array(items) => {
      if let Some(min) = schema.get("minItems").and_then(Value::as_u64)
        && (items.len() as u64) < min
      {
        issues.push(ValidationIssue::new(path, format!("expected at least {min} items")));
      }
      if let Some(max) = schema.get("maxItems").and_then(Value::as_u64)
        && (items.len() as u64) > max
      {
        issues.push(ValidationIssue::new(path, format!("expected at most {max} items")));
      }
      if let Some(item_schema) = schema.get("items") {
        for (i, item) in items.iter().enumerate() {
          validate(item_schema, item, &format!("{path}/{i}"), issues);
        }
      }
    }
    Value::Number(n) => {
      let Some(n) = n.as_f64() else { return };
      if let Some(min) = schema.get("minimum").and_then(Value::as_f64)
        && n < min
      {
        issues.push(ValidationIssue::new(path, format!("{n} is less than the minimum {min}")));
      }
      if let Some(max) = schema.get("maximum").and_then(Value::as_f64)
        && n > max
      {
        issues.push(ValidationIssue::new(path, format!("{n} is greater than the maximum {max}")));
      }
    }
    Value::String(s) => {
      let len = s.chars().count() as u64;
      if let Some(min) = schema.get("minLength").and_then(Value::as_u64)
        && len < min
      {
        issues.push(ValidationIssue::new(path, format!("string shorter than {min}")));
      }
      if let Some(max) = schema.get("maxLength").and_then(Value::as_u64)
        && len > max
      {
        issues.push(ValidationIssue::new(path, format!("string longer than {max}")));
      }
    }
    Value::Null | Value::Bool(_) => {}
  }
}
