//! ABOUTME: Template content validation and variable interpolation
//! ABOUTME: Double-brace references with dotted paths, defaults, and required checks

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use maestro_core::{paths, MaestroError, Result};

use crate::types::TemplateVariable;

/// Longest content accepted by validation
pub const MAX_CONTENT_LEN: usize = 64 * 1024;
/// Most declared variables accepted by validation
pub const MAX_VARIABLES: usize = 50;

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z0-9_]+)*$").expect("static regex")
    })
}

/// Every `{{path}}` reference in the content, in order of appearance
pub fn extract_references(content: &str) -> Result<Vec<String>> {
    let mut references = Vec::new();
    let mut rest = content;

    loop {
        let open = match rest.find("{{") {
            Some(pos) => pos,
            None => {
                if rest.contains("}}") {
                    return Err(MaestroError::validation_field(
                        "unbalanced braces in template content",
                        "content",
                    ));
                }
                break;
            }
        };
        let after_open = &rest[open + 2..];
        let close = after_open.find("}}").ok_or_else(|| {
            MaestroError::validation_field("unbalanced braces in template content", "content")
        })?;
        let raw = after_open[..close].trim();
        if !reference_regex().is_match(raw) {
            return Err(MaestroError::validation_field(
                format!("invalid variable reference '{}'", raw),
                "content",
            ));
        }
        references.push(raw.to_string());
        rest = &after_open[close + 2..];
    }

    Ok(references)
}

/// Validate template content and its declared variables
pub fn validate(content: &str, variables: &[TemplateVariable]) -> Result<()> {
    if content.is_empty() {
        return Err(MaestroError::validation_field(
            "template content cannot be empty",
            "content",
        ));
    }
    if content.len() > MAX_CONTENT_LEN {
        return Err(MaestroError::validation_field(
            format!("template content exceeds {} bytes", MAX_CONTENT_LEN),
            "content",
        ));
    }
    if variables.len() > MAX_VARIABLES {
        return Err(MaestroError::validation_field(
            format!("more than {} variables declared", MAX_VARIABLES),
            "variables",
        ));
    }
    for variable in variables {
        if !reference_regex().is_match(&variable.name) || variable.name.contains('.') {
            return Err(MaestroError::validation_field(
                format!("invalid variable name '{}'", variable.name),
                "variables",
            ));
        }
    }
    extract_references(content)?;
    Ok(())
}

/// Render a JSON value for substitution into prompt text
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string_pretty(value).unwrap_or_default()
        }
    }
}

/// Resolve one reference against provided values and declared variables.
///
/// Order: full-path provided value, then nested lookup under the provided
/// root, then the variable default, then empty for non-required variables.
/// A missing required variable is a validation error.
fn resolve(
    reference: &str,
    provided: &Map<String, Value>,
    variables: &[TemplateVariable],
) -> Result<String> {
    if let Some(value) = provided.get(reference) {
        return Ok(value_to_string(value));
    }

    let root = reference.split('.').next().expect("non-empty reference");
    if reference.contains('.') {
        if let Some(root_value) = provided.get(root) {
            let nested_path = &reference[root.len() + 1..];
            if let Some(value) = paths::get_path(root_value, nested_path) {
                return Ok(value_to_string(value));
            }
        }
    }

    let declared = variables.iter().find(|v| v.name == root);
    if let Some(variable) = declared {
        if let Some(default) = &variable.default {
            return Ok(value_to_string(default));
        }
        if variable.required {
            return Err(MaestroError::validation_field(
                format!("missing required variable '{}'", root),
                root.to_string(),
            ));
        }
    }

    Ok(String::new())
}

/// Interpolate content, resolving every `{{path}}` reference
pub fn interpolate(
    content: &str,
    provided: &Map<String, Value>,
    variables: &[TemplateVariable],
) -> Result<String> {
    let mut output = String::with_capacity(content.len());
    let mut rest = content;

    loop {
        let open = match rest.find("{{") {
            Some(pos) => pos,
            None => {
                output.push_str(rest);
                break;
            }
        };
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let close = after_open.find("}}").ok_or_else(|| {
            MaestroError::validation_field("unbalanced braces in template content", "content")
        })?;
        let reference = after_open[..close].trim();
        output.push_str(&resolve(reference, provided, variables)?);
        rest = &after_open[close + 2..];
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VariableType;
    use serde_json::json;

    fn provided(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_extract_references() {
        let refs = extract_references("Hi {{name}}, score {{stats.score}}").unwrap();
        assert_eq!(refs, vec!["name", "stats.score"]);
    }

    #[test]
    fn test_validation_rejects_bad_content() {
        assert!(extract_references("{{unclosed").is_err());
        assert!(extract_references("stray }} close").is_err());
        assert!(extract_references("{{9bad}}").is_err());
        assert!(extract_references("{{a..b}}").is_err());
        assert!(validate("", &[]).is_err());
    }

    #[test]
    fn test_interpolate_direct_and_nested() {
        let values = provided(&[
            ("name", json!("Ada")),
            ("stats", json!({"score": 42})),
        ]);
        let out = interpolate("Hi {{name}}, score {{stats.score}}", &values, &[]).unwrap();
        assert_eq!(out, "Hi Ada, score 42");
    }

    #[test]
    fn test_interpolate_full_path_beats_nested() {
        let values = provided(&[
            ("stats.score", json!("direct")),
            ("stats", json!({"score": "nested"})),
        ]);
        let out = interpolate("{{stats.score}}", &values, &[]).unwrap();
        assert_eq!(out, "direct");
    }

    #[test]
    fn test_interpolate_default_and_optional() {
        let variables = vec![
            TemplateVariable::optional("tone", VariableType::String, Some(json!("neutral"))),
            TemplateVariable::optional("extra", VariableType::String, None),
        ];
        let out = interpolate("{{tone}}|{{extra}}|{{unknown}}", &Map::new(), &variables).unwrap();
        assert_eq!(out, "neutral||");
    }

    #[test]
    fn test_missing_required_fails() {
        let variables = vec![TemplateVariable::required("topic", VariableType::String)];
        let err = interpolate("{{topic}}", &Map::new(), &variables).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_value_rendering() {
        assert_eq!(value_to_string(&json!("s")), "s");
        assert_eq!(value_to_string(&json!(3.5)), "3.5");
        assert_eq!(value_to_string(&json!(true)), "true");
        assert!(value_to_string(&json!({"a": 1})).contains("\"a\": 1"));
        assert!(value_to_string(&json!([1, 2])).contains('1'));
    }

    #[test]
    fn test_interpolation_deterministic() {
        let values = provided(&[("a", json!(1))]);
        let one = interpolate("{{a}}{{a}}", &values, &[]).unwrap();
        let two = interpolate("{{a}}{{a}}", &values, &[]).unwrap();
        assert_eq!(one, two);
    }
}
