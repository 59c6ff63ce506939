use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::catalog::{AppTemplate, FieldKind, ParamField};
use crate::engine::model::Params;
use crate::error::{EngineError, Result};

/// Minimum Jaro-Winkler score to consider a template variable a close match.
const TEMPLATE_SUGGESTION_THRESHOLD: f64 = 0.8;

/// Compiled pattern matching `{{ KEY }}` template expressions.
static TEMPLATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([\w.]+)\s*\}\}").expect("template regex must compile"));

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unresolved variable '{{{{{{ {variable} }}}}}}' in {field}{}", suggestion.as_ref().map(|s| format!(" (did you mean `{}`?)", s)).unwrap_or_default())]
    UnresolvedVariable {
        field: String,
        variable: String,
        suggestion: Option<String>,
    },
}

/// Parameters and rendered config of one install, plus the template's form.
#[derive(Debug, Clone, Serialize)]
pub struct AppConfig {
    pub params: Params,
    pub rendered_config: String,
    pub fields: Vec<ParamField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateOutcome {
    /// Keys whose values differ from before the update.
    pub changed_keys: Vec<String>,
    /// The install is running and its containers were built from the old
    /// values. The next restart recreates them.
    pub restart_required: bool,
}

/// Find the closest matching template variable name using Jaro-Winkler similarity.
fn find_closest_template_var<'a>(name: &str, vars: &'a HashMap<String, String>) -> Option<&'a str> {
    let mut best: Option<(&str, f64)> = None;
    for key in vars.keys() {
        let score = strsim::jaro_winkler(name, key);
        if score >= TEMPLATE_SUGGESTION_THRESHOLD && best.is_none_or(|(_, s)| score > s) {
            best = Some((key.as_str(), score));
        }
    }
    best.map(|(name, _)| name)
}

/// Resolve all `{{ var }}` expressions in `input` using `vars`.
///
/// Every unresolved reference is reported, not only the first one.
pub fn resolve_template(
    input: &str,
    vars: &HashMap<String, String>,
    field_context: &str,
) -> std::result::Result<String, Vec<TemplateError>> {
    let errors: Vec<TemplateError> = TEMPLATE_RE
        .captures_iter(input)
        .filter_map(|cap| {
            let variable = cap[1].to_string();
            if vars.contains_key(&variable) {
                None
            } else {
                let suggestion = find_closest_template_var(&variable, vars).map(String::from);
                Some(TemplateError::UnresolvedVariable {
                    field: field_context.to_string(),
                    variable,
                    suggestion,
                })
            }
        })
        .collect();

    if !errors.is_empty() {
        return Err(errors);
    }

    let resolved = TEMPLATE_RE
        .replace_all(input, |cap: &regex::Captures| {
            let key = &cap[1];
            vars.get(key).cloned().unwrap_or_default()
        })
        .into_owned();

    Ok(resolved)
}

/// Render a parameter value the way it appears in config files.
pub fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Template variables for an install: every parameter plus `version`.
pub fn template_vars(params: &Params, version: &str) -> HashMap<String, String> {
    let mut vars: HashMap<String, String> = params
        .iter()
        .map(|(k, v)| (k.clone(), value_to_string(v)))
        .collect();
    vars.insert("version".to_string(), version.to_string());
    vars
}

/// Render `input` against the install's variables, folding template errors
/// into a single validation error.
pub fn render(input: &str, params: &Params, version: &str, field_context: &str) -> Result<String> {
    resolve_template(input, &template_vars(params, version), field_context).map_err(|errors| {
        EngineError::validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        )
    })
}

/// Render the template's config file for the given parameters.
pub fn render_config(template: &AppTemplate, params: &Params, version: &str) -> Result<String> {
    render(&template.config_template, params, version, "config_template")
}

/// Fill in defaults for fields the caller left out.
pub fn apply_defaults(fields: &[ParamField], params: &Params) -> Params {
    let mut merged = params.clone();
    for field in fields {
        if let Some(default) = &field.default {
            merged
                .entry(field.key.clone())
                .or_insert_with(|| default.clone());
        }
    }
    merged
}

fn check_field(field: &ParamField, value: &serde_json::Value) -> Result<()> {
    let bad = |expected: &str| {
        EngineError::validation(format!(
            "parameter '{}' must be {}, got {}",
            field.key, expected, value
        ))
    };
    match field.kind {
        FieldKind::Number => {
            let numeric = value.is_number()
                || value.as_str().is_some_and(|s| s.trim().parse::<f64>().is_ok());
            if !numeric {
                return Err(bad("a number"));
            }
        }
        FieldKind::Port => {
            parse_port_value(value).ok_or_else(|| bad("a port between 1 and 65535"))?;
        }
        FieldKind::Bool => {
            if !value.is_boolean() {
                return Err(bad("true or false"));
            }
        }
        FieldKind::Select => {
            let text = value_to_string(value);
            if !field.options.is_empty() && !field.options.contains(&text) {
                return Err(bad(&format!("one of {:?}", field.options)));
            }
        }
        FieldKind::Text | FieldKind::Password => {}
    }
    Ok(())
}

/// Interpret a parameter value as a port number.
pub fn parse_port_value(value: &serde_json::Value) -> Option<u16> {
    let port = match value {
        serde_json::Value::Number(n) => u16::try_from(n.as_u64()?).ok()?,
        serde_json::Value::String(s) => s.trim().parse::<u16>().ok()?,
        _ => return None,
    };
    (port != 0).then_some(port)
}

/// Check a full parameter set against the template's fields.
pub fn validate_params(fields: &[ParamField], params: &Params) -> Result<()> {
    for field in fields {
        match params.get(&field.key) {
            Some(value) if !value.is_null() => check_field(field, value)?,
            _ if field.required => {
                return Err(EngineError::validation(format!(
                    "parameter '{}' is required",
                    field.key
                )))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Check a replacement parameter set. Read-only fields and port fields must
/// keep their current values; ports move through the port allocator instead.
pub fn validate_update(fields: &[ParamField], current: &Params, new: &Params) -> Result<()> {
    validate_params(fields, new)?;
    for field in fields {
        let before = current.get(&field.key);
        let after = new.get(&field.key);
        let unchanged = match (before, after) {
            (Some(b), Some(a)) => value_to_string(b) == value_to_string(a),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            continue;
        }
        if field.kind == FieldKind::Port {
            return Err(EngineError::validation(format!(
                "parameter '{}' is a published port; use change-port to move it",
                field.key
            )));
        }
        if !field.editable {
            return Err(EngineError::validation(format!(
                "parameter '{}' cannot be changed after install",
                field.key
            )));
        }
    }
    Ok(())
}

/// Keys whose values differ between two parameter sets.
pub fn changed_keys(before: &Params, after: &Params) -> Vec<String> {
    let mut keys: Vec<String> = before
        .keys()
        .chain(after.keys())
        .filter(|k| before.get(*k) != after.get(*k))
        .cloned()
        .collect();
    keys.sort();
    keys.dedup();
    keys
}
