//! Template expansion: `${param}` placeholders in reusable command
//! definitions, resolved against a per-command parameter map.
//!
//! Three placeholder forms, all resolved before variable expansion:
//! - `${name}`  required scalar; missing parameter is an error.
//! - `${?name}` optional scalar; an absent or empty value deletes the
//!   whole containing array element. Element granularity only.
//! - `${@name}` array splice; must occupy an entire element, and the
//!   parameter must be an array. Splices zero or more elements.
//! - `\$`       literal dollar sign.
//!
//! `%{...}` variables are forbidden inside template definitions; they are
//! only meaningful in parameter values, which get expanded later like any
//! other string field.

use crate::config::TemplateConfig;
use crate::errors::{ConfigurationError, RunnerError, VariableError};
use crate::risk::RiskLevel;
use indexmap::IndexMap;

/// A template after parameter substitution, ready for variable expansion.
#[derive(Debug, Clone)]
pub struct ExpandedTemplate {
    pub cmd: String,
    pub args: Vec<String>,
    pub env_vars: Vec<String>,
    pub workdir: Option<String>,
    pub timeout: Option<u64>,
    pub output_size_limit: Option<u64>,
    pub risk_level: Option<RiskLevel>,
}

/// Expand a template against a parameter map.
pub fn expand(
    name: &str,
    tpl: &TemplateConfig,
    params: &IndexMap<String, toml::Value>,
) -> Result<ExpandedTemplate, RunnerError> {
    check_no_variables(name, tpl)?;

    let cmd = expand_scalar(name, &tpl.cmd, params)?;
    let args = expand_elements(name, &tpl.args, params)?;
    let env_vars = expand_elements(name, &tpl.env_vars, params)?;
    let workdir = match &tpl.workdir {
        Some(w) => Some(expand_scalar(name, w, params)?),
        None => None,
    };

    Ok(ExpandedTemplate {
        cmd,
        args,
        env_vars,
        workdir,
        timeout: tpl.timeout,
        output_size_limit: tpl.output_size_limit,
        risk_level: tpl.risk_level,
    })
}

/// Template definitions may not contain `%{...}`; that syntax belongs to
/// the variable layer and is only allowed in parameter values.
fn check_no_variables(name: &str, tpl: &TemplateConfig) -> Result<(), RunnerError> {
    let mut fields: Vec<&str> = vec![&tpl.cmd];
    fields.extend(tpl.args.iter().map(String::as_str));
    fields.extend(tpl.env_vars.iter().map(String::as_str));
    if let Some(w) = &tpl.workdir {
        fields.push(w);
    }
    if fields.iter().any(|f| f.contains("%{")) {
        return Err(ConfigurationError::VariableInTemplate {
            template: name.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Expand one scalar field (cmd, workdir). Optional and splice forms are
/// array-element constructs and are rejected here.
fn expand_scalar(
    template: &str,
    value: &str,
    params: &IndexMap<String, toml::Value>,
) -> Result<String, RunnerError> {
    match substitute(template, value, params, false)? {
        Some(s) => Ok(s),
        // Unreachable: optional placeholders are rejected when
        // `allow_optional` is false.
        None => Ok(String::new()),
    }
}

/// Expand an array field element by element, applying deletion and splice
/// semantics.
fn expand_elements(
    template: &str,
    elements: &[String],
    params: &IndexMap<String, toml::Value>,
) -> Result<Vec<String>, RunnerError> {
    let mut out = Vec::with_capacity(elements.len());
    for element in elements {
        if let Some(param) = splice_param(element) {
            out.extend(splice_values(template, param, params)?);
            continue;
        }
        if element.contains("${@") {
            return Err(VariableError::SpliceNotWholeElement {
                template: template.to_string(),
                param: element.clone(),
            }
            .into());
        }
        if let Some(expanded) = substitute(template, element, params, true)? {
            out.push(expanded);
        }
        // None: an optional parameter was absent or empty, so the whole
        // element is deleted.
    }
    Ok(out)
}

/// If the element is exactly `${@name}`, return `name`.
fn splice_param(element: &str) -> Option<&str> {
    let inner = element.strip_prefix("${@")?.strip_suffix('}')?;
    if inner.is_empty() || inner.contains(['{', '}', '$']) {
        return None;
    }
    Some(inner)
}

/// Resolve an array parameter into its spliced elements.
fn splice_values(
    template: &str,
    param: &str,
    params: &IndexMap<String, toml::Value>,
) -> Result<Vec<String>, RunnerError> {
    let value = params.get(param).ok_or_else(|| VariableError::MissingParam {
        template: template.to_string(),
        param: param.to_string(),
    })?;
    let toml::Value::Array(items) = value else {
        return Err(VariableError::BadParamType {
            template: template.to_string(),
            param: param.to_string(),
            expected: "an array",
        }
        .into());
    };
    items
        .iter()
        .map(|item| scalar_value(template, param, item))
        .collect()
}

/// Substitute `${name}` / `${?name}` / `\$` within one string.
///
/// Returns `None` when an optional parameter was absent or empty, which
/// deletes the containing element. With `allow_optional` unset (scalar
/// fields) the optional form is an error instead.
fn substitute(
    template: &str,
    input: &str,
    params: &IndexMap<String, toml::Value>,
    allow_optional: bool,
) -> Result<Option<String>, RunnerError> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&'$') {
            chars.next();
            out.push('$');
            continue;
        }
        if c != '$' || chars.peek() != Some(&'{') {
            out.push(c);
            continue;
        }
        chars.next(); // consume '{'

        let mut name = String::new();
        let mut closed = false;
        for inner in chars.by_ref() {
            if inner == '}' {
                closed = true;
                break;
            }
            name.push(inner);
        }
        if !closed {
            // Unterminated placeholder: keep the text as written.
            out.push_str("${");
            out.push_str(&name);
            break;
        }

        if let Some(opt_name) = name.strip_prefix('?') {
            if !allow_optional {
                return Err(VariableError::OptionalOutsideArray {
                    template: template.to_string(),
                    param: opt_name.to_string(),
                }
                .into());
            }
            match params.get(opt_name) {
                Some(value) => {
                    let s = scalar_value(template, opt_name, value)?;
                    if s.is_empty() {
                        return Ok(None);
                    }
                    out.push_str(&s);
                }
                None => return Ok(None),
            }
            continue;
        }

        if name.starts_with('@') {
            return Err(VariableError::SpliceNotWholeElement {
                template: template.to_string(),
                param: name[1..].to_string(),
            }
            .into());
        }

        let value = params.get(&name).ok_or_else(|| VariableError::MissingParam {
            template: template.to_string(),
            param: name.clone(),
        })?;
        out.push_str(&scalar_value(template, &name, value)?);
    }

    Ok(Some(out))
}

/// Render a scalar parameter value as a string.
fn scalar_value(
    template: &str,
    param: &str,
    value: &toml::Value,
) -> Result<String, RunnerError> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        _ => Err(VariableError::BadParamType {
            template: template.to_string(),
            param: param.to_string(),
            expected: "a scalar",
        }
        .into()),
    }
}
