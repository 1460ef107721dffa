//! Template helper library.
//!
//! Registered as tera functions taking named arguments, e.g.
//! `{% if eq(left=app, right="server") %}` or `{{ toFixed(value=load, digits=2) }}`.

use crate::dates;
use crate::host::Interpolator;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tera::Tera;

type Args = HashMap<String, Value>;

fn arg<'a>(helper: &str, args: &'a Args, name: &str) -> tera::Result<&'a Value> {
    args.get(name)
        .ok_or_else(|| tera::Error::msg(format!("`{}` expects an argument `{}`", helper, name)))
}

fn text_arg(helper: &str, args: &Args, name: &str) -> tera::Result<String> {
    Ok(match arg(helper, args, name)? {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn separator(args: &Args) -> String {
    match args.get("separator") {
        Some(Value::String(s)) => s.clone(),
        _ => ",".to_string(),
    }
}

/// `false`, `null`, `0` and `""` are false; everything else is true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn and(args: &Args) -> tera::Result<Value> {
    Ok(Value::Bool(
        is_truthy(arg("and", args, "left")?) && is_truthy(arg("and", args, "right")?),
    ))
}

fn or(args: &Args) -> tera::Result<Value> {
    Ok(Value::Bool(
        is_truthy(arg("or", args, "left")?) || is_truthy(arg("or", args, "right")?),
    ))
}

fn not(args: &Args) -> tera::Result<Value> {
    Ok(Value::Bool(!is_truthy(arg("not", args, "value")?)))
}

fn eq(args: &Args) -> tera::Result<Value> {
    Ok(Value::Bool(arg("eq", args, "left")? == arg("eq", args, "right")?))
}

fn unless_eq(args: &Args) -> tera::Result<Value> {
    Ok(Value::Bool(
        arg("unlessEq", args, "left")? != arg("unlessEq", args, "right")?,
    ))
}

fn compare(helper: &'static str, args: &Args, op: fn(f64, f64) -> bool) -> tera::Result<Value> {
    let left = arg(helper, args, "left")?.as_f64();
    let right = arg(helper, args, "right")?.as_f64();
    Ok(Value::Bool(match (left, right) {
        (Some(l), Some(r)) => op(l, r),
        _ => false,
    }))
}

fn contains(args: &Args) -> tera::Result<Value> {
    let value = arg("contains", args, "value")?;
    let found = match arg("contains", args, "items")? {
        Value::Array(items) => items.contains(value),
        Value::String(text) => match value {
            Value::String(needle) => text.contains(needle.as_str()),
            other => text.contains(&other.to_string()),
        },
        _ => false,
    };
    Ok(Value::Bool(found))
}

fn starts_with(args: &Args) -> tera::Result<Value> {
    let text = text_arg("startsWith", args, "text")?;
    Ok(Value::Bool(text.starts_with(&text_arg("startsWith", args, "value")?)))
}

fn ends_with(args: &Args) -> tera::Result<Value> {
    let text = text_arg("endsWith", args, "text")?;
    Ok(Value::Bool(text.ends_with(&text_arg("endsWith", args, "value")?)))
}

fn regex_match(args: &Args) -> tera::Result<Value> {
    let text = text_arg("match", args, "text")?;
    let pattern = text_arg("match", args, "pattern")?;
    Ok(Value::Bool(
        Regex::new(&pattern)
            .map(|regex| regex.is_match(&text))
            .unwrap_or(false),
    ))
}

fn join(args: &Args) -> tera::Result<Value> {
    let joined = match arg("join", args, "items")? {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(&separator(args)),
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    Ok(Value::String(joined))
}

fn split(args: &Args) -> tera::Result<Value> {
    let text = text_arg("split", args, "text")?;
    Ok(Value::Array(
        text.split(separator(args).as_str())
            .map(|part| Value::String(part.to_string()))
            .collect(),
    ))
}

/// `0` unless both `value` and `digits` are numbers.
fn to_fixed(args: &Args) -> tera::Result<Value> {
    let value = arg("toFixed", args, "value")?.as_f64();
    let digits = args.get("digits").and_then(Value::as_f64);
    match (value, digits) {
        (Some(value), Some(digits)) => {
            let digits = digits.clamp(0.0, 20.0) as usize;
            Ok(Value::String(format!("{:.*}", digits, value)))
        }
        _ => Ok(Value::from(0)),
    }
}

fn json(args: &Args) -> tera::Result<Value> {
    let text = serde_json::to_string_pretty(arg("json", args, "value")?)
        .map_err(|e| tera::Error::msg(format!("`json` could not serialize value: {}", e)))?;
    Ok(Value::String(text))
}

fn date(args: &Args) -> tera::Result<Value> {
    let value = args.get("value").cloned().unwrap_or(Value::Null);
    let parsed = dates::parse_date(&value)
        .ok_or_else(|| tera::Error::msg(format!("`date` could not read {} as a date", value)))?;
    let text = match args.get("format") {
        Some(Value::String(pattern)) if !pattern.is_empty() => dates::format_pattern(&parsed, pattern),
        _ => dates::to_iso(&parsed),
    };
    Ok(Value::String(text))
}

/// All values of a dashboard variable, in order. Multi-value variables
/// contribute every value; an unknown variable yields nothing.
pub fn variable_values(interpolator: &dyn Interpolator, name: &str) -> Vec<String> {
    let mut values = Vec::new();
    interpolator.interpolate(&format!("${{{}}}", name), &mut |_, value| {
        values.extend(value.values());
        String::new()
    });
    values
}

/// Registers the helper library plus `variable`/`variableValue` bound to
/// `interpolator`. Called once per tera instance, never on a shared one.
pub fn register_helpers(tera: &mut Tera, interpolator: Arc<dyn Interpolator>) {
    tera.register_function("and", and);
    tera.register_function("or", or);
    tera.register_function("not", not);
    tera.register_function("eq", eq);
    tera.register_function("unlessEq", unless_eq);
    tera.register_function("gt", |args: &Args| compare("gt", args, |l, r| l > r));
    tera.register_function("gte", |args: &Args| compare("gte", args, |l, r| l >= r));
    tera.register_function("lt", |args: &Args| compare("lt", args, |l, r| l < r));
    tera.register_function("lte", |args: &Args| compare("lte", args, |l, r| l <= r));
    tera.register_function("contains", contains);
    tera.register_function("startsWith", starts_with);
    tera.register_function("endsWith", ends_with);
    tera.register_function("match", regex_match);
    tera.register_function("join", join);
    tera.register_function("split", split);
    tera.register_function("toFixed", to_fixed);
    tera.register_function("json", json);
    tera.register_function("date", date);

    let variables = interpolator.clone();
    tera.register_function("variable", move |args: &Args| {
        let name = text_arg("variable", args, "name")?;
        Ok(Value::Array(
            variable_values(variables.as_ref(), &name)
                .into_iter()
                .map(Value::String)
                .collect(),
        ))
    });
    tera.register_function("variableValue", move |args: &Args| {
        let name = text_arg("variableValue", args, "name")?;
        Ok(Value::String(interpolator.replace_variables(&name)))
    });
}
