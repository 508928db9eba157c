//! Lenient accessors for tool arguments. Wrong types read as absent.

use serde_json::Value;
use tabscope_core::{Error, Result};

pub fn opt_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

pub fn opt_string(params: &Value, key: &str) -> Option<String> {
    opt_str(params, key).map(str::to_string)
}

pub fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    opt_str(params, key).ok_or_else(|| Error::MissingParam(key.to_string()))
}

pub fn opt_i64(params: &Value, key: &str) -> Option<i64> {
    params.get(key).and_then(Value::as_i64)
}

pub fn bool_or(params: &Value, key: &str, default: bool) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// `limit` clamped to `1..=max`; absent or non-positive means `default`.
pub fn limit(params: &Value, default: usize, max: usize) -> usize {
    match opt_i64(params, "limit") {
        Some(n) if n > 0 => (n as usize).min(max),
        _ => default,
    }
}

pub fn string_list(params: &Value, key: &str) -> Vec<String> {
    match params.get(key) {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
        Some(Value::String(s)) if !s.is_empty() => s.split(',').map(|p| p.trim().to_string()).collect(),
        _ => Vec::new(),
    }
}

/// Case-insensitive substring match; an empty needle always matches.
pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    needle.is_empty() || haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// The `key` argument checked against `valid`, naming the parameter on failure.
pub fn one_of<'a>(params: &'a Value, key: &str, valid: &[&str]) -> Result<&'a str> {
    let value = require_str(params, key)?;
    if valid.contains(&value) {
        Ok(value)
    } else {
        Err(Error::invalid_param(
            key,
            format!("Invalid {} '{}'. Valid: {}", key, value, valid.join(", ")),
        ))
    }
}
