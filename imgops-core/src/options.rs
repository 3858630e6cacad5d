//! Runtime options: the flat bag of context values (hardware variant, target
//! drive, operating system) that operations are filtered against.
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the option filled in from the host when the caller omits it.
pub const OS_OPTION: &str = "os";

/// Name of the option holding the target drive for `burn` operations.
pub const DRIVE_OPTION: &str = "drive";

/// A single option value.
///
/// Comparison is type-strict: the number `1` never equals the string `"1"`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    String(String),
    Number(f64),
}

impl OptionValue {
    /// Returns the value as a string slice, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::String(s) => Some(s),
            OptionValue::Number(_) => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::String(s) => f.write_str(s),
            OptionValue::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::String(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::String(value)
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        OptionValue::Number(value)
    }
}

impl From<i32> for OptionValue {
    fn from(value: i32) -> Self {
        OptionValue::Number(value.into())
    }
}

/// Option name to value. Ordered so that iteration is deterministic.
pub type Options = BTreeMap<String, OptionValue>;

/// Identifies the host operating system using the names operation manifests
/// match against (`osx`, `win32`, `linux`).
pub fn operating_system() -> &'static str {
    match std::env::consts::OS {
        "macos" => "osx",
        "windows" => "win32",
        other => other,
    }
}

/// Returns a copy of `options` with computable defaults filled in.
///
/// Values the caller supplied are never overwritten.
pub fn with_defaults(options: &Options) -> Options {
    let mut effective = options.clone();
    effective
        .entry(OS_OPTION.to_string())
        .or_insert_with(|| OptionValue::from(operating_system()));
    effective
}

fn split_assignment(input: &str) -> Result<(String, &str)> {
    let (key, value) = input
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid option '{}': expected KEY=VALUE", input))?;

    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("Invalid option '{}': empty key", input));
    }
    Ok((key.to_string(), value))
}

/// Parses a `key=value` assignment as given on the command line.
///
/// Values that parse as a finite number become [`OptionValue::Number`];
/// anything else is kept as a string. A value wrapped in matching single or
/// double quotes is always a string, with the quotes removed, so `"007"`
/// stays `007` rather than becoming `7`.
pub fn parse_assignment(input: &str) -> Result<(String, OptionValue)> {
    let (key, value) = split_assignment(input)?;

    let quoted = ['"', '\'']
        .into_iter()
        .find_map(|q| value.strip_prefix(q).and_then(|v| v.strip_suffix(q)));
    if let Some(text) = quoted {
        return Ok((key, OptionValue::from(text)));
    }

    let value = match value.parse::<f64>() {
        Ok(n) if n.is_finite() => OptionValue::Number(n),
        _ => OptionValue::String(value.to_string()),
    };

    Ok((key, value))
}

/// Parses a `key=value` assignment whose value is always a string.
pub fn parse_text_assignment(input: &str) -> Result<(String, OptionValue)> {
    let (key, value) = split_assignment(input)?;
    Ok((key, OptionValue::from(value)))
}
