//! Attribute validators applied before planning.

#![forbid(unsafe_code)]

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tether_core::ResourceSpec;

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .unwrap_or_else(|e| panic!("uuid regex: {}", e))
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule", content = "arg")]
pub enum Validator {
    Uuid,
    /// UTF-8 length in characters.
    MinLength(usize),
    OneOf(Vec<String>),
    AtLeast(f64),
    ConflictsWith(String),
    AlsoRequires(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub attribute: String,
    pub message: String,
}

impl Violation {
    pub fn new(attribute: &str, message: impl Into<String>) -> Self {
        Self { attribute: attribute.to_string(), message: message.into() }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}: {}", self.attribute, self.message) }
}

impl Validator {
    /// Check one attribute. Only present values are checked; unknown values pass
    /// because they are resolved by the remote later.
    pub fn check(&self, attribute: &str, spec: &ResourceSpec) -> Option<Violation> {
        let value = spec.present(attribute)?;
        match self {
            Validator::Uuid => match value.as_str() {
                Some(s) if UUID_RE.is_match(s) => None,
                _ => Some(Violation::new(attribute, "must be a valid UUID")),
            },
            Validator::MinLength(n) => match value {
                Json::String(s) if s.chars().count() >= *n => None,
                Json::String(_) => Some(Violation::new(attribute, format!("must be at least {} character(s) long", n))),
                _ => Some(Violation::new(attribute, "must be a string")),
            },
            Validator::OneOf(allowed) => match value.as_str() {
                Some(s) if allowed.iter().any(|a| a == s) => None,
                _ => Some(Violation::new(attribute, format!("must be one of: {}", allowed.join(", ")))),
            },
            Validator::AtLeast(min) => match value.as_f64() {
                Some(v) if v >= *min => None,
                Some(_) => Some(Violation::new(attribute, format!("must be at least {}", min))),
                None => Some(Violation::new(attribute, "must be a number")),
            },
            Validator::ConflictsWith(other) => {
                if spec.get(other).is_absent() { None } else { Some(Violation::new(attribute, format!("conflicts with {}", other))) }
            }
            Validator::AlsoRequires(other) => {
                if spec.get(other).is_absent() { Some(Violation::new(attribute, format!("also requires {}", other))) } else { None }
            }
        }
    }
}
