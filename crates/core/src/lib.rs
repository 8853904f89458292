//! Tether core types: desired specs, remote observations and reconciliation results.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod identity;

pub use identity::{CompositeIdentity, IdentityCodec, IdentityError};

/// String form of [`AttrValue::Unknown`] in serialized specs.
pub const UNKNOWN_MARKER: &str = "(known after apply)";

/// A single attribute value in a [`ResourceSpec`].
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AttrValue {
    Present(Json),
    #[default]
    Absent,
    /// Final value depends on a pending remote operation (e.g. a generated id).
    Unknown,
}

impl AttrValue {
    pub fn as_present(&self) -> Option<&Json> {
        match self { AttrValue::Present(v) => Some(v), _ => None }
    }
    pub fn is_present(&self) -> bool { matches!(self, AttrValue::Present(_)) }
    pub fn is_unknown(&self) -> bool { matches!(self, AttrValue::Unknown) }
    pub fn is_absent(&self) -> bool { matches!(self, AttrValue::Absent) }
}

impl From<Json> for AttrValue {
    fn from(v: Json) -> Self {
        match v {
            Json::Null => AttrValue::Absent,
            Json::String(s) if s == UNKNOWN_MARKER => AttrValue::Unknown,
            other => AttrValue::Present(other),
        }
    }
}

impl From<Option<Json>> for AttrValue {
    fn from(v: Option<Json>) -> Self { v.map(AttrValue::from).unwrap_or(AttrValue::Absent) }
}

static ABSENT: AttrValue = AttrValue::Absent;

/// Attribute name -> tagged value. Missing keys read as `Absent`.
///
/// Serialized as a plain JSON/YAML map: `null` is `Absent` and the
/// [`UNKNOWN_MARKER`] string is `Unknown`. Absent entries are not written.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Json>", into = "BTreeMap<String, Json>")]
pub struct ResourceSpec {
    attrs: BTreeMap<String, AttrValue>,
}

impl ResourceSpec {
    pub fn new() -> Self { Self::default() }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        let name = name.into();
        match value.into() {
            AttrValue::Absent => { self.attrs.remove(&name); }
            v => { self.attrs.insert(name, v); }
        }
    }

    pub fn get(&self, name: &str) -> &AttrValue { self.attrs.get(name).unwrap_or(&ABSENT) }

    pub fn present(&self, name: &str) -> Option<&Json> { self.get(name).as_present() }

    pub fn remove(&mut self, name: &str) -> AttrValue { self.attrs.remove(name).unwrap_or_default() }

    /// Iterate non-absent attributes in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> { self.attrs.keys().map(|k| k.as_str()) }
    pub fn len(&self) -> usize { self.attrs.len() }
    pub fn is_empty(&self) -> bool { self.attrs.is_empty() }
}

impl From<BTreeMap<String, Json>> for ResourceSpec {
    fn from(map: BTreeMap<String, Json>) -> Self {
        let mut spec = ResourceSpec::new();
        for (k, v) in map { spec.set(k, v); }
        spec
    }
}

impl From<ResourceSpec> for BTreeMap<String, Json> {
    fn from(spec: ResourceSpec) -> Self {
        spec.attrs
            .into_iter()
            .filter_map(|(k, v)| match v {
                AttrValue::Present(j) => Some((k, j)),
                AttrValue::Unknown => Some((k, Json::String(UNKNOWN_MARKER.to_string()))),
                AttrValue::Absent => None,
            })
            .collect()
    }
}

/// Fresh read from the remote system. A missing key means the remote did not report it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteObservation {
    attrs: BTreeMap<String, Json>,
}

impl RemoteObservation {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, name: impl Into<String>, value: Json) -> Self {
        self.insert(name, value);
        self
    }

    /// `null` is treated as not reported.
    pub fn insert(&mut self, name: impl Into<String>, value: Json) {
        let name = name.into();
        if value.is_null() { self.attrs.remove(&name); } else { self.attrs.insert(name, value); }
    }

    pub fn get(&self, name: &str) -> Option<&Json> { self.attrs.get(name) }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Json)> { self.attrs.iter().map(|(k, v)| (k.as_str(), v)) }
    pub fn len(&self) -> usize { self.attrs.len() }
    pub fn is_empty(&self) -> bool { self.attrs.is_empty() }
}

impl FromIterator<(String, Json)> for RemoteObservation {
    fn from_iter<T: IntoIterator<Item = (String, Json)>>(iter: T) -> Self {
        let mut obs = RemoteObservation::new();
        for (k, v) in iter { obs.insert(k, v); }
        obs
    }
}

/// Attributes sent on the wire. Only present values ever appear here.
pub type WirePayload = BTreeMap<String, Json>;

/// Opaque identity token produced by an [`IdentityCodec`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityToken(String);

impl IdentityToken {
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<IdentityToken> for String {
    fn from(t: IdentityToken) -> Self { t.0 }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Replaced,
    Unchanged,
    Removed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Replaced => "replaced",
            ChangeKind::Unchanged => "unchanged",
            ChangeKind::Removed => "removed",
        };
        f.pad(s)
    }
}

/// Locally persisted truth for one resource after a completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalState {
    pub identity: IdentityToken,
    pub attributes: ResourceSpec,
}

/// Outcome of one reconciliation cycle. Consumed by the caller; never retained by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub kind: String,
    pub identity: IdentityToken,
    /// `None` when the resource was removed.
    pub canonical_state: Option<ResourceSpec>,
    pub change_kind: ChangeKind,
    /// Attributes whose observed value differs from the desired one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drift: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ReconciliationResult {
    pub fn canonical(&self) -> Option<CanonicalState> {
        self.canonical_state.as_ref().map(|attrs| CanonicalState { identity: self.identity.clone(), attributes: attrs.clone() })
    }
}

/// Structural equality where numbers compare by value (`2` == `2.0`).
pub fn values_equal(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Json::Array(xs), Json::Array(ys)) => xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y)),
        (Json::Object(xo), Json::Object(yo)) => {
            xo.len() == yo.len() && xo.iter().all(|(k, xv)| yo.get(k).map(|yv| values_equal(xv, yv)).unwrap_or(false))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spec_serde_maps_null_and_unknown_marker() {
        let spec: ResourceSpec = serde_json::from_value(json!({
            "name": "internal",
            "id": UNKNOWN_MARKER,
            "tags": null,
        }))
        .unwrap();
        assert_eq!(spec.present("name"), Some(&json!("internal")));
        assert!(spec.get("id").is_unknown());
        assert!(spec.get("tags").is_absent());
        assert_eq!(spec.len(), 2);

        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(back, json!({ "id": UNKNOWN_MARKER, "name": "internal" }));
    }

    #[test]
    fn setting_absent_removes_the_entry() {
        let mut spec = ResourceSpec::new().with("a", json!(1));
        spec.set("a", AttrValue::Absent);
        assert!(spec.is_empty());
    }

    #[test]
    fn observation_drops_nulls() {
        let obs = RemoteObservation::new().with("dns_name", json!("x.internal")).with("ips", Json::Null);
        assert_eq!(obs.len(), 1);
        assert!(obs.get("ips").is_none());
    }

    #[test]
    fn numbers_compare_by_value() {
        assert!(values_equal(&json!(2), &json!(2.0)));
        assert!(values_equal(&json!({"a": [1, 2.5]}), &json!({"a": [1.0, 2.5]})));
        assert!(!values_equal(&json!([1]), &json!([1, 2])));
        assert!(!values_equal(&json!("1"), &json!(1)));
    }
}
