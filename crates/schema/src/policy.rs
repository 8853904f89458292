//! Field policy table: one policy per declared attribute, fixed at schema definition.

#![forbid(unsafe_code)]

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::SchemaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    /// Always refreshed from the remote read.
    ServerAuthoritative,
    /// Never read back; local value is authoritative.
    WriteOnly,
    /// Any change forces replacement.
    Immutable,
    /// Read-modify-write.
    Mutable,
}

impl PolicyKind {
    /// Whether the drift detector compares this attribute against observations.
    pub fn is_observed(self) -> bool { matches!(self, PolicyKind::ServerAuthoritative | PolicyKind::Mutable) }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PolicyKind::ServerAuthoritative => "server-authoritative",
            PolicyKind::WriteOnly => "write-only",
            PolicyKind::Immutable => "immutable",
            PolicyKind::Mutable => "mutable",
        };
        f.write_str(s)
    }
}

/// Read-only after [`FieldPolicyBuilder::build`]; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct FieldPolicyTable {
    kind: String,
    order: Vec<String>,
    map: FxHashMap<String, PolicyKind>,
}

impl FieldPolicyTable {
    pub fn builder(kind: impl Into<String>) -> FieldPolicyBuilder {
        FieldPolicyBuilder { kind: kind.into(), entries: Vec::new() }
    }

    pub fn policy_of(&self, attribute: &str) -> Result<PolicyKind, SchemaError> {
        self.map.get(attribute).copied().ok_or_else(|| SchemaError::UnknownAttribute {
            kind: self.kind.clone(),
            attribute: attribute.to_string(),
        })
    }

    pub fn contains(&self, attribute: &str) -> bool { self.map.contains_key(attribute) }

    /// Entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, PolicyKind)> + '_ {
        self.order.iter().map(move |a| (a.as_str(), self.map[a]))
    }

    pub fn attributes_with(&self, policy: PolicyKind) -> impl Iterator<Item = &str> + '_ {
        self.iter().filter(move |(_, p)| *p == policy).map(|(a, _)| a)
    }

    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }
}

pub struct FieldPolicyBuilder {
    kind: String,
    entries: Vec<(String, PolicyKind)>,
}

impl FieldPolicyBuilder {
    pub fn entry(mut self, attribute: &str, policy: PolicyKind) -> Self {
        self.entries.push((attribute.to_string(), policy));
        self
    }

    pub fn server_authoritative(self, attribute: &str) -> Self { self.entry(attribute, PolicyKind::ServerAuthoritative) }
    pub fn write_only(self, attribute: &str) -> Self { self.entry(attribute, PolicyKind::WriteOnly) }
    pub fn immutable(self, attribute: &str) -> Self { self.entry(attribute, PolicyKind::Immutable) }
    pub fn mutable(self, attribute: &str) -> Self { self.entry(attribute, PolicyKind::Mutable) }

    pub fn build(self) -> Result<FieldPolicyTable, SchemaError> {
        let mut map = FxHashMap::default();
        let mut order = Vec::with_capacity(self.entries.len());
        for (attr, policy) in self.entries {
            if map.insert(attr.clone(), policy).is_some() {
                return Err(SchemaError::DuplicateAttribute { kind: self.kind, attribute: attr });
            }
            order.push(attr);
        }
        Ok(FieldPolicyTable { kind: self.kind, order, map })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> FieldPolicyTable {
        FieldPolicyTable::builder("network")
            .server_authoritative("id")
            .immutable("name")
            .mutable("tags")
            .write_only("secret")
            .build()
            .unwrap()
    }

    #[test]
    fn policy_lookup_and_unknown_attribute() {
        let t = table();
        assert_eq!(t.policy_of("name").unwrap(), PolicyKind::Immutable);
        assert_eq!(t.policy_of("secret").unwrap(), PolicyKind::WriteOnly);
        match t.policy_of("nope") {
            Err(SchemaError::UnknownAttribute { kind, attribute }) => {
                assert_eq!(kind, "network");
                assert_eq!(attribute, "nope");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn duplicate_entries_are_rejected() {
        let err = FieldPolicyTable::builder("k").mutable("a").immutable("a").build().unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateAttribute { .. }));
    }

    #[test]
    fn iteration_keeps_declaration_order() {
        let names: Vec<_> = table().iter().map(|(a, _)| a.to_string()).collect();
        assert_eq!(names, vec!["id", "name", "tags", "secret"]);
        let observed: Vec<_> = table().iter().filter(|(_, p)| p.is_observed()).map(|(a, _)| a.to_string()).collect();
        assert_eq!(observed, vec!["id", "tags"]);
    }
}
