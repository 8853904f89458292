//! Tether schema: per-kind field policies, identity layout, natural keys and
//! lifecycle capabilities. Schemas are defined once and shared read-only.

#![forbid(unsafe_code)]

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tether_core::{IdentityCodec, ResourceSpec, WirePayload};
use thiserror::Error;

pub mod catalog;
pub mod policy;
pub mod validate;

pub use policy::{FieldPolicyBuilder, FieldPolicyTable, PolicyKind};
pub use validate::{Validator, Violation};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown attribute {attribute:?} for kind {kind}")]
    UnknownAttribute { kind: String, attribute: String },
    #[error("attribute {attribute:?} declared twice for kind {kind}")]
    DuplicateAttribute { kind: String, attribute: String },
    #[error("unknown resource kind {0:?}")]
    UnknownKind(String),
    #[error("invalid schema for kind {kind}: {reason}")]
    InvalidSchema { kind: String, reason: String },
}

/// Where a resource's identity comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityScheme {
    /// Remote assigns an opaque id reported under `attribute`.
    Generated { attribute: String },
    /// Identity is the tuple of these (immutable) attributes.
    Composite { attributes: Vec<String> },
}

/// How the remote behaves when asked to create something that may already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateSemantics {
    /// Remote `create_or_get` returns the existing instance for an equal natural key.
    RemoteDeduplicates,
    /// Remote rejects duplicates with `Conflict`; look up by natural key first.
    LookupThenCreate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionStrategy {
    /// No remote deletion; the instance is abandoned and the removal only logged.
    Unsupported,
    /// Delete exactly this identity.
    Scoped,
    /// Remote only deletes every instance under a parent. Unsafe when several
    /// managed resources share that parent: all of them are removed.
    Coarse { parent_attribute: String },
}

/// Remote action triggered after a create, update or replace. `flag` is a local
/// control attribute: it is never sent to the remote, and `default` applies when
/// it is not set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostApplyAction {
    pub flag: String,
    pub action: String,
    #[serde(default)]
    pub default: bool,
}

impl PostApplyAction {
    /// Whether `desired` asks for the action. `Unknown` and absent fall back to the default.
    pub fn wanted(&self, desired: &ResourceSpec) -> bool {
        match desired.present(&self.flag) {
            Some(v) => v.as_bool() == Some(true),
            None => self.default,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KindSchema {
    name: String,
    policy: FieldPolicyTable,
    identity: IdentityScheme,
    codec: IdentityCodec,
    natural_key: Vec<String>,
    create: CreateSemantics,
    supports_update: bool,
    deletion: DeletionStrategy,
    actions: Vec<PostApplyAction>,
    required: Vec<String>,
    validators: Vec<(String, Validator)>,
    read_only: bool,
}

impl KindSchema {
    pub fn builder(policy: FieldPolicyTable, identity: IdentityScheme) -> KindSchemaBuilder {
        KindSchemaBuilder {
            policy,
            identity,
            natural_key: Vec::new(),
            create: CreateSemantics::RemoteDeduplicates,
            supports_update: false,
            deletion: DeletionStrategy::Unsupported,
            actions: Vec::new(),
            required: Vec::new(),
            validators: Vec::new(),
            read_only: false,
        }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn policy(&self) -> &FieldPolicyTable { &self.policy }
    pub fn identity_scheme(&self) -> &IdentityScheme { &self.identity }
    pub fn codec(&self) -> &IdentityCodec { &self.codec }
    pub fn natural_key(&self) -> &[String] { &self.natural_key }
    pub fn create_semantics(&self) -> CreateSemantics { self.create }
    pub fn supports_update(&self) -> bool { self.supports_update }
    pub fn deletion(&self) -> &DeletionStrategy { &self.deletion }
    pub fn actions(&self) -> &[PostApplyAction] { &self.actions }
    /// Looked up by id only; never created, updated or deleted.
    pub fn is_read_only(&self) -> bool { self.read_only }
    /// Local control flags (post-apply action flags); kept in state, never sent.
    pub fn is_local(&self, attr: &str) -> bool { self.actions.iter().any(|a| a.flag == attr) }

    /// Every attribute in `spec` must be declared.
    pub fn check_attributes(&self, spec: &ResourceSpec) -> Result<(), SchemaError> {
        for name in spec.names() {
            self.policy.policy_of(name)?;
        }
        Ok(())
    }

    /// Required attributes and per-attribute validators. Collects every violation.
    pub fn validate(&self, spec: &ResourceSpec) -> Vec<Violation> {
        let mut out = Vec::new();
        for attr in &self.required {
            if spec.get(attr).is_absent() {
                out.push(Violation::new(attr, "is required"));
            }
        }
        for (attr, v) in &self.validators {
            if let Some(violation) = v.check(attr, spec) {
                out.push(violation);
            }
        }
        out
    }

    /// Natural key values; every component must be known.
    pub fn natural_key_of(&self, spec: &ResourceSpec) -> Result<WirePayload, Vec<Violation>> {
        let mut key = WirePayload::new();
        let mut missing = Vec::new();
        for attr in &self.natural_key {
            match spec.present(attr) {
                Some(v) => { key.insert(attr.clone(), v.clone()); }
                None => missing.push(Violation::new(attr, "natural key attribute must be known before create")),
            }
        }
        if missing.is_empty() { Ok(key) } else { Err(missing) }
    }
}

pub struct KindSchemaBuilder {
    policy: FieldPolicyTable,
    identity: IdentityScheme,
    natural_key: Vec<String>,
    create: CreateSemantics,
    supports_update: bool,
    deletion: DeletionStrategy,
    actions: Vec<PostApplyAction>,
    required: Vec<String>,
    validators: Vec<(String, Validator)>,
    read_only: bool,
}

impl KindSchemaBuilder {
    pub fn natural_key(mut self, attrs: &[&str]) -> Self {
        self.natural_key = attrs.iter().map(|s| s.to_string()).collect();
        self
    }
    pub fn create(mut self, semantics: CreateSemantics) -> Self { self.create = semantics; self }
    pub fn updatable(mut self) -> Self { self.supports_update = true; self }
    pub fn read_only(mut self) -> Self { self.read_only = true; self }
    pub fn deletion(mut self, strategy: DeletionStrategy) -> Self { self.deletion = strategy; self }
    pub fn action(mut self, flag: &str, action: &str, default: bool) -> Self {
        self.actions.push(PostApplyAction { flag: flag.to_string(), action: action.to_string(), default });
        self
    }
    pub fn required(mut self, attrs: &[&str]) -> Self {
        self.required.extend(attrs.iter().map(|s| s.to_string()));
        self
    }
    pub fn validate(mut self, attr: &str, v: Validator) -> Self {
        self.validators.push((attr.to_string(), v));
        self
    }

    pub fn build(self, name: &str) -> Result<KindSchema, SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidSchema { kind: name.to_string(), reason };
        let expect = |attr: &str, allowed: &[PolicyKind], role: &str| -> Result<(), SchemaError> {
            let p = self.policy.policy_of(attr)?;
            if allowed.contains(&p) { Ok(()) } else { Err(invalid(format!("{} attribute {:?} cannot be {}", role, attr, p))) }
        };

        let codec = match &self.identity {
            IdentityScheme::Generated { attribute } => {
                expect(attribute.as_str(), &[PolicyKind::ServerAuthoritative], "generated identity")?;
                IdentityCodec::new(&[attribute.as_str()])
            }
            IdentityScheme::Composite { attributes } => {
                if attributes.is_empty() {
                    return Err(invalid("composite identity needs at least one attribute".into()));
                }
                for a in attributes {
                    expect(a.as_str(), &[PolicyKind::Immutable], "identity")?;
                }
                let names: Vec<&str> = attributes.iter().map(|s| s.as_str()).collect();
                IdentityCodec::new(&names)
            }
        };
        if self.read_only {
            if let Some((attr, p)) = self.policy.iter().find(|(_, p)| *p != PolicyKind::ServerAuthoritative) {
                return Err(invalid(format!("read-only kind attribute {:?} cannot be {}", attr, p)));
            }
            if self.supports_update || !self.actions.is_empty() || self.deletion != DeletionStrategy::Unsupported {
                return Err(invalid("read-only kinds cannot be written".into()));
            }
        } else if self.natural_key.is_empty() {
            return Err(invalid("natural key is empty".into()));
        }
        for a in &self.natural_key {
            expect(a.as_str(), &[PolicyKind::Immutable], "natural key")?;
        }
        if let DeletionStrategy::Coarse { parent_attribute } = &self.deletion {
            expect(parent_attribute.as_str(), &[PolicyKind::Immutable], "deletion parent")?;
        }
        for act in &self.actions {
            expect(act.flag.as_str(), &[PolicyKind::WriteOnly], "action flag")?;
        }
        for a in self.required.iter().chain(self.validators.iter().map(|(a, _)| a)) {
            self.policy.policy_of(a)?;
        }

        Ok(KindSchema {
            name: name.to_string(),
            policy: self.policy,
            identity: self.identity,
            codec,
            natural_key: self.natural_key,
            create: self.create,
            supports_update: self.supports_update,
            deletion: self.deletion,
            actions: self.actions,
            required: self.required,
            validators: self.validators,
            read_only: self.read_only,
        })
    }
}

/// Name -> schema registry.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    kinds: FxHashMap<String, Arc<KindSchema>>,
}

impl Catalog {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, kind: KindSchema) -> Arc<KindSchema> {
        let kind = Arc::new(kind);
        self.kinds.insert(kind.name().to_string(), Arc::clone(&kind));
        kind
    }

    pub fn get(&self, name: &str) -> Result<Arc<KindSchema>, SchemaError> {
        self.kinds.get(name).cloned().ok_or_else(|| SchemaError::UnknownKind(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.kinds.keys().map(|k| k.as_str()).collect();
        v.sort_unstable();
        v
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<KindSchema>> { self.kinds.values() }
}
