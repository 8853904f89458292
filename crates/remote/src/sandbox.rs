//! In-memory control plane whose behavior per kind is driven by the schema catalog.
//!
//! Server-authoritative attributes are generated on create, write-only attributes
//! are accepted but never reported back, composite kinds only exist on registered
//! service slots, and deletion follows each kind's strategy. Faults, latency and
//! a blind lookup can be injected to exercise the reconciler's failure paths.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tether_core::{values_equal, CompositeIdentity, RemoteObservation, WirePayload};
use tether_schema::{Catalog, CreateSemantics, DeletionStrategy, IdentityScheme, KindSchema, PolicyKind};
use tracing::{debug, info};

use crate::{ControlPlane, DeleteTarget, Operation, RemoteError, RemoteResult};

const DNS_SUFFIX: &str = "railway.internal";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    identity: CompositeIdentity,
    attrs: WirePayload,
}

/// An action the sandbox executed via `invoke`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub kind: String,
    pub identity: String,
    pub action: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct World {
    /// kind -> identity string -> record
    #[serde(default)]
    records: BTreeMap<String, BTreeMap<String, Record>>,
    /// Composite identities (e.g. `service_id:environment_id`) that exist remotely.
    #[serde(default)]
    slots: BTreeSet<String>,
    #[serde(default)]
    actions: Vec<ActionRecord>,
    #[serde(default)]
    seq: u64,
}

#[derive(Default)]
struct Faults {
    next: FxHashMap<Operation, VecDeque<RemoteError>>,
    blind_lookups: u32,
    latency: Option<Duration>,
}

pub struct Sandbox {
    catalog: Catalog,
    world: Mutex<World>,
    faults: Mutex<Faults>,
    calls: Mutex<FxHashMap<(String, Operation), u64>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|e| e.into_inner()) }

impl Sandbox {
    pub fn new(catalog: Catalog) -> Self {
        Self::with_world(catalog, World::default())
    }

    fn with_world(catalog: Catalog, world: World) -> Self {
        Self { catalog, world: Mutex::new(world), faults: Mutex::new(Faults::default()), calls: Mutex::new(FxHashMap::default()) }
    }

    /// Sandbox over the built-in Railway kinds.
    pub fn railway() -> Result<Self> {
        let catalog = tether_schema::catalog::railway().context("building railway catalog")?;
        Ok(Self::new(catalog))
    }

    pub fn catalog(&self) -> &Catalog { &self.catalog }

    /// Load state written by [`Sandbox::save`]; a missing file yields an empty sandbox.
    pub fn open(catalog: Catalog, path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(catalog));
        }
        let raw = std::fs::read(path).with_context(|| format!("reading sandbox state {}", path.display()))?;
        let world: World = serde_json::from_slice(&raw).with_context(|| format!("parsing sandbox state {}", path.display()))?;
        info!(path = %path.display(), kinds = world.records.len(), slots = world.slots.len(), "sandbox: loaded");
        Ok(Self::with_world(catalog, world))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
            }
        }
        let bytes = serde_json::to_vec_pretty(&*guard(&self.world)).context("serializing sandbox state")?;
        std::fs::write(path, bytes).with_context(|| format!("writing sandbox state {}", path.display()))?;
        Ok(())
    }

    /// Make a service exist in an environment, so its instance and limits can be configured.
    pub fn register_service_instance(&self, service_id: &str, environment_id: &str) {
        let slot = CompositeIdentity::new([service_id, environment_id]).to_string();
        guard(&self.world).slots.insert(slot);
    }

    /// Remove a service from an environment, along with everything configured on it.
    pub fn unregister_service_instance(&self, service_id: &str, environment_id: &str) {
        let slot = CompositeIdentity::new([service_id, environment_id]).to_string();
        let mut w = guard(&self.world);
        w.slots.remove(&slot);
        for recs in w.records.values_mut() {
            recs.remove(&slot);
        }
    }

    /// Put an instance of a read-only kind (project, service, environment) in place.
    /// `attrs` must carry a string `id` and only declared attributes.
    pub fn seed(&self, kind: &str, attrs: WirePayload) -> Result<CompositeIdentity> {
        let schema = self.catalog.get(kind)?;
        if !schema.is_read_only() {
            anyhow::bail!("{} is managed through reconcile, not seeded", kind);
        }
        check_declared(&schema, &attrs).map_err(anyhow::Error::from)?;
        let id = attrs.get("id").and_then(Json::as_str).ok_or_else(|| anyhow::anyhow!("{} needs a string id", kind))?;
        let identity = CompositeIdentity::single(id);
        let mut w = guard(&self.world);
        w.records.entry(kind.to_string()).or_default().insert(identity.to_string(), Record { identity: identity.clone(), attrs });
        info!(kind, id = %identity, "sandbox: seeded");
        Ok(identity)
    }

    /// Delete an instance behind the reconciler's back.
    pub fn remove_out_of_band(&self, kind: &str, identity: &CompositeIdentity) -> bool {
        guard(&self.world).records.get_mut(kind).map(|r| r.remove(&identity.to_string()).is_some()).unwrap_or(false)
    }

    /// Change one attribute behind the reconciler's back. `null` clears it.
    pub fn set_out_of_band(&self, kind: &str, identity: &CompositeIdentity, attribute: &str, value: Json) -> bool {
        let mut w = guard(&self.world);
        let Some(rec) = w.records.get_mut(kind).and_then(|r| r.get_mut(&identity.to_string())) else { return false };
        if value.is_null() { rec.attrs.remove(attribute); } else { rec.attrs.insert(attribute.to_string(), value); }
        true
    }

    /// The next call of `op` (any kind) fails with `err`. Queued errors fire in order.
    pub fn fail_next(&self, op: Operation, err: RemoteError) {
        guard(&self.faults).next.entry(op).or_default().push_back(err);
    }

    /// Delay applied to every call before it runs.
    pub fn set_latency(&self, latency: Option<Duration>) { guard(&self.faults).latency = latency; }

    /// The next lookup reports nothing even when a match exists.
    pub fn blind_next_lookup(&self) { guard(&self.faults).blind_lookups += 1; }

    pub fn calls(&self, kind: &str, op: Operation) -> u64 {
        guard(&self.calls).get(&(kind.to_string(), op)).copied().unwrap_or(0)
    }

    pub fn actions(&self) -> Vec<ActionRecord> { guard(&self.world).actions.clone() }

    /// Number of live instances of `kind`.
    pub fn count(&self, kind: &str) -> usize { guard(&self.world).records.get(kind).map(|r| r.len()).unwrap_or(0) }

    /// Every stored attribute, write-only ones included.
    pub fn raw(&self, kind: &str, identity: &CompositeIdentity) -> Option<WirePayload> {
        guard(&self.world).records.get(kind).and_then(|r| r.get(&identity.to_string())).map(|r| r.attrs.clone())
    }

    async fn enter(&self, kind: &str, op: Operation) -> RemoteResult<std::sync::Arc<KindSchema>> {
        *guard(&self.calls).entry((kind.to_string(), op)).or_insert(0) += 1;
        let latency = guard(&self.faults).latency;
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
        if let Some(err) = guard(&self.faults).next.get_mut(&op).and_then(|q| q.pop_front()) {
            debug!(kind, op = %op, error = %err, "sandbox: injected fault");
            return Err(err);
        }
        debug!(kind, op = %op, "sandbox: call");
        self.catalog.get(kind).map_err(|e| RemoteError::NotSupported(e.to_string()))
    }
}

fn is_composite(schema: &KindSchema) -> bool { matches!(schema.identity_scheme(), IdentityScheme::Composite { .. }) }

/// What the remote reports: everything stored except write-only attributes.
fn visible(schema: &KindSchema, attrs: &WirePayload) -> RemoteObservation {
    attrs
        .iter()
        .filter(|(k, _)| !matches!(schema.policy().policy_of(k), Ok(PolicyKind::WriteOnly)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn check_declared(schema: &KindSchema, payload: &WirePayload) -> RemoteResult<()> {
    for k in payload.keys() {
        if !schema.policy().contains(k) || schema.is_local(k) {
            return Err(RemoteError::ValidationRejected { attribute: k.clone(), reason: format!("unknown field for {}", schema.name()) });
        }
    }
    Ok(())
}

fn matches_key(attrs: &WirePayload, key: &WirePayload) -> bool {
    key.iter().all(|(k, v)| attrs.get(k).map(|a| values_equal(a, v)).unwrap_or(false))
}

/// Composite identity from payload components; every component must be a string.
fn composite_from(schema: &KindSchema, payload: &WirePayload) -> RemoteResult<CompositeIdentity> {
    let mut parts = Vec::with_capacity(schema.codec().arity());
    for name in schema.codec().names() {
        match payload.get(name).and_then(Json::as_str) {
            Some(s) => parts.push(s.to_string()),
            None => return Err(RemoteError::ValidationRejected { attribute: name.clone(), reason: "required".into() }),
        }
    }
    Ok(CompositeIdentity::new(parts))
}

impl World {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Fill server-authoritative attributes the payload did not set.
    fn generate(&mut self, schema: &KindSchema, attrs: &mut WirePayload, id: &str) {
        let sa: Vec<String> = schema.policy().attributes_with(PolicyKind::ServerAuthoritative).map(str::to_string).collect();
        for attr in sa {
            if attrs.contains_key(&attr) {
                continue;
            }
            let value = match attr.as_str() {
                a if matches!(schema.identity_scheme(), IdentityScheme::Generated { attribute } if attribute == a) => json!(id),
                "dns_name" => {
                    let label = ["service_name", "name"].iter().find_map(|k| attrs.get(*k).and_then(Json::as_str)).unwrap_or(id);
                    json!(format!("{}.{}", label, DNS_SUFFIX))
                }
                "private_ips" => {
                    let n = self.next_seq();
                    json!([format!("10.{}.{}.{}", 128 + (n >> 16) % 128, (n >> 8) % 256, n % 256)])
                }
                _ => continue,
            };
            attrs.insert(attr, value);
        }
    }

    fn find(&self, kind: &str, key: &WirePayload) -> Option<&Record> {
        self.records.get(kind)?.values().find(|r| matches_key(&r.attrs, key))
    }
}

#[async_trait::async_trait]
impl ControlPlane for Sandbox {
    async fn read(&self, kind: &str, identity: &CompositeIdentity) -> RemoteResult<Option<RemoteObservation>> {
        let schema = self.enter(kind, Operation::Read).await?;
        let w = guard(&self.world);
        let key = identity.to_string();
        if let Some(rec) = w.records.get(kind).and_then(|r| r.get(&key)) {
            return Ok(Some(visible(&schema, &rec.attrs)));
        }
        // A registered service slot has an instance even before anything was configured on it.
        if is_composite(&schema) && w.slots.contains(&key) && identity.len() == schema.codec().arity() {
            let obs = schema.codec().labelled(identity).map(|(n, v)| (n.to_string(), json!(v))).collect();
            return Ok(Some(obs));
        }
        Ok(None)
    }

    async fn lookup(&self, kind: &str, natural_key: &WirePayload) -> RemoteResult<Option<(CompositeIdentity, RemoteObservation)>> {
        let schema = self.enter(kind, Operation::Lookup).await?;
        {
            let mut f = guard(&self.faults);
            if f.blind_lookups > 0 {
                f.blind_lookups -= 1;
                return Ok(None);
            }
        }
        let w = guard(&self.world);
        Ok(w.find(kind, natural_key).map(|r| (r.identity.clone(), visible(&schema, &r.attrs))))
    }

    async fn create_or_get(&self, kind: &str, payload: &WirePayload) -> RemoteResult<(CompositeIdentity, RemoteObservation)> {
        let schema = self.enter(kind, Operation::CreateOrGet).await?;
        if schema.is_read_only() {
            return Err(RemoteError::NotSupported(format!("create for {}", kind)));
        }
        check_declared(&schema, payload)?;
        let mut w = guard(&self.world);

        if is_composite(&schema) {
            let identity = composite_from(&schema, payload)?;
            let key = identity.to_string();
            if !w.slots.contains(&key) {
                return Err(RemoteError::NotFound(format!("service instance {}", key)));
            }
            let rec = w
                .records
                .entry(kind.to_string())
                .or_default()
                .entry(key)
                .or_insert_with(|| Record { identity: identity.clone(), attrs: WirePayload::new() });
            rec.attrs.extend(payload.iter().map(|(k, v)| (k.clone(), v.clone())));
            return Ok((identity, visible(&schema, &rec.attrs)));
        }

        let mut key = WirePayload::new();
        for attr in schema.natural_key() {
            let v = payload.get(attr).ok_or_else(|| RemoteError::ValidationRejected { attribute: attr.clone(), reason: "required".into() })?;
            key.insert(attr.clone(), v.clone());
        }
        if let Some(rec) = w.find(kind, &key) {
            return match schema.create_semantics() {
                CreateSemantics::RemoteDeduplicates => Ok((rec.identity.clone(), visible(&schema, &rec.attrs))),
                CreateSemantics::LookupThenCreate => Err(RemoteError::Conflict(format!("{} {} already exists", kind, rec.identity))),
            };
        }

        let id = uuid::Uuid::new_v4().to_string();
        let mut attrs = payload.clone();
        w.generate(&schema, &mut attrs, &id);
        let identity = CompositeIdentity::single(id.clone());
        let obs = visible(&schema, &attrs);
        w.records.entry(kind.to_string()).or_default().insert(identity.to_string(), Record { identity: identity.clone(), attrs });
        info!(kind, id = %id, "sandbox: created");
        Ok((identity, obs))
    }

    async fn update(&self, kind: &str, identity: &CompositeIdentity, delta: &WirePayload) -> RemoteResult<RemoteObservation> {
        let schema = self.enter(kind, Operation::Update).await?;
        if !schema.supports_update() {
            return Err(RemoteError::NotSupported(format!("update for {}", kind)));
        }
        check_declared(&schema, delta)?;
        for k in delta.keys() {
            if matches!(schema.policy().policy_of(k), Ok(PolicyKind::Immutable)) {
                return Err(RemoteError::ValidationRejected { attribute: k.clone(), reason: "cannot be changed in place".into() });
            }
        }
        let mut w = guard(&self.world);
        let key = identity.to_string();
        let slot_backed = is_composite(&schema) && w.slots.contains(&key);
        let recs = w.records.entry(kind.to_string()).or_default();
        if !recs.contains_key(&key) {
            if !slot_backed {
                return Err(RemoteError::NotFound(format!("{} {}", kind, key)));
            }
            let attrs = schema.codec().labelled(identity).map(|(n, v)| (n.to_string(), json!(v))).collect();
            recs.insert(key.clone(), Record { identity: identity.clone(), attrs });
        }
        let rec = recs.get_mut(&key).ok_or_else(|| RemoteError::NotFound(format!("{} {}", kind, key)))?;
        rec.attrs.extend(delta.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(visible(&schema, &rec.attrs))
    }

    async fn delete(&self, kind: &str, target: &DeleteTarget) -> RemoteResult<()> {
        let schema = self.enter(kind, Operation::Delete).await?;
        let mut w = guard(&self.world);
        let recs = w.records.entry(kind.to_string()).or_default();
        match (schema.deletion(), target) {
            (DeletionStrategy::Scoped, DeleteTarget::Identity(id)) => {
                recs.remove(&id.to_string()).map(|_| ()).ok_or_else(|| RemoteError::NotFound(format!("{} {}", kind, id)))
            }
            (DeletionStrategy::Coarse { parent_attribute }, DeleteTarget::Parent { attribute, value }) if parent_attribute == attribute => {
                let before = recs.len();
                recs.retain(|_, r| !r.attrs.get(attribute).map(|v| values_equal(v, value)).unwrap_or(false));
                info!(kind, parent = %attribute, removed = before - recs.len(), "sandbox: coarse delete");
                Ok(())
            }
            _ => Err(RemoteError::NotSupported(format!("delete for {}", kind))),
        }
    }

    async fn invoke(&self, kind: &str, identity: &CompositeIdentity, action: &str) -> RemoteResult<()> {
        let schema = self.enter(kind, Operation::Invoke).await?;
        if !schema.actions().iter().any(|a| a.action == action) {
            return Err(RemoteError::NotSupported(format!("{} for {}", action, kind)));
        }
        let mut w = guard(&self.world);
        let key = identity.to_string();
        let exists = w.records.get(kind).map(|r| r.contains_key(&key)).unwrap_or(false) || (is_composite(&schema) && w.slots.contains(&key));
        if !exists {
            return Err(RemoteError::NotFound(format!("{} {}", kind, key)));
        }
        w.actions.push(ActionRecord { kind: kind.to_string(), identity: key, action: action.to_string() });
        Ok(())
    }
}

/// `TETHER_SANDBOX_PATH`, else `~/.tether/sandbox.json`.
pub fn default_sandbox_path() -> PathBuf {
    if let Ok(p) = std::env::var("TETHER_SANDBOX_PATH") {
        return PathBuf::from(p);
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".tether").join("sandbox.json"),
        None => PathBuf::from("sandbox.json"),
    }
}
