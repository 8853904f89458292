//! The reconciliation cycle for one resource instance.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::json;
use tether_core::{
    AttrValue, CanonicalState, ChangeKind, CompositeIdentity, ReconciliationResult, RemoteObservation, ResourceSpec,
};
use tether_remote::{ControlPlane, DeleteTarget, Operation, RemoteError, RemoteResult};
use tether_schema::{DeletionStrategy, KindSchema, PolicyKind, Violation};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::drift::{self, DriftResult};
use crate::plan::{self, Plan, PlanAction};
use crate::{bounded, FaultCause, Phase, ReconcileError, ReconcilerConfig, Resolver};

/// Drives cycles for one resource kind. Cheap to clone; clones share the schema and remote.
#[derive(Clone)]
pub struct Reconciler {
    kind: Arc<KindSchema>,
    remote: Arc<dyn ControlPlane>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(kind: Arc<KindSchema>, remote: Arc<dyn ControlPlane>, config: ReconcilerConfig) -> Self {
        Self { kind, remote, config }
    }

    pub fn kind(&self) -> &KindSchema { &self.kind }
    pub fn config(&self) -> &ReconcilerConfig { &self.config }

    /// Planning only; never calls the remote.
    pub fn plan(&self, desired: &ResourceSpec, prior: Option<&CanonicalState>) -> Result<Plan, ReconcileError> {
        plan::plan(&self.kind, desired, prior)
    }

    /// One full cycle. `prior` is the canonical state from the last completed cycle, if any.
    pub async fn reconcile(&self, desired: &ResourceSpec, prior: Option<&CanonicalState>) -> Result<ReconciliationResult, ReconcileError> {
        let span = info_span!("reconcile", kind = %self.kind.name(), identity = %prior.map(|p| p.identity.as_str()).unwrap_or("(new)"));
        self.measured("reconcile", self.cycle(desired, prior)).instrument(span).await
    }

    /// Read an existing instance by token and adopt it as canonical state.
    pub async fn import_by_identity(&self, token: &str) -> Result<ReconciliationResult, ReconcileError> {
        let span = info_span!("import", kind = %self.kind.name(), identity = %token);
        let fut = async {
            let identity = self.kind.codec().decode(token)?;
            self.observe(&ResourceSpec::new(), None, identity, ChangeKind::Unchanged, Vec::new()).await
        };
        self.measured("import", fut).instrument(span).await
    }

    /// Read a read-only kind by id. The id must pass the kind's validators; an
    /// absent instance comes back as `removed`.
    pub async fn lookup(&self, id: &str) -> Result<ReconciliationResult, ReconcileError> {
        let span = info_span!("lookup", kind = %self.kind.name(), identity = %id);
        let fut = async {
            if !self.kind.is_read_only() {
                return Err(ReconcileError::NotSupported { kind: self.kind.name().to_string(), operation: "lookup".into() });
            }
            let identity = self.kind.codec().decode(id)?;
            let mut given = ResourceSpec::new();
            for (name, value) in self.kind.codec().labelled(&identity) {
                given.set(name, json!(value));
            }
            let violations = self.kind.validate(&given);
            if !violations.is_empty() {
                return Err(ReconcileError::InvalidSpec(violations));
            }
            self.observe(&ResourceSpec::new(), None, identity, ChangeKind::Unchanged, Vec::new()).await
        };
        self.measured("lookup", fut).instrument(span).await
    }

    /// Remove a previously reconciled instance per the kind's deletion strategy.
    pub async fn destroy(&self, prior: &CanonicalState) -> Result<ReconciliationResult, ReconcileError> {
        let span = info_span!("destroy", kind = %self.kind.name(), identity = %prior.identity);
        let fut = async {
            let identity = self.kind.codec().decode(prior.identity.as_str())?;
            let mut warnings = Vec::new();
            self.delete_prior(prior, &identity, &mut warnings).await?;
            Ok::<_, ReconcileError>(ReconciliationResult {
                kind: self.kind.name().to_string(),
                identity: prior.identity.clone(),
                canonical_state: None,
                change_kind: ChangeKind::Removed,
                drift: Vec::new(),
                warnings,
            })
        };
        self.measured("destroy", fut).instrument(span).await
    }

    async fn measured<F>(&self, what: &'static str, fut: F) -> Result<ReconciliationResult, ReconcileError>
    where
        F: Future<Output = Result<ReconciliationResult, ReconcileError>>,
    {
        let t0 = Instant::now();
        counter!("reconcile_attempts", 1u64);
        info!("{}: start", what);
        let out = fut.await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &out {
            Ok(r) => {
                counter!("reconcile_ok", 1u64);
                info!(phase = %Phase::Done, identity = %r.identity, change = %r.change_kind, drift = r.drift.len(), took_ms = %t0.elapsed().as_millis(), "{}: ok", what);
            }
            Err(e) => {
                if matches!(e, ReconcileError::Faulted { .. }) {
                    counter!("reconcile_faulted", 1u64);
                }
                warn!(phase = %Phase::Faulted, error = %e, retryable = e.is_retryable(), took_ms = %t0.elapsed().as_millis(), "{}: failed", what);
            }
        }
        out
    }

    async fn call<T, F>(&self, phase: Phase, operation: Operation, fut: F) -> Result<T, ReconcileError>
    where
        F: Future<Output = RemoteResult<T>>,
    {
        bounded(self.config.call_timeout, fut).await.map_err(|cause| ReconcileError::Faulted { phase, operation, cause })
    }

    fn resolver(&self) -> Resolver<'_> { Resolver::new(&self.kind, self.remote.as_ref(), self.config.call_timeout) }

    async fn cycle(&self, desired: &ResourceSpec, prior: Option<&CanonicalState>) -> Result<ReconciliationResult, ReconcileError> {
        let name = self.kind.name();
        let plan = self.plan(desired, prior)?;
        debug!(phase = %Phase::Planning, action = %plan.action, "reconcile: planned");

        let mut warnings = Vec::new();
        let (identity, change) = match (plan.action, prior) {
            (PlanAction::Create, _) | (_, None) => {
                let (id, _) = self.resolver().create_or_get(desired).await?;
                (id, ChangeKind::Created)
            }
            (PlanAction::NoOp, Some(p)) => (self.kind.codec().decode(p.identity.as_str())?, ChangeKind::Unchanged),
            (PlanAction::Update { delta }, Some(p)) => {
                let id = self.kind.codec().decode(p.identity.as_str())?;
                debug!(phase = %Phase::Applying, attrs = delta.len(), "reconcile: update");
                self.call(Phase::Applying, Operation::Update, self.remote.update(name, &id, &delta)).await?;
                (id, ChangeKind::Updated)
            }
            (PlanAction::Replace { reasons }, Some(p)) => {
                let old = self.kind.codec().decode(p.identity.as_str())?;
                info!(phase = %Phase::Applying, reasons = %reasons.join(","), "reconcile: replacing");
                self.delete_prior(p, &old, &mut warnings).await?;
                let (id, _) = self.resolver().create_or_get(desired).await?;
                (id, ChangeKind::Replaced)
            }
        };
        if change != ChangeKind::Unchanged {
            self.run_actions(desired, &identity).await?;
        }
        self.observe(desired, prior, identity, change, warnings).await
    }

    /// Post-apply actions whose flag is set, or unset with a default of `true`.
    async fn run_actions(&self, desired: &ResourceSpec, identity: &CompositeIdentity) -> Result<(), ReconcileError> {
        for act in self.kind.actions() {
            if act.wanted(desired) {
                info!(action = %act.action, "reconcile: post-apply action");
                self.call(Phase::Applying, Operation::Invoke, self.remote.invoke(self.kind.name(), identity, &act.action)).await?;
            }
        }
        Ok(())
    }

    async fn delete_prior(&self, prior: &CanonicalState, identity: &CompositeIdentity, warnings: &mut Vec<String>) -> Result<(), ReconcileError> {
        let name = self.kind.name();
        match self.kind.deletion() {
            DeletionStrategy::Unsupported => {
                info!(identity = %prior.identity, "reconcile: remote deletion unsupported, abandoning instance");
            }
            DeletionStrategy::Scoped => {
                let target = DeleteTarget::Identity(identity.clone());
                match bounded(self.config.call_timeout, self.remote.delete(name, &target)).await {
                    Ok(()) => {}
                    Err(FaultCause::Remote(RemoteError::NotFound(_))) => {
                        let msg = format!("{} {} was not found remotely; treated as already deleted", name, prior.identity);
                        info!(identity = %prior.identity, "reconcile: {}", msg);
                        warnings.push(msg);
                    }
                    Err(cause) => return Err(ReconcileError::Faulted { phase: Phase::Applying, operation: Operation::Delete, cause }),
                }
            }
            DeletionStrategy::Coarse { parent_attribute } => {
                let value = prior
                    .attributes
                    .present(parent_attribute)
                    .cloned()
                    .ok_or_else(|| ReconcileError::InvalidSpec(vec![Violation::new(parent_attribute, "needed to delete the previous instance")]))?;
                let msg = format!(
                    "{} deletion removes every {} with {} = {}, including siblings not managed here",
                    name, name, parent_attribute, value
                );
                warn!(identity = %prior.identity, "{}", msg);
                warnings.push(msg);
                let target = DeleteTarget::Parent { attribute: parent_attribute.clone(), value };
                self.call(Phase::Applying, Operation::Delete, self.remote.delete(name, &target)).await?;
            }
        }
        Ok(())
    }

    async fn observe(
        &self,
        desired: &ResourceSpec,
        prior: Option<&CanonicalState>,
        identity: CompositeIdentity,
        change: ChangeKind,
        warnings: Vec<String>,
    ) -> Result<ReconciliationResult, ReconcileError> {
        let token = self.kind.codec().encode(&identity)?;
        let observed = self.call(Phase::Observing, Operation::Read, self.remote.read(self.kind.name(), &identity)).await?;
        let result = |canonical_state, change_kind, drift| ReconciliationResult {
            kind: self.kind.name().to_string(),
            identity: token.clone(),
            canonical_state,
            change_kind,
            drift,
            warnings: warnings.clone(),
        };
        let drift = match drift::detect(self.kind.policy(), desired, observed.as_ref()) {
            DriftResult::Vanished => {
                info!(phase = %Phase::Observing, identity = %token, "reconcile: instance vanished");
                return Ok(result(None, ChangeKind::Removed, Vec::new()));
            }
            DriftResult::Unchanged => Vec::new(),
            DriftResult::Drifted(attrs) => {
                info!(phase = %Phase::Observing, drift = %attrs.join(","), "reconcile: drift detected");
                attrs
            }
        };
        let obs = observed.unwrap_or_default();
        let canonical = merge(&self.kind, desired, prior.map(|p| &p.attributes), &identity, &obs);
        Ok(result(Some(canonical), change, drift))
    }
}

/// Canonical state after a cycle: each attribute taken from where its policy says truth lives.
pub fn merge(
    kind: &KindSchema,
    desired: &ResourceSpec,
    prior: Option<&ResourceSpec>,
    identity: &CompositeIdentity,
    obs: &RemoteObservation,
) -> ResourceSpec {
    let mut out = ResourceSpec::new();
    for (attr, policy) in kind.policy().iter() {
        let value = match policy {
            PolicyKind::WriteOnly => match desired.get(attr) {
                AttrValue::Unknown => prior.map(|p| p.get(attr).clone()).unwrap_or_default(),
                v => v.clone(),
            },
            PolicyKind::ServerAuthoritative | PolicyKind::Mutable => AttrValue::from(obs.get(attr).cloned()),
            PolicyKind::Immutable => match obs.get(attr) {
                Some(v) => AttrValue::Present(v.clone()),
                None => desired.get(attr).clone(),
            },
        };
        out.set(attr, value);
    }
    for (name, value) in kind.codec().labelled(identity) {
        out.set(name, json!(value));
    }
    out
}
