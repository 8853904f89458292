//! Tether apply: plans and drives one reconciliation cycle per resource.
//!
//! A cycle runs Planning -> Applying -> Observing -> Done and faults on any
//! remote error or timeout. The caller's prior state is never mutated; the
//! outcome is returned as a [`ReconciliationResult`].

#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tether_core::{CanonicalState, IdentityError, ReconciliationResult, ResourceSpec};
use tether_remote::{Operation, RemoteError, RemoteResult};
use tether_schema::{SchemaError, Violation};
use thiserror::Error;

pub mod desired;
pub mod drift;
pub mod plan;
pub mod reconciler;
pub mod resolver;

pub use desired::{parse_desired, DesiredResource};
pub use drift::{detect, DriftResult};
pub use plan::{Plan, PlanAction};
pub use reconciler::Reconciler;
pub use resolver::Resolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Applying,
    Observing,
    Done,
    Faulted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Planning => "planning",
            Phase::Applying => "applying",
            Phase::Observing => "observing",
            Phase::Done => "done",
            Phase::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FaultCause {
    #[error(transparent)]
    Remote(RemoteError),
    /// Outcome unknown; the remote may or may not have applied the call.
    #[error("timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconcileError {
    #[error("malformed identity: {0}")]
    MalformedIdentity(#[from] IdentityError),
    #[error("unknown attribute {attribute:?} for kind {kind}")]
    UnknownAttribute { kind: String, attribute: String },
    #[error("{kind}: existing instance does not match desired {attribute:?} (desired {desired}, remote {observed})")]
    ConflictUnresolvable { kind: String, attribute: String, desired: Json, observed: Json },
    #[error("{kind}: {operation} is not supported")]
    NotSupported { kind: String, operation: String },
    #[error("faulted while {phase} ({operation}): {cause}")]
    Faulted { phase: Phase, operation: Operation, cause: FaultCause },
    #[error("invalid spec: {}", join_violations(.0))]
    InvalidSpec(Vec<Violation>),
}

fn join_violations(v: &[Violation]) -> String { v.iter().map(|x| x.to_string()).collect::<Vec<_>>().join("; ") }

impl ReconcileError {
    /// Transient remote failures and timeouts; everything else needs a config or code change.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Faulted { cause: FaultCause::TimedOut(_), .. } => true,
            ReconcileError::Faulted { cause: FaultCause::Remote(e), .. } => e.is_transient(),
            _ => false,
        }
    }
}

impl From<SchemaError> for ReconcileError {
    fn from(e: SchemaError) -> Self {
        match e {
            SchemaError::UnknownAttribute { kind, attribute } => ReconcileError::UnknownAttribute { kind, attribute },
            other => ReconcileError::InvalidSpec(vec![Violation::new("kind", other.to_string())]),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Upper bound for every single remote call.
    pub call_timeout: Duration,
    /// Cycles in flight at once in [`reconcile_batch`].
    pub batch_concurrency: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self { Self { call_timeout: Duration::from_millis(30_000), batch_concurrency: 4 } }
}

impl ReconcilerConfig {
    /// `TETHER_CALL_TIMEOUT_MS` and `TETHER_BATCH_CONCURRENCY`, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            call_timeout: Duration::from_millis(env_or("TETHER_CALL_TIMEOUT_MS", d.call_timeout.as_millis() as u64)),
            batch_concurrency: env_or("TETHER_BATCH_CONCURRENCY", d.batch_concurrency).max(1),
        }
    }
}

/// Await a remote call under `limit`.
pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, FaultCause>
where
    F: Future<Output = RemoteResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(r) => r.map_err(FaultCause::Remote),
        Err(_) => Err(FaultCause::TimedOut(limit)),
    }
}

/// One independent cycle for [`reconcile_batch`].
#[derive(Clone)]
pub struct BatchItem {
    pub reconciler: Reconciler,
    pub desired: ResourceSpec,
    pub prior: Option<CanonicalState>,
}

/// Run independent cycles with at most `concurrency` in flight. Results keep input order.
pub async fn reconcile_batch(items: Vec<BatchItem>, concurrency: usize) -> Vec<Result<ReconciliationResult, ReconcileError>> {
    let mut out: Vec<(usize, Result<ReconciliationResult, ReconcileError>)> = futures::stream::iter(items.into_iter().enumerate())
        .map(|(i, item)| async move { (i, item.reconciler.reconcile(&item.desired, item.prior.as_ref()).await) })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    out.sort_by_key(|(i, _)| *i);
    out.into_iter().map(|(_, r)| r).collect()
}
