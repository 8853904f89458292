//! Tether remote: the control-plane contract the reconciler drives, plus an
//! in-memory [`sandbox::Sandbox`] implementation used by tests and the CLI.
//!
//! Implementations must be safe to call concurrently; the reconciler shares one
//! handle across every in-flight cycle.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tether_core::{CompositeIdentity, RemoteObservation, WirePayload};

pub mod sandbox;

pub use sandbox::Sandbox;

/// Errors reported by a control plane. Transport-agnostic.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum RemoteError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rejected {attribute}: {reason}")]
    ValidationRejected { attribute: String, reason: String },
    #[error("transient: {0}")]
    Transient(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl RemoteError {
    /// Worth retrying the whole cycle later.
    pub fn is_transient(&self) -> bool { matches!(self, RemoteError::Transient(_)) }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Remote call names, used for logs, metrics and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Lookup,
    CreateOrGet,
    Update,
    Delete,
    Invoke,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Lookup => "lookup",
            Operation::CreateOrGet => "create_or_get",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Invoke => "invoke",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// What a delete call removes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteTarget {
    /// Exactly one instance.
    Identity(CompositeIdentity),
    /// Every instance whose `attribute` equals `value`.
    Parent { attribute: String, value: Json },
}

/// Remote control plane, one method per primitive the reconciler needs.
///
/// `read` returns `Ok(None)` when the instance no longer exists. `create_or_get`
/// either deduplicates on the natural key (returning the existing instance) or
/// fails with [`RemoteError::Conflict`], depending on the kind.
#[allow(unused_variables)]
#[async_trait::async_trait]
pub trait ControlPlane: Send + Sync {
    async fn read(&self, kind: &str, identity: &CompositeIdentity) -> RemoteResult<Option<RemoteObservation>>;

    async fn lookup(&self, kind: &str, natural_key: &WirePayload) -> RemoteResult<Option<(CompositeIdentity, RemoteObservation)>> {
        Err(RemoteError::NotSupported(format!("lookup for {}", kind)))
    }

    async fn create_or_get(&self, kind: &str, payload: &WirePayload) -> RemoteResult<(CompositeIdentity, RemoteObservation)>;

    async fn update(&self, kind: &str, identity: &CompositeIdentity, delta: &WirePayload) -> RemoteResult<RemoteObservation> {
        Err(RemoteError::NotSupported(format!("update for {}", kind)))
    }

    async fn delete(&self, kind: &str, target: &DeleteTarget) -> RemoteResult<()>;

    async fn invoke(&self, kind: &str, identity: &CompositeIdentity, action: &str) -> RemoteResult<()> {
        Err(RemoteError::NotSupported(format!("{} for {}", action, kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct ReadOnly;

    #[async_trait::async_trait]
    impl ControlPlane for ReadOnly {
        async fn read(&self, _kind: &str, _identity: &CompositeIdentity) -> RemoteResult<Option<RemoteObservation>> { Ok(None) }
        async fn create_or_get(&self, _kind: &str, _payload: &WirePayload) -> RemoteResult<(CompositeIdentity, RemoteObservation)> {
            Err(RemoteError::Unauthorized)
        }
        async fn delete(&self, _kind: &str, _target: &DeleteTarget) -> RemoteResult<()> { Ok(()) }
    }

    #[tokio::test]
    async fn default_methods_report_not_supported() {
        let cp = ReadOnly;
        let id = CompositeIdentity::single("x");
        assert!(matches!(cp.update("k", &id, &WirePayload::new()).await, Err(RemoteError::NotSupported(_))));
        assert!(matches!(cp.invoke("k", &id, "redeploy").await, Err(RemoteError::NotSupported(m)) if m.contains("redeploy")));
        assert!(matches!(cp.lookup("k", &WirePayload::new()).await, Err(RemoteError::NotSupported(_))));
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(RemoteError::Transient("503".into()).is_transient());
        assert!(!RemoteError::Conflict("dup".into()).is_transient());
    }

    #[test]
    fn delete_target_serializes_tagged() {
        let t = DeleteTarget::Parent { attribute: "environment_id".into(), value: json!("e1") };
        let v = serde_json::to_value(&t).unwrap();
        assert_eq!(v, json!({"parent": {"attribute": "environment_id", "value": "e1"}}));
    }
}
