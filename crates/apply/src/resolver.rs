//! Create-or-get: idempotent creation on top of remotes that either deduplicate
//! on the natural key themselves or reject duplicates with `Conflict`.

use metrics::counter;
use tether_core::{values_equal, CompositeIdentity, RemoteObservation, ResourceSpec};
use tether_remote::{ControlPlane, Operation, RemoteError};
use tether_schema::{CreateSemantics, KindSchema, PolicyKind};
use tracing::{debug, info};

use crate::{bounded, plan::create_payload, FaultCause, Phase, ReconcileError};

pub struct Resolver<'a> {
    kind: &'a KindSchema,
    remote: &'a dyn ControlPlane,
    call_timeout: std::time::Duration,
}

fn fault(operation: Operation, cause: FaultCause) -> ReconcileError {
    ReconcileError::Faulted { phase: Phase::Applying, operation, cause }
}

impl<'a> Resolver<'a> {
    pub fn new(kind: &'a KindSchema, remote: &'a dyn ControlPlane, call_timeout: std::time::Duration) -> Self {
        Self { kind, remote, call_timeout }
    }

    /// Resolve `desired` to exactly one remote instance, creating it when needed.
    pub async fn create_or_get(&self, desired: &ResourceSpec) -> Result<(CompositeIdentity, RemoteObservation), ReconcileError> {
        let name = self.kind.name();
        let key = self.kind.natural_key_of(desired).map_err(ReconcileError::InvalidSpec)?;
        let payload = create_payload(self.kind, desired);

        let (identity, obs) = match self.kind.create_semantics() {
            CreateSemantics::RemoteDeduplicates => bounded(self.call_timeout, self.remote.create_or_get(name, &payload))
                .await
                .map_err(|c| fault(Operation::CreateOrGet, c))?,
            CreateSemantics::LookupThenCreate => {
                let found = bounded(self.call_timeout, self.remote.lookup(name, &key)).await.map_err(|c| fault(Operation::Lookup, c))?;
                match found {
                    Some(hit) => {
                        debug!(kind = name, identity = %hit.0, "resolve: found by natural key");
                        hit
                    }
                    None => match bounded(self.call_timeout, self.remote.create_or_get(name, &payload)).await {
                        Ok(created) => created,
                        Err(FaultCause::Remote(RemoteError::Conflict(reason))) => {
                            // Lost a race with a concurrent creator; the winner must now be visible.
                            counter!("createorget_retry_total", 1u64);
                            info!(kind = name, %reason, "resolve: create conflicted, looking up again");
                            let again = bounded(self.call_timeout, self.remote.lookup(name, &key)).await.map_err(|c| fault(Operation::Lookup, c))?;
                            again.ok_or_else(|| fault(Operation::CreateOrGet, FaultCause::Remote(RemoteError::Conflict(reason))))?
                        }
                        Err(cause) => return Err(fault(Operation::CreateOrGet, cause)),
                    },
                }
            }
        };
        self.check_equivalent(desired, &obs)?;
        Ok((identity, obs))
    }

    /// Every immutable attribute the caller set and the remote reports must agree.
    fn check_equivalent(&self, desired: &ResourceSpec, obs: &RemoteObservation) -> Result<(), ReconcileError> {
        for attr in self.kind.policy().attributes_with(PolicyKind::Immutable) {
            if let (Some(want), Some(have)) = (desired.present(attr), obs.get(attr)) {
                if !values_equal(want, have) {
                    return Err(ReconcileError::ConflictUnresolvable {
                        kind: self.kind.name().to_string(),
                        attribute: attr.to_string(),
                        desired: want.clone(),
                        observed: have.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
