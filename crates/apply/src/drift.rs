//! Drift detection: desired spec vs the latest remote observation.

use tether_core::{values_equal, RemoteObservation, ResourceSpec};
use tether_schema::FieldPolicyTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftResult {
    Unchanged,
    /// Attributes in declaration order.
    Drifted(Vec<String>),
    Vanished,
}

impl DriftResult {
    pub fn attributes(&self) -> &[String] {
        match self { DriftResult::Drifted(v) => v, _ => &[] }
    }
}

/// Compare every server-authoritative or mutable attribute whose desired value
/// is present. Write-only attributes are never read back and immutable ones are
/// checked when the instance is resolved, so neither is compared here.
pub fn detect(policy: &FieldPolicyTable, desired: &ResourceSpec, observed: Option<&RemoteObservation>) -> DriftResult {
    let Some(obs) = observed else { return DriftResult::Vanished };
    let drifted: Vec<String> = policy
        .iter()
        .filter(|(_, p)| p.is_observed())
        .filter_map(|(attr, _)| {
            let want = desired.present(attr)?;
            match obs.get(attr) {
                Some(have) if values_equal(want, have) => None,
                _ => Some(attr.to_string()),
            }
        })
        .collect();
    if drifted.is_empty() { DriftResult::Unchanged } else { DriftResult::Drifted(drifted) }
}
