//! Planning: decide create / replace / update / no-op without touching the remote.

use std::fmt;

use serde::{Deserialize, Serialize};
use tether_core::{values_equal, AttrValue, CanonicalState, ResourceSpec, WirePayload};
use tether_schema::{KindSchema, PolicyKind};

use crate::ReconcileError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum PlanAction {
    Create,
    /// Immutable attributes that changed.
    Replace { reasons: Vec<String> },
    /// Exactly the attributes sent to `update`.
    Update { delta: WirePayload },
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanAction::Create => f.write_str("create"),
            PlanAction::Replace { reasons } => write!(f, "replace ({})", reasons.join(", ")),
            PlanAction::Update { delta } => {
                let keys: Vec<&str> = delta.keys().map(|k| k.as_str()).collect();
                write!(f, "update ({})", keys.join(", "))
            }
            PlanAction::NoOp => f.write_str("no-op"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub kind: String,
    #[serde(flatten)]
    pub action: PlanAction,
}

/// Create payload: every present desired attribute, server-authoritative ones
/// included, local control flags left out.
pub fn create_payload(kind: &KindSchema, desired: &ResourceSpec) -> WirePayload {
    desired
        .iter()
        .filter(|(k, _)| !kind.is_local(k))
        .filter_map(|(k, v)| v.as_present().map(|j| (k.to_string(), j.clone())))
        .collect()
}

/// Validate `desired` and partition its delta against `prior`.
pub fn plan(kind: &KindSchema, desired: &ResourceSpec, prior: Option<&CanonicalState>) -> Result<Plan, ReconcileError> {
    if kind.is_read_only() {
        return Err(ReconcileError::NotSupported { kind: kind.name().to_string(), operation: "reconcile".into() });
    }
    kind.check_attributes(desired)?;
    let violations = kind.validate(desired);
    if !violations.is_empty() {
        return Err(ReconcileError::InvalidSpec(violations));
    }
    let action = match prior {
        None => PlanAction::Create,
        Some(prior) => diff(kind, desired, &prior.attributes)?,
    };
    Ok(Plan { kind: kind.name().to_string(), action })
}

fn diff(kind: &KindSchema, desired: &ResourceSpec, prior: &ResourceSpec) -> Result<PlanAction, ReconcileError> {
    let mut reasons = Vec::new();
    let mut delta = WirePayload::new();
    for (attr, policy) in kind.policy().iter() {
        let want = desired.get(attr);
        match policy {
            PolicyKind::Immutable => {
                let changed = match (want, prior.get(attr)) {
                    // Cannot be compared until the value is known.
                    (AttrValue::Unknown, _) => false,
                    (AttrValue::Present(a), AttrValue::Present(b)) => !values_equal(a, b),
                    (AttrValue::Absent, AttrValue::Absent) => false,
                    _ => true,
                };
                if changed {
                    reasons.push(attr.to_string());
                }
            }
            // Local flags only steer post-apply actions.
            PolicyKind::WriteOnly if kind.is_local(attr) => {}
            PolicyKind::Mutable | PolicyKind::WriteOnly => {
                if let AttrValue::Present(v) = want {
                    let same = prior.present(attr).map(|p| values_equal(v, p)).unwrap_or(false);
                    if !same {
                        delta.insert(attr.to_string(), v.clone());
                    }
                }
            }
            PolicyKind::ServerAuthoritative => {}
        }
    }
    if !reasons.is_empty() {
        return Ok(PlanAction::Replace { reasons });
    }
    if delta.is_empty() {
        return Ok(PlanAction::NoOp);
    }
    if !kind.supports_update() {
        return Err(ReconcileError::NotSupported { kind: kind.name().to_string(), operation: "update".into() });
    }
    Ok(PlanAction::Update { delta })
}
