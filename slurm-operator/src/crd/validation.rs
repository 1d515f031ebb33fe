//! Spec validation for NodeSet and LoginSet.
//!
//! The checks mirror what an admission webhook would reject, so a bad
//! object surfaces as a reconcile error instead of undefined behaviour.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::nodeset::parse_percent;
use super::{LoginSetSpec, NodeSetSpec, PvcRetentionPolicyType, UpdateStrategyType};
use crate::error::{OperatorError, OperatorResult};

/// Validate a NodeSet spec, reporting every problem at once.
pub fn validate_nodeset(spec: &NodeSetSpec) -> OperatorResult<()> {
    let mut errors = Vec::new();

    if spec.controller_ref.name.is_empty() {
        errors.push("`spec.controllerRef.name` must be set".to_string());
    }

    if let Some(replicas) = spec.replicas {
        if replicas < 0 {
            errors.push(format!("`spec.replicas` must be >= 0. Got: {}", replicas));
        }
    }

    let strategy = &spec.update_strategy;
    if UpdateStrategyType::parse(&strategy.type_).is_none() {
        errors.push(format!(
            "`spec.updateStrategy.type` is not valid. Got: {}. Expected of: {}",
            strategy.type_,
            UpdateStrategyType::VALUES.join("; ")
        ));
    }

    match strategy
        .rolling_update
        .as_ref()
        .and_then(|ru| ru.max_unavailable.as_ref())
    {
        Some(IntOrString::Int(n)) if *n < 1 => {
            errors.push(format!(
                "`spec.updateStrategy.rollingUpdate.maxUnavailable` must be >= 1. Got: {}",
                n
            ));
        }
        Some(IntOrString::String(s)) if parse_percent(s).is_none() => {
            errors.push(format!(
                "`spec.updateStrategy.rollingUpdate.maxUnavailable` must be a percentage between 0% and 100%. Got: {}",
                s
            ));
        }
        _ => {}
    }

    let policy = &spec.persistent_volume_claim_retention_policy;
    for (field, value) in [
        ("whenDeleted", &policy.when_deleted),
        ("whenScaled", &policy.when_scaled),
    ] {
        if PvcRetentionPolicyType::parse(value).is_none() {
            errors.push(format!(
                "`spec.persistentVolumeClaimRetentionPolicy.{}` is not valid. Got: {}. Expected of: {}",
                field,
                value,
                PvcRetentionPolicyType::VALUES.join("; ")
            ));
        }
    }

    if spec.min_ready_seconds < 0 {
        errors.push(format!(
            "`spec.minReadySeconds` must be >= 0. Got: {}",
            spec.min_ready_seconds
        ));
    }

    into_result(errors)
}

/// Validate a LoginSet spec.
pub fn validate_loginset(spec: &LoginSetSpec) -> OperatorResult<()> {
    let mut errors = Vec::new();

    if spec.controller_ref.name.is_empty() {
        errors.push("`spec.controllerRef.name` must be set".to_string());
    }
    if spec.replicas < 0 {
        errors.push(format!("`spec.replicas` must be >= 0. Got: {}", spec.replicas));
    }
    if spec.sssd_conf_ref.name.is_empty() {
        errors.push("`spec.sssdConfRef.name` must be set".to_string());
    }

    into_result(errors)
}

fn into_result(errors: Vec<String>) -> OperatorResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(OperatorError::ValidationError(errors.join(", ")))
    }
}
