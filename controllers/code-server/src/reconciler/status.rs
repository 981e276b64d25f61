//! Status computation.
//!
//! Pure functions: given the stored status and what the reconcile observed,
//! produce the next status. Timestamps only move when a condition actually
//! transitions, so an unchanged world yields an identical status and no write.

use crate::request::ProbeSignal;
use chrono::{DateTime, Utc};
use crds::{condition_types, CodeServerStatus, Condition, ConditionStatus, Phase};

/// What converging the sub-resources found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    pub workload_ready: bool,
    pub probe_endpoint: Option<String>,
    pub url: Option<String>,
}

/// Phase for a resource whose spec passed validation.
pub fn next_phase(previous: Phase, probe_failure_count: u32, max_probe_retry: u32, workload_ready: bool) -> Phase {
    if probe_failure_count >= max_probe_retry {
        return Phase::Inactive;
    }
    if workload_ready {
        return Phase::Active;
    }
    match previous {
        Phase::Active | Phase::Degraded | Phase::Inactive => Phase::Degraded,
        _ => Phase::Provisioning,
    }
}

/// Probe count and time to act on.
///
/// A signal older than the last recorded probe is stale (e.g. a delayed retry
/// of a threshold request after a recovery was already applied) and is ignored.
pub fn effective_probe(current: &CodeServerStatus, signal: Option<ProbeSignal>) -> (u32, Option<DateTime<Utc>>) {
    match signal {
        Some(signal) if current.last_probe_time.is_none_or(|last| signal.probed_at >= last) => {
            (signal.failure_count, Some(signal.probed_at))
        }
        _ => (current.probe_failure_count, current.last_probe_time),
    }
}

/// Upsert a condition; `last_transition_time` changes only with `status`.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: Option<String>,
    now: DateTime<Utc>,
) {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = now;
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message;
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message,
            last_transition_time: now,
        }),
    }
}

pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Status after a successful convergence.
pub fn next_status(
    current: &CodeServerStatus,
    generation: Option<i64>,
    observation: &Observation,
    signal: Option<ProbeSignal>,
    max_probe_retry: u32,
    now: DateTime<Utc>,
) -> CodeServerStatus {
    let (probe_failure_count, last_probe_time) = effective_probe(current, signal);
    let phase = next_phase(current.phase, probe_failure_count, max_probe_retry, observation.workload_ready);

    let mut conditions = current.conditions.clone();
    set_condition(&mut conditions, condition_types::SPEC_VALID, ConditionStatus::True, "Valid", None, now);

    let (ready, reason) = match phase {
        Phase::Active => (ConditionStatus::True, "WorkloadReady"),
        Phase::Inactive => (ConditionStatus::False, "ProbeFailureThresholdReached"),
        Phase::Degraded => (ConditionStatus::False, "WorkloadNotReady"),
        _ => (ConditionStatus::False, "Provisioning"),
    };
    set_condition(&mut conditions, condition_types::READY, ready, reason, None, now);

    if last_probe_time.is_some() {
        let (healthy, reason, message) = if probe_failure_count == 0 {
            (ConditionStatus::True, "ProbeSucceeded", None)
        } else if probe_failure_count >= max_probe_retry {
            (
                ConditionStatus::False,
                "ProbeFailureThresholdReached",
                Some(format!("{} consecutive probe failures", probe_failure_count)),
            )
        } else {
            (
                ConditionStatus::False,
                "ProbeFailing",
                Some(format!("{} consecutive probe failures", probe_failure_count)),
            )
        };
        set_condition(&mut conditions, condition_types::PROBE_HEALTHY, healthy, reason, message, now);
    }
    remove_condition(&mut conditions, condition_types::RECONCILE_ERROR);

    CodeServerStatus {
        phase,
        observed_generation: generation,
        probe_failure_count,
        last_probe_time,
        probe_endpoint: observation.probe_endpoint.clone(),
        url: observation.url.clone(),
        reconcile_failures: 0,
        conditions,
    }
}

/// Status for a spec that failed validation.
pub fn failed_status(
    current: &CodeServerStatus,
    generation: Option<i64>,
    message: &str,
    now: DateTime<Utc>,
) -> CodeServerStatus {
    let mut status = current.clone();
    status.phase = Phase::Failed;
    status.observed_generation = generation;
    status.reconcile_failures = 0;
    set_condition(
        &mut status.conditions,
        condition_types::SPEC_VALID,
        ConditionStatus::False,
        "ValidationFailed",
        Some(message.to_string()),
        now,
    );
    set_condition(
        &mut status.conditions,
        condition_types::READY,
        ConditionStatus::False,
        "SpecInvalid",
        None,
        now,
    );
    remove_condition(&mut status.conditions, condition_types::RECONCILE_ERROR);
    status
}

/// Status while the finalizer runs.
pub fn terminating_status(current: &CodeServerStatus, now: DateTime<Utc>) -> CodeServerStatus {
    let mut status = current.clone();
    status.phase = Phase::Terminating;
    set_condition(
        &mut status.conditions,
        condition_types::READY,
        ConditionStatus::False,
        "Terminating",
        None,
        now,
    );
    status
}

/// Status after automatic retries ran out; the phase is left untouched.
pub fn exhausted_status(
    current: &CodeServerStatus,
    attempts: u32,
    message: &str,
    now: DateTime<Utc>,
) -> CodeServerStatus {
    let mut status = current.clone();
    status.reconcile_failures = attempts;
    set_condition(
        &mut status.conditions,
        condition_types::RECONCILE_ERROR,
        ConditionStatus::True,
        "RetriesExhausted",
        Some(format!("{} consecutive failures, last: {}", attempts, message)),
        now,
    );
    status
}
