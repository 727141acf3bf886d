//! Persisted verification status and its evaluators.
//!
//! Status lives only in JSON-encoded annotations on the release tag, one
//! annotation per job family. The codec is deliberately tolerant: a value
//! that does not parse is logged and treated as absent, because losing a
//! round of status is preferable to wedging the release.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config::{ReleaseTest, ReleaseVerification, RetryStrategy, UpgradePolicy};
use crate::release::parse_semver_tolerant;
use crate::Error;

/// Description recorded when a slot cannot run and is marked succeeded.
pub const NO_INPUT_MESSAGE: &str = "Job was not defined or does not have any inputs";

/// Tri-state outcome of a verification job.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum JobState {
    /// The job has not finished.
    #[default]
    Pending,
    /// The job finished successfully. Terminal.
    Succeeded,
    /// The job finished unsuccessfully. Terminal.
    Failed,
    /// Any persisted value this controller does not understand.
    /// Decode-only; the slot is skipped for the reconcile.
    #[serde(other)]
    Unknown,
}

impl JobState {
    /// True for states that will never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Observed status of one job attempt.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    /// Current state of the attempt.
    pub state: JobState,
    /// Link to the job's logs, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// When the attempt reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    /// Human-readable detail, set for synthetic results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobStatus {
    /// A synthetic success recorded when a slot has nothing to run.
    pub fn synthetic_success(now: DateTime<Utc>) -> Self {
        Self {
            state: JobState::Succeeded,
            url: None,
            completion_time: Some(now),
            message: Some(NO_INPUT_MESSAGE.to_string()),
        }
    }
}

/// Persisted state of a single-attempt gating slot.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationStatus {
    /// Status of the current attempt.
    #[serde(flatten)]
    pub job: JobStatus,
    /// Prior failed attempts. `retries = k, state = Failed` means the
    /// `k+1`-th attempt failed.
    #[serde(default)]
    pub retries: u32,
    /// When the slot last changed state; anchors the retry backoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_time: Option<DateTime<Utc>>,
}

/// Persisted state of a multi-attempt candidate-test slot.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CandidateTestStatus {
    /// Attempt `i` of the slot is at position `i`.
    #[serde(default)]
    pub status: Vec<JobStatus>,
    /// When the attempt list last changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_time: Option<DateTime<Utc>>,
}

/// Gating slot statuses, keyed by slot name.
pub type VerificationStatusMap = BTreeMap<String, VerificationStatus>;
/// Additional-test attempt lists, keyed by slot name.
pub type TestStatusMap = BTreeMap<String, Vec<JobStatus>>;
/// Candidate-test statuses, keyed by (possibly expanded) slot name.
pub type CandidateStatusMap = BTreeMap<String, CandidateTestStatus>;

/// Decode a status annotation, tolerating malformed input.
///
/// An absent or empty annotation and a decode failure all produce the
/// default (empty) map; failures are logged so the data loss is visible.
pub fn decode_status_annotation<T>(tag_name: &str, raw: Option<&str>) -> T
where
    T: DeserializeOwned + Default,
{
    let Some(data) = raw else {
        return T::default();
    };
    if data.is_empty() {
        return T::default();
    }
    match serde_json::from_str(data) {
        Ok(value) => value,
        Err(err) => {
            error!(
                tag = %tag_name,
                error = %err,
                "release tag has an invalid verification status, ignoring"
            );
            T::default()
        }
    }
}

/// Encode a status map as canonical JSON for the annotation.
pub fn encode_status_annotation<T: Serialize>(value: &T) -> Result<String, Error> {
    Ok(serde_json::to_string(value)?)
}

/// Slot names currently failed, and whether there are any.
pub fn failures(status: &VerificationStatusMap) -> (Vec<String>, bool) {
    let names: Vec<String> = status
        .iter()
        .filter(|(_, s)| s.job.state == JobState::Failed)
        .map(|(name, _)| name.clone())
        .collect();
    let any = !names.is_empty();
    (names, any)
}

/// Enabled gating slots that have not reached a terminal state.
pub fn incomplete(
    status: &VerificationStatusMap,
    required: &BTreeMap<String, ReleaseVerification>,
) -> (Vec<String>, bool) {
    let names: Vec<String> = required
        .iter()
        .filter(|(_, definition)| !definition.disabled)
        .filter(|(name, _)| {
            status
                .get(*name)
                .map(|s| !s.job.state.is_terminal())
                .unwrap_or(true)
        })
        .map(|(name, _)| name.clone())
        .collect();
    let any = !names.is_empty();
    (names, any)
}

/// Gating slots still owed an attempt, plus whether any non-optional slot
/// has failed with its retries exhausted (a blocking failure).
pub fn verification_jobs_with_retries(
    required: &BTreeMap<String, ReleaseVerification>,
    status: &VerificationStatusMap,
) -> (Vec<String>, bool) {
    let mut names = Vec::new();
    let mut blocking_failure = false;
    for (name, definition) in required {
        if definition.disabled {
            continue;
        }
        let Some(s) = status.get(name) else {
            names.push(name.clone());
            continue;
        };
        if s.job.state != JobState::Failed {
            continue;
        }
        if s.retries >= definition.max_retries {
            if !definition.optional {
                blocking_failure = true;
            }
            continue;
        }
        names.push(name.clone());
    }
    (names, blocking_failure)
}

/// True when every named slot is either absent from the config or optional.
pub fn all_optional(all: &BTreeMap<String, ReleaseVerification>, names: &[String]) -> bool {
    names
        .iter()
        .all(|name| all.get(name).map(|v| v.optional).unwrap_or(true))
}

/// Enabled test slots whose attempts are not yet conclusive.
///
/// A slot is complete when its strategy short-circuited (any success under
/// `FirstSuccess`, any failure under `FirstFailure`) or when every attempt
/// up to the retry limit is terminal. Rally-point slots aggregate over all
/// expanded `<slot>-<semver>` entries.
pub fn incomplete_tests(
    status: &CandidateStatusMap,
    required: &BTreeMap<String, ReleaseTest>,
) -> Vec<String> {
    let mut names = Vec::new();
    for (name, definition) in required {
        if definition.verification.disabled {
            continue;
        }

        let mut results: Vec<&CandidateTestStatus> = Vec::new();
        if let Some(test) = status.get(name) {
            results.push(test);
        } else if definition.verification.upgrade
            && definition.verification.upgrade_from == Some(UpgradePolicy::RallyPoint)
        {
            let prefix = format!("{name}-");
            for (test_name, test) in status {
                let Some(suffix) = test_name.strip_prefix(&prefix) else {
                    continue;
                };
                if parse_semver_tolerant(suffix).is_none() {
                    continue;
                }
                results.push(test);
            }
        }
        if results.is_empty() {
            names.push(name.clone());
            continue;
        }

        let max_retries = definition.verification.max_retries;
        for result in results {
            let mut completed: u32 = 0;
            for s in &result.status {
                if !s.state.is_terminal() {
                    continue;
                }
                if s.state == JobState::Succeeded
                    && definition.retry_strategy == RetryStrategy::FirstSuccess
                {
                    completed = max_retries + 1;
                    break;
                }
                if s.state == JobState::Failed
                    && definition.retry_strategy == RetryStrategy::FirstFailure
                {
                    completed = max_retries + 1;
                    break;
                }
                completed += 1;
            }
            if completed >= max_retries + 1 {
                continue;
            }
            names.push(name.clone());
            break;
        }
    }
    names
}

/// Aggregate state of a test slot across its recorded attempts.
///
/// Pending while attempts remain to run, succeeded on a `FirstSuccess`
/// short-circuit or when at least half the attempts succeeded, otherwise
/// failed.
pub fn aggregate_test_state(test: &ReleaseTest, attempts: &[JobStatus]) -> JobState {
    if attempts.is_empty() {
        return JobState::Pending;
    }
    if test.retry_strategy == RetryStrategy::TillMaxRetries
        && (attempts.len() as u32) < test.verification.max_retries + 1
    {
        return JobState::Pending;
    }
    let mut success: usize = 0;
    for s in attempts {
        match s.state {
            JobState::Pending => return JobState::Pending,
            JobState::Succeeded => {
                if test.retry_strategy == RetryStrategy::FirstSuccess {
                    return JobState::Succeeded;
                }
                success += 1;
            }
            JobState::Failed | JobState::Unknown => {}
        }
    }
    if success > 0 && success * 2 >= attempts.len() {
        JobState::Succeeded
    } else {
        JobState::Failed
    }
}
