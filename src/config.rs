//! Release configuration types.
//!
//! A `ReleaseConfig` is the JSON document carried in the
//! `release.openshift.io/config` annotation of an image stream that wants
//! release verification. It declares the gating verification slots and the
//! informational test slots, each naming a prow job and a retry policy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What an image stream provides.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Images in the stream are inputs used to build release payloads.
    #[default]
    #[serde(alias = "")]
    Integration,
    /// Tags are already release payloads, promoted from elsewhere.
    Stable,
}

/// Policy for choosing the release an upgrade job starts from.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum UpgradePolicy {
    /// The latest accepted tag from the current stream.
    Previous,
    /// The latest accepted tag of the previous minor version line.
    PreviousMinor,
    /// The latest accepted tag of the current minor version line.
    PreviousPatch,
    /// Every accepted tag of the current minor line down to (and
    /// including) the most recent rally point.
    RallyPoint,
    /// Any value this controller does not understand. Decode-only;
    /// encountering it is a terminal misconfiguration.
    #[serde(other)]
    Unknown,
}

/// Policy mapping prior attempt outcomes to whether another attempt runs.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Run every attempt up to the retry limit.
    TillMaxRetries,
    /// Stop at the first success, or at the retry limit.
    #[default]
    FirstSuccess,
    /// Stop at the first failure, or at the retry limit.
    FirstFailure,
    /// Any value this controller does not understand. Decode-only;
    /// encountering it is a terminal misconfiguration.
    #[serde(other)]
    Unknown,
}

/// Names the prow job that runs a verification slot.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct JobReference {
    /// Name of the prow job to run.
    pub name: String,
}

/// A task that must complete before a release is marked Accepted.
///
/// When a non-optional verification fails with retries exhausted the
/// release will be rejected.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReleaseVerification {
    /// Prevents this verification from being considered at all.
    pub disabled: bool,
    /// Optional verifications run, but failures do not reject the release.
    pub optional: bool,
    /// True if this verification exercises an upgrade into the release.
    pub upgrade: bool,
    /// Overrides the default upgrade source. The default for stable
    /// streams is `PreviousPatch` and `Previous` for everything else.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_from: Option<UpgradePolicy>,
    /// The prow job to run. A slot without one is verified manually.
    #[serde(rename = "prowJob", skip_serializing_if = "Option::is_none")]
    pub prow_job: Option<JobReference>,
    /// Maximum retry attempts. Zero means one attempt, no retry on fail.
    pub max_retries: u32,
}

/// An informational test run against a release tag.
///
/// Shared by the additional-tests and candidate-tests families. Unlike
/// gating verifications, each slot records every attempt and applies a
/// retry strategy across them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReleaseTest {
    /// The underlying verification definition.
    #[serde(flatten)]
    pub verification: ReleaseVerification,
    /// Tag the upgrade should run from. Ignored unless `upgrade` is true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_tag: Option<String>,
    /// Pull spec the upgrade should run from. Ignored unless `upgrade` is
    /// true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_ref: Option<String>,
    /// How prior attempt outcomes decide whether another attempt runs.
    pub retry_strategy: RetryStrategy,
}

/// Release configuration parsed off a source image stream.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReleaseConfig {
    /// Associates release tags back to the input stream. Required.
    pub name: String,
    /// Markdown description shown on status pages.
    pub message: String,
    /// Visually de-emphasize this stream on status pages.
    pub hide: bool,
    /// What this image stream provides.
    #[serde(rename = "as")]
    pub mode: ReleaseMode,
    /// Image stream where release tags are created in Integration mode.
    pub to: String,
    /// Prefix applied to the release mirror image stream.
    pub mirror_prefix: String,
    /// Gating verification slots, keyed by short name.
    pub verify: BTreeMap<String, ReleaseVerification>,
    /// Informational tests run on candidate tags, keyed by short name.
    pub additional_tests: BTreeMap<String, ReleaseTest>,
    /// Tests run on kept terminal tags, keyed by short name.
    pub candidate_tests: BTreeMap<String, ReleaseTest>,
}
