//! Upgrade history graph, stable-release index, and the upgrade-source
//! resolver.
//!
//! Upgrade verification jobs need a release to upgrade *from*. The
//! resolver maps `(release, tag, policy)` to zero or more sources by
//! consulting the release's own tag list or the stable-release index. The
//! upgrade graph accumulates observed upgrade outcomes and drives the
//! dynamic upgrade-test fan-out.

use std::collections::HashMap;
use std::sync::RwLock;

use semver::Version;

use crate::config::UpgradePolicy;
use crate::release::{
    latest_with_major_minor, parse_semver_tolerant, semantic_tags_in_phase, Release, ReleasePhase,
    ReleaseTag,
};
use crate::status::JobState;
use crate::Error;

/// Outcome of one observed upgrade attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct UpgradeResult {
    /// Terminal state of the upgrade job.
    pub state: JobState,
    /// Link to the job's logs, when known.
    pub url: Option<String>,
}

/// Accumulated history of upgrades between two tags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpgradeHistory {
    /// Tag upgraded from.
    pub from: String,
    /// Tag upgraded to.
    pub to: String,
    /// Attempts that succeeded.
    pub success: u32,
    /// Attempts that failed.
    pub failure: u32,
    /// All recorded attempts, including pending ones.
    pub total: u32,
}

/// Thread-safe accumulator of upgrade outcomes between release tags.
///
/// Readers only see snapshot copies; a reconcile works against the state
/// of the graph at the moment it asked.
#[derive(Debug, Default)]
pub struct UpgradeGraph {
    inner: RwLock<HashMap<(String, String), UpgradeHistory>>,
}

impl UpgradeGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one upgrade attempt from `from` to `to`.
    pub fn add(&self, from: &str, to: &str, result: UpgradeResult) {
        let mut inner = self.inner.write().expect("upgrade graph lock poisoned");
        let entry = inner
            .entry((from.to_string(), to.to_string()))
            .or_insert_with(|| UpgradeHistory {
                from: from.to_string(),
                to: to.to_string(),
                ..Default::default()
            });
        entry.total += 1;
        match result.state {
            JobState::Succeeded => entry.success += 1,
            JobState::Failed => entry.failure += 1,
            JobState::Pending | JobState::Unknown => {}
        }
    }

    /// Snapshot of all recorded upgrades into `to`, sorted by source tag.
    pub fn upgrades_to(&self, to: &str) -> Vec<UpgradeHistory> {
        let inner = self.inner.read().expect("upgrade graph lock poisoned");
        let mut histories: Vec<UpgradeHistory> = inner
            .values()
            .filter(|h| h.to == to)
            .cloned()
            .collect();
        histories.sort_by(|a, b| a.from.cmp(&b.from));
        histories
    }

    /// Snapshot of all recorded upgrades out of `from`, sorted by target.
    pub fn upgrades_from(&self, from: &str) -> Vec<UpgradeHistory> {
        let inner = self.inner.read().expect("upgrade graph lock poisoned");
        let mut histories: Vec<UpgradeHistory> = inner
            .values()
            .filter(|h| h.from == from)
            .cloned()
            .collect();
        histories.sort_by(|a, b| a.to.cmp(&b.to));
        histories
    }
}

/// One stable release stream with its parsed version.
#[derive(Clone, Debug)]
pub struct StableRelease {
    /// Version parsed from the stream name.
    pub version: Version,
    /// The parsed release.
    pub release: Release,
}

/// Stable release streams, newest first.
#[derive(Clone, Debug, Default)]
pub struct StableReleases {
    /// Member releases, sorted newest version first.
    pub releases: Vec<StableRelease>,
}

impl StableReleases {
    /// Build an index from releases, sorting newest first.
    pub fn new(mut releases: Vec<StableRelease>) -> Self {
        releases.sort_by(|a, b| b.version.cmp(&a.version));
        Self { releases }
    }
}

/// A release an upgrade job can start from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeSource {
    /// Tag name of the source release.
    pub tag: String,
    /// Pull spec of the source release payload.
    pub pull_spec: String,
}

/// True for stable tags whose patch version is divisible by 10. Rally
/// points terminate the `RallyPoint` fan-out walk.
pub fn is_rally_point(tag: &ReleaseTag) -> bool {
    match parse_semver_tolerant(&tag.name) {
        Some(version) => version.patch % 10 == 0,
        None => false,
    }
}

/// Resolve the releases a tag should be upgrade-tested from.
///
/// An empty result means no applicable source exists and the slot is a
/// no-op; an `Unknown` policy is a terminal misconfiguration.
pub fn upgrade_source(
    release: &Release,
    tag: &ReleaseTag,
    verify_name: &str,
    upgrade_from: Option<UpgradePolicy>,
    stable: &StableReleases,
) -> Result<Vec<UpgradeSource>, Error> {
    let default = if release.is_stable() {
        UpgradePolicy::PreviousPatch
    } else {
        UpgradePolicy::Previous
    };
    let policy = upgrade_from.unwrap_or(default);

    match policy {
        UpgradePolicy::Previous => {
            let tags = release.tags_in_phase(ReleasePhase::Accepted);
            Ok(tags
                .first()
                .map(|t| {
                    vec![UpgradeSource {
                        tag: t.name.clone(),
                        pull_spec: release.target.pull_spec(&t.name),
                    }]
                })
                .unwrap_or_default())
        }
        UpgradePolicy::PreviousMinor => {
            let Some(mut version) = parse_semver_tolerant(&tag.name) else {
                return Ok(Vec::new());
            };
            if version.minor == 0 {
                return Ok(Vec::new());
            }
            version.minor -= 1;
            Ok(newest_in_line(stable, &version, 1))
        }
        UpgradePolicy::PreviousPatch => {
            let Some(version) = parse_semver_tolerant(&tag.name) else {
                return Ok(Vec::new());
            };
            Ok(newest_in_line(stable, &version, 1))
        }
        UpgradePolicy::RallyPoint => {
            let Some(version) = parse_semver_tolerant(&tag.name) else {
                return Ok(Vec::new());
            };
            for stable_release in &stable.releases {
                let versions =
                    semantic_tags_in_phase(&stable_release.release, ReleasePhase::Accepted);
                let matched = latest_with_major_minor(&versions, &version, 10);
                if matched.is_empty() {
                    continue;
                }
                let mut sources = Vec::new();
                for (_, t) in matched {
                    sources.push(UpgradeSource {
                        tag: t.name.clone(),
                        pull_spec: stable_release.release.target.pull_spec(&t.name),
                    });
                    if is_rally_point(t) {
                        break;
                    }
                }
                return Ok(sources);
            }
            Ok(Vec::new())
        }
        UpgradePolicy::Unknown => Err(Error::config(format!(
            "release {} has verify type {} which defines an invalid upgradeFrom",
            release.config.name, verify_name
        ))),
    }
}

/// Newest accepted tags in `want`'s major.minor line across the stable
/// index, at most `limit` of them, from the first stream that has any.
fn newest_in_line(stable: &StableReleases, want: &Version, limit: usize) -> Vec<UpgradeSource> {
    for stable_release in &stable.releases {
        let versions = semantic_tags_in_phase(&stable_release.release, ReleasePhase::Accepted);
        let matched = latest_with_major_minor(&versions, want, limit);
        if matched.is_empty() {
            continue;
        }
        return matched
            .into_iter()
            .map(|(_, t)| UpgradeSource {
                tag: t.name.clone(),
                pull_spec: stable_release.release.target.pull_spec(&t.name),
            })
            .collect();
    }
    Vec::new()
}
