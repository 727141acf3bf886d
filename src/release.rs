//! Release streams, tags, and the annotations that carry their state.
//!
//! A release is an image stream whose tags are candidate payloads. All
//! controller state lives in annotations on the stream and its tags; this
//! module owns the annotation keys, the tag/stream models, and the
//! semantic-version ordering helpers the upgrade resolver relies on.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use semver::Version;
use tracing::warn;

use crate::config::{ReleaseConfig, ReleaseMode};
use crate::Error;

/// JSON-serialized [`ReleaseConfig`] on a source image stream.
pub const ANNOTATION_CONFIG: &str = "release.openshift.io/config";
/// Lifecycle phase of a release tag.
pub const ANNOTATION_PHASE: &str = "release.openshift.io/phase";
/// Name of the release stream a tag belongs to.
pub const ANNOTATION_NAME: &str = "release.openshift.io/name";
/// `<namespace>/<name>` of the image stream a tag was built from.
pub const ANNOTATION_SOURCE: &str = "release.openshift.io/source";
/// Marks a terminal tag that should be retained and candidate-tested.
pub const ANNOTATION_KEEP: &str = "release.openshift.io/keep";
/// RFC 3339 creation time of the tag.
pub const ANNOTATION_CREATION_TIMESTAMP: &str = "release.openshift.io/creationTimestamp";
/// JSON map of gating verification statuses.
pub const ANNOTATION_VERIFY: &str = "release.openshift.io/verify";
/// JSON map of additional-test attempt lists.
pub const ANNOTATION_ADDITIONAL_TESTS: &str = "release.openshift.io/additional-tests";
/// JSON map of candidate-test statuses.
pub const ANNOTATION_CANDIDATE_TESTS: &str = "release.openshift.io/candidate-tests";
/// Tag an upgrade job upgrades from.
pub const ANNOTATION_FROM_TAG: &str = "release.openshift.io/from-tag";
/// Tag a job runs against.
pub const ANNOTATION_TO_TAG: &str = "release.openshift.io/tag";
/// Release a stable payload was promoted from.
pub const ANNOTATION_FROM_RELEASE: &str = "release.openshift.io/from-release";
/// Release tag recorded on derived objects.
pub const ANNOTATION_RELEASE_TAG: &str = "release.openshift.io/releaseTag";
/// Marks an image stream that holds release tags.
pub const ANNOTATION_HAS_RELEASES: &str = "release.openshift.io/hasReleases";

/// Lifecycle phase of a release tag.
///
/// Pending → Ready → Accepted/Rejected, with Failed reachable from
/// Pending when the payload cannot be built. This controller only reads
/// the phase; another component performs the transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleasePhase {
    /// Waiting for a payload image to be created and pushed.
    Pending,
    /// A payload image could not be created. Terminal.
    Failed,
    /// Payload exists; verification may still be running.
    Ready,
    /// Passed its verification criteria. Terminal.
    Accepted,
    /// Failed one or more verification criteria. Terminal.
    Rejected,
}

impl ReleasePhase {
    /// Parse the phase annotation value. Unknown strings yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Pending" => Some(Self::Pending),
            "Failed" => Some(Self::Failed),
            "Ready" => Some(Self::Ready),
            "Accepted" => Some(Self::Accepted),
            "Rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// The annotation string for this phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Failed => "Failed",
            Self::Ready => "Ready",
            Self::Accepted => "Accepted",
            Self::Rejected => "Rejected",
        }
    }
}

impl std::fmt::Display for ReleasePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work-queue key identifying a source image stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    /// Namespace of the image stream.
    pub namespace: String,
    /// Name of the image stream.
    pub name: String,
}

impl StreamKey {
    /// Build a key from namespace and name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A named, annotated candidate payload within a release stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReleaseTag {
    /// Tag name, usually a semantic version.
    pub name: String,
    /// Annotation map carrying all per-tag controller state.
    pub annotations: BTreeMap<String, String>,
}

impl ReleaseTag {
    /// Look up an annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// The tag's lifecycle phase, if the annotation is present and valid.
    pub fn phase(&self) -> Option<ReleasePhase> {
        self.annotation(ANNOTATION_PHASE).and_then(ReleasePhase::parse)
    }

    /// The tag's creation time, if the annotation parses.
    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.annotation(ANNOTATION_CREATION_TIMESTAMP)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// True when the keep annotation marks this tag for candidate testing.
    pub fn is_kept(&self) -> bool {
        self.annotation(ANNOTATION_KEEP).is_some()
    }
}

/// The image stream release tags are pushed to.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReleaseStream {
    /// Namespace of the stream.
    pub namespace: String,
    /// Name of the stream.
    pub name: String,
    /// Public pull repository for the stream's images.
    pub public_repository: String,
    /// Release tags, in stream order.
    pub tags: Vec<ReleaseTag>,
}

impl ReleaseStream {
    /// Pull spec for the named tag in this stream.
    pub fn pull_spec(&self, tag: &str) -> String {
        format!("{}:{}", self.public_repository, tag)
    }
}

/// Everything the controller needs to process one release.
#[derive(Clone, Debug, PartialEq)]
pub struct Release {
    /// The image stream the config was loaded from.
    pub source: StreamKey,
    /// The image stream holding the release tags.
    pub target: ReleaseStream,
    /// Public repository of the release mirror, when one exists. Feeds
    /// the `IMAGE_FORMAT` substitution of the job environment contract.
    pub mirror_repository: Option<String>,
    /// Parsed release configuration.
    pub config: ReleaseConfig,
}

impl Release {
    /// Tags in the given phase, newest first by creation timestamp.
    pub fn tags_in_phase(&self, phase: ReleasePhase) -> Vec<&ReleaseTag> {
        let mut tags: Vec<&ReleaseTag> = self
            .target
            .tags
            .iter()
            .filter(|t| t.phase() == Some(phase))
            .collect();
        tags.sort_by(|a, b| {
            let ats = a.annotation(ANNOTATION_CREATION_TIMESTAMP).unwrap_or("");
            let bts = b.annotation(ANNOTATION_CREATION_TIMESTAMP).unwrap_or("");
            bts.cmp(ats)
        });
        tags
    }

    /// Parse an image stream object into a release.
    ///
    /// Returns `Ok(None)` for streams without a config annotation or with
    /// one that does not parse; both are logged and skipped rather than
    /// treated as errors, so one bad stream cannot wedge the controller.
    pub fn parse(stream: &DynamicObject) -> Result<Option<Release>, Error> {
        let namespace = stream.metadata.namespace.clone().unwrap_or_default();
        let name = stream.metadata.name.clone().unwrap_or_default();

        let Some(raw) = stream
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_CONFIG))
        else {
            return Ok(None);
        };

        let config: ReleaseConfig = match serde_json::from_str(raw) {
            Ok(c) => c,
            Err(err) => {
                warn!(
                    stream = %format!("{namespace}/{name}"),
                    error = %err,
                    "image stream has an invalid release config, skipping"
                );
                return Ok(None);
            }
        };
        if config.name.is_empty() {
            warn!(
                stream = %format!("{namespace}/{name}"),
                "release config has no name, skipping"
            );
            return Ok(None);
        }

        let public_repository = stream
            .data
            .get("status")
            .and_then(|s| s.get("publicDockerImageRepository"))
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_string();

        let mut tags = Vec::new();
        if let Some(spec_tags) = stream
            .data
            .get("spec")
            .and_then(|s| s.get("tags"))
            .and_then(|t| t.as_array())
        {
            for entry in spec_tags {
                let Some(tag_name) = entry.get("name").and_then(|n| n.as_str()) else {
                    continue;
                };
                let annotations = entry
                    .get("annotations")
                    .and_then(|a| a.as_object())
                    .map(|a| {
                        a.iter()
                            .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();
                tags.push(ReleaseTag {
                    name: tag_name.to_string(),
                    annotations,
                });
            }
        }

        Ok(Some(Release {
            source: StreamKey::new(namespace.clone(), name.clone()),
            target: ReleaseStream {
                namespace,
                name,
                public_repository,
                tags,
            },
            mirror_repository: None,
            config,
        }))
    }

    /// True when this release is a stable stream.
    pub fn is_stable(&self) -> bool {
        self.config.mode == ReleaseMode::Stable
    }
}

/// Parse a tag name as a semantic version, padding missing segments.
///
/// `4.5` parses as `4.5.0` and a leading `v` is stripped, matching how the
/// rest of the release tooling reads versions out of tag names.
pub fn parse_semver_tolerant(name: &str) -> Option<Version> {
    let s = name.trim().trim_start_matches('v');
    if let Ok(v) = Version::parse(s) {
        return Some(v);
    }
    let (core, rest) = match s.find(['-', '+']) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, ""),
    };
    let dots = core.matches('.').count();
    if dots >= 2 {
        return None;
    }
    let padded = format!("{}{}{}", core, ".0".repeat(2 - dots), rest);
    Version::parse(&padded).ok()
}

/// Tags of the given phase paired with their parsed versions, newest
/// version first. Tags that do not parse are dropped.
pub fn semantic_tags_in_phase(release: &Release, phase: ReleasePhase) -> Vec<(Version, ReleaseTag)> {
    let mut versions: Vec<(Version, ReleaseTag)> = release
        .tags_in_phase(phase)
        .into_iter()
        .filter_map(|t| Some((parse_semver_tolerant(&t.name)?, t.clone())))
        .collect();
    versions.sort_by(|a, b| b.0.cmp(&a.0));
    versions
}

/// Up to `limit` newest entries whose major and minor match `want`.
/// Returns an empty vector when nothing in the line matches.
pub fn latest_with_major_minor<'a>(
    versions: &'a [(Version, ReleaseTag)],
    want: &Version,
    limit: usize,
) -> Vec<&'a (Version, ReleaseTag)> {
    versions
        .iter()
        .filter(|(v, _)| v.major == want.major && v.minor == want.minor)
        .take(limit)
        .collect()
}
