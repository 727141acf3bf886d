//! Release verification controller.
//!
//! The controller reconciles one release tag at a time: decode the status
//! annotations, drive every configured slot through the job facade, and
//! write the updated status back in a single annotation patch. Delays are
//! never slept on; the earliest retry backoff is handed to the work queue
//! as a delayed re-enqueue of the stream key.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, DynamicObject, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::jobs::{JobRunner, JobTemplates, ProwJobClient};
use crate::queue::{RetryQueue, WorkQueue};
use crate::release::{
    Release, ReleasePhase, ReleaseTag, StreamKey, ANNOTATION_ADDITIONAL_TESTS,
    ANNOTATION_CANDIDATE_TESTS, ANNOTATION_VERIFY,
};
use crate::status::{
    encode_status_annotation, CandidateStatusMap, TestStatusMap, VerificationStatusMap,
};
use crate::upgrades::{StableReleases, UpgradeGraph};
use crate::Error;

pub mod test_jobs;
pub mod verify;

#[cfg(test)]
pub(crate) mod test_support;

/// Writes tag annotations back to the image stream that owns the tag.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TagClient: Send + Sync {
    /// Merge the given annotations onto the named tag of the stream.
    async fn apply_tag_annotations(
        &self,
        stream: &StreamKey,
        tag: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Error>;
}

/// Read access to the stable-release index.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StableReleaseIndex: Send + Sync {
    /// All stable release streams, newest version first.
    async fn stable_releases(&self) -> Result<StableReleases, Error>;
}

/// Emits warning events for terminal misconfigurations.
#[cfg_attr(test, automock)]
pub trait EventSink: Send + Sync {
    /// Record a warning event against the source image stream.
    fn warning(&self, stream: &StreamKey, reason: &str, message: &str);
}

/// Shared state for every reconcile.
///
/// Trait objects keep the orchestrators testable; production wires the
/// kube-backed implementations via [`Context::new`].
pub struct Context {
    /// Job facade ensuring uniquely named verification jobs.
    pub jobs: Arc<dyn JobRunner>,
    /// Annotation writer for release tags.
    pub tags: Arc<dyn TagClient>,
    /// Stable-release index consulted by the upgrade resolver.
    pub stable: Arc<dyn StableReleaseIndex>,
    /// Accumulated upgrade outcomes between tags.
    pub graph: Arc<UpgradeGraph>,
    /// Delayed re-enqueue sink.
    pub queue: Arc<dyn RetryQueue>,
    /// Warning-event sink for misconfigurations.
    pub events: Arc<dyn EventSink>,
}

impl Context {
    /// Create a context with the kube-backed implementations.
    pub fn new(
        client: Client,
        release_namespace: &str,
        prow_namespace: &str,
        templates: Arc<JobTemplates>,
        queue: Arc<WorkQueue>,
    ) -> Self {
        Self {
            jobs: Arc::new(ProwJobClient::new(client.clone(), prow_namespace, templates)),
            tags: Arc::new(RealTagClient::new(client.clone())),
            stable: Arc::new(RealStableReleaseIndex::new(
                client.clone(),
                release_namespace,
            )),
            graph: Arc::new(UpgradeGraph::new()),
            queue,
            events: Arc::new(RealEventSink::new(client)),
        }
    }

    /// Create a context from explicit implementations, for tests.
    pub fn with_clients(
        jobs: Arc<dyn JobRunner>,
        tags: Arc<dyn TagClient>,
        stable: Arc<dyn StableReleaseIndex>,
        graph: Arc<UpgradeGraph>,
        queue: Arc<dyn RetryQueue>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            jobs,
            tags,
            stable,
            graph,
            queue,
            events,
        }
    }
}

/// Result of reconciling one tag.
#[derive(Clone, Debug, Default)]
pub struct TagSyncOutcome {
    /// Updated gating statuses, when the family ran.
    pub verify: Option<VerificationStatusMap>,
    /// Updated additional-test statuses, when the family ran.
    pub additional: Option<TestStatusMap>,
    /// Updated candidate-test statuses, when the family ran.
    pub candidate: Option<CandidateStatusMap>,
    /// Earliest delay after which a retry becomes due, if any.
    pub requeue_after: Option<Duration>,
}

/// Reconcile a single release tag.
///
/// `Ready` tags get gating verification and additional tests; `Accepted`
/// tags marked with the keep annotation get candidate tests. All status
/// mutations land in one terminal annotation write, and the work queue is
/// asked for at most one delayed re-enqueue.
#[instrument(skip(release, tag, ctx), fields(stream = %release.source, tag = %tag.name))]
pub async fn sync_tag(
    release: &Release,
    tag: &ReleaseTag,
    ctx: &Context,
) -> Result<TagSyncOutcome, Error> {
    let mut outcome = TagSyncOutcome::default();
    let mut annotations: BTreeMap<String, String> = BTreeMap::new();

    match tag.phase() {
        Some(ReleasePhase::Ready) => {
            let (verify_status, verify_delay) =
                verify::ensure_verification_jobs(release, tag, ctx).await?;
            stage_annotation(&mut annotations, tag, ANNOTATION_VERIFY, &verify_status)?;
            outcome.verify = Some(verify_status);

            let (test_status, test_delay) =
                test_jobs::ensure_additional_tests(release, tag, ctx).await?;
            stage_annotation(&mut annotations, tag, ANNOTATION_ADDITIONAL_TESTS, &test_status)?;
            outcome.additional = Some(test_status);

            outcome.requeue_after = min_delay(verify_delay, test_delay);
        }
        Some(ReleasePhase::Accepted) if tag.is_kept() => {
            let (candidate_status, delay) =
                test_jobs::ensure_candidate_tests(release, tag, ctx).await?;
            stage_annotation(
                &mut annotations,
                tag,
                ANNOTATION_CANDIDATE_TESTS,
                &candidate_status,
            )?;
            outcome.candidate = Some(candidate_status);
            outcome.requeue_after = delay;
        }
        _ => return Ok(outcome),
    }

    if !annotations.is_empty() {
        debug!(count = annotations.len(), "writing updated status annotations");
        let stream = StreamKey::new(
            release.target.namespace.clone(),
            release.target.name.clone(),
        );
        ctx.tags
            .apply_tag_annotations(&stream, &tag.name, annotations)
            .await?;
    }

    if let Some(delay) = outcome.requeue_after {
        debug!(delay = ?delay, "requesting delayed re-enqueue");
        ctx.queue.add_after(release.source.clone(), delay);
    }

    Ok(outcome)
}

/// Reconcile every tag of a release. The first retryable error aborts;
/// already-processed tags have their single writes behind them, and the
/// next reconcile reconstructs the rest from the annotations.
pub async fn sync_release(release: &Release, ctx: &Context) -> Result<(), Error> {
    for tag in &release.target.tags {
        sync_tag(release, tag, ctx).await?;
    }
    Ok(())
}

/// Stage an encoded status annotation when it differs from what the tag
/// already carries. Empty maps stay absent: the annotation is only created
/// once a first attempt exists.
fn stage_annotation<T: serde::Serialize>(
    annotations: &mut BTreeMap<String, String>,
    tag: &ReleaseTag,
    key: &str,
    status: &BTreeMap<String, T>,
) -> Result<(), Error> {
    if status.is_empty() {
        return Ok(());
    }
    let encoded = encode_status_annotation(status)?;
    if tag.annotation(key) != Some(encoded.as_str()) {
        annotations.insert(key.to_string(), encoded);
    }
    Ok(())
}

/// Fold a new delay into the running earliest-delay accumulator.
pub(crate) fn merge_delay(current: &mut Option<Duration>, candidate: Duration) {
    match current {
        Some(existing) if *existing <= candidate => {}
        _ => *current = Some(candidate),
    }
}

fn min_delay(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// `ApiResource` for OpenShift image streams, which have no typed binding.
pub fn image_stream_resource() -> ApiResource {
    ApiResource {
        group: "image.openshift.io".to_string(),
        version: "v1".to_string(),
        api_version: "image.openshift.io/v1".to_string(),
        kind: "ImageStream".to_string(),
        plural: "imagestreams".to_string(),
    }
}

/// Tag annotation writer backed by the image stream dynamic API.
pub struct RealTagClient {
    client: Client,
}

impl RealTagClient {
    /// Wrap a kube client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TagClient for RealTagClient {
    async fn apply_tag_annotations(
        &self,
        stream: &StreamKey,
        tag: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &stream.namespace, &image_stream_resource());
        let mut object = api.get(&stream.name).await?;

        let tags = object
            .data
            .get_mut("spec")
            .and_then(|s| s.get_mut("tags"))
            .and_then(|t| t.as_array_mut())
            .ok_or_else(|| Error::job(format!("image stream {stream} has no spec tags")))?;
        let entry = tags
            .iter_mut()
            .find(|t| t.get("name").and_then(|n| n.as_str()) == Some(tag))
            .ok_or_else(|| Error::job(format!("image stream {stream} has no tag {tag}")))?;

        let slot = entry
            .as_object_mut()
            .ok_or_else(|| Error::job(format!("image stream {stream} tag {tag} is malformed")))?
            .entry("annotations")
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
        let map = slot
            .as_object_mut()
            .ok_or_else(|| Error::job(format!("image stream {stream} tag {tag} is malformed")))?;
        for (key, value) in annotations {
            map.insert(key, serde_json::Value::String(value));
        }

        api.replace(&stream.name, &PostParams::default(), &object)
            .await?;
        info!(stream = %stream, tag = %tag, "updated tag status annotations");
        Ok(())
    }
}

/// Stable-release index backed by listing image streams in the release
/// namespace and keeping the ones in `Stable` mode.
pub struct RealStableReleaseIndex {
    client: Client,
    namespace: String,
}

impl RealStableReleaseIndex {
    /// Index streams in the given namespace.
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl StableReleaseIndex for RealStableReleaseIndex {
    async fn stable_releases(&self) -> Result<StableReleases, Error> {
        use crate::release::parse_semver_tolerant;
        use crate::upgrades::StableRelease;

        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &self.namespace, &image_stream_resource());
        let streams = api.list(&Default::default()).await?;

        let mut releases = Vec::new();
        for stream in streams {
            let Some(release) = Release::parse(&stream)? else {
                continue;
            };
            if !release.is_stable() {
                continue;
            }
            let Some(version) = parse_semver_tolerant(&release.config.name) else {
                continue;
            };
            releases.push(StableRelease { version, release });
        }
        Ok(StableReleases::new(releases))
    }
}

/// Event sink creating `Warning` events against image streams.
///
/// Event creation is fire-and-forget: a dropped event never blocks or
/// fails a reconcile.
pub struct RealEventSink {
    client: Client,
}

impl RealEventSink {
    /// Wrap a kube client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl EventSink for RealEventSink {
    fn warning(&self, stream: &StreamKey, reason: &str, message: &str) {
        let api: Api<Event> = Api::namespaced(self.client.clone(), &stream.namespace);
        let now = chrono::Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                name: Some(format!("{}.{:x}", stream.name, now.timestamp_nanos_opt().unwrap_or(0))),
                namespace: Some(stream.namespace.clone()),
                ..Default::default()
            },
            involved_object: k8s_openapi::api::core::v1::ObjectReference {
                api_version: Some("image.openshift.io/v1".to_string()),
                kind: Some("ImageStream".to_string()),
                name: Some(stream.name.clone()),
                namespace: Some(stream.namespace.clone()),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some("Warning".to_string()),
            event_time: Some(MicroTime(now)),
            reporting_component: Some("release-gate".to_string()),
            ..Default::default()
        };
        let reason = reason.to_string();
        tokio::spawn(async move {
            if let Err(err) = api.create(&PostParams::default(), &event).await {
                warn!(reason = %reason, error = %err, "failed to record warning event");
            }
        });
    }
}
