//! Shared fixtures for controller tests.
//!
//! The job runner, event sink, and retry queue here are hand-rolled
//! recorders rather than mockall mocks: the orchestrator tests verify
//! observable outcomes (which attempts ran, what was enqueued) without
//! coupling to call-expectation details.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{JobReference, ReleaseConfig, ReleaseMode, ReleaseTest, ReleaseVerification};
use crate::jobs::JobRunner;
use crate::queue::RetryQueue;
use crate::release::{
    Release, ReleaseStream, ReleaseTag, StreamKey, ANNOTATION_CREATION_TIMESTAMP, ANNOTATION_KEEP,
    ANNOTATION_PHASE,
};
use crate::status::{JobState, JobStatus};
use crate::upgrades::{StableRelease, StableReleases, UpgradeGraph, UpgradeSource};
use crate::Error;

use super::{Context, EventSink, StableReleaseIndex, TagClient};

pub(crate) fn ready_tag(name: &str) -> ReleaseTag {
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_PHASE.to_string(), "Ready".to_string());
    annotations.insert(
        ANNOTATION_CREATION_TIMESTAMP.to_string(),
        "2024-01-03T00:00:00Z".to_string(),
    );
    ReleaseTag {
        name: name.to_string(),
        annotations,
    }
}

pub(crate) fn accepted_tag(name: &str, created: &str) -> ReleaseTag {
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_PHASE.to_string(), "Accepted".to_string());
    annotations.insert(ANNOTATION_CREATION_TIMESTAMP.to_string(), created.to_string());
    ReleaseTag {
        name: name.to_string(),
        annotations,
    }
}

pub(crate) fn kept_tag(name: &str) -> ReleaseTag {
    let mut tag = accepted_tag(name, "2024-01-03T00:00:00Z");
    tag.annotations.insert(ANNOTATION_KEEP.to_string(), "true".to_string());
    tag
}

fn base_release(config: ReleaseConfig) -> Release {
    Release {
        source: StreamKey::new("ocp", "origin"),
        target: ReleaseStream {
            namespace: "ocp".to_string(),
            name: "release".to_string(),
            public_repository: "registry.ci/ocp/release".to_string(),
            tags: Vec::new(),
        },
        mirror_repository: None,
        config,
    }
}

pub(crate) fn release_with_verify(slots: Vec<(&str, ReleaseVerification)>) -> Release {
    base_release(ReleaseConfig {
        name: "4.5.0-0.ci".to_string(),
        verify: slots
            .into_iter()
            .map(|(name, v)| (name.to_string(), v))
            .collect(),
        ..Default::default()
    })
}

pub(crate) fn release_with_additional_tests(slots: Vec<(&str, ReleaseTest)>) -> Release {
    base_release(ReleaseConfig {
        name: "4.5.0-0.ci".to_string(),
        additional_tests: slots
            .into_iter()
            .map(|(name, t)| (name.to_string(), t))
            .collect(),
        ..Default::default()
    })
}

pub(crate) fn release_with_candidate_tests(slots: Vec<(&str, ReleaseTest)>) -> Release {
    base_release(ReleaseConfig {
        name: "4.5.0-0.ci".to_string(),
        candidate_tests: slots
            .into_iter()
            .map(|(name, t)| (name.to_string(), t))
            .collect(),
        ..Default::default()
    })
}

/// A stable release stream named `line` whose listed tags are accepted,
/// newest first in the given order.
pub(crate) fn stable_line(line: &str, tags: &[&str]) -> StableReleases {
    let mut release = base_release(ReleaseConfig {
        name: line.to_string(),
        mode: ReleaseMode::Stable,
        ..Default::default()
    });
    release.target.public_repository = "registry.ci/ocp/stable".to_string();
    // Creation timestamps descend with position so ordering is stable.
    for (index, name) in tags.iter().enumerate() {
        release.target.tags.push(accepted_tag(
            name,
            &format!("2024-01-{:02}T00:00:00Z", 28 - index),
        ));
    }
    let version = crate::release::parse_semver_tolerant(line).expect("stable line parses");
    StableReleases::new(vec![StableRelease { version, release }])
}

#[derive(Default)]
struct RecordedJobs {
    attempts: Vec<String>,
    upgrade_tags: Vec<Option<String>>,
}

struct RecordingJobRunner {
    state: JobState,
    completion: Option<DateTime<Utc>>,
    forbid_calls: bool,
    recorded: Mutex<RecordedJobs>,
}

#[async_trait]
impl JobRunner for RecordingJobRunner {
    async fn ensure_job(
        &self,
        _release: &Release,
        tag: &ReleaseTag,
        attempt: &str,
        _job: &JobReference,
        upgrade: Option<&UpgradeSource>,
    ) -> Result<JobStatus, Error> {
        assert!(
            !self.forbid_calls,
            "unexpected ensure_job for {attempt} on {}",
            tag.name
        );
        let mut recorded = self.recorded.lock().unwrap();
        recorded.attempts.push(attempt.to_string());
        recorded.upgrade_tags.push(upgrade.map(|u| u.tag.clone()));
        Ok(JobStatus {
            state: self.state,
            url: Some(format!("https://prow/{attempt}")),
            completion_time: if self.state.is_terminal() {
                self.completion.or_else(|| Some(Utc::now()))
            } else {
                None
            },
            message: None,
        })
    }
}

#[derive(Default)]
struct RecordingTagClient {
    writes: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

#[async_trait]
impl TagClient for RecordingTagClient {
    async fn apply_tag_annotations(
        &self,
        _stream: &StreamKey,
        tag: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        self.writes
            .lock()
            .unwrap()
            .push((tag.to_string(), annotations));
        Ok(())
    }
}

struct StaticStableIndex {
    releases: StableReleases,
}

#[async_trait]
impl StableReleaseIndex for StaticStableIndex {
    async fn stable_releases(&self) -> Result<StableReleases, Error> {
        Ok(self.releases.clone())
    }
}

#[derive(Default)]
struct RecordingEventSink {
    reasons: Mutex<Vec<String>>,
}

impl EventSink for RecordingEventSink {
    fn warning(&self, _stream: &StreamKey, reason: &str, _message: &str) {
        self.reasons.lock().unwrap().push(reason.to_string());
    }
}

#[derive(Default)]
struct RecordingQueue {
    delays: Mutex<Vec<(StreamKey, Duration)>>,
}

impl RetryQueue for RecordingQueue {
    fn add_after(&self, key: StreamKey, delay: Duration) {
        self.delays.lock().unwrap().push((key, delay));
    }
}

/// Recording context for orchestrator tests.
pub(crate) struct TestContext {
    jobs: Arc<RecordingJobRunner>,
    tags: Arc<RecordingTagClient>,
    stable: StableReleases,
    graph: Arc<UpgradeGraph>,
    queue: Arc<RecordingQueue>,
    events: Arc<RecordingEventSink>,
}

impl TestContext {
    fn new(state: JobState, completion: Option<DateTime<Utc>>, forbid_calls: bool) -> Self {
        Self {
            jobs: Arc::new(RecordingJobRunner {
                state,
                completion,
                forbid_calls,
                recorded: Mutex::new(RecordedJobs::default()),
            }),
            tags: Arc::new(RecordingTagClient::default()),
            stable: StableReleases::default(),
            graph: Arc::new(UpgradeGraph::new()),
            queue: Arc::new(RecordingQueue::default()),
            events: Arc::new(RecordingEventSink::default()),
        }
    }

    /// Every ensured job reports the given state.
    pub(crate) fn returning_job_state(state: JobState) -> Self {
        Self::new(state, None, false)
    }

    /// Like [`Self::returning_job_state`], recording attempt names too.
    pub(crate) fn recording_jobs(state: JobState) -> Self {
        Self::new(state, None, false)
    }

    /// Terminal results carry the given completion time.
    pub(crate) fn recording_jobs_with_completion(
        state: JobState,
        completion: DateTime<Utc>,
    ) -> Self {
        Self::new(state, Some(completion), false)
    }

    /// Any ensured job panics the test: the reconcile must not create one.
    pub(crate) fn expecting_no_jobs() -> Self {
        Self::new(JobState::Pending, None, true)
    }

    /// Replace the stable-release index snapshot.
    pub(crate) fn with_stable(mut self, stable: StableReleases) -> Self {
        self.stable = stable;
        self
    }

    /// Build a [`Context`] sharing this fixture's recorders.
    pub(crate) fn context(&self) -> Context {
        Context::with_clients(
            self.jobs.clone(),
            self.tags.clone(),
            Arc::new(StaticStableIndex {
                releases: self.stable.clone(),
            }),
            self.graph.clone(),
            self.queue.clone(),
            self.events.clone(),
        )
    }

    /// Like [`Self::context`], with the tag client swapped out.
    pub(crate) fn context_with_tags(&self, tags: Arc<dyn TagClient>) -> Context {
        Context::with_clients(
            self.jobs.clone(),
            tags,
            Arc::new(StaticStableIndex {
                releases: self.stable.clone(),
            }),
            self.graph.clone(),
            self.queue.clone(),
            self.events.clone(),
        )
    }

    /// Like [`Self::context`], with the stable index swapped out.
    pub(crate) fn context_with_stable_index(
        &self,
        stable: Arc<dyn StableReleaseIndex>,
    ) -> Context {
        Context::with_clients(
            self.jobs.clone(),
            self.tags.clone(),
            stable,
            self.graph.clone(),
            self.queue.clone(),
            self.events.clone(),
        )
    }

    /// Attempt names passed to the job facade, in call order.
    pub(crate) fn ensured_attempts(&self) -> Vec<String> {
        self.jobs.recorded.lock().unwrap().attempts.clone()
    }

    /// Upgrade source tags passed to the job facade, in call order.
    pub(crate) fn ensured_upgrade_tags(&self) -> Vec<Option<String>> {
        self.jobs.recorded.lock().unwrap().upgrade_tags.clone()
    }

    /// Annotation writes observed by the tag client.
    pub(crate) fn annotation_writes(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.tags.writes.lock().unwrap().clone()
    }

    /// Delayed re-enqueues requested on the queue.
    pub(crate) fn enqueued_delays(&self) -> Vec<(StreamKey, Duration)> {
        self.queue.delays.lock().unwrap().clone()
    }

    /// Warning event reasons recorded by the sink.
    pub(crate) fn warnings(&self) -> Vec<String> {
        self.events.reasons.lock().unwrap().clone()
    }

    /// The shared upgrade graph.
    pub(crate) fn graph(&self) -> &UpgradeGraph {
        self.graph.as_ref()
    }
}
