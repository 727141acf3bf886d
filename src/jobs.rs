//! Prow job facade: naming, the environment contract, and the
//! cluster-backed client.
//!
//! The orchestrators only see [`JobRunner`]: ensure that a uniquely named
//! job exists for a `(tag, slot, attempt)` triple and read back its
//! tri-state status. The real implementation creates `ProwJob` objects via
//! the dynamic API, substituting the release environment into the job
//! template's containers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use data_encoding::Encoding;
use kube::api::{Api, DynamicObject, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde::Deserialize;
use sha2::{Digest, Sha512};
use tracing::{debug, info};

use crate::config::JobReference;
use crate::release::{
    Release, ReleasePhase, ReleaseTag, ANNOTATION_FROM_TAG, ANNOTATION_SOURCE, ANNOTATION_TO_TAG,
    ANNOTATION_VERIFY,
};
use crate::status::{JobState, JobStatus};
use crate::upgrades::UpgradeSource;
use crate::Error;

/// Kubernetes object names are limited to 63 characters.
const MAX_JOB_NAME_LEN: usize = 63;

/// Default cluster lifetime handed to jobs, in seconds.
const DEFAULT_CLUSTER_DURATION: &str = "7200";

/// Base-32 alphabet safe for kubernetes resource names (0/O and 1/l
/// lookalikes removed), no padding.
static NAME_ENCODING: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = data_encoding::Specification::new();
    spec.symbols.push_str("bcdfghijklmnpqrstvwxyz0123456789");
    spec.encoding().expect("static base32 specification is valid")
});

/// One-way hash of the inputs, encoded for use in resource names.
///
/// The input space is tiny, so truncating the SHA-512 output to a short
/// prefix keeps collisions tolerable.
pub fn namespace_safe_hash(values: &[&str]) -> String {
    let mut hash = Sha512::new();
    for value in values {
        hash.update(value.as_bytes());
    }
    NAME_ENCODING.encode(&hash.finalize())
}

/// Slot-local name for an attempt: `slot` for attempt zero, `slot-<n>`
/// after.
pub fn attempt_name(slot: &str, attempt: u32) -> String {
    if attempt == 0 {
        slot.to_string()
    } else {
        format!("{slot}-{attempt}")
    }
}

/// Cluster-wide job name for an attempt of a slot against a tag.
///
/// Names longer than 63 characters are replaced by a 20-character hash so
/// the mapping stays a deterministic function of its inputs.
pub fn job_resource_name(tag_name: &str, attempt: &str) -> String {
    let name = format!("{tag_name}-{attempt}");
    if name.len() > MAX_JOB_NAME_LEN {
        namespace_safe_hash(&[name.as_str()])[..20].to_string()
    } else {
        name
    }
}

/// An environment variable demanded by a job template.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Value, possibly filled in by the environment contract.
    #[serde(default)]
    pub value: String,
}

/// A named job template loaded from the prow configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct JobTemplate {
    /// Environment demanded by the job's test container.
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

/// Job templates keyed by prow job name.
#[derive(Clone, Debug, Default)]
pub struct JobTemplates {
    templates: HashMap<String, JobTemplate>,
}

impl JobTemplates {
    /// Parse a YAML document mapping job names to templates.
    pub fn from_yaml(data: &str) -> Result<Self, Error> {
        let templates: HashMap<String, JobTemplate> = serde_yaml::from_str(data)
            .map_err(|err| Error::config(format!("invalid job templates: {err}")))?;
        Ok(Self { templates })
    }

    /// Look up a template by prow job name.
    pub fn get(&self, name: &str) -> Option<&JobTemplate> {
        self.templates.get(name)
    }
}

/// Environment, annotations, and labels for one job instance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReleaseJobEnv {
    /// Variable substitutions offered to the template.
    pub env: BTreeMap<String, String>,
    /// Annotations placed on the job object.
    pub annotations: BTreeMap<String, String>,
    /// Labels placed on the job object.
    pub labels: BTreeMap<String, String>,
}

/// Build the substitution environment for a job against a release tag.
pub fn build_release_env(
    release: &Release,
    tag: &ReleaseTag,
    upgrade: Option<&UpgradeSource>,
    prow_job: &str,
    job_name: &str,
) -> ReleaseJobEnv {
    let mut out = ReleaseJobEnv::default();

    out.labels.insert("prow.k8s.io/type".to_string(), "periodic".to_string());
    out.labels.insert("prow.k8s.io/job".to_string(), prow_job.to_string());
    out.labels.insert(ANNOTATION_VERIFY.to_string(), "true".to_string());

    out.annotations.insert("prow.k8s.io/job".to_string(), prow_job.to_string());
    out.annotations.insert(ANNOTATION_TO_TAG.to_string(), tag.name.clone());
    out.annotations.insert(ANNOTATION_SOURCE.to_string(), release.source.to_string());

    if !release.target.public_repository.is_empty() {
        out.env.insert(
            "RELEASE_IMAGE_LATEST".to_string(),
            release.target.pull_spec(&tag.name),
        );
    }

    if let Some(source) = upgrade {
        out.env.insert("RELEASE_IMAGE_INITIAL".to_string(), source.pull_spec.clone());
        out.annotations.insert(ANNOTATION_FROM_TAG.to_string(), source.tag.clone());
    } else if let Some(previous) = release.tags_in_phase(ReleasePhase::Accepted).first() {
        out.env.insert(
            "RELEASE_IMAGE_INITIAL".to_string(),
            release.target.pull_spec(&previous.name),
        );
        out.annotations.insert(ANNOTATION_FROM_TAG.to_string(), previous.name.clone());
    }

    out.env.insert(
        "NAMESPACE".to_string(),
        format!("ci-ln-{}", &namespace_safe_hash(&[job_name])[..10]),
    );
    out.env.insert(
        "CLUSTER_DURATION".to_string(),
        DEFAULT_CLUSTER_DURATION.to_string(),
    );

    if let Some(mirror) = &release.mirror_repository {
        out.env.insert(
            "IMAGE_FORMAT".to_string(),
            format!("{mirror}:${{component}}"),
        );
        out.env.insert("IMAGE_".to_string(), format!("{mirror}:"));
    }

    out
}

/// Substitute the release environment into a template's variables.
///
/// Returns `Ok(false)` when the template demands an input the release
/// cannot supply and the job should be treated as a no-op (for example an
/// upgrade job with no upgrade source). A missing `IMAGE_FORMAT` is a
/// terminal misconfiguration instead, because the job can never run for
/// this release.
pub fn apply_release_env(
    vars: &mut [EnvVar],
    env: &BTreeMap<String, String>,
    prow_job: &str,
) -> Result<bool, Error> {
    for var in vars.iter_mut() {
        let name = var.name.clone();
        match name.as_str() {
            "RELEASE_IMAGE_LATEST" | "RELEASE_IMAGE_INITIAL" | "NAMESPACE"
            | "CLUSTER_DURATION" => match env.get(&name) {
                Some(value) => var.value = value.clone(),
                None => return Ok(false),
            },
            "IMAGE_FORMAT" => match env.get("IMAGE_FORMAT") {
                Some(value) => var.value = value.clone(),
                None => {
                    return Err(Error::config(format!(
                        "unable to determine IMAGE_FORMAT for prow job {prow_job}"
                    )))
                }
            },
            _ if name.starts_with("IMAGE_") => {
                let suffix = &name["IMAGE_".len()..];
                if suffix.is_empty() {
                    continue;
                }
                let component = suffix.to_lowercase().replace('_', "-");
                match env.get("IMAGE_") {
                    Some(base) => var.value = format!("{base}{component}"),
                    None => {
                        return Err(Error::config(format!(
                            "unable to determine IMAGE_FORMAT for prow job {prow_job}"
                        )))
                    }
                }
            }
            _ => {}
        }
    }
    Ok(true)
}

/// Interface the orchestrators use to run verification jobs.
///
/// `ensure_job` is idempotent on the derived job name: it returns the
/// existing job's status when one exists and otherwise creates the job
/// and returns its initial pending status.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Ensure a job exists for the attempt and read back its status.
    async fn ensure_job(
        &self,
        release: &Release,
        tag: &ReleaseTag,
        attempt: &str,
        job: &JobReference,
        upgrade: Option<&UpgradeSource>,
    ) -> Result<JobStatus, Error>;
}

/// Real job runner backed by the ProwJob dynamic API.
pub struct ProwJobClient {
    client: Client,
    namespace: String,
    templates: Arc<JobTemplates>,
}

impl ProwJobClient {
    /// Create a client creating jobs in the given namespace.
    pub fn new(client: Client, namespace: impl Into<String>, templates: Arc<JobTemplates>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            templates,
        }
    }

    fn api(&self) -> Api<DynamicObject> {
        let ar = ApiResource {
            group: "prow.k8s.io".to_string(),
            version: "v1".to_string(),
            api_version: "prow.k8s.io/v1".to_string(),
            kind: "ProwJob".to_string(),
            plural: "prowjobs".to_string(),
        };
        Api::namespaced_with(self.client.clone(), &self.namespace, &ar)
    }
}

#[async_trait]
impl JobRunner for ProwJobClient {
    async fn ensure_job(
        &self,
        release: &Release,
        tag: &ReleaseTag,
        attempt: &str,
        job: &JobReference,
        upgrade: Option<&UpgradeSource>,
    ) -> Result<JobStatus, Error> {
        let name = job_resource_name(&tag.name, attempt);
        let api = self.api();

        match api.get(&name).await {
            Ok(existing) => return Ok(prow_job_status(&existing)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let template = self.templates.get(&job.name).ok_or_else(|| {
            Error::config(format!(
                "the prow job {} is not valid: no job with that name",
                job.name
            ))
        })?;

        let release_env = build_release_env(release, tag, upgrade, &job.name, &name);
        let mut env = template.env.clone();
        if !apply_release_env(&mut env, &release_env.env, &job.name)? {
            // This job cannot run for this release: no spec inputs exist.
            debug!(job = %name, "job has no applicable inputs, recording synthetic success");
            return Ok(JobStatus::synthetic_success(Utc::now()));
        }

        let manifest: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "prow.k8s.io/v1",
            "kind": "ProwJob",
            "metadata": {
                "name": name,
                "namespace": self.namespace,
                "annotations": release_env.annotations,
                "labels": release_env.labels,
            },
            "spec": {
                "type": "periodic",
                "job": job.name,
                "agent": "kubernetes",
                "pod_spec": {
                    "containers": [{
                        "name": "test",
                        "env": env.iter().map(|v| serde_json::json!({
                            "name": v.name,
                            "value": v.value,
                        })).collect::<Vec<_>>(),
                    }],
                },
            },
            "status": {
                "startTime": Utc::now().to_rfc3339(),
                "state": "triggered",
            },
        }))?;

        match api.create(&PostParams::default(), &manifest).await {
            Ok(created) => {
                info!(job = %name, "created new prow job");
                Ok(prow_job_status(&created))
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // Lost the creation race; read whatever won.
                let existing = api.get(&name).await?;
                Ok(prow_job_status(&existing))
            }
            Err(kube::Error::Api(ae)) if ae.code == 422 => Err(Error::config(format!(
                "the prow job {} is not valid: {}",
                name, ae.message
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

/// Map a prow job object's status to the verification tri-state.
pub fn prow_job_status(job: &DynamicObject) -> JobStatus {
    let status = job.data.get("status");
    let state = match status
        .and_then(|s| s.get("state"))
        .and_then(|s| s.as_str())
        .unwrap_or("")
    {
        "success" => JobState::Succeeded,
        "failure" | "error" | "aborted" => JobState::Failed,
        _ => JobState::Pending,
    };
    let url = status
        .and_then(|s| s.get("url"))
        .and_then(|u| u.as_str())
        .map(String::from);
    let completion_time: Option<DateTime<Utc>> = status
        .and_then(|s| s.get("completionTime"))
        .and_then(|t| t.as_str())
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc));
    let message = status
        .and_then(|s| s.get("description"))
        .and_then(|d| d.as_str())
        .map(String::from);
    JobStatus {
        state,
        url,
        completion_time,
        message,
    }
}
