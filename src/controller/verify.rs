//! Single-attempt gating orchestrator.
//!
//! Drives the `verify` map of a release config against one tag: at most
//! one attempt in flight per slot, retries gated by exponential backoff,
//! and a `maxRetries` cap after which the slot's failure is terminal.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::backoff::calculate_backoff;
#[cfg(test)]
use crate::config::ReleaseVerification;
use crate::release::{Release, ReleaseTag, ANNOTATION_VERIFY};
use crate::status::{
    decode_status_annotation, JobState, JobStatus, VerificationStatus, VerificationStatusMap,
};
use crate::upgrades::{upgrade_source, StableReleases, UpgradeResult, UpgradeSource};
use crate::Error;

use super::{merge_delay, Context};

/// Ensure every enabled gating slot has its current attempt running and
/// fold the results into the verification status map.
///
/// Returns the updated map and the earliest delay after which a failed
/// slot becomes retryable, if any slot is waiting on backoff.
pub(crate) async fn ensure_verification_jobs(
    release: &Release,
    tag: &ReleaseTag,
    ctx: &Context,
) -> Result<(VerificationStatusMap, Option<Duration>), Error> {
    let mut status: VerificationStatusMap =
        decode_status_annotation(&tag.name, tag.annotation(ANNOTATION_VERIFY));
    let mut retry_delay: Option<Duration> = None;
    let now = Utc::now();
    // The stable index is only consulted for upgrade slots; fetch it once.
    let mut stable: Option<StableReleases> = None;

    for (name, verify_type) in &release.config.verify {
        if verify_type.disabled {
            debug!(tag = %tag.name, slot = %name, "verification step is disabled, ignoring");
            continue;
        }
        let Some(job_ref) = &verify_type.prow_job else {
            // Manual verification: another process writes the outcome.
            continue;
        };

        let mut job_retries = 0;
        if let Some(prior) = status.get(name) {
            job_retries = prior.retries;
            match prior.job.state {
                JobState::Succeeded => continue,
                JobState::Failed => {
                    job_retries += 1;
                    if job_retries > verify_type.max_retries {
                        continue;
                    }
                    // Without a transition time the attempt runs now; the
                    // nominal delay would otherwise re-arm on every pass.
                    if let Some(transition) = prior.transition_time {
                        let delay = calculate_backoff(job_retries, Some(transition), now);
                        if !delay.is_zero() {
                            debug!(
                                tag = %tag.name,
                                slot = %name,
                                failures = job_retries,
                                delay = ?delay,
                                "verification step backing off before retry"
                            );
                            merge_delay(&mut retry_delay, delay);
                            continue;
                        }
                    }
                }
                JobState::Pending => {}
                JobState::Unknown => {
                    warn!(
                        tag = %tag.name,
                        slot = %name,
                        "unrecognized verification state, reprocessing"
                    );
                }
            }
        }

        let mut source: Option<UpgradeSource> = None;
        if verify_type.upgrade {
            if stable.is_none() {
                stable = Some(ctx.stable.stable_releases().await?);
            }
            let index = stable.as_ref().expect("stable index fetched above");
            match upgrade_source(release, tag, name, verify_type.upgrade_from, index) {
                Ok(sources) if sources.is_empty() => {
                    // Nothing to upgrade from: the slot is a no-op.
                    record_synthetic_success(&mut status, name, job_retries, now);
                    continue;
                }
                Ok(mut sources) => source = Some(sources.remove(0)),
                Err(err) if err.is_terminal() => {
                    warn!(tag = %tag.name, slot = %name, error = %err, "skipping misconfigured slot");
                    ctx.events
                        .warning(&release.source, "ProwJobInvalid", &err.to_string());
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        let attempt = crate::jobs::attempt_name(name, job_retries);
        let job_status = match ctx
            .jobs
            .ensure_job(release, tag, &attempt, job_ref, source.as_ref())
            .await
        {
            Ok(s) => s,
            Err(err) if err.is_terminal() => {
                warn!(tag = %tag.name, slot = %name, error = %err, "skipping misconfigured slot");
                ctx.events
                    .warning(&release.source, "ProwJobInvalid", &err.to_string());
                continue;
            }
            Err(err) => return Err(err),
        };

        if job_status.state == JobState::Succeeded {
            debug!(
                tag = %tag.name,
                slot = %name,
                url = job_status.url.as_deref().unwrap_or(""),
                "verification job succeeded"
            );
        }

        let prior_state = status.get(name).map(|s| s.job.state);
        if let Some(src) = &source {
            if job_status.state.is_terminal() && prior_state != Some(job_status.state) {
                ctx.graph.add(
                    &src.tag,
                    &tag.name,
                    UpgradeResult {
                        state: job_status.state,
                        url: job_status.url.clone(),
                    },
                );
            }
        }

        let transition_time = job_status.completion_time;
        status.insert(
            name.clone(),
            VerificationStatus {
                job: job_status.clone(),
                retries: job_retries,
                transition_time,
            },
        );

        if job_retries >= verify_type.max_retries {
            continue;
        }
        if job_status.state == JobState::Failed {
            let delay = calculate_backoff(job_retries + 1, job_status.completion_time, now);
            if !delay.is_zero() {
                merge_delay(&mut retry_delay, delay);
            }
        }
    }

    Ok((status, retry_delay))
}

fn record_synthetic_success(
    status: &mut VerificationStatusMap,
    name: &str,
    retries: u32,
    now: chrono::DateTime<Utc>,
) {
    // Terminal entries are immutable; only write if nothing terminal exists.
    if status
        .get(name)
        .map(|s| s.job.state.is_terminal())
        .unwrap_or(false)
    {
        return;
    }
    status.insert(
        name.to_string(),
        VerificationStatus {
            job: JobStatus::synthetic_success(now),
            retries,
            transition_time: Some(now),
        },
    );
}

/// True when a gating verification definition wants an attempt right now.
/// Used by tests to cross-check the orchestrator's skip logic.
#[cfg(test)]
pub(crate) fn wants_attempt(definition: &ReleaseVerification, prior: Option<&VerificationStatus>) -> bool {
    if definition.disabled || definition.prow_job.is_none() {
        return false;
    }
    match prior {
        None => true,
        Some(s) => match s.job.state {
            JobState::Succeeded => false,
            JobState::Failed => s.retries + 1 <= definition.max_retries,
            JobState::Pending | JobState::Unknown => true,
        },
    }
}
