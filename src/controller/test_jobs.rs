//! Multi-attempt orchestrator for the additional-tests and candidate-tests
//! families.
//!
//! Both families record every attempt of a slot as an ordered list and
//! share one kernel: walk the persisted attempts, apply the retry-strategy
//! short-circuit, and ensure the next attempt when one is owed. They
//! differ in how slots are expanded: additional tests union in dynamic
//! upgrade slots from the stable index, while candidate tests fan out
//! over rally-point upgrade sources.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::backoff::calculate_backoff;
use crate::config::{JobReference, ReleaseTest, RetryStrategy};
use crate::release::{
    parse_semver_tolerant, semantic_tags_in_phase, Release, ReleasePhase, ReleaseTag,
    ANNOTATION_ADDITIONAL_TESTS, ANNOTATION_CANDIDATE_TESTS,
};
use crate::status::{
    decode_status_annotation, CandidateStatusMap, CandidateTestStatus, JobState, JobStatus,
    TestStatusMap,
};
use crate::upgrades::{upgrade_source, UpgradeResult, UpgradeSource};
use crate::Error;

use super::{merge_delay, Context};

/// Retry count for upgrade slots synthesized from the stable index.
const SYNTHESIZED_UPGRADE_RETRIES: u32 = 2;

/// A slot after expansion: the definition plus its resolved upgrade
/// source. Slots with `runnable = false` have no inputs and record a
/// synthetic success instead of running.
#[derive(Clone, Debug)]
struct ExpandedTest {
    test: ReleaseTest,
    source: Option<UpgradeSource>,
    runnable: bool,
}

/// Ensure the additional-test slots for a tag, including the dynamic
/// upgrade slots derived from the stable-release index.
pub(crate) async fn ensure_additional_tests(
    release: &Release,
    tag: &ReleaseTag,
    ctx: &Context,
) -> Result<(TestStatusMap, Option<Duration>), Error> {
    let mut status: TestStatusMap =
        decode_status_annotation(&tag.name, tag.annotation(ANNOTATION_ADDITIONAL_TESTS));
    let mut retry_delay: Option<Duration> = None;
    let now = Utc::now();

    let expanded = expand_additional_tests(release, tag, ctx).await?;
    for (name, slot) in expanded {
        if !slot.runnable {
            record_synthetic_attempt(status.entry(name).or_default(), now);
            continue;
        }
        let prior = status.get(&name).cloned().unwrap_or_default();
        match advance_slot(release, tag, &name, &slot, &prior, ctx, now).await {
            Ok(Some((attempts, delay))) => {
                merge_optional(&mut retry_delay, delay);
                status.insert(name, attempts);
            }
            Ok(None) => {}
            Err(err) if err.is_terminal() => {
                warn!(tag = %tag.name, slot = %name, error = %err, "skipping misconfigured slot");
                ctx.events
                    .warning(&release.source, "ProwJobInvalid", &err.to_string());
            }
            Err(err) => return Err(err),
        }
    }

    Ok((status, retry_delay))
}

/// Ensure the candidate-test slots for a kept terminal tag.
pub(crate) async fn ensure_candidate_tests(
    release: &Release,
    tag: &ReleaseTag,
    ctx: &Context,
) -> Result<(CandidateStatusMap, Option<Duration>), Error> {
    let mut status: CandidateStatusMap =
        decode_status_annotation(&tag.name, tag.annotation(ANNOTATION_CANDIDATE_TESTS));
    let mut retry_delay: Option<Duration> = None;
    let now = Utc::now();

    let expanded = expand_candidate_tests(release, tag, ctx).await?;
    for (name, slot) in expanded {
        if !slot.runnable {
            let entry = status.entry(name).or_default();
            if record_synthetic_attempt(&mut entry.status, now) {
                entry.transition_time = Some(now);
            }
            continue;
        }
        let prior = status.get(&name).map(|s| s.status.clone()).unwrap_or_default();
        match advance_slot(release, tag, &name, &slot, &prior, ctx, now).await {
            Ok(Some((attempts, delay))) => {
                merge_optional(&mut retry_delay, delay);
                if attempts != prior {
                    status.insert(
                        name,
                        CandidateTestStatus {
                            status: attempts,
                            transition_time: Some(now),
                        },
                    );
                }
            }
            Ok(None) => {}
            Err(err) if err.is_terminal() => {
                warn!(tag = %tag.name, slot = %name, error = %err, "skipping misconfigured slot");
                ctx.events
                    .warning(&release.source, "ProwJobInvalid", &err.to_string());
            }
            Err(err) => return Err(err),
        }
    }

    Ok((status, retry_delay))
}

/// Walk one slot's persisted attempts and ensure the next one when owed.
///
/// Returns `None` when the slot needs nothing this reconcile: its strategy
/// short-circuited, its attempts are exhausted, or a persisted state is
/// unrecognized (logged and abandoned until the next reconcile).
async fn advance_slot(
    release: &Release,
    tag: &ReleaseTag,
    slot: &str,
    expanded: &ExpandedTest,
    prior: &[JobStatus],
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<Option<(Vec<JobStatus>, Option<Duration>)>, Error> {
    let test = &expanded.test;
    if test.retry_strategy == RetryStrategy::Unknown {
        return Err(Error::config(format!(
            "test {slot} defines an unknown retry strategy"
        )));
    }
    let Some(job_ref) = &test.verification.prow_job else {
        return Ok(None);
    };
    let max_retries = test.verification.max_retries;

    let mut job_no: u32 = 0;
    let mut failed: u32 = 0;
    for attempt in prior {
        match attempt.state {
            JobState::Succeeded => {
                job_no += 1;
                failed = 0;
                if test.retry_strategy == RetryStrategy::FirstSuccess {
                    return Ok(None);
                }
            }
            JobState::Failed => {
                job_no += 1;
                failed += 1;
                if test.retry_strategy == RetryStrategy::FirstFailure {
                    return Ok(None);
                }
            }
            JobState::Pending => break,
            JobState::Unknown => {
                warn!(
                    tag = %tag.name,
                    slot = %slot,
                    "unrecognized test state, abandoning slot for this reconcile"
                );
                return Ok(None);
            }
        }
    }
    if job_no > max_retries {
        return Ok(None);
    }

    let attempt = crate::jobs::attempt_name(slot, job_no);
    let job_status = ctx
        .jobs
        .ensure_job(release, tag, &attempt, job_ref, expanded.source.as_ref())
        .await?;
    if job_status.state == JobState::Succeeded {
        debug!(
            tag = %tag.name,
            slot = %slot,
            url = job_status.url.as_deref().unwrap_or(""),
            "test job succeeded"
        );
    }

    let mut attempts = prior.to_vec();
    let prior_state = attempts.get(job_no as usize).map(|s| s.state);
    if (attempts.len() as u32) <= job_no {
        attempts.push(job_status.clone());
    } else {
        attempts[job_no as usize] = job_status.clone();
    }

    if let Some(src) = &expanded.source {
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

    let mut delay = None;
    if job_no < max_retries && job_status.state == JobState::Failed {
        let backoff = calculate_backoff(failed + 1, job_status.completion_time, now);
        if !backoff.is_zero() {
            delay = Some(backoff);
        }
    }
    Ok(Some((attempts, delay)))
}

/// Union the configured additional tests with dynamic upgrade slots: one
/// `e2e-aws-upgrade-X.Y.Z` slot per stable accepted tag in the candidate's
/// minor line that still has upgrade attempts owed.
async fn expand_additional_tests(
    release: &Release,
    tag: &ReleaseTag,
    ctx: &Context,
) -> Result<BTreeMap<String, ExpandedTest>, Error> {
    let mut expanded = BTreeMap::new();
    let mut stable = None;

    for (name, test) in &release.config.additional_tests {
        if test.verification.disabled {
            debug!(tag = %tag.name, slot = %name, "test step is disabled, ignoring");
            continue;
        }
        if test.verification.prow_job.is_none() {
            continue;
        }
        let slot = if test.verification.upgrade {
            if stable.is_none() {
                stable = Some(ctx.stable.stable_releases().await?);
            }
            let index = stable.as_ref().expect("stable index fetched above");
            match configured_upgrade_source(release, tag, name, test, index) {
                Ok(Some(source)) => ExpandedTest {
                    test: test.clone(),
                    source: Some(source),
                    runnable: true,
                },
                Ok(None) => ExpandedTest {
                    test: test.clone(),
                    source: None,
                    runnable: false,
                },
                Err(err) if err.is_terminal() => {
                    warn!(tag = %tag.name, slot = %name, error = %err, "skipping misconfigured slot");
                    ctx.events
                        .warning(&release.source, "ProwJobInvalid", &err.to_string());
                    continue;
                }
                Err(err) => return Err(err),
            }
        } else {
            ExpandedTest {
                test: test.clone(),
                source: None,
                runnable: true,
            }
        };
        expanded.insert(name.clone(), slot);
    }

    // Dynamic upgrade coverage: exercise upgrades from every stable tag of
    // the candidate's minor line that has attempts owed.
    let Some(version) = parse_semver_tolerant(&tag.name) else {
        return Ok(expanded);
    };
    if stable.is_none() {
        stable = Some(ctx.stable.stable_releases().await?);
    }
    let index = stable.as_ref().expect("stable index fetched above");
    let recorded = ctx.graph.upgrades_to(&tag.name);
    for stable_release in &index.releases {
        for (v, stable_tag) in semantic_tags_in_phase(&stable_release.release, ReleasePhase::Accepted)
        {
            if v.major != version.major || v.minor != version.minor {
                continue;
            }
            let attempts_so_far = recorded
                .iter()
                .find(|h| h.from == stable_tag.name)
                .map(|h| h.total)
                .unwrap_or(0);
            if attempts_so_far >= SYNTHESIZED_UPGRADE_RETRIES {
                continue;
            }
            let slot = format!("e2e-aws-upgrade-{}.{}.{}", v.major, v.minor, v.patch);
            let job = format!("e2e-aws-upgrade-{}.{}", v.major, v.minor);
            let test = ReleaseTest {
                verification: crate::config::ReleaseVerification {
                    optional: true,
                    upgrade: true,
                    max_retries: SYNTHESIZED_UPGRADE_RETRIES,
                    prow_job: Some(JobReference { name: job }),
                    ..Default::default()
                },
                upgrade_tag: Some(stable_tag.name.clone()),
                upgrade_ref: Some(stable_release.release.target.pull_spec(&stable_tag.name)),
                retry_strategy: RetryStrategy::TillMaxRetries,
            };
            let source = UpgradeSource {
                tag: stable_tag.name.clone(),
                pull_spec: stable_release.release.target.pull_spec(&stable_tag.name),
            };
            expanded.entry(slot).or_insert(ExpandedTest {
                test,
                source: Some(source),
                runnable: true,
            });
        }
    }

    Ok(expanded)
}

/// Expand the configured candidate tests, fanning upgrade slots out over
/// their resolved sources. Multiple sources (rally point) get one slot per
/// source named `<slot>-<fromTag>`.
async fn expand_candidate_tests(
    release: &Release,
    tag: &ReleaseTag,
    ctx: &Context,
) -> Result<BTreeMap<String, ExpandedTest>, Error> {
    let mut expanded = BTreeMap::new();
    let mut stable = None;

    for (name, test) in &release.config.candidate_tests {
        if test.verification.disabled {
            debug!(tag = %tag.name, slot = %name, "test step is disabled, ignoring");
            continue;
        }
        if test.verification.prow_job.is_none() {
            continue;
        }
        if !test.verification.upgrade {
            expanded.insert(
                name.clone(),
                ExpandedTest {
                    test: test.clone(),
                    source: None,
                    runnable: true,
                },
            );
            continue;
        }

        if stable.is_none() {
            stable = Some(ctx.stable.stable_releases().await?);
        }
        let index = stable.as_ref().expect("stable index fetched above");
        let sources =
            match upgrade_source(release, tag, name, test.verification.upgrade_from, index) {
                Ok(sources) => sources,
                Err(err) if err.is_terminal() => {
                    warn!(tag = %tag.name, slot = %name, error = %err, "skipping misconfigured slot");
                    ctx.events
                        .warning(&release.source, "ProwJobInvalid", &err.to_string());
                    continue;
                }
                Err(err) => return Err(err),
            };

        if sources.is_empty() {
            expanded.insert(
                name.clone(),
                ExpandedTest {
                    test: test.clone(),
                    source: None,
                    runnable: false,
                },
            );
            continue;
        }
        let fan_out = sources.len() > 1;
        for source in sources {
            let slot_name = if fan_out {
                format!("{name}-{}", source.tag)
            } else {
                name.clone()
            };
            let mut slot_test = test.clone();
            slot_test.upgrade_tag = Some(source.tag.clone());
            slot_test.upgrade_ref = Some(source.pull_spec.clone());
            expanded.insert(
                slot_name,
                ExpandedTest {
                    test: slot_test,
                    source: Some(source),
                    runnable: true,
                },
            );
        }
    }

    Ok(expanded)
}

/// Resolve the upgrade source for a configured additional test: an
/// explicit `upgradeTag`/`upgradeRef` wins, otherwise the policy resolver
/// picks one. `None` means the slot has no applicable source.
fn configured_upgrade_source(
    release: &Release,
    tag: &ReleaseTag,
    name: &str,
    test: &ReleaseTest,
    stable: &crate::upgrades::StableReleases,
) -> Result<Option<UpgradeSource>, Error> {
    if let (Some(from_tag), Some(from_ref)) = (&test.upgrade_tag, &test.upgrade_ref) {
        return Ok(Some(UpgradeSource {
            tag: from_tag.clone(),
            pull_spec: from_ref.clone(),
        }));
    }
    let mut sources = upgrade_source(release, tag, name, test.verification.upgrade_from, stable)?;
    if sources.is_empty() {
        return Ok(None);
    }
    Ok(Some(sources.remove(0)))
}

/// Record a synthetic success as attempt zero when the slot has none yet.
/// Returns true when the list changed.
fn record_synthetic_attempt(attempts: &mut Vec<JobStatus>, now: DateTime<Utc>) -> bool {
    if attempts.is_empty() {
        attempts.push(JobStatus::synthetic_success(now));
        return true;
    }
    false
}

fn merge_optional(current: &mut Option<Duration>, candidate: Option<Duration>) {
    if let Some(delay) = candidate {
        merge_delay(current, delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReleaseVerification, UpgradePolicy};
    use crate::controller::test_support::{
        accepted_tag, kept_tag, ready_tag, release_with_candidate_tests,
        release_with_additional_tests, stable_line, TestContext,
    };
    use crate::status::encode_status_annotation;

    fn test_slot(max_retries: u32, strategy: RetryStrategy) -> ReleaseTest {
        ReleaseTest {
            verification: ReleaseVerification {
                max_retries,
                prow_job: Some(JobReference {
                    name: "periodic-e2e".to_string(),
                }),
                ..Default::default()
            },
            retry_strategy: strategy,
            ..Default::default()
        }
    }

    fn terminal(state: JobState) -> JobStatus {
        JobStatus {
            state,
            url: Some("https://prow/1".to_string()),
            completion_time: Some(Utc::now() - chrono::Duration::minutes(30)),
            ..Default::default()
        }
    }

    fn tag_with_attempts(name: &str, slot: &str, attempts: Vec<JobStatus>) -> ReleaseTag {
        let mut status = TestStatusMap::new();
        status.insert(slot.to_string(), attempts);
        let mut tag = ready_tag(name);
        tag.annotations.insert(
            ANNOTATION_ADDITIONAL_TESTS.to_string(),
            encode_status_annotation(&status).unwrap(),
        );
        tag
    }

    /// Story: under FirstSuccess a recorded success stops the slot cold;
    /// no further attempt is created even with retries remaining.
    #[tokio::test]
    async fn story_first_success_short_circuits() {
        let release =
            release_with_additional_tests(vec![("e2e", test_slot(3, RetryStrategy::FirstSuccess))]);
        let tag = tag_with_attempts(
            "4.5.3",
            "e2e",
            vec![terminal(JobState::Failed), terminal(JobState::Succeeded)],
        );

        let ctx = TestContext::expecting_no_jobs();
        let (status, delay) = ensure_additional_tests(&release, &tag, &ctx.context())
            .await
            .unwrap();

        assert_eq!(status["e2e"].len(), 2);
        assert_eq!(delay, None);
    }

    /// Story: under FirstFailure the first failure ends the slot.
    #[tokio::test]
    async fn story_first_failure_short_circuits() {
        let release =
            release_with_additional_tests(vec![("e2e", test_slot(3, RetryStrategy::FirstFailure))]);
        let tag = tag_with_attempts(
            "4.5.3",
            "e2e",
            vec![terminal(JobState::Succeeded), terminal(JobState::Failed)],
        );

        let ctx = TestContext::expecting_no_jobs();
        let (status, delay) = ensure_additional_tests(&release, &tag, &ctx.context())
            .await
            .unwrap();
        assert_eq!(status["e2e"].len(), 2);
        assert_eq!(delay, None);
    }

    /// Story: TillMaxRetries keeps creating attempts at the next index
    /// until every one of them has run.
    #[tokio::test]
    async fn story_till_max_retries_runs_every_attempt() {
        let release = release_with_additional_tests(vec![(
            "e2e",
            test_slot(2, RetryStrategy::TillMaxRetries),
        )]);
        let tag = tag_with_attempts(
            "4.5.3",
            "e2e",
            vec![terminal(JobState::Succeeded), terminal(JobState::Failed)],
        );

        let ctx = TestContext::recording_jobs(JobState::Pending);
        let (status, _) = ensure_additional_tests(&release, &tag, &ctx.context())
            .await
            .unwrap();

        assert_eq!(ctx.ensured_attempts(), vec!["e2e-2".to_string()]);
        assert_eq!(status["e2e"].len(), 3);
        assert_eq!(status["e2e"][2].state, JobState::Pending);
    }

    /// Story: a pending attempt is re-read in place rather than spawning a
    /// new index; the list length is unchanged when it stays pending.
    #[tokio::test]
    async fn story_pending_attempt_is_reread_in_place() {
        let release =
            release_with_additional_tests(vec![("e2e", test_slot(2, RetryStrategy::FirstSuccess))]);
        let tag = tag_with_attempts(
            "4.5.3",
            "e2e",
            vec![terminal(JobState::Failed), JobStatus::default()],
        );

        let ctx = TestContext::recording_jobs(JobState::Succeeded);
        let (status, delay) = ensure_additional_tests(&release, &tag, &ctx.context())
            .await
            .unwrap();

        assert_eq!(ctx.ensured_attempts(), vec!["e2e-1".to_string()]);
        assert_eq!(status["e2e"].len(), 2);
        assert_eq!(status["e2e"][1].state, JobState::Succeeded);
        assert_eq!(delay, None);
    }

    /// Story: attempts never exceed maxRetries + 1 even across repeated
    /// reconciles (bounded attempts invariant).
    #[tokio::test]
    async fn story_attempts_are_bounded() {
        let release = release_with_additional_tests(vec![(
            "e2e",
            test_slot(1, RetryStrategy::TillMaxRetries),
        )]);
        let tag = tag_with_attempts(
            "4.5.3",
            "e2e",
            vec![terminal(JobState::Failed), terminal(JobState::Failed)],
        );

        let ctx = TestContext::expecting_no_jobs();
        let (status, delay) = ensure_additional_tests(&release, &tag, &ctx.context())
            .await
            .unwrap();
        assert_eq!(status["e2e"].len(), 2);
        assert_eq!(delay, None);
    }

    /// Story: a failed attempt with retries left schedules a backoff from
    /// the consecutive-failure count, not the attempt index.
    #[tokio::test]
    async fn story_consecutive_failures_drive_the_backoff() {
        let release = release_with_additional_tests(vec![(
            "e2e",
            test_slot(3, RetryStrategy::TillMaxRetries),
        )]);
        // Success resets the consecutive count; one fresh failure follows.
        let tag = tag_with_attempts(
            "4.5.3",
            "e2e",
            vec![
                terminal(JobState::Failed),
                terminal(JobState::Succeeded),
                JobStatus::default(),
            ],
        );

        let ctx = TestContext::recording_jobs_with_completion(JobState::Failed, Utc::now());
        let (_, delay) = ensure_additional_tests(&release, &tag, &ctx.context())
            .await
            .unwrap();

        // One consecutive failure: the first-retry delay of one minute.
        let delay = delay.expect("retry delay");
        assert!(delay <= Duration::from_secs(60), "delay was {delay:?}");
        assert!(delay > Duration::from_secs(50), "delay was {delay:?}");
    }

    /// Story: an unrecognized persisted state abandons the slot for this
    /// reconcile without touching it.
    #[tokio::test]
    async fn story_unrecognized_state_abandons_the_slot() {
        let release =
            release_with_additional_tests(vec![("e2e", test_slot(2, RetryStrategy::FirstSuccess))]);
        let mut tag = ready_tag("4.5.3");
        tag.annotations.insert(
            ANNOTATION_ADDITIONAL_TESTS.to_string(),
            r#"{"e2e":[{"state":"Paused"}]}"#.to_string(),
        );

        let ctx = TestContext::expecting_no_jobs();
        let (status, delay) = ensure_additional_tests(&release, &tag, &ctx.context())
            .await
            .unwrap();
        assert_eq!(status["e2e"][0].state, JobState::Unknown);
        assert_eq!(delay, None);
    }

    /// Story: stable accepted tags in the candidate's minor line that have
    /// not yet been upgrade-tested synthesize e2e-aws-upgrade slots.
    #[tokio::test]
    async fn story_dynamic_upgrade_slots_are_synthesized() {
        let release = release_with_additional_tests(vec![]);
        let tag = ready_tag("4.5.13");

        let ctx = TestContext::recording_jobs(JobState::Pending)
            .with_stable(stable_line("4.5", &["4.5.12", "4.5.11"]));
        let (status, _) = ensure_additional_tests(&release, &tag, &ctx.context())
            .await
            .unwrap();

        let mut slots: Vec<&str> = status.keys().map(String::as_str).collect();
        slots.sort();
        assert_eq!(slots, vec!["e2e-aws-upgrade-4.5.11", "e2e-aws-upgrade-4.5.12"]);
        // The synthesized slots upgrade from the stable tags.
        let mut from_tags = ctx.ensured_upgrade_tags();
        from_tags.sort();
        assert_eq!(
            from_tags,
            vec![Some("4.5.11".to_string()), Some("4.5.12".to_string())]
        );
    }

    /// Story: once the upgrade graph records enough attempts from a stable
    /// tag, no further slot is synthesized for it.
    #[tokio::test]
    async fn story_covered_upgrades_are_not_resynthesized() {
        let release = release_with_additional_tests(vec![]);
        let tag = ready_tag("4.5.13");

        let ctx = TestContext::recording_jobs(JobState::Pending)
            .with_stable(stable_line("4.5", &["4.5.12"]));
        for _ in 0..SYNTHESIZED_UPGRADE_RETRIES {
            ctx.graph().add(
                "4.5.12",
                "4.5.13",
                UpgradeResult {
                    state: JobState::Succeeded,
                    url: None,
                },
            );
        }

        let (status, _) = ensure_additional_tests(&release, &tag, &ctx.context())
            .await
            .unwrap();
        assert!(status.is_empty());
        assert!(ctx.ensured_attempts().is_empty());
    }

    /// Story: rally-point candidate tests fan out to one slot per source,
    /// named `<slot>-<fromTag>`.
    #[tokio::test]
    async fn story_rally_point_fans_out_candidate_slots() {
        let mut slot = test_slot(0, RetryStrategy::FirstSuccess);
        slot.verification.upgrade = true;
        slot.verification.upgrade_from = Some(UpgradePolicy::RallyPoint);
        let release = release_with_candidate_tests(vec![("slot", slot)]);
        let tag = kept_tag("4.5.3");

        let ctx = TestContext::recording_jobs(JobState::Pending)
            .with_stable(stable_line("4.5", &["4.5.12", "4.5.11", "4.5.10", "4.5.9"]));
        let (status, _) = ensure_candidate_tests(&release, &tag, &ctx.context())
            .await
            .unwrap();

        let mut slots: Vec<&str> = status.keys().map(String::as_str).collect();
        slots.sort();
        // 4.5.10 is the rally point; 4.5.9 gets no slot.
        assert_eq!(slots, vec!["slot-4.5.10", "slot-4.5.11", "slot-4.5.12"]);
    }

    /// Story: a single-source candidate upgrade keeps its configured name.
    #[tokio::test]
    async fn story_single_source_keeps_the_slot_name() {
        let mut slot = test_slot(0, RetryStrategy::FirstSuccess);
        slot.verification.upgrade = true;
        slot.verification.upgrade_from = Some(UpgradePolicy::PreviousPatch);
        let release = release_with_candidate_tests(vec![("upgrade", slot)]);
        let tag = kept_tag("4.5.3");

        let ctx = TestContext::recording_jobs(JobState::Pending)
            .with_stable(stable_line("4.5", &["4.5.12", "4.5.11"]));
        let (status, _) = ensure_candidate_tests(&release, &tag, &ctx.context())
            .await
            .unwrap();

        let slots: Vec<&str> = status.keys().map(String::as_str).collect();
        assert_eq!(slots, vec!["upgrade"]);
    }

    /// Story: a candidate upgrade with no source records a synthetic
    /// success and the transition time is set once.
    #[tokio::test]
    async fn story_candidate_without_sources_records_synthetic_success() {
        let mut slot = test_slot(1, RetryStrategy::FirstSuccess);
        slot.verification.upgrade = true;
        slot.verification.upgrade_from = Some(UpgradePolicy::PreviousPatch);
        let release = release_with_candidate_tests(vec![("upgrade", slot)]);
        let tag = kept_tag("4.5.3");

        let ctx = TestContext::expecting_no_jobs();
        let (status, delay) = ensure_candidate_tests(&release, &tag, &ctx.context())
            .await
            .unwrap();

        let entry = &status["upgrade"];
        assert_eq!(entry.status.len(), 1);
        assert_eq!(entry.status[0].state, JobState::Succeeded);
        assert_eq!(
            entry.status[0].message.as_deref(),
            Some("Job was not defined or does not have any inputs")
        );
        assert!(entry.transition_time.is_some());
        assert_eq!(delay, None);

        // Second reconcile leaves the synthetic attempt untouched.
        let mut tag2 = kept_tag("4.5.3");
        tag2.annotations.insert(
            ANNOTATION_CANDIDATE_TESTS.to_string(),
            encode_status_annotation(&status).unwrap(),
        );
        let ctx2 = TestContext::expecting_no_jobs();
        let (status2, _) = ensure_candidate_tests(&release, &tag2, &ctx2.context())
            .await
            .unwrap();
        assert_eq!(status2, status);
    }

    /// Story: an unknown retry strategy skips the slot with a warning
    /// event instead of failing the reconcile.
    #[tokio::test]
    async fn story_unknown_strategy_skips_with_event() {
        let release = release_with_additional_tests(vec![(
            "bad",
            test_slot(1, RetryStrategy::Unknown),
        )]);
        let tag = ready_tag("4.5.3");

        let ctx = TestContext::expecting_no_jobs();
        let (status, _) = ensure_additional_tests(&release, &tag, &ctx.context())
            .await
            .unwrap();
        assert!(status.is_empty());
        assert_eq!(ctx.warnings(), vec!["ProwJobInvalid".to_string()]);
    }

    /// Story: terminal attempts already recorded are bit-identical after
    /// another reconcile (monotonicity invariant).
    #[tokio::test]
    async fn story_terminal_attempts_are_never_rewritten() {
        let release = release_with_additional_tests(vec![(
            "e2e",
            test_slot(2, RetryStrategy::TillMaxRetries),
        )]);
        let first = terminal(JobState::Failed);
        let tag = tag_with_attempts("4.5.3", "e2e", vec![first.clone()]);

        let ctx = TestContext::recording_jobs(JobState::Pending);
        let (status, _) = ensure_additional_tests(&release, &tag, &ctx.context())
            .await
            .unwrap();

        assert_eq!(status["e2e"][0], first);
        assert_eq!(status["e2e"].len(), 2);
    }

    /// Story: terminal upgrade outcomes feed the upgrade graph exactly
    /// once per attempt.
    #[tokio::test]
    async fn story_terminal_upgrades_feed_the_graph() {
        let mut slot = test_slot(0, RetryStrategy::FirstSuccess);
        slot.verification.upgrade = true;
        slot.upgrade_tag = Some("4.5.2".to_string());
        slot.upgrade_ref = Some("registry.ci/ocp/release:4.5.2".to_string());
        let release = release_with_additional_tests(vec![("upgrade", slot)]);
        let tag = ready_tag("4.5.3");

        let ctx = TestContext::recording_jobs_with_completion(JobState::Succeeded, Utc::now());
        ensure_additional_tests(&release, &tag, &ctx.context())
            .await
            .unwrap();

        let histories = ctx.graph().upgrades_to("4.5.3");
        assert_eq!(histories.len(), 1);
        assert_eq!(histories[0].from, "4.5.2");
        assert_eq!(histories[0].success, 1);
        assert_eq!(histories[0].total, 1);
    }

    #[test]
    fn synthetic_attempt_is_recorded_once() {
        let now = Utc::now();
        let mut attempts = Vec::new();
        assert!(record_synthetic_attempt(&mut attempts, now));
        assert!(!record_synthetic_attempt(&mut attempts, now));
        assert_eq!(attempts.len(), 1);
    }

    #[test]
    fn accepted_tag_helper_produces_accepted_phase() {
        let tag = accepted_tag("4.5.2", "2024-01-02T00:00:00Z");
        assert_eq!(tag.phase(), Some(ReleasePhase::Accepted));
    }
}
