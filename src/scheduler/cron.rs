//! `CronService`: three job types (`at`, `every`, `cron`) ticked on a
//! shared timer. Failures back off exponentially up to `max_retries`,
//! then the job is rescheduled fresh rather than disabled. State is
//! snapshotted to a JSON file after every tick so a restart resumes
//! rather than re-running everything due since the process died.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronJobType {
    At,
    Every,
    Cron,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub job_type: CronJobType,
    /// `at`: epoch milliseconds as a decimal string. `every`: a duration
    /// token (`Ns|Nm|Nh|Nd|Nms`). `cron`: a standard 5-field expression.
    pub expression: String,
    pub isolated: bool,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub running: bool,
}

pub enum TickOutcome {
    Succeeded,
    Failed(String),
}

pub struct CronService {
    jobs: Mutex<HashMap<String, CronJob>>,
    max_concurrent_runs: u32,
    snapshot_path: Option<PathBuf>,
}

impl CronService {
    pub fn new(max_concurrent_runs: u32) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            max_concurrent_runs,
            snapshot_path: None,
        }
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn add_job(&self, mut job: CronJob) -> Result<()> {
        if job.next_run_at.is_none() {
            job.next_run_at = match job.job_type {
                // `compute_next_run` always answers `None` for `At` — that's
                // the post-run "don't reschedule" case. The initial run time
                // comes from parsing the job's own epoch-ms expression.
                CronJobType::At => Some(parse_at_epoch_ms(&job.expression)?),
                _ => compute_next_run(&job, Utc::now())?,
            };
        }
        self.jobs.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(job.id.clone(), job);
        Ok(())
    }

    pub fn remove_job(&self, id: &str) {
        self.jobs.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(id);
    }

    pub fn job(&self, id: &str) -> Option<CronJob> {
        self.jobs.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get(id).cloned()
    }

    fn running_count(&self) -> u32 {
        self.jobs.lock().unwrap_or_else(std::sync::PoisonError::into_inner).values().filter(|j| j.running).count() as u32
    }

    /// Run every due job through `execute`, in id order for determinism.
    /// Jobs already `running`, not yet due, or blocked by the global
    /// concurrency cap are skipped for this tick.
    pub async fn tick<F, Fut>(&self, now: DateTime<Utc>, execute: F) -> Result<()>
    where
        F: Fn(CronJob) -> Fut,
        Fut: Future<Output = TickOutcome>,
    {
        let due_ids: Vec<String> = {
            let guard = self.jobs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut ids: Vec<String> = guard
                .values()
                .filter(|j| !j.running && j.next_run_at.map(|t| t <= now).unwrap_or(false))
                .map(|j| j.id.clone())
                .collect();
            ids.sort();
            ids
        };

        for id in due_ids {
            if self.running_count() >= self.max_concurrent_runs {
                break;
            }

            let job = {
                let mut guard = self.jobs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                let Some(job) = guard.get_mut(&id) else { continue };
                job.running = true;
                job.clone()
            };

            let outcome = execute(job.clone()).await;

            let mut guard = self.jobs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(stored) = guard.get_mut(&id) {
                stored.running = false;
                match outcome {
                    TickOutcome::Succeeded => {
                        stored.retries = 0;
                        stored.next_run_at = compute_next_run(stored, now)?;
                    }
                    TickOutcome::Failed(_) => {
                        stored.retries += 1;
                        if stored.retries > stored.max_retries {
                            stored.retries = 0;
                            stored.next_run_at = compute_next_run(stored, now)?;
                        } else {
                            let backoff = stored.backoff_ms.saturating_mul(1u64 << (stored.retries - 1).min(20));
                            stored.next_run_at = Some(now + chrono::Duration::milliseconds(backoff as i64));
                        }
                    }
                }
            }
        }

        self.persist_snapshot()?;
        Ok(())
    }

    fn persist_snapshot(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else { return Ok(()) };
        let guard = self.jobs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let jobs: Vec<&CronJob> = guard.values().collect();
        let body = serde_json::to_string_pretty(&jobs).map_err(|e| CoreError::Other(e.into()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Other(e.into()))?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, body).map_err(|e| CoreError::Other(e.into()))?;
        std::fs::rename(&tmp, path).map_err(|e| CoreError::Other(e.into()))?;
        Ok(())
    }

    pub fn load_snapshot(path: &Path) -> Result<Vec<CronJob>> {
        let Ok(contents) = std::fs::read_to_string(path) else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&contents).map_err(|e| CoreError::Other(e.into()))
    }
}

/// Parses an `at` job's epoch-millisecond expression into its one-shot
/// run time. Used only to establish the initial schedule in `add_job`;
/// `compute_next_run` is what runs after the job fires, and it clears
/// `next_run_at` for `At` jobs so they never run a second time.
fn parse_at_epoch_ms(expression: &str) -> Result<DateTime<Utc>> {
    let millis: i64 = expression
        .trim()
        .parse()
        .map_err(|_| CoreError::Other(anyhow::anyhow!("invalid at expression: {expression}")))?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| CoreError::Other(anyhow::anyhow!("at expression out of range: {expression}")))
}

/// The next scheduled run after a job has just executed. `At` jobs are
/// one-shot, so this always clears their `next_run_at` rather than
/// re-deriving it from the (now-stale) expression.
fn compute_next_run(job: &CronJob, from: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match job.job_type {
        CronJobType::At => Ok(None),
        CronJobType::Every => {
            let duration = parse_duration_token(&job.expression)?;
            Ok(Some(from + duration))
        }
        CronJobType::Cron => {
            let normalized = if job.expression.split_whitespace().count() == 5 {
                format!("0 {}", job.expression)
            } else {
                job.expression.clone()
            };
            let schedule = Schedule::from_str(&normalized)
                .map_err(|e| CoreError::Other(anyhow::anyhow!("invalid cron expression {}: {e}", job.expression)))?;
            Ok(schedule.after(&from).next())
        }
    }
}

/// Parses `Ns|Nm|Nh|Nd|Nms` duration tokens.
fn parse_duration_token(token: &str) -> Result<chrono::Duration> {
    let token = token.trim();
    let (number_part, unit) = if let Some(stripped) = token.strip_suffix("ms") {
        (stripped, "ms")
    } else {
        let split_at = token.len() - 1;
        (&token[..split_at], &token[split_at..])
    };
    let amount: i64 = number_part
        .parse()
        .map_err(|_| CoreError::Other(anyhow::anyhow!("invalid duration token: {token}")))?;
    match unit {
        "ms" => Ok(chrono::Duration::milliseconds(amount)),
        "s" => Ok(chrono::Duration::seconds(amount)),
        "m" => Ok(chrono::Duration::minutes(amount)),
        "h" => Ok(chrono::Duration::hours(amount)),
        "d" => Ok(chrono::Duration::days(amount)),
        other => Err(CoreError::Other(anyhow::anyhow!("unknown duration unit: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn every_job(id: &str, token: &str) -> CronJob {
        CronJob {
            id: id.to_string(),
            job_type: CronJobType::Every,
            expression: token.to_string(),
            isolated: false,
            max_retries: 2,
            backoff_ms: 100,
            next_run_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            retries: 0,
            running: false,
        }
    }

    #[test]
    fn parses_every_duration_tokens() {
        assert_eq!(parse_duration_token("500ms").unwrap(), chrono::Duration::milliseconds(500));
        assert_eq!(parse_duration_token("5m").unwrap(), chrono::Duration::minutes(5));
        assert_eq!(parse_duration_token("2h").unwrap(), chrono::Duration::hours(2));
    }

    #[tokio::test]
    async fn due_job_runs_and_reschedules_on_success() {
        let service = CronService::new(4);
        service.add_job(every_job("job-1", "1h")).unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        service
            .tick(Utc::now(), move |_job| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    TickOutcome::Succeeded
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let job = service.job("job-1").unwrap();
        assert!(!job.running);
        assert!(job.next_run_at.unwrap() > Utc::now());
        assert_eq!(job.retries, 0);
    }

    #[tokio::test]
    async fn failure_backs_off_exponentially_then_resets_after_max_retries() {
        let service = CronService::new(4);
        service.add_job(every_job("job-1", "1h")).unwrap();

        for _ in 0..2 {
            service.tick(Utc::now(), |_job| async { TickOutcome::Failed("boom".to_string()) }).await.unwrap();
            // force it due again for the next attempt in this test
            let mut jobs = service.jobs.lock().unwrap();
            jobs.get_mut("job-1").unwrap().next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }

        let job = service.job("job-1").unwrap();
        assert_eq!(job.retries, 2);

        // third failure exceeds max_retries(2): resets retries and reschedules fresh
        service.tick(Utc::now(), |_job| async { TickOutcome::Failed("boom".to_string()) }).await.unwrap();
        let job = service.job("job-1").unwrap();
        assert_eq!(job.retries, 0);
    }

    #[tokio::test]
    async fn concurrency_cap_defers_extra_due_jobs() {
        let service = CronService::new(1);
        service.add_job(every_job("job-1", "1h")).unwrap();
        service.add_job(every_job("job-2", "1h")).unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        service
            .tick(Utc::now(), move |_job| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    TickOutcome::Succeeded
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn at_job_has_no_next_run_after_compute() {
        let job = CronJob {
            id: "once".to_string(),
            job_type: CronJobType::At,
            expression: "0".to_string(),
            isolated: false,
            max_retries: 0,
            backoff_ms: 0,
            next_run_at: None,
            retries: 0,
            running: false,
        };
        assert_eq!(compute_next_run(&job, Utc::now()).unwrap(), None);
    }

    #[tokio::test]
    async fn at_job_runs_exactly_once_at_its_scheduled_epoch() {
        let service = CronService::new(4);
        let now = Utc::now();
        let target = now + chrono::Duration::milliseconds(10_000);
        service
            .add_job(CronJob {
                id: "once".to_string(),
                job_type: CronJobType::At,
                expression: target.timestamp_millis().to_string(),
                isolated: false,
                max_retries: 0,
                backoff_ms: 0,
                next_run_at: None,
                retries: 0,
                running: false,
            })
            .unwrap();

        let calls = Arc::new(AtomicU32::new(0));

        let run = |at: DateTime<Utc>, calls: Arc<AtomicU32>| {
            let service = &service;
            async move {
                service
                    .tick(at, move |_job| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            TickOutcome::Succeeded
                        }
                    })
                    .await
                    .unwrap();
            }
        };

        run(now + chrono::Duration::milliseconds(1_000), calls.clone()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0, "must not run before its scheduled time");

        run(now + chrono::Duration::milliseconds(10_000), calls.clone()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "must run once it's due");
        assert_eq!(service.job("once").unwrap().next_run_at, None, "a one-shot job clears next_run_at after firing");

        run(now + chrono::Duration::milliseconds(70_000), calls.clone()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "must never run a second time");
    }
}
