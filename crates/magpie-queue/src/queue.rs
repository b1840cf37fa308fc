use std::sync::Arc;

use chrono::Utc;

use magpie_types::{retry_backoff_ms, EnqueueOptions, JobData, JobRecord, JobState};

use crate::broker::{ready_score, Broker};
use crate::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Waiting or delayed job taken off the queue entirely.
    Removed,
    /// Active job flagged; the running workflow observes the flag at its
    /// next step boundary.
    CancelRequested,
    NotFound,
    AlreadyFinished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    Retried { delay_ms: u64 },
    Failed,
}

/// Persistent priority FIFO over a [`Broker`]. One instance per queue name;
/// clones share the broker handle.
#[derive(Clone)]
pub struct JobQueue {
    broker: Arc<dyn Broker>,
    name: String,
}

impl JobQueue {
    pub fn new(broker: Arc<dyn Broker>, name: impl Into<String>) -> Self {
        Self {
            broker,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn enqueue(
        &self,
        job_id: &str,
        data: JobData,
        opts: EnqueueOptions,
    ) -> anyhow::Result<JobRecord> {
        let record = JobRecord {
            id: job_id.to_string(),
            data,
            state: JobState::Waiting,
            attempts: 0,
            max_attempts: opts.attempts.max(1),
            backoff_base_ms: opts.backoff_base_ms,
            progress: 0,
            phase: None,
            timeout_ms: opts.timeout_ms,
            priority: opts.priority,
            enqueued_at: Utc::now(),
            last_error: None,
        };
        self.broker.put_record(&self.name, &record).await?;
        self.broker
            .push_ready(&self.name, job_id, ready_score(opts.priority, now_ms()))
            .await?;
        tracing::debug!(job_id, queue = %self.name, "job enqueued");
        Ok(record)
    }

    pub async fn get_job(&self, job_id: &str) -> anyhow::Result<Option<JobRecord>> {
        self.broker.get_record(&self.name, job_id).await
    }

    /// Claim the next ready job: mark it active, bump the attempt counter
    /// and take a lease for the job's visibility timeout.
    pub async fn claim_next(&self) -> anyhow::Result<Option<JobRecord>> {
        let Some(job_id) = self.broker.pop_ready(&self.name).await? else {
            return Ok(None);
        };
        let Some(mut record) = self.broker.get_record(&self.name, &job_id).await? else {
            tracing::warn!(job_id, "ready entry without a job record, dropping");
            return Ok(None);
        };
        record.state = JobState::Active;
        record.attempts += 1;
        self.broker.put_record(&self.name, &record).await?;
        self.broker
            .set_lease(&self.name, &job_id, now_ms() + record.timeout_ms)
            .await?;
        Ok(Some(record))
    }

    pub async fn complete(&self, job_id: &str) -> anyhow::Result<()> {
        if let Some(mut record) = self.broker.get_record(&self.name, job_id).await? {
            record.state = JobState::Completed;
            record.progress = 100;
            self.broker.put_record(&self.name, &record).await?;
        }
        self.broker.clear_lease(&self.name, job_id).await?;
        self.broker.clear_cancel_flag(&self.name, job_id).await?;
        Ok(())
    }

    /// Record a failed attempt; re-queue with backoff while attempts
    /// remain, otherwise park the job as failed.
    pub async fn fail(&self, job_id: &str, error: &str) -> anyhow::Result<FailOutcome> {
        self.broker.clear_lease(&self.name, job_id).await?;
        let Some(mut record) = self.broker.get_record(&self.name, job_id).await? else {
            return Ok(FailOutcome::Failed);
        };
        record.last_error = Some(error.to_string());
        if record.attempts >= record.max_attempts {
            record.state = JobState::Failed;
            self.broker.put_record(&self.name, &record).await?;
            tracing::warn!(job_id, attempts = record.attempts, "job failed permanently");
            return Ok(FailOutcome::Failed);
        }
        let delay_ms = retry_backoff_ms(record.backoff_base_ms, record.attempts);
        record.state = JobState::Delayed;
        self.broker.put_record(&self.name, &record).await?;
        self.broker
            .push_delayed(&self.name, job_id, now_ms() + delay_ms)
            .await?;
        tracing::info!(job_id, delay_ms, attempts = record.attempts, "job retry scheduled");
        Ok(FailOutcome::Retried { delay_ms })
    }

    pub async fn report_progress(
        &self,
        job_id: &str,
        percent: u8,
        phase: &str,
    ) -> anyhow::Result<()> {
        if let Some(mut record) = self.broker.get_record(&self.name, job_id).await? {
            record.progress = percent.min(100);
            record.phase = Some(phase.to_string());
            self.broker.put_record(&self.name, &record).await?;
        }
        Ok(())
    }

    /// Remove a waiting/delayed job outright; flag an active one for
    /// cooperative cancellation.
    pub async fn remove_job(&self, job_id: &str) -> anyhow::Result<RemoveOutcome> {
        if self.broker.remove_ready(&self.name, job_id).await?
            || self.broker.remove_delayed(&self.name, job_id).await?
        {
            self.broker.delete_job(&self.name, job_id).await?;
            return Ok(RemoveOutcome::Removed);
        }
        match self.broker.get_record(&self.name, job_id).await? {
            Some(record) if record.state == JobState::Active => {
                self.broker.set_cancel_flag(&self.name, job_id).await?;
                Ok(RemoveOutcome::CancelRequested)
            }
            Some(_) => Ok(RemoveOutcome::AlreadyFinished),
            None => Ok(RemoveOutcome::NotFound),
        }
    }

    pub async fn cancel_requested(&self, job_id: &str) -> anyhow::Result<bool> {
        self.broker.cancel_requested(&self.name, job_id).await
    }

    /// Queue maintenance: promote due delayed jobs and reclaim expired
    /// leases back into the ready set. Workers call this on every poll; it
    /// is safe to run concurrently.
    pub async fn recover(&self) -> anyhow::Result<()> {
        let now = now_ms();
        for job_id in self.broker.take_due_delayed(&self.name, now).await? {
            if let Some(mut record) = self.broker.get_record(&self.name, &job_id).await? {
                record.state = JobState::Waiting;
                self.broker.put_record(&self.name, &record).await?;
                self.broker
                    .push_ready(&self.name, &job_id, ready_score(record.priority, now))
                    .await?;
            }
        }
        for job_id in self.broker.take_expired_leases(&self.name, now).await? {
            if let Some(mut record) = self.broker.get_record(&self.name, &job_id).await? {
                if record.state != JobState::Active {
                    continue;
                }
                tracing::warn!(job_id, "lease expired, requeueing job");
                record.state = JobState::Waiting;
                self.broker.put_record(&self.name, &record).await?;
                self.broker
                    .push_ready(&self.name, &job_id, ready_score(record.priority, now))
                    .await?;
            }
        }
        Ok(())
    }
}
