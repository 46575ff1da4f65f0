//! Async image-generation jobs: submit now, bill on completion.

pub mod client;
pub mod model;
pub mod store;

use crate::billing::{BillingContext, BillingManager};
use crate::error::GatewayError;
use crate::providers::ProviderStore;
use crate::selector::ProviderSelector;
use chrono::Utc;
use client::{MjClient, UpstreamTask};
use model::{Job, JobAction, JobStatus, JobSubmission, parse_custom_id};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use store::JobStore;
use tokio::sync::{Mutex, mpsc};

#[derive(Debug, Clone)]
pub struct JobEngineConfig {
    pub workers: usize,
    pub queue_size: usize,
    pub poll_interval: Duration,
    pub max_poll_attempts: i64,
    /// Model slug used for provider selection and pricing.
    pub model: String,
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            queue_size: 1000,
            poll_interval: Duration::from_millis(5000),
            max_poll_attempts: 60,
            model: "midjourney".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct JobEngine {
    store: JobStore,
    selector: ProviderSelector,
    providers: ProviderStore,
    client: MjClient,
    billing: BillingManager,
    config: Arc<JobEngineConfig>,
    queue: mpsc::Sender<String>,
    receiver: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl JobEngine {
    pub fn new(
        store: JobStore,
        selector: ProviderSelector,
        providers: ProviderStore,
        client: MjClient,
        billing: BillingManager,
        config: JobEngineConfig,
    ) -> Self {
        let (queue, receiver) = mpsc::channel(config.queue_size.max(1));
        Self {
            store,
            selector,
            providers,
            client,
            billing,
            config: Arc::new(config),
            queue,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn new_job_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Spawns the workers and the poller, then re-enqueues jobs that were
    /// still waiting when the process last stopped.
    pub async fn start(&self) {
        if self.config.workers == 0 {
            tracing::info!("job workers disabled");
            return;
        }
        for worker_id in 0..self.config.workers {
            let engine = self.clone();
            tokio::spawn(async move {
                loop {
                    let next = {
                        let mut guard = engine.receiver.lock().await;
                        guard.recv().await
                    };
                    let Some(job_id) = next else {
                        break;
                    };
                    tracing::debug!(worker_id, job_id = %job_id, "job picked up");
                    engine.process_job(&job_id).await;
                }
            });
        }

        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.poll_interval);
            loop {
                ticker.tick().await;
                engine.poll_once().await;
            }
        });

        match self.store.list_by_status(JobStatus::PendingQueue).await {
            Ok(pending) => {
                if !pending.is_empty() {
                    tracing::info!(count = pending.len(), "re-enqueueing pending jobs");
                }
                for job in pending {
                    self.enqueue(&job.job_id).await;
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to load pending jobs"),
        }
    }

    /// Stores the job, records its pending usage log and queues it. The job
    /// id is the billing context's request id.
    pub async fn submit(
        &self,
        mut ctx: BillingContext,
        submission: JobSubmission,
    ) -> Result<Job, GatewayError> {
        if submission.action == JobAction::Action {
            self.validate_parent(&ctx.user_id, &submission).await?;
        }
        let job = self
            .store
            .insert(&ctx.request_id, &ctx.user_id, &ctx.api_key_id, &submission)
            .await
            .map_err(GatewayError::Storage)?;

        ctx.finish(200, true, None);
        if let Err(err) = self.billing.record_async_submission(&mut ctx).await {
            tracing::error!(job_id = %job.job_id, error = %err.message, "failed to record job usage log");
            if let Err(store_err) = self
                .store
                .complete_failure(&job.job_id, "billing unavailable")
                .await
            {
                tracing::error!(job_id = %job.job_id, error = %store_err, "failed to mark unbilled job failed");
            }
            return Err(GatewayError::Storage(err.message));
        }

        metrics::counter!("relaymeter_jobs_total", "status" => JobStatus::PendingQueue.as_str())
            .increment(1);
        tracing::info!(
            job_id = %job.job_id,
            action = job.action.as_str(),
            user_id = %job.user_id,
            "job submitted"
        );
        self.enqueue(&job.job_id).await;
        Ok(job)
    }

    async fn validate_parent(
        &self,
        user_id: &str,
        submission: &JobSubmission,
    ) -> Result<(), GatewayError> {
        let parent_id = submission.parent_job_id.as_deref().unwrap_or_default();
        let parent = self
            .store
            .get(parent_id)
            .await
            .map_err(GatewayError::Storage)?
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| GatewayError::JobNotFound(parent_id.to_string()))?;
        if parent.status != JobStatus::Success || parent.upstream_task_id.is_none() {
            return Err(GatewayError::validation(
                "PARENT_NOT_READY",
                "the parent job has not finished successfully",
            ));
        }
        let custom_id = submission.custom_id.as_deref().unwrap_or_default();
        if parse_custom_id(custom_id).is_none() {
            return Err(GatewayError::validation("INVALID_CUSTOM_ID", "unknown customId"));
        }
        Ok(())
    }

    async fn enqueue(&self, job_id: &str) {
        if let Err(err) = self.queue.try_send(job_id.to_string()) {
            tracing::error!(job_id = %job_id, error = %err, "job queue rejected job");
            self.fail(job_id, "Job queue is full").await;
        }
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>, GatewayError> {
        self.store.get(job_id).await.map_err(GatewayError::Storage)
    }

    pub async fn cancel(&self, user_id: &str, job_id: &str) -> Result<Job, GatewayError> {
        let job = self
            .get(job_id)
            .await?
            .filter(|j| j.user_id == user_id)
            .ok_or_else(|| GatewayError::JobNotFound(job_id.to_string()))?;
        if job.status.is_terminal() {
            return Err(GatewayError::JobAlreadyTerminal(job_id.to_string()));
        }
        if !self.fail(job_id, "Cancelled by user").await {
            return Err(GatewayError::JobAlreadyTerminal(job_id.to_string()));
        }
        self.get(job_id)
            .await?
            .ok_or_else(|| GatewayError::JobNotFound(job_id.to_string()))
    }

    /// Applies an upstream notification. Unknown task ids are ignored;
    /// notifications for finished jobs re-run the idempotent settlement.
    /// `secret` must equal the credential of the provider running the job.
    pub async fn handle_callback(
        &self,
        payload: &Value,
        secret: Option<&str>,
    ) -> Result<Option<Job>, GatewayError> {
        let upstream_id = match payload.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(GatewayError::validation("MISSING_TASK_ID", "callback id is required")),
        };
        let Some(job) = self
            .store
            .get_by_upstream_task(&upstream_id)
            .await
            .map_err(GatewayError::Storage)?
        else {
            tracing::debug!(upstream_task_id = %upstream_id, "callback for unknown task");
            return Ok(None);
        };
        self.verify_callback_secret(&job, secret).await?;

        if job.status.is_terminal() {
            self.settle(&job.job_id, job.status == JobStatus::Success, job.error_message.as_deref())
                .await;
        } else {
            self.apply_upstream_task(&job, &client::parse_task(payload))
                .await;
        }
        self.get(&job.job_id).await
    }

    async fn verify_callback_secret(
        &self,
        job: &Job,
        secret: Option<&str>,
    ) -> Result<(), GatewayError> {
        let expected = match job.provider_id.as_deref() {
            Some(provider_id) => self
                .providers
                .get_provider(provider_id)
                .await
                .map_err(GatewayError::Storage)?
                .and_then(|provider| provider.credential),
            None => None,
        };
        match (expected.as_deref(), secret) {
            (Some(expected), Some(provided)) if !expected.is_empty() && expected == provided => Ok(()),
            _ => {
                tracing::warn!(job_id = %job.job_id, "callback rejected: secret mismatch");
                Err(GatewayError::CallbackUnauthorized)
            }
        }
    }

    /// Submits one queued job upstream.
    pub async fn process_job(&self, job_id: &str) {
        let job = match self.store.get(job_id).await {
            Ok(Some(job)) if job.status == JobStatus::PendingQueue => job,
            Ok(_) => return,
            Err(err) => {
                tracing::warn!(job_id = %job_id, error = %err, "failed to load job");
                return;
            }
        };

        let candidate = match self.selector.select(&self.config.model).await {
            Ok(candidate) => candidate,
            Err(err) => {
                self.fail(job_id, &format!("No available provider: {err}")).await;
                return;
            }
        };

        let body = match self.upstream_body(&job).await {
            Ok(body) => body,
            Err(reason) => {
                self.fail(job_id, &reason).await;
                return;
            }
        };

        match self
            .client
            .submit(&candidate.provider, job.action.submit_path(), &body)
            .await
        {
            Ok(upstream_task_id) => {
                match self
                    .store
                    .mark_on_queue(job_id, &upstream_task_id, &candidate.provider.id)
                    .await
                {
                    Ok(true) => {
                        metrics::counter!("relaymeter_jobs_total", "status" => JobStatus::OnQueue.as_str())
                            .increment(1);
                        tracing::info!(
                            job_id = %job_id,
                            upstream_task_id = %upstream_task_id,
                            provider = %candidate.provider.slug,
                            "job accepted upstream"
                        );
                    }
                    Ok(false) => {
                        tracing::debug!(job_id = %job_id, "job left pending_queue before submission finished");
                    }
                    Err(err) => {
                        tracing::error!(job_id = %job_id, error = %err, "failed to store upstream task id");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(job_id = %job_id, error = %err.message, "upstream submission failed");
                self.fail(job_id, &format!("Upstream submission failed: {}", err.message))
                    .await;
            }
        }
    }

    async fn upstream_body(&self, job: &Job) -> Result<Value, String> {
        let mut body = match &job.request_params {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        body.remove("notifyHook");
        if job.action != JobAction::Action {
            return Ok(Value::Object(body));
        }

        let parent_id = job.parent_job_id.as_deref().unwrap_or_default();
        let parent = self
            .store
            .get(parent_id)
            .await?
            .ok_or_else(|| "Parent job not found".to_string())?;
        let parent_task = parent
            .upstream_task_id
            .clone()
            .ok_or_else(|| "Parent job has no upstream task".to_string())?;
        let custom_id = body
            .get("customId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let upstream_custom_id = translate_custom_id(&custom_id, &parent.buttons, &parent_task)
            .ok_or_else(|| "Unknown customId".to_string())?;
        Ok(json!({
            "taskId": parent_task,
            "customId": upstream_custom_id,
        }))
    }

    /// One pass over running jobs plus the expiry sweep.
    pub async fn poll_once(&self) {
        let running = match self.store.list_by_status(JobStatus::OnQueue).await {
            Ok(jobs) => jobs,
            Err(err) => {
                tracing::warn!(error = %err, "failed to list running jobs");
                return;
            }
        };
        for job in running {
            self.poll_job(&job).await;
        }

        match self.store.list_expired(Utc::now()).await {
            Ok(expired) => {
                for job in expired {
                    tracing::info!(job_id = %job.job_id, "job expired");
                    self.fail(&job.job_id, "Job timeout").await;
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to list expired jobs"),
        }
    }

    async fn poll_job(&self, job: &Job) {
        let (Some(provider_id), Some(upstream_id)) =
            (job.provider_id.as_deref(), job.upstream_task_id.as_deref())
        else {
            return;
        };
        let attempts = match self.store.increment_poll_attempts(&job.job_id).await {
            Ok(attempts) => attempts,
            Err(err) => {
                tracing::warn!(job_id = %job.job_id, error = %err, "failed to count poll attempt");
                return;
            }
        };

        let provider = match self.providers.get_provider(provider_id).await {
            Ok(Some(provider)) => provider,
            Ok(None) => {
                self.fail(&job.job_id, "Provider no longer exists").await;
                return;
            }
            Err(err) => {
                tracing::warn!(job_id = %job.job_id, error = %err, "failed to load job provider");
                return;
            }
        };

        match self.client.fetch(&provider, upstream_id).await {
            Ok(task) => {
                if self.apply_upstream_task(job, &task).await {
                    return;
                }
            }
            Err(err) => {
                tracing::warn!(
                    job_id = %job.job_id,
                    attempt = attempts,
                    error = %err.message,
                    "upstream fetch failed; retrying"
                );
            }
        }

        if attempts >= self.config.max_poll_attempts {
            self.fail(&job.job_id, "Polling attempts exhausted").await;
        }
    }

    /// Returns true when the task reached a terminal state.
    async fn apply_upstream_task(&self, job: &Job, task: &UpstreamTask) -> bool {
        match task.status.as_str() {
            "SUCCESS" => {
                match self
                    .store
                    .complete_success(&job.job_id, task.image_url.as_deref(), &task.buttons)
                    .await
                {
                    Ok(true) => {
                        metrics::counter!("relaymeter_jobs_total", "status" => JobStatus::Success.as_str())
                            .increment(1);
                        tracing::info!(job_id = %job.job_id, "job succeeded");
                        self.settle(&job.job_id, true, None).await;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::error!(job_id = %job.job_id, error = %err, "failed to store job result");
                        return false;
                    }
                }
                true
            }
            "FAILED" | "FAILURE" => {
                let reason = task.fail_reason.as_deref().unwrap_or("Unknown failure");
                self.fail(&job.job_id, reason).await;
                true
            }
            _ => {
                if let Some(progress) = task.progress {
                    if let Err(err) = self.store.update_progress(&job.job_id, progress).await {
                        tracing::warn!(job_id = %job.job_id, error = %err, "failed to update progress");
                    }
                }
                false
            }
        }
    }

    /// Moves a non-terminal job to `failed` and settles billing. Returns
    /// false when the job was already terminal.
    async fn fail(&self, job_id: &str, reason: &str) -> bool {
        match self.store.complete_failure(job_id, reason).await {
            Ok(true) => {
                metrics::counter!("relaymeter_jobs_total", "status" => JobStatus::Failed.as_str())
                    .increment(1);
                tracing::info!(job_id = %job_id, reason = %reason, "job failed");
                self.settle(job_id, false, Some(reason)).await;
                true
            }
            Ok(false) => false,
            Err(err) => {
                tracing::error!(job_id = %job_id, error = %err, "failed to mark job failed");
                false
            }
        }
    }

    async fn settle(&self, job_id: &str, success: bool, reason: Option<&str>) {
        if let Err(err) = self
            .billing
            .process_async_completion(job_id, success, reason)
            .await
        {
            tracing::error!(
                job_id = %job_id,
                success,
                error = %err.message,
                "job settlement failed; left for consistency repair"
            );
        }
    }
}

/// Maps a gateway button id onto the parent's upstream button, falling back
/// to the same shape keyed by the upstream task id.
fn translate_custom_id(custom_id: &str, parent_buttons: &Value, parent_task: &str) -> Option<String> {
    let (kind, index) = parse_custom_id(custom_id)?;
    let label = match kind {
        "upsample" => format!("U{index}"),
        "variation" => format!("V{index}"),
        _ => return None,
    };
    let from_parent = parent_buttons.as_array().and_then(|buttons| {
        buttons.iter().find_map(|b| {
            (b.get("label").and_then(Value::as_str) == Some(label.as_str()))
                .then(|| b.get("customId").and_then(Value::as_str))
                .flatten()
                .map(str::to_string)
        })
    });
    Some(from_parent.unwrap_or_else(|| format!("MJ::JOB::{kind}::{index}::{parent_task}")))
}
