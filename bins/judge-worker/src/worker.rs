/// Job Worker Pool
///
/// **Responsibility:**
/// Drain the inbound queue with a fixed number of consumers, run each job
/// through the Pool Manager, publish exactly one result per job.
///
/// A job can fail; a consumer cannot. Job errors (including panics) become
/// `success: false` results, queue errors are logged and retried.
use crate::error::SandboxError;
use crate::manager::PoolManager;
use crate::queue::{JobSource, ResultSink};
use judge_common::types::{CodeExecutionJob, ExecutionResult, InboundJob, JobPayload, SubmissionType};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

const PUBLISH_ATTEMPTS: u32 = 3;
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct JobWorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop_tx: watch::Sender<bool>,
    manager: Arc<PoolManager>,
    results: Arc<dyn ResultSink>,
}

impl JobWorkerPool {
    /// Spawn one consumer per source
    pub fn start(
        manager: Arc<PoolManager>,
        sources: Vec<Box<dyn JobSource>>,
        results: Arc<dyn ResultSink>,
        pop_timeout: Duration,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);

        let handles = sources
            .into_iter()
            .enumerate()
            .map(|(worker_id, source)| {
                tokio::spawn(consumer_loop(
                    worker_id,
                    source,
                    Arc::clone(&manager),
                    Arc::clone(&results),
                    pop_timeout,
                    stop_rx.clone(),
                ))
            })
            .collect::<Vec<_>>();

        info!(workers = handles.len(), "Job workers started");

        Self {
            handles,
            stop_tx,
            manager,
            results,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop pulling jobs, let in-flight jobs finish (up to `grace`), then tear
    /// down the pools and the queue connections.
    pub async fn shutdown(self, grace: Duration) {
        let Self {
            handles,
            stop_tx,
            manager,
            results,
        } = self;

        let _ = stop_tx.send(true);
        info!("Stopped accepting jobs, waiting for in-flight work");

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, futures_util::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(grace_ms = grace.as_millis() as u64, "Workers still busy after grace period, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        info!("Consumers closed");

        manager.shutdown().await;

        drop(results);
        info!("Queue connections closed");
    }
}

async fn consumer_loop(
    worker_id: usize,
    mut source: Box<dyn JobSource>,
    manager: Arc<PoolManager>,
    results: Arc<dyn ResultSink>,
    pop_timeout: Duration,
    stop_rx: watch::Receiver<bool>,
) {
    debug!(worker_id, "Consumer started");

    while !*stop_rx.borrow() {
        match source.next_job(pop_timeout).await {
            Ok(Some(InboundJob::Job(job))) => {
                let result = run_job(Arc::clone(&manager), job).await;
                publish(results.as_ref(), &result).await;
            }
            Ok(Some(InboundJob::Malformed {
                id: Some(job_id),
                submission_type,
                error,
            })) => {
                warn!(worker_id, job_id = %job_id, error = %error, "Rejected malformed job");
                let result =
                    ExecutionResult::rejected(job_id, submission_type, format!("Invalid job: {}", error));
                publish(results.as_ref(), &result).await;
            }
            Ok(Some(InboundJob::Malformed { id: None, error, .. })) => {
                // Nothing to correlate a result with
                error!(worker_id, error = %error, "Dropped job without an id");
            }
            Ok(None) => {
                // Timeout - check for shutdown
                continue;
            }
            Err(e) => {
                error!(worker_id, error = %e, "Queue error");
                tokio::time::sleep(QUEUE_ERROR_BACKOFF).await;
            }
        }
    }

    debug!(worker_id, "Consumer stopped");
}

/// Execute one job in its own task so a panic only fails that job
async fn run_job(manager: Arc<PoolManager>, job: CodeExecutionJob) -> ExecutionResult {
    let job_id = job.id.clone();
    let submission_type = job.submission_type();

    match tokio::spawn(async move { dispatch(&manager, job).await }).await {
        Ok(result) => result,
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Job task crashed");
            ExecutionResult::failure(job_id, submission_type, "Internal error while executing job")
        }
    }
}

async fn publish(results: &dyn ResultSink, result: &ExecutionResult) {
    for attempt in 1..=PUBLISH_ATTEMPTS {
        match results.publish(result).await {
            Ok(()) => {
                debug!(job_id = %result.job_id, "Result published");
                return;
            }
            Err(e) => {
                error!(job_id = %result.job_id, attempt, error = %e, "Failed to publish result");
                if attempt < PUBLISH_ATTEMPTS {
                    tokio::time::sleep(QUEUE_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// Route a job to its language pool and turn the outcome into a result
#[instrument(skip(manager, job), fields(job_id = %job.id, language = %job.language, submission_type = %job.submission_type()))]
pub async fn dispatch(manager: &PoolManager, job: CodeExecutionJob) -> ExecutionResult {
    let submission_type = job.submission_type();

    let Some(pool) = manager.get_pool(&job.language) else {
        warn!("Rejected job for unsupported language");
        return ExecutionResult::failure(
            job.id,
            submission_type,
            SandboxError::UnsupportedLanguage(job.language).to_string(),
        );
    };

    info!(source_size = job.code.len(), "Received job");
    let started = Instant::now();

    let result = match job.payload {
        JobPayload::Run { input } => {
            let input = input.unwrap_or_default();
            match pool.process_run_code(&job.code, &input, job.timeout_ms).await {
                Ok(run) => ExecutionResult::success(
                    job.id,
                    SubmissionType::Run,
                    run.output,
                    run.execution_time_ms,
                ),
                Err(e) => ExecutionResult::failure(job.id, SubmissionType::Run, e.to_string()),
            }
        }
        JobPayload::Submit { test_cases } => {
            match pool
                .process_submit_code(&job.code, &test_cases, job.timeout_ms)
                .await
            {
                Ok(outcome) => match serde_json::to_string(&outcome) {
                    Ok(payload) => ExecutionResult::success(
                        job.id,
                        SubmissionType::Submit,
                        payload,
                        started.elapsed().as_millis() as u64,
                    ),
                    Err(e) => ExecutionResult::failure(
                        job.id,
                        SubmissionType::Submit,
                        format!("Failed to encode submission result: {}", e),
                    ),
                },
                Err(e) => ExecutionResult::failure(job.id, SubmissionType::Submit, e.to_string()),
            }
        }
    };

    info!(
        success = result.success,
        execution_ms = started.elapsed().as_millis() as u64,
        error = result.error.as_deref().unwrap_or(""),
        "Execution completed"
    );

    result
}
