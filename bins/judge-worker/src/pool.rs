/// Language Container Pool
///
/// Keeps `poolSize` warm sandboxes for one language and runs exactly one
/// request at a time on each acquired sandbox.
///
/// **Sandbox states:** available → (acquire) → busy → (release) → available.
/// A sandbox whose exec timed out or failed at the engine level is destroyed
/// on release and replaced in the background, so the pool drifts back to
/// `poolSize` without the caller waiting on container creation.
///
/// **Bound:** a semaphore with `poolSize` permits gates `acquire`, so the pool
/// never holds more than `poolSize` sandboxes. Callers wait (up to the acquire
/// timeout) instead of overflowing.
use crate::config::LanguageConfig;
use crate::error::SandboxError;
use crate::evaluator::{aggregate_results, evaluate_case};
use crate::sandbox::{render_command, source_path, Sandbox, SandboxRuntime, SandboxSpec, INPUT_PATH};
use judge_common::types::{SubmissionOutcome, TestCase};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Safety limits to prevent pathological inputs from reaching the engine
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB

const CREATE_ATTEMPTS: usize = 3;
const RESET_TIMEOUT: Duration = Duration::from_secs(5);

/// Wipes what a job left behind: stray processes (everything but PID 1 and
/// the shell itself) and files in the work and temp dirs.
pub const RESET_COMMAND: &str =
    "kill -9 -1 2>/dev/null; rm -rf /app/* /app/.[!.]* /tmp/* 2>/dev/null; exit 0";

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub acquire_timeout: Duration,
    /// Pause between test cases of one submission
    pub case_settle_delay: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(30),
            case_settle_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub output: String,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub language: String,
    pub available: usize,
    pub busy: usize,
    pub capacity: usize,
}

#[derive(Default)]
struct PoolState {
    available: VecDeque<Sandbox>,
    busy: HashMap<String, Sandbox>,
    closed: bool,
}

/// A sandbox checked out of the pool. Hand it back with `LanguagePool::release`.
#[derive(Debug)]
pub struct SandboxLease {
    sandbox: Sandbox,
    permit: OwnedSemaphorePermit,
}

impl SandboxLease {
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }
}

/// Everything needed to build sandboxes, detached from the pool so a
/// replacement can run on its own task.
#[derive(Clone)]
struct Provisioner {
    language: String,
    spec: SandboxSpec,
    runtime: Arc<dyn SandboxRuntime>,
}

impl Provisioner {
    /// Create one sandbox, retrying transient creation failures
    async fn provision(&self) -> Result<Sandbox, SandboxError> {
        let mut last_error = None;
        for attempt in 1..=CREATE_ATTEMPTS {
            match self.runtime.create(&self.spec).await {
                Ok(sandbox) => {
                    debug!(language = %self.language, sandbox = %sandbox.name, "Sandbox provisioned");
                    return Ok(sandbox);
                }
                Err(e) => {
                    warn!(language = %self.language, attempt, error = %e, "Sandbox creation failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| SandboxError::Creation {
            image: self.spec.image.clone(),
            message: "no creation attempt made".to_string(),
        }))
    }

    /// Swap a tainted sandbox for a fresh one. The permit is held until the
    /// replacement is in the available set, so the pool bound holds.
    async fn replace(
        self,
        state: Arc<Mutex<PoolState>>,
        tainted: Sandbox,
        _permit: OwnedSemaphorePermit,
    ) {
        self.runtime.destroy(&tainted).await;

        if state.lock().await.closed {
            return;
        }

        debug!(language = %self.language, sandbox = %tainted.name, "Replacing tainted sandbox");
        match self.provision().await {
            Ok(fresh) => {
                let mut state = state.lock().await;
                if state.closed {
                    drop(state);
                    self.runtime.destroy(&fresh).await;
                } else {
                    state.available.push_back(fresh);
                }
            }
            Err(e) => {
                // The next acquire that finds the pool empty rebuilds it
                warn!(language = %self.language, error = %e, "Could not replace sandbox");
            }
        }
    }
}

pub struct LanguagePool {
    language: String,
    config: LanguageConfig,
    provisioner: Provisioner,
    runtime: Arc<dyn SandboxRuntime>,
    settings: PoolSettings,
    state: Arc<Mutex<PoolState>>,
    permits: Arc<Semaphore>,
    replacements: Mutex<JoinSet<()>>,
}

impl LanguagePool {
    pub fn new(
        language: impl Into<String>,
        config: LanguageConfig,
        runtime: Arc<dyn SandboxRuntime>,
        settings: PoolSettings,
    ) -> Self {
        let language = language.into();
        let spec = SandboxSpec {
            language: language.clone(),
            image: config.image.clone(),
            memory_limit_bytes: config.memory_limit_bytes(),
            nano_cpus: config.nano_cpus(),
        };
        let permits = Arc::new(Semaphore::new(config.pool_size));
        let provisioner = Provisioner {
            language: language.clone(),
            spec,
            runtime: Arc::clone(&runtime),
        };

        Self {
            language,
            config,
            provisioner,
            runtime,
            settings,
            state: Arc::new(Mutex::new(PoolState::default())),
            permits,
            replacements: Mutex::new(JoinSet::new()),
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// Pull the image if needed and warm the pool up to `poolSize`
    #[instrument(skip(self), fields(language = %self.language, pool_size = self.config.pool_size))]
    pub async fn initialize(&self) -> Result<(), SandboxError> {
        self.runtime.ensure_image(&self.config.image).await?;

        loop {
            let missing = {
                let state = self.state.lock().await;
                if state.closed {
                    return Err(SandboxError::PoolClosed(self.language.clone()));
                }
                self.config.pool_size.saturating_sub(state.available.len() + state.busy.len())
            };
            if missing == 0 {
                break;
            }

            let sandbox = self.provisioner.provision().await?;
            self.state.lock().await.available.push_back(sandbox);
        }

        info!(language = %self.language, image = %self.config.image, "Pool warmed up");
        Ok(())
    }

    /// Check a sandbox out, waiting for one to be released if all are busy
    pub async fn acquire(&self) -> Result<SandboxLease, SandboxError> {
        let permit = match tokio::time::timeout(
            self.settings.acquire_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(SandboxError::PoolClosed(self.language.clone())),
            Err(_) => {
                return Err(SandboxError::AcquireTimeout {
                    language: self.language.clone(),
                    waited_ms: self.settings.acquire_timeout.as_millis() as u64,
                })
            }
        };

        let pooled = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(SandboxError::PoolClosed(self.language.clone()));
            }
            state.available.pop_front()
        };

        // An empty pool under a held permit means a destroyed sandbox was
        // never replaced; rebuild it now.
        let sandbox = match pooled {
            Some(sandbox) => sandbox,
            None => self.provisioner.provision().await?,
        };

        {
            let mut state = self.state.lock().await;
            if state.closed {
                drop(state);
                self.runtime.destroy(&sandbox).await;
                return Err(SandboxError::PoolClosed(self.language.clone()));
            }
            state.busy.insert(sandbox.id.clone(), sandbox.clone());
        }

        Ok(SandboxLease { sandbox, permit })
    }

    /// Return a sandbox. Healthy ones are wiped and go back to the available
    /// set; tainted ones are destroyed and replaced on a background task.
    pub async fn release(&self, lease: SandboxLease, healthy: bool) {
        let SandboxLease { sandbox, permit } = lease;

        let reusable = healthy && self.reset(&sandbox).await;

        let closed = {
            let mut state = self.state.lock().await;
            state.busy.remove(&sandbox.id);
            if reusable && !state.closed {
                state.available.push_back(sandbox);
                return;
            }
            state.closed
        };

        if closed {
            self.runtime.destroy(&sandbox).await;
            return;
        }

        let replacement = self
            .provisioner
            .clone()
            .replace(Arc::clone(&self.state), sandbox, permit);

        let mut replacements = self.replacements.lock().await;
        while replacements.try_join_next().is_some() {}
        replacements.spawn(replacement);
    }

    async fn reset(&self, sandbox: &Sandbox) -> bool {
        match self.runtime.exec(sandbox, RESET_COMMAND, RESET_TIMEOUT).await {
            Ok(_) => true,
            Err(e) => {
                warn!(language = %self.language, sandbox = %sandbox.name, error = %e, "Sandbox reset failed");
                false
            }
        }
    }

    /// Job timeout applies when given, never above the language limit
    pub fn effective_timeout(&self, requested_ms: u64) -> Duration {
        let limit = self.config.timeout;
        let ms = if requested_ms > 0 { requested_ms.min(limit) } else { limit };
        Duration::from_millis(ms)
    }

    /// Run code once against ad hoc stdin
    #[instrument(skip(self, code, input), fields(language = %self.language))]
    pub async fn process_run_code(
        &self,
        code: &str,
        input: &str,
        timeout_ms: u64,
    ) -> Result<RunOutput, SandboxError> {
        check_size("Source code", code, MAX_SOURCE_CODE_BYTES)?;
        check_size("Input", input, MAX_INPUT_BYTES)?;

        let timeout = self.effective_timeout(timeout_ms);
        let lease = self.acquire().await?;

        let outcome = self.run_once(&lease.sandbox, code, input, timeout).await;

        let healthy = !matches!(&outcome, Err(e) if e.taints_sandbox());
        self.release(lease, healthy).await;

        outcome
    }

    async fn run_once(
        &self,
        sandbox: &Sandbox,
        code: &str,
        input: &str,
        timeout: Duration,
    ) -> Result<RunOutput, SandboxError> {
        let source = source_path(&self.config.file_extension, code);
        self.runtime.write_file(sandbox, &source, code).await?;
        self.runtime.write_file(sandbox, INPUT_PATH, input).await?;

        let command = render_command(&self.config.command, &source);
        let output = self.runtime.exec(sandbox, &command, timeout).await?;
        let execution_time_ms = output.elapsed_ms;

        Ok(RunOutput {
            output: output.into_stdout(self.config.fail_on_stderr)?,
            execution_time_ms,
        })
    }

    /// Run code against every test case, sequentially on one sandbox.
    ///
    /// A failing case only affects its own verdict; the result always holds
    /// one entry per test case, in input order.
    #[instrument(skip(self, code, test_cases), fields(language = %self.language, test_count = test_cases.len()))]
    pub async fn process_submit_code(
        &self,
        code: &str,
        test_cases: &[TestCase],
        timeout_ms: u64,
    ) -> Result<SubmissionOutcome, SandboxError> {
        check_size("Source code", code, MAX_SOURCE_CODE_BYTES)?;
        for case in test_cases {
            check_size("Test input", &case.input, MAX_INPUT_BYTES)?;
        }

        let timeout = self.effective_timeout(timeout_ms);
        let source = source_path(&self.config.file_extension, code);
        let command = render_command(&self.config.command, &source);

        let mut lease = Some(self.acquire_with_source(&source, code).await?);
        let mut lost_sandbox: Option<String> = None;
        let mut last_healthy = true;
        let mut results = Vec::with_capacity(test_cases.len());

        for (idx, case) in test_cases.iter().enumerate() {
            let current = match lease.as_ref() {
                Some(current) => current,
                None => {
                    let reason = lost_sandbox.clone().unwrap_or_default();
                    results.push(evaluate_case(case, &Err(SandboxError::Exec(reason)), 0));
                    continue;
                }
            };

            if idx > 0 && !self.settings.case_settle_delay.is_zero() {
                tokio::time::sleep(self.settings.case_settle_delay).await;
            }

            let started = Instant::now();
            let outcome = self.run_case(&current.sandbox, &command, case, timeout).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let tainted = matches!(&outcome, Err(e) if e.taints_sandbox());
            results.push(evaluate_case(case, &outcome, elapsed_ms));
            last_healthy = !tainted;

            if tainted && idx + 1 < test_cases.len() {
                if let Some(old) = lease.take() {
                    self.release(old, false).await;
                }
                match self.acquire_with_source(&source, code).await {
                    Ok(fresh) => {
                        lease = Some(fresh);
                        last_healthy = true;
                    }
                    Err(e) => {
                        warn!(language = %self.language, error = %e, "No sandbox to finish submission");
                        lost_sandbox = Some(format!("Sandbox lost mid-submission: {}", e));
                    }
                }
            }
        }

        if let Some(lease) = lease {
            self.release(lease, last_healthy).await;
        }

        let outcome = aggregate_results(results);
        debug!(
            language = %self.language,
            passed = outcome.passed,
            total = outcome.total,
            verdict = %outcome.verdict,
            "Submission evaluated"
        );
        Ok(outcome)
    }

    async fn acquire_with_source(
        &self,
        source: &str,
        code: &str,
    ) -> Result<SandboxLease, SandboxError> {
        let lease = self.acquire().await?;
        if let Err(e) = self.runtime.write_file(&lease.sandbox, source, code).await {
            let healthy = !e.taints_sandbox();
            self.release(lease, healthy).await;
            return Err(e);
        }
        Ok(lease)
    }

    async fn run_case(
        &self,
        sandbox: &Sandbox,
        command: &str,
        case: &TestCase,
        timeout: Duration,
    ) -> Result<String, SandboxError> {
        self.runtime.write_file(sandbox, INPUT_PATH, &case.input).await?;
        let output = self.runtime.exec(sandbox, command, timeout).await?;
        output.into_stdout(self.config.fail_on_stderr)
    }

    /// Destroy every sandbox, available and busy, and refuse further work
    #[instrument(skip(self), fields(language = %self.language))]
    pub async fn shutdown(&self) {
        self.permits.close();

        let sandboxes: Vec<Sandbox> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            let mut all: Vec<Sandbox> = state.available.drain(..).collect();
            all.extend(state.busy.drain().map(|(_, sandbox)| sandbox));
            all
        };

        // In-flight replacements see `closed` and clean up after themselves
        let mut replacements = std::mem::take(&mut *self.replacements.lock().await);
        while replacements.join_next().await.is_some() {}

        let count = sandboxes.len();
        futures_util::future::join_all(sandboxes.iter().map(|s| self.runtime.destroy(s))).await;

        info!(language = %self.language, destroyed = count, "Pool shut down");
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            language: self.language.clone(),
            available: state.available.len(),
            busy: state.busy.len(),
            capacity: self.config.pool_size,
        }
    }

    /// Wait until no lease or replacement holds a permit
    #[cfg(test)]
    pub(crate) async fn wait_idle(&self) {
        let _all = self
            .permits
            .acquire_many(self.config.pool_size as u32)
            .await;
    }

    #[cfg(test)]
    pub(crate) async fn snapshot(&self) -> (Vec<Sandbox>, Vec<Sandbox>) {
        let state = self.state.lock().await;
        (
            state.available.iter().cloned().collect(),
            state.busy.values().cloned().collect(),
        )
    }
}

fn check_size(what: &'static str, text: &str, limit: usize) -> Result<(), SandboxError> {
    if text.len() > limit {
        return Err(SandboxError::InputTooLarge { what, limit });
    }
    Ok(())
}
