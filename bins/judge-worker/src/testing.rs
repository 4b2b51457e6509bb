// In-memory runtime and queues for driving pools and workers without Docker.
//
// The fake runtime interprets the submitted "source code" as a tiny script:
//   echo         stdout = contents of /app/input.txt
//   loop         never finishes (hits the exec timeout)
//   fail-on:X    stderr when the trimmed input equals X, echo otherwise
//   stderr       writes a warning to stderr
//   exit:N       exits with code N
//   sleep:MS     sleeps, then prints "done"
//   panic        panics inside exec
//   anything else is printed back verbatim

use crate::config::LanguageConfig;
use crate::error::SandboxError;
use crate::pool::RESET_COMMAND;
use crate::queue::{JobSource, ResultSink};
use crate::sandbox::{ExecOutput, Sandbox, SandboxRuntime, SandboxSpec, INPUT_PATH};
use async_trait::async_trait;
use judge_common::types::{CodeExecutionJob, ExecutionResult, InboundJob, JobPayload, TestCase};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

pub const RUN_PREFIX: &str = "run ";

pub fn language_config(pool_size: usize, timeout_ms: u64) -> LanguageConfig {
    LanguageConfig {
        image: "fake:latest".to_string(),
        pool_size,
        command: format!("{}{{source}}", RUN_PREFIX),
        timeout: timeout_ms,
        file_extension: ".fake".to_string(),
        memory_limit_mb: 64,
        cpu_limit: 0.5,
        fail_on_stderr: true,
    }
}

pub fn test_case(id: &str, input: &str, expected: &str) -> TestCase {
    TestCase {
        id: id.to_string(),
        input: input.to_string(),
        expected_output: expected.to_string(),
        is_sample: false,
    }
}

pub fn run_job(id: &str, language: &str, code: &str, input: &str) -> CodeExecutionJob {
    CodeExecutionJob {
        id: id.to_string(),
        language: language.to_string(),
        code: code.to_string(),
        timeout_ms: 0,
        payload: JobPayload::Run {
            input: Some(input.to_string()),
        },
    }
}

pub fn submit_job(id: &str, language: &str, code: &str, cases: Vec<TestCase>) -> CodeExecutionJob {
    CodeExecutionJob {
        id: id.to_string(),
        language: language.to_string(),
        code: code.to_string(),
        timeout_ms: 0,
        payload: JobPayload::Submit { test_cases: cases },
    }
}

#[derive(Default)]
struct FakeState {
    /// Live sandboxes and their files
    live: HashMap<String, HashMap<String, String>>,
    destroyed: Vec<String>,
    /// Sandboxes with an exec in progress
    running: HashSet<String>,
    overlapping_execs: usize,
    resets: usize,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    next_id: AtomicUsize,
    created: AtomicUsize,
    fail_creates: AtomicUsize,
    create_delay_ms: AtomicU64,
    missing_images: Mutex<HashSet<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` create calls fail
    pub fn fail_next_creates(&self, count: usize) {
        self.fail_creates.store(count, Ordering::SeqCst);
    }

    /// Every later create call takes at least `delay`
    pub fn set_create_delay(&self, delay: Duration) {
        self.create_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// `ensure_image` for `image` reports an engine error
    pub fn remove_image(&self, image: &str) {
        lock(&self.missing_images).insert(image.to_string());
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        lock(&self.state).live.len()
    }

    pub fn destroyed(&self) -> Vec<String> {
        lock(&self.state).destroyed.clone()
    }

    pub fn resets(&self) -> usize {
        lock(&self.state).resets
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of times two execs ran on the same sandbox at once
    pub fn overlapping_execs(&self) -> usize {
        lock(&self.state).overlapping_execs
    }

    pub fn files(&self, sandbox: &Sandbox) -> HashMap<String, String> {
        lock(&self.state)
            .live
            .get(&sandbox.id)
            .cloned()
            .unwrap_or_default()
    }

    fn begin_exec(&self, sandbox: &Sandbox) -> ExecGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let mut state = lock(&self.state);
        if !state.running.insert(sandbox.id.clone()) {
            state.overlapping_execs += 1;
        }
        ExecGuard {
            runtime: self,
            sandbox_id: sandbox.id.clone(),
        }
    }
}

struct ExecGuard<'a> {
    runtime: &'a FakeRuntime,
    sandbox_id: String,
}

impl Drop for ExecGuard<'_> {
    fn drop(&mut self) {
        self.runtime.in_flight.fetch_sub(1, Ordering::SeqCst);
        lock(&self.runtime.state).running.remove(&self.sandbox_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if lock(&self.missing_images).contains(image) {
            return Err(SandboxError::Engine(format!("pull access denied for {}", image)));
        }
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<Sandbox, SandboxError> {
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let pending_failures = self.fail_creates.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_creates.store(pending_failures - 1, Ordering::SeqCst);
            return Err(SandboxError::Creation {
                image: spec.image.clone(),
                message: "injected failure".to_string(),
            });
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        let sandbox = Sandbox {
            id: format!("fake-{}", n),
            name: format!("judge-{}-{}", spec.language, n),
        };
        lock(&self.state)
            .live
            .insert(sandbox.id.clone(), HashMap::new());
        Ok(sandbox)
    }

    async fn write_file(
        &self,
        sandbox: &Sandbox,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        let mut state = lock(&self.state);
        match state.live.get_mut(&sandbox.id) {
            Some(files) => {
                files.insert(path.to_string(), content.to_string());
                Ok(())
            }
            None => Err(SandboxError::FileWrite {
                path: path.to_string(),
                message: "no such container".to_string(),
            }),
        }
    }

    async fn exec(
        &self,
        sandbox: &Sandbox,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        let _guard = self.begin_exec(sandbox);
        let started = Instant::now();

        let (code, input) = {
            let mut state = lock(&self.state);
            if command == RESET_COMMAND {
                state.resets += 1;
                return match state.live.get_mut(&sandbox.id) {
                    Some(files) => {
                        files.clear();
                        Ok(ExecOutput::default())
                    }
                    None => Err(SandboxError::Exec("no such container".to_string())),
                };
            }

            let Some(files) = state.live.get(&sandbox.id) else {
                return Err(SandboxError::Exec("no such container".to_string()));
            };
            let source = command.strip_prefix(RUN_PREFIX).unwrap_or(command);
            (
                files.get(source).cloned().unwrap_or_default(),
                files.get(INPUT_PATH).cloned().unwrap_or_default(),
            )
        };

        let timed_out = || SandboxError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        };

        let mut output = ExecOutput {
            exit_code: Some(0),
            ..Default::default()
        };

        if code == "echo" {
            output.stdout = input;
        } else if code == "loop" {
            let never = std::future::pending::<()>();
            return match tokio::time::timeout(timeout, never).await {
                Ok(()) => Ok(output),
                Err(_) => Err(timed_out()),
            };
        } else if code == "stderr" {
            output.stderr = "warning: something odd".to_string();
        } else if code == "panic" {
            panic!("fake runtime asked to panic");
        } else if let Some(trigger) = code.strip_prefix("fail-on:") {
            if input.trim() == trigger {
                output.stderr = format!("Traceback: bad input {}", trigger);
                output.exit_code = Some(1);
            } else {
                output.stdout = input;
            }
        } else if let Some(exit) = code.strip_prefix("exit:") {
            output.exit_code = exit.trim().parse().ok();
        } else if let Some(ms) = code.strip_prefix("sleep:") {
            let ms: u64 = ms.trim().parse().unwrap_or(0);
            let sleep = tokio::time::sleep(Duration::from_millis(ms));
            if tokio::time::timeout(timeout, sleep).await.is_err() {
                return Err(timed_out());
            }
            output.stdout = "done".to_string();
        } else {
            output.stdout = code;
        }

        output.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(output)
    }

    async fn destroy(&self, sandbox: &Sandbox) {
        let mut state = lock(&self.state);
        if state.live.remove(&sandbox.id).is_some() {
            state.destroyed.push(sandbox.id.clone());
        }
    }
}

/// Shared list of raw payloads; every consumer gets its own handle via `source()`
#[derive(Clone, Default)]
pub struct MemoryQueue {
    jobs: std::sync::Arc<Mutex<VecDeque<String>>>,
    failures: std::sync::Arc<AtomicUsize>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: CodeExecutionJob) {
        let payload = serde_json::to_string(&job).unwrap();
        self.push_raw(&payload);
    }

    pub fn push_raw(&self, payload: &str) {
        lock(&self.jobs).push_back(payload.to_string());
    }

    /// The next `count` pops return a connection error
    pub fn fail_next_pops(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock(&self.jobs).len()
    }

    pub fn source(&self) -> Box<dyn JobSource> {
        Box::new(self.clone())
    }
}

#[async_trait]
impl JobSource for MemoryQueue {
    async fn next_job(&mut self, timeout: Duration) -> anyhow::Result<Option<InboundJob>> {
        let pending_failures = self.failures.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.failures.store(pending_failures - 1, Ordering::SeqCst);
            anyhow::bail!("connection reset by peer");
        }

        let next = lock(&self.jobs).pop_front();
        if let Some(payload) = next {
            return Ok(Some(InboundJob::parse(&payload)));
        }
        tokio::time::sleep(timeout).await;
        Ok(None)
    }
}

#[derive(Default)]
pub struct MemorySink {
    results: Mutex<Vec<ExecutionResult>>,
    notify: Notify,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<ExecutionResult> {
        lock(&self.results).clone()
    }

    /// Wait until at least `count` results arrived, or give up after `limit`
    pub async fn wait_for(&self, count: usize, limit: Duration) -> Vec<ExecutionResult> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let notified = self.notify.notified();
            {
                let results = lock(&self.results);
                if results.len() >= count {
                    return results.clone();
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.results();
            }
        }
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn publish(&self, result: &ExecutionResult) -> anyhow::Result<()> {
        lock(&self.results).push(result.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}
