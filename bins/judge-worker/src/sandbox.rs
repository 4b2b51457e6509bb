/// Sandbox Runtime - the seam between the pools and a container engine
///
/// Pools only speak this trait. Production wires in `DockerRuntime`
/// (docker.rs); tests script an in-memory runtime.
///
/// **File layout inside every sandbox:**
/// - source: `/app/main<ext>` (Java: `/app/<PublicClass>.java`)
/// - stdin:  `/app/input.txt`
use crate::error::SandboxError;
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

pub const WORK_DIR: &str = "/app";
pub const INPUT_PATH: &str = "/app/input.txt";

/// Captured stdout beyond this is dropped
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

const DEFAULT_JAVA_CLASS: &str = "Main";

/// Resources for one sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    pub language: String,
    pub image: String,
    pub memory_limit_bytes: i64,
    pub nano_cpus: i64,
}

/// Handle to one live container
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sandbox {
    pub id: String,
    pub name: String,
}

/// Raw result of one exec, before any pass/fail policy is applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub elapsed_ms: u64,
}

impl ExecOutput {
    /// Apply the failure policy: non-empty stderr (when `fail_on_stderr`)
    /// or a non-zero exit code turns the run into a runtime error.
    pub fn into_stdout(self, fail_on_stderr: bool) -> Result<String, SandboxError> {
        if fail_on_stderr && !self.stderr.is_empty() {
            return Err(SandboxError::Runtime(self.stderr));
        }

        match self.exit_code {
            Some(0) | None => Ok(self.stdout),
            Some(code) => {
                let mut message = if self.stderr.is_empty() {
                    format!("Process exited with code {}", code)
                } else {
                    self.stderr
                };
                if code == 137 {
                    message.push_str("\n[Process killed: likely exceeded memory limit]");
                }
                Err(SandboxError::Runtime(message))
            }
        }
    }
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Make sure the image exists locally, pulling it if needed
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError>;

    /// Provision and start a new network-less, resource-capped sandbox
    async fn create(&self, spec: &SandboxSpec) -> Result<Sandbox, SandboxError>;

    /// Write `content` to the absolute `path` inside the sandbox
    async fn write_file(
        &self,
        sandbox: &Sandbox,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError>;

    /// Run `command` through `sh -c` in the work dir; must return by `timeout`
    async fn exec(
        &self,
        sandbox: &Sandbox,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError>;

    /// Stop and remove the sandbox. Idempotent, never fails.
    async fn destroy(&self, sandbox: &Sandbox);
}

fn java_class_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^[ \t]*public\s+(?:(?:final|abstract|strictfp)\s+)*class\s+([A-Za-z_][A-Za-z0-9_]*)",
        )
        .unwrap_or_else(|e| panic!("invalid java class pattern: {}", e))
    })
}

/// Name of the first `public class` declared at the start of a line.
///
/// Mentions inside comments or string literals are skipped. Only plain
/// ASCII identifiers are accepted since the name ends up in the language's
/// shell command.
pub fn java_public_class(code: &str) -> Option<&str> {
    java_class_regex()
        .captures(code)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Where the source file goes for a language with `extension`
pub fn source_path(extension: &str, code: &str) -> String {
    let extension = extension.trim_start_matches('.');
    if extension.eq_ignore_ascii_case("java") {
        let class = java_public_class(code).unwrap_or(DEFAULT_JAVA_CLASS);
        format!("{}/{}.java", WORK_DIR, class)
    } else {
        format!("{}/main.{}", WORK_DIR, extension)
    }
}

/// Fill `{source}` and `{class}` in a language command template
pub fn render_command(template: &str, source_path: &str) -> String {
    let file_name = source_path.rsplit('/').next().unwrap_or(source_path);
    let stem = file_name.split('.').next().unwrap_or(file_name);
    template
        .replace("{source}", source_path)
        .replace("{class}", stem)
}

/// Split an absolute path into (directory, file name)
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    let (dir, name) = path.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    Some((if dir.is_empty() { "/" } else { dir }, name))
}

/// Append to `buffer` without letting it grow past `MAX_OUTPUT_BYTES`
pub fn append_capped(buffer: &mut Vec<u8>, chunk: &[u8]) {
    let room = MAX_OUTPUT_BYTES.saturating_sub(buffer.len());
    buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
}
