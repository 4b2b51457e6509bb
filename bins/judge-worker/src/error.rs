use thiserror::Error;

/// Failure modes of the sandbox layer, from engine outages down to a single
/// test case writing to stderr.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The container engine is unreachable or refused a pool-wide operation
    #[error("Container engine error: {0}")]
    Engine(String),

    /// One sandbox could not be provisioned; another attempt may succeed
    #[error("Failed to create sandbox from image '{image}': {message}")]
    Creation { image: String, message: String },

    #[error("Failed to write {path} into sandbox: {message}")]
    FileWrite { path: String, message: String },

    /// Engine-level exec failure; the sandbox can no longer be trusted
    #[error("Exec failed: {0}")]
    Exec(String),

    #[error("Execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The program wrote diagnostics or exited abnormally
    #[error("{0}")]
    Runtime(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("No {language} sandbox became available within {waited_ms}ms")]
    AcquireTimeout { language: String, waited_ms: u64 },

    #[error("Sandbox pool for {0} is shut down")]
    PoolClosed(String),

    #[error("{what} exceeds maximum size of {limit} bytes")]
    InputTooLarge { what: &'static str, limit: usize },
}

impl SandboxError {
    /// Whether the sandbox that produced this error must be replaced
    /// instead of going back to the pool.
    pub fn taints_sandbox(&self) -> bool {
        matches!(
            self,
            SandboxError::Timeout { .. } | SandboxError::Exec(_) | SandboxError::FileWrite { .. }
        )
    }
}

impl From<bollard::errors::Error> for SandboxError {
    fn from(err: bollard::errors::Error) -> Self {
        SandboxError::Exec(err.to_string())
    }
}
