/// Test Evaluator - Language-Agnostic Verdict Logic
///
/// **Core Responsibility:**
/// Turn the outcome of one exec into a verdict for one test case.
///
/// **Critical Properties:**
/// - Knows nothing about Docker
/// - Knows nothing about language runtimes
/// - Knows nothing about Redis
///
/// **Verdict Rules (in priority order):**
/// 1. Exec timed out → time_limit_exceeded
/// 2. Any other exec failure → runtime_error
/// 3. Trimmed actual == trimmed expected → accepted
/// 4. Otherwise → wrong_answer
///
/// **Normalization Rules (Applied to All Languages):**
/// - Trim leading and trailing whitespace: YES
/// - Case sensitivity: YES (exact match required)
/// - Floating-point tolerance: NO
use crate::error::SandboxError;
use judge_common::types::{SubmissionOutcome, TestCase, TestResult, Verdict};
use tracing::debug;

/// Longest `output`/`error` text kept on a TestResult
pub const MAX_REPORTED_OUTPUT_BYTES: usize = 4096;

/// Normalize output string for comparison
fn normalize_output(output: &str) -> &str {
    output.trim()
}

/// Cut `text` to at most `max_bytes`, on a char boundary
pub fn truncate_output(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Evaluate a single test case execution outcome
pub fn evaluate_case(
    test_case: &TestCase,
    outcome: &Result<String, SandboxError>,
    execution_time_ms: u64,
) -> TestResult {
    let (verdict, output, error) = match outcome {
        Ok(stdout) => {
            let verdict = if normalize_output(stdout) == normalize_output(&test_case.expected_output) {
                Verdict::Accepted
            } else {
                Verdict::WrongAnswer
            };
            (verdict, truncate_output(stdout, MAX_REPORTED_OUTPUT_BYTES), None)
        }
        Err(err @ SandboxError::Timeout { .. }) => (
            Verdict::TimeLimitExceeded,
            String::new(),
            Some(err.to_string()),
        ),
        Err(err) => (
            Verdict::RuntimeError,
            String::new(),
            Some(truncate_output(&err.to_string(), MAX_REPORTED_OUTPUT_BYTES)),
        ),
    };

    debug!(
        test_case_id = %test_case.id,
        verdict = %verdict,
        execution_time_ms,
        "Test case evaluated"
    );

    TestResult {
        test_case_id: test_case.id.clone(),
        verdict,
        execution_time_ms,
        memory_used_kb: 0,
        output,
        error,
    }
}

/// Aggregate per-case results into the submission outcome
pub fn aggregate_results(results: Vec<TestResult>) -> SubmissionOutcome {
    SubmissionOutcome::from_results(results)
}
