use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// One unit of execution work as it arrives on the inbound queue.
///
/// The `submissionType` tag selects the payload: run jobs carry stdin,
/// submit jobs carry the ordered test cases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeExecutionJob {
    pub id: String,
    pub language: String,
    pub code: String,
    /// Requested per-exec timeout in milliseconds; 0 means "use the language default"
    #[serde(rename = "timeout", default)]
    pub timeout_ms: u64,
    #[serde(flatten)]
    pub payload: JobPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "submissionType", rename_all = "lowercase")]
pub enum JobPayload {
    Run {
        #[serde(default)]
        input: Option<String>,
    },
    Submit {
        #[serde(rename = "testCases", default)]
        test_cases: Vec<TestCase>,
    },
}

impl CodeExecutionJob {
    pub fn submission_type(&self) -> SubmissionType {
        match self.payload {
            JobPayload::Run { .. } => SubmissionType::Run,
            JobPayload::Submit { .. } => SubmissionType::Submit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionType {
    Run,
    Submit,
}

impl fmt::Display for SubmissionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionType::Run => write!(f, "run"),
            SubmissionType::Submit => write!(f, "submit"),
        }
    }
}

/// A message popped from the inbound queue, before any routing.
///
/// Payloads that fail to decode still get a result when they carry a job
/// id, so the submission service is never left waiting on them.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundJob {
    Job(CodeExecutionJob),
    Malformed {
        id: Option<String>,
        submission_type: Option<SubmissionType>,
        error: String,
    },
}

impl InboundJob {
    pub fn parse(payload: &str) -> Self {
        let error = match serde_json::from_str::<CodeExecutionJob>(payload) {
            Ok(job) => return InboundJob::Job(job),
            Err(e) => e.to_string(),
        };

        // Salvage whatever identifies the job
        let raw: Option<serde_json::Value> = serde_json::from_str(payload).ok();
        let field = |name: &str| raw.as_ref().and_then(|v| v.get(name)).cloned();

        let id = field("id").and_then(|id| match id {
            serde_json::Value::String(s) if !s.is_empty() => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        let submission_type =
            field("submissionType").and_then(|t| serde_json::from_value(t).ok());

        InboundJob::Malformed {
            id,
            submission_type,
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub is_sample: bool,
}

/// Problem authoring tools emit numeric ids, the API layer emits strings.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text,
        RawId::Number(number) => number.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    RuntimeError,
    TimeLimitExceeded,
}

impl Verdict {
    /// Submission-level verdict: the first non-accepted case wins.
    pub fn aggregate<'a, I>(verdicts: I) -> Verdict
    where
        I: IntoIterator<Item = &'a Verdict>,
    {
        verdicts
            .into_iter()
            .copied()
            .find(|v| *v != Verdict::Accepted)
            .unwrap_or(Verdict::Accepted)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Verdict::Accepted => "accepted",
            Verdict::WrongAnswer => "wrong_answer",
            Verdict::RuntimeError => "runtime_error",
            Verdict::TimeLimitExceeded => "time_limit_exceeded",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_case_id: String,
    pub verdict: Verdict,
    pub execution_time_ms: u64,
    /// Not measured yet, always 0
    pub memory_used_kb: u64,
    pub output: String,
    pub error: Option<String>,
}

/// Aggregate carried (JSON-encoded) in the `result` field of a submit result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionOutcome {
    pub verdict: Verdict,
    pub passed: usize,
    pub total: usize,
    pub test_results: Vec<TestResult>,
}

impl SubmissionOutcome {
    pub fn from_results(test_results: Vec<TestResult>) -> Self {
        let passed = test_results
            .iter()
            .filter(|r| r.verdict == Verdict::Accepted)
            .count();
        Self {
            verdict: Verdict::aggregate(test_results.iter().map(|r| &r.verdict)),
            passed,
            total: test_results.len(),
            test_results,
        }
    }
}

/// The only message published to the outbound queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub job_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(rename = "executionTime", default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_type: Option<SubmissionType>,
}

impl ExecutionResult {
    pub fn success(
        job_id: impl Into<String>,
        submission_type: SubmissionType,
        result: String,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            success: true,
            result: Some(result),
            error: None,
            execution_time_ms: Some(execution_time_ms),
            submission_type: Some(submission_type),
        }
    }

    pub fn failure(
        job_id: impl Into<String>,
        submission_type: SubmissionType,
        error: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            execution_time_ms: None,
            submission_type: Some(submission_type),
        }
    }

    /// Failure for a job whose payload could not be decoded
    pub fn rejected(
        job_id: impl Into<String>,
        submission_type: Option<SubmissionType>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            execution_time_ms: None,
            submission_type,
        }
    }
}
