use crate::types::{CodeExecutionJob, ExecutionResult, InboundJob};
use redis::{AsyncCommands, RedisResult};

/// Redis queue semantics - defines only semantics, not runtime logic
/// Keeps the submission service and the worker agreeing on key names
/// and payload encoding.

pub const QUEUE_PREFIX: &str = "judge:queue";
pub const JOBS_QUEUE: &str = "jobs";
pub const RESULTS_QUEUE: &str = "results";

/// Fully qualified queue key, e.g. `judge:queue:jobs`
pub fn queue_name(name: &str) -> String {
    format!("{}:{}", QUEUE_PREFIX, name)
}

fn encode<T: serde::Serialize>(value: &T) -> RedisResult<String> {
    serde_json::to_string(value).map_err(|e| {
        redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "serialization error",
            e.to_string(),
        ))
    })
}

fn decode<T: serde::de::DeserializeOwned>(payload: &str) -> RedisResult<T> {
    serde_json::from_str(payload).map_err(|e| {
        redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "deserialization error",
            e.to_string(),
        ))
    })
}

/// Push a job to the inbound queue
/// Uses RPUSH for FIFO semantics
pub async fn push_job(
    conn: &mut redis::aio::ConnectionManager,
    queue: &str,
    job: &CodeExecutionJob,
) -> RedisResult<()> {
    let payload = encode(job)?;
    conn.rpush(queue, payload).await
}

/// Pop a job from the inbound queue
/// Uses BLPOP with timeout so consumers can observe shutdown between pops.
/// Only transport failures are errors; an undecodable payload comes back as
/// `InboundJob::Malformed` so it can still be answered.
pub async fn pop_job(
    conn: &mut redis::aio::ConnectionManager,
    queue: &str,
    timeout_seconds: f64,
) -> RedisResult<Option<InboundJob>> {
    let result: Option<(String, String)> = conn.blpop(queue, timeout_seconds).await?;

    Ok(result.map(|(_key, payload)| InboundJob::parse(&payload)))
}

/// Publish an execution result to the outbound queue
pub async fn publish_result(
    conn: &mut redis::aio::ConnectionManager,
    queue: &str,
    result: &ExecutionResult,
) -> RedisResult<()> {
    let payload = encode(result)?;
    conn.rpush(queue, payload).await
}

/// Pop a result from the outbound queue (consumer side)
pub async fn pop_result(
    conn: &mut redis::aio::ConnectionManager,
    queue: &str,
    timeout_seconds: f64,
) -> RedisResult<Option<ExecutionResult>> {
    let result: Option<(String, String)> = conn.blpop(queue, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => Ok(Some(decode(&payload)?)),
        None => Ok(None),
    }
}
