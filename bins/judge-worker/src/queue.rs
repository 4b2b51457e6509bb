// Queue endpoints used by the worker pool

use anyhow::{Context, Result};
use async_trait::async_trait;
use judge_common::redis;
use judge_common::types::{ExecutionResult, InboundJob};
use std::time::Duration;

/// Inbound side. Each consumer owns one, since a blocking pop ties up the
/// connection it runs on.
#[async_trait]
pub trait JobSource: Send {
    /// Wait up to `timeout` for the next job; `None` when the wait expired.
    /// `Err` is reserved for the transport, never for a bad payload.
    async fn next_job(&mut self, timeout: Duration) -> Result<Option<InboundJob>>;
}

/// Outbound side, shared by all consumers
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn publish(&self, result: &ExecutionResult) -> Result<()>;
}

pub struct RedisJobSource {
    conn: ::redis::aio::ConnectionManager,
    queue: String,
}

impl RedisJobSource {
    pub async fn connect(client: &::redis::Client, queue: &str) -> Result<Self> {
        let conn = ::redis::aio::ConnectionManager::new(client.clone())
            .await
            .context("Failed to open inbound Redis connection")?;
        Ok(Self {
            conn,
            queue: queue.to_string(),
        })
    }
}

#[async_trait]
impl JobSource for RedisJobSource {
    async fn next_job(&mut self, timeout: Duration) -> Result<Option<InboundJob>> {
        let job = redis::pop_job(&mut self.conn, &self.queue, timeout.as_secs_f64()).await?;
        Ok(job)
    }
}

pub struct RedisResultSink {
    conn: ::redis::aio::ConnectionManager,
    queue: String,
}

impl RedisResultSink {
    pub async fn connect(client: &::redis::Client, queue: &str) -> Result<Self> {
        let conn = ::redis::aio::ConnectionManager::new(client.clone())
            .await
            .context("Failed to open outbound Redis connection")?;
        Ok(Self {
            conn,
            queue: queue.to_string(),
        })
    }
}

#[async_trait]
impl ResultSink for RedisResultSink {
    async fn publish(&self, result: &ExecutionResult) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::publish_result(&mut conn, &self.queue, result).await?;
        Ok(())
    }
}
