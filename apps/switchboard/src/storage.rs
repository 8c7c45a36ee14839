use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use thiserror::Error;

use switchboard_proto::records::{AgentRecord, Connectivity, JobRecord, JobStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable per-row storage for agents and jobs. Key-based reads and writes
/// only; no cross-entity transactional guarantees.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_agent(&self, id: &str) -> StoreResult<Option<AgentRecord>>;
    async fn upsert_agent(&self, record: AgentRecord) -> StoreResult<()>;
    /// Flip connectivity and refresh `last_seen`. No-op for unknown agents.
    async fn set_agent_connectivity(&self, id: &str, connectivity: Connectivity) -> StoreResult<()>;
    /// Refresh `last_seen` only.
    async fn touch_agent(&self, id: &str) -> StoreResult<()>;
    async fn set_agent_current_job(&self, id: &str, job_id: Option<String>) -> StoreResult<()>;
    async fn list_agents(&self) -> StoreResult<Vec<AgentRecord>>;

    async fn insert_job(&self, record: JobRecord) -> StoreResult<()>;
    async fn get_job(&self, id: &str) -> StoreResult<Option<JobRecord>>;
    /// Update status and, when provided, the human-readable message.
    /// No-op for unknown jobs.
    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        message: Option<String>,
    ) -> StoreResult<()>;
    async fn set_job_artifact(&self, id: &str, artifact: &str) -> StoreResult<()>;
    async fn list_jobs(&self) -> StoreResult<Vec<JobRecord>>;
    async fn delete_job(&self, id: &str) -> StoreResult<()>;
}

pub type SharedStore = Arc<dyn Store>;

fn agent_key(id: &str) -> String {
    format!("agent:{}", id)
}

fn job_key(id: &str) -> String {
    format!("job:{}", id)
}

/// Redis-backed store; records are JSON values under `agent:{id}` and
/// `job:{id}` keys.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    async fn scan_records<T: serde::de::DeserializeOwned>(
        &self,
        pattern: &str,
    ) -> StoreResult<Vec<T>> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut results = Vec::new();
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100u32)
                .query_async(&mut conn)
                .await?;
            cursor = next_cursor;
            if !keys.is_empty() {
                let values: Vec<Option<String>> =
                    redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
                for value in values.into_iter().flatten() {
                    if let Ok(record) = serde_json::from_str::<T>(&value) {
                        results.push(record);
                    }
                }
            }
            if cursor == 0 {
                break;
            }
        }
        Ok(results)
    }

    async fn read_agent(&self, id: &str) -> StoreResult<Option<AgentRecord>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(agent_key(id)).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn write_agent(&self, record: &AgentRecord) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(record)?;
        conn.set::<_, _, ()>(agent_key(&record.id), value).await?;
        Ok(())
    }

    async fn read_job(&self, id: &str) -> StoreResult<Option<JobRecord>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(job_key(id)).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn write_job(&self, record: &JobRecord) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(record)?;
        conn.set::<_, _, ()>(job_key(&record.id), value).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get_agent(&self, id: &str) -> StoreResult<Option<AgentRecord>> {
        self.read_agent(id).await
    }

    async fn upsert_agent(&self, record: AgentRecord) -> StoreResult<()> {
        self.write_agent(&record).await
    }

    async fn set_agent_connectivity(&self, id: &str, connectivity: Connectivity) -> StoreResult<()> {
        if let Some(mut record) = self.read_agent(id).await? {
            record.connectivity = connectivity;
            record.last_seen = Utc::now();
            self.write_agent(&record).await?;
        }
        Ok(())
    }

    async fn touch_agent(&self, id: &str) -> StoreResult<()> {
        if let Some(mut record) = self.read_agent(id).await? {
            record.last_seen = Utc::now();
            self.write_agent(&record).await?;
        }
        Ok(())
    }

    async fn set_agent_current_job(&self, id: &str, job_id: Option<String>) -> StoreResult<()> {
        if let Some(mut record) = self.read_agent(id).await? {
            record.current_job_id = job_id;
            self.write_agent(&record).await?;
        }
        Ok(())
    }

    async fn list_agents(&self) -> StoreResult<Vec<AgentRecord>> {
        self.scan_records("agent:*").await
    }

    async fn insert_job(&self, record: JobRecord) -> StoreResult<()> {
        self.write_job(&record).await
    }

    async fn get_job(&self, id: &str) -> StoreResult<Option<JobRecord>> {
        self.read_job(id).await
    }

    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        message: Option<String>,
    ) -> StoreResult<()> {
        if let Some(mut record) = self.read_job(id).await? {
            record.status = status;
            if message.is_some() {
                record.message = message;
            }
            record.updated_at = Utc::now();
            self.write_job(&record).await?;
        }
        Ok(())
    }

    async fn set_job_artifact(&self, id: &str, artifact: &str) -> StoreResult<()> {
        if let Some(mut record) = self.read_job(id).await? {
            record.artifact = Some(artifact.to_string());
            record.updated_at = Utc::now();
            self.write_job(&record).await?;
        }
        Ok(())
    }

    async fn list_jobs(&self) -> StoreResult<Vec<JobRecord>> {
        let mut jobs: Vec<JobRecord> = self.scan_records("job:*").await?;
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn delete_job(&self, id: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(job_key(id)).await?;
        Ok(())
    }
}

/// In-memory store used by tests and redis-less development.
#[derive(Default)]
pub struct MemStore {
    agents: dashmap::DashMap<String, AgentRecord>,
    jobs: dashmap::DashMap<String, JobRecord>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_agent(&self, id: &str) -> StoreResult<Option<AgentRecord>> {
        Ok(self.agents.get(id).map(|entry| entry.clone()))
    }

    async fn upsert_agent(&self, record: AgentRecord) -> StoreResult<()> {
        self.agents.insert(record.id.clone(), record);
        Ok(())
    }

    async fn set_agent_connectivity(&self, id: &str, connectivity: Connectivity) -> StoreResult<()> {
        if let Some(mut entry) = self.agents.get_mut(id) {
            entry.connectivity = connectivity;
            entry.last_seen = Utc::now();
        }
        Ok(())
    }

    async fn touch_agent(&self, id: &str) -> StoreResult<()> {
        if let Some(mut entry) = self.agents.get_mut(id) {
            entry.last_seen = Utc::now();
        }
        Ok(())
    }

    async fn set_agent_current_job(&self, id: &str, job_id: Option<String>) -> StoreResult<()> {
        if let Some(mut entry) = self.agents.get_mut(id) {
            entry.current_job_id = job_id;
        }
        Ok(())
    }

    async fn list_agents(&self) -> StoreResult<Vec<AgentRecord>> {
        Ok(self.agents.iter().map(|entry| entry.clone()).collect())
    }

    async fn insert_job(&self, record: JobRecord) -> StoreResult<()> {
        self.jobs.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_job(&self, id: &str) -> StoreResult<Option<JobRecord>> {
        Ok(self.jobs.get(id).map(|entry| entry.clone()))
    }

    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        message: Option<String>,
    ) -> StoreResult<()> {
        if let Some(mut entry) = self.jobs.get_mut(id) {
            entry.status = status;
            if message.is_some() {
                entry.message = message;
            }
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_job_artifact(&self, id: &str, artifact: &str) -> StoreResult<()> {
        if let Some(mut entry) = self.jobs.get_mut(id) {
            entry.artifact = Some(artifact.to_string());
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_jobs(&self) -> StoreResult<Vec<JobRecord>> {
        let mut jobs: Vec<JobRecord> = self.jobs.iter().map(|entry| entry.clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn delete_job(&self, id: &str) -> StoreResult<()> {
        self.jobs.remove(id);
        Ok(())
    }
}
