//! Redis-backed progress cache and job lock.
//!
//! Keys are partitioned by job id:
//! - `research:job:{id}:progress` - JSON `ProgressSnapshot`, expires after a day
//! - `research:job:{id}:activity` - plain text, expires after a day
//! - `research:job:{id}:lock`     - holder token with a millisecond TTL
//!
//! Lock acquire/release/extend each run as a single Lua script so the
//! check and the write cannot interleave with another client.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, error};

use super::progress_cache::{CacheError, LockStore, ProgressCache, ProgressSnapshot};
use crate::common::JobId;

const PROGRESS_TTL_SECS: u64 = 24 * 60 * 60;

const ACQUIRE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
if current then
    return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return 1
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

pub struct RedisJobCache {
    connection_manager: ConnectionManager,
    acquire: Script,
    release: Script,
    extend: Script,
}

impl RedisJobCache {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            CacheError::Unavailable(format!("invalid redis url: {}", e))
        })?;

        let connection_manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to create connection manager: {}", e);
            CacheError::Unavailable(format!("failed to connect to redis: {}", e))
        })?;

        let mut conn = connection_manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!("Connected to redis at {}", url);

        Ok(Self {
            connection_manager,
            acquire: Script::new(ACQUIRE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
        })
    }

    /// Round-trip check for the health endpoint.
    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection_manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn key(job_id: JobId, suffix: &str) -> String {
        format!("research:job:{}:{}", job_id, suffix)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl ProgressCache for RedisJobCache {
    async fn set_progress(
        &self,
        job_id: JobId,
        snapshot: &ProgressSnapshot,
    ) -> Result<(), CacheError> {
        let mut conn = self.connection_manager.clone();
        let json = serde_json::to_string(snapshot)?;
        let _: () = redis::cmd("SET")
            .arg(Self::key(job_id, "progress"))
            .arg(json)
            .arg("EX")
            .arg(PROGRESS_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_progress(&self, job_id: JobId) -> Result<Option<ProgressSnapshot>, CacheError> {
        let mut conn = self.connection_manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(job_id, "progress"))
            .query_async(&mut conn)
            .await?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set_activity(&self, job_id: JobId, text: &str) -> Result<(), CacheError> {
        let mut conn = self.connection_manager.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::key(job_id, "activity"))
            .arg(text)
            .arg("EX")
            .arg(PROGRESS_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_activity(&self, job_id: JobId) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection_manager.clone();
        let text: Option<String> = redis::cmd("GET")
            .arg(Self::key(job_id, "activity"))
            .query_async(&mut conn)
            .await?;
        Ok(text)
    }
}

#[async_trait]
impl LockStore for RedisJobCache {
    async fn acquire_lock(
        &self,
        job_id: JobId,
        holder_token: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.connection_manager.clone();
        let acquired: i64 = self
            .acquire
            .key(Self::key(job_id, "lock"))
            .arg(holder_token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn release_lock(&self, job_id: JobId, holder_token: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection_manager.clone();
        let deleted: i64 = self
            .release
            .key(Self::key(job_id, "lock"))
            .arg(holder_token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn extend_lock(
        &self,
        job_id: JobId,
        holder_token: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.connection_manager.clone();
        let extended: i64 = self
            .extend
            .key(Self::key(job_id, "lock"))
            .arg(holder_token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_partitioned_by_job() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(RedisJobCache::key(a, "lock"), RedisJobCache::key(b, "lock"));
        assert!(RedisJobCache::key(a, "progress").ends_with(":progress"));
    }

    #[test]
    fn test_ttl_never_rounds_to_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(60)), 60_000);
    }
}
