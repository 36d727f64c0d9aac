use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{GateError, Result};
use crate::store::{CounterEntry, CounterKey, CounterStore, Versioned};

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Option<Duration>,
    pub command_timeout: Option<Duration>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Some(Duration::from_secs(5)),
            command_timeout: Some(Duration::from_secs(1)),
        }
    }
}

/// Counter entries live in a hash per key: `version` (monotonic integer) and
/// `data` (the JSON-encoded entry). The script performs the compare-and-set
/// in a single server-side step.
const CAS_SCRIPT: &str = r#"
local v = redis.call('HGET', KEYS[1], 'version')
if (not v and ARGV[1] == '0') or (v == ARGV[1]) then
  redis.call('HSET', KEYS[1], 'version', tonumber(ARGV[1]) + 1, 'data', ARGV[2])
  redis.call('EXPIRE', KEYS[1], tonumber(ARGV[3]))
  return 1
end
return 0
"#;

/// Redis-backed counter store.
///
/// Atomicity for the limiter's CAS loop comes from the version check inside
/// the Lua script; entry expiry doubles as garbage collection, so
/// `sweep_idle` is a no-op here.
pub struct RedisCounterStore {
    connection: ConnectionManager,
    config: RedisConfig,
    cas: Script,
}

impl RedisCounterStore {
    /// Connect and verify the backend with a PING.
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        info!(url = %config.url, "Connecting counter store");

        let client = redis::Client::open(config.url.clone())?;

        let connect_timeout = config.connection_timeout.unwrap_or(Duration::from_secs(10));
        let connection = match tokio::time::timeout(connect_timeout, client.get_connection_manager())
            .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to create connection manager");
                return Err(GateError::Redis(e));
            }
            Err(_) => {
                return Err(GateError::StoreUnavailable(format!(
                    "Timeout after {}s while connecting to Redis",
                    connect_timeout.as_secs()
                )));
            }
        };

        let store = Self {
            connection,
            config,
            cas: Script::new(CAS_SCRIPT),
        };
        store.health_check().await?;
        info!("Counter store connected");
        Ok(store)
    }

    fn command_timeout(&self) -> Duration {
        self.config.command_timeout.unwrap_or(Duration::from_secs(1))
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.command_timeout(), fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(GateError::Redis(e)),
            Err(_) => Err(GateError::StoreUnavailable(
                "Redis command timed out".to_string(),
            )),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn load(&self, key: &CounterKey) -> Result<Option<Versioned<CounterEntry>>> {
        let mut conn = self.connection.clone();
        let fields: (Option<u64>, Option<String>) = self
            .with_timeout(
                redis::cmd("HMGET")
                    .arg(key.to_string())
                    .arg("version")
                    .arg("data")
                    .query_async(&mut conn),
            )
            .await?;

        match fields {
            (Some(version), Some(data)) => {
                let value: CounterEntry = serde_json::from_str(&data)?;
                Ok(Some(Versioned { version, value }))
            }
            _ => Ok(None),
        }
    }

    async fn compare_and_store(
        &self,
        key: &CounterKey,
        expected_version: u64,
        entry: CounterEntry,
        ttl_secs: u64,
    ) -> Result<bool> {
        let payload = serde_json::to_string(&entry)?;
        let mut conn = self.connection.clone();
        let stored: i64 = self
            .with_timeout(
                self.cas
                    .key(key.to_string())
                    .arg(expected_version)
                    .arg(payload)
                    .arg(ttl_secs.max(1))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(stored == 1)
    }

    async fn remove(&self, key: &CounterKey) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: i64 = self
            .with_timeout(redis::cmd("DEL").arg(key.to_string()).query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn sweep_idle(&self, _now_ms: i64, _idle_for_ms: i64) -> Result<usize> {
        // Key TTLs set on every write already collect idle entries.
        Ok(0)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        self.with_timeout(redis::cmd("PING").query_async::<_, ()>(&mut conn))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.command_timeout, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_cas_script_shape() {
        // The script must gate the HSET on the version comparison and always
        // refresh the key TTL on a successful write.
        assert!(CAS_SCRIPT.contains("HGET"));
        assert!(CAS_SCRIPT.contains("HSET"));
        assert!(CAS_SCRIPT.contains("EXPIRE"));
    }
}
