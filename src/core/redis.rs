use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{cmd, Client, RedisError};
use tokio::sync::RwLock;

/// Optional Redis connection. Every caller must work when it is disconnected.
#[derive(Clone)]
pub(crate) struct RedisHandle {
    url: String,
    manager: Arc<RwLock<Option<ConnectionManager>>>,
}

#[derive(Debug, Clone)]
pub(crate) enum RedisHealth {
    Healthy,
    Disconnected,
    Unhealthy(String),
}

impl RedisHandle {
    pub(crate) fn new(url: String) -> Self {
        Self { url, manager: Arc::new(RwLock::new(None)) }
    }

    pub(crate) async fn connect(&self) -> Result<(), RedisError> {
        let client = Client::open(self.url.clone())?;
        let manager = ConnectionManager::new(client).await?;
        *self.manager.write().await = Some(manager);
        Ok(())
    }

    pub(crate) async fn disconnect(&self) {
        *self.manager.write().await = None;
    }

    pub(crate) async fn health(&self) -> RedisHealth {
        let Some(mut manager) = self.manager().await else {
            return RedisHealth::Disconnected;
        };

        match cmd("PING").query_async::<_, String>(&mut manager).await {
            Ok(_) => RedisHealth::Healthy,
            Err(err) => RedisHealth::Unhealthy(err.to_string()),
        }
    }

    /// Returns `true` for the first caller inside a `window_seconds` window for `key`,
    /// `false` for everyone else until the key expires. Without a connection every
    /// caller is first.
    pub(crate) async fn claim_window(
        &self,
        key: &str,
        window_seconds: u64,
    ) -> Result<bool, RedisError> {
        if window_seconds == 0 {
            return Ok(true);
        }
        let Some(mut manager) = self.manager().await else {
            return Ok(true);
        };

        let reply: Option<String> = cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(window_seconds)
            .query_async(&mut manager)
            .await?;

        Ok(reply.is_some())
    }

    async fn manager(&self) -> Option<ConnectionManager> {
        self.manager.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::{RedisHandle, RedisHealth};

    #[tokio::test]
    async fn disconnected_handle_never_blocks_callers() {
        let redis = RedisHandle::new("redis://127.0.0.1:6379/1".to_string());

        assert!(matches!(redis.health().await, RedisHealth::Disconnected));
        assert!(redis.claim_window("tab-switch:s1", 5).await.expect("claim"));
        assert!(redis.claim_window("tab-switch:s1", 5).await.expect("claim"));
    }
}
