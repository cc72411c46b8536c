//! Persistent-store collaborator interface
//!
//! The engine records access logs and hourly-aggregated traffic stats
//! through this interface. Statistics are best-effort: callers log failures
//! and carry on; the data plane never blocks on the store.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store operation failure
#[derive(Debug, Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

/// Access-log event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessAction {
    Connect,
    Disconnect,
}

impl AccessAction {
    /// Lowercase wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Outbound interface to the rules/stats store
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Record a connect or disconnect event for one client
    async fn save_access_log(
        &self,
        rule_id: &str,
        client_ip: &str,
        action: AccessAction,
        bytes_in: u64,
        bytes_out: u64,
        duration_secs: u64,
    ) -> Result<(), StoreError>;

    /// Add traffic deltas for one rule; the store aggregates per hour
    async fn save_relay_stat(
        &self,
        rule_id: &str,
        bytes_in: u64,
        bytes_out: u64,
        connections: u64,
    ) -> Result<(), StoreError>;
}

/// Store that discards everything
pub struct NoopStore;

#[async_trait]
impl RelayStore for NoopStore {
    async fn save_access_log(
        &self,
        _rule_id: &str,
        _client_ip: &str,
        _action: AccessAction,
        _bytes_in: u64,
        _bytes_out: u64,
        _duration_secs: u64,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn save_relay_stat(
        &self,
        _rule_id: &str,
        _bytes_in: u64,
        _bytes_out: u64,
        _connections: u64,
    ) -> Result<(), StoreError> {
        Ok(())
    }
}

/// One recorded access-log call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogRecord {
    pub rule_id: String,
    pub client_ip: String,
    pub action: AccessAction,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub duration_secs: u64,
}

/// One recorded stat call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatRecord {
    pub rule_id: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub connections: u64,
}

/// In-memory store that records every call, for tests and demos
#[derive(Debug, Default)]
pub struct MemoryStore {
    access_logs: Mutex<Vec<AccessLogRecord>>,
    stats: Mutex<Vec<RelayStatRecord>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the recorded access logs, in call order
    #[must_use]
    pub fn access_logs(&self) -> Vec<AccessLogRecord> {
        self.access_logs.lock().clone()
    }

    /// Copy of the recorded stats, in call order
    #[must_use]
    pub fn stats(&self) -> Vec<RelayStatRecord> {
        self.stats.lock().clone()
    }
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn save_access_log(
        &self,
        rule_id: &str,
        client_ip: &str,
        action: AccessAction,
        bytes_in: u64,
        bytes_out: u64,
        duration_secs: u64,
    ) -> Result<(), StoreError> {
        self.access_logs.lock().push(AccessLogRecord {
            rule_id: rule_id.to_string(),
            client_ip: client_ip.to_string(),
            action,
            bytes_in,
            bytes_out,
            duration_secs,
        });
        Ok(())
    }

    async fn save_relay_stat(
        &self,
        rule_id: &str,
        bytes_in: u64,
        bytes_out: u64,
        connections: u64,
    ) -> Result<(), StoreError> {
        self.stats.lock().push(RelayStatRecord {
            rule_id: rule_id.to_string(),
            bytes_in,
            bytes_out,
            connections,
        });
        Ok(())
    }
}
