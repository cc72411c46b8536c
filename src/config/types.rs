//! Configuration types for port-relay
//!
//! This module defines the forwarding rules and runtime settings loaded at
//! startup. Configuration is JSON and validated before any listener binds.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Protocol selector for a forwarding rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Forward TCP connections only
    Tcp,
    /// Forward UDP datagrams only
    Udp,
    /// Forward both TCP and UDP on the same source endpoint
    Both,
}

impl Protocol {
    /// Whether this selector includes TCP
    #[must_use]
    pub const fn has_tcp(self) -> bool {
        matches!(self, Self::Tcp | Self::Both)
    }

    /// Whether this selector includes UDP
    #[must_use]
    pub const fn has_udp(self) -> bool {
        matches!(self, Self::Udp | Self::Both)
    }

    /// Lowercase wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Both => "both",
        }
    }
}

/// A configured forwarding directive
///
/// The engine treats rules as read-only input: `enabled` is interpreted by
/// the caller (start enabled rules at boot), never by the engine itself.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayRule {
    /// Opaque unique identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Listen endpoint, `host:port`
    pub src: String,

    /// Target endpoint, `host:port` (hostname resolved at dial time)
    pub dst: String,

    /// Protocol selector
    pub protocol: Protocol,

    /// Whether the rule should be started at boot
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

impl RelayRule {
    /// Create a rule with a freshly generated id
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        src: impl Into<String>,
        dst: impl Into<String>,
        protocol: Protocol,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            src: src.into(),
            dst: dst.into(),
            protocol,
            enabled: true,
        }
    }

    /// Validate the rule
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if an endpoint is malformed or
    /// the id is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::ValidationError("Rule id must not be empty".into()));
        }
        validate_endpoint("src", &self.src)?;
        validate_endpoint("dst", &self.dst)?;
        Ok(())
    }
}

/// Check that an endpoint looks like `host:port` with a numeric port
fn validate_endpoint(field: &str, endpoint: &str) -> Result<(), ConfigError> {
    let Some((host, port)) = endpoint.rsplit_once(':') else {
        return Err(ConfigError::ValidationError(format!(
            "{field} '{endpoint}' is not in host:port form"
        )));
    };
    if host.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "{field} '{endpoint}' has an empty host"
        )));
    }
    if port.parse::<u16>().is_err() {
        return Err(ConfigError::ValidationError(format!(
            "{field} '{endpoint}' has an invalid port '{port}'"
        )));
    }
    Ok(())
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Forwarding rules
    pub rules: Vec<RelayRule>,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl RelayConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if any rule is invalid or two
    /// rules share an id.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids: HashSet<&str> = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !ids.insert(&rule.id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate rule id: {}",
                    rule.id
                )));
            }
        }
        Ok(())
    }

    /// Create an empty configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            rules: Vec::new(),
            log: LogConfig::default(),
        }
    }
}
