//! port-relay: managed TCP/UDP port forwarder with live telemetry
//!
//! This crate provides the relay engine behind an operator-facing port
//! forwarder: rules map a listen endpoint to a target endpoint, and each
//! started rule proxies TCP connections and/or UDP datagrams while keeping
//! live per-flow accounting and pushing one-second samples to observers.
//!
//! # Architecture
//!
//! ```text
//! Client → listener (per rule) → RelayInstance → target
//!                                    ↓ 1 Hz sampler
//!                              TelemetryHub → subscribers
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use port_relay::config::{Protocol, RelayRule};
//! use port_relay::geo::NoGeo;
//! use port_relay::hub::TelemetryHub;
//! use port_relay::relay::RelayManager;
//! use port_relay::store::NoopStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hub = Arc::new(TelemetryHub::new());
//! let manager = RelayManager::new(Arc::new(NoopStore), Arc::new(NoGeo), hub.clone());
//!
//! let rule = RelayRule::new("web", "0.0.0.0:8080", "10.0.0.5:80", Protocol::Tcp);
//! manager.start(&rule).await?;
//!
//! // ... later
//! manager.stop(&rule.id);
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Rule definitions, settings, JSON loading
//! - [`error`]: Error types
//! - [`relay`]: Forwarders, per-rule instances, the manager
//! - [`hub`]: Telemetry fan-out to topic/rule-filtered subscribers
//! - [`store`]: Persistent-store collaborator interface
//! - [`geo`]: IP-to-location collaborator interface

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod geo;
pub mod hub;
pub mod relay;
pub mod store;

// Re-export commonly used types at the crate root
pub use config::{load_config, load_config_str, LogConfig, Protocol, RelayConfig, RelayRule};
pub use error::{ConfigError, ForwardError, RelayError, StartError};
pub use geo::{GeoLookup, NoGeo, StaticGeo};
pub use hub::{
    Broadcaster, NullBroadcaster, SubscriberHandle, TelemetryEvent, TelemetryHub,
    DEFAULT_INBOX_CAPACITY, TOPIC_CONNECTIONS, TOPIC_TRAFFIC,
};
pub use relay::{
    CountingWriter, Direction, Flow, FlowHistory, FlowProtocol, FlowSnapshot, ForwardTimeouts,
    RateEstimator, RateSample, RelayCounters, RelayManager, RelayStatus, MAX_HISTORY,
};
pub use store::{
    AccessAction, AccessLogRecord, MemoryStore, NoopStore, RelayStatRecord, RelayStore, StoreError,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
