//! Rule lifecycle management
//!
//! The manager owns the set of running instances and enforces the lifecycle
//! invariants: at most one instance per rule id, atomic start across
//! protocols, idempotent stop. Stop signals tasks and removes the instance
//! immediately without waiting for task exit, so a subsequent start can
//! proceed while old tasks drain.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{info, warn};

use super::flow::FlowSnapshot;
use super::instance::{ForwardTimeouts, RelayInstance};
use super::tcp::spawn_tcp_listener;
use super::udp::spawn_udp_listener;
use crate::config::RelayRule;
use crate::error::StartError;
use crate::geo::GeoLookup;
use crate::hub::Broadcaster;
use crate::store::RelayStore;

/// Point-in-time status of one rule
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RelayStatus {
    /// Whether an instance is running for the rule
    pub running: bool,
    /// Active flow count
    pub connections: u64,
    /// Cumulative inbound bytes
    pub bytes_in: u64,
    /// Cumulative outbound bytes
    pub bytes_out: u64,
}

impl RelayStatus {
    /// Status of a rule with no running instance
    #[must_use]
    pub fn stopped() -> Self {
        Self::default()
    }
}

/// Owner of all running relay instances
pub struct RelayManager {
    instances: DashMap<String, Arc<RelayInstance>>,
    timeouts: ForwardTimeouts,
    store: Arc<dyn RelayStore>,
    geo: Arc<dyn GeoLookup>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl RelayManager {
    /// Create a manager wired to its collaborators
    #[must_use]
    pub fn new(
        store: Arc<dyn RelayStore>,
        geo: Arc<dyn GeoLookup>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self::with_timeouts(store, geo, broadcaster, ForwardTimeouts::default())
    }

    /// Create a manager with custom data-path timeouts
    #[must_use]
    pub fn with_timeouts(
        store: Arc<dyn RelayStore>,
        geo: Arc<dyn GeoLookup>,
        broadcaster: Arc<dyn Broadcaster>,
        timeouts: ForwardTimeouts,
    ) -> Self {
        Self {
            instances: DashMap::new(),
            timeouts,
            store,
            geo,
            broadcaster,
        }
    }

    /// Start a rule
    ///
    /// Binds every listener the protocol selector asks for before
    /// registering the instance: if the UDP bind of a `both` rule fails, the
    /// already-bound TCP listener is closed and nothing is registered.
    ///
    /// # Errors
    ///
    /// Returns `StartError::AlreadyRunning` if an instance for the id
    /// exists, or `StartError::Bind` if a listener cannot bind.
    pub async fn start(&self, rule: &RelayRule) -> Result<(), StartError> {
        if self.instances.contains_key(&rule.id) {
            return Err(StartError::AlreadyRunning {
                id: rule.id.clone(),
            });
        }

        let tcp = if rule.protocol.has_tcp() {
            Some(
                TcpListener::bind(&rule.src)
                    .await
                    .map_err(|e| StartError::bind_tcp(&rule.src, e))?,
            )
        } else {
            None
        };

        let udp = if rule.protocol.has_udp() {
            match UdpSocket::bind(&rule.src).await {
                Ok(socket) => Some(Arc::new(socket)),
                Err(e) => {
                    // Atomic start: release the TCP listener before failing
                    drop(tcp);
                    return Err(StartError::bind_udp(&rule.src, e));
                }
            }
        } else {
            None
        };

        let instance = Arc::new(RelayInstance::new(
            rule.clone(),
            self.timeouts,
            Arc::clone(&self.store),
            Arc::clone(&self.geo),
            Arc::clone(&self.broadcaster),
        ));

        match self.instances.entry(rule.id.clone()) {
            Entry::Occupied(_) => {
                // Lost a concurrent start race; the bound sockets drop here
                warn!(rule = %rule.id, "Concurrent start detected");
                return Err(StartError::AlreadyRunning {
                    id: rule.id.clone(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&instance));
            }
        }

        if let Some(listener) = tcp {
            spawn_tcp_listener(Arc::clone(&instance), listener);
        }
        if let Some(socket) = udp {
            spawn_udp_listener(Arc::clone(&instance), socket);
        }
        tokio::spawn(Arc::clone(&instance).run_sampler());

        info!(
            rule = %rule.id,
            name = %rule.name,
            src = %rule.src,
            dst = %rule.dst,
            protocol = rule.protocol.as_str(),
            "Relay started"
        );
        Ok(())
    }

    /// Stop a rule
    ///
    /// Idempotent; safe to call on an id that is not running. The instance
    /// is removed from the map immediately and its tasks observe the stop
    /// signal at their next suspension point.
    pub fn stop(&self, id: &str) {
        if let Some((_, instance)) = self.instances.remove(id) {
            instance.signal_stop();
            info!(rule = %id, "Relay stopped");
        }
    }

    /// Stop every running rule, in no particular order
    pub fn stop_all(&self) {
        let ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop(&id);
        }
    }

    /// Whether an instance is running for the id
    #[must_use]
    pub fn is_running(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    /// Number of running instances
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.instances.len()
    }

    /// Status of one rule; all-zero when not running
    #[must_use]
    pub fn status(&self, id: &str) -> RelayStatus {
        match self.instances.get(id) {
            Some(instance) => {
                let counters = instance.counters();
                RelayStatus {
                    running: true,
                    connections: counters.active(),
                    bytes_in: counters.bytes_in(),
                    bytes_out: counters.bytes_out(),
                }
            }
            None => RelayStatus::stopped(),
        }
    }

    /// Status of every running rule
    #[must_use]
    pub fn all_status(&self) -> HashMap<String, RelayStatus> {
        self.instances
            .iter()
            .map(|entry| {
                let counters = entry.value().counters();
                let status = RelayStatus {
                    running: true,
                    connections: counters.active(),
                    bytes_in: counters.bytes_in(),
                    bytes_out: counters.bytes_out(),
                };
                (entry.key().clone(), status)
            })
            .collect()
    }

    /// Active flows of a rule, with durations recomputed; empty when not running
    #[must_use]
    pub fn connections(&self, id: &str) -> Vec<FlowSnapshot> {
        self.instances
            .get(id)
            .map(|instance| instance.active_snapshots())
            .unwrap_or_default()
    }

    /// Terminated flows of a rule, newest first; empty when not running
    #[must_use]
    pub fn history(&self, id: &str) -> Vec<FlowSnapshot> {
        self.instances
            .get(id)
            .map(|instance| instance.history_snapshots())
            .unwrap_or_default()
    }
}
