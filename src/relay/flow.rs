//! Per-connection flow state
//!
//! A `Flow` is one client-to-target session: a TCP connection or a UDP
//! client-session. Identity fields are immutable after creation; byte
//! counters are updated via atomics from the data path and published to
//! observers only as snapshot copies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::accounting::{Direction, RelayCounters};

/// Maximum number of terminated flows retained per instance
pub const MAX_HISTORY: usize = 100;

/// Transport protocol of a single flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowProtocol {
    Tcp,
    Udp,
}

impl FlowProtocol {
    /// Lowercase wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// Live state of one flow
///
/// Shared between the flow's data-path tasks (which mutate the counters) and
/// the sampler (which reads them atomically). No field is shared mutably.
#[derive(Debug)]
pub struct Flow {
    id: String,
    client_ip: String,
    client_location: String,
    target: String,
    protocol: FlowProtocol,
    started_at: DateTime<Utc>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    active: AtomicBool,
    totals: Arc<RelayCounters>,
}

impl Flow {
    /// Create an active flow with a freshly generated id
    #[must_use]
    pub fn new(
        client_ip: impl Into<String>,
        client_location: String,
        target: String,
        protocol: FlowProtocol,
        totals: Arc<RelayCounters>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            client_ip: client_ip.into(),
            client_location,
            target,
            protocol,
            started_at: Utc::now(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            active: AtomicBool::new(true),
            totals,
        }
    }

    /// Flow id (unique within the rule)
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Client IP in textual form
    #[must_use]
    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    /// Whether the flow is still in the active set
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Inbound bytes so far
    #[must_use]
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Outbound bytes so far
    #[must_use]
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Account inbound bytes against this flow and its rule totals
    pub fn record_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
        self.totals.add_in(n);
    }

    /// Account outbound bytes against this flow and its rule totals
    pub fn record_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
        self.totals.add_out(n);
    }

    /// Account bytes in the given direction
    pub fn record(&self, direction: Direction, n: u64) {
        match direction {
            Direction::Inbound => self.record_in(n),
            Direction::Outbound => self.record_out(n),
        }
    }

    /// Copy the live state for publication, recomputing the duration
    #[must_use]
    pub fn snapshot(&self, now: DateTime<Utc>) -> FlowSnapshot {
        FlowSnapshot {
            id: self.id.clone(),
            client_ip: self.client_ip.clone(),
            client_location: self.client_location.clone(),
            target: self.target.clone(),
            protocol: self.protocol,
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
            started_at: self.started_at,
            ended_at: None,
            duration: duration_secs(self.started_at, now),
            active: self.is_active(),
        }
    }

    /// Terminate the flow and freeze its counters
    ///
    /// Returns the final snapshot exactly once; a second call returns `None`.
    /// The caller is responsible for moving the snapshot to history and
    /// removing the flow from the active set.
    #[must_use]
    pub fn finalize(&self, now: DateTime<Utc>) -> Option<FlowSnapshot> {
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        Some(FlowSnapshot {
            id: self.id.clone(),
            client_ip: self.client_ip.clone(),
            client_location: self.client_location.clone(),
            target: self.target.clone(),
            protocol: self.protocol,
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
            started_at: self.started_at,
            ended_at: Some(now),
            duration: duration_secs(self.started_at, now),
            active: false,
        })
    }
}

/// Whole seconds between two instants, truncated, never negative
fn duration_secs(started_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    now.signed_duration_since(started_at).num_seconds().max(0) as u64
}

/// Point-in-time copy of a flow, safe to serialize and hand to observers
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FlowSnapshot {
    /// Flow id
    pub id: String,
    /// Client IP
    pub client_ip: String,
    /// Client location from the geo lookup, empty when unknown
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_location: String,
    /// Target endpoint
    pub target: String,
    /// Transport protocol
    pub protocol: FlowProtocol,
    /// Inbound bytes
    pub bytes_in: u64,
    /// Outbound bytes
    pub bytes_out: u64,
    /// Creation time
    pub started_at: DateTime<Utc>,
    /// Termination time, absent while active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Whole seconds from start to end (or to the snapshot time)
    pub duration: u64,
    /// Whether the flow was active at snapshot time
    pub active: bool,
}

/// Ring of the most recent terminated flows, newest first
#[derive(Debug, Default)]
pub struct FlowHistory {
    entries: VecDeque<FlowSnapshot>,
}

impl FlowHistory {
    /// Create an empty history
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a terminated flow at the front, evicting the oldest past capacity
    pub fn push(&mut self, snapshot: FlowSnapshot) {
        self.entries.push_front(snapshot);
        self.entries.truncate(MAX_HISTORY);
    }

    /// Number of retained entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the history is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the ring, newest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<FlowSnapshot> {
        self.entries.iter().cloned().collect()
    }
}
