//! Runtime state for one started rule
//!
//! A `RelayInstance` owns the rule's listeners (held by their tasks), the
//! active-flow map, the history ring, the cumulative counters, and the
//! one-second status-push sampler. Its lifetime is bounded by the manager's
//! {start, stop} pair; after stop it is discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::accounting::RelayCounters;
use super::flow::{Flow, FlowHistory, FlowProtocol, FlowSnapshot};
use super::rate::RateEstimator;
use crate::config::RelayRule;
use crate::geo::GeoLookup;
use crate::hub::{Broadcaster, TOPIC_CONNECTIONS, TOPIC_TRAFFIC};
use crate::store::{AccessAction, RelayStore};

/// Sampler period
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Data-path timeouts
///
/// The defaults are the contract: TCP dial 5 s, UDP target read 30 s (the
/// session liveness bound), UDP listen read 1 s (cancellation
/// responsiveness). Tests compress them to keep scenarios fast.
#[derive(Debug, Clone, Copy)]
pub struct ForwardTimeouts {
    /// TCP connect timeout to the target
    pub dial: Duration,
    /// UDP target-side read deadline; a silent session is reaped after this
    pub udp_target_read: Duration,
    /// UDP listening-socket read deadline
    pub udp_listen_read: Duration,
}

impl Default for ForwardTimeouts {
    fn default() -> Self {
        Self {
            dial: Duration::from_secs(5),
            udp_target_read: Duration::from_secs(30),
            udp_listen_read: Duration::from_secs(1),
        }
    }
}

/// Runtime object for a started rule
pub(crate) struct RelayInstance {
    rule: RelayRule,
    counters: Arc<RelayCounters>,
    flows: Mutex<HashMap<String, Arc<Flow>>>,
    history: Mutex<FlowHistory>,
    shutdown_tx: broadcast::Sender<()>,
    stopping: AtomicBool,
    timeouts: ForwardTimeouts,
    store: Arc<dyn RelayStore>,
    geo: Arc<dyn GeoLookup>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl RelayInstance {
    pub(crate) fn new(
        rule: RelayRule,
        timeouts: ForwardTimeouts,
        store: Arc<dyn RelayStore>,
        geo: Arc<dyn GeoLookup>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            rule,
            counters: Arc::new(RelayCounters::new()),
            flows: Mutex::new(HashMap::new()),
            history: Mutex::new(FlowHistory::new()),
            shutdown_tx,
            stopping: AtomicBool::new(false),
            timeouts,
            store,
            geo,
            broadcaster,
        }
    }

    pub(crate) fn rule(&self) -> &RelayRule {
        &self.rule
    }

    pub(crate) fn timeouts(&self) -> ForwardTimeouts {
        self.timeouts
    }

    pub(crate) fn counters(&self) -> &RelayCounters {
        &self.counters
    }

    /// Subscribe to the stop signal
    ///
    /// Every task created by this instance holds a receiver and observes it
    /// at its next suspension point.
    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal every task to stop
    pub(crate) fn signal_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Create a flow for a new client and register it in the active set
    ///
    /// `active_count` and the flow set are updated under the same lock.
    pub(crate) fn open_flow(&self, client_ip: &str, protocol: FlowProtocol) -> Arc<Flow> {
        let location = self.geo.lookup(client_ip).unwrap_or_default();
        let flow = Arc::new(Flow::new(
            client_ip,
            location,
            self.rule.dst.clone(),
            protocol,
            Arc::clone(&self.counters),
        ));

        let mut flows = self.flows.lock();
        flows.insert(flow.id().to_string(), Arc::clone(&flow));
        self.counters.flow_opened();
        drop(flows);

        debug!(
            rule = %self.rule.id,
            flow = %flow.id(),
            client = client_ip,
            protocol = protocol.as_str(),
            "Flow opened"
        );
        flow
    }

    /// Terminate a flow: freeze counters, move it to history, persist stats
    ///
    /// Idempotent; only the first caller performs the transition.
    pub(crate) async fn finalize_flow(&self, flow: &Arc<Flow>) {
        let now = Utc::now();
        let Some(snapshot) = flow.finalize(now) else {
            return;
        };

        {
            let mut flows = self.flows.lock();
            if flows.remove(flow.id()).is_some() {
                self.counters.flow_closed();
            }
        }
        self.history.lock().push(snapshot.clone());

        debug!(
            rule = %self.rule.id,
            flow = %snapshot.id,
            bytes_in = snapshot.bytes_in,
            bytes_out = snapshot.bytes_out,
            duration = snapshot.duration,
            "Flow closed"
        );

        self.persist_flow_end(&snapshot).await;
    }

    /// Record the connect access log; failures are logged and swallowed
    pub(crate) async fn persist_connect(&self, client_ip: &str) {
        if let Err(e) = self
            .store
            .save_access_log(&self.rule.id, client_ip, AccessAction::Connect, 0, 0, 0)
            .await
        {
            warn!(rule = %self.rule.id, "Failed to save access log: {}", e);
        }
    }

    /// Persist aggregated stats and the disconnect access log (best-effort)
    async fn persist_flow_end(&self, snapshot: &FlowSnapshot) {
        if let Err(e) = self
            .store
            .save_relay_stat(&self.rule.id, snapshot.bytes_in, snapshot.bytes_out, 1)
            .await
        {
            warn!(rule = %self.rule.id, "Failed to save relay stat: {}", e);
        }
        if let Err(e) = self
            .store
            .save_access_log(
                &self.rule.id,
                &snapshot.client_ip,
                AccessAction::Disconnect,
                snapshot.bytes_in,
                snapshot.bytes_out,
                snapshot.duration,
            )
            .await
        {
            warn!(rule = %self.rule.id, "Failed to save access log: {}", e);
        }
    }

    /// Snapshot every active flow with its duration recomputed
    pub(crate) fn active_snapshots(&self) -> Vec<FlowSnapshot> {
        let now = Utc::now();
        self.flows
            .lock()
            .values()
            .map(|flow| flow.snapshot(now))
            .collect()
    }

    /// Copy of the terminated-flow ring, newest first
    pub(crate) fn history_snapshots(&self) -> Vec<FlowSnapshot> {
        self.history.lock().snapshot()
    }

    /// One-second status-push loop
    ///
    /// Publishes `relay.connections` (active flows plus history) and
    /// `relay.traffic` (totals plus smoothed rates) each tick. Exits on the
    /// stop signal. Never blocks on a slow subscriber; the hub drops to it.
    pub(crate) async fn run_sampler(self: Arc<Self>) {
        let mut shutdown = self.subscribe_shutdown();
        let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut estimator = RateEstimator::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => self.push_status(&mut estimator),
            }
        }

        debug!(rule = %self.rule.id, "Sampler stopped");
    }

    /// Emit one tick's samples
    fn push_status(&self, estimator: &mut RateEstimator) {
        let mut connections = self.active_snapshots();
        connections.extend(self.history_snapshots());

        self.broadcaster.broadcast_to_relay(
            &self.rule.id,
            TOPIC_CONNECTIONS,
            json!({
                "relay_id": self.rule.id,
                "connections": connections,
            }),
        );

        let bytes_in = self.counters.bytes_in();
        let bytes_out = self.counters.bytes_out();
        let rates = estimator.tick(bytes_in, bytes_out);

        self.broadcaster.broadcast_to_relay(
            &self.rule.id,
            TOPIC_TRAFFIC,
            json!({
                "relay_id": self.rule.id,
                "bytes_in": bytes_in,
                "bytes_out": bytes_out,
                "bytes_in_speed": rates.in_bps,
                "bytes_out_speed": rates.out_bps,
                "connections": self.counters.active(),
            }),
        );
    }
}
