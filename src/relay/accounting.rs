//! Traffic accounting primitives
//!
//! Atomic per-rule counters and a byte-counting write wrapper. The wrapper
//! composes over any async sink: each successful write of n bytes accounts
//! the actual n (not the requested length) against the owning flow and its
//! rule totals, so short writes under congestion are counted correctly.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;

use super::flow::Flow;

/// Direction of a transfer relative to the rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to target (`bytes_in`)
    Inbound,
    /// Target to client (`bytes_out`)
    Outbound,
}

/// Cumulative counters for one running rule
///
/// `bytes_in`/`bytes_out` are monotonic over the instance lifetime; `active`
/// tracks the size of the active-flow set and is updated under the same lock
/// that guards the set.
#[derive(Debug, Default)]
pub struct RelayCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    active: AtomicU64,
}

impl RelayCounters {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Account inbound bytes (client -> target)
    pub fn add_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    /// Account outbound bytes (target -> client)
    pub fn add_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    /// Record a flow entering the active set
    pub fn flow_opened(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a flow leaving the active set
    pub fn flow_closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Total inbound bytes
    #[must_use]
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Total outbound bytes
    #[must_use]
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Current active-flow count
    #[must_use]
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Byte-counting wrapper over an async sink
///
/// Accounts every successful write against the flow (and, through it, the
/// rule totals) in the configured direction. Flush and shutdown delegate to
/// the inner sink, so a half-close travels through the wrapper unchanged.
/// Write errors propagate as-is; nothing already accounted is rolled back.
#[derive(Debug)]
pub struct CountingWriter<W> {
    inner: W,
    flow: Arc<Flow>,
    direction: Direction,
}

impl<W: AsyncWrite + Unpin> CountingWriter<W> {
    /// Wrap a sink, accounting writes in `direction` against `flow`
    pub fn new(inner: W, flow: Arc<Flow>, direction: Direction) -> Self {
        Self {
            inner,
            flow,
            direction,
        }
    }

    /// Unwrap the inner sink
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.flow.record(this.direction, n as u64);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
