//! Echo server metrics.

use listener::ConnectionEventCallback;
use metriken::{Counter, Gauge, metric};
use socket2::SockAddr;
use std::os::fd::RawFd;

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_enqueued",
    description = "Connections handed to a worker through its queue"
)]
pub static CONNECTIONS_ENQUEUED: Counter = Counter::new();

#[metric(
    name = "connections_dequeued",
    description = "Connections a worker pulled off its queue"
)]
pub static CONNECTIONS_DEQUEUED: Counter = Counter::new();

#[metric(
    name = "connections_dropped",
    description = "Connections dropped by rate limiting, queue saturation, or deadline expiry"
)]
pub static CONNECTIONS_DROPPED: Counter = Counter::new();

#[metric(name = "accept_errors", description = "Failed accept attempts")]
pub static ACCEPT_ERRORS: Counter = Counter::new();

#[metric(
    name = "accept_backoffs",
    description = "Times the listener entered accept back-off"
)]
pub static ACCEPT_BACKOFFS: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

/// Feeds listener connection events into the metric registry.
pub struct MetricsObserver;

impl ConnectionEventCallback for MetricsObserver {
    fn on_connection_accepted(&self, _fd: RawFd, _peer: &SockAddr) {
        CONNECTIONS_ACCEPTED.increment();
    }

    fn on_connection_enqueued_for_acceptor_callback(&self, _fd: RawFd, _peer: &SockAddr) {
        CONNECTIONS_ENQUEUED.increment();
    }

    fn on_connection_dequeued_by_acceptor_callback(&self, _fd: RawFd, _peer: &SockAddr) {
        CONNECTIONS_DEQUEUED.increment();
    }

    fn on_connection_dropped(&self, _fd: RawFd, peer: &SockAddr, reason: &str) {
        CONNECTIONS_DROPPED.increment();
        tracing::warn!(peer = ?peer.as_socket(), "connection dropped: {reason}");
    }

    fn on_connection_accept_error(&self, errno: i32) {
        ACCEPT_ERRORS.increment();
        tracing::warn!(errno, "accept error");
    }

    fn on_backoff_started(&self) {
        ACCEPT_BACKOFFS.increment();
        tracing::warn!("accept back-off started");
    }

    fn on_backoff_ended(&self) {
        tracing::info!("accept back-off ended");
    }

    fn on_backoff_error(&self) {
        tracing::error!("failed to enter accept back-off");
    }
}
