//! rivulet engine metrics.
//!
//! Process-wide counters for streams, connections and bytes. Registered with
//! metriken, so any metriken exporter picks them up.

use metriken::{Counter, Gauge, metric};

// ── Stream lifecycle ─────────────────────────────────────────────

#[metric(name = "rivulet/streams/started", description = "Total streams started")]
pub static STREAMS_STARTED: Counter = Counter::new();

#[metric(
    name = "rivulet/streams/completed",
    description = "Streams that completed normally"
)]
pub static STREAMS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "rivulet/streams/errored",
    description = "Streams that ended with a network or protocol error"
)]
pub static STREAMS_ERRORED: Counter = Counter::new();

#[metric(
    name = "rivulet/streams/cancelled",
    description = "Streams cancelled by the consumer or engine shutdown"
)]
pub static STREAMS_CANCELLED: Counter = Counter::new();

#[metric(
    name = "rivulet/streams/active",
    description = "Streams not yet in a terminal state"
)]
pub static STREAMS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "rivulet/streams/contract_violations",
    description = "Events dropped because the stream was already terminal"
)]
pub static CONTRACT_VIOLATIONS: Counter = Counter::new();

#[metric(
    name = "rivulet/streams/events_dropped",
    description = "Events a channel handler dropped because its queue was full"
)]
pub static EVENTS_DROPPED: Counter = Counter::new();

// ── Connections ──────────────────────────────────────────────────

#[metric(
    name = "rivulet/connections/opened",
    description = "Total upstream connections opened"
)]
pub static CONNECTIONS_OPENED: Counter = Counter::new();

#[metric(
    name = "rivulet/connections/reused",
    description = "Exchanges served by an idle pooled connection"
)]
pub static CONNECTIONS_REUSED: Counter = Counter::new();

#[metric(
    name = "rivulet/connections/active",
    description = "Currently open upstream connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "rivulet/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "rivulet/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();
