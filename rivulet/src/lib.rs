//! rivulet — streaming HTTP client engine with per-stream phase telemetry.
//!
//! An [`Engine`] owns one background thread running a single-threaded event
//! loop. Streams are created through a [`StreamFactory`]; each delivers its
//! response to a [`StreamHandler`] as a sequence of [`StreamEvent`]s on the
//! engine thread, ending in exactly one of `Complete`, `Error` or `Cancel`.
//! The terminal event carries a [`FinalStreamIntel`] with the timestamp of
//! every phase the exchange went through (resolution, connect, TLS, send,
//! first response byte, end).
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::{Arc, Mutex};
//!
//! use rivulet::{
//!     Callbacks, Engine, EngineConfig, Method, ReadinessLatch, RequestHeadersBuilder, Scheme,
//! };
//!
//! fn main() -> Result<(), rivulet::Error> {
//!     let mut engine = Engine::new(EngineConfig::default())?;
//!     engine.start()?;
//!
//!     let done = ReadinessLatch::new();
//!     let signal = done.clone();
//!     let body = Arc::new(Mutex::new(Vec::new()));
//!     let sink = body.clone();
//!     let callbacks = Callbacks::new()
//!         .on_data(move |chunk, _end_stream| sink.lock().unwrap().extend_from_slice(&chunk))
//!         .on_complete(move |_intel, final_intel| {
//!             println!("connect took {:?}", final_intel.connect_end);
//!             signal.set_ready();
//!         });
//!
//!     let mut stream = engine.new_stream_factory()?.configure(callbacks).start(false)?;
//!     let request = RequestHeadersBuilder::new(Method::Get, Scheme::Http, "127.0.0.1:8080", "/")
//!         .build();
//!     stream.send_headers(request, true)?;
//!     done.wait();
//!
//!     engine.terminate()?;
//!     engine.join()
//! }
//! ```
//!
//! # Threads
//!
//! Handlers for every stream of an engine run serialized on the engine
//! thread and must not block it. Each upstream connection is served by its
//! own transport thread, which the engine joins during shutdown.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod engine;
pub(crate) mod event_loop;
pub(crate) mod factory;
pub(crate) mod metrics;
pub(crate) mod pool;
pub(crate) mod stream;
pub(crate) mod transport;

// ── Public modules ──────────────────────────────────────────────────────
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod headers;
pub mod intel;
pub mod latch;

// ── Re-exports: Engine and streams ──────────────────────────────────────

/// Streaming HTTP client engine.
pub use engine::Engine;
/// Cross-thread cancellation handle for one stream.
pub use factory::StreamCanceller;
/// Creates streams on a running engine.
pub use factory::StreamFactory;
/// Consumer handle for a started stream.
pub use factory::StreamHandle;
/// A configured stream waiting to be started.
pub use factory::StreamPrototype;

// ── Re-exports: Events ──────────────────────────────────────────────────

/// Optional-closure handler builder.
pub use event::Callbacks;
/// Handler that forwards events into a bounded channel.
pub use event::ChannelHandler;
/// One callback invocation for a stream.
pub use event::StreamEvent;
/// Receives a stream's events on the engine thread.
pub use event::StreamHandler;
/// Create a queue-backed handler and its receiving end.
pub use event::event_channel;
/// One-shot cross-thread readiness signal.
pub use latch::ReadinessLatch;

// ── Re-exports: Headers ─────────────────────────────────────────────────

/// Ordered, case-insensitive header map.
pub use headers::HeaderMap;
/// Request method.
pub use headers::Method;
/// Request pseudo-headers plus the header map.
pub use headers::RequestHeaders;
/// Builder for [`RequestHeaders`].
pub use headers::RequestHeadersBuilder;
/// Response status and headers.
pub use headers::ResponseHeaders;
/// Request scheme.
pub use headers::Scheme;

// ── Re-exports: Telemetry ───────────────────────────────────────────────

/// Engine clock timestamp in milliseconds.
pub use clock::Millis;
/// Finalized per-phase telemetry for a stream.
pub use intel::FinalStreamIntel;
/// What a caller knows about an exchange, for validation.
pub use intel::IntelExpectations;
/// A broken telemetry invariant.
pub use intel::IntelViolation;
/// Timestamped phase of an exchange.
pub use intel::Phase;
/// Snapshot attached to every stream event.
pub use intel::StreamIntel;

// ── Re-exports: Configuration and errors ────────────────────────────────

/// Why a stream was cancelled.
pub use error::CancelReason;
/// Synchronous engine and handle errors.
pub use error::Error;
/// Failure class of an errored stream.
pub use error::ErrorCode;
/// Error delivered with a stream's error event.
pub use error::StreamError;
/// Builder for [`EngineConfig`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Engine configuration.
pub use config::EngineConfig;
/// TLS settings for `https` upstreams.
pub use config::TlsClientConfig;
