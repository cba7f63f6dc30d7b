//! The engine thread's event loop.
//!
//! Everything that touches a stream happens here: consumer requests posted
//! by [`StreamHandle`](crate::StreamHandle)s and transport events posted by
//! connection threads arrive on one inbox and are handled in order. The loop
//! blocks on the inbox for at most one tick, then checks the shutdown flag.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, trace};

use crate::clock::Millis;
use crate::config::EngineConfig;
use crate::engine::Shared;
use crate::error::{CancelReason, ErrorCode, StreamError};
use crate::event::StreamHandler;
use crate::headers::{RequestHeaders, ResponseHeaders};
use crate::metrics::STREAMS_STARTED;
use crate::pool::{Pool, Upstream};
use crate::stream::{Outcome, Stream};
use crate::transport::{self, ConnId, Dispatch, TransportContext, TransportEvent};

/// Messages on the loop inbox.
pub(crate) enum LoopMsg {
    Start {
        id: u64,
        handler: Box<dyn StreamHandler>,
        explicit_flow_control: bool,
        started_at: Millis,
    },
    SendHeaders {
        id: u64,
        headers: RequestHeaders,
        upstream: Upstream,
        end_stream: bool,
    },
    SendData {
        id: u64,
        data: Bytes,
        end_stream: bool,
    },
    ReadData {
        id: u64,
        max: usize,
    },
    Cancel {
        id: u64,
    },
    Transport {
        conn: ConnId,
        event: TransportEvent,
    },
    Terminate,
}

pub(crate) struct EventLoop {
    shared: Arc<Shared>,
    inbox: Receiver<LoopMsg>,
    streams: HashMap<u64, Stream>,
    pool: Pool,
    user_agent: Option<String>,
    tick: Duration,
}

impl EventLoop {
    pub(crate) fn new(config: EngineConfig, shared: Arc<Shared>, inbox: Receiver<LoopMsg>) -> Self {
        let ctx = TransportContext::new(&config, shared.clock, shared.inbox.clone());
        EventLoop {
            pool: Pool::new(ctx, config.max_idle_per_upstream),
            shared,
            inbox,
            streams: HashMap::new(),
            user_agent: config.user_agent,
            tick: config.tick_interval,
        }
    }

    /// Run until terminated. Every stream still alive is cancelled and every
    /// transport thread joined before this returns.
    pub(crate) fn run(&mut self) {
        info!("engine loop running");
        loop {
            match self.inbox.recv_timeout(self.tick) {
                Ok(LoopMsg::Terminate) => break,
                Ok(msg) => self.handle(msg),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            self.pool.reap();
        }
        self.teardown();
        info!("engine loop stopped");
    }

    fn now(&self) -> Millis {
        self.shared.clock.now()
    }

    fn handle(&mut self, msg: LoopMsg) {
        match msg {
            LoopMsg::Start {
                id,
                handler,
                explicit_flow_control,
                started_at,
            } => {
                STREAMS_STARTED.increment();
                debug!(stream_id = id, explicit_flow_control, "stream started");
                self.streams.insert(
                    id,
                    Stream::new(id, handler, explicit_flow_control, started_at),
                );
            }
            LoopMsg::SendHeaders {
                id,
                headers,
                upstream,
                end_stream,
            } => self.send_headers(id, headers, upstream, end_stream),
            LoopMsg::SendData {
                id,
                data,
                end_stream,
            } => {
                let Some(stream) = self.streams.get_mut(&id) else {
                    return;
                };
                stream.push_request_body(&data);
                if end_stream {
                    stream.request_complete = true;
                    self.dispatch(id);
                }
            }
            LoopMsg::ReadData { id, max } => {
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.read_data(max);
                    self.maybe_complete(id);
                }
            }
            LoopMsg::Cancel { id } => self.cancel(id, CancelReason::Consumer),
            LoopMsg::Transport { conn, event } => self.transport_event(conn, event),
            LoopMsg::Terminate => {}
        }
    }

    fn send_headers(&mut self, id: u64, headers: RequestHeaders, upstream: Upstream, end_stream: bool) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        trace!(stream_id = id, method = %headers.method(), authority = headers.authority(), path = headers.path(), "send headers");
        stream.request = Some(headers);
        stream.upstream = Some(upstream);
        stream.request_complete = end_stream;
        if self.assign_connection(id) {
            self.dispatch(id);
        }
    }

    /// Give the stream a connection. Returns false if the stream failed.
    fn assign_connection(&mut self, id: u64) -> bool {
        let Some(stream) = self.streams.get_mut(&id) else {
            return false;
        };
        let Some(upstream) = stream.upstream.clone() else {
            return false;
        };
        match self.pool.acquire(&upstream, id) {
            Ok((conn, reused)) => {
                stream.conn = Some(conn);
                stream.attempts += 1;
                // A pooled connection reports the handshake it already did.
                if reused && let Some(c) = self.pool.get(conn) {
                    c.timings.apply_to(stream.intel_mut());
                    stream.intel_mut().socket_reused = true;
                }
                true
            }
            Err(e) => {
                let error = StreamError::new(
                    ErrorCode::ConnectFailure,
                    format!("failed to start connection: {e}"),
                );
                self.fail(id, error);
                false
            }
        }
    }

    /// Hand the complete request to the stream's connection.
    fn dispatch(&mut self, id: u64) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        let (Some(conn), true) = (stream.conn, stream.request_complete) else {
            return;
        };
        if stream.wire.is_none() {
            let body = stream.take_request_body();
            let Some(headers) = stream.request.as_ref() else {
                return;
            };
            stream.wire = Some(transport::encode_request(
                headers,
                &body,
                self.user_agent.as_deref(),
            ));
        }
        let (Some(wire), Some(headers)) = (stream.wire.clone(), stream.request.as_ref()) else {
            return;
        };
        let dispatch = Dispatch {
            stream_id: id,
            wire,
            head_request: transport::is_head_request(headers),
        };
        if let Some(c) = self.pool.get(conn)
            && !c.dispatch(dispatch)
        {
            // The thread has exited; its Closed event moves the stream on.
            trace!(stream_id = id, conn_id = conn, "dispatch to exited connection");
        }
    }

    fn transport_event(&mut self, conn: ConnId, event: TransportEvent) {
        let Some(c) = self.pool.get_mut(conn) else {
            // Already closed by the loop.
            return;
        };
        let stream_id = c.stream;

        match event {
            TransportEvent::Resolved { start, end } => c.timings.dns = Some((start, end)),
            TransportEvent::TlsHandshaken { start, end } => c.timings.tls = Some((start, end)),
            TransportEvent::Connected { start, end } => {
                c.timings.connect = Some((start, end));
                let timings = c.timings;
                debug!(conn_id = conn, "connected");
                if let Some(stream) = stream_id.and_then(|id| self.streams.get_mut(&id)) {
                    timings.apply_to(stream.intel_mut());
                }
            }
            TransportEvent::SendStarted(at) => {
                if let Some(stream) = stream_id.and_then(|id| self.streams.get_mut(&id)) {
                    stream.on_send_started(at);
                }
            }
            TransportEvent::SendFinished { at, bytes } => {
                if let Some(stream) = stream_id.and_then(|id| self.streams.get_mut(&id)) {
                    stream.on_send_finished(at, bytes);
                }
            }
            TransportEvent::Head {
                head,
                end_stream,
                received,
                at,
            } => {
                if let Some(stream) = stream_id.and_then(|id| self.streams.get_mut(&id)) {
                    let headers = ResponseHeaders::new(head.status, head.headers.into_iter().collect());
                    stream.on_head(headers, end_stream, received, at);
                }
            }
            TransportEvent::Body {
                data,
                end_stream,
                received,
            } => {
                if let Some(stream) = stream_id.and_then(|id| self.streams.get_mut(&id)) {
                    stream.on_body(data, end_stream, received);
                }
            }
            TransportEvent::Finished { reusable } => {
                self.pool.release(conn, reusable);
                if let Some(id) = stream_id {
                    if let Some(stream) = self.streams.get_mut(&id) {
                        stream.exchange_done = true;
                        stream.wire = None;
                    }
                    self.maybe_complete(id);
                }
            }
            TransportEvent::Failed { code, message } => {
                let timings = c.timings;
                self.pool.close(conn);
                if let Some(id) = stream_id {
                    if let Some(stream) = self.streams.get_mut(&id) {
                        timings.apply_to(stream.intel_mut());
                    }
                    self.fail(id, StreamError::new(code, message));
                }
            }
            TransportEvent::Closed => {
                self.pool.close(conn);
                let Some(id) = stream_id else {
                    return;
                };
                let Some(stream) = self.streams.get_mut(&id) else {
                    return;
                };
                if stream.is_sending() {
                    let error = StreamError::new(
                        ErrorCode::MidStreamProtocolError,
                        "connection closed before the response completed",
                    );
                    self.fail(id, error);
                } else {
                    // Nothing was written, so the request moves to a fresh
                    // connection unchanged.
                    debug!(stream_id = id, conn_id = conn, "connection closed before use, reassigning");
                    stream.conn = None;
                    stream.reset_connection_phases();
                    if self.assign_connection(id) {
                        self.dispatch(id);
                    }
                }
            }
        }
    }

    fn maybe_complete(&mut self, id: u64) {
        let ready = self
            .streams
            .get(&id)
            .is_some_and(Stream::ready_to_complete);
        if ready && let Some(mut stream) = self.streams.remove(&id) {
            let now = self.now();
            stream.finish(Outcome::Complete, now);
        }
    }

    fn fail(&mut self, id: u64, error: StreamError) {
        let Some(mut stream) = self.streams.remove(&id) else {
            return;
        };
        if let Some(conn) = stream.conn
            && !stream.exchange_done
        {
            self.pool.close(conn);
        }
        debug!(stream_id = id, %error, "stream failed");
        let now = self.now();
        stream.finish(Outcome::Error(error), now);
    }

    fn cancel(&mut self, id: u64, reason: CancelReason) {
        let Some(mut stream) = self.streams.remove(&id) else {
            return;
        };
        // A connection mid-exchange cannot be reused.
        if let Some(conn) = stream.conn
            && !stream.exchange_done
        {
            self.pool.close(conn);
        }
        debug!(stream_id = id, ?reason, "stream cancelled");
        let now = self.now();
        stream.finish(Outcome::Cancel(reason), now);
    }

    fn teardown(&mut self) {
        // Streams accepted before terminate may still be queued.
        while let Ok(msg) = self.inbox.try_recv() {
            if let LoopMsg::Start { .. } = msg {
                self.handle(msg);
            }
        }

        let mut ids: Vec<u64> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        debug!(in_flight = ids.len(), "cancelling streams for shutdown");
        for id in ids {
            self.cancel(id, CancelReason::EngineShutdown);
        }
        self.pool.shutdown();
    }
}
