//! Loop-side stream state machine.
//!
//! A [`Stream`] is one request/response exchange. It lives on the engine
//! thread, accumulates its telemetry record, and is the only place events
//! reach the consumer's handler. Exactly one terminal event is delivered;
//! anything attempted after it is counted as a contract violation and
//! dropped.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tracing::{trace, warn};

use crate::clock::Millis;
use crate::error::{CancelReason, StreamError};
use crate::event::{StreamEvent, StreamHandler};
use crate::headers::{RequestHeaders, ResponseHeaders};
use crate::intel::{FinalStreamIntel, Phase, StreamIntel};
use crate::metrics::{
    BYTES_RECEIVED, BYTES_SENT, CONTRACT_VIOLATIONS, STREAMS_ACTIVE, STREAMS_CANCELLED,
    STREAMS_COMPLETED, STREAMS_ERRORED,
};
use crate::pool::Upstream;
use crate::transport::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Started,
    HeadersReceived,
    DataReceiving,
    Completed,
    Errored,
    Cancelled,
}

impl StreamState {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Errored | StreamState::Cancelled
        )
    }
}

/// How a stream ended.
pub(crate) enum Outcome {
    Complete,
    Error(StreamError),
    Cancel(CancelReason),
}

pub(crate) struct Stream {
    pub id: u64,
    state: StreamState,
    handler: Box<dyn StreamHandler>,
    /// Explicit flow control: data is delivered only against `read_data`.
    pull: bool,
    intel: FinalStreamIntel,

    // ── Request ──────────────────────────────────────────────────────
    pub request: Option<RequestHeaders>,
    pub upstream: Option<Upstream>,
    body: BytesMut,
    /// The consumer ended the request body.
    pub request_complete: bool,
    /// Serialized request, kept until the exchange finishes so it can be
    /// moved to another connection if the first one was found closed.
    pub wire: Option<Bytes>,

    // ── Connection ───────────────────────────────────────────────────
    pub conn: Option<ConnId>,
    pub attempts: u32,
    /// When the request started going out on the wire.
    send_started: Option<Millis>,

    // ── Response ─────────────────────────────────────────────────────
    received: u64,
    pending: VecDeque<Bytes>,
    remote_end: bool,
    end_delivered: bool,
    /// The connection has finished the exchange and been released.
    pub exchange_done: bool,
    /// Outstanding `read_data` budget in pull mode.
    want: Option<usize>,
}

impl Stream {
    pub(crate) fn new(
        id: u64,
        handler: Box<dyn StreamHandler>,
        pull: bool,
        started_at: Millis,
    ) -> Self {
        STREAMS_ACTIVE.increment();
        let intel = FinalStreamIntel {
            stream_start: Some(started_at),
            ..Default::default()
        };
        Stream {
            id,
            state: StreamState::Started,
            handler,
            pull,
            intel,
            request: None,
            upstream: None,
            body: BytesMut::new(),
            request_complete: false,
            wire: None,
            conn: None,
            attempts: 0,
            send_started: None,
            received: 0,
            pending: VecDeque::new(),
            remote_end: false,
            end_delivered: false,
            exchange_done: false,
            want: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> StreamState {
        self.state
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub(crate) fn intel_mut(&mut self) -> &mut FinalStreamIntel {
        &mut self.intel
    }

    /// Append request body bytes.
    pub(crate) fn push_request_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    pub(crate) fn take_request_body(&mut self) -> Bytes {
        self.body.split().freeze()
    }

    /// Snapshot passed with every event.
    pub(crate) fn snapshot(&self) -> StreamIntel {
        StreamIntel {
            stream_id: self.id,
            connection_id: self.conn,
            attempt_count: self.attempts,
            consumed_bytes_from_response: self.received,
        }
    }

    // ── Phase recording ──────────────────────────────────────────────

    pub(crate) fn on_send_started(&mut self, at: Millis) {
        self.send_started = Some(at);
    }

    /// The request has started going out on the wire.
    pub(crate) fn is_sending(&self) -> bool {
        self.send_started.is_some()
    }

    pub(crate) fn on_send_finished(&mut self, at: Millis, bytes: u64) {
        let Some(start) = self.send_started else {
            self.violation("send finished before it started");
            return;
        };
        self.intel.sending_start = Some(start);
        self.intel.sending_end = Some(at);
        self.intel.sent_byte_count += bytes;
        BYTES_SENT.add(bytes);
    }

    /// Forget the connection phases of a connection the stream is leaving.
    pub(crate) fn reset_connection_phases(&mut self) {
        for phase in [
            Phase::DnsStart,
            Phase::DnsEnd,
            Phase::ConnectStart,
            Phase::ConnectEnd,
            Phase::SslStart,
            Phase::SslEnd,
        ] {
            *self.intel.slot_mut(phase) = None;
        }
        self.intel.socket_reused = false;
    }

    // ── Response delivery ────────────────────────────────────────────

    /// Response head arrived.
    pub(crate) fn on_head(
        &mut self,
        headers: ResponseHeaders,
        end_stream: bool,
        received: u64,
        at: Millis,
    ) {
        if self.state != StreamState::Started {
            self.violation("response head after headers");
            return;
        }
        self.received = received;
        self.intel.record_once(Phase::ResponseStart, at);
        self.state = StreamState::HeadersReceived;
        if end_stream {
            self.remote_end = true;
            self.end_delivered = true;
        }
        let intel = self.snapshot();
        self.emit(StreamEvent::Headers {
            headers,
            end_stream,
            intel,
        });
    }

    /// Response body bytes arrived.
    pub(crate) fn on_body(&mut self, data: Bytes, end_stream: bool, received: u64) {
        if self.state == StreamState::Started || self.remote_end {
            self.violation("response body out of order");
            return;
        }
        self.received = received;
        if !data.is_empty() {
            self.pending.push_back(data);
        }
        self.remote_end = end_stream;
        self.deliver();
    }

    /// Pull mode: allow one delivery of up to `max` bytes.
    pub(crate) fn read_data(&mut self, max: usize) {
        self.want = Some(max);
        self.deliver();
    }

    fn deliver(&mut self) {
        if self.is_terminal() || self.state == StreamState::Started {
            return;
        }
        if self.pull {
            let Some(max) = self.want else {
                return;
            };
            let data = match self.pending.pop_front() {
                Some(mut front) if front.len() > max => {
                    let head = front.split_to(max);
                    self.pending.push_front(front);
                    head
                }
                Some(front) => front,
                None if self.remote_end && !self.end_delivered => Bytes::new(),
                None => return,
            };
            self.want = None;
            self.send_data(data);
        } else {
            while let Some(data) = self.pending.pop_front() {
                self.send_data(data);
            }
            if self.remote_end && !self.end_delivered {
                self.send_data(Bytes::new());
            }
        }
    }

    fn send_data(&mut self, data: Bytes) {
        let end_stream = self.remote_end && self.pending.is_empty();
        if end_stream {
            self.end_delivered = true;
        }
        self.state = StreamState::DataReceiving;
        let intel = self.snapshot();
        self.emit(StreamEvent::Data {
            data,
            end_stream,
            intel,
        });
    }

    /// Everything the consumer needs has been delivered and the connection
    /// is released.
    pub(crate) fn ready_to_complete(&self) -> bool {
        !self.is_terminal() && self.exchange_done && self.end_delivered && self.pending.is_empty()
    }

    // ── Terminal transitions ─────────────────────────────────────────

    /// Move to a terminal state and deliver the terminal event. The guard
    /// rejects every call after the first.
    pub(crate) fn finish(&mut self, outcome: Outcome, now: Millis) {
        if self.is_terminal() {
            self.violation("terminal transition on a finished stream");
            return;
        }
        self.state = match outcome {
            Outcome::Complete => StreamState::Completed,
            Outcome::Error(_) => StreamState::Errored,
            Outcome::Cancel(_) => StreamState::Cancelled,
        };
        self.intel.record_once(Phase::StreamEnd, now);
        self.intel.received_byte_count = self.received;
        self.pending.clear();
        BYTES_RECEIVED.add(self.received);
        STREAMS_ACTIVE.decrement();

        let intel = self.snapshot();
        let final_intel = self.intel;
        if let Err(violation) = final_intel.check_invariants() {
            warn!(stream_id = self.id, %violation, "telemetry invariant broken");
        }
        let event = match outcome {
            Outcome::Complete => {
                STREAMS_COMPLETED.increment();
                trace!(stream_id = self.id, "complete");
                StreamEvent::Complete { intel, final_intel }
            }
            Outcome::Error(mut error) => {
                STREAMS_ERRORED.increment();
                error.attempt_count = self.attempts;
                trace!(stream_id = self.id, %error, "error");
                StreamEvent::Error {
                    error,
                    intel,
                    final_intel,
                }
            }
            Outcome::Cancel(reason) => {
                STREAMS_CANCELLED.increment();
                trace!(stream_id = self.id, ?reason, "cancelled");
                StreamEvent::Cancel {
                    reason,
                    intel,
                    final_intel,
                }
            }
        };
        self.handler.on_event(event);
    }

    fn emit(&mut self, event: StreamEvent) {
        if self.is_terminal() {
            self.violation("event after terminal state");
            return;
        }
        self.handler.on_event(event);
    }

    fn violation(&self, what: &'static str) {
        CONTRACT_VIOLATIONS.increment();
        warn!(stream_id = self.id, state = ?self.state, "{what}");
    }
}
