//! Stream events and the handlers that receive them.
//!
//! Every callback a stream makes is one [`StreamEvent`] passed to the
//! stream's [`StreamHandler`] on the engine thread. Exactly one of
//! `Complete`, `Error` or `Cancel` is delivered per stream, and it is always
//! the last event.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::warn;

use crate::error::{CancelReason, StreamError};
use crate::headers::ResponseHeaders;
use crate::intel::{FinalStreamIntel, StreamIntel};
use crate::metrics::EVENTS_DROPPED;

/// One callback invocation for a stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Response headers arrived. `end_stream` is set when no body follows.
    Headers {
        headers: ResponseHeaders,
        end_stream: bool,
        intel: StreamIntel,
    },
    /// A body chunk. The handler owns `data`.
    Data {
        data: Bytes,
        end_stream: bool,
        intel: StreamIntel,
    },
    /// The response finished normally.
    Complete {
        intel: StreamIntel,
        final_intel: FinalStreamIntel,
    },
    /// The exchange failed.
    Error {
        error: StreamError,
        intel: StreamIntel,
        final_intel: FinalStreamIntel,
    },
    /// The stream was cancelled by the consumer or by engine shutdown.
    Cancel {
        reason: CancelReason,
        intel: StreamIntel,
        final_intel: FinalStreamIntel,
    },
}

impl StreamEvent {
    /// Returns true for `Complete`, `Error` and `Cancel`.
    pub fn is_terminal(&self) -> bool {
        match self {
            StreamEvent::Headers { .. } | StreamEvent::Data { .. } => false,
            StreamEvent::Complete { .. } | StreamEvent::Error { .. } | StreamEvent::Cancel { .. } => {
                true
            }
        }
    }

    /// The snapshot every event carries.
    pub fn intel(&self) -> &StreamIntel {
        match self {
            StreamEvent::Headers { intel, .. }
            | StreamEvent::Data { intel, .. }
            | StreamEvent::Complete { intel, .. }
            | StreamEvent::Error { intel, .. }
            | StreamEvent::Cancel { intel, .. } => intel,
        }
    }

    /// The finalized record carried by a terminal event.
    pub fn final_intel(&self) -> Option<&FinalStreamIntel> {
        match self {
            StreamEvent::Headers { .. } | StreamEvent::Data { .. } => None,
            StreamEvent::Complete { final_intel, .. }
            | StreamEvent::Error { final_intel, .. }
            | StreamEvent::Cancel { final_intel, .. } => Some(final_intel),
        }
    }
}

/// Receives a stream's events on the engine thread.
///
/// Implementations must not block for long: every stream on the engine
/// shares the thread.
pub trait StreamHandler: Send + 'static {
    fn on_event(&mut self, event: StreamEvent);
}

impl<F> StreamHandler for F
where
    F: FnMut(StreamEvent) + Send + 'static,
{
    fn on_event(&mut self, event: StreamEvent) {
        self(event)
    }
}

type HeadersFn = Box<dyn FnMut(ResponseHeaders, bool, StreamIntel) + Send>;
type DataFn = Box<dyn FnMut(Bytes, bool) + Send>;
type CompleteFn = Box<dyn FnMut(StreamIntel, FinalStreamIntel) + Send>;
type ErrorFn = Box<dyn FnMut(StreamError, StreamIntel, FinalStreamIntel) + Send>;
type CancelFn = Box<dyn FnMut(StreamIntel, FinalStreamIntel) + Send>;

/// A callback set with each handler optional.
///
/// Events without a registered callback are dropped.
///
/// ```
/// use rivulet::{Callbacks, ReadinessLatch};
///
/// let done = ReadinessLatch::new();
/// let signal = done.clone();
/// let callbacks = Callbacks::new()
///     .on_data(|_chunk, _end_stream| {})
///     .on_complete(move |_intel, _final_intel| signal.set_ready());
/// # let _ = callbacks;
/// ```
#[derive(Default)]
pub struct Callbacks {
    on_headers: Option<HeadersFn>,
    on_data: Option<DataFn>,
    on_complete: Option<CompleteFn>,
    on_error: Option<ErrorFn>,
    on_cancel: Option<CancelFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_headers<F>(mut self, f: F) -> Self
    where
        F: FnMut(ResponseHeaders, bool, StreamIntel) + Send + 'static,
    {
        self.on_headers = Some(Box::new(f));
        self
    }

    pub fn on_data<F>(mut self, f: F) -> Self
    where
        F: FnMut(Bytes, bool) + Send + 'static,
    {
        self.on_data = Some(Box::new(f));
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnMut(StreamIntel, FinalStreamIntel) + Send + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnMut(StreamError, StreamIntel, FinalStreamIntel) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_cancel<F>(mut self, f: F) -> Self
    where
        F: FnMut(StreamIntel, FinalStreamIntel) + Send + 'static,
    {
        self.on_cancel = Some(Box::new(f));
        self
    }
}

impl StreamHandler for Callbacks {
    fn on_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Headers {
                headers,
                end_stream,
                intel,
            } => {
                if let Some(f) = self.on_headers.as_mut() {
                    f(headers, end_stream, intel);
                }
            }
            StreamEvent::Data {
                data, end_stream, ..
            } => {
                if let Some(f) = self.on_data.as_mut() {
                    f(data, end_stream);
                }
            }
            StreamEvent::Complete { intel, final_intel } => {
                if let Some(f) = self.on_complete.as_mut() {
                    f(intel, final_intel);
                }
            }
            StreamEvent::Error {
                error,
                intel,
                final_intel,
            } => {
                if let Some(f) = self.on_error.as_mut() {
                    f(error, intel, final_intel);
                }
            }
            StreamEvent::Cancel {
                intel, final_intel, ..
            } => {
                if let Some(f) = self.on_cancel.as_mut() {
                    f(intel, final_intel);
                }
            }
        }
    }
}

/// Handler that forwards events into a bounded channel.
///
/// Never blocks the engine thread. Non-terminal events that find the queue
/// full are dropped and counted; the terminal event always has a slot.
pub struct ChannelHandler {
    tx: Sender<StreamEvent>,
    capacity: usize,
}

impl StreamHandler for ChannelHandler {
    fn on_event(&mut self, event: StreamEvent) {
        // The last slot is kept for the terminal event.
        if !event.is_terminal() && self.tx.len() >= self.capacity {
            EVENTS_DROPPED.increment();
            warn!(stream_id = event.intel().stream_id, "event queue full, dropping event");
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => {
                EVENTS_DROPPED.increment();
                warn!(stream_id = event.intel().stream_id, "event queue full, dropping event");
            }
        }
    }
}

/// Create a handler that queues events for a consumer thread.
///
/// The queue holds up to `capacity` headers and data events plus the
/// terminal event. A consumer that falls further behind loses the events
/// that do not fit, so size `capacity` for the responses it expects or
/// drain promptly.
pub fn event_channel(capacity: usize) -> (ChannelHandler, Receiver<StreamEvent>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity + 1);
    (ChannelHandler { tx, capacity }, rx)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::headers::HeaderMap;

    fn complete() -> StreamEvent {
        StreamEvent::Complete {
            intel: StreamIntel::default(),
            final_intel: FinalStreamIntel::default(),
        }
    }

    #[test]
    fn callbacks_dispatch_by_variant() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (l1, l2, l3) = (log.clone(), log.clone(), log.clone());
        let mut callbacks = Callbacks::new()
            .on_headers(move |h, end, _| {
                l1.lock()
                    .unwrap()
                    .push(format!("headers {} {end}", h.http_status()))
            })
            .on_data(move |d, end| l2.lock().unwrap().push(format!("data {} {end}", d.len())))
            .on_complete(move |_, _| l3.lock().unwrap().push("complete".to_string()));

        callbacks.on_event(StreamEvent::Headers {
            headers: ResponseHeaders::new(200, HeaderMap::new()),
            end_stream: false,
            intel: StreamIntel::default(),
        });
        callbacks.on_event(StreamEvent::Data {
            data: Bytes::from_static(b"abc"),
            end_stream: true,
            intel: StreamIntel::default(),
        });
        callbacks.on_event(complete());

        assert_eq!(
            *log.lock().unwrap(),
            ["headers 200 false", "data 3 true", "complete"]
        );
    }

    #[test]
    fn missing_callbacks_are_ignored() {
        let mut callbacks = Callbacks::new();
        callbacks.on_event(complete());
        callbacks.on_event(StreamEvent::Cancel {
            reason: CancelReason::Consumer,
            intel: StreamIntel::default(),
            final_intel: FinalStreamIntel::default(),
        });
    }

    #[test]
    fn closures_are_handlers() {
        let count = Arc::new(Mutex::new(0));
        let seen = count.clone();
        let mut handler = move |event: StreamEvent| {
            if event.is_terminal() {
                *seen.lock().unwrap() += 1;
            }
        };
        handler.on_event(complete());
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn channel_handler_forwards_in_order() {
        let (mut handler, rx) = event_channel(4);
        handler.on_event(StreamEvent::Data {
            data: Bytes::from_static(b"x"),
            end_stream: false,
            intel: StreamIntel::default(),
        });
        handler.on_event(complete());

        assert!(!rx.recv().unwrap().is_terminal());
        let last = rx.recv().unwrap();
        assert!(last.is_terminal());
        assert!(last.final_intel().is_some());
    }

    #[test]
    fn full_channel_drops_data_but_keeps_terminal() {
        let (mut handler, rx) = event_channel(1);
        for _ in 0..3 {
            handler.on_event(StreamEvent::Data {
                data: Bytes::from_static(b"x"),
                end_stream: false,
                intel: StreamIntel::default(),
            });
        }
        handler.on_event(complete());

        let events: Vec<StreamEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::Data { .. }));
        assert!(events[1].is_terminal());
    }

    #[test]
    fn channel_handler_tolerates_dropped_receiver() {
        let (mut handler, rx) = event_channel(1);
        drop(rx);
        handler.on_event(complete());
    }
}
