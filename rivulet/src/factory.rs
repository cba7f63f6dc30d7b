//! Stream creation and the consumer-side stream handle.
//!
//! A stream goes from [`StreamFactory::configure`] (handler bound, not yet
//! started) to [`StreamPrototype::start`], which registers it with the loop
//! and returns the [`StreamHandle`] used to send the request. Handle calls
//! check the stream's usage contract synchronously and then post to the
//! loop; their effects are observed through the handler.

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::engine::Shared;
use crate::error::Error;
use crate::event::StreamHandler;
use crate::event_loop::LoopMsg;
use crate::headers::{RequestHeaders, split_authority};
use crate::pool::Upstream;

/// Creates streams on an engine.
#[derive(Clone)]
pub struct StreamFactory {
    shared: Arc<Shared>,
}

impl StreamFactory {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        StreamFactory { shared }
    }

    /// Bind `handler` to a new stream. The stream does nothing until
    /// [`StreamPrototype::start`] is called.
    pub fn configure<H: StreamHandler>(&self, handler: H) -> StreamPrototype {
        StreamPrototype {
            shared: self.shared.clone(),
            handler: Box::new(handler),
        }
    }
}

/// A configured stream that has not been started. Starting consumes it.
pub struct StreamPrototype {
    shared: Arc<Shared>,
    handler: Box<dyn StreamHandler>,
}

impl StreamPrototype {
    /// Start the stream.
    ///
    /// With `explicit_flow_control` the handler receives response data only
    /// in answer to [`StreamHandle::read_data`]; otherwise data is delivered
    /// as it arrives.
    pub fn start(self, explicit_flow_control: bool) -> Result<StreamHandle, Error> {
        let id = self.shared.next_stream_id();
        let started_at = self.shared.clock.now();
        self.shared.post(LoopMsg::Start {
            id,
            handler: self.handler,
            explicit_flow_control,
            started_at,
        })?;
        trace!(stream_id = id, "stream start posted");
        Ok(StreamHandle {
            id,
            shared: self.shared,
            explicit_flow_control,
            headers_sent: false,
            request_ended: false,
        })
    }
}

/// Consumer handle for a started stream.
///
/// Dropping the handle before the request has been fully sent (headers not
/// sent, or body not closed) cancels the stream, since nothing could ever
/// finish it. Once the request is complete, dropping the handle leaves the
/// stream running to its terminal event. A pull-mode stream needs its
/// handle for `read_data` and should be cancelled rather than abandoned.
pub struct StreamHandle {
    id: u64,
    shared: Arc<Shared>,
    explicit_flow_control: bool,
    headers_sent: bool,
    request_ended: bool,
}

impl StreamHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send the request headers. The authority selects the upstream and
    /// connection establishment begins. With `end_stream` the request has no
    /// body.
    pub fn send_headers(&mut self, headers: RequestHeaders, end_stream: bool) -> Result<(), Error> {
        if self.headers_sent {
            return Err(Error::InvalidStreamOperation("headers already sent"));
        }
        let scheme = headers.scheme();
        let (host, port) = split_authority(headers.authority(), scheme.default_port())
            .ok_or_else(|| Error::InvalidAuthority(headers.authority().to_string()))?;
        let upstream = Upstream {
            tls: scheme.is_tls(),
            host,
            port,
        };
        self.shared.post(LoopMsg::SendHeaders {
            id: self.id,
            headers,
            upstream,
            end_stream,
        })?;
        self.headers_sent = true;
        self.request_ended = end_stream;
        Ok(())
    }

    /// Send a chunk of the request body.
    pub fn send_data(&mut self, data: Bytes, end_stream: bool) -> Result<(), Error> {
        if !self.headers_sent {
            return Err(Error::InvalidStreamOperation("headers not sent"));
        }
        if self.request_ended {
            return Err(Error::InvalidStreamOperation("request already ended"));
        }
        self.shared.post(LoopMsg::SendData {
            id: self.id,
            data,
            end_stream,
        })?;
        self.request_ended = end_stream;
        Ok(())
    }

    /// End the request body.
    pub fn close(&mut self) -> Result<(), Error> {
        self.send_data(Bytes::new(), true)
    }

    /// Ask for the next delivery of up to `max` response bytes. Only valid
    /// for streams started with explicit flow control.
    pub fn read_data(&mut self, max: usize) -> Result<(), Error> {
        if !self.explicit_flow_control {
            return Err(Error::InvalidStreamOperation(
                "read_data requires explicit flow control",
            ));
        }
        if max == 0 {
            return Err(Error::InvalidStreamOperation("read size must be non-zero"));
        }
        self.shared.post(LoopMsg::ReadData { id: self.id, max })
    }

    /// Request cancellation. The cancel event confirms it, unless the stream
    /// reached another terminal state first.
    pub fn cancel(&self) -> Result<(), Error> {
        self.shared.post(LoopMsg::Cancel { id: self.id })
    }

    /// A handle that can cancel this stream from any thread.
    pub fn canceller(&self) -> StreamCanceller {
        StreamCanceller {
            id: self.id,
            shared: self.shared.clone(),
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if !self.request_ended {
            trace!(stream_id = self.id, "handle dropped with request open, cancelling");
            // Fails only when the engine has stopped, which cancels it anyway.
            let _ = self.shared.post(LoopMsg::Cancel { id: self.id });
        }
    }
}

/// Cancels one stream. Cloneable and usable from any thread, including from
/// inside a handler.
#[derive(Clone)]
pub struct StreamCanceller {
    id: u64,
    shared: Arc<Shared>,
}

impl StreamCanceller {
    pub fn stream_id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) -> Result<(), Error> {
        self.shared.post(LoopMsg::Cancel { id: self.id })
    }
}
