//! Upstream connection threads.
//!
//! Each pooled connection is driven by one blocking thread. The thread
//! resolves, connects and (for `https`) completes the TLS handshake, then
//! serves the requests the event loop dispatches to it one at a time. Every
//! phase is timestamped here, on the transport thread, from the engine clock
//! and posted to the loop inbox as a [`TransportEvent`].
//!
//! The loop closes a connection by dropping its command sender and calling
//! [`Abort::abort`], which shuts the socket down (now, or as soon as the
//! connect finishes) and so unblocks any pending read.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use protocol_http1::{BodyKind, Decoded, ParseError, RequestHead, ResponseDecoder, ResponseHead};
use rustls::pki_types::ServerName;
use tracing::{debug, trace};

use crate::clock::{Clock, Millis};
use crate::config::EngineConfig;
use crate::error::ErrorCode;
use crate::event_loop::LoopMsg;
use crate::headers::{Method, RequestHeaders};

pub(crate) type ConnId = u64;

/// What the loop hears from a connection thread.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    /// Name resolution finished.
    Resolved { start: Millis, end: Millis },
    /// TLS handshake finished.
    TlsHandshaken { start: Millis, end: Millis },
    /// The connection is ready for requests. `start` is when the TCP connect
    /// began, `end` is after any TLS handshake.
    Connected { start: Millis, end: Millis },
    SendStarted(Millis),
    SendFinished { at: Millis, bytes: u64 },
    /// Response head. `received` counts wire bytes read for this exchange.
    Head {
        head: ResponseHead,
        end_stream: bool,
        received: u64,
        at: Millis,
    },
    Body {
        data: Bytes,
        end_stream: bool,
        received: u64,
    },
    /// The exchange is over; `reusable` if the connection can carry another.
    Finished { reusable: bool },
    /// The connection failed. A `Closed` event follows.
    Failed { code: ErrorCode, message: String },
    /// The thread exited. Always the last event for a connection.
    Closed,
}

/// Shared between the loop and one connection thread.
#[derive(Debug, Default)]
pub(crate) struct Abort {
    inner: Mutex<AbortState>,
}

#[derive(Debug, Default)]
struct AbortState {
    aborted: bool,
    socket: Option<TcpStream>,
}

impl Abort {
    fn lock(&self) -> MutexGuard<'_, AbortState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shut the connection's socket down. If it is not connected yet, the
    /// thread gives up as soon as the connect returns.
    pub(crate) fn abort(&self) {
        let mut state = self.lock();
        state.aborted = true;
        if let Some(socket) = state.socket.take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    /// Hand over a clone of the connected socket. Returns false if the
    /// connection was aborted in the meantime.
    fn register(&self, socket: TcpStream) -> bool {
        let mut state = self.lock();
        if state.aborted {
            return false;
        }
        state.socket = Some(socket);
        true
    }
}

/// A serialized request handed to a connection thread.
#[derive(Debug)]
pub(crate) struct Dispatch {
    pub stream_id: u64,
    pub wire: Bytes,
    pub head_request: bool,
}

/// Settings every connection thread shares.
#[derive(Clone)]
pub(crate) struct TransportContext {
    pub clock: Clock,
    pub inbox: Sender<LoopMsg>,
    pub tls: Arc<rustls::ClientConfig>,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub recv_buffer_size: usize,
    pub max_head_size: usize,
    pub tcp_nodelay: bool,
}

impl TransportContext {
    pub(crate) fn new(config: &EngineConfig, clock: Clock, inbox: Sender<LoopMsg>) -> Self {
        TransportContext {
            clock,
            inbox,
            tls: config.client_tls(),
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_connection_timeout,
            recv_buffer_size: config.recv_buffer_size,
            max_head_size: config.max_response_head_size,
            tcp_nodelay: config.tcp_nodelay,
        }
    }
}

/// Spawn the thread for connection `conn` to `host:port`.
pub(crate) fn spawn(
    conn: ConnId,
    host: String,
    port: u16,
    use_tls: bool,
    ctx: TransportContext,
    commands: Receiver<Dispatch>,
    abort: Arc<Abort>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("rivulet-conn-{conn}"))
        .spawn(move || {
            let mut worker = Worker {
                conn,
                ctx,
                commands,
                abort,
            };
            worker.run(&host, port, use_tls);
            worker.post(TransportEvent::Closed);
        })
}

/// Plain or TLS byte stream over a connected socket.
enum Io {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Io {
    fn socket(&self) -> &TcpStream {
        match self {
            Io::Plain(sock) => sock,
            Io::Tls(tls) => tls.get_ref(),
        }
    }
}

impl Read for Io {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Io::Plain(sock) => sock.read(buf),
            Io::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Io {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Io::Plain(sock) => sock.write(buf),
            Io::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Io::Plain(sock) => sock.flush(),
            Io::Tls(tls) => tls.flush(),
        }
    }
}

struct Failure {
    code: ErrorCode,
    message: String,
}

impl Failure {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Failure {
            code,
            message: message.into(),
        }
    }

    fn protocol(err: ParseError) -> Self {
        Failure::new(ErrorCode::MidStreamProtocolError, err.to_string())
    }

    fn io(err: io::Error) -> Self {
        Failure::new(ErrorCode::MidStreamProtocolError, err.to_string())
    }
}

struct Worker {
    conn: ConnId,
    ctx: TransportContext,
    commands: Receiver<Dispatch>,
    abort: Arc<Abort>,
}

impl Worker {
    fn post(&self, event: TransportEvent) {
        // A closed inbox means the loop has exited; nothing is listening.
        let _ = self.ctx.inbox.send(LoopMsg::Transport {
            conn: self.conn,
            event,
        });
    }

    fn now(&self) -> Millis {
        self.ctx.clock.now()
    }

    fn run(&mut self, host: &str, port: u16, use_tls: bool) {
        let mut io = match self.connect(host, port, use_tls) {
            Ok(io) => io,
            Err(failure) => {
                debug!(conn_id = self.conn, code = %failure.code, "connect failed: {}", failure.message);
                self.post(TransportEvent::Failed {
                    code: failure.code,
                    message: failure.message,
                });
                return;
            }
        };

        let mut first = true;
        loop {
            let dispatch = match self.commands.recv_timeout(self.ctx.idle_timeout) {
                Ok(dispatch) => dispatch,
                Err(RecvTimeoutError::Timeout) => {
                    debug!(conn_id = self.conn, "idle timeout");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            if !first && peer_closed(io.socket()) {
                debug!(conn_id = self.conn, "peer closed idle connection");
                break;
            }
            first = false;

            match self.exchange(&mut io, dispatch) {
                Ok(true) => {}
                Ok(false) => break,
                Err(failure) => {
                    debug!(conn_id = self.conn, "exchange failed: {}", failure.message);
                    self.post(TransportEvent::Failed {
                        code: failure.code,
                        message: failure.message,
                    });
                    break;
                }
            }
        }
        let _ = io.socket().shutdown(Shutdown::Both);
    }

    fn connect(&self, host: &str, port: u16, use_tls: bool) -> Result<Io, Failure> {
        let addrs = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SocketAddr::new(ip, port)],
            Err(_) => {
                let start = self.now();
                let addrs: Vec<SocketAddr> = (host, port)
                    .to_socket_addrs()
                    .map_err(|e| Failure::new(ErrorCode::DnsFailure, format!("{host}: {e}")))?
                    .collect();
                if addrs.is_empty() {
                    return Err(Failure::new(
                        ErrorCode::DnsFailure,
                        format!("{host}: no addresses"),
                    ));
                }
                let end = self.now();
                trace!(conn_id = self.conn, host, count = addrs.len(), "resolved");
                self.post(TransportEvent::Resolved { start, end });
                addrs
            }
        };

        let connect_start = self.now();
        let mut last_err = None;
        let mut sock = None;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, self.ctx.connect_timeout) {
                Ok(s) => {
                    sock = Some(s);
                    break;
                }
                Err(e) => last_err = Some(format!("{addr}: {e}")),
            }
        }
        let Some(mut sock) = sock else {
            return Err(Failure::new(
                ErrorCode::ConnectFailure,
                last_err.unwrap_or_else(|| "no address to connect to".to_string()),
            ));
        };
        if self.ctx.tcp_nodelay {
            let _ = sock.set_nodelay(true);
        }
        let clone = sock
            .try_clone()
            .map_err(|e| Failure::new(ErrorCode::ConnectFailure, e.to_string()))?;
        if !self.abort.register(clone) {
            let _ = sock.shutdown(Shutdown::Both);
            return Err(Failure::new(ErrorCode::ConnectFailure, "connection aborted"));
        }

        let io = if use_tls {
            let start = self.now();
            let tls = self
                .handshake(&mut sock, host)
                .map_err(|e| Failure::new(ErrorCode::TlsHandshakeFailure, e))?;
            let end = self.now();
            self.post(TransportEvent::TlsHandshaken { start, end });
            Io::Tls(Box::new(rustls::StreamOwned::new(tls, sock)))
        } else {
            Io::Plain(sock)
        };

        self.post(TransportEvent::Connected {
            start: connect_start,
            end: self.now(),
        });
        Ok(io)
    }

    /// Drive the TLS handshake to completion. Each read is bounded by the
    /// connect timeout.
    fn handshake(
        &self,
        sock: &mut TcpStream,
        host: &str,
    ) -> Result<rustls::ClientConnection, String> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| format!("invalid server name: {e}"))?;
        let mut tls =
            rustls::ClientConnection::new(self.ctx.tls.clone(), name).map_err(|e| e.to_string())?;
        sock.set_read_timeout(Some(self.ctx.connect_timeout))
            .map_err(|e| e.to_string())?;
        while tls.is_handshaking() {
            tls.complete_io(sock).map_err(|e| e.to_string())?;
        }
        sock.set_read_timeout(None).map_err(|e| e.to_string())?;
        Ok(tls)
    }

    /// Write one request and read its response. Returns whether the
    /// connection can be reused.
    fn exchange(&self, io: &mut Io, dispatch: Dispatch) -> Result<bool, Failure> {
        trace!(conn_id = self.conn, stream_id = dispatch.stream_id, bytes = dispatch.wire.len(), "dispatch");
        self.post(TransportEvent::SendStarted(self.now()));
        io.write_all(&dispatch.wire).map_err(Failure::io)?;
        io.flush().map_err(Failure::io)?;
        self.post(TransportEvent::SendFinished {
            at: self.now(),
            bytes: dispatch.wire.len() as u64,
        });

        let decoder = if dispatch.head_request {
            ResponseDecoder::for_head_request()
        } else {
            ResponseDecoder::new()
        };
        let mut decoder = decoder.with_max_head_size(self.ctx.max_head_size);
        let mut buf = BytesMut::with_capacity(self.ctx.recv_buffer_size);
        let mut chunk = vec![0u8; self.ctx.recv_buffer_size];
        let mut received = 0u64;
        let mut reusable = false;
        let mut eof = false;

        // Head or body item held back until we know whether End follows it.
        let mut held: Option<TransportEvent> = None;

        loop {
            let item = if eof {
                decoder.decode_eof(&mut buf)
            } else {
                decoder.decode(&mut buf)
            }
            .map_err(Failure::protocol)?;

            match item {
                Some(Decoded::Head(head)) => {
                    if let Some(event) = held.take() {
                        self.post(event);
                    }
                    reusable = head.keep_alive && head.body != BodyKind::UntilClose;
                    held = Some(TransportEvent::Head {
                        head,
                        end_stream: false,
                        received,
                        at: self.now(),
                    });
                }
                Some(Decoded::Body(data)) => {
                    if let Some(event) = held.take() {
                        self.post(event);
                    }
                    held = Some(TransportEvent::Body {
                        data,
                        end_stream: false,
                        received,
                    });
                }
                Some(Decoded::End) => {
                    let last = match held.take() {
                        Some(TransportEvent::Head { head, received, at, .. }) => {
                            TransportEvent::Head {
                                head,
                                end_stream: true,
                                received,
                                at,
                            }
                        }
                        Some(TransportEvent::Body { data, received, .. }) => TransportEvent::Body {
                            data,
                            end_stream: true,
                            received,
                        },
                        _ => TransportEvent::Body {
                            data: Bytes::new(),
                            end_stream: true,
                            received,
                        },
                    };
                    self.post(last);
                    // Leftover bytes after a complete response cannot be trusted.
                    let reusable = reusable && !eof && buf.is_empty();
                    self.post(TransportEvent::Finished { reusable });
                    return Ok(reusable);
                }
                None => {
                    if let Some(event) = held.take() {
                        self.post(event);
                    }
                    if eof {
                        return Err(Failure::protocol(ParseError::UnexpectedEof));
                    }
                    match io.read(&mut chunk) {
                        Ok(0) => eof = true,
                        Ok(n) => {
                            received += n as u64;
                            buf.extend_from_slice(&chunk[..n]);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        // rustls reports a close without close_notify this way.
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => eof = true,
                        Err(e) => return Err(Failure::io(e)),
                    }
                }
            }
        }
    }
}

/// Returns true if the peer closed (or sent unsolicited bytes on) an idle
/// connection.
fn peer_closed(sock: &TcpStream) -> bool {
    if sock.set_nonblocking(true).is_err() {
        return true;
    }
    let mut probe = [0u8; 1];
    let closed = match sock.peek(&mut probe) {
        Ok(_) => true,
        Err(e) => e.kind() != io::ErrorKind::WouldBlock,
    };
    sock.set_nonblocking(false).is_err() || closed
}

/// Serialize a request for the wire.
///
/// `user_agent` is added unless the request carries its own.
pub(crate) fn encode_request(
    headers: &RequestHeaders,
    body: &[u8],
    user_agent: Option<&str>,
) -> Bytes {
    let mut head = RequestHead::new(headers.method().as_str(), headers.path(), headers.authority());
    for (name, values) in headers.headers().iter() {
        for value in values {
            head.headers.push((name, value.as_str()));
        }
    }
    if let Some(agent) = user_agent
        && headers.headers().get("user-agent").is_none()
    {
        head.headers.push(("user-agent", agent));
    }
    let mut wire = Vec::new();
    protocol_http1::encode_request(&head, body, &mut wire);
    Bytes::from(wire)
}

/// Whether the response to `headers` can never carry a body.
pub(crate) fn is_head_request(headers: &RequestHeaders) -> bool {
    headers.method() == Method::Head
}
