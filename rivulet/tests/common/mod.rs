//! Fake HTTP/1.1 upstreams for integration tests.
#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;
use rivulet::{
    Engine, EngineConfig, Method, RequestHeaders, RequestHeadersBuilder, Scheme, StreamEvent,
    StreamHandle, TlsClientConfig,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Requests and replies ────────────────────────────────────────────

/// A request as the upstream saw it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub head: String,
    pub body: Vec<u8>,
}

impl SeenRequest {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }
}

pub enum Reply {
    /// Write the bytes and wait for the next request.
    KeepAlive(Vec<u8>),
    /// Write the bytes and close the connection.
    Close(Vec<u8>),
    /// Never answer; hold the connection until the client goes away.
    Stall,
}

pub fn ok(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

pub fn chunked(parts: &[&str]) -> Vec<u8> {
    let mut out = b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n".to_vec();
    for part in parts {
        out.extend_from_slice(format!("{:x}\r\n{part}\r\n", part.len()).as_bytes());
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

type Responder = dyn Fn(&SeenRequest) -> Reply + Send + Sync;

// ── Server ──────────────────────────────────────────────────────────

/// An HTTP/1.1 server on an ephemeral loopback port.
pub struct FakeUpstream {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<SeenRequest>>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FakeUpstream {
    pub fn plain<F>(responder: F) -> Self
    where
        F: Fn(&SeenRequest) -> Reply + Send + Sync + 'static,
    {
        Self::launch(Arc::new(responder), None)
    }

    pub fn tls<F>(responder: F, config: Arc<rustls::ServerConfig>) -> Self
    where
        F: Fn(&SeenRequest) -> Reply + Send + Sync + 'static,
    {
        Self::launch(Arc::new(responder), Some(config))
    }

    fn launch(responder: Arc<Responder>, tls: Option<Arc<rustls::ServerConfig>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let (accepted, requests, stop) = (accepted.clone(), requests.clone(), stop.clone());
            thread::spawn(move || {
                for sock in listener.incoming() {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let Ok(sock) = sock else { continue };
                    accepted.fetch_add(1, Ordering::AcqRel);
                    let (responder, requests, tls) =
                        (responder.clone(), requests.clone(), tls.clone());
                    thread::spawn(move || {
                        let _ = match tls {
                            None => serve(sock, &*responder, &requests),
                            Some(config) => {
                                let conn = rustls::ServerConnection::new(config).unwrap();
                                let stream = rustls::StreamOwned::new(conn, sock);
                                serve(stream, &*responder, &requests)
                            }
                        };
                    });
                }
            })
        };

        FakeUpstream {
            addr,
            accepted,
            requests,
            stop,
            thread: Some(thread),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// `127.0.0.1:port`
    pub fn ip_authority(&self) -> String {
        self.addr.to_string()
    }

    /// `localhost:port`, which goes through name resolution.
    pub fn host_authority(&self) -> String {
        format!("localhost:{}", self.addr.port())
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::Acquire)
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Wake the accept loop so it sees the flag.
        let _ = TcpStream::connect(self.addr);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve<S: Read + Write>(
    mut sock: S,
    responder: &Responder,
    requests: &Mutex<Vec<SeenRequest>>,
) -> io::Result<()> {
    let mut buf = Vec::new();
    loop {
        let Some(request) = read_request(&mut sock, &mut buf)? else {
            return Ok(());
        };
        requests.lock().unwrap().push(request.clone());
        match responder(&request) {
            Reply::KeepAlive(bytes) => {
                sock.write_all(&bytes)?;
                sock.flush()?;
            }
            Reply::Close(bytes) => {
                sock.write_all(&bytes)?;
                sock.flush()?;
                return Ok(());
            }
            Reply::Stall => {
                // Returns once the client closes or shuts down the socket.
                let mut sink = [0u8; 1024];
                while sock.read(&mut sink)? > 0 {}
                return Ok(());
            }
        }
    }
}

/// Read one request. `None` when the client closed between requests.
fn read_request<S: Read>(sock: &mut S, buf: &mut Vec<u8>) -> io::Result<Option<SeenRequest>> {
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = sock.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    buf.drain(..head_end + 4);

    let mut request = SeenRequest {
        head,
        body: Vec::new(),
    };
    let length: usize = request
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    while buf.len() < length {
        let n = sock.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    request.body = buf.drain(..length).collect();
    Ok(Some(request))
}

// ── TLS ─────────────────────────────────────────────────────────────

pub fn generate_self_signed() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    let cert_der = CertificateDer::from(cert.cert);
    (vec![cert_der], key.into())
}

pub fn server_tls_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Arc<rustls::ServerConfig> {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    Arc::new(config)
}

pub fn client_tls_config(certs: &[CertificateDer<'static>]) -> TlsClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    for cert in certs {
        roots.add(cert.clone()).unwrap();
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsClientConfig {
        client_config: Arc::new(config),
    }
}

// ── Engine helpers ──────────────────────────────────────────────────

pub fn test_config() -> EngineConfig {
    EngineConfig {
        connect_timeout: Duration::from_secs(5),
        tick_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

pub fn started(config: EngineConfig) -> Engine {
    init_tracing();
    let mut engine = Engine::new(config).unwrap();
    engine.start().unwrap();
    engine
}

pub fn get(scheme: Scheme, authority: &str, path: &str) -> RequestHeaders {
    RequestHeadersBuilder::new(Method::Get, scheme, authority, path).build()
}

/// Start a push-mode stream with a channel handler and send `headers`.
pub fn open(engine: &Engine, headers: RequestHeaders) -> (StreamHandle, Receiver<StreamEvent>) {
    let (handler, rx) = rivulet::event_channel(64);
    let mut handle = engine
        .new_stream_factory()
        .unwrap()
        .configure(handler)
        .start(false)
        .unwrap();
    handle.send_headers(headers, true).unwrap();
    (handle, rx)
}

/// Collect events up to and including the terminal one.
pub fn collect(rx: &Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    loop {
        let event = rx.recv_timeout(TIMEOUT).expect("stream did not finish");
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

/// Concatenated body of the data events.
pub fn body_of(events: &[StreamEvent]) -> Vec<u8> {
    let mut body = Vec::new();
    for event in events {
        if let StreamEvent::Data { data, .. } = event {
            body.extend_from_slice(data);
        }
    }
    body
}

/// Event kinds in order, for asserting callback sequences.
pub fn kinds(events: &[StreamEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match e {
            StreamEvent::Headers { .. } => "headers",
            StreamEvent::Data { .. } => "data",
            StreamEvent::Complete { .. } => "complete",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Cancel { .. } => "cancel",
        })
        .collect()
}
