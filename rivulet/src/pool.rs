//! Per-upstream connection pool.
//!
//! Owned by the event loop thread. Each [`Connection`] is the loop's view of
//! one transport thread: its command queue, the handle that aborts it,
//! the handshake timings it recorded, and the stream it is serving. HTTP/1.1
//! carries one exchange per connection at a time, so a connection is either
//! assigned to a stream or idle.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use tracing::{debug, trace};

use crate::clock::Millis;
use crate::intel::{FinalStreamIntel, Phase};
use crate::metrics::{CONNECTIONS_ACTIVE, CONNECTIONS_OPENED, CONNECTIONS_REUSED};
use crate::transport::{self, Abort, ConnId, Dispatch, TransportContext};

/// Pool key: connections are only shared between identical upstreams.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Upstream {
    pub tls: bool,
    pub host: String,
    pub port: u16,
}

/// Handshake phases a connection went through. Every exchange it carries
/// reports these.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ConnTimings {
    pub dns: Option<(Millis, Millis)>,
    pub tls: Option<(Millis, Millis)>,
    pub connect: Option<(Millis, Millis)>,
}

impl ConnTimings {
    /// Copy the finished phase pairs into a stream's record.
    pub(crate) fn apply_to(&self, intel: &mut FinalStreamIntel) {
        let pairs = [
            (self.dns, Phase::DnsStart, Phase::DnsEnd),
            (self.tls, Phase::SslStart, Phase::SslEnd),
            (self.connect, Phase::ConnectStart, Phase::ConnectEnd),
        ];
        for (pair, start, end) in pairs {
            if let Some((s, e)) = pair {
                *intel.slot_mut(start) = Some(s);
                *intel.slot_mut(end) = Some(e);
            }
        }
    }
}

pub(crate) struct Connection {
    pub upstream: Upstream,
    commands: Sender<Dispatch>,
    abort: Arc<Abort>,
    thread: Option<JoinHandle<()>>,
    pub timings: ConnTimings,
    /// Stream currently using the connection.
    pub stream: Option<u64>,
    /// Exchanges the connection has been assigned, including the current one.
    pub exchanges: u32,
}

impl Connection {
    /// Hand a request to the transport thread. Returns false if the thread
    /// is gone.
    pub(crate) fn dispatch(&self, dispatch: Dispatch) -> bool {
        self.commands.send(dispatch).is_ok()
    }
}

/// Idle and in-use connections, keyed by connection id.
pub(crate) struct Pool {
    ctx: TransportContext,
    conns: HashMap<ConnId, Connection>,
    idle: HashMap<Upstream, Vec<ConnId>>,
    retired: Vec<JoinHandle<()>>,
    next_id: ConnId,
    max_idle: usize,
}

impl Pool {
    pub(crate) fn new(ctx: TransportContext, max_idle: usize) -> Self {
        Pool {
            ctx,
            conns: HashMap::new(),
            idle: HashMap::new(),
            retired: Vec::new(),
            next_id: 1,
            max_idle,
        }
    }

    /// Assign a connection to `stream`: the most recently idled connection
    /// for `upstream` if there is one, otherwise a new one.
    ///
    /// Returns the connection id and whether it was reused.
    pub(crate) fn acquire(
        &mut self,
        upstream: &Upstream,
        stream: u64,
    ) -> std::io::Result<(ConnId, bool)> {
        if let Some(id) = self.idle.get_mut(upstream).and_then(Vec::pop)
            && let Some(conn) = self.conns.get_mut(&id)
        {
            conn.stream = Some(stream);
            conn.exchanges += 1;
            CONNECTIONS_REUSED.increment();
            trace!(conn_id = id, stream_id = stream, exchanges = conn.exchanges, "reusing idle connection");
            return Ok((id, true));
        }
        let id = self.open(upstream)?;
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.stream = Some(stream);
            conn.exchanges = 1;
        }
        Ok((id, false))
    }

    fn open(&mut self, upstream: &Upstream) -> std::io::Result<ConnId> {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = crossbeam_channel::unbounded();
        let abort = Arc::new(Abort::default());
        let thread = transport::spawn(
            id,
            upstream.host.clone(),
            upstream.port,
            upstream.tls,
            self.ctx.clone(),
            rx,
            abort.clone(),
        )?;
        self.conns.insert(
            id,
            Connection {
                upstream: upstream.clone(),
                commands: tx,
                abort,
                thread: Some(thread),
                timings: ConnTimings::default(),
                stream: None,
                exchanges: 0,
            },
        );
        CONNECTIONS_OPENED.increment();
        CONNECTIONS_ACTIVE.increment();
        debug!(conn_id = id, host = %upstream.host, port = upstream.port, tls = upstream.tls, "opening connection");
        Ok(id)
    }

    pub(crate) fn get(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    /// Return a connection after a finished exchange. It goes back on the
    /// idle list if `reusable` and there is room, otherwise it is closed.
    pub(crate) fn release(&mut self, id: ConnId, reusable: bool) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        conn.stream = None;
        let idle = self.idle.entry(conn.upstream.clone()).or_default();
        if reusable && idle.len() < self.max_idle {
            trace!(conn_id = id, "connection idle");
            idle.push(id);
        } else {
            self.close(id);
        }
    }

    /// Close a connection and forget it. Its thread is joined later.
    pub(crate) fn close(&mut self, id: ConnId) {
        let Some(mut conn) = self.conns.remove(&id) else {
            return;
        };
        if let Some(idle) = self.idle.get_mut(&conn.upstream) {
            idle.retain(|&c| c != id);
        }
        conn.abort.abort();
        // Dropping the command sender wakes a thread waiting for work.
        drop(conn.commands);
        if let Some(thread) = conn.thread.take() {
            self.retired.push(thread);
        }
        CONNECTIONS_ACTIVE.decrement();
        debug!(conn_id = id, "connection closed");
    }

    /// Join transport threads that have exited.
    pub(crate) fn reap(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) = self
            .retired
            .drain(..)
            .partition(|handle| handle.is_finished());
        self.retired = running;
        for handle in done {
            let _ = handle.join();
        }
    }

    /// Close every connection and join every transport thread.
    pub(crate) fn shutdown(&mut self) {
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for id in ids {
            self.close(id);
        }
        for handle in self.retired.drain(..) {
            if handle.join().is_err() {
                debug!("transport thread panicked");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.conns.len()
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self, upstream: &Upstream) -> usize {
        self.idle.get(upstream).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::time::Duration;

    use super::*;
    use crate::clock::Clock;
    use crate::config::EngineConfig;
    use crate::event_loop::LoopMsg;
    use crate::transport::TransportEvent;

    fn ms(v: u64) -> Millis {
        Millis::new(v)
    }

    #[test]
    fn timings_copy_only_finished_pairs() {
        let timings = ConnTimings {
            dns: Some((ms(1), ms(2))),
            tls: None,
            connect: Some((ms(3), ms(5))),
        };
        let mut intel = FinalStreamIntel::default();
        timings.apply_to(&mut intel);
        assert_eq!(intel.dns_start, Some(ms(1)));
        assert_eq!(intel.dns_end, Some(ms(2)));
        assert_eq!(intel.ssl_start, None);
        assert_eq!(intel.ssl_end, None);
        assert_eq!(intel.connect_start, Some(ms(3)));
        assert_eq!(intel.connect_end, Some(ms(5)));
    }

    fn pool(max_idle: usize) -> (Pool, crossbeam_channel::Receiver<LoopMsg>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let config = EngineConfig::default();
        let ctx = TransportContext::new(&config, Clock::new(), tx);
        (Pool::new(ctx, max_idle), rx)
    }

    fn wait_connected(rx: &crossbeam_channel::Receiver<LoopMsg>, id: ConnId) {
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                LoopMsg::Transport {
                    conn,
                    event: TransportEvent::Connected { .. },
                } if conn == id => return,
                _ => {}
            }
        }
    }

    #[test]
    fn released_connection_is_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream = Upstream {
            tls: false,
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
        };
        let (mut pool, rx) = pool(4);

        let (first, reused) = pool.acquire(&upstream, 1).unwrap();
        assert!(!reused);
        wait_connected(&rx, first);
        pool.release(first, true);
        assert_eq!(pool.idle_count(&upstream), 1);

        let (second, reused) = pool.acquire(&upstream, 2).unwrap();
        assert!(reused);
        assert_eq!(second, first);
        assert_eq!(pool.get(second).unwrap().exchanges, 2);
        assert_eq!(pool.idle_count(&upstream), 0);

        pool.shutdown();
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn zero_idle_limit_closes_on_release() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream = Upstream {
            tls: false,
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
        };
        let (mut pool, rx) = pool(0);

        let (id, _) = pool.acquire(&upstream, 1).unwrap();
        wait_connected(&rx, id);
        pool.release(id, true);
        assert!(pool.get(id).is_none());
        assert_eq!(pool.idle_count(&upstream), 0);
        pool.shutdown();
    }
}
