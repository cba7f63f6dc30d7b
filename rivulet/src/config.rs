use std::sync::Arc;
use std::time::Duration;

/// TLS client configuration for `https` upstreams.
#[derive(Clone)]
pub struct TlsClientConfig {
    /// Pre-built rustls ClientConfig. User configures root certs, ALPN, etc.
    pub client_config: Arc<rustls::ClientConfig>,
}

impl TlsClientConfig {
    /// Trust the Mozilla root set bundled by `webpki-roots`.
    pub fn webpki_roots() -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsClientConfig {
            client_config: Arc::new(config),
        }
    }
}

/// Engine configuration, consumed once by [`Engine::new`](crate::Engine::new).
#[derive(Clone)]
pub struct EngineConfig {
    /// TCP connect timeout. Also bounds each read of the TLS handshake.
    pub connect_timeout: Duration,
    /// Idle pooled connections are closed after this long without a request.
    pub idle_connection_timeout: Duration,
    /// Maximum idle connections kept per upstream. 0 disables reuse.
    pub max_idle_per_upstream: usize,
    /// Maximum time the event loop blocks before re-checking the shutdown
    /// flag and reaping finished transport threads.
    pub tick_interval: Duration,
    /// Size of each socket read on transport threads.
    pub recv_buffer_size: usize,
    /// Limit for a response status line plus headers.
    pub max_response_head_size: usize,
    /// Enable TCP_NODELAY on upstream connections.
    pub tcp_nodelay: bool,
    /// Sent as `user-agent` unless the request carries its own.
    pub user_agent: Option<String>,
    /// TLS settings for `https` upstreams. `None` uses the webpki root set.
    pub tls_client: Option<TlsClientConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_connection_timeout: Duration::from_secs(60),
            max_idle_per_upstream: 8,
            tick_interval: Duration::from_millis(100),
            recv_buffer_size: 16384,
            max_response_head_size: protocol_http1::DEFAULT_MAX_HEAD_SIZE,
            tcp_nodelay: true,
            user_agent: Some(concat!("rivulet/", env!("CARGO_PKG_VERSION")).to_string()),
            tls_client: None,
        }
    }
}

impl EngineConfig {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.connect_timeout.is_zero() {
            return Err(crate::error::Error::Config(
                "connect_timeout must be > 0".into(),
            ));
        }
        if self.idle_connection_timeout.is_zero() {
            return Err(crate::error::Error::Config(
                "idle_connection_timeout must be > 0".into(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(crate::error::Error::Config(
                "tick_interval must be > 0".into(),
            ));
        }
        if self.recv_buffer_size == 0 || self.recv_buffer_size > (16 << 20) {
            return Err(crate::error::Error::Config(
                "recv_buffer_size must be > 0 and <= 16MiB".into(),
            ));
        }
        if self.max_response_head_size < 1024 {
            return Err(crate::error::Error::Config(
                "max_response_head_size must be >= 1024".into(),
            ));
        }
        Ok(())
    }

    /// The rustls config used for `https` upstreams.
    pub(crate) fn client_tls(&self) -> Arc<rustls::ClientConfig> {
        match &self.tls_client {
            Some(tls) => tls.client_config.clone(),
            None => TlsClientConfig::webpki_roots().client_config,
        }
    }
}

/// Builder for [`EngineConfig`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use rivulet::ConfigBuilder;
///
/// let config = ConfigBuilder::default()
///     .connect_timeout(Duration::from_secs(2))
///     .max_idle_per_upstream(4)
///     .tcp_nodelay(true)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: EngineConfig,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Connection settings ──────────────────────────────────────────

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn idle_connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_connection_timeout = timeout;
        self
    }

    /// Maximum idle connections kept per upstream. 0 disables reuse.
    pub fn max_idle_per_upstream(mut self, n: usize) -> Self {
        self.config.max_idle_per_upstream = n;
        self
    }

    /// Enable or disable TCP_NODELAY on upstream connections.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    /// Set TLS client configuration for `https` upstreams.
    pub fn tls_client(mut self, config: TlsClientConfig) -> Self {
        self.config.tls_client = Some(config);
        self
    }

    // ── Buffer settings ──────────────────────────────────────────────

    pub fn recv_buffer_size(mut self, n: usize) -> Self {
        self.config.recv_buffer_size = n;
        self
    }

    pub fn max_response_head_size(mut self, n: usize) -> Self {
        self.config.max_response_head_size = n;
        self
    }

    // ── Loop settings ────────────────────────────────────────────────

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    // ── Request defaults ─────────────────────────────────────────────

    /// Set the default `user-agent`. `None` sends no user agent.
    pub fn user_agent(mut self, agent: Option<String>) -> Self {
        self.config.user_agent = agent;
        self
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`EngineConfig`].
    pub fn build(self) -> Result<EngineConfig, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
