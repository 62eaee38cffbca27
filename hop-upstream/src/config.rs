//! Upstream configuration
//!
//! [`UpstreamOptions`] carries the tunables every transport reads.
//! [`UpstreamConfig`] is its file form, loaded from TOML:
//!
//! ```toml
//! address = "tls://dns.example"
//! bootstrap = ["8.8.8.8:53", "1.1.1.1"]
//! timeout_ms = 5000
//! max_idle_connections = 8
//! idle_timeout_secs = 30   # 0 disables idle expiry
//! bind_addr = "192.0.2.10"
//! ```

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::{parse_address, parse_bootstrap};
use crate::error::{Error, Result};
use crate::upstream::{address_to_upstream_with_options, Upstream};

/// Default per-exchange timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of idle DoT sessions kept per upstream
pub const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 8;

/// Default time an idle DoT session may be reused
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables shared by all transports
#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    /// Bound on a whole exchange, including resolution and connection setup
    pub timeout: Duration,

    /// Idle sessions kept in the DoT pool
    pub max_idle_connections: usize,

    /// Idle sessions older than this are not reused
    pub idle_timeout: Option<Duration>,

    /// Optional local address for outgoing sockets
    pub bind_addr: Option<IpAddr>,

    /// TLS client configuration; webpki roots when unset
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl Default for UpstreamOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_idle_connections: DEFAULT_MAX_IDLE_CONNECTIONS,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            bind_addr: None,
            tls_config: None,
        }
    }
}

impl UpstreamOptions {
    /// Default options with the given timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn with_max_idle_connections(mut self, max_idle: usize) -> Self {
        self.max_idle_connections = max_idle;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_bind_addr(mut self, bind_addr: Option<IpAddr>) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_tls_config(mut self, tls_config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(tls_config);
        self
    }

    /// The configured TLS client config, or one trusting the webpki roots
    pub(crate) fn tls_client_config(&self) -> Result<Arc<rustls::ClientConfig>> {
        if let Some(config) = &self.tls_config {
            return Ok(config.clone());
        }

        let root_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Config(format!("failed to create TLS config: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Arc::new(tls_config))
    }
}

/// Serializable upstream description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Upstream address, e.g. `tls://dns.example` or `sdns://...`
    pub address: String,

    /// Literal `ip[:port]` servers used to resolve the upstream hostname
    #[serde(default)]
    pub bootstrap: Vec<String>,

    /// Exchange timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Idle DoT sessions kept per upstream
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,

    /// Seconds an idle DoT session stays reusable, 0 for no limit
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Local address for outgoing sockets
    #[serde(default)]
    pub bind_addr: Option<IpAddr>,
}

impl UpstreamConfig {
    /// Config for `address` with default settings
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            bootstrap: Vec::new(),
            timeout_ms: default_timeout_ms(),
            max_idle_connections: default_max_idle_connections(),
            idle_timeout_secs: default_idle_timeout_secs(),
            bind_addr: None,
        }
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: UpstreamConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::Config("timeout_ms must be greater than 0".into()));
        }

        let address = parse_address(&self.address)?;
        let bootstrap = parse_bootstrap(self.bootstrap.as_slice())?;

        if address.needs_bootstrap() && bootstrap.is_empty() {
            return Err(Error::InvalidAddress(format!(
                "{}: bootstrap servers are required to resolve '{}'",
                self.address,
                address.host()
            )));
        }

        Ok(())
    }

    /// Options described by this configuration
    pub fn options(&self) -> UpstreamOptions {
        UpstreamOptions::new(Duration::from_millis(self.timeout_ms))
            .with_max_idle_connections(self.max_idle_connections)
            .with_idle_timeout(match self.idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            })
            .with_bind_addr(self.bind_addr)
    }

    /// Build the upstream this configuration describes
    pub fn build(&self) -> Result<Box<dyn Upstream>> {
        self.validate()?;
        address_to_upstream_with_options(&self.address, self.bootstrap.as_slice(), self.options())
    }
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_max_idle_connections() -> usize {
    DEFAULT_MAX_IDLE_CONNECTIONS
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_secs()
}
