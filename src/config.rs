//! Proxy configuration.
//!
//! The credential pair and the domain allowlist come from the environment;
//! listener and timeout settings come from command-line flags. Everything is
//! resolved once at startup into an immutable [`ProxyConfig`] that sessions
//! share read-only.

use std::time::Duration;

use crate::auth::Credential;
use crate::domain::DomainAllowlist;

pub const ENV_USER: &str = "PROXY_USER";
pub const ENV_PASS: &str = "PROXY_PASS";
pub const ENV_DOMAINS: &str = "ALLOWED_DOMAINS";

/// Listen address when none is given.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Per-address timeout for connecting to a destination.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Time a client gets to send a complete request head (prevents slowloris).
pub const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variables: {}", .0.join(", "))]
    MissingEnv(Vec<&'static str>),

    #[error("ALLOWED_DOMAINS does not contain any domain")]
    EmptyAllowlist,
}

/// Settings that are not read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub listen_addr: String,
    pub dial_timeout: Duration,
    pub header_timeout: Duration,
    /// Cap on concurrently served connections; `None` means unbounded.
    pub max_connections: Option<usize>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            header_timeout: DEFAULT_HEADER_TIMEOUT,
            max_connections: None,
        }
    }
}

/// Immutable, process-lifetime proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub allowed_domains: DomainAllowlist,
    pub credential: Credential,
    pub dial_timeout: Duration,
    pub header_timeout: Duration,
    pub max_connections: Option<usize>,
}

impl ProxyConfig {
    pub fn new(credential: Credential, allowed_domains: DomainAllowlist, options: ServerOptions) -> Self {
        Self {
            listen_addr: options.listen_addr,
            allowed_domains,
            credential,
            dial_timeout: options.dial_timeout,
            header_timeout: options.header_timeout,
            max_connections: options.max_connections,
        }
    }

    /// Load `PROXY_USER`, `PROXY_PASS` and `ALLOWED_DOMAINS` from the process
    /// environment.
    pub fn from_env(options: ServerOptions) -> Result<Self, ConfigError> {
        Self::from_lookup(options, |name| std::env::var(name).ok())
    }

    /// Like [`ProxyConfig::from_env`], reading variables through `lookup`.
    ///
    /// Unset and empty variables are both treated as missing, and all
    /// missing names are reported together.
    pub fn from_lookup(
        options: ServerOptions,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());

        match (get(ENV_USER), get(ENV_PASS), get(ENV_DOMAINS)) {
            (Some(user), Some(pass), Some(domains)) => {
                let allowed_domains = parse_allowlist(&domains)?;
                Ok(Self::new(Credential::new(user, pass), allowed_domains, options))
            }
            (user, pass, domains) => {
                let missing = [
                    (ENV_USER, user.is_none()),
                    (ENV_PASS, pass.is_none()),
                    (ENV_DOMAINS, domains.is_none()),
                ]
                .into_iter()
                .filter_map(|(name, missing)| missing.then_some(name))
                .collect();
                Err(ConfigError::MissingEnv(missing))
            }
        }
    }
}

/// Read only `ALLOWED_DOMAINS`, for commands that never authenticate.
pub fn allowlist_from_env() -> Result<DomainAllowlist, ConfigError> {
    let raw = std::env::var(ENV_DOMAINS)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConfigError::MissingEnv(vec![ENV_DOMAINS]))?;
    parse_allowlist(&raw)
}

fn parse_allowlist(raw: &str) -> Result<DomainAllowlist, ConfigError> {
    let allowlist = DomainAllowlist::parse(raw);
    if allowlist.is_empty() {
        return Err(ConfigError::EmptyAllowlist);
    }
    Ok(allowlist)
}
