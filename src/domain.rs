//! Destination allowlist.
//!
//! An entry permits the domain itself and every subdomain of it: `example.com`
//! allows `example.com` and `api.example.com`, but not `evilexample.com`.
//! There is no wildcard or pattern syntax.

use std::fmt;

/// Outcome of checking a CONNECT target against the allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainResult {
    Allowed,
    Denied,
}

impl DomainResult {
    pub fn is_allowed(self) -> bool {
        self == DomainResult::Allowed
    }
}

/// Normalized set of allowed domains (lowercase, trimmed, no trailing dot).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainAllowlist {
    domains: Vec<String>,
}

impl DomainAllowlist {
    /// Parse a comma-separated list such as `ALLOWED_DOMAINS`.
    ///
    /// Entries are trimmed and lowercased; empty entries are skipped and
    /// duplicates collapse to the first occurrence.
    pub fn parse(raw: &str) -> Self {
        let mut domains: Vec<String> = Vec::new();
        for part in raw.split(',') {
            let domain = part.trim().trim_end_matches('.').to_lowercase();
            if domain.is_empty() || domains.contains(&domain) {
                continue;
            }
            domains.push(domain);
        }
        Self { domains }
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// Check a CONNECT target (`host:port`, or a bare host) against the list.
    pub fn check(&self, host_port: &str) -> DomainResult {
        if is_allowed(host_port, &self.domains) {
            DomainResult::Allowed
        } else {
            DomainResult::Denied
        }
    }
}

impl fmt::Display for DomainAllowlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.domains.join(","))
    }
}

/// Decide whether `host_port` targets an allowed domain.
///
/// Entries in `allowed` must already be lowercase. A target whose port cannot
/// be split off is matched as a whole, so malformed input is denied by the
/// allowlist rather than rejected earlier.
pub fn is_allowed<S: AsRef<str>>(host_port: &str, allowed: &[S]) -> bool {
    let host = split_host_port(host_port)
        .map(|(host, _)| host)
        .unwrap_or(host_port)
        .to_lowercase();

    allowed.iter().any(|entry| {
        let entry = entry.as_ref();
        host == entry
            || host
                .strip_suffix(entry)
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}

/// Split `host:port` or `[v6]:port` into its parts.
///
/// Returns `None` when there is no port delimiter or the unbracketed host
/// itself contains a colon.
pub fn split_host_port(input: &str) -> Option<(&str, &str)> {
    if let Some(rest) = input.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = after.strip_prefix(':')?;
        if port.contains(':') || port.contains(']') {
            return None;
        }
        return Some((host, port));
    }

    let (host, port) = input.rsplit_once(':')?;
    if host.contains(':') || host.contains('[') || host.contains(']') {
        return None;
    }
    Some((host, port))
}
