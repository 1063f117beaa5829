//! Proxy credential checks for the `Basic` scheme.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;

/// Scheme prefix expected at the start of `Proxy-Authorization`.
const BASIC_PREFIX: &str = "Basic ";

/// Realm advertised in the `Proxy-Authenticate` challenge.
pub const REALM: &str = "Restricted";

/// Outcome of validating a request's proxy credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Allowed,
    Denied,
}

impl AuthResult {
    pub fn is_allowed(self) -> bool {
        self == AuthResult::Allowed
    }
}

/// The single user/password pair accepted by the proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    user: String,
    pass: String,
}

impl Credential {
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pass: pass.into(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

// Never print the password, even at trace level.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .finish()
    }
}

/// Build `Basic base64(user:pass)`.
#[cfg(test)]
pub fn basic_header_value(user: &str, pass: &str) -> String {
    format!("{}{}", BASIC_PREFIX, STANDARD.encode(format!("{}:{}", user, pass)))
}

/// Validate a `Proxy-Authorization` header value against the expected pair.
///
/// The scheme prefix is matched exactly, the payload must be padded standard
/// base64, and the decoded bytes are split on the first colon only so that
/// passwords may contain colons. User and password are compared byte for byte.
pub fn validate(header: Option<&str>, expected: &Credential) -> AuthResult {
    let Some(header) = header else {
        return AuthResult::Denied;
    };
    let Some(encoded) = header.strip_prefix(BASIC_PREFIX) else {
        return AuthResult::Denied;
    };
    let Ok(decoded) = STANDARD.decode(encoded) else {
        return AuthResult::Denied;
    };
    let Some(colon) = decoded.iter().position(|&b| b == b':') else {
        return AuthResult::Denied;
    };

    let (user, pass) = (&decoded[..colon], &decoded[colon + 1..]);
    // Evaluate both halves so the timing does not reveal which one failed.
    let user_ok = constant_time_eq(user, expected.user.as_bytes());
    let pass_ok = constant_time_eq(pass, expected.pass.as_bytes());
    if user_ok & pass_ok {
        AuthResult::Allowed
    } else {
        AuthResult::Denied
    }
}

/// Constant-time byte comparison for equal-length inputs.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
