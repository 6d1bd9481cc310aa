//! Remote identities used as session pool keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Host and port of a server or gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Creates a new endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything needed to reach and authenticate against a server.
///
/// Equality and hashing are structural, so two identities built from the
/// same values share pooled sessions. Fields are private; an identity is
/// immutable once built.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    server: Endpoint,
    gateway: Option<Endpoint>,
    user: String,
    secret: String,
    secure: bool,
}

impl Identity {
    /// Creates an identity that connects directly to `server`.
    pub fn new(server: Endpoint, user: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            server,
            gateway: None,
            user: user.into(),
            secret: secret.into(),
            secure: false,
        }
    }

    /// Routes connections through an integration point gateway.
    pub fn with_gateway(mut self, gateway: Endpoint) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Requests a secure transport.
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn server(&self) -> &Endpoint {
        &self.server
    }

    pub fn gateway(&self) -> Option<&Endpoint> {
        self.gateway.as_ref()
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn secure(&self) -> bool {
        self.secure
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("server", &self.server)
            .field("gateway", &self.gateway)
            .field("user", &self.user)
            .field("secret", &"[REDACTED]")
            .field("secure", &self.secure)
            .finish()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.gateway {
            Some(gateway) => write!(f, "{}@{} via {}", self.user, self.server, gateway),
            None => write!(f, "{}@{}", self.user, self.server),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn structurally_equal_identities_hash_the_same() {
        let a = Identity::new(Endpoint::new("vcs.example.com", 7001), "builder", "pw");
        let b = Identity::new(Endpoint::new("vcs.example.com", 7001), "builder", "pw");

        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&b));
        assert_eq!(a, b);
    }

    #[test]
    fn differing_security_flag_is_a_different_key() {
        let a = Identity::new(Endpoint::new("vcs", 7001), "builder", "pw");
        let b = a.clone().with_secure(true);

        assert_ne!(a, b);
    }

    #[test]
    fn debug_output_redacts_secret() {
        let identity = Identity::new(Endpoint::new("vcs", 7001), "builder", "hunter2");
        let debug = format!("{:?}", identity);

        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn display_mentions_gateway() {
        let identity = Identity::new(Endpoint::new("vcs", 7001), "builder", "pw")
            .with_gateway(Endpoint::new("ip", 7002));

        assert_eq!(identity.to_string(), "builder@vcs:7001 via ip:7002");
    }
}
