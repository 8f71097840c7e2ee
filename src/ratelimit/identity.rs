//! Client identity extraction.
//!
//! Derives the stable key that all per-client throttling is bucketed under.
//! Extraction is a pure function of the request metadata: it never fails and
//! always yields a non-empty key.

use std::net::IpAddr;

/// Key used when no address information is available at all.
const FALLBACK_ADDR: &str = "127.0.0.1";

/// An opaque key identifying a distinguishable client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    /// Create a key from an address string.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientKey {
    fn from(addr: &str) -> Self {
        Self::new(addr)
    }
}

/// Address metadata for an inbound request, as seen by the middleware layer.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// Transport-level peer address of the connection
    pub peer_addr: Option<IpAddr>,
    /// Forwarded-address chain, client-first, already split into entries
    pub forwarded_chain: Vec<String>,
    /// Value of a real-client-address header, if one was present
    pub real_ip: Option<String>,
}

impl RequestMeta {
    /// Parse a raw comma-separated forwarded-address header into a chain.
    pub fn parse_forwarded_chain(header: &str) -> Vec<String> {
        header
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Derives a [`ClientKey`] from request metadata.
///
/// Forwarded-address and real-address headers are client-spoofable, so they
/// are only consulted when the extractor is configured to trust upstream
/// proxies; otherwise only the transport-level peer address counts.
#[derive(Debug, Clone, Copy)]
pub struct ClientKeyExtractor {
    trust_proxy_headers: bool,
}

impl ClientKeyExtractor {
    /// Create an extractor.
    pub fn new(trust_proxy_headers: bool) -> Self {
        Self {
            trust_proxy_headers,
        }
    }

    /// Extract the client key for a request.
    ///
    /// Precedence: first forwarded-chain entry, then the declared real
    /// address (both only when proxy headers are trusted), then the peer
    /// address, then a fixed fallback.
    pub fn extract(&self, meta: &RequestMeta) -> ClientKey {
        if self.trust_proxy_headers {
            if let Some(first) = meta.forwarded_chain.iter().find(|s| !s.trim().is_empty()) {
                return ClientKey::new(first.trim());
            }
            if let Some(real_ip) = meta.real_ip.as_deref() {
                let real_ip = real_ip.trim();
                if !real_ip.is_empty() {
                    return ClientKey::new(real_ip);
                }
            }
        }

        match meta.peer_addr {
            Some(addr) => ClientKey::new(addr.to_string()),
            None => ClientKey::new(FALLBACK_ADDR),
        }
    }
}
