//! Client identification for per-client rate limiting.
//!
//! # Resolution Order
//!
//! The first match wins:
//!
//! 1. Left-most entry of `X-Forwarded-For`, if present and non-empty
//! 2. `X-Real-IP`, if present and non-empty
//! 3. The connection's peer address (port stripped), from axum's
//!    [`ConnectInfo<SocketAddr>`] extension
//! 4. [`UNKNOWN_CLIENT`] when none of the above is available
//!
//! # Security Warning: IP Spoofing Risk
//!
//! Proxy headers are client-controlled unless a trusted reverse proxy
//! overwrites them. With an empty [`TrustedProxies`] list the headers are
//! trusted unconditionally, which only holds when this service is reachable
//! exclusively through such a proxy.
//!
//! Configure `TRUSTED_PROXIES` with the proxy networks to close that gap:
//! the headers are then honored only when the TCP peer lies inside one of
//! them, and any other peer is keyed by its own address.
//!
//! ```nginx
//! # nginx example - overwrite anything the client sent
//! proxy_set_header X-Real-IP $remote_addr;
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};
use ipnet::IpNet;
use tracing::{debug, warn};

/// Client key used when no address can be determined.
///
/// All such requests share one quota.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Header carrying the proxy chain, left-most entry is the original client.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Single-address header set by some proxies.
pub const X_REAL_IP: &str = "x-real-ip";

/// Networks whose connections may set client address headers.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    networks: Vec<IpNet>,
}

impl TrustedProxies {
    /// Parse IPs and CIDRs (e.g. `10.0.0.0/8`, `::1`).
    ///
    /// Invalid entries are logged and skipped.
    pub fn new(entries: &[String]) -> Self {
        let networks: Vec<IpNet> = entries
            .iter()
            .filter_map(|entry| {
                let entry = entry.trim();
                let parsed = entry
                    .parse::<IpNet>()
                    .ok()
                    .or_else(|| entry.parse::<IpAddr>().ok().map(IpNet::from));
                if parsed.is_none() {
                    warn!(entry, "Invalid entry in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !networks.is_empty() {
            debug!(count = networks.len(), "Trusted proxy validation enabled");
        }

        Self { networks }
    }

    /// Whether an allowlist is configured.
    pub fn is_enabled(&self) -> bool {
        !self.networks.is_empty()
    }

    /// Whether proxy headers from `peer` should be believed.
    ///
    /// Always `true` when no allowlist is configured.
    pub fn trusts(&self, peer: IpAddr) -> bool {
        !self.is_enabled() || self.networks.iter().any(|net| net.contains(&peer))
    }
}

/// Where a client key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source<'a> {
    ForwardedFor(&'a str),
    RealIp(&'a str),
    NotFound,
}

/// Read the client address from proxy headers without allocating.
fn client_from_headers(headers: &HeaderMap) -> Source<'_> {
    if let Some(value) = headers.get(X_FORWARDED_FOR)
        && let Ok(value) = value.to_str()
        && let Some(first) = value.split(',').next().map(str::trim)
        && !first.is_empty()
    {
        return Source::ForwardedFor(first);
    }

    if let Some(value) = headers.get(X_REAL_IP)
        && let Ok(value) = value.to_str()
    {
        let value = value.trim();
        if !value.is_empty() {
            return Source::RealIp(value);
        }
    }

    Source::NotFound
}

/// Peer IP recorded by `into_make_service_with_connect_info`, if any.
fn peer_addr<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Resolve the canonical client key for `req`.
///
/// Returns `Cow::Borrowed` only for the [`UNKNOWN_CLIENT`] fallback.
pub fn resolve_client_key<B>(req: &Request<B>, trusted: &TrustedProxies) -> Cow<'static, str> {
    let peer = peer_addr(req);

    if let Some(peer_ip) = peer
        && !trusted.trusts(peer_ip)
    {
        if client_from_headers(req.headers()) != Source::NotFound {
            debug!(peer = %peer_ip, "Ignoring proxy headers from untrusted peer");
        }
        return Cow::Owned(peer_ip.to_string());
    }

    match client_from_headers(req.headers()) {
        Source::ForwardedFor(ip) | Source::RealIp(ip) => Cow::Owned(ip.to_string()),
        Source::NotFound => match peer {
            Some(peer_ip) => Cow::Owned(peer_ip.to_string()),
            None => Cow::Borrowed(UNKNOWN_CLIENT),
        },
    }
}
