//! Per-client rate limiting for the authentication endpoints.

use axum::http::HeaderMap;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config;

type KeyedLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// A trusted reverse proxy: a single address or a CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedProxy {
    network: IpAddr,
    prefix: u8,
}

impl TrustedProxy {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix.parse::<u8>().ok()?)),
            None => (s, None),
        };
        let network: IpAddr = addr.parse().ok()?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = prefix.unwrap_or(max);
        if prefix > max {
            return None;
        }
        Some(Self { network, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                prefix_match(u32::from(net).into(), u32::from(ip).into(), self.prefix, 32)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                prefix_match(u128::from(net), u128::from(ip), self.prefix, 128)
            }
            _ => false,
        }
    }
}

fn prefix_match(net: u128, ip: u128, prefix: u8, bits: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let shift = u32::from(bits - prefix);
    (net >> shift) == (ip >> shift)
}

/// Resolve the address a request should be attributed to. The left-most
/// `X-Forwarded-For` entry is only honoured when the peer is a trusted proxy.
pub fn client_ip(peer: Option<SocketAddr>, headers: &HeaderMap, trusted: &[TrustedProxy]) -> IpAddr {
    let Some(peer) = peer.map(|p| p.ip()) else {
        return IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    };
    if !trusted.iter().any(|proxy| proxy.contains(peer)) {
        return peer;
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .unwrap_or(peer)
}

pub struct AuthThrottle {
    limiter: KeyedLimiter,
    trusted: Vec<TrustedProxy>,
}

impl std::fmt::Debug for AuthThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthThrottle")
            .field("trusted", &self.trusted)
            .finish_non_exhaustive()
    }
}

impl AuthThrottle {
    /// `limit` attempts per `window`, refilled evenly over the window.
    pub fn new(limit: u32, window: Duration, trusted: Vec<TrustedProxy>) -> Self {
        let burst = NonZeroU32::new(limit.max(1)).unwrap_or(NonZeroU32::MIN);
        let period = window / burst.get();
        let quota = Quota::with_period(period.max(Duration::from_millis(1)))
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);
        Self {
            limiter: RateLimiter::keyed(quota),
            trusted,
        }
    }

    pub fn from_config(cfg: &config::Throttle) -> Self {
        let trusted = cfg
            .trusted_proxies
            .iter()
            .filter_map(|raw| {
                let parsed = TrustedProxy::parse(raw);
                if parsed.is_none() {
                    warn!(proxy = %raw, "ignoring unparsable trusted proxy");
                }
                parsed
            })
            .collect();
        Self::new(
            cfg.auth_limit,
            Duration::from_secs(cfg.auth_window_secs),
            trusted,
        )
    }

    pub fn trusted_proxies(&self) -> &[TrustedProxy] {
        &self.trusted
    }

    /// Consume one attempt for `ip`. Returns false when over the limit.
    pub fn check(&self, ip: IpAddr) -> bool {
        let allowed = self.limiter.check_key(&ip).is_ok();
        if !allowed {
            debug!(%ip, "auth attempt throttled");
        }
        // keep the key map from growing without bound
        if self.limiter.len() > 10_000 {
            self.limiter.retain_recent();
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn parse_proxies() {
        assert!(TrustedProxy::parse("127.0.0.1").is_some());
        assert!(TrustedProxy::parse("10.0.0.0/8").is_some());
        assert!(TrustedProxy::parse("::1").is_some());
        assert!(TrustedProxy::parse("10.0.0.0/33").is_none());
        assert!(TrustedProxy::parse("not-an-ip").is_none());
    }

    #[test]
    fn cidr_contains() {
        let net = TrustedProxy::parse("10.1.0.0/16").unwrap();
        assert!(net.contains("10.1.200.3".parse().unwrap()));
        assert!(!net.contains("10.2.0.1".parse().unwrap()));
        assert!(!net.contains("::1".parse().unwrap()));

        let exact = TrustedProxy::parse("192.168.1.1").unwrap();
        assert!(exact.contains("192.168.1.1".parse().unwrap()));
        assert!(!exact.contains("192.168.1.2".parse().unwrap()));

        assert!(TrustedProxy::parse("0.0.0.0/0")
            .unwrap()
            .contains("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn forwarded_for_only_from_trusted_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.2"));
        let trusted = vec![TrustedProxy::parse("127.0.0.1").unwrap()];

        let proxy: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(
            client_ip(Some(proxy), &headers, &trusted),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );

        let direct: SocketAddr = "198.51.100.1:5000".parse().unwrap();
        assert_eq!(client_ip(Some(direct), &headers, &trusted), direct.ip());

        assert_eq!(
            client_ip(None, &headers, &trusted),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
    }

    #[test]
    fn limit_is_per_ip() {
        let throttle = AuthThrottle::new(3, Duration::from_secs(60), Vec::new());
        let a: IpAddr = "198.51.100.1".parse().unwrap();
        let b: IpAddr = "198.51.100.2".parse().unwrap();

        assert!(throttle.check(a));
        assert!(throttle.check(a));
        assert!(throttle.check(a));
        assert!(!throttle.check(a));
        assert!(throttle.check(b));
    }
}
