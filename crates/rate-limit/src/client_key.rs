use std::collections::HashSet;
use std::fmt;

/// Canonical identity a client's quota is tracked under: an IP address
/// literal with any port suffix removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClientKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Peer addresses whose forwarding headers are believed.
///
/// Membership is exact string equality against the port-stripped peer
/// address; there is no CIDR matching.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    addrs: HashSet<String>,
}

impl TrustedProxies {
    pub fn new<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addrs: addrs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, ip: &str) -> bool {
        self.addrs.contains(ip)
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Sorted list of the trusted addresses, for logging and display.
    pub fn to_sorted_vec(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.addrs.iter().cloned().collect();
        addrs.sort();
        addrs
    }
}

/// Derive the client key for a request.
///
/// Headers are only consulted when the peer itself is a trusted proxy;
/// otherwise the peer address is returned and any `X-Forwarded-For` /
/// `X-Real-IP` the client sent is ignored.
pub fn resolve(
    peer_addr: &str,
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    trusted: &TrustedProxies,
) -> ClientKey {
    let peer_ip = strip_port(peer_addr);

    if !trusted.contains(peer_ip) {
        return ClientKey(peer_ip.to_string());
    }

    // Left-most entry of the chain is the originating client.
    if let Some(first) = forwarded_for.and_then(first_forwarded) {
        return ClientKey(first.to_string());
    }

    if let Some(real) = real_ip.map(str::trim).filter(|s| !s.is_empty()) {
        return ClientKey(real.to_string());
    }

    ClientKey(peer_ip.to_string())
}

fn first_forwarded(header: &str) -> Option<&str> {
    header.split(',').map(str::trim).find(|s| !s.is_empty())
}

/// Remove a `:port` suffix from `host:port` or `[v6]:port`.
///
/// Anything that is not one of those two shapes (a bare IPv4 or IPv6
/// literal, a hostname) is returned unchanged.
pub fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, port)) = rest.split_once("]:") {
            if !port.is_empty() && !port.contains(':') {
                return host;
            }
        }
        return addr;
    }

    match addr.split_once(':') {
        Some((host, port)) if !host.is_empty() && !port.contains(':') => host,
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trusted(addrs: &[&str]) -> TrustedProxies {
        TrustedProxies::new(addrs.iter().copied())
    }

    #[test]
    fn strips_ipv4_port() {
        assert_eq!(strip_port("192.168.1.1:12345"), "192.168.1.1");
    }

    #[test]
    fn strips_bracketed_ipv6_port() {
        assert_eq!(strip_port("[2001:db8::1]:8080"), "2001:db8::1");
    }

    #[test]
    fn leaves_bare_addresses_alone() {
        assert_eq!(strip_port("192.168.1.1"), "192.168.1.1");
        assert_eq!(strip_port("::1"), "::1");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }

    #[test]
    fn untrusted_peer_ignores_headers() {
        let key = resolve(
            "192.168.1.100:12345",
            Some("10.0.0.1"),
            Some("10.0.0.2"),
            &trusted(&["127.0.0.1"]),
        );
        assert_eq!(key.as_str(), "192.168.1.100");
    }

    #[test]
    fn trusted_peer_uses_first_forwarded_entry() {
        let key = resolve(
            "127.0.0.1:12345",
            Some("10.0.0.1, 172.16.0.1, 192.168.1.1"),
            None,
            &trusted(&["127.0.0.1"]),
        );
        assert_eq!(key.as_str(), "10.0.0.1");
    }

    #[test]
    fn leading_empty_segments_are_skipped() {
        let key = resolve(
            "127.0.0.1:1",
            Some(" , ,10.0.0.7"),
            None,
            &trusted(&["127.0.0.1"]),
        );
        assert_eq!(key.as_str(), "10.0.0.7");
    }

    #[test]
    fn trusted_peer_falls_back_to_real_ip() {
        let key = resolve(
            "127.0.0.1:1",
            None,
            Some(" 10.9.9.9 "),
            &trusted(&["127.0.0.1"]),
        );
        assert_eq!(key.as_str(), "10.9.9.9");
    }

    #[test]
    fn degenerate_headers_fall_back_to_peer() {
        let proxies = trusted(&["127.0.0.1"]);
        for xff in ["", "   ", ",,,", " , \t, "] {
            let key = resolve("127.0.0.1:1", Some(xff), Some("  "), &proxies);
            assert_eq!(key.as_str(), "127.0.0.1", "header {:?}", xff);
        }
    }

    #[test]
    fn trusted_match_is_exact() {
        // No prefix or subnet matching.
        let key = resolve(
            "127.0.0.10:1",
            Some("10.0.0.1"),
            None,
            &trusted(&["127.0.0.1"]),
        );
        assert_eq!(key.as_str(), "127.0.0.10");
    }
}
