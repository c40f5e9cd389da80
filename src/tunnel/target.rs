use super::TunnelError;
use http::uri::Authority;
use http::{header, Request};
use std::fmt;

const DEFAULT_TLS_PORT: u16 = 443;

/// Host and port named by a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    /// Bare host: no brackets around IPv6 literals.
    pub host: String,
    pub port: u16,
}

impl TunnelTarget {
    pub fn parse(raw: &str) -> Result<Self, TunnelError> {
        let invalid = || TunnelError::InvalidAuthority(raw.to_string());

        let authority: Authority = raw.parse().map_err(|_| invalid())?;
        if authority.as_str().contains('@') {
            return Err(invalid());
        }

        let raw_host = authority.host();
        let host = raw_host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }

        let port = match authority.as_str()[raw_host.len()..].strip_prefix(':') {
            Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
            None => DEFAULT_TLS_PORT,
        };
        if port == 0 {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// The CONNECT request-target, falling back to the Host header.
    pub fn from_request<B>(req: &Request<B>) -> Result<Self, TunnelError> {
        if let Some(authority) = req.uri().authority() {
            return Self::parse(authority.as_str());
        }
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| TunnelError::InvalidAuthority(req.uri().to_string()))?;
        Self::parse(host)
    }

    /// `host:port` with IPv6 literals re-bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_and_without_port() {
        assert_eq!(
            TunnelTarget::parse("example.com:8443").unwrap(),
            TunnelTarget {
                host: "example.com".into(),
                port: 8443
            }
        );
        assert_eq!(TunnelTarget::parse("example.com").unwrap().port, 443);
    }

    #[test]
    fn test_parse_ipv6() {
        let target = TunnelTarget::parse("[::1]:9443").unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.port, 9443);
        assert_eq!(target.authority(), "[::1]:9443");
    }

    #[test]
    fn test_unparsable_authorities() {
        for raw in ["", ":443", "example.com:", "example.com:0", "user@example.com:443", "exa mple.com:443", "example.com:http"] {
            assert!(
                matches!(TunnelTarget::parse(raw), Err(TunnelError::InvalidAuthority(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_from_request_uses_target_then_host() {
        let req = Request::connect("example.com:443").body(()).unwrap();
        assert_eq!(TunnelTarget::from_request(&req).unwrap().host, "example.com");

        let req = Request::connect("/")
            .header("host", "fallback.test:444")
            .body(())
            .unwrap();
        let target = TunnelTarget::from_request(&req).unwrap();
        assert_eq!(target.authority(), "fallback.test:444");
    }
}
