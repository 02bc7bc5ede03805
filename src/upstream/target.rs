//! The fixed backend target.

use std::fmt;
use std::str::FromStr;

use axum::http::uri::{Authority, Scheme};
use thiserror::Error;
use url::{Host, Url};

/// Error type for backend URL parsing.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("not a valid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("unsupported scheme `{0}`, expected http or https")]
    UnsupportedScheme(String),

    #[error("URL has no host")]
    MissingHost,

    #[error("invalid authority: {0}")]
    Authority(#[from] axum::http::uri::InvalidUri),
}

/// The single upstream the proxy forwards to.
///
/// Parsed once at startup and shared read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    scheme: Scheme,
    authority: Authority,
    host: String,
    port: u16,
    base_path: String,
    base_query: Option<String>,
}

impl BackendTarget {
    /// Parse a backend URL such as `http://localhost:8081` or `https://api:9443/v1`.
    pub fn parse(raw: &str) -> Result<Self, TargetError> {
        let url = Url::parse(raw)?;

        let scheme = match url.scheme() {
            "http" => Scheme::HTTP,
            "https" => Scheme::HTTPS,
            other => return Err(TargetError::UnsupportedScheme(other.to_string())),
        };

        let (host, authority_host) = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => {
                (domain.to_string(), domain.to_string())
            }
            Some(Host::Ipv4(addr)) => (addr.to_string(), addr.to_string()),
            Some(Host::Ipv6(addr)) => (addr.to_string(), format!("[{addr}]")),
            _ => return Err(TargetError::MissingHost),
        };
        let port = url.port_or_known_default().ok_or(TargetError::MissingHost)?;
        let authority = Authority::from_str(&format!("{authority_host}:{port}"))?;

        // "/" and "" both mean "no base path"
        let base_path = match url.path() {
            "/" => String::new(),
            path => path.to_string(),
        };

        Ok(Self {
            scheme,
            authority,
            host,
            port,
            base_path,
            base_query: url.query().filter(|q| !q.is_empty()).map(str::to_string),
        })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Host to dial and to present as SNI (IPv6 without brackets).
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn base_query(&self) -> Option<&str> {
        self.base_query.as_deref()
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }

    /// Key under which connections to this target are pooled.
    pub fn pool_key(&self) -> PoolKey {
        PoolKey {
            scheme: self.scheme.clone(),
            authority: self.authority.clone(),
        }
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.base_path)
    }
}

/// Identity of a pooled connection: (scheme, host:port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    scheme: Scheme,
    authority: Authority,
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_http_target() {
        let target = BackendTarget::parse("http://localhost:8081").unwrap();
        assert_eq!(target.scheme(), &Scheme::HTTP);
        assert_eq!(target.authority().as_str(), "localhost:8081");
        assert_eq!(target.host(), "localhost");
        assert_eq!(target.port(), 8081);
        assert_eq!(target.base_path(), "");
        assert!(!target.is_tls());
    }

    #[test]
    fn https_uses_default_port() {
        let target = BackendTarget::parse("https://api.internal").unwrap();
        assert!(target.is_tls());
        assert_eq!(target.port(), 443);
        assert_eq!(target.authority().as_str(), "api.internal:443");
    }

    #[test]
    fn keeps_base_path_and_query() {
        let target = BackendTarget::parse("http://10.0.0.7:9000/v1?tenant=a").unwrap();
        assert_eq!(target.base_path(), "/v1");
        assert_eq!(target.base_query(), Some("tenant=a"));
        assert_eq!(target.to_string(), "http://10.0.0.7:9000/v1");
    }

    #[test]
    fn ipv6_host_is_bracketed_only_in_authority() {
        let target = BackendTarget::parse("http://[::1]:8081").unwrap();
        assert_eq!(target.host(), "::1");
        assert_eq!(target.authority().as_str(), "[::1]:8081");
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(matches!(
            BackendTarget::parse("ftp://files.internal"),
            Err(TargetError::UnsupportedScheme(s)) if s == "ftp"
        ));
    }

    #[test]
    fn rejects_relative_urls() {
        assert!(matches!(
            BackendTarget::parse("localhost:8081/path"),
            Err(TargetError::UnsupportedScheme(_)) | Err(TargetError::Url(_))
        ));
    }

    #[test]
    fn pool_key_ignores_base_path() {
        let a = BackendTarget::parse("http://backend:80/a").unwrap();
        let b = BackendTarget::parse("http://backend/b").unwrap();
        assert_eq!(a.pool_key(), b.pool_key());
        assert_eq!(a.pool_key().to_string(), "http://backend:80");
    }
}
