use std::fmt;

use hyper::Uri;

use crate::error::ProxyError;

/// Where a proxied request ultimately wants to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl ProxyTarget {
    /// CONNECT carries an authority-form URI with no scheme; those default to
    /// `https` and therefore port 443.
    pub fn from_uri(uri: &Uri) -> Result<Self, ProxyError> {
        let authority = uri
            .authority()
            .filter(|a| !a.host().is_empty())
            .ok_or_else(|| ProxyError::BadRequest(format!("no host in {uri}")))?;
        let scheme = uri.scheme_str().unwrap_or("https").to_ascii_lowercase();
        let hostport = authority.as_str().rsplit('@').next().unwrap_or_default();

        let addr = host_to_addr(&scheme, hostport);
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::BadRequest(format!("no host in {uri}")))?;
        let port = port
            .parse()
            .map_err(|_| ProxyError::BadRequest(format!("bad port in {uri}")))?;
        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            scheme,
            port,
        })
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr())
    }
}

pub fn default_port(scheme: &str) -> u16 {
    match scheme {
        "http" => 80,
        "socks5" | "socks5h" => 1080,
        _ => 443,
    }
}

/// Formats `host:port`, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Appends the scheme's default port when `host` has none.
///
/// A colon only counts as a port separator if it comes after the closing
/// bracket of an IPv6 literal.
pub fn host_to_addr(scheme: &str, host: &str) -> String {
    let has_port = match (host.rfind(':'), host.rfind(']')) {
        (None, _) => false,
        (Some(colon), Some(bracket)) => colon > bracket,
        (Some(_), None) => true,
    };
    if has_port {
        host.to_string()
    } else {
        let port = if scheme.eq_ignore_ascii_case("http") { 80 } else { 443 };
        format!("{host}:{port}")
    }
}
