//! Reverse proxying to one fixed backend, with optional `Host` and
//! `Location` fixing.

use std::net::{IpAddr, SocketAddr};

use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, LOCATION};
use hyper::{Request, Response, StatusCode, Uri};
use tracing::{debug, warn};
use url::{Position, Url};

use crate::error::ProxyError;
use crate::response::{self, boxed, ProxyBody, ResponseWriter};
use crate::server::Handler;
use crate::transport::Transport;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone)]
pub struct ReverseProxy {
    backend: Url,
    fix_host: bool,
    fix_redirect: bool,
    transport: Transport,
}

impl ReverseProxy {
    /// Backends are reached over `http` or `https`.
    pub fn new(backend: Url, transport: Transport) -> Result<Self, ProxyError> {
        if !matches!(backend.scheme(), "http" | "https") {
            return Err(ProxyError::Config(format!(
                "backend {backend}: only http and https backends are supported"
            )));
        }
        if backend.host_str().map_or(true, str::is_empty) {
            return Err(ProxyError::Config(format!("backend {backend}: missing host")));
        }
        Ok(Self {
            backend,
            fix_host: false,
            fix_redirect: false,
            transport,
        })
    }

    /// Send the backend's own authority as `Host` instead of the client's.
    pub fn fix_host(mut self, on: bool) -> Self {
        self.fix_host = on;
        self
    }

    /// Point redirects to the backend back at the client-facing host.
    pub fn fix_redirect(mut self, on: bool) -> Self {
        self.fix_redirect = on;
        self
    }

    pub async fn proxy(
        &self,
        mut req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let client_host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()));

        let uri = self.backend_uri(req.uri())?;
        let headers = req.headers_mut();
        remove_hop_by_hop(headers);
        append_forwarded_for(headers, peer.ip());
        if self.fix_host {
            let authority = HeaderValue::from_str(backend_authority(&self.backend))
                .map_err(|e| ProxyError::Config(e.to_string()))?;
            headers.insert(HOST, authority);
        }
        *req.uri_mut() = uri;

        let resp = self.transport.round_trip(req).await?;
        let (mut parts, body) = resp.into_parts();
        remove_hop_by_hop(&mut parts.headers);

        let mut writer = ResponseWriter::new();
        writer.copy_headers(&parts.headers);
        if let (true, Some(client_host)) = (self.fix_redirect, client_host) {
            let backend = self.backend.clone();
            writer.on_commit(move |_, headers| fix_location(headers, &backend, &client_host));
        }
        Ok(writer.commit(parts.status, boxed(body)))
    }

    fn backend_uri(&self, incoming: &Uri) -> Result<Uri, ProxyError> {
        let mut target = format!(
            "{}://{}{}",
            self.backend.scheme(),
            backend_authority(&self.backend),
            join_paths(self.backend.path(), incoming.path())
        );
        let queries = [self.backend.query(), incoming.query()];
        let mut queries = queries.iter().flatten().filter(|q| !q.is_empty());
        if let Some(first) = queries.next() {
            target.push('?');
            target.push_str(first);
            for q in queries {
                target.push('&');
                target.push_str(q);
            }
        }
        target
            .parse()
            .map_err(|e| ProxyError::BadRequest(format!("{target}: {e}")))
    }
}

impl Handler for ReverseProxy {
    async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let uri = req.uri().clone();
        match self.proxy(req, peer).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(%peer, %uri, backend = %self.backend, "{err}");
                match err {
                    ProxyError::BadRequest(_) => err.into_response(),
                    _ => response::status(StatusCode::BAD_GATEWAY),
                }
            }
        }
    }
}

fn backend_authority(backend: &Url) -> &str {
    &backend[Position::BeforeHost..Position::AfterPort]
}

/// Joins two paths with exactly one slash between them.
pub fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// Removes hop-by-hop headers, including any named by `Connection`.
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in &named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let mut chain: Vec<String> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();
    chain.push(ip.to_string());
    if let Ok(value) = HeaderValue::from_str(&chain.join(", ")) {
        headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
    }
}

fn fix_location(headers: &mut HeaderMap, backend: &Url, client_host: &str) {
    let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) else {
        return;
    };
    let Some(rewritten) = rewrite_location(location, backend, client_host) else {
        return;
    };
    debug!(from = location, to = %rewritten, "rewrote redirect");
    if let Ok(value) = HeaderValue::from_str(&rewritten) {
        headers.insert(LOCATION, value);
    }
}

/// Maps a redirect aimed at the backend onto the client-facing host.
///
/// Matches only absolute URLs with the backend's scheme, host and port whose
/// path lies under the backend path. The backend path prefix is stripped.
pub fn rewrite_location(location: &str, backend: &Url, client_host: &str) -> Option<String> {
    let loc = Url::parse(location).ok()?;
    if loc.scheme() != backend.scheme()
        || loc.host_str() != backend.host_str()
        || loc.port_or_known_default() != backend.port_or_known_default()
    {
        return None;
    }

    let prefix = backend.path().trim_end_matches('/');
    let rest = loc.path().strip_prefix(prefix)?;
    if !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }
    let rest = if rest.is_empty() { "/" } else { rest };

    let mut out = format!("{}://{}{}", loc.scheme(), client_host, rest);
    if let Some(query) = loc.query() {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = loc.fragment() {
        out.push('#');
        out.push_str(fragment);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportOptions;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn proxy(backend: &str) -> ReverseProxy {
        ReverseProxy::new(url(backend), Transport::direct(TransportOptions::default())).unwrap()
    }

    #[test]
    fn rewrites_backend_redirect_to_client_host() {
        let backend = url("https://backend.internal/app");
        assert_eq!(
            rewrite_location("https://backend.internal/app/x", &backend, "public.example").as_deref(),
            Some("https://public.example/x")
        );
        assert_eq!(
            rewrite_location("https://backend.internal/app?a=1#top", &backend, "public.example")
                .as_deref(),
            Some("https://public.example/?a=1#top")
        );
    }

    #[test]
    fn leaves_foreign_redirects_alone() {
        let backend = url("https://backend.internal/app");
        for loc in [
            "https://elsewhere.example/app/x",
            "http://backend.internal/app/x",
            "https://backend.internal:8443/app/x",
            "https://backend.internal/application",
            "https://backend.internal/other",
            "/app/x",
        ] {
            assert_eq!(rewrite_location(loc, &backend, "public.example"), None, "{loc}");
        }
    }

    #[test]
    fn root_backend_keeps_whole_path() {
        let backend = url("http://10.0.0.2:8080/");
        assert_eq!(
            rewrite_location("http://10.0.0.2:8080/login", &backend, "site.example:80").as_deref(),
            Some("http://site.example:80/login")
        );
    }

    #[test]
    fn joins_with_single_slash() {
        assert_eq!(join_paths("/app", "/x"), "/app/x");
        assert_eq!(join_paths("/app/", "/x"), "/app/x");
        assert_eq!(join_paths("/app", "x"), "/app/x");
        assert_eq!(join_paths("/", "/"), "/");
    }

    #[test]
    fn backend_uri_merges_path_and_query() {
        let rp = proxy("http://10.0.0.2:8080/base?k=v");
        let uri = rp.backend_uri(&"/p/q?x=1".parse().unwrap()).unwrap();
        assert_eq!(uri, "http://10.0.0.2:8080/base/p/q?k=v&x=1");

        let rp = proxy("http://backend");
        let uri = rp.backend_uri(&"/only?x=1".parse().unwrap()).unwrap();
        assert_eq!(uri, "http://backend/only?x=1");
    }

    #[test]
    fn https_backend_is_accepted() {
        let rp = proxy("https://backend.internal/app");
        let uri = rp.backend_uri(&"/x".parse().unwrap()).unwrap();
        assert_eq!(uri, "https://backend.internal/app/x");
    }

    #[test]
    fn other_backend_schemes_are_rejected() {
        let err = ReverseProxy::new(
            url("ftp://backend.internal"),
            Transport::direct(TransportOptions::default()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn strips_hop_by_hop_and_connection_named_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, X-Trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("x-kept", HeaderValue::from_static("yes"));
        remove_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["x-kept"], "yes");
    }

    #[test]
    fn forwarded_for_appends_peer() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, "10.1.1.1".parse().unwrap());
        assert_eq!(headers[X_FORWARDED_FOR], "10.1.1.1");
        append_forwarded_for(&mut headers, "::1".parse().unwrap());
        assert_eq!(headers[X_FORWARDED_FOR], "10.1.1.1, ::1");
    }

    #[test]
    fn location_hook_rewrites_header() {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static("http://backend/app/in"));
        fix_location(&mut headers, &url("http://backend/app"), "front.example");
        assert_eq!(headers[LOCATION], "http://front.example/in");
    }
}
