//! HTTP/1 round trips over connections from the [`UpstreamDialer`].
//!
//! Every round trip opens a fresh connection; there is no idle pool.
//! `https` origins get a rustls session on top of the dialed stream.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use hyper::body::{Body, Incoming};
use hyper::client::conn::http1::Builder;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::ProxyError;
use crate::io::BoxedStream;
use crate::response::BoxError;
use crate::target::ProxyTarget;
use crate::upstream::UpstreamDialer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    /// How long to wait for the response head once the request is sent.
    pub idle_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

static DEFAULT_TLS: OnceLock<Result<Arc<ClientConfig>, String>> = OnceLock::new();

/// Client config trusting the Mozilla root set, shared by every transport
/// that was not given its own.
fn default_tls() -> Result<Arc<ClientConfig>, ProxyError> {
    DEFAULT_TLS
        .get_or_init(|| {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let mut config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
                .with_safe_default_protocol_versions()
                .map_err(|e| e.to_string())?
                .with_root_certificates(roots)
                .with_no_client_auth();
            config.alpn_protocols = vec![b"http/1.1".to_vec()];
            Ok(Arc::new(config))
        })
        .clone()
        .map_err(ProxyError::Config)
}

#[derive(Clone)]
pub struct Transport {
    dialer: UpstreamDialer,
    idle_timeout: Duration,
    tls: Option<Arc<ClientConfig>>,
}

impl Transport {
    pub fn new(dialer: UpstreamDialer, idle_timeout: Duration) -> Self {
        Self {
            dialer,
            idle_timeout,
            tls: None,
        }
    }

    /// Uses `config` instead of the built-in root set for `https` origins.
    pub fn with_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn direct(options: TransportOptions) -> Self {
        Self::new(
            UpstreamDialer::direct(options.connect_timeout),
            options.idle_timeout,
        )
    }

    pub fn dialer(&self) -> &UpstreamDialer {
        &self.dialer
    }

    /// Sends an absolute-form request to its origin and returns the response
    /// once its head has arrived.
    pub async fn round_trip<B>(&self, mut req: Request<B>) -> Result<Response<Incoming>, ProxyError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let target = ProxyTarget::from_uri(req.uri())?;
        let secure = match target.scheme.as_str() {
            "http" => false,
            "https" => true,
            other => {
                return Err(ProxyError::RoundTrip(format!(
                    "unsupported origin scheme {other}"
                )))
            }
        };
        to_origin_form(&mut req)?;

        let mut stream = self.dialer.dial(&target.addr()).await?;
        if secure {
            stream = self.secure(&target.host, stream).await?;
        }
        let (mut sender, conn) = Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::RoundTrip(e.to_string()))?;

        let addr = target.addr();
        let conn_handle = tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(%addr, "origin connection error: {err}");
            }
        });

        match tokio::time::timeout(self.idle_timeout, sender.send_request(req)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => {
                conn_handle.abort();
                Err(ProxyError::RoundTrip(e.to_string()))
            }
            Err(_) => {
                conn_handle.abort();
                Err(ProxyError::Timeout(self.idle_timeout))
            }
        }
    }
}

impl Transport {
    async fn secure(&self, host: &str, stream: BoxedStream) -> Result<BoxedStream, ProxyError> {
        let config = match &self.tls {
            Some(config) => Arc::clone(config),
            None => default_tls()?,
        };
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| ProxyError::BadRequest(format!("{host}: {e}")))?;
        let handshake = TlsConnector::from(config).connect(name, stream);
        match tokio::time::timeout(self.idle_timeout, handshake).await {
            Ok(Ok(tls)) => Ok(Box::new(tls) as BoxedStream),
            Ok(Err(e)) => Err(ProxyError::Handshake(format!("TLS with {host}: {e}"))),
            Err(_) => Err(ProxyError::Timeout(self.idle_timeout)),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("dialer", &self.dialer)
            .field("idle_timeout", &self.idle_timeout)
            .field("custom_tls", &self.tls.is_some())
            .finish()
    }
}

/// Moves the authority into `Host` (unless already set) and leaves only the
/// path and query in the request target.
fn to_origin_form<B>(req: &mut Request<B>) -> Result<(), ProxyError> {
    if let Some(authority) = req.uri().authority() {
        if !req.headers().contains_key(HOST) {
            let host = HeaderValue::from_str(authority.as_str())
                .map_err(|e| ProxyError::BadRequest(e.to_string()))?;
            req.headers_mut().insert(HOST, host);
        }
    }
    let path = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_string();
    *req.uri_mut() = path
        .parse::<Uri>()
        .map_err(|e| ProxyError::BadRequest(e.to_string()))?;
    Ok(())
}
