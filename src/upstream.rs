//! Outbound connections, optionally negotiated through an upstream proxy.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::future::BoxFuture;
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;
use url::Url;

use crate::auth::{encode_basic, Credential};
use crate::error::ProxyError;
use crate::io::{BoxedStream, Rewind};
use crate::target::{default_port, join_host_port};

/// Largest upstream CONNECT response head we are willing to buffer.
pub const MAX_CONNECT_HEAD: usize = 8192;

/// Opens a raw byte stream to `host:port`.
pub trait Dial: Send + Sync {
    fn dial<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<BoxedStream>>;
}

/// Plain TCP with a connect timeout and `TCP_NODELAY`.
#[derive(Debug, Clone, Copy)]
pub struct TcpDialer {
    pub connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Dial for TcpDialer {
    fn dial<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<BoxedStream>> {
        Box::pin(async move {
            let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect timed out after {:?}", self.connect_timeout),
                    )
                })??;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// An upstream proxy parsed from `scheme://[user[:pass]@]host[:port]`.
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl UpstreamProxy {
    /// Unknown schemes parse fine; they are refused when dialing.
    pub fn parse(input: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(input).map_err(|e| ProxyError::Config(format!("{input}: {e}")))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::Config(format!("{input}: missing host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let scheme = url.scheme().to_string();
        let port = url.port().unwrap_or_else(|| default_port(&scheme));

        let username = Some(decode_userinfo(url.username())?).filter(|u| !u.is_empty());
        let password = url.password().map(decode_userinfo).transpose()?;

        Ok(Self {
            scheme,
            host,
            port,
            username,
            password,
        })
    }

    pub fn addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    pub fn credential(&self) -> Option<Credential> {
        let username = self.username.clone()?;
        Some(Credential::new(username, self.password.clone()))
    }
}

fn decode_userinfo(raw: &str) -> Result<String, ProxyError> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| ProxyError::Config(format!("upstream credentials: {e}")))
}

impl fmt::Debug for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamProxy")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl fmt::Display for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.addr())
    }
}

/// Connects to `target`, going through `upstream` when one is set.
pub async fn dial_pass(
    target: &str,
    upstream: Option<&UpstreamProxy>,
    base: &dyn Dial,
) -> Result<BoxedStream, ProxyError> {
    let Some(upstream) = upstream else {
        return dial_raw(base, target).await;
    };

    match upstream.scheme.as_str() {
        "socks5" | "socks5h" => {
            let stream = dial_raw(base, &upstream.addr()).await?;
            socks5_connect(stream, target, upstream.credential()).await
        }
        "http" | "https" => {
            let stream = dial_raw(base, &upstream.addr()).await?;
            http_connect(stream, target, upstream.credential().as_ref()).await
        }
        other => Err(ProxyError::UpstreamUnsupported(other.to_string())),
    }
}

async fn dial_raw(base: &dyn Dial, addr: &str) -> Result<BoxedStream, ProxyError> {
    base.dial(addr).await.map_err(|source| ProxyError::Dial {
        addr: addr.to_string(),
        source,
    })
}

async fn socks5_connect(
    stream: BoxedStream,
    target: &str,
    credential: Option<Credential>,
) -> Result<BoxedStream, ProxyError> {
    let socks = match credential {
        Some(Credential {
            username,
            password,
        }) => {
            let password = password.unwrap_or_default();
            Socks5Stream::connect_with_password_and_socket(stream, target, &username, &password)
                .await
        }
        None => Socks5Stream::connect_with_socket(stream, target).await,
    }
    .map_err(|e| ProxyError::Handshake(format!("socks5: {e}")))?;
    Ok(Box::new(socks))
}

/// Sends `CONNECT target` over `stream` and waits for a 200.
pub async fn http_connect(
    mut stream: BoxedStream,
    target: &str,
    credential: Option<&Credential>,
) -> Result<BoxedStream, ProxyError> {
    let mut head = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(cred) = credential {
        head.push_str("Proxy-Authorization: Basic ");
        head.push_str(&encode_basic(&cred.username, cred.password.as_deref()));
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    stream
        .write_all(head.as_bytes())
        .await
        .map_err(|e| ProxyError::Handshake(format!("sending CONNECT: {e}")))?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let n = stream
            .read_buf(&mut buf)
            .await
            .map_err(|e| ProxyError::Handshake(format!("reading CONNECT response: {e}")))?;
        if n == 0 {
            return Err(ProxyError::Handshake(
                "upstream closed before answering CONNECT".into(),
            ));
        }

        match parse_connect_head(&buf)? {
            None if buf.len() >= MAX_CONNECT_HEAD => {
                return Err(ProxyError::Handshake(format!(
                    "CONNECT response head exceeds {MAX_CONNECT_HEAD} bytes"
                )));
            }
            None => continue,
            Some(ConnectHead { len, status: 200, .. }) => {
                let rest = buf.split_off(len).freeze();
                debug!(addr = target, buffered = rest.len(), "upstream CONNECT established");
                if rest.is_empty() {
                    return Ok(stream);
                }
                return Ok(Box::new(Rewind::new(stream, rest)));
            }
            Some(ConnectHead {
                status, challenge, ..
            }) => {
                let mut reason = http::StatusCode::from_u16(status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("status {status}"));
                if status == 407 {
                    if let Some(challenge) = challenge {
                        reason.push(' ');
                        reason.push_str(&challenge);
                    }
                }
                return Err(ProxyError::Handshake(reason));
            }
        }
    }
}

struct ConnectHead {
    len: usize,
    status: u16,
    challenge: Option<String>,
}

fn parse_connect_head(buf: &[u8]) -> Result<Option<ConnectHead>, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut res = httparse::Response::new(&mut headers);
    let len = match res
        .parse(buf)
        .map_err(|e| ProxyError::Handshake(format!("malformed CONNECT response: {e}")))?
    {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };
    let status = res
        .code
        .ok_or_else(|| ProxyError::Handshake("CONNECT response without status".into()))?;
    let challenge = res
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("proxy-authenticate"))
        .map(|h| String::from_utf8_lossy(h.value).into_owned());
    Ok(Some(ConnectHead {
        len,
        status,
        challenge,
    }))
}

/// The dialer every outbound connection goes through.
#[derive(Clone)]
pub struct UpstreamDialer {
    upstream: Option<UpstreamProxy>,
    base: Arc<dyn Dial>,
}

impl UpstreamDialer {
    pub fn direct(connect_timeout: Duration) -> Self {
        Self {
            upstream: None,
            base: Arc::new(TcpDialer::new(connect_timeout)),
        }
    }

    pub fn new(upstream: Option<UpstreamProxy>, base: Arc<dyn Dial>) -> Self {
        Self { upstream, base }
    }

    pub async fn dial(&self, target: &str) -> Result<BoxedStream, ProxyError> {
        if let Some(upstream) = &self.upstream {
            debug!(addr = target, via = %upstream, "dialing through upstream");
        }
        dial_pass(target, self.upstream.as_ref(), self.base.as_ref()).await
    }
}

impl fmt::Debug for UpstreamDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamDialer")
            .field("upstream", &self.upstream)
            .finish_non_exhaustive()
    }
}
