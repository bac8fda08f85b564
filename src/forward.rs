//! Plain (non-CONNECT) proxied requests.

use hyper::body::Body;
use hyper::header::{HeaderMap, CONNECTION, PROXY_AUTHORIZATION};
use hyper::{Request, Response};
use tracing::debug;

use crate::error::ProxyError;
use crate::response::{throttled, BoxError, ProxyBody, ResponseWriter};
use crate::transport::Transport;
use crate::valve::TrafficValve;

const PROXY_CONNECTION: &str = "proxy-connection";

/// Drops headers meant for this proxy only.
///
/// `Proxy-Connection` is folded into `Connection` when present; an absent
/// `Proxy-Connection` leaves `Connection` alone.
pub fn strip_proxy_headers(headers: &mut HeaderMap) {
    headers.remove(PROXY_AUTHORIZATION);
    if let Some(value) = headers.remove(PROXY_CONNECTION) {
        headers.insert(CONNECTION, value);
    }
}

#[derive(Debug, Clone)]
pub struct ForwardRequestHandler {
    transport: Transport,
}

impl ForwardRequestHandler {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    pub async fn forward<B>(
        &self,
        mut req: Request<B>,
        valve: TrafficValve,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        strip_proxy_headers(req.headers_mut());
        let uri = req.uri().clone();

        let resp = self.transport.round_trip(req).await?;
        debug!(%uri, status = %resp.status(), "forwarded");

        let (parts, body) = resp.into_parts();
        let mut writer = ResponseWriter::new();
        writer.copy_headers(&parts.headers);
        Ok(writer.commit(
            parts.status,
            throttled(body, valve.download.bytes_per_sec()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::BoxedStream;
    use crate::upstream::{Dial, UpstreamDialer};
    use crate::valve::Limit;
    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use http_body_util::{BodyExt, Empty};
    use hyper::header::HeaderValue;
    use std::io;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Instant;

    #[test]
    fn proxy_connection_replaces_connection() {
        let mut headers = HeaderMap::new();
        headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        headers.insert(PROXY_CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        strip_proxy_headers(&mut headers);
        assert!(headers.get(PROXY_AUTHORIZATION).is_none());
        assert!(headers.get(PROXY_CONNECTION).is_none());
        assert_eq!(headers[CONNECTION], "keep-alive");
    }

    #[test]
    fn connection_untouched_without_proxy_connection() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        strip_proxy_headers(&mut headers);
        assert_eq!(headers[CONNECTION], "close");
    }

    /// Origin on an in-memory pipe: answers any request with a 10 kB body
    /// sent as 500-byte chunks every 100ms.
    struct TrickleOrigin;

    impl Dial for TrickleOrigin {
        fn dial<'a>(&'a self, _addr: &'a str) -> BoxFuture<'a, io::Result<BoxedStream>> {
            Box::pin(async move {
                let (client, mut origin) = tokio::io::duplex(64 * 1024);
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut byte = [0u8; 1];
                    while !head.ends_with(b"\r\n\r\n") {
                        origin.read_exact(&mut byte).await.unwrap();
                        head.push(byte[0]);
                    }
                    origin
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10000\r\n\r\n")
                        .await
                        .unwrap();
                    for _ in 0..20 {
                        origin.write_all(&[0u8; 500]).await.unwrap();
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                });
                Ok(Box::new(client) as BoxedStream)
            })
        }
    }

    fn trickle_handler() -> ForwardRequestHandler {
        let dialer = UpstreamDialer::new(None, Arc::new(TrickleOrigin));
        ForwardRequestHandler::new(Transport::new(dialer, Duration::from_secs(30)))
    }

    async fn fetch(handler: &ForwardRequestHandler, valve: TrafficValve) -> (usize, Duration) {
        let req = Request::get("http://origin.test/big")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let start = Instant::now();
        let resp = handler.forward(req, valve).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (body.len(), start.elapsed())
    }

    #[tokio::test(start_paused = true)]
    async fn download_limit_slows_forwarded_body() {
        let valve = TrafficValve::new(Limit::Unlimited, Limit::from_bytes_per_sec(1000));
        let (len, elapsed) = fetch(&trickle_handler(), valve).await;
        assert_eq!(len, 10_000);
        // ~5500 bytes in the first second owe 4.5s before the rest flows.
        assert!(elapsed >= Duration::from_secs(5), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_body_arrives_at_origin_pace() {
        let (len, elapsed) = fetch(&trickle_handler(), TrafficValve::UNLIMITED).await;
        assert_eq!(len, 10_000);
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    }
}
