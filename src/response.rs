//! Response bodies and the two-phase response writer.

use std::fmt;
use std::io;
use std::num::NonZeroU64;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{HeaderMap, HeaderValue, PROXY_AUTHENTICATE};
use hyper::{Response, StatusCode};
use tokio_util::io::{ReaderStream, StreamReader};

use crate::throttle::RateLimitedReader;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the proxy produces.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// A bare status response whose body is the canonical reason phrase.
pub fn status(code: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(full(code.canonical_reason().unwrap_or_default()));
    *response.status_mut() = code;
    response
}

pub fn proxy_auth_required() -> Response<ProxyBody> {
    let mut response = status(StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    response
        .headers_mut()
        .insert(PROXY_AUTHENTICATE, HeaderValue::from_static("Basic"));
    response
}

pub fn boxed<B>(body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed()
}

/// Streams `body` through a [`RateLimitedReader`]; without a limit the body
/// is only boxed.
pub fn throttled<B>(body: B, limit: Option<NonZeroU64>) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + Sync + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    let Some(limit) = limit else {
        return boxed(body);
    };
    let data = TryStreamExt::map_err(body.into_data_stream(), |e| {
        let e: BoxError = e.into();
        io::Error::other(e)
    });
    let reader = RateLimitedReader::new(StreamReader::new(data), Some(limit));
    let frames = ReaderStream::new(reader).map_ok(Frame::data);
    BodyExt::map_err(StreamBody::new(frames), |e| Box::new(e) as BoxError).boxed()
}

pub type CommitHook = Box<dyn FnOnce(StatusCode, &mut HeaderMap) + Send>;

/// Collects headers, then produces the response in a single `commit`.
///
/// A hook registered with [`ResponseWriter::on_commit`] sees the final status
/// and may edit headers right before they are frozen.
#[derive(Default)]
pub struct ResponseWriter {
    headers: HeaderMap,
    hook: Option<CommitHook>,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Appends every header from `from`, keeping repeated values.
    pub fn copy_headers(&mut self, from: &HeaderMap) {
        for (name, value) in from {
            self.headers.append(name, value.clone());
        }
    }

    pub fn on_commit<F>(&mut self, hook: F)
    where
        F: FnOnce(StatusCode, &mut HeaderMap) + Send + 'static,
    {
        self.hook = Some(Box::new(hook));
    }

    pub fn commit(mut self, status: StatusCode, body: ProxyBody) -> Response<ProxyBody> {
        if let Some(hook) = self.hook.take() {
            hook(status, &mut self.headers);
        }
        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = self.headers;
        response
    }
}

impl fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("headers", &self.headers)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{LOCATION, SET_COOKIE};
    use std::time::Duration;

    #[test]
    fn copy_keeps_repeated_headers() {
        let mut upstream = HeaderMap::new();
        upstream.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        upstream.append(SET_COOKIE, HeaderValue::from_static("b=2"));

        let mut writer = ResponseWriter::new();
        writer.copy_headers(&upstream);
        let resp = writer.commit(StatusCode::OK, empty());
        assert_eq!(resp.headers().get_all(SET_COOKIE).iter().count(), 2);
    }

    #[test]
    fn hook_sees_status_and_edits_headers() {
        let mut writer = ResponseWriter::new();
        writer
            .headers_mut()
            .insert(LOCATION, HeaderValue::from_static("http://old/"));
        writer.on_commit(|status, headers| {
            if status.is_redirection() {
                headers.insert(LOCATION, HeaderValue::from_static("http://new/"));
            }
        });
        let resp = writer.commit(StatusCode::FOUND, empty());
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers()[LOCATION], "http://new/");
    }

    #[tokio::test]
    async fn status_body_is_reason_phrase() {
        let resp = status(StatusCode::BAD_GATEWAY);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "Bad Gateway");
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_body_keeps_content() {
        let payload = Bytes::from(vec![b'x'; 4096]);
        let body = throttled(Full::new(payload.clone()), NonZeroU64::new(1024));
        let start = tokio::time::Instant::now();
        let out = body.collect().await.unwrap().to_bytes();
        assert_eq!(out, payload);
        // A single read never waits; only the read after a closed window does.
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
