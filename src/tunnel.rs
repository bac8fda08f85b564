//! CONNECT handling: dial, hijack, acknowledge, then relay until either side
//! finishes.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::upgrade::{OnUpgrade, Parts, Upgraded};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info_span, Instrument};

use crate::buffer_pool::{lease_buffer, RELAY_BUFFER_SIZE};
use crate::connection::TunnelGuard;
use crate::error::ProxyError;
use crate::io::BoxedStream;
use crate::response::{empty, ProxyBody};
use crate::target::ProxyTarget;
use crate::throttle::RateLimitedReader;
use crate::upstream::UpstreamDialer;
use crate::valve::TrafficValve;

/// A client connection taken over from the HTTP server, together with any
/// bytes the server had read past the CONNECT head.
pub struct Hijacked {
    io: BoxedStream,
    buffered: Bytes,
}

impl Hijacked {
    pub fn new(io: BoxedStream, buffered: Bytes) -> Self {
        Self { io, buffered }
    }

    /// Recovers the raw socket when the server runs over plain TCP; any
    /// other transport keeps going through the upgrade wrapper.
    pub fn from_upgraded(upgraded: Upgraded) -> Self {
        match upgraded.downcast::<TokioIo<TcpStream>>() {
            Ok(Parts { io, read_buf, .. }) => Self::new(Box::new(io.into_inner()), read_buf),
            Err(upgraded) => Self::new(Box::new(TokioIo::new(upgraded)), Bytes::new()),
        }
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffered
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub uploaded: u64,
    pub downloaded: u64,
}

/// A hijacked client paired with its dialed target.
pub struct Tunnel {
    client: Hijacked,
    target: BoxedStream,
    valve: TrafficValve,
}

impl Tunnel {
    pub fn new(client: Hijacked, target: BoxedStream, valve: TrafficValve) -> Self {
        Self {
            client,
            target,
            valve,
        }
    }

    /// Relays until one direction reaches EOF or fails, then tears down both.
    ///
    /// Client to target runs on a spawned task, target to client inline.
    /// The spawned task is always awaited before returning.
    pub async fn run(self) -> Result<TunnelStats, ProxyError> {
        let _guard = TunnelGuard::new();
        let Hijacked {
            io: client,
            buffered,
        } = self.client;
        let mut target = self.target;

        let uploaded = Arc::new(AtomicU64::new(0));
        let downloaded = Arc::new(AtomicU64::new(0));

        for chunk in buffered.chunks(RELAY_BUFFER_SIZE) {
            target.write_all(chunk).await.map_err(ProxyError::Relay)?;
        }
        target.flush().await.map_err(ProxyError::Relay)?;
        uploaded.fetch_add(buffered.len() as u64, Ordering::Relaxed);

        let (client_read, client_write) = tokio::io::split(client);
        let (target_read, target_write) = tokio::io::split(target);

        let upload = RateLimitedReader::new(client_read, self.valve.upload.bytes_per_sec());
        let download = RateLimitedReader::new(target_read, self.valve.download.bytes_per_sec());

        let mut uploader = tokio::spawn(
            relay(upload, target_write, Arc::clone(&uploaded)).in_current_span(),
        );
        let downloader = relay(download, client_write, Arc::clone(&downloaded));
        tokio::pin!(downloader);

        let result = tokio::select! {
            joined = &mut uploader => match joined {
                Ok(res) => res,
                Err(e) => Err(io::Error::other(e)),
            },
            res = &mut downloader => {
                uploader.abort();
                let _ = uploader.await;
                res
            }
        };

        let stats = TunnelStats {
            uploaded: uploaded.load(Ordering::Relaxed),
            downloaded: downloaded.load(Ordering::Relaxed),
        };
        result.map(|()| stats).map_err(ProxyError::Relay)
    }
}

/// Copies `reader` into `writer` until EOF, then shuts the writer down.
async fn relay<R, W>(mut reader: R, mut writer: W, counter: Arc<AtomicU64>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lease = lease_buffer().await;
    loop {
        let buf = lease.as_mut_slice();
        let n = reader.read(buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
    writer.shutdown().await
}

/// Answers CONNECT requests by tunneling them to their target.
#[derive(Debug, Clone)]
pub struct TunnelEstablisher {
    dialer: UpstreamDialer,
}

impl TunnelEstablisher {
    pub fn new(dialer: UpstreamDialer) -> Self {
        Self { dialer }
    }

    /// Dials the target and takes the client connection over.
    ///
    /// The returned `200 Connection Established` must reach the client
    /// before the relay can start, so the relay runs on its own task once
    /// hyper hands over the upgraded connection.
    pub async fn establish(
        &self,
        mut req: Request<Incoming>,
        valve: TrafficValve,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let target = ProxyTarget::from_uri(req.uri())?;
        let addr = target.addr();
        let upstream = self.dialer.dial(&addr).await?;

        let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
            return Err(ProxyError::Hijack(
                "connection cannot be taken over".into(),
            ));
        };

        let span = info_span!("tunnel", %addr);
        tokio::spawn(
            async move {
                let client = match on_upgrade.await {
                    Ok(upgraded) => Hijacked::from_upgraded(upgraded),
                    Err(e) => {
                        debug!("upgrade failed: {e}");
                        return;
                    }
                };
                debug!(buffered = client.buffered().len(), %valve, "tunnel open");
                match Tunnel::new(client, upstream, valve).run().await {
                    Ok(stats) => debug!(
                        up = stats.uploaded,
                        down = stats.downloaded,
                        "tunnel closed"
                    ),
                    Err(e) => debug!("tunnel ended: {e}"),
                }
            }
            .instrument(span),
        );

        let mut resp = Response::new(empty());
        *resp.version_mut() = req.version();
        resp.extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection Established"));
        Ok(resp)
    }
}
