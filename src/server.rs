use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::response::ProxyBody;

/// Turns one inbound request into a response. Failures are already mapped
/// to error responses by the time this returns.
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> impl Future<Output = Response<ProxyBody>> + Send;
}

/// Accepts connections forever, serving each on its own task.
pub async fn serve<H: Handler>(listener: TcpListener, handler: Arc<H>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept error: {e} (continuing)");
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let handler = Arc::clone(&handler);
                async move { Ok::<_, Infallible>(handler.handle(req, peer).await) }
            });

            // No Date header: the CONNECT acknowledgement goes out as the bare
            // status line.
            if let Err(err) = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .auto_date_header(false)
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                debug!(%peer, "connection error: {err:?}");
            }
        });
    }
}
