use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use tracing::{debug, warn};

use crate::auth::Authorizer;
use crate::error::ProxyError;
use crate::forward::ForwardRequestHandler;
use crate::response::ProxyBody;
use crate::server::Handler;
use crate::transport::Transport;
use crate::tunnel::TunnelEstablisher;

/// The forward proxy: authorizes every request, then tunnels CONNECT and
/// forwards everything else.
#[derive(Debug, Clone)]
pub struct ForwardProxy {
    authorizer: Arc<Authorizer>,
    tunnels: TunnelEstablisher,
    forwarder: ForwardRequestHandler,
}

impl ForwardProxy {
    pub fn new(authorizer: Authorizer, transport: Transport) -> Self {
        Self {
            authorizer: Arc::new(authorizer),
            tunnels: TunnelEstablisher::new(transport.dialer().clone()),
            forwarder: ForwardRequestHandler::new(transport),
        }
    }

    pub async fn dispatch(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        let valve = self.authorizer.authorize(req.headers())?;
        if req.method() == Method::CONNECT {
            self.tunnels.establish(req, valve).await
        } else {
            self.forwarder.forward(req, valve).await
        }
    }
}

impl Handler for ForwardProxy {
    async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        match self.dispatch(req).await {
            Ok(resp) => resp,
            Err(err @ ProxyError::AuthRequired) => {
                debug!(%peer, %method, %uri, "{err}");
                err.into_response()
            }
            Err(err) => {
                warn!(%peer, %method, %uri, "{err}");
                err.into_response()
            }
        }
    }
}
