//! Forward and reverse HTTP proxying with upstream chaining and per-user
//! bandwidth limits.
//!
//! The forward proxy ([`ForwardProxy`]) authorizes each request against an
//! [`Authorizer`], tunnels `CONNECT` requests and forwards absolute-form
//! requests to their origin. The reverse proxy ([`ReverseProxy`]) sends every
//! request to one backend. Both dial out through an [`UpstreamDialer`], which
//! can chain through an HTTP or SOCKS5 proxy.

pub mod auth;
pub mod buffer_pool;
pub mod config;
pub mod connection;
pub mod error;
pub mod forward;
pub mod io;
pub mod proxy;
pub mod response;
pub mod reverse;
pub mod server;
pub mod target;
pub mod throttle;
pub mod transport;
pub mod tunnel;
pub mod upstream;
pub mod valve;

pub use auth::{Authenticator, Authorizer, Credential, CredentialCodec, UserTable};
pub use error::ProxyError;
pub use proxy::ForwardProxy;
pub use reverse::ReverseProxy;
pub use server::{serve, Handler};
pub use throttle::RateLimitedReader;
pub use transport::{Transport, TransportOptions};
pub use tunnel::TunnelEstablisher;
pub use upstream::{Dial, UpstreamDialer, UpstreamProxy};
pub use valve::{Limit, TrafficValve};
