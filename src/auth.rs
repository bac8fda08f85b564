//! `Proxy-Authorization` decoding and per-user authorization.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::header::{HeaderMap, PROXY_AUTHORIZATION};
use tracing::debug;

use crate::error::ProxyError;
use crate::valve::TrafficValve;

/// A decoded username and optional password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: Option<String>,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }

    /// Both halves, or `None` when the password is missing.
    pub fn into_pair(self) -> Option<(String, String)> {
        let password = self.password?;
        Some((self.username, password))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Decodes the payload that follows a scheme name.
pub type SchemeDecoder = Arc<dyn Fn(&str) -> Option<Credential> + Send + Sync>;

/// Scheme dispatch for `Proxy-Authorization` values.
///
/// `Basic` is built in. Other schemes fail unless a decoder was registered
/// for them before serving started.
#[derive(Clone, Default)]
pub struct CredentialCodec {
    decoders: HashMap<String, SchemeDecoder>,
}

impl CredentialCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scheme: impl Into<String>, decoder: SchemeDecoder) {
        self.decoders.insert(scheme.into(), decoder);
    }

    pub fn decode(&self, value: &str) -> Option<Credential> {
        let (scheme, payload) = value.split_once(' ')?;
        let (scheme, payload) = (scheme.trim(), payload.trim());
        if scheme == "Basic" {
            return decode_basic(payload);
        }
        let decoder = self.decoders.get(scheme)?;
        decoder(payload)
    }
}

impl fmt::Debug for CredentialCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCodec")
            .field("schemes", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub fn decode_basic(payload: &str) -> Option<Credential> {
    let raw = STANDARD.decode(payload).ok()?;
    if raw.is_empty() {
        return None;
    }
    let text = String::from_utf8(raw).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some(Credential::new(user.trim(), Some(pass.trim().to_string())))
}

/// Base64 `user[:pass]` for a `Basic` header sent upstream.
pub fn encode_basic(username: &str, password: Option<&str>) -> String {
    match password {
        Some(password) => STANDARD.encode(format!("{username}:{password}")),
        None => STANDARD.encode(username),
    }
}

/// Decides whether a username/password may use the proxy, and at which rates.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> Option<TrafficValve>;
}

impl<F> Authenticator for F
where
    F: Fn(&str, &str) -> Option<TrafficValve> + Send + Sync,
{
    fn authenticate(&self, username: &str, password: &str) -> Option<TrafficValve> {
        self(username, password)
    }
}

/// Static users loaded from the command line.
#[derive(Clone, Default)]
pub struct UserTable {
    users: HashMap<String, (String, TrafficValve)>,
}

impl UserTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, username: impl Into<String>, password: impl Into<String>, valve: TrafficValve) {
        self.users.insert(username.into(), (password.into(), valve));
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl fmt::Debug for UserTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.users.iter().map(|(name, (_, valve))| (name, valve)))
            .finish()
    }
}

impl Authenticator for UserTable {
    fn authenticate(&self, username: &str, password: &str) -> Option<TrafficValve> {
        let (expected, valve) = self.users.get(username)?;
        (expected == password).then_some(*valve)
    }
}

/// Resolves the traffic valve for a request, or the error to answer with.
#[derive(Clone, Default)]
pub struct Authorizer {
    codec: CredentialCodec,
    authenticator: Option<Arc<dyn Authenticator>>,
    default_valve: TrafficValve,
}

impl Authorizer {
    /// Lets every request through with `default_valve`.
    pub fn open(default_valve: TrafficValve) -> Self {
        Self {
            default_valve,
            ..Self::default()
        }
    }

    pub fn new(authenticator: Arc<dyn Authenticator>, default_valve: TrafficValve) -> Self {
        Self {
            codec: CredentialCodec::new(),
            authenticator: Some(authenticator),
            default_valve,
        }
    }

    pub fn with_codec(mut self, codec: CredentialCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn authorize(&self, headers: &HeaderMap) -> Result<TrafficValve, ProxyError> {
        let Some(authenticator) = self.authenticator.as_ref() else {
            return Ok(self.default_valve);
        };

        let (username, password) = headers
            .get(PROXY_AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| self.codec.decode(value))
            .and_then(Credential::into_pair)
            .ok_or(ProxyError::AuthRequired)?;

        match authenticator.authenticate(&username, &password) {
            Some(valve) => Ok(valve.merge(&self.default_valve)),
            None => {
                debug!(user = %username, "credentials rejected");
                Err(ProxyError::AuthRejected)
            }
        }
    }
}

impl fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorizer")
            .field("codec", &self.codec)
            .field("authenticated", &self.authenticator.is_some())
            .field("default_valve", &self.default_valve)
            .finish()
    }
}
