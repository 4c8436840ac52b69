//! Client key derivation.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::header::COOKIE;
use axum::http::{HeaderMap, Method, Request};

/// Identity of an authenticated caller.
///
/// The host's authentication layer inserts this as a request extension; the
/// gate never authenticates anyone itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// A key that uniquely identifies a rate-limited caller.
///
/// Rendered as `user:{id}`, `ip:{address}` or `session:{id}`. Callers that
/// offer none of these share the `anonymous` bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientKey {
    /// Authenticated user id
    User(String),
    /// Remote address
    Ip(IpAddr),
    /// Session id from the session cookie
    Session(String),
    /// No identifying information at all
    Anonymous,
}

impl ClientKey {
    /// Convert the client key to its tagged string form.
    pub fn to_string_key(&self) -> String {
        match self {
            ClientKey::User(id) => format!("user:{}", id),
            ClientKey::Ip(addr) => format!("ip:{}", addr),
            ClientKey::Session(id) => format!("session:{}", id),
            ClientKey::Anonymous => "anonymous".to_string(),
        }
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// A client's window on one protected route.
///
/// Every route keeps its own timestamp log, so a short window never prunes
/// entries a longer window on another route still counts, and routes never
/// spend each other's quota.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    client: ClientKey,
    method: Method,
    route: String,
}

impl WindowKey {
    /// Key for `client` on the route `method route`.
    pub fn new(client: ClientKey, method: Method, route: impl Into<String>) -> Self {
        Self {
            client,
            method,
            route: route.into(),
        }
    }

    /// The client owning the window.
    pub fn client(&self) -> &ClientKey {
        &self.client
    }

    /// Route template the window belongs to.
    pub fn route(&self) -> &str {
        &self.route
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} {}", self.client, self.method, self.route)
    }
}

/// Derives a [`ClientKey`] for each request.
///
/// Precedence: authenticated user, then remote IP, then session cookie.
#[derive(Debug, Clone)]
pub struct ClientIdentifier {
    /// Honour the leftmost `X-Forwarded-For` entry ahead of the socket address
    trust_forwarded_for: bool,
    /// Name of the cookie carrying the session id
    session_cookie: String,
}

impl ClientIdentifier {
    /// Create an identifier.
    pub fn new(trust_forwarded_for: bool, session_cookie: impl Into<String>) -> Self {
        Self {
            trust_forwarded_for,
            session_cookie: session_cookie.into(),
        }
    }

    /// Derive the key for a request.
    pub fn identify<B>(&self, req: &Request<B>) -> ClientKey {
        if let Some(AuthenticatedUser(id)) = req.extensions().get::<AuthenticatedUser>() {
            if !id.is_empty() {
                return ClientKey::User(id.clone());
            }
        }

        if self.trust_forwarded_for {
            if let Some(addr) = forwarded_for(req.headers()) {
                return ClientKey::Ip(addr);
            }
        }

        if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
            return ClientKey::Ip(addr.ip());
        }

        if let Some(session) = cookie_value(req.headers(), &self.session_cookie) {
            return ClientKey::Session(session);
        }

        ClientKey::Anonymous
    }
}

impl Default for ClientIdentifier {
    fn default() -> Self {
        Self::new(false, "session_id")
    }
}

/// Leftmost parseable address of `X-Forwarded-For`.
fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let value = headers.get("x-forwarded-for")?.to_str().ok()?;
    value.split(',').next()?.trim().parse().ok()
}

/// Value of the named cookie, if present and non-empty.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, v)| *k == name && !v.is_empty())
        .map(|(_, v)| v.to_string())
}
