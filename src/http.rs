use std::path::PathBuf;

use headers::{Authorization, HeaderMapExt};
use http::header::{self, HeaderValue};
use http::{Request, Response};
use hyper::client::HttpConnector;
use hyper::{Body, Client};
use hyper_rustls::HttpsConnector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("failed to build HTTP request: {0}")]
    BuildRequest(http::Error),
    #[error("failed to make HTTP(S) request: {0}")]
    CallRequest(#[from] hyper::Error),
    #[error("failed to read response body: {0}")]
    ReadBody(hyper::Error),
}

/// A plain HTTP(S) client with the default headers scrape targets expect.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>>,
    user_agent: HeaderValue,
}

impl HttpClient {
    pub fn new() -> Self {
        // TODO: build per-target connectors honoring TlsConfig's
        // ca_file/cert_file/key_file instead of native roots only
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .build();

        Self {
            client: Client::builder().build(https),
            user_agent: HeaderValue::from_static(concat!("promscrape/", env!("CARGO_PKG_VERSION"))),
        }
    }

    pub async fn send(&self, mut req: Request<Body>) -> Result<Response<Body>, HttpError> {
        self.apply_default_headers(&mut req);

        self.client.request(req).await.map_err(HttpError::CallRequest)
    }

    /// Fills in the headers every scrape request should carry, leaving
    /// anything the caller already set alone. Compression is declined
    /// since the exposition parser reads plain text.
    fn apply_default_headers<B>(&self, req: &mut Request<B>) {
        let headers = req.headers_mut();
        headers
            .entry(header::USER_AGENT)
            .or_insert_with(|| self.user_agent.clone());
        headers
            .entry(header::ACCEPT_ENCODING)
            .or_insert(HeaderValue::from_static("identity"));
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Credentials attached to every request for one scrape target.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "strategy")]
pub enum Auth {
    /// HTTP basic auth with a username and password.
    Basic { user: String, password: String },

    /// A bearer token sent in the Authorization header.
    Bearer { token: String },
}

impl Auth {
    /// Sets the Authorization header on a scrape request. A token that
    /// cannot form a valid header value is skipped with a warning; the
    /// scrape then proceeds unauthenticated and fails visibly at the
    /// target instead of inside the client.
    pub fn apply<B>(&self, req: &mut Request<B>) {
        let headers = req.headers_mut();
        match self {
            Auth::Basic { user, password } => {
                headers.typed_insert(Authorization::basic(user, password));
            }
            Auth::Bearer { token } => match Authorization::bearer(token) {
                Ok(bearer) => headers.typed_insert(bearer),
                Err(err) => warn!(message = "skipping malformed bearer token", %err),
            },
        }
    }
}

/// Per-target TLS material. Changing any field changes the target identity
/// and therefore restarts its scrape loop.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub server_name: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}
