//! Blocking HTTP for the Incus API.
//!
//! The local daemon is reached over its Unix socket with hyper, driven by a
//! short-lived current-thread runtime. Remote daemons use a blocking
//! reqwest client carrying the mutual-TLS configuration.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{ACCEPT, CONTENT_TYPE, HeaderMap, USER_AGENT};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use tracing::trace;

use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

fn user_agent() -> String {
    format!("coop/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Clone)]
pub enum Transport {
    Unix(PathBuf),
    Https {
        base: String,
        client: reqwest::blocking::Client,
    },
}

impl Transport {
    /// HTTPS transport for `base` (scheme, host and port, no path).
    pub fn https(base: &str, tls: rustls::ClientConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .use_preconfigured_tls(tls)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(user_agent())
            .build()
            .map_err(|e| Error::Transport(format!("build HTTPS client: {}", e)))?;
        Ok(Transport::Https {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Unix(path) => write!(f, "unix:{}", path.display()),
            Transport::Https { base, .. } => f.write_str(base),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect()
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    transport: Transport,
}

impl HttpClient {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    pub fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&[u8]>,
        headers: &[(&str, &str)],
        read_timeout: Duration,
    ) -> Result<Response> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| Error::Protocol(format!("invalid method {}: {}", method, e)))?;
        trace!(%method, path, "incus:http request");
        let response = match &self.transport {
            Transport::Unix(socket) => {
                let request = unix_request(socket, &method, path, body, headers)?;
                let what = format!("{} {}", method, path);
                run_blocking(read_timeout, &what, send_unix(socket, request))?
            }
            Transport::Https { base, client } => {
                send_https(client, base, &method, path, body, headers, read_timeout)?
            }
        };
        trace!(%method, path, status = response.status, "incus:http response");
        Ok(response)
    }
}

fn unix_request(
    socket: &std::path::Path,
    method: &Method,
    path: &str,
    body: Option<&[u8]>,
    headers: &[(&str, &str)],
) -> Result<Request<Full<Bytes>>> {
    let uri: Uri = UnixUri::new(socket, path).into();
    let mut builder = Request::builder()
        .method(method.clone())
        .uri(uri)
        .header(USER_AGENT, user_agent())
        .header(ACCEPT, "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let payload = match body {
        Some(bytes) => {
            builder = builder.header(CONTENT_TYPE, "application/json");
            Full::new(Bytes::copy_from_slice(bytes))
        }
        None => Full::new(Bytes::new()),
    };
    builder
        .body(payload)
        .map_err(|e| Error::Protocol(format!("build request {} {}: {}", method, path, e)))
}

async fn send_unix(socket: &std::path::Path, request: Request<Full<Bytes>>) -> Result<Response> {
    let client: Client<UnixConnector, Full<Bytes>> = Client::unix();
    let response = client
        .request(request)
        .await
        .map_err(|e| Error::Transport(format!("{}: {}", socket.display(), e)))?;
    let status = response.status().as_u16();
    let headers = header_pairs(response.headers());
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| Error::Transport(format!("read response from {}: {}", socket.display(), e)))?
        .to_bytes()
        .to_vec();
    Ok(Response {
        status,
        headers,
        body,
    })
}

/// Drive `future` to completion on a current-thread runtime, bounded by
/// `timeout`.
fn run_blocking<T>(
    timeout: Duration,
    what: &str,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        tokio::time::timeout(timeout, future)
            .await
            .map_err(|_| Error::Transport(format!("timed out after {:?}: {}", timeout, what)))?
    })
}

fn send_https(
    client: &reqwest::blocking::Client,
    base: &str,
    method: &Method,
    path: &str,
    body: Option<&[u8]>,
    headers: &[(&str, &str)],
    read_timeout: Duration,
) -> Result<Response> {
    let url = format!("{}{}", base, path);
    let mut builder = client
        .request(method.clone(), &url)
        .timeout(read_timeout)
        .header(ACCEPT, "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    if let Some(bytes) = body {
        builder = builder
            .header(CONTENT_TYPE, "application/json")
            .body(bytes.to_vec());
    }
    let response = builder
        .send()
        .map_err(|e| Error::Transport(format!("{} {}: {}", method, url, e)))?;
    let status = response.status().as_u16();
    let headers = header_pairs(response.headers());
    let body = response
        .bytes()
        .map_err(|e| Error::Transport(format!("read response from {}: {}", url, e)))?
        .to_vec();
    Ok(Response {
        status,
        headers,
        body,
    })
}
