//! External lobby HTTP client (component 4.11): registers, updates, and
//! unregisters this server with the public server list over HTTPS, retrying
//! failed calls with exponential backoff.
//!
//! Built directly on `tokio-rustls` rather than a hyper client: the corpus only
//! shows hyper used server-side (the health endpoint), so a minimal hand-rolled
//! HTTP/1.1 POST keeps this client on crates the teacher already carries.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

const BACKOFF_START: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;

#[derive(Debug, Error)]
pub enum LobbyError {
    #[error("lobby url {0} is not a valid https url")]
    InvalidUrl(String),
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("tls handshake failed: {0}")]
    Tls(#[source] std::io::Error),
    #[error("request failed: {0}")]
    Io(#[source] std::io::Error),
    #[error("lobby responded with status {0}")]
    BadStatus(u16),
}

#[derive(Debug, Clone, Serialize)]
pub struct LobbyRegistration {
    pub name: String,
    pub track: String,
    pub car_models: Vec<String>,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub max_clients: u8,
    pub connected_clients: u8,
    pub password_protected: bool,
}

struct LobbyUrl {
    host: String,
    port: u16,
    path: String,
}

impl LobbyUrl {
    fn parse(url: &str) -> Result<Self, LobbyError> {
        let rest = url.strip_prefix("https://").ok_or_else(|| LobbyError::InvalidUrl(url.to_string()))?;
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        if authority.is_empty() {
            return Err(LobbyError::InvalidUrl(url.to_string()));
        }
        let (host, port) = match authority.split_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().map_err(|_| LobbyError::InvalidUrl(url.to_string()))?),
            None => (authority.to_string(), 443),
        };
        Ok(Self { host, port, path: format!("/{path}") })
    }
}

/// Retrying HTTPS client for the lobby wrapper endpoint. `is_registered` tracks
/// whether the last register call succeeded; `force_reregister` (the spec's
/// `SetIsRegistered(false)`) forces the next call to re-register even if a
/// previous attempt already succeeded — used on Loop-Mode wraparound.
pub struct LobbyClient {
    url: LobbyUrl,
    tls_connector: TlsConnector,
    is_registered: AtomicBool,
    max_consecutive_failures: u32,
    consecutive_failures: Mutex<u32>,
}

impl LobbyClient {
    pub fn new(base_url: &str) -> Result<Self, LobbyError> {
        Self::with_max_failures(base_url, DEFAULT_MAX_CONSECUTIVE_FAILURES)
    }

    pub fn with_max_failures(base_url: &str, max_consecutive_failures: u32) -> Result<Self, LobbyError> {
        let url = LobbyUrl::parse(base_url)?;
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
        Ok(Self {
            url,
            tls_connector: TlsConnector::from(Arc::new(config)),
            is_registered: AtomicBool::new(false),
            max_consecutive_failures,
            consecutive_failures: Mutex::new(0),
        })
    }

    pub fn is_registered(&self) -> bool {
        self.is_registered.load(Ordering::Acquire)
    }

    pub fn force_reregister(&self) {
        self.is_registered.store(false, Ordering::Release);
    }

    async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> Result<(), LobbyError> {
        let json = serde_json::to_vec(body).expect("lobby payloads serialize infallibly");
        let target = format!("{}{}", self.url.path.trim_end_matches('/'), path);

        let tcp = TcpStream::connect((self.url.host.as_str(), self.url.port)).await.map_err(LobbyError::Connect)?;
        let server_name = ServerName::try_from(self.url.host.clone())
            .map_err(|err| LobbyError::Tls(std::io::Error::new(std::io::ErrorKind::InvalidInput, err)))?;
        let mut tls = self.tls_connector.connect(server_name, tcp).await.map_err(LobbyError::Tls)?;

        let request = format!(
            "POST {target} HTTP/1.1\r\nHost: {host}\r\nContent-Type: application/json\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n",
            host = self.url.host,
            len = json.len(),
        );
        tls.write_all(request.as_bytes()).await.map_err(LobbyError::Io)?;
        tls.write_all(&json).await.map_err(LobbyError::Io)?;

        let mut response = Vec::new();
        tls.read_to_end(&mut response).await.map_err(LobbyError::Io)?;
        let status_line = response
            .split(|&b| b == b'\n')
            .next()
            .map(|line| String::from_utf8_lossy(line).to_string())
            .unwrap_or_default();
        let status: u16 = status_line.split_whitespace().nth(1).and_then(|s| s.parse().ok()).unwrap_or(0);
        if !(200..300).contains(&status) {
            return Err(LobbyError::BadStatus(status));
        }
        Ok(())
    }

    /// Runs one logical call with exponential backoff: 5s start, doubling, capped
    /// at 5 minutes, giving up after `max_consecutive_failures` in a row. Giving up
    /// logs and returns; the caller's own periodic schedule drives the next try.
    async fn with_backoff<F, Fut>(&self, label: &'static str, attempt: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<(), LobbyError>>,
    {
        let mut delay = BACKOFF_START;
        loop {
            match attempt().await {
                Ok(()) => {
                    *self.consecutive_failures.lock().await = 0;
                    return;
                }
                Err(err) => {
                    let mut failures = self.consecutive_failures.lock().await;
                    *failures += 1;
                    warn!(call = label, attempt = *failures, error = %err, "lobby call failed");
                    if *failures >= self.max_consecutive_failures {
                        warn!(call = label, "giving up on lobby call after repeated failures");
                        return;
                    }
                    drop(failures);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    pub async fn register(&self, registration: &LobbyRegistration) {
        self.with_backoff("register", || self.post_json("/register", registration)).await;
        self.is_registered.store(true, Ordering::Release);
        info!("registered with lobby");
    }

    pub async fn update(&self, registration: &LobbyRegistration) {
        if !self.is_registered() {
            self.register(registration).await;
            return;
        }
        self.with_backoff("update", || self.post_json("/update", registration)).await;
    }

    pub async fn unregister(&self) {
        if !self.is_registered() {
            return;
        }
        #[derive(Serialize)]
        struct Empty {}
        self.with_backoff("unregister", || self.post_json("/unregister", &Empty {})).await;
        self.is_registered.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_https_url() {
        assert!(LobbyUrl::parse("http://lobby.example.invalid").is_err());
    }

    #[test]
    fn parses_host_port_and_path() {
        let url = LobbyUrl::parse("https://lobby.example.invalid:8443/wrapper").unwrap();
        assert_eq!(url.host, "lobby.example.invalid");
        assert_eq!(url.port, 8443);
        assert_eq!(url.path, "/wrapper");
    }

    #[test]
    fn defaults_to_port_443() {
        let url = LobbyUrl::parse("https://lobby.example.invalid/wrapper").unwrap();
        assert_eq!(url.port, 443);
    }

    #[test]
    fn starts_unregistered() {
        let client = LobbyClient::new("https://lobby.example.invalid/wrapper").unwrap();
        assert!(!client.is_registered());
    }

    #[test]
    fn force_reregister_clears_the_flag() {
        let client = LobbyClient::new("https://lobby.example.invalid/wrapper").unwrap();
        client.is_registered.store(true, Ordering::Release);
        client.force_reregister();
        assert!(!client.is_registered());
    }
}
