use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

use crate::config::ScannerConfig;
use crate::types::ProbeTarget;

/// Default ports where a silent service gets a plain HTTP request.
pub const HTTP_PORTS: &[u16] = &[80, 8000, 8008, 8080, 8081, 8888];
/// Default ports where a TLS handshake precedes the HTTP request.
pub const TLS_PORTS: &[u16] = &[443, 8443];

/// Result of a single probe. Refused, timed out and unreachable targets are all
/// reported as `success == false`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProbeOutcome {
    pub success: bool,
    pub banner: Option<Vec<u8>>,
}

impl ProbeOutcome {
    pub fn closed() -> Self {
        Self::default()
    }

    pub fn open(banner: Option<Vec<u8>>) -> Self {
        Self { success: true, banner }
    }
}

/// Performs the connect and banner read for one target.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: ProbeTarget, timeout: Duration) -> ProbeOutcome;
}

/// TCP connect prober with a short passive banner grab.
#[derive(Debug, Clone)]
pub struct TcpProber {
    banner_timeout: Duration,
    banner_max_bytes: usize,
    http_ports: Vec<u16>,
    tls_ports: Vec<u16>,
}

impl TcpProber {
    pub fn new(cfg: &ScannerConfig) -> Self {
        Self {
            banner_timeout: cfg.banner_timeout,
            banner_max_bytes: cfg.banner_max_bytes.max(1),
            http_ports: cfg.http_ports.clone(),
            tls_ports: cfg.tls_ports.clone(),
        }
    }

    async fn plain_banner(&self, stream: &mut TcpStream, target: ProbeTarget) -> Option<Vec<u8>> {
        if let Some(b) = read_banner(stream, self.banner_max_bytes, self.banner_timeout).await {
            return Some(b);
        }
        if self.http_ports.contains(&target.port) {
            return http_head(stream, target, self.banner_max_bytes, self.banner_timeout).await;
        }
        None
    }

    async fn tls_banner(&self, stream: TcpStream, target: ProbeTarget) -> Option<Vec<u8>> {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .ok()?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let domain = target.ip.to_string();
        let mut tls = match time::timeout(self.banner_timeout * 2, connector.connect(&domain, stream)).await {
            Ok(Ok(s)) => s,
            _ => return None,
        };

        let subject = tls
            .get_ref()
            .peer_certificate()
            .ok()
            .flatten()
            .and_then(|c| c.to_der().ok())
            .and_then(|der| certificate_subject(&der));

        let mut out = Vec::new();
        if let Some(subject) = subject {
            out.extend_from_slice(format!("TLS subject: {subject}\r\n").as_bytes());
        }
        if let Some(head) = http_head(&mut tls, target, self.banner_max_bytes, self.banner_timeout).await {
            out.extend_from_slice(&head);
        }
        out.truncate(self.banner_max_bytes);
        (!out.is_empty()).then_some(out)
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, target: ProbeTarget, timeout: Duration) -> ProbeOutcome {
        let addr = SocketAddr::new(IpAddr::V4(target.ip), target.port);
        let mut stream = match time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                debug!(%target, error = %e, "connect failed");
                return ProbeOutcome::closed();
            }
            Err(_) => return ProbeOutcome::closed(),
        };

        let banner = if self.tls_ports.contains(&target.port) {
            self.tls_banner(stream, target).await
        } else {
            self.plain_banner(&mut stream, target).await
        };
        ProbeOutcome::open(banner)
    }
}

/// Read whatever the service sends first, up to `max` bytes, within `wait`.
pub async fn read_banner<S>(stream: &mut S, max: usize, wait: Duration) -> Option<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; max];
    match time::timeout(wait, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            let trimmed = trim_ascii(&buf);
            (!trimmed.is_empty()).then(|| trimmed.to_vec())
        }
        _ => None,
    }
}

async fn http_head<S>(stream: &mut S, target: ProbeTarget, max: usize, wait: Duration) -> Option<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("GET / HTTP/1.0\r\nHost: {}\r\n\r\n", target.ip);
    match time::timeout(wait, stream.write_all(request.as_bytes())).await {
        Ok(Ok(())) => read_banner(stream, max, wait).await,
        _ => None,
    }
}

fn certificate_subject(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    Some(cert.subject().to_string())
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}
