//! Tunnel transport: TCP, optional HTTP CONNECT proxy, TLS, and the
//! SSTP duplex-post upgrade.
//!
//! After `establish` returns, the engine owns a byte stream carrying
//! SSTP packets in both directions plus the server leaf certificate for
//! crypto binding. Writes go through [`TunnelSink`], which serialises
//! whole packets under a mutex so TLS records never interleave.

pub mod verifier;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::{Config, TlsVersion};
use crate::device::{Channel, Reporter, TrustStore};
use crate::error::{Error, Result};
use crate::message::{PhaseFailure, Where};
use verifier::{AcceptAnyVerifier, HostPinnedVerifier, LeafCapture};

/// The fixed SSTP resource path.
pub const SSTP_URI: &str = "/sra_{BA195980-CD49-458b-9E23-C84EE0ADCD75}/";

/// Content-Length advertised on the duplex post (u64::MAX, per protocol).
const DUPLEX_CONTENT_LENGTH: &str = "18446744073709551615";

/// Cap on an HTTP response head before we call it garbage.
const MAX_HTTP_HEAD: usize = 16 * 1024;

/// Byte stream the tunnel runs over.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

/// An established transport, ready for SSTP call setup.
pub struct Established {
    /// The TLS byte stream, upgrade complete.
    pub stream: Box<dyn TunnelStream>,
    /// Server leaf certificate in DER form.
    pub leaf_der: Vec<u8>,
}

/// Write half of the tunnel, shared by every sending task.
///
/// One `send` call writes one complete SSTP packet; the internal mutex
/// is held across the whole write so packets never interleave. After
/// `close`, sends fail; nothing reaches the wire once the engine has
/// entered a terminal state.
#[derive(Clone)]
pub struct TunnelSink {
    writer: Arc<tokio::sync::Mutex<WriteHalf<Box<dyn TunnelStream>>>>,
    closed: Arc<AtomicBool>,
}

impl TunnelSink {
    /// Wrap a write half.
    pub fn new(writer: WriteHalf<Box<dyn TunnelStream>>) -> Self {
        Self {
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Send one complete SSTP packet.
    pub async fn send(&self, packet: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Io("transport closed".into()));
        }
        let mut writer = self.writer.lock().await;
        // Re-check under the lock so close() is a hard barrier.
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Io("transport closed".into()));
        }
        writer.write_all(packet).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Refuse all further sends and shut the stream down.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        let _ = writer.shutdown().await;
    }
}

/// Read half of the tunnel, owned by the demultiplexer.
pub type TunnelSource = ReadHalf<Box<dyn TunnelStream>>;

/// Open TCP (directly or through the proxy), run TLS, then upgrade with
/// the SSTP duplex post.
pub async fn establish(
    config: &Config,
    correlation_id: &str,
    trust_store: &dyn TrustStore,
    reporter: &dyn Reporter,
) -> std::result::Result<Established, PhaseFailure> {
    let mut tcp = open_tcp(config)
        .await
        .map_err(|e| PhaseFailure::new(Where::Tls, e))?;
    if let Some(proxy) = &config.proxy {
        debug!(host = %proxy.host, port = proxy.port, "Connecting through HTTP proxy");
        proxy_connect(&mut tcp, config)
            .await
            .map_err(|e| PhaseFailure::new(Where::Proxy, e))?;
    }

    let capture = LeafCapture::new();
    let tls_config = build_tls_config(config, trust_store, capture.clone())
        .map_err(|e| PhaseFailure::new(Where::Cert, e))?;

    let server_name = ServerName::try_from(config.sni_target().to_string())
        .map_err(|_| PhaseFailure::new(Where::Tls, Error::parse("invalid server name")))?;

    let connector = TlsConnector::from(Arc::new(tls_config));
    let mut stream = match connector.connect(server_name, tcp).await {
        Ok(stream) => stream,
        Err(e) => {
            // Surface the untrusted leaf so the user can choose to save it.
            if let Some(leaf) = capture.take() {
                reporter.notify(Channel::Certificate, &pem_encode(&leaf), 0);
            }
            return Err(PhaseFailure::new(
                Where::Tls,
                Error::VerificationFailed(e.to_string()),
            ));
        }
    };

    let leaf_der = capture
        .take()
        .ok_or_else(|| PhaseFailure::new(Where::Tls, Error::parse("no server certificate")))?;

    info!(host = %config.hostname, "TLS established");

    duplex_post(&mut stream, &config.hostname, correlation_id)
        .await
        .map_err(|e| PhaseFailure::new(Where::Tls, e))?;

    debug!("SSTP duplex post accepted");

    Ok(Established {
        stream: Box::new(stream),
        leaf_der,
    })
}

/// Open the TCP connection to the server or proxy and tune keepalive.
async fn open_tcp(config: &Config) -> Result<TcpStream> {
    let addr = match &config.proxy {
        Some(proxy) => format!("{}:{}", proxy.host, proxy.port),
        None => config.server_address(),
    };

    debug!(%addr, "Opening TCP connection");
    let stream = TcpStream::connect(&addr).await?;
    stream.set_nodelay(true)?;

    // Keepalive keeps NAT mappings warm on idle tunnels.
    let sock_ref = SockRef::from(&stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        debug!("Failed to set TCP keepalive: {} (continuing anyway)", e);
    }

    Ok(stream)
}

/// Issue the literal CONNECT request and check the proxy's answer.
///
/// `200` proceeds, `403` is an authentication failure, anything else is
/// an unexpected message. No TLS has happened yet at this point.
pub async fn proxy_connect<S>(stream: &mut S, config: &Config) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let proxy = config
        .proxy
        .as_ref()
        .expect("proxy_connect requires proxy configuration");

    let target = config.server_address();
    let mut request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nSSTPVERSION: 1.0\r\n"
    );
    if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
        let credentials = BASE64_STANDARD.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    let head = read_http_head(stream).await?;

    match http_status(&head)? {
        200 => Ok(()),
        403 => {
            warn!("Proxy refused credentials");
            Err(Error::AuthenticationFailed)
        }
        other => Err(Error::unexpected(format!("proxy answered {other}"))),
    }
}

/// Send the SSTP_DUPLEX_POST upgrade and check for 200.
pub async fn duplex_post<S>(stream: &mut S, hostname: &str, correlation_id: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "SSTP_DUPLEX_POST {SSTP_URI} HTTP/1.1\r\n\
         Content-Length: {DUPLEX_CONTENT_LENGTH}\r\n\
         Host: {hostname}\r\n\
         SSTPCORRELATIONID: {{{correlation_id}}}\r\n\
         \r\n"
    );

    stream.write_all(request.as_bytes()).await?;
    let head = read_http_head(stream).await?;

    match http_status(&head)? {
        200 => Ok(()),
        other => Err(Error::unexpected(format!("duplex post answered {other}"))),
    }
}

/// Read bytes until the `\r\n\r\n` header terminator.
async fn read_http_head<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HTTP_HEAD {
            return Err(Error::unexpected("oversized HTTP response head"));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::unexpected("connection closed during HTTP exchange"));
        }
        head.push(byte[0]);
    }

    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Status code on the first response line.
fn http_status(head: &str) -> Result<u16> {
    let first_line = head.lines().next().unwrap_or_default();
    first_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::unexpected(format!("bad HTTP status line: {first_line:?}")))
}

/// Build the rustls client configuration per the TLS options.
fn build_tls_config(
    config: &Config,
    trust_store: &dyn TrustStore,
    capture: LeafCapture,
) -> Result<ClientConfig> {
    let mut provider = tokio_rustls::rustls::crypto::ring::default_provider();

    if config.tls.select_suites {
        let wanted: Vec<String> = config
            .tls
            .suites
            .iter()
            .map(|s| s.to_uppercase())
            .collect();
        provider
            .cipher_suites
            .retain(|suite| wanted.contains(&format!("{:?}", suite.suite()).to_uppercase()));
        if provider.cipher_suites.is_empty() {
            return Err(Error::parse("no configured ciphersuite is supported"));
        }
    }

    let versions: &[&'static SupportedProtocolVersion] = match config.tls.version {
        TlsVersion::Default => tokio_rustls::rustls::ALL_VERSIONS,
        TlsVersion::Tls12 => &[&tokio_rustls::rustls::version::TLS12],
        TlsVersion::Tls13 => &[&tokio_rustls::rustls::version::TLS13],
    };

    let provider = Arc::new(provider);
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(versions)
        .map_err(|e| Error::parse(format!("TLS version selection: {e}")))?;

    // Trust: custom PEM roots, system-default behavior via webpki roots,
    // or accept-any when host verification is off without custom trust.
    let tls_config = if config.tls.specify_trust {
        let roots = load_trust_roots(trust_store)?;
        let inner = tokio_rustls::rustls::client::WebPkiServerVerifier::builder_with_provider(
            Arc::new(roots),
            provider,
        )
        .build()
        .map_err(|e| Error::parse(format!("trust store: {e}")))?;

        let expected = ServerName::try_from(config.hostname.clone())
            .map_err(|_| Error::parse("invalid hostname for verification"))?;

        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(HostPinnedVerifier::new(
                inner,
                expected,
                config.tls.verify_host,
                capture,
            )))
            .with_no_client_auth()
    } else if config.tls.verify_host {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let inner = tokio_rustls::rustls::client::WebPkiServerVerifier::builder_with_provider(
            Arc::new(roots),
            provider,
        )
        .build()
        .map_err(|e| Error::parse(format!("system trust: {e}")))?;

        let expected = ServerName::try_from(config.hostname.clone())
            .map_err(|_| Error::parse("invalid hostname for verification"))?;

        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(HostPinnedVerifier::new(
                inner, expected, true, capture,
            )))
            .with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyVerifier::new(capture)))
            .with_no_client_auth()
    };

    Ok(tls_config)
}

/// Parse every PEM file from the trust store into a root store.
fn load_trust_roots(trust_store: &dyn TrustStore) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();

    let files = trust_store
        .list_ca_certs()
        .map_err(|e| Error::parse(format!("trust store unavailable: {e}")))?;

    for (name, pem) in files {
        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert =
                cert.map_err(|e| Error::parse(format!("CA file {name}: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| Error::parse(format!("CA file {name}: {e}")))?;
            added += 1;
        }
        if added == 0 {
            return Err(Error::parse(format!("CA file {name}: no certificate found")));
        }
        debug!(file = %name, certs = added, "Loaded trust anchors");
    }

    Ok(roots)
}

/// PEM-encode a DER certificate for the certificate channel.
fn pem_encode(der: &[u8]) -> String {
    let encoded = BASE64_STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).unwrap());
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PppConfig, ProxyConfig};

    fn proxy_config() -> Config {
        Config {
            hostname: "vpn.example.com".into(),
            port: 443,
            username: "u".into(),
            password: "p".into(),
            proxy: Some(ProxyConfig {
                host: "proxy.example.com".into(),
                port: 8080,
                username: Some("pu".into()),
                password: Some("pp".into()),
            }),
            tls: Default::default(),
            ppp: PppConfig::default(),
            dns: Default::default(),
            routes: Default::default(),
            reconnect: Default::default(),
        }
    }

    #[tokio::test]
    async fn proxy_connect_sends_literal_request() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let config = proxy_config();

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            request
        });

        proxy_connect(&mut client, &config).await.unwrap();
        let request = server_task.await.unwrap();

        assert!(request.starts_with("CONNECT vpn.example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Host: vpn.example.com:443\r\n"));
        assert!(request.contains("SSTPVERSION: 1.0\r\n"));
        let credentials = BASE64_STANDARD.encode("pu:pp");
        assert!(request.contains(&format!("Proxy-Authorization: Basic {credentials}\r\n")));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn proxy_403_is_authentication_failure() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let config = proxy_config();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                .await
                .unwrap();
        });

        let err = proxy_connect(&mut client, &config).await.unwrap_err();
        assert_eq!(err, Error::AuthenticationFailed);
    }

    #[tokio::test]
    async fn proxy_other_status_is_unexpected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let config = proxy_config();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                .await
                .unwrap();
        });

        let err = proxy_connect(&mut client, &config).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedMessage(_)));
    }

    #[tokio::test]
    async fn duplex_post_sends_upgrade_block() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            server.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            request
        });

        duplex_post(&mut client, "vpn.example.com", "ABCD-1234")
            .await
            .unwrap();
        let request = server_task.await.unwrap();

        assert!(request.starts_with(
            "SSTP_DUPLEX_POST /sra_{BA195980-CD49-458b-9E23-C84EE0ADCD75}/ HTTP/1.1\r\n"
        ));
        assert!(request.contains("Content-Length: 18446744073709551615\r\n"));
        assert!(request.contains("Host: vpn.example.com\r\n"));
        assert!(request.contains("SSTPCORRELATIONID: {ABCD-1234}\r\n"));
    }

    #[tokio::test]
    async fn sink_refuses_sends_after_close() {
        let (client, mut server) = tokio::io::duplex(4096);
        let boxed: Box<dyn TunnelStream> = Box::new(client);
        let (_read, write) = tokio::io::split(boxed);
        let sink = TunnelSink::new(write);

        sink.send(&[0x10, 0x01, 0x00, 0x08, 0x00, 0x08, 0x00, 0x00])
            .await
            .unwrap();
        sink.close().await;
        assert!(sink.send(&[0x00]).await.is_err());

        // Only the pre-close packet reached the wire.
        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(n, 8);
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[test]
    fn pem_encoding_wraps_lines() {
        let pem = pem_encode(&[0xAB; 100]);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
        assert!(pem.lines().all(|l| l.len() <= 64));
    }
}
