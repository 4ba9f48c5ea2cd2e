//! Remote DNS endpoint source.
//!
//! An endpoint spec is `host[:port][/protocol]` where the protocol is one of
//! `udp`, `tcp`, or `tcp-tls` and the host is an address literal. The port
//! defaults to 53, or 853 for TLS. When no protocol is given the source
//! inherits the protocol the client used.
//!
//! Transport failures arm a 15 second back-off during which the source
//! reports "no answer" without touching the network, so a dead upstream
//! costs one timeout instead of one per query. Every attempt is bounded by
//! a 1 s dial, 2 s per-I/O, and 4 s overall deadline.
//!
//! TLS verifies the upstream certificate against the Mozilla roots unless
//! the spec carries the `!insecure` suffix for self-signed upstreams.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::dnsutil::is_empty_response;
use crate::error::ResolveError;
use crate::resolver::map::ResolverMap;
use crate::resolver::{Protocol, RequestContext, ResolutionContext, Source};

const DEFAULT_PORT: u16 = 53;
const DEFAULT_TLS_PORT: u16 = 853;

const DIAL_TIMEOUT: Duration = Duration::from_secs(1);
const IO_TIMEOUT: Duration = Duration::from_secs(2);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(4);
const BACKOFF_INTERVAL: Duration = Duration::from_secs(15);

const MAX_PACKET_SIZE: usize = 4096;

const INSECURE_SUFFIX: &str = "!insecure";

/// Upstream transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
    TcpTls,
}

impl Transport {
    fn parse(text: &str) -> Option<Self> {
        match text.to_lowercase().as_str() {
            "udp" => Some(Self::Udp),
            "tcp" => Some(Self::Tcp),
            "tcp-tls" => Some(Self::TcpTls),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::TcpTls => "tcp-tls",
        }
    }
}

pub struct RemoteSource {
    remote_address: SocketAddr,
    /// None inherits the protocol of the client request.
    protocol: Option<Transport>,
    tls: Option<TlsConnector>,
    backoff_until: Mutex<Option<Instant>>,
}

impl RemoteSource {
    /// Parse an endpoint spec: `host[:port][/protocol][!insecure]`.
    pub fn parse(spec: &str) -> Result<Self, ResolveError> {
        let endpoint = || ResolveError::Endpoint(spec.to_string());

        let (rest, insecure) = match spec.trim().strip_suffix(INSECURE_SUFFIX) {
            Some(rest) => (rest, true),
            None => (spec.trim(), false),
        };

        let (address_part, protocol) = match rest.split_once('/') {
            Some((address, proto)) => {
                let protocol = Transport::parse(proto).ok_or_else(endpoint)?;
                (address, Some(protocol))
            }
            None => (rest, None),
        };

        let (host, port) = split_host_port(address_part);
        let host: IpAddr = host.parse().map_err(|_| endpoint())?;
        let port = match port {
            Some(text) => text.parse::<u16>().map_err(|_| endpoint())?,
            None if protocol == Some(Transport::TcpTls) => DEFAULT_TLS_PORT,
            None => DEFAULT_PORT,
        };

        let tls = (protocol == Some(Transport::TcpTls)).then(|| tls_connector(insecure));

        Ok(Self {
            remote_address: SocketAddr::new(host, port),
            protocol,
            tls,
            backoff_until: Mutex::new(None),
        })
    }

    fn effective_protocol(&self, rcon: &RequestContext) -> Transport {
        self.protocol.unwrap_or(match rcon.protocol {
            Protocol::Udp => Transport::Udp,
            Protocol::Tcp => Transport::Tcp,
        })
    }

    /// Whether the source is inside its back-off window. Clears the window
    /// once it has passed.
    fn backing_off(&self) -> bool {
        let mut backoff = self.backoff_until.lock();
        match *backoff {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *backoff = None;
                false
            }
            None => false,
        }
    }

    fn arm_backoff(&self) {
        *self.backoff_until.lock() = Some(Instant::now() + BACKOFF_INTERVAL);
    }

    async fn exchange(
        &self,
        protocol: Transport,
        request: &Message,
    ) -> Result<Message, ResolveError> {
        let payload = request.to_bytes().map_err(ResolveError::Encode)?;

        let work = async {
            match protocol {
                Transport::Udp => self.exchange_udp(&payload).await,
                Transport::Tcp => self.exchange_tcp(&payload).await,
                Transport::TcpTls => self.exchange_tls(&payload).await,
            }
        };
        let bytes = timeout(TOTAL_TIMEOUT, work)
            .await
            .map_err(|_| ResolveError::Timeout(TOTAL_TIMEOUT))??;

        Message::from_bytes(&bytes).map_err(ResolveError::Decode)
    }

    async fn exchange_udp(&self, payload: &[u8]) -> Result<Vec<u8>, ResolveError> {
        let bind_address = if self.remote_address.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_address)
            .await
            .map_err(ResolveError::Upstream)?;
        dial(socket.connect(self.remote_address)).await?;

        io_bound(socket.send(payload)).await?;

        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        let received = io_bound(socket.recv(&mut buffer)).await?;
        buffer.truncate(received);
        Ok(buffer)
    }

    async fn exchange_tcp(&self, payload: &[u8]) -> Result<Vec<u8>, ResolveError> {
        let stream = dial(TcpStream::connect(self.remote_address)).await?;
        framed_exchange(stream, payload).await
    }

    async fn exchange_tls(&self, payload: &[u8]) -> Result<Vec<u8>, ResolveError> {
        let connector = self
            .tls
            .as_ref()
            .ok_or_else(|| ResolveError::Endpoint(self.name()))?;
        let server_name = ServerName::from(rustls::pki_types::IpAddr::from(
            self.remote_address.ip(),
        ));

        let stream = dial(TcpStream::connect(self.remote_address)).await?;
        let stream = dial(connector.connect(server_name, stream)).await?;
        framed_exchange(stream, payload).await
    }
}

#[async_trait]
impl Source for RemoteSource {
    fn name(&self) -> String {
        self.remote_address.to_string()
    }

    async fn answer(
        &self,
        rcon: &RequestContext,
        _map: &ResolverMap,
        ctx: &mut ResolutionContext,
        request: &Message,
    ) -> Result<Option<Message>, ResolveError> {
        if self.backing_off() {
            return Ok(None);
        }

        // forwarding is a recursive query; skip clients that did not ask
        // for recursion
        if !request.recursion_desired() {
            return Ok(None);
        }

        let protocol = self.effective_protocol(rcon);
        let response = match self.exchange(protocol, request).await {
            Ok(response) => response,
            Err(err) => {
                self.arm_backoff();
                return Err(err);
            }
        };

        if ctx.source_used.is_empty() && !is_empty_response(Some(&response)) {
            ctx.source_used = format!("{}/{}", self.name(), protocol.as_str());
        }

        Ok(Some(response))
    }
}

async fn dial<F, T, E>(fut: F) -> Result<T, ResolveError>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: Into<std::io::Error>,
{
    timeout(DIAL_TIMEOUT, fut)
        .await
        .map_err(|_| ResolveError::Timeout(DIAL_TIMEOUT))?
        .map_err(|err| ResolveError::Upstream(err.into()))
}

async fn io_bound<F, T>(fut: F) -> Result<T, ResolveError>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    timeout(IO_TIMEOUT, fut)
        .await
        .map_err(|_| ResolveError::Timeout(IO_TIMEOUT))?
        .map_err(ResolveError::Upstream)
}

/// Exchange one length-prefixed DNS message over a stream transport.
async fn framed_exchange<S>(mut stream: S, payload: &[u8]) -> Result<Vec<u8>, ResolveError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let length = u16::try_from(payload.len())
        .map_err(|_| ResolveError::Upstream(std::io::ErrorKind::InvalidInput.into()))?;

    io_bound(async {
        stream.write_all(&length.to_be_bytes()).await?;
        stream.write_all(payload).await?;
        stream.flush().await
    })
    .await?;

    let mut length_buffer = [0u8; 2];
    io_bound(stream.read_exact(&mut length_buffer)).await?;
    let length = usize::from(u16::from_be_bytes(length_buffer));

    let mut buffer = vec![0u8; length];
    io_bound(stream.read_exact(&mut buffer)).await?;
    Ok(buffer)
}

fn split_host_port(address: &str) -> (&str, Option<&str>) {
    // bracketed IPv6 literal: [fd00::1]:853
    if let Some(rest) = address.strip_prefix('[') {
        if let Some((host, port)) = rest.split_once(']') {
            return (host, port.strip_prefix(':'));
        }
    }

    // a single colon separates host and port; more than one means a bare
    // IPv6 literal
    if address.chars().filter(|c| *c == ':').count() == 1 {
        if let Some((host, port)) = address.split_once(':') {
            return (host, Some(port));
        }
    }

    (address, None)
}

fn tls_connector(insecure: bool) -> TlsConnector {
    let config = if insecure {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}

/// Accepts any certificate, for upstreams with self-signed certificates.
/// Only reachable through the `!insecure` spec suffix.
#[derive(Debug)]
struct InsecureServerCertVerifier;

impl ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
