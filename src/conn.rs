#[cfg(feature = "tls")]
use std::net::IpAddr;
use std::pin::Pin;
#[cfg(feature = "tls")]
use std::str::FromStr;
use std::sync::Arc;
#[cfg(feature = "tls")]
use std::sync::LazyLock;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::controls::ControlRegistry;
use crate::disconnect::{DisconnectHandler, SharedDisconnectHandler};
use crate::notification::{SharedNotificationHandler, UnsolicitedNotificationHandler};
use crate::referral::ReferralConnector;
use crate::result::{LdapError, Result};

use async_trait::async_trait;
#[cfg(feature = "tls")]
use rustls::{ClientConfig, RootCertStore, pki_types::CertificateDer, pki_types::ServerName};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time;
#[cfg(feature = "tls")]
use tokio_rustls::{TlsConnector as TokioTlsConnector, client::TlsStream};
use url::Url;

#[derive(Debug)]
pub(crate) enum ConnType {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

#[cfg(feature = "tls")]
#[derive(Debug)]
struct NoCertVerification;

#[cfg(feature = "tls")]
impl rustls::client::danger::ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _: &CertificateDer,
        _: &[CertificateDer],
        _: &ServerName,
        _: &[u8],
        _: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer,
        _: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer,
        _: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(feature = "tls")]
static CACERTS: LazyLock<RootCertStore> = LazyLock::new(|| {
    let mut store = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for e in &loaded.errors {
        warn!("error loading a native certificate: {}", e);
    }
    let (added, ignored) = store.add_parsable_certificates(loaded.certs);
    debug!("native root store: {} certificates, {} ignored", added, ignored);
    store
});

impl AsyncRead for ConnType {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            ConnType::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnType {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            ConnType::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_flush(cx),
            #[cfg(feature = "tls")]
            ConnType::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            ConnType::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Source of raw TCP streams for new connections.
///
/// A custom factory can be used to route connections through a proxy, bind to a
/// particular local address, or hand out pre-connected sockets in tests. When a
/// custom factory is set, the socket options in `LdapConnSettings` aren't applied;
/// it's up to the factory to configure its sockets.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Open a stream to `host`:`port`.
    async fn create_socket(&self, host: &str, port: u16) -> io::Result<TcpStream>;
}

/// Default socket factory, which connects directly and applies socket options.
#[derive(Clone, Debug)]
pub struct TcpSocketFactory {
    nodelay: bool,
    keepalive: Option<Duration>,
    linger: Option<Duration>,
    recv_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
}

impl TcpSocketFactory {
    /// Create a factory using the socket options from `settings`.
    pub fn from_settings(settings: &LdapConnSettings) -> Self {
        TcpSocketFactory {
            nodelay: settings.tcp_nodelay,
            keepalive: settings.keepalive,
            linger: settings.linger,
            recv_buffer_size: settings.recv_buffer_size,
            send_buffer_size: settings.send_buffer_size,
        }
    }

    fn configure(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        let sock = SockRef::from(stream);
        if let Some(time) = self.keepalive {
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(time))?;
        }
        if let Some(linger) = self.linger {
            sock.set_linger(Some(linger))?;
        }
        if let Some(size) = self.recv_buffer_size {
            sock.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            sock.set_send_buffer_size(size)?;
        }
        Ok(())
    }
}

#[async_trait]
impl SocketFactory for TcpSocketFactory {
    async fn create_socket(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((host, port)).await?;
        self.configure(&stream)?;
        Ok(stream)
    }
}

/// Additional settings for an LDAP connection.
///
/// The structure is opaque for better extensibility. An instance with
/// default values is constructed by [`new()`](#method.new), and all
/// available settings can be replaced through a builder-like interface,
/// by calling the appropriate functions.
#[derive(Clone)]
pub struct LdapConnSettings {
    pub(crate) conn_timeout: Option<Duration>,
    pub(crate) response_timeout: Option<Duration>,
    pub(crate) auto_reconnect: bool,
    pub(crate) synchronous_mode: bool,
    pub(crate) abandon_on_timeout: bool,
    pub(crate) follow_referrals: bool,
    pub(crate) referral_hop_limit: usize,
    pub(crate) tcp_nodelay: bool,
    pub(crate) keepalive: Option<Duration>,
    pub(crate) linger: Option<Duration>,
    pub(crate) recv_buffer_size: Option<usize>,
    pub(crate) send_buffer_size: Option<usize>,
    #[cfg(feature = "tls")]
    pub(crate) config: Option<Arc<ClientConfig>>,
    #[cfg(feature = "tls")]
    pub(crate) starttls: bool,
    #[cfg(feature = "tls")]
    pub(crate) no_tls_verify: bool,
    pub(crate) socket_factory: Option<Arc<dyn SocketFactory>>,
    pub(crate) referral_connector: Option<Arc<dyn ReferralConnector>>,
    pub(crate) disconnect_handler: Option<SharedDisconnectHandler>,
    pub(crate) unsolicited_handler: Option<SharedNotificationHandler>,
    pub(crate) control_registry: Option<Arc<ControlRegistry>>,
}

impl Default for LdapConnSettings {
    fn default() -> Self {
        LdapConnSettings {
            conn_timeout: None,
            response_timeout: None,
            auto_reconnect: false,
            synchronous_mode: false,
            abandon_on_timeout: false,
            follow_referrals: false,
            referral_hop_limit: 5,
            tcp_nodelay: true,
            keepalive: None,
            linger: None,
            recv_buffer_size: None,
            send_buffer_size: None,
            #[cfg(feature = "tls")]
            config: None,
            #[cfg(feature = "tls")]
            starttls: false,
            #[cfg(feature = "tls")]
            no_tls_verify: false,
            socket_factory: None,
            referral_connector: None,
            disconnect_handler: None,
            unsolicited_handler: None,
            control_registry: None,
        }
    }
}

impl LdapConnSettings {
    /// Create an instance of the structure with default settings.
    pub fn new() -> LdapConnSettings {
        LdapConnSettings {
            ..Default::default()
        }
    }

    /// Set the connection timeout. If a connetion to the server can't
    /// be established before the timeout expires, an error will be
    /// returned to the user. Defaults to `None`, meaning an infinite
    /// timeout.
    pub fn set_conn_timeout(mut self, timeout: Duration) -> Self {
        self.conn_timeout = Some(timeout);
        self
    }

    /// Set the default response timeout for every operation on the connection.
    /// A per-operation timeout set with [`Ldap::with_timeout()`](struct.Ldap.html#method.with_timeout)
    /// takes precedence. Defaults to `None`, meaning an infinite timeout.
    pub fn set_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    /// If `true`, an operation which fails because the connection is broken will
    /// reconnect, re-bind with the last successful bind request, and retry the
    /// operation once. Defaults to `false`.
    pub fn set_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// If `true`, the connection has no background reader: the caller of each
    /// operation writes the request and reads the responses itself, and operations
    /// on the connection are serialized. Asynchronous request handles aren't available
    /// in this mode. Defaults to `false`.
    pub fn set_synchronous_mode(mut self, synchronous_mode: bool) -> Self {
        self.synchronous_mode = synchronous_mode;
        self
    }

    /// If `true`, an operation which times out is abandoned on the server.
    /// Defaults to `false`.
    pub fn set_abandon_on_timeout(mut self, abandon_on_timeout: bool) -> Self {
        self.abandon_on_timeout = abandon_on_timeout;
        self
    }

    /// If `true`, referral results are followed by opening a temporary connection
    /// to the referred server and repeating the operation there. Defaults to `false`.
    pub fn set_follow_referrals(mut self, follow_referrals: bool) -> Self {
        self.follow_referrals = follow_referrals;
        self
    }

    /// Set the maximum length of a followed referral chain. Defaults to 5.
    pub fn set_referral_hop_limit(mut self, limit: usize) -> Self {
        self.referral_hop_limit = limit;
        self
    }

    /// Set the `TCP_NODELAY` socket option. Defaults to `true`.
    pub fn set_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    /// Enable TCP keepalive, with `time` of idleness before the first probe.
    /// Defaults to `None`, which leaves the system setting in place.
    pub fn set_keepalive(mut self, time: Duration) -> Self {
        self.keepalive = Some(time);
        self
    }

    /// Set the `SO_LINGER` socket option. Defaults to `None`.
    pub fn set_linger(mut self, linger: Duration) -> Self {
        self.linger = Some(linger);
        self
    }

    /// Set the socket receive buffer size. Defaults to `None`, meaning the system default.
    pub fn set_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    /// Set the socket send buffer size. Defaults to `None`, meaning the system default.
    pub fn set_send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    #[cfg(feature = "tls")]
    /// Set a custom TLS configuration, which enables setting various options
    /// when establishing a secure connection. The default of `None` will
    /// use a configuration with default values.
    ///
    /// The default configuration will try to load the system certificate store
    /// and use it for verification.
    pub fn set_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.config = Some(config);
        self
    }

    #[cfg(feature = "tls")]
    /// If `true`, use the StartTLS extended operation to establish a
    /// secure connection. Defaults to `false`.
    pub fn set_starttls(mut self, starttls: bool) -> Self {
        self.starttls = starttls;
        self
    }

    #[cfg(feature = "tls")]
    /// The `starttls` settings indicates whether the StartTLS extended
    /// operation will be used to establish a secure connection.
    pub fn starttls(&self) -> bool {
        self.starttls
    }

    #[cfg(not(feature = "tls"))]
    /// Always `false` when no TLS support is compiled in.
    pub fn starttls(&self) -> bool {
        false
    }

    #[cfg(feature = "tls")]
    /// If `true`, try to establish a TLS connection without certificate
    /// verification. Defaults to `false`.
    pub fn set_no_tls_verify(mut self, no_tls_verify: bool) -> Self {
        self.no_tls_verify = no_tls_verify;
        self
    }

    /// Use a custom source of TCP streams. Defaults to [`TcpSocketFactory`](struct.TcpSocketFactory.html)
    /// configured from these settings.
    pub fn set_socket_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.socket_factory = Some(factory);
        self
    }

    /// Use a custom way of opening connections for following referrals. Defaults to
    /// connecting to the referred server with these same settings.
    pub fn set_referral_connector(mut self, connector: Arc<dyn ReferralConnector>) -> Self {
        self.referral_connector = Some(connector);
        self
    }

    /// Set the hook which is called when the connection is torn down for an unexpected
    /// reason. Defaults to `None`.
    pub fn set_disconnect_handler<H>(mut self, handler: H) -> Self
    where
        H: DisconnectHandler + 'static,
    {
        self.disconnect_handler = Some(Arc::new(handler));
        self
    }

    /// Set the hook which receives unsolicited notifications. Defaults to `None`,
    /// in which case notifications are logged and dropped.
    pub fn set_unsolicited_handler<H>(mut self, handler: H) -> Self
    where
        H: UnsolicitedNotificationHandler + 'static,
    {
        self.unsolicited_handler = Some(Arc::new(handler));
        self
    }

    /// Set the registry used to recognize response controls. Defaults to
    /// [`ControlRegistry::with_defaults()`](controls/struct.ControlRegistry.html#method.with_defaults).
    pub fn set_control_registry(mut self, registry: ControlRegistry) -> Self {
        self.control_registry = Some(Arc::new(registry));
        self
    }

    pub(crate) fn registry(&self) -> Arc<ControlRegistry> {
        self.control_registry
            .clone()
            .unwrap_or_else(|| Arc::new(ControlRegistry::with_defaults()))
    }
}

/// Where a connection goes, derived from its LDAP URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ServerAddr {
    pub(crate) url: String,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) ldaps: bool,
}

impl ServerAddr {
    pub(crate) fn from_url(url: &Url) -> Result<ServerAddr> {
        let (ldaps, default_port) = match url.scheme() {
            "ldap" => (false, 389),
            #[cfg(feature = "tls")]
            "ldaps" => (true, 636),
            s => return Err(LdapError::UnknownScheme(String::from(s))),
        };
        let host = match url.host_str() {
            Some("") | None => String::from("localhost"),
            Some(h) => String::from(h.trim_start_matches('[').trim_end_matches(']')),
        };
        Ok(ServerAddr {
            url: format!(
                "{}://{}:{}",
                url.scheme(),
                url.host_str().filter(|h| !h.is_empty()).unwrap_or("localhost"),
                url.port().unwrap_or(default_port)
            ),
            host,
            port: url.port().unwrap_or(default_port),
            ldaps,
        })
    }
}

/// Open the transport for a new connection: TCP, wrapped in TLS for __ldaps__.
///
/// The connect timeout covers both the TCP connect and the TLS handshake.
pub(crate) async fn open_transport(
    addr: &ServerAddr,
    settings: &LdapConnSettings,
) -> Result<ConnType> {
    let opening = async {
        let stream = match settings.socket_factory {
            Some(ref factory) => factory.create_socket(&addr.host, addr.port).await,
            None => {
                TcpSocketFactory::from_settings(settings)
                    .create_socket(&addr.host, addr.port)
                    .await
            }
        }
        .map_err(|source| LdapError::Connect {
            host: addr.host.clone(),
            port: addr.port,
            source,
        })?;
        if addr.ldaps {
            #[cfg(feature = "tls")]
            {
                let tls = create_tls_stream(settings, &addr.host, stream).await?;
                return Ok(ConnType::Tls(Box::new(tls)));
            }
        }
        Ok::<_, LdapError>(ConnType::Tcp(stream))
    };
    match settings.conn_timeout {
        Some(timeout) => time::timeout(timeout, opening)
            .await
            .map_err(|_| LdapError::ConnectTimeout {
                host: addr.host.clone(),
                port: addr.port,
            })?,
        None => opening.await,
    }
}

#[cfg(feature = "tls")]
pub(crate) async fn create_tls_stream(
    settings: &LdapConnSettings,
    hostname: &str,
    stream: TcpStream,
) -> Result<TlsStream<TcpStream>> {
    let no_tls_verify = settings.no_tls_verify;
    let config = match settings.config {
        Some(ref config) => config.clone(),
        None => create_config(settings),
    };
    TokioTlsConnector::from(config)
        .connect(
            ServerName::try_from(hostname)
                .map(|sn| sn.to_owned())
                .or_else(|e| {
                    if no_tls_verify && IpAddr::from_str(hostname).is_ok() {
                        ServerName::try_from("_irrelevant")
                    } else {
                        Err(e)
                    }
                })?,
            stream,
        )
        .await
        .map_err(LdapError::from)
}

#[cfg(feature = "tls")]
fn create_config(settings: &LdapConnSettings) -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_root_certificates(CACERTS.clone())
        .with_no_client_auth();
    if settings.no_tls_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertVerification));
    }
    Arc::new(config)
}
