//! ## Broker client SDK
//!
//! Establishes a PSN-bound reliable-connected RDMA transport with a
//! broker: TLS control channel first, parameter exchange over it, then
//! the client's own queue pair is driven to RTS against the values the
//! broker announced.

pub mod danger;
pub mod exchange;

use std::{sync::Arc, time::Duration};

use codec::{ConnectionParams, Psn};
use service::{
    ArmedConnection, ConnectionError, Device, DeviceError, PendingConnection, PsnError,
    TransportError, fresh_psn,
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, lookup_host},
    time::{sleep, timeout},
};
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};

use crate::exchange::ExchangeError;

/// The default broker control-channel port.
pub const DEFAULT_PORT: u16 = 4433;

/// Budget for the TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff between completion queue polls.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

#[derive(Debug)]
pub enum ClientError {
    Resolve(std::io::Error),
    Connect(std::io::Error),
    Handshake(std::io::Error),
    HandshakeTimeout,
    InvalidServerName,
    Device(DeviceError),
    Psn(PsnError),
    Exchange(ExchangeError),
    Connection(ConnectionError),
    Transport(TransportError),
}

impl std::error::Error for ClientError {}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolve(e) => write!(f, "failed to resolve broker address: {}", e),
            Self::Connect(e) => write!(f, "failed to connect to broker: {}", e),
            Self::Handshake(e) => write!(f, "tls handshake failed: {}", e),
            Self::HandshakeTimeout => write!(f, "tls handshake timed out"),
            Self::InvalidServerName => write!(f, "invalid tls server name"),
            Self::Device(e) => write!(f, "{}", e),
            Self::Psn(e) => write!(f, "{}", e),
            Self::Exchange(e) => write!(f, "{}", e),
            Self::Connection(e) => write!(f, "{}", e),
            Self::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl From<DeviceError> for ClientError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

impl From<PsnError> for ClientError {
    fn from(value: PsnError) -> Self {
        Self::Psn(value)
    }
}

impl From<ExchangeError> for ClientError {
    fn from(value: ExchangeError) -> Self {
        Self::Exchange(value)
    }
}

impl From<ConnectionError> for ClientError {
    fn from(value: ConnectionError) -> Self {
        Self::Connection(value)
    }
}

impl From<TransportError> for ClientError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

pub struct BrokerClientBuilder {
    host: String,
    port: u16,
    server_name: String,
    verify_peer: bool,
    device_index: usize,
}

impl BrokerClientBuilder {
    /// A builder targeting `host` with TLS server name `server_name`.
    ///
    /// Peer verification defaults to off, matching development
    /// deployments with self-signed broker certificates; call
    /// [`Self::with_verify_peer`] to harden.
    pub fn new(host: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            server_name: server_name.into(),
            port: DEFAULT_PORT,
            verify_peer: false,
            device_index: 0,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_verify_peer(mut self, verify_peer: bool) -> Self {
        self.verify_peer = verify_peer;
        self
    }

    pub fn with_device_index(mut self, device_index: usize) -> Self {
        self.device_index = device_index;
        self
    }

    /// Open a device handle and connect. Processes holding several
    /// connections should open the device once and use
    /// [`Self::connect_with_device`].
    pub async fn connect(self) -> Result<BrokerClient, ClientError> {
        let device = Arc::new(Device::open(self.device_index)?);
        self.connect_with_device(device).await
    }

    pub async fn connect_with_device(
        self,
        device: Arc<Device>,
    ) -> Result<BrokerClient, ClientError> {
        let mut addrs = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(ClientError::Resolve)?;
        let address = addrs
            .next()
            .ok_or_else(|| ClientError::Resolve(std::io::ErrorKind::NotFound.into()))?;

        let socket = TcpStream::connect(address)
            .await
            .map_err(ClientError::Connect)?;

        if let Err(e) = socket.set_nodelay(true) {
            log::error!("socket set nodelay failed!: addr={address}, err={e}");
        }

        let config = if self.verify_peer {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
                .with_no_client_auth()
        };

        let name = ServerName::try_from(self.server_name.clone())
            .map_err(|_| ClientError::InvalidServerName)?;

        let connector = TlsConnector::from(Arc::new(config));
        let mut stream = timeout(HANDSHAKE_TIMEOUT, connector.connect(name, socket))
            .await
            .map_err(|_| ClientError::HandshakeTimeout)?
            .map_err(ClientError::Handshake)?;

        let local_psn = fresh_psn()?;
        let pending = PendingConnection::new(&device, local_psn)?;

        let (remote, remote_psn) =
            exchange::client_exchange(&mut stream, pending.local_params(), local_psn).await?;

        let conn = pending.arm(&device, remote, remote_psn)?;

        log::info!(
            "broker transport armed: addr={}, qpn={}, peer qpn={}, psn={:#08x}, peer psn={:#08x}",
            address,
            conn.local_params().qp_num,
            remote.qp_num,
            local_psn.value(),
            remote_psn.value()
        );

        Ok(BrokerClient {
            conn,
            stream,
            local_psn,
            remote_psn,
            _device: device,
        })
    }
}

/// An armed client connection.
///
/// Owns the TLS control stream and every RDMA resource; dropping it
/// tears the transport down and lets the broker observe the control
/// channel closing.
pub struct BrokerClient {
    conn: ArmedConnection,
    stream: TlsStream<TcpStream>,
    local_psn: Psn,
    remote_psn: Psn,
    // Must outlive the connection's queue pair and regions.
    _device: Arc<Device>,
}

impl BrokerClient {
    pub fn local_params(&self) -> &ConnectionParams {
        self.conn.local_params()
    }

    pub fn remote_params(&self) -> &ConnectionParams {
        self.conn.remote_params()
    }

    pub fn local_psn(&self) -> Psn {
        self.local_psn
    }

    pub fn remote_psn(&self) -> Psn {
        self.remote_psn
    }

    /// Send `payload` as an RDMA message and wait for the send
    /// completion.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        self.conn.post_send(payload)?;
        self.wait_send().await
    }

    /// RDMA-write `payload` into the broker's receive buffer and wait
    /// for the local completion. The broker is not notified.
    pub async fn write(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        self.conn.post_write(payload)?;
        self.wait_send().await
    }

    /// Wait for the next received message. Callers wanting a bound wrap
    /// this in a timeout.
    pub async fn recv(&mut self) -> Result<Vec<u8>, ClientError> {
        loop {
            if let Some(payload) = self.conn.poll_recv()? {
                return Ok(payload);
            }

            sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_send(&mut self) -> Result<(), ClientError> {
        loop {
            if self.conn.poll_send()?.is_some() {
                return Ok(());
            }

            sleep(POLL_INTERVAL).await;
        }
    }

    /// Close the control channel; the broker unwinds the connection on
    /// observing it.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| ClientError::Exchange(ExchangeError::from(e)))?;

        Ok(())
    }
}
