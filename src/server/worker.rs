//! Per-client worker: bootstrap, data loop, teardown.
//!
//! One worker owns one client from admission to teardown: its TLS
//! stream, its protection domain, queue pair, completion queues and
//! registered buffers. Nothing here is shared with another worker, so
//! the data path needs no locks at all.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use service::{
    ArmedConnection, ConnectionError, Device, PendingConnection, PsnError, SlotTable,
    TransportError, fresh_psn,
};
use tokio::{io::AsyncReadExt, net::TcpStream};
use tokio_rustls::server::TlsStream;

use crate::{
    server::{
        Shutdown,
        control::{self, ControlError},
    },
    statistics::Statistics,
};

/// Backoff between completion queue polls. Short enough that shutdown
/// and new completions are picked up promptly.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

#[derive(Debug)]
enum ClientError {
    Psn(PsnError),
    Control(ControlError),
    Connection(ConnectionError),
    Transport(TransportError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Psn(e) => write!(f, "{}", e),
            Self::Control(e) => write!(f, "{}", e),
            Self::Connection(e) => write!(f, "{}", e),
            Self::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl ClientError {
    fn is_peer_closed(&self) -> bool {
        matches!(self, Self::Control(ControlError::PeerClosed))
    }
}

impl From<PsnError> for ClientError {
    fn from(value: PsnError) -> Self {
        Self::Psn(value)
    }
}

impl From<ControlError> for ClientError {
    fn from(value: ControlError) -> Self {
        Self::Control(value)
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

/// Serve one admitted client, then release its slot.
///
/// All RDMA resources are dropped inside [`run_client`], so the slot is
/// freed in the same epoch as the resources it guarded.
pub async fn serve(
    stream: TlsStream<TcpStream>,
    address: SocketAddr,
    client_id: usize,
    device: Arc<Device>,
    slots: Arc<SlotTable>,
    statistics: Statistics,
    shutdown: Arc<Shutdown>,
) {
    statistics.worker_started();
    log::info!("client={} admitted: addr={}", client_id, address);

    match run_client(stream, client_id, &device, &shutdown, &statistics).await {
        Ok(()) => log::info!("client={} finished: addr={}", client_id, address),
        Err(e) if e.is_peer_closed() => {
            log::info!("client={} disconnected: addr={}", client_id, address)
        }
        Err(e) => log::warn!("client={} failed: addr={}, err={}", client_id, address, e),
    }

    slots.release(client_id);
    statistics.worker_finished();
}

async fn run_client(
    mut stream: TlsStream<TcpStream>,
    client_id: usize,
    device: &Device,
    shutdown: &Shutdown,
    statistics: &Statistics,
) -> Result<(), ClientError> {
    let local_psn = fresh_psn()?;
    let pending = PendingConnection::new(device, local_psn)?;

    let (remote, remote_psn) =
        control::server_exchange(&mut stream, pending.local_params(), local_psn).await?;

    let mut conn = pending.arm(device, remote, remote_psn)?;

    log::info!(
        "client={} transport armed: qpn={}, peer qpn={}, psn={:#08x}, peer psn={:#08x}",
        client_id,
        conn.local_params().qp_num,
        remote.qp_num,
        local_psn.value(),
        remote_psn.value()
    );

    message_loop(&mut stream, client_id, &mut conn, shutdown, statistics).await
}

/// Poll the receive queue, echo every message, and watch the control
/// channel for the peer going away.
async fn message_loop(
    stream: &mut TlsStream<TcpStream>,
    client_id: usize,
    conn: &mut ArmedConnection,
    shutdown: &Shutdown,
    statistics: &Statistics,
) -> Result<(), ClientError> {
    let mut eof_probe = [0u8; 1];

    loop {
        if shutdown.is_triggered() {
            return Ok(());
        }

        if let Some(payload) = conn.poll_recv()? {
            statistics.on_message();
            log::info!(
                "client={} Received: {}",
                client_id,
                String::from_utf8_lossy(&payload)
            );

            // Echo the payload so the peer observes the round trip.
            send_message(conn, &payload, shutdown).await?;
            continue;
        }

        tokio::select! {
            read = stream.read(&mut eof_probe) => {
                match read {
                    Ok(0) => return Err(ControlError::PeerClosed.into()),
                    // Stray control bytes after bootstrap carry no
                    // meaning; ignore them.
                    Ok(_) => {}
                    Err(e) => return Err(ControlError::from(e).into()),
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = shutdown.notified() => return Ok(()),
        }
    }
}

/// Post one send and spin on the send completion queue until the
/// provider reports it done.
async fn send_message(
    conn: &mut ArmedConnection,
    payload: &[u8],
    shutdown: &Shutdown,
) -> Result<(), ClientError> {
    conn.post_send(payload)?;

    loop {
        if conn.poll_send()?.is_some() {
            return Ok(());
        }

        if shutdown.is_triggered() {
            return Ok(());
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
