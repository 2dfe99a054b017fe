//! Client side of the control-channel bootstrap.
//!
//! Mirror image of the server's exchange: the client announces its PSN
//! first and reads the server's answer, then reads the server's
//! parameter block before sending its own. Both sides block on reads
//! in this order; deviating deadlocks the channel.

use bytes::BytesMut;
use codec::{ConnectionParams, Psn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug)]
pub enum ExchangeError {
    /// The broker closed the control channel mid-exchange.
    PeerClosed,
    Io(std::io::Error),
    Codec(codec::Error),
}

impl std::error::Error for ExchangeError {}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "broker closed the control channel"),
            Self::Io(e) => write!(f, "control channel i/o error: {}", e),
            Self::Codec(e) => write!(f, "control channel protocol error: {}", e),
        }
    }
}

impl From<std::io::Error> for ExchangeError {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::PeerClosed
        } else {
            Self::Io(value)
        }
    }
}

impl From<codec::Error> for ExchangeError {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

async fn send_frame<S>(stream: &mut S, bytes: &[u8]) -> Result<(), ExchangeError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn recv_frame<S, const N: usize>(stream: &mut S) -> Result<[u8; N], ExchangeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; N];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Run the client half of the bootstrap exchange and return the
/// broker's parameter block together with its handshake PSN.
pub async fn client_exchange<S>(
    stream: &mut S,
    local: &ConnectionParams,
    local_psn: Psn,
) -> Result<(ConnectionParams, Psn), ExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut bytes = BytesMut::with_capacity(ConnectionParams::WIRE_SIZE);

    local_psn.encode(&mut bytes);
    send_frame(stream, &bytes).await?;

    let remote_psn = Psn::decode(&recv_frame::<S, { Psn::WIRE_SIZE }>(stream).await?)?;

    let remote =
        ConnectionParams::decode(&recv_frame::<S, { ConnectionParams::WIRE_SIZE }>(stream).await?)?;

    local.encode(&mut bytes);
    send_frame(stream, &bytes).await?;

    Ok((remote, remote_psn))
}
