//! Server side of the control-channel bootstrap.
//!
//! The exchange runs in a fixed order both sides must follow or the
//! channel deadlocks: the client announces its PSN first and the server
//! answers, then the server sends its parameter block first and the
//! client answers. Records are framed by their statically known wire
//! size; a short read means the peer went away.

use bytes::BytesMut;
use codec::{ConnectionParams, Psn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug)]
pub enum ControlError {
    /// The peer closed the control channel. Expected at any time after
    /// bootstrap; not a fault.
    PeerClosed,
    Io(std::io::Error),
    Codec(codec::Error),
}

impl std::error::Error for ControlError {}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed the control channel"),
            Self::Io(e) => write!(f, "control channel i/o error: {}", e),
            Self::Codec(e) => write!(f, "control channel protocol error: {}", e),
        }
    }
}

impl From<std::io::Error> for ControlError {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::PeerClosed
        } else {
            Self::Io(value)
        }
    }
}

impl From<codec::Error> for ControlError {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

pub async fn send_frame<S>(stream: &mut S, bytes: &[u8]) -> Result<(), ControlError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn recv_frame<S, const N: usize>(stream: &mut S) -> Result<[u8; N], ControlError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; N];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Run the server half of the bootstrap exchange and return the peer's
/// parameter block together with the PSN it announced in the handshake
/// record.
pub async fn server_exchange<S>(
    stream: &mut S,
    local: &ConnectionParams,
    local_psn: Psn,
) -> Result<(ConnectionParams, Psn), ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote_psn = Psn::decode(&recv_frame::<S, { Psn::WIRE_SIZE }>(stream).await?)?;

    let mut bytes = BytesMut::with_capacity(ConnectionParams::WIRE_SIZE);

    local_psn.encode(&mut bytes);
    send_frame(stream, &bytes).await?;

    local.encode(&mut bytes);
    send_frame(stream, &bytes).await?;

    let remote =
        ConnectionParams::decode(&recv_frame::<S, { ConnectionParams::WIRE_SIZE }>(stream).await?)?;

    Ok((remote, remote_psn))
}
