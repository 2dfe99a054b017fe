//! Per-client connection build and data path.
//!
//! The build is split where the control-channel exchange happens: a
//! [`PendingConnection`] holds everything that can be created from
//! local state alone (protection domain, completion queues, queue pair
//! in RESET, registered buffers, the local parameter block), and
//! [`PendingConnection::arm`] consumes it together with the peer's
//! parameters to drive the queue pair through INIT, RTR and RTS.
//!
//! Dropping either type at any point releases whatever was acquired,
//! memory regions first and the protection domain last, so a failed
//! step unwinds all earlier allocations without bookkeeping.

use std::io;

use codec::{ConnectionParams, Psn};

use crate::{
    device::{Device, IB_PORT},
    verbs::{CompletionQueue, MemoryRegion, ProtectionDomain, QueuePair, RemoteEndpoint},
};

/// Registered size of the send and receive buffers.
pub const BUFFER_SIZE: usize = 4096;

/// Outstanding work request budget. The data path keeps at most one
/// send and one receive in flight, so a small power of two leaves slack
/// for the provider.
const QUEUE_DEPTH: u32 = 16;

const SEND_WR_ID: u64 = 1;
const WRITE_WR_ID: u64 = 2;
const RECV_WR_ID: u64 = 3;

/// Build step tags, reported with the failure that stopped the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    ProtectionDomain,
    CompletionQueue,
    QueuePair,
    MemoryRegistration,
    Init,
    ReadyToReceive,
    ReadyToSend,
}

#[derive(Debug)]
pub enum ConnectionError {
    Build(BuildStage, io::Error),
    /// The peer's parameter block announced a PSN different from its
    /// handshake record.
    PsnMismatch { handshake: u32, params: u32 },
}

impl std::error::Error for ConnectionError {}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Build(stage, e) => write!(f, "connection build failed at {:?}: {}", stage, e),
            Self::PsnMismatch { handshake, params } => write!(
                f,
                "peer PSN mismatch: handshake={:#08x}, params={:#08x}",
                handshake, params
            ),
        }
    }
}

#[derive(Debug)]
pub enum TransportError {
    /// Posting the work request was refused by the provider.
    Post(io::Error),
    /// The work request completed with a non-success status. The
    /// transport's own retry budget is exhausted; the connection is
    /// dead.
    Completion { status: u32, detail: String },
    Poll(io::Error),
    PayloadTooLarge { len: usize, max: usize },
}

impl std::error::Error for TransportError {}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Post(e) => write!(f, "failed to post work request: {}", e),
            Self::Completion { status, detail } => {
                write!(f, "work completion failed: {} ({})", detail, status)
            }
            Self::Poll(e) => write!(f, "completion queue poll failed: {}", e),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload of {} bytes exceeds buffer of {}", len, max)
            }
        }
    }
}

/// A connection built from local state, waiting for the peer's
/// parameters.
pub struct PendingConnection {
    // Field order is teardown order: regions, queue pair, completion
    // queues, protection domain.
    send_mr: MemoryRegion,
    recv_mr: MemoryRegion,
    qp: QueuePair,
    send_cq: CompletionQueue,
    recv_cq: CompletionQueue,
    pd: ProtectionDomain,
    local: ConnectionParams,
    local_psn: Psn,
}

impl PendingConnection {
    /// Allocate the per-client resources against the shared device and
    /// assemble the local parameter block.
    pub fn new(device: &Device, local_psn: Psn) -> Result<Self, ConnectionError> {
        let pd = ProtectionDomain::alloc(device.context())
            .map_err(|e| ConnectionError::Build(BuildStage::ProtectionDomain, e))?;

        let send_cq = CompletionQueue::create(device.context(), QUEUE_DEPTH as i32)
            .map_err(|e| ConnectionError::Build(BuildStage::CompletionQueue, e))?;
        let recv_cq = CompletionQueue::create(device.context(), QUEUE_DEPTH as i32)
            .map_err(|e| ConnectionError::Build(BuildStage::CompletionQueue, e))?;

        let qp = QueuePair::create(&pd, &send_cq, &recv_cq, QUEUE_DEPTH)
            .map_err(|e| ConnectionError::Build(BuildStage::QueuePair, e))?;

        let send_mr = MemoryRegion::register(&pd, BUFFER_SIZE)
            .map_err(|e| ConnectionError::Build(BuildStage::MemoryRegistration, e))?;
        let recv_mr = MemoryRegion::register(&pd, BUFFER_SIZE)
            .map_err(|e| ConnectionError::Build(BuildStage::MemoryRegistration, e))?;

        let local = ConnectionParams {
            qp_num: qp.qp_num(),
            lid: device.lid(),
            gid: device.gid(),
            psn: local_psn.value(),
            rkey: recv_mr.rkey(),
            remote_addr: recv_mr.addr(),
        };

        Ok(Self {
            send_mr,
            recv_mr,
            qp,
            send_cq,
            recv_cq,
            pd,
            local,
            local_psn,
        })
    }

    /// The parameter block to announce to the peer.
    pub fn local_params(&self) -> &ConnectionParams {
        &self.local
    }

    /// Drive the queue pair to RTS against the peer's endpoint.
    ///
    /// The receive queue PSN is the peer's handshake PSN and the send
    /// queue PSN is our own; a parameter block that disagrees with the
    /// handshake is rejected before any state transition happens. The
    /// first receive is posted once the queue pair reaches RTR, never
    /// earlier.
    pub fn arm(
        self,
        device: &Device,
        remote: ConnectionParams,
        remote_psn: Psn,
    ) -> Result<ArmedConnection, ConnectionError> {
        if remote.psn != remote_psn.value() {
            return Err(ConnectionError::PsnMismatch {
                handshake: remote_psn.value(),
                params: remote.psn,
            });
        }

        self.qp
            .to_init(IB_PORT)
            .map_err(|e| ConnectionError::Build(BuildStage::Init, e))?;

        let endpoint = RemoteEndpoint {
            qp_num: remote.qp_num,
            psn: remote_psn.value(),
            lid: remote.lid,
            gid: remote.gid,
        };

        self.qp
            .to_rtr(&endpoint, device.link_layer(), IB_PORT)
            .map_err(|e| ConnectionError::Build(BuildStage::ReadyToReceive, e))?;

        self.qp
            .post_recv(RECV_WR_ID, &self.recv_mr)
            .map_err(|e| ConnectionError::Build(BuildStage::ReadyToReceive, e))?;

        self.qp
            .to_rts(self.local_psn.value())
            .map_err(|e| ConnectionError::Build(BuildStage::ReadyToSend, e))?;

        Ok(ArmedConnection {
            send_mr: self.send_mr,
            recv_mr: self.recv_mr,
            qp: self.qp,
            send_cq: self.send_cq,
            recv_cq: self.recv_cq,
            pd: self.pd,
            local: self.local,
            remote,
        })
    }
}

/// A data-plane-ready connection. Owned by exactly one worker from here
/// to teardown.
pub struct ArmedConnection {
    send_mr: MemoryRegion,
    recv_mr: MemoryRegion,
    qp: QueuePair,
    send_cq: CompletionQueue,
    recv_cq: CompletionQueue,
    #[allow(dead_code)]
    pd: ProtectionDomain,
    local: ConnectionParams,
    remote: ConnectionParams,
}

impl ArmedConnection {
    pub fn local_params(&self) -> &ConnectionParams {
        &self.local
    }

    pub fn remote_params(&self) -> &ConnectionParams {
        &self.remote
    }

    pub fn max_payload(&self) -> usize {
        self.send_mr.len()
    }

    fn stage_payload(&mut self, payload: &[u8]) -> Result<u32, TransportError> {
        if payload.len() > self.send_mr.len() {
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                max: self.send_mr.len(),
            });
        }

        self.send_mr.as_mut_slice()[..payload.len()].copy_from_slice(payload);
        Ok(payload.len() as u32)
    }

    /// Copy `payload` into the registered send buffer and post one
    /// signaled send. Completion is reported by [`Self::poll_send`].
    pub fn post_send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let len = self.stage_payload(payload)?;
        self.qp
            .post_send(SEND_WR_ID, &self.send_mr, len)
            .map_err(TransportError::Post)
    }

    /// Copy `payload` into the send buffer and post one RDMA write
    /// into the peer's receive buffer. The peer sees no completion.
    pub fn post_write(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let len = self.stage_payload(payload)?;
        self.qp
            .post_rdma_write(
                WRITE_WR_ID,
                &self.send_mr,
                len,
                self.remote.remote_addr,
                self.remote.rkey,
            )
            .map_err(TransportError::Post)
    }

    /// One poll of the send completion queue. `Ok(Some(()))` reports a
    /// successful completion; a failed status is terminal.
    pub fn poll_send(&self) -> Result<Option<()>, TransportError> {
        match self.send_cq.poll_one().map_err(TransportError::Poll)? {
            None => Ok(None),
            Some(wc) if wc.is_success() => Ok(Some(())),
            Some(wc) => Err(TransportError::Completion {
                status: wc.status,
                detail: wc.status_str(),
            }),
        }
    }

    /// One poll of the receive completion queue. On a completed
    /// receive the payload is copied out and a fresh receive posted
    /// immediately so the receive queue never runs dry.
    pub fn poll_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.recv_cq.poll_one().map_err(TransportError::Poll)? {
            None => Ok(None),
            Some(wc) if wc.is_success() => {
                let payload = self.recv_mr.as_slice()[..wc.byte_len as usize].to_vec();

                self.qp
                    .post_recv(RECV_WR_ID, &self.recv_mr)
                    .map_err(TransportError::Post)?;

                Ok(Some(payload))
            }
            Some(wc) => Err(TransportError::Completion {
                status: wc.status,
                detail: wc.status_str(),
            }),
        }
    }

    /// The receive buffer itself. RDMA writes from the peer land here
    /// without generating a completion.
    pub fn recv_buffer(&self) -> &[u8] {
        self.recv_mr.as_slice()
    }
}
