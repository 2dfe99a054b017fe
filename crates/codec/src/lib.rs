//! ## Control-channel wire codec
//!
//! The broker never lets the RDMA transport carry its own connection
//! parameters. Before a queue pair is armed, both sides exchange a small
//! set of fixed-size records over an authenticated TLS stream: first the
//! packet sequence numbers, then the full connection parameter blocks.
//!
//! Every record here has a statically known wire size and no length
//! prefix. The transport layer reads exactly `WIRE_SIZE` bytes per
//! record; anything shorter is a peer disconnect, anything malformed is a
//! protocol error.

use std::array::TryFromSliceError;

use bytes::{BufMut, BytesMut};

/// The significant bits of a packet sequence number.
pub const PSN_MASK: u32 = 0x00FF_FFFF;

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    ZeroPsn,
    PsnOutOfRange,
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

/// A 24-bit packet sequence number.
///
/// Reliable-connected queue pairs drop packets whose sequence number
/// falls outside the expected window, so a connection armed with an
/// unpredictable PSN cannot be replayed into. The value is never zero,
/// and the high 8 bits of the carrying `u32` are always zero.
///
/// # Test
///
/// ```
/// use rdma_broker_codec::Psn;
///
/// let psn = Psn::new(0x00AB_CDEF).unwrap();
///
/// assert_eq!(psn.value(), 0x00AB_CDEF);
/// assert!(Psn::new(0).is_err());
/// assert!(Psn::new(0x0100_0000).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Psn(u32);

impl Psn {
    /// Wire size of one PSN handshake record.
    pub const WIRE_SIZE: usize = 4;

    pub fn new(value: u32) -> Result<Self, Error> {
        if value == 0 {
            return Err(Error::ZeroPsn);
        }

        if value & !PSN_MASK != 0 {
            return Err(Error::PsnOutOfRange);
        }

        Ok(Self(value))
    }

    /// Shape an arbitrary 32-bit value into a legal PSN: mask to 24
    /// bits, force the low bit so the result is never zero.
    ///
    /// # Test
    ///
    /// ```
    /// use rdma_broker_codec::Psn;
    ///
    /// assert_eq!(Psn::shaped(0xFFFF_FFFE).value(), 0x00FF_FFFF);
    /// assert_eq!(Psn::shaped(0).value(), 1);
    /// ```
    pub fn shaped(value: u32) -> Self {
        Self((value & PSN_MASK) | 1)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use rdma_broker_codec::Psn;
    ///
    /// let mut bytes = BytesMut::with_capacity(4);
    /// Psn::new(1).unwrap().encode(&mut bytes);
    ///
    /// assert_eq!(&bytes[..], &[0, 0, 0, 1]);
    /// ```
    pub fn encode(self, bytes: &mut BytesMut) {
        bytes.clear();
        bytes.put_u32(self.0);
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use rdma_broker_codec::Psn;
    ///
    /// let mut bytes = BytesMut::with_capacity(4);
    /// Psn::new(0x00FF_FFFF).unwrap().encode(&mut bytes);
    ///
    /// assert_eq!(Psn::decode(&bytes[..]).unwrap().value(), 0x00FF_FFFF);
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < Self::WIRE_SIZE {
            return Err(Error::InvalidInput);
        }

        Self::new(u32::from_be_bytes(bytes[..4].try_into()?))
    }
}

/// The connection parameter block.
///
/// Everything a peer needs to arm its queue pair against ours: the queue
/// pair number, the fabric addressing (LID for classical InfiniBand, GID
/// for RoCE), our sending PSN, and the remote key plus base address of
/// our receive buffer so the peer may RDMA-write into it.
///
/// All multi-byte fields travel big-endian; the 16-byte GID travels
/// verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParams {
    pub qp_num: u32,
    pub lid: u16,
    pub gid: [u8; 16],
    pub psn: u32,
    pub rkey: u32,
    pub remote_addr: u64,
}

impl ConnectionParams {
    /// Wire size of one parameter record: the sum of the field widths,
    /// no padding, no length prefix.
    pub const WIRE_SIZE: usize = 4 + 2 + 16 + 4 + 4 + 8;

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use rdma_broker_codec::ConnectionParams;
    ///
    /// let params = ConnectionParams {
    ///     qp_num: 0x11223344,
    ///     lid: 17,
    ///     gid: [0xFE; 16],
    ///     psn: 0x00ABCDEF,
    ///     rkey: 0x55667788,
    ///     remote_addr: 0x1122334455667788,
    /// };
    ///
    /// let mut bytes = BytesMut::with_capacity(ConnectionParams::WIRE_SIZE);
    /// params.encode(&mut bytes);
    ///
    /// assert_eq!(bytes.len(), ConnectionParams::WIRE_SIZE);
    /// assert_eq!(ConnectionParams::decode(&bytes[..]).unwrap(), params);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.clear();
        bytes.put_u32(self.qp_num);
        bytes.put_u16(self.lid);
        bytes.extend_from_slice(&self.gid);
        bytes.put_u32(self.psn);
        bytes.put_u32(self.rkey);
        bytes.put_u64(self.remote_addr);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < Self::WIRE_SIZE {
            return Err(Error::InvalidInput);
        }

        let psn = u32::from_be_bytes(bytes[22..26].try_into()?);
        if psn & !PSN_MASK != 0 {
            return Err(Error::PsnOutOfRange);
        }

        Ok(Self {
            qp_num: u32::from_be_bytes(bytes[..4].try_into()?),
            lid: u16::from_be_bytes(bytes[4..6].try_into()?),
            gid: bytes[6..22].try_into()?,
            psn,
            rkey: u32::from_be_bytes(bytes[26..30].try_into()?),
            remote_addr: u64::from_be_bytes(bytes[30..38].try_into()?),
        })
    }
}
