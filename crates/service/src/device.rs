//! One-time device enumeration and the shared device handle.
//!
//! The whole process opens exactly one device context. Every worker
//! borrows it through an `Arc`; opening one context per connection
//! exhausts driver resources at low connection counts and isolates
//! nothing, since protection domains already scope each client.

use std::io;

use crate::verbs::{Context, DeviceList, LinkLayer};

/// Physical port the broker binds its queue pairs to.
pub const IB_PORT: u8 = 1;

/// GID table index queried for RoCE addressing.
pub const GID_INDEX: i32 = 0;

#[derive(Debug)]
pub enum DeviceError {
    NoDevice,
    OpenError(io::Error),
    QueryError(io::Error),
}

impl std::error::Error for DeviceError {}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoDevice => write!(f, "no RDMA device found"),
            Self::OpenError(e) => write!(f, "failed to open RDMA device: {}", e),
            Self::QueryError(e) => write!(f, "failed to query RDMA device: {}", e),
        }
    }
}

/// The open device context plus the port attributes every connection
/// needs for its address handle.
pub struct Device {
    context: Context,
    name: String,
    lid: u16,
    gid: [u8; 16],
    link_layer: LinkLayer,
}

impl Device {
    /// Enumerate devices once and open the one at `index`.
    ///
    /// Port attributes and the GID are captured at open time; the port
    /// is assumed not to be reconfigured underneath a running broker.
    pub fn open(index: usize) -> Result<Self, DeviceError> {
        let list = DeviceList::enumerate().map_err(DeviceError::OpenError)?;
        if list.is_empty() {
            return Err(DeviceError::NoDevice);
        }

        let name = list.name(index).ok_or(DeviceError::NoDevice)?;
        let context = list.open(index).map_err(DeviceError::OpenError)?;

        let port = context.query_port(IB_PORT).map_err(DeviceError::QueryError)?;
        let gid = context
            .query_gid(IB_PORT, GID_INDEX)
            .map_err(DeviceError::QueryError)?;

        log::info!(
            "rdma device open: name={}, link layer={}, lid={}, port={}",
            name,
            port.link_layer,
            port.lid,
            IB_PORT
        );

        Ok(Self {
            context,
            name,
            lid: port.lid,
            gid,
            link_layer: port.link_layer,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local identifier; zero on Ethernet transports.
    pub fn lid(&self) -> u16 {
        self.lid
    }

    pub fn gid(&self) -> [u8; 16] {
        self.gid
    }

    pub fn link_layer(&self) -> LinkLayer {
        self.link_layer
    }
}
