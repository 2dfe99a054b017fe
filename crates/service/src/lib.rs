//! ## RDMA broker service
//!
//! Everything between the TLS control channel and the verbs provider:
//! the shared device handle, the PSN source, the per-client connection
//! builder with its manual queue-pair state machine, the armed data
//! path, and the admission slot table.
//!
//! The broker drives every queue pair through `RESET -> INIT -> RTR ->
//! RTS` itself instead of delegating to a connection manager. A
//! connection manager picks the sequence numbers for you; this service
//! exists precisely so the application can bind its own.

pub mod connection;
pub mod device;
pub mod psn;
pub mod slots;
pub mod verbs;

pub use self::{
    connection::{ArmedConnection, BuildStage, ConnectionError, PendingConnection, TransportError},
    device::{Device, DeviceError},
    psn::{PsnError, fresh_psn},
    slots::SlotTable,
};
