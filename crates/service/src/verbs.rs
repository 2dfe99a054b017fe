//! Thin RAII layer over the ibverbs FFI.
//!
//! Every wrapper owns exactly one provider object and releases it on
//! drop, so a failed build unwinds partial allocations in reverse
//! acquisition order for free. None of these types hand out their raw
//! pointers; the rest of the crate talks to the provider exclusively
//! through this module.

use std::{
    ffi::CStr,
    io,
    mem,
    os::raw::{c_int, c_void},
    ptr::{self, NonNull},
};

use rdma_sys::*;

// Not exported by rdma-sys's bindgen output (the anonymous enum in
// verbs.h isn't reachable from any allowlisted type), but these
// discriminants are a stable kernel uAPI ABI.
const IBV_LINK_LAYER_INFINIBAND: u32 = 1;
const IBV_LINK_LAYER_ETHERNET: u32 = 2;

/// The access profile used for every registration and queue pair: the
/// peer may read and write our registered buffers, and the provider may
/// write incoming messages locally.
fn full_access() -> ibv_access_flags {
    ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
        | ibv_access_flags::IBV_ACCESS_REMOTE_READ
        | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
}

fn rc_to_result(rc: c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

/// The link layer reported by the port, which decides how the address
/// handle is filled at the RTR transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Infiniband,
    Ethernet,
    Unspecified,
}

impl std::fmt::Display for LinkLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Infiniband => write!(f, "InfiniBand"),
            Self::Ethernet => write!(f, "Ethernet"),
            Self::Unspecified => write!(f, "Unspecified"),
        }
    }
}

/// The result of one device enumeration.
pub struct DeviceList {
    list: *mut *mut ibv_device,
    len: usize,
}

impl DeviceList {
    pub fn enumerate() -> io::Result<Self> {
        let mut num: c_int = 0;
        let list = unsafe { ibv_get_device_list(&mut num) };
        if list.is_null() {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            list,
            len: num as usize,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn name(&self, index: usize) -> Option<String> {
        let device = self.get(index)?;
        let name = unsafe { ibv_get_device_name(device) };
        if name.is_null() {
            return None;
        }

        Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    }

    fn get(&self, index: usize) -> Option<*mut ibv_device> {
        if index >= self.len {
            return None;
        }

        let device = unsafe { *self.list.add(index) };
        if device.is_null() { None } else { Some(device) }
    }

    /// Open a device context on the device at `index`.
    ///
    /// The returned context stays valid after the list is freed; the
    /// provider reference-counts the underlying device.
    pub fn open(&self, index: usize) -> io::Result<Context> {
        let device = self
            .get(index)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;

        let context = unsafe { ibv_open_device(device) };
        NonNull::new(context)
            .map(Context)
            .ok_or_else(io::Error::last_os_error)
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        unsafe { ibv_free_device_list(self.list) }
    }
}

/// An open device context.
pub struct Context(NonNull<ibv_context>);

// The verbs provider allows concurrent calls on one context; the
// wrapper never exposes interior mutation.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    pub fn query_port(&self, port: u8) -> io::Result<PortInfo> {
        let mut attr = unsafe { mem::zeroed::<ibv_port_attr>() };
        rc_to_result(unsafe { ___ibv_query_port(self.0.as_ptr(), port, &mut attr) })?;

        let link_layer = if u32::from(attr.link_layer) == IBV_LINK_LAYER_ETHERNET as u32 {
            LinkLayer::Ethernet
        } else if u32::from(attr.link_layer) == IBV_LINK_LAYER_INFINIBAND as u32 {
            LinkLayer::Infiniband
        } else {
            LinkLayer::Unspecified
        };

        Ok(PortInfo {
            lid: attr.lid,
            link_layer,
        })
    }

    pub fn query_gid(&self, port: u8, index: i32) -> io::Result<[u8; 16]> {
        let mut gid = unsafe { mem::zeroed::<ibv_gid>() };
        rc_to_result(unsafe { ibv_query_gid(self.0.as_ptr(), port, index, &mut gid) })?;
        Ok(unsafe { gid.raw })
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe { ibv_close_device(self.0.as_ptr()) };
    }
}

/// Port attributes the broker cares about.
#[derive(Debug, Clone, Copy)]
pub struct PortInfo {
    pub lid: u16,
    pub link_layer: LinkLayer,
}

/// A protection domain scoping one client's queue pair and memory
/// regions.
pub struct ProtectionDomain(NonNull<ibv_pd>);

unsafe impl Send for ProtectionDomain {}

impl ProtectionDomain {
    pub fn alloc(context: &Context) -> io::Result<Self> {
        let pd = unsafe { ibv_alloc_pd(context.0.as_ptr()) };
        NonNull::new(pd).map(Self).ok_or_else(io::Error::last_os_error)
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        unsafe { ibv_dealloc_pd(self.0.as_ptr()) };
    }
}

/// One completed work request, as reported by the provider.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub wr_id: u64,
    pub status: u32,
    pub byte_len: u32,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.status == ibv_wc_status::IBV_WC_SUCCESS
    }

    /// Human-readable completion status for logs.
    pub fn status_str(&self) -> String {
        let name = unsafe { ibv_wc_status_str(self.status) };
        if name.is_null() {
            return format!("status {}", self.status);
        }

        unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
    }
}

/// A completion queue polled without a completion channel.
pub struct CompletionQueue(NonNull<ibv_cq>);

unsafe impl Send for CompletionQueue {}

impl CompletionQueue {
    pub fn create(context: &Context, depth: i32) -> io::Result<Self> {
        let cq = unsafe {
            ibv_create_cq(
                context.0.as_ptr(),
                depth,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };

        NonNull::new(cq).map(Self).ok_or_else(io::Error::last_os_error)
    }

    /// Drain at most one completion. `Ok(None)` means the queue was
    /// empty; poll again after a short backoff.
    pub fn poll_one(&self) -> io::Result<Option<Completion>> {
        let mut wc = unsafe { mem::zeroed::<ibv_wc>() };
        let polled = unsafe { ibv_poll_cq(self.0.as_ptr(), 1, &mut wc) };

        match polled {
            0 => Ok(None),
            1 => Ok(Some(Completion {
                wr_id: wc.wr_id,
                status: wc.status,
                byte_len: wc.byte_len,
            })),
            _ => Err(io::Error::last_os_error()),
        }
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        unsafe { ibv_destroy_cq(self.0.as_ptr()) };
    }
}

/// A registered buffer. The wrapper owns both the provider registration
/// and the backing allocation, so the memory cannot outlive or predate
/// its registration.
pub struct MemoryRegion {
    mr: NonNull<ibv_mr>,
    buf: Box<[u8]>,
}

unsafe impl Send for MemoryRegion {}

impl MemoryRegion {
    pub fn register(pd: &ProtectionDomain, len: usize) -> io::Result<Self> {
        let mut buf = vec![0u8; len].into_boxed_slice();
        let mr = unsafe {
            ibv_reg_mr(
                pd.0.as_ptr(),
                buf.as_mut_ptr() as *mut c_void,
                len,
                full_access().0 as c_int,
            )
        };

        Ok(Self {
            mr: NonNull::new(mr).ok_or_else(io::Error::last_os_error)?,
            buf,
        })
    }

    pub fn addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr.as_ptr()).lkey }
    }

    pub fn rkey(&self) -> u32 {
        unsafe { (*self.mr.as_ptr()).rkey }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // Deregistration must precede the buffer free; `buf` drops
        // after `mr` by field order.
        unsafe { ibv_dereg_mr(self.mr.as_ptr()) };
    }
}

/// The peer-side values a queue pair is armed against.
#[derive(Debug, Clone, Copy)]
pub struct RemoteEndpoint {
    pub qp_num: u32,
    pub psn: u32,
    pub lid: u16,
    pub gid: [u8; 16],
}

/// A reliable-connected queue pair, created in RESET and driven through
/// INIT, RTR and RTS by its owner.
pub struct QueuePair(NonNull<ibv_qp>);

unsafe impl Send for QueuePair {}

impl QueuePair {
    pub fn create(
        pd: &ProtectionDomain,
        send_cq: &CompletionQueue,
        recv_cq: &CompletionQueue,
        depth: u32,
    ) -> io::Result<Self> {
        let mut init = unsafe { mem::zeroed::<ibv_qp_init_attr>() };
        init.send_cq = send_cq.0.as_ptr();
        init.recv_cq = recv_cq.0.as_ptr();
        init.qp_type = ibv_qp_type::IBV_QPT_RC;
        init.sq_sig_all = 1;
        init.cap.max_send_wr = depth;
        init.cap.max_recv_wr = depth;
        init.cap.max_send_sge = 1;
        init.cap.max_recv_sge = 1;

        let qp = unsafe { ibv_create_qp(pd.0.as_ptr(), &mut init) };
        NonNull::new(qp).map(Self).ok_or_else(io::Error::last_os_error)
    }

    pub fn qp_num(&self) -> u32 {
        unsafe { (*self.0.as_ptr()).qp_num }
    }

    /// RESET -> INIT.
    pub fn to_init(&self, port: u8) -> io::Result<()> {
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = 0;
        attr.port_num = port;
        attr.qp_access_flags = full_access().0;

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT
            | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;

        rc_to_result(unsafe { ibv_modify_qp(self.0.as_ptr(), &mut attr, mask.0 as c_int) })
    }

    /// INIT -> RTR. The receive queue is seeded with the peer's PSN and
    /// keyed to the peer's queue pair number; the address handle is
    /// filled from the link layer the port actually reports.
    pub fn to_rtr(&self, remote: &RemoteEndpoint, link_layer: LinkLayer, port: u8) -> io::Result<()> {
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = ibv_mtu::IBV_MTU_1024;
        attr.dest_qp_num = remote.qp_num;
        attr.rq_psn = remote.psn;
        attr.max_dest_rd_atomic = 1;
        attr.min_rnr_timer = 12;
        attr.ah_attr.port_num = port;

        match link_layer {
            LinkLayer::Ethernet => {
                attr.ah_attr.is_global = 1;
                attr.ah_attr.dlid = 0;
                attr.ah_attr.grh.dgid.raw = remote.gid;
                attr.ah_attr.grh.sgid_index = 0;
                attr.ah_attr.grh.hop_limit = 1;
            }
            _ => {
                attr.ah_attr.is_global = 0;
                attr.ah_attr.dlid = remote.lid;
                attr.ah_attr.sl = 0;
            }
        }

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_AV
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;

        rc_to_result(unsafe { ibv_modify_qp(self.0.as_ptr(), &mut attr, mask.0 as c_int) })
    }

    /// RTR -> RTS. The send queue is seeded with our own PSN; the retry
    /// budget here is the only retry mechanism on the data path.
    pub fn to_rts(&self, local_psn: u32) -> io::Result<()> {
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.timeout = 14;
        attr.retry_cnt = 7;
        attr.rnr_retry = 7;
        attr.sq_psn = local_psn;
        attr.max_rd_atomic = 1;

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;

        rc_to_result(unsafe { ibv_modify_qp(self.0.as_ptr(), &mut attr, mask.0 as c_int) })
    }

    pub fn post_recv(&self, wr_id: u64, region: &MemoryRegion) -> io::Result<()> {
        let mut sge = ibv_sge {
            addr: region.addr(),
            length: region.len() as u32,
            lkey: region.lkey(),
        };

        let mut wr = unsafe { mem::zeroed::<ibv_recv_wr>() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;

        let mut bad: *mut ibv_recv_wr = ptr::null_mut();
        rc_to_result(unsafe { ibv_post_recv(self.0.as_ptr(), &mut wr, &mut bad) })
    }

    pub fn post_send(&self, wr_id: u64, region: &MemoryRegion, len: u32) -> io::Result<()> {
        let mut sge = ibv_sge {
            addr: region.addr(),
            length: len,
            lkey: region.lkey(),
        };

        let mut wr = unsafe { mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;

        let mut bad: *mut ibv_send_wr = ptr::null_mut();
        rc_to_result(unsafe { ibv_post_send(self.0.as_ptr(), &mut wr, &mut bad) })
    }

    /// Post an RDMA write into the peer's receive buffer. Completes on
    /// our send queue only; the peer is not notified.
    pub fn post_rdma_write(
        &self,
        wr_id: u64,
        region: &MemoryRegion,
        len: u32,
        remote_addr: u64,
        rkey: u32,
    ) -> io::Result<()> {
        let mut sge = ibv_sge {
            addr: region.addr(),
            length: len,
            lkey: region.lkey(),
        };

        let mut wr = unsafe { mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        unsafe {
            wr.wr.rdma.remote_addr = remote_addr;
            wr.wr.rdma.rkey = rkey;
        }

        let mut bad: *mut ibv_send_wr = ptr::null_mut();
        rc_to_result(unsafe { ibv_post_send(self.0.as_ptr(), &mut wr, &mut bad) })
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        unsafe { ibv_destroy_qp(self.0.as_ptr()) };
    }
}
