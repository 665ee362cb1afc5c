use crate::{
    access::{flags_into_ibv_access, AccessFlag},
    completion::{CompletionRecord, WcOpcode, WcStatus},
    device::DeviceList,
    error_utilities::{log_ret, log_ret_errno, log_ret_last_os_err, log_ret_last_os_err_with_note},
    gid::Gid,
    message::WorkRequestId,
    provider::{DeviceAttr, MrKeys, PortAttr, Provider},
    queue_pair::{AddressHandler, GlobalRouteHeader, QpCaps, QpTransition},
    work_request::{RecvRequest, SendRequest, Sge},
};
use clippy_utilities::Cast;
use enumflags2::BitFlags;
use rdma_sys::{
    ibv_ah_attr, ibv_alloc_pd, ibv_close_device, ibv_context, ibv_cq, ibv_create_cq, ibv_create_qp,
    ibv_create_srq, ibv_dealloc_pd, ibv_dereg_mr, ibv_destroy_cq, ibv_destroy_qp, ibv_destroy_srq,
    ibv_device_attr, ibv_global_route, ibv_modify_qp, ibv_mr, ibv_pd, ibv_poll_cq, ibv_port_attr,
    ibv_post_send, ibv_post_srq_recv, ibv_qp, ibv_qp_attr, ibv_qp_attr_mask, ibv_qp_init_attr,
    ibv_qp_state, ibv_qp_type, ibv_query_device, ibv_query_gid, ibv_recv_wr, ibv_reg_mr,
    ibv_send_flags, ibv_send_wr, ibv_sge, ibv_srq, ibv_srq_init_attr, ibv_wc, ibv_wc_flags,
    ibv_wc_opcode, ibv_wr_opcode,
};
use std::{
    fmt, io, mem,
    ptr::{self, NonNull},
};
use tracing::debug;

/// An opened `ibv_context`
#[derive(Debug)]
#[allow(missing_copy_implementations)] // consumed on release
pub struct IbvDevice(NonNull<ibv_context>);
/// An allocated `ibv_pd`
#[derive(Debug)]
#[allow(missing_copy_implementations)] // consumed on release
pub struct IbvPd(NonNull<ibv_pd>);
/// A registered `ibv_mr`
#[derive(Debug)]
#[allow(missing_copy_implementations)] // consumed on release
pub struct IbvMr(NonNull<ibv_mr>);
/// A created `ibv_cq`
#[derive(Debug)]
#[allow(missing_copy_implementations)] // consumed on release
pub struct IbvCq(NonNull<ibv_cq>);
/// A created `ibv_srq`
#[derive(Debug)]
#[allow(missing_copy_implementations)] // consumed on release
pub struct IbvSrq(NonNull<ibv_srq>);
/// A created `ibv_qp`
#[derive(Debug)]
#[allow(missing_copy_implementations)] // consumed on release
pub struct IbvQp(NonNull<ibv_qp>);

/// [`Provider`] backed by libibverbs
pub struct IbvProvider {
    /// Landing area for `ibv_poll_cq`
    wc_buf: Vec<ibv_wc>,
}

impl IbvProvider {
    /// A provider with an empty poll buffer
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self { wc_buf: Vec::new() }
    }
}

impl Default for IbvProvider {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IbvProvider {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IbvProvider")
            .field("wc_buf_capacity", &self.wc_buf.capacity())
            .finish()
    }
}

/// Map the return value of a verbs call.
///
/// Most calls return the errno itself. A few, like `ibv_close_device`, return `-1` and leave the
/// reason in `errno`.
fn check_errno(errno: i32, note: &str) -> io::Result<()> {
    if errno == 0_i32 {
        Ok(())
    } else if errno < 0_i32 {
        Err(log_ret_last_os_err_with_note(note))
    } else {
        Err(log_ret_errno(errno, note))
    }
}

/// Signed device capability as an unsigned depth
fn cap(raw: i32) -> u32 {
    u32::try_from(raw).unwrap_or(0)
}

impl From<GlobalRouteHeader> for ibv_global_route {
    #[inline]
    fn from(grh: GlobalRouteHeader) -> Self {
        // SAFETY: POD FFI type
        let mut ibv_grh = unsafe { mem::zeroed::<ibv_global_route>() };
        ibv_grh.dgid = grh.dgid().into();
        ibv_grh.flow_label = grh.flow_label();
        ibv_grh.hop_limit = grh.hop_limit();
        ibv_grh.sgid_index = grh.sgid_index();
        ibv_grh.traffic_class = grh.traffic_class();
        ibv_grh
    }
}

impl From<AddressHandler> for ibv_ah_attr {
    #[inline]
    fn from(ah: AddressHandler) -> Self {
        // SAFETY: POD FFI type
        let mut ah_attr = unsafe { mem::zeroed::<ibv_ah_attr>() };
        ah_attr.dlid = ah.dest_lid();
        ah_attr.sl = ah.service_level();
        ah_attr.src_path_bits = ah.src_path_bits();
        ah_attr.static_rate = ah.static_rate();
        ah_attr.is_global = ah.is_global();
        ah_attr.port_num = ah.port_num();
        ah_attr.grh = ah.grh().into();
        ah_attr
    }
}

impl From<Sge> for ibv_sge {
    #[inline]
    fn from(sge: Sge) -> Self {
        Self {
            addr: sge.addr,
            length: sge.length,
            lkey: sge.lkey,
        }
    }
}

/// Translate a transition into the attribute struct and mask `ibv_modify_qp` expects
fn qp_attr_of(transition: &QpTransition) -> (ibv_qp_attr, ibv_qp_attr_mask) {
    // SAFETY: POD FFI type
    let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
    let mask = match *transition {
        QpTransition::ToInit(init) => {
            attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
            attr.pkey_index = init.pkey_index();
            attr.port_num = init.port_num();
            attr.qp_access_flags = flags_into_ibv_access(init.access()).0;
            ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                | ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_PORT
                | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS
        }
        QpTransition::ToRtr(rq_attr) => {
            attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
            attr.path_mtu = rq_attr.mtu().into();
            attr.dest_qp_num = rq_attr.dest_qp_number();
            attr.rq_psn = rq_attr.rq_psn();
            attr.max_dest_rd_atomic = rq_attr.max_dest_rd_atomic();
            attr.min_rnr_timer = rq_attr.min_rnr_timer();
            attr.ah_attr = rq_attr.address_handler().into();
            ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_AV
                | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER
        }
        QpTransition::ToRts(sq_attr) => {
            attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
            attr.timeout = sq_attr.timeout();
            attr.retry_cnt = sq_attr.retry_cnt();
            attr.rnr_retry = sq_attr.rnr_retry();
            attr.sq_psn = sq_attr.sq_psn();
            attr.max_rd_atomic = sq_attr.max_rd_atomic();
            ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC
        }
    };
    (attr, mask)
}

/// Read one polled `ibv_wc` into a record
fn record_of(wc: &ibv_wc) -> CompletionRecord {
    let opcode = if wc.opcode == ibv_wc_opcode::IBV_WC_SEND {
        WcOpcode::Send
    } else if wc.opcode == ibv_wc_opcode::IBV_WC_RECV {
        WcOpcode::Recv
    } else {
        WcOpcode::Other(wc.opcode)
    };
    let imm = if wc.wc_flags & ibv_wc_flags::IBV_WC_WITH_IMM.0 == 0 {
        None
    } else {
        // SAFETY: the union holds the immediate when `IBV_WC_WITH_IMM` is set
        Some(u32::from_be(unsafe {
            wc.imm_data_invalidated_rkey_union.imm_data
        }))
    };
    CompletionRecord {
        status: WcStatus::from_raw(wc.status),
        opcode,
        wr_id: WorkRequestId::from(wc.wr_id),
        byte_len: wc.byte_len,
        imm,
    }
}

impl Provider for IbvProvider {
    type Device = IbvDevice;
    type Pd = IbvPd;
    type Mr = IbvMr;
    type Cq = IbvCq;
    type Srq = IbvSrq;
    type Qp = IbvQp;

    fn open_device(&mut self, name: &str) -> io::Result<IbvDevice> {
        let list = DeviceList::available()?;
        let ctx = list.open(name)?;
        debug!("opened RDMA device {}", name);
        Ok(IbvDevice(ctx))
    }

    fn close_device(&mut self, device: IbvDevice) -> io::Result<()> {
        // SAFETY: ffi, the handle is consumed
        let errno = unsafe { ibv_close_device(device.0.as_ptr()) };
        check_errno(errno, "ibv_close_device")
    }

    fn alloc_pd(&mut self, device: &IbvDevice) -> io::Result<IbvPd> {
        // SAFETY: ffi
        NonNull::new(unsafe { ibv_alloc_pd(device.0.as_ptr()) })
            .map(IbvPd)
            .ok_or_else(log_ret_last_os_err)
    }

    fn dealloc_pd(&mut self, pd: IbvPd) -> io::Result<()> {
        // SAFETY: ffi, the handle is consumed
        let errno = unsafe { ibv_dealloc_pd(pd.0.as_ptr()) };
        check_errno(errno, "ibv_dealloc_pd")
    }

    fn query_port(&mut self, device: &IbvDevice, port_num: u8) -> io::Result<PortAttr> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { mem::zeroed::<ibv_port_attr>() };
        // SAFETY: ffi
        let errno =
            unsafe { rdma_sys::___ibv_query_port(device.0.as_ptr(), port_num, &mut attr) };
        check_errno(errno, "ibv_query_port")?;
        Ok(PortAttr {
            lid: attr.lid,
            state: attr.state,
            active_mtu: attr.active_mtu,
        })
    }

    fn query_gid(&mut self, device: &IbvDevice, port_num: u8, index: u8) -> io::Result<Gid> {
        let mut gid = Gid::default();
        // SAFETY: ffi
        let errno =
            unsafe { ibv_query_gid(device.0.as_ptr(), port_num, index.into(), gid.as_mut()) };
        check_errno(errno, "ibv_query_gid")?;
        Ok(gid)
    }

    fn query_device(&mut self, device: &IbvDevice) -> io::Result<DeviceAttr> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { mem::zeroed::<ibv_device_attr>() };
        // SAFETY: ffi
        let errno = unsafe { ibv_query_device(device.0.as_ptr(), &mut attr) };
        check_errno(errno, "ibv_query_device")?;
        Ok(DeviceAttr {
            max_cqe: cap(attr.max_cqe),
            max_srq_wr: cap(attr.max_srq_wr),
            max_qp_wr: cap(attr.max_qp_wr),
        })
    }

    fn reg_mr(
        &mut self,
        pd: &IbvPd,
        buf: &mut [u8],
        access: BitFlags<AccessFlag>,
    ) -> io::Result<(IbvMr, MrKeys)> {
        let access = flags_into_ibv_access(access);
        // SAFETY: ffi, the caller keeps `buf` pinned until `dereg_mr`
        let mr = NonNull::new(unsafe {
            ibv_reg_mr(
                pd.0.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                access.0.cast(),
            )
        })
        .ok_or_else(log_ret_last_os_err)?;
        // SAFETY: `mr` was just returned by `ibv_reg_mr`
        let keys = unsafe {
            MrKeys {
                addr: (*mr.as_ptr()).addr as u64,
                lkey: (*mr.as_ptr()).lkey,
                rkey: (*mr.as_ptr()).rkey,
            }
        };
        debug!(
            "registered {} bytes at {:#x}, lkey {:#x}",
            buf.len(),
            keys.addr,
            keys.lkey
        );
        Ok((IbvMr(mr), keys))
    }

    fn dereg_mr(&mut self, mr: IbvMr) -> io::Result<()> {
        // SAFETY: ffi, the handle is consumed
        let errno = unsafe { ibv_dereg_mr(mr.0.as_ptr()) };
        check_errno(errno, "ibv_dereg_mr")
    }

    fn create_cq(&mut self, device: &IbvDevice, depth: u32) -> io::Result<IbvCq> {
        // SAFETY: ffi
        NonNull::new(unsafe {
            ibv_create_cq(
                device.0.as_ptr(),
                depth.cast(),
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        })
        .map(IbvCq)
        .ok_or_else(log_ret_last_os_err)
    }

    fn destroy_cq(&mut self, cq: IbvCq) -> io::Result<()> {
        // SAFETY: ffi, the handle is consumed
        let errno = unsafe { ibv_destroy_cq(cq.0.as_ptr()) };
        check_errno(errno, "ibv_destroy_cq")
    }

    fn create_srq(&mut self, pd: &IbvPd, depth: u32) -> io::Result<IbvSrq> {
        // SAFETY: POD FFI type
        let mut init_attr = unsafe { mem::zeroed::<ibv_srq_init_attr>() };
        init_attr.attr.max_wr = depth;
        init_attr.attr.max_sge = 1;
        // SAFETY: ffi
        NonNull::new(unsafe { ibv_create_srq(pd.0.as_ptr(), &mut init_attr) })
            .map(IbvSrq)
            .ok_or_else(log_ret_last_os_err)
    }

    fn destroy_srq(&mut self, srq: IbvSrq) -> io::Result<()> {
        // SAFETY: ffi, the handle is consumed
        let errno = unsafe { ibv_destroy_srq(srq.0.as_ptr()) };
        check_errno(errno, "ibv_destroy_srq")
    }

    /// Create a queue pair
    ///
    /// On failure of `ibv_create_qp`, errno indicates the failure reason:
    ///
    /// `EINVAL`    Invalid pd, `send_cq`, `recv_cq`, srq or invalid value provided in `max_send_wr`, `max_recv_wr`, `max_send_sge`, `max_recv_sge` or in `max_inline_data`
    ///
    /// `ENOMEM`    Not enough resources to complete this operation
    ///
    /// `ENOSYS`    QP with this Transport Service Type isn't supported by this RDMA device
    fn create_qp(
        &mut self,
        pd: &IbvPd,
        cq: &IbvCq,
        srq: &IbvSrq,
        caps: QpCaps,
    ) -> io::Result<(IbvQp, u32)> {
        // SAFETY: POD FFI type
        let mut init_attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };
        init_attr.qp_context = ptr::null_mut();
        init_attr.send_cq = cq.0.as_ptr();
        init_attr.recv_cq = cq.0.as_ptr();
        init_attr.srq = srq.0.as_ptr();
        init_attr.cap.max_send_wr = caps.max_send_wr;
        init_attr.cap.max_recv_wr = caps.max_recv_wr;
        init_attr.cap.max_send_sge = caps.max_send_sge;
        init_attr.cap.max_recv_sge = caps.max_recv_sge;
        init_attr.cap.max_inline_data = 0;
        init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        init_attr.sq_sig_all = 0_i32;
        // SAFETY: ffi
        let qp = NonNull::new(unsafe { ibv_create_qp(pd.0.as_ptr(), &mut init_attr) })
            .ok_or_else(log_ret_last_os_err)?;
        // SAFETY: `qp` was just returned by `ibv_create_qp`
        let qp_num = unsafe { (*qp.as_ptr()).qp_num };
        Ok((IbvQp(qp), qp_num))
    }

    fn destroy_qp(&mut self, qp: IbvQp) -> io::Result<()> {
        // SAFETY: ffi, the handle is consumed
        let errno = unsafe { ibv_destroy_qp(qp.0.as_ptr()) };
        check_errno(errno, "ibv_destroy_qp")
    }

    fn modify_qp(&mut self, qp: &IbvQp, transition: &QpTransition) -> io::Result<()> {
        let (mut attr, mask) = qp_attr_of(transition);
        // SAFETY: ffi, and qp will not modify by other threads
        let errno = unsafe { ibv_modify_qp(qp.0.as_ptr(), &mut attr, mask.0.cast()) };
        check_errno(errno, "ibv_modify_qp")
    }

    fn post_send(&mut self, qp: &IbvQp, wr: &SendRequest) -> io::Result<()> {
        let mut sge: Option<ibv_sge> = wr.sge.map(Into::into);
        // SAFETY: POD FFI type
        let mut send_wr = unsafe { mem::zeroed::<ibv_send_wr>() };
        send_wr.wr_id = wr.wr_id.into();
        send_wr.next = ptr::null_mut();
        if let Some(ref mut sge) = sge {
            send_wr.sg_list = sge;
            send_wr.num_sge = 1;
        }
        send_wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        if let Some(imm) = wr.imm {
            send_wr.opcode = ibv_wr_opcode::IBV_WR_SEND_WITH_IMM;
            send_wr.imm_data_invalidated_rkey_union.imm_data = imm.to_be();
        } else {
            send_wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
        }
        let mut bad_wr = ptr::null_mut::<ibv_send_wr>();
        // SAFETY: ffi, `sge` outlives the call
        let errno = unsafe { ibv_post_send(qp.0.as_ptr(), &mut send_wr, &mut bad_wr) };
        check_errno(errno, "ibv_post_send")
    }

    fn post_srq_recv(&mut self, srq: &IbvSrq, wr: &RecvRequest) -> io::Result<()> {
        let mut sge: ibv_sge = wr.sge.into();
        // SAFETY: POD FFI type
        let mut recv_wr = unsafe { mem::zeroed::<ibv_recv_wr>() };
        recv_wr.wr_id = wr.wr_id.into();
        recv_wr.next = ptr::null_mut();
        recv_wr.sg_list = &mut sge;
        recv_wr.num_sge = 1;
        let mut bad_wr = ptr::null_mut::<ibv_recv_wr>();
        // SAFETY: ffi, `sge` outlives the call
        let errno = unsafe { ibv_post_srq_recv(srq.0.as_ptr(), &mut recv_wr, &mut bad_wr) };
        check_errno(errno, "ibv_post_srq_recv")
    }

    fn poll_cq(
        &mut self,
        cq: &IbvCq,
        max: usize,
        out: &mut Vec<CompletionRecord>,
    ) -> io::Result<usize> {
        let entries = i32::try_from(max).unwrap_or(i32::MAX);
        self.wc_buf.clear();
        self.wc_buf.reserve(entries.cast());
        // SAFETY: ffi, the buffer has room for `entries` entries
        let polled = unsafe { ibv_poll_cq(cq.0.as_ptr(), entries, self.wc_buf.as_mut_ptr()) };
        if polled < 0_i32 {
            return log_ret(
                Err(io::Error::new(io::ErrorKind::Other, "ibv_poll_cq failed")),
                "poll completion queue",
            );
        }
        let polled: usize = polled.cast();
        // SAFETY: the NIC initialized exactly `polled` entries
        unsafe { self.wc_buf.set_len(polled) };
        out.extend(self.wc_buf.iter().map(record_of));
        Ok(polled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_return_values() {
        assert!(check_errno(0, "ok").is_ok());
        let err = check_errno(22, "ibv_modify_qp").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(22));
        // `-1` defers to errno, whatever it holds, and is never taken for success
        assert!(check_errno(-1, "ibv_close_device").is_err());
    }
}
