//! libibverbs-backed provider.
//!
//! Resources are RAII wrappers around raw verbs pointers. Drop order is the
//! caller's responsibility: QPs before their PD, everything before the
//! device. [`Client`](crate::client::Client) and
//! [`DeviceContext`](crate::device::DeviceContext) already order it that way.

use std::cell::Cell;
use std::ffi::CStr;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::BorrowedFd;
use std::os::raw::c_int;
use std::ptr::{self, NonNull};

use ibverbs_sys::{ibv_access_flags, ibv_qp_attr_mask, ibv_qp_state, ibv_qp_type};
use tracing::{debug, warn};

use crate::config::{RcConnectConfig, StressConfig};
use crate::event::AsyncEventType;
use crate::provider::{
    AsyncEventInfo, PortGid, Provider, QpHandle, QpTransportState, VerbsDevice,
};

fn check(ret: c_int) -> io::Result<()> {
    match ret {
        0 => Ok(()),
        // Some providers return -1 and set errno instead.
        r if r < 0 => Err(io::Error::last_os_error()),
        r => Err(io::Error::from_raw_os_error(r)),
    }
}

/// Opens devices from the system device list.
#[derive(Debug, Default, Clone, Copy)]
pub struct VerbsProvider;

impl Provider for VerbsProvider {
    type Device = IbvDevice;

    fn open_device(&self, name: Option<&str>) -> io::Result<IbvDevice> {
        let mut num_devices: c_int = 0;
        let list = unsafe { ibverbs_sys::ibv_get_device_list(&mut num_devices) };
        if list.is_null() {
            return Err(io::Error::last_os_error());
        }

        let mut found = None;
        for i in 0..num_devices.max(0) as usize {
            let dev = unsafe { *list.add(i) };
            let name_ptr = unsafe { ibverbs_sys::ibv_get_device_name(dev) };
            if name_ptr.is_null() {
                continue;
            }
            let dev_name = unsafe { CStr::from_ptr(name_ptr) }
                .to_string_lossy()
                .into_owned();
            if name.is_none_or(|want| want == dev_name) {
                found = Some((dev, dev_name));
                break;
            }
        }

        let result = match found {
            Some((dev, dev_name)) => {
                let ctx = unsafe { ibverbs_sys::ibv_open_device(dev) };
                NonNull::new(ctx)
                    .map(|ctx| IbvDevice {
                        ctx,
                        name: dev_name,
                    })
                    .ok_or_else(io::Error::last_os_error)
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                match name {
                    Some(name) => format!("RDMA device {name} not found"),
                    None => "no RDMA devices found".to_string(),
                },
            )),
        };
        unsafe { ibverbs_sys::ibv_free_device_list(list) };
        result
    }
}

/// An opened `ibv_context`.
pub struct IbvDevice {
    ctx: NonNull<ibverbs_sys::ibv_context>,
    name: String,
}

impl Drop for IbvDevice {
    fn drop(&mut self) {
        let ret = unsafe { ibverbs_sys::ibv_close_device(self.ctx.as_ptr()) };
        if ret != 0 {
            warn!(device = %self.name, ret, "ibv_close_device failed");
        }
    }
}

pub struct IbvEvent {
    raw: ibverbs_sys::ibv_async_event,
}

impl AsyncEventInfo for IbvEvent {
    fn event_type(&self) -> AsyncEventType {
        AsyncEventType::from(self.raw.event_type as u32)
    }
}

pub struct IbvPd {
    pd: NonNull<ibverbs_sys::ibv_pd>,
}

impl Drop for IbvPd {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_dealloc_pd(self.pd.as_ptr());
        }
    }
}

/// RC QP together with the CQ serving both of its queues.
pub struct IbvQp {
    qp: NonNull<ibverbs_sys::ibv_qp>,
    cq: NonNull<ibverbs_sys::ibv_cq>,
    state: Cell<QpTransportState>,
}

impl IbvQp {
    fn modify(&self, attr: &mut ibverbs_sys::ibv_qp_attr, mask: ibv_qp_attr_mask) -> io::Result<()> {
        check(unsafe { ibverbs_sys::ibv_modify_qp(self.qp.as_ptr(), attr, mask.0 as c_int) })
    }

    fn modify_to_init(&self, port: &PortGid) -> io::Result<()> {
        let mut attr: ibverbs_sys::ibv_qp_attr = unsafe { std::mem::zeroed() };
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = 0;
        attr.port_num = port.port_num;
        attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ
            | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC)
            .0;
        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT
            | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
        self.modify(&mut attr, mask)?;
        self.state.set(QpTransportState::Init);
        Ok(())
    }

    fn modify_to_rtr(&self, remote_qpn: u32, port: &PortGid, rc: &RcConnectConfig) -> io::Result<()> {
        let mut attr: ibverbs_sys::ibv_qp_attr = unsafe { std::mem::zeroed() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = port.active_mtu as _;
        attr.dest_qp_num = remote_qpn;
        attr.rq_psn = rc.psn;
        attr.max_dest_rd_atomic = rc.max_dest_rd_atomic;
        attr.min_rnr_timer = rc.min_rnr_timer;

        // Both QPs live on the same port, so the local GID is also the
        // destination GID.
        attr.ah_attr.is_global = 1;
        attr.ah_attr.grh.dgid.raw = port.gid;
        attr.ah_attr.grh.sgid_index = port.gid_index;
        attr.ah_attr.grh.hop_limit = rc.hop_limit;
        attr.ah_attr.dlid = port.lid;
        attr.ah_attr.sl = 0;
        attr.ah_attr.src_path_bits = 0;
        attr.ah_attr.port_num = port.port_num;

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_AV
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        self.modify(&mut attr, mask)?;
        self.state.set(QpTransportState::Rtr);
        Ok(())
    }

    fn modify_to_rts(&self, rc: &RcConnectConfig) -> io::Result<()> {
        let mut attr: ibverbs_sys::ibv_qp_attr = unsafe { std::mem::zeroed() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.sq_psn = rc.psn;
        attr.timeout = rc.timeout;
        attr.retry_cnt = rc.retry_cnt;
        attr.rnr_retry = rc.rnr_retry;
        attr.max_rd_atomic = rc.max_rd_atomic;

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
        self.modify(&mut attr, mask)?;
        self.state.set(QpTransportState::Rts);
        Ok(())
    }
}

impl QpHandle for IbvQp {
    fn qpn(&self) -> u32 {
        unsafe { (*self.qp.as_ptr()).qp_num }
    }

    fn state(&self) -> QpTransportState {
        self.state.get()
    }
}

impl Drop for IbvQp {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_destroy_qp(self.qp.as_ptr());
            ibverbs_sys::ibv_destroy_cq(self.cq.as_ptr());
        }
    }
}

impl VerbsDevice for IbvDevice {
    type Pd = IbvPd;
    type Qp = IbvQp;
    type Event = IbvEvent;

    fn name(&self) -> &str {
        &self.name
    }

    fn async_fd(&self) -> BorrowedFd<'_> {
        // The fd is owned by the context and stays open until `ibv_close_device`.
        unsafe { BorrowedFd::borrow_raw((*self.ctx.as_ptr()).async_fd) }
    }

    fn query_port_gid(&self, port_num: u8, gid_index: u8) -> io::Result<PortGid> {
        let mut port_attr = ibverbs_sys::ibv_port_attr::default();
        check(unsafe {
            ibverbs_sys::ibv_query_port(
                self.ctx.as_ptr(),
                port_num,
                &mut port_attr as *mut ibverbs_sys::ibv_port_attr as *mut _,
            )
        })?;
        match port_attr.state {
            ibverbs_sys::ibv_port_state::IBV_PORT_ACTIVE
            | ibverbs_sys::ibv_port_state::IBV_PORT_ARMED => {}
            _ => {
                return Err(io::Error::other(format!(
                    "port {port_num} is not ACTIVE or ARMED"
                )));
            }
        }

        let mut gid: ibverbs_sys::ibv_gid = unsafe { std::mem::zeroed() };
        check(unsafe {
            ibverbs_sys::ibv_query_gid(self.ctx.as_ptr(), port_num, gid_index as c_int, &mut gid)
        })?;

        Ok(PortGid {
            port_num,
            gid_index,
            lid: port_attr.lid,
            gid: unsafe { gid.raw },
            active_mtu: port_attr.active_mtu as u32,
        })
    }

    fn get_async_event(&self) -> io::Result<IbvEvent> {
        let mut raw = MaybeUninit::<ibverbs_sys::ibv_async_event>::zeroed();
        check(unsafe { ibverbs_sys::ibv_get_async_event(self.ctx.as_ptr(), raw.as_mut_ptr()) })?;
        Ok(IbvEvent {
            raw: unsafe { raw.assume_init() },
        })
    }

    fn ack_async_event(&self, mut event: IbvEvent) {
        unsafe { ibverbs_sys::ibv_ack_async_event(&mut event.raw) };
    }

    fn alloc_pd(&self) -> io::Result<IbvPd> {
        let pd = unsafe { ibverbs_sys::ibv_alloc_pd(self.ctx.as_ptr()) };
        NonNull::new(pd)
            .map(|pd| IbvPd { pd })
            .ok_or_else(io::Error::last_os_error)
    }

    fn create_rc_qp(&self, pd: &IbvPd, config: &RcConnectConfig) -> io::Result<IbvQp> {
        let cq = unsafe {
            ibverbs_sys::ibv_create_cq(
                self.ctx.as_ptr(),
                config.cq_depth as c_int,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        let cq = NonNull::new(cq).ok_or_else(io::Error::last_os_error)?;

        let mut init_attr: ibverbs_sys::ibv_qp_init_attr = unsafe { std::mem::zeroed() };
        init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        init_attr.send_cq = cq.as_ptr();
        init_attr.recv_cq = cq.as_ptr();
        init_attr.cap.max_send_wr = config.max_send_wr;
        init_attr.cap.max_recv_wr = config.max_recv_wr;
        init_attr.cap.max_send_sge = config.max_send_sge;
        init_attr.cap.max_recv_sge = config.max_recv_sge;
        init_attr.cap.max_inline_data = config.max_inline_data;

        let qp = unsafe { ibverbs_sys::ibv_create_qp(pd.pd.as_ptr(), &mut init_attr) };
        match NonNull::new(qp) {
            Some(qp) => Ok(IbvQp {
                qp,
                cq,
                state: Cell::new(QpTransportState::Reset),
            }),
            None => {
                let err = io::Error::last_os_error();
                unsafe { ibverbs_sys::ibv_destroy_cq(cq.as_ptr()) };
                Err(err)
            }
        }
    }

    fn set_up_rc_qp(
        &self,
        local: &IbvQp,
        remote: &IbvQp,
        port: &PortGid,
        config: &StressConfig,
    ) -> io::Result<()> {
        if local.state() != QpTransportState::Reset {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "QP must be in RESET state",
            ));
        }
        let remote_qpn = remote.qpn();
        let result = local
            .modify_to_init(port)
            .and_then(|()| local.modify_to_rtr(remote_qpn, port, &config.rc))
            .and_then(|()| local.modify_to_rts(&config.rc));
        match &result {
            Ok(()) => debug!(local = local.qpn(), remote = remote_qpn, "QP in RTS"),
            Err(_) => local.state.set(QpTransportState::Error),
        }
        result
    }
}
