//! In-process mock transport.
//!
//! The async event channel is a real pipe: each injected event writes one
//! byte, and reading an event consumes one. `poll(2)` and `fcntl(2)` in the
//! harness therefore run against a real descriptor. Everything else (PDs,
//! QPs, the RC handshake) is simulated, with knobs for injecting failures.

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};

use nix::errno::Errno;

use crate::client::QpClient;
use crate::config::{RcConnectConfig, StressConfig};
use crate::device::{poll_readable, set_nonblocking};
use crate::event::AsyncEventType;
use crate::latency::{LatencyMeasurement, OpType};
use crate::provider::{
    AsyncEventInfo, PortGid, Provider, QpHandle, QpTransportState, VerbsDevice,
};

/// First QPN handed out by a mock device.
pub const FIRST_QPN: u32 = 0x100;

/// Provider listing a fixed set of mock devices.
#[derive(Debug, Clone)]
pub struct MockProvider {
    devices: Vec<String>,
    nonblocking_failure: Option<Errno>,
}

impl MockProvider {
    /// Two devices, `mock_0` and `mock_1`.
    pub fn new() -> Self {
        Self {
            devices: vec!["mock_0".into(), "mock_1".into()],
            nonblocking_failure: None,
        }
    }

    pub fn without_devices() -> Self {
        Self {
            devices: Vec::new(),
            nonblocking_failure: None,
        }
    }

    /// Devices opened from this provider refuse to switch their async fd to
    /// non-blocking mode.
    pub fn with_nonblocking_failure(mut self, errno: Errno) -> Self {
        self.nonblocking_failure = Some(errno);
        self
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for MockProvider {
    type Device = MockDevice;

    fn open_device(&self, name: Option<&str>) -> io::Result<MockDevice> {
        let found = match name {
            Some(name) => self.devices.iter().find(|d| d.as_str() == name),
            None => self.devices.first(),
        };
        match found {
            Some(name) => MockDevice::new(name, self.nonblocking_failure),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no matching mock device",
            )),
        }
    }
}

#[derive(Debug)]
pub struct MockEvent {
    id: u64,
    event_type: AsyncEventType,
}

impl MockEvent {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl AsyncEventInfo for MockEvent {
    fn event_type(&self) -> AsyncEventType {
        self.event_type
    }
}

#[derive(Debug)]
pub struct MockPd {
    id: u32,
}

impl MockPd {
    pub fn id(&self) -> u32 {
        self.id
    }
}

#[derive(Debug)]
pub struct MockQp {
    qpn: u32,
    pd_id: u32,
    state: Cell<QpTransportState>,
    remote_qpn: Cell<Option<u32>>,
}

impl MockQp {
    /// QPN the handshake targeted, once it reached RTR.
    pub fn remote_qpn(&self) -> Option<u32> {
        self.remote_qpn.get()
    }

    pub fn pd_id(&self) -> u32 {
        self.pd_id
    }
}

impl QpHandle for MockQp {
    fn qpn(&self) -> u32 {
        self.qpn
    }

    fn state(&self) -> QpTransportState {
        self.state.get()
    }
}

pub struct MockDevice {
    name: String,
    port: PortGid,
    event_rx: File,
    event_tx: File,
    queue: RefCell<VecDeque<MockEvent>>,
    next_event_id: Cell<u64>,
    events_read: Cell<usize>,
    acked: RefCell<Vec<u64>>,
    next_qpn: Cell<u32>,
    qp_limit: Cell<Option<u32>>,
    qps_created: Cell<u32>,
    pd_limit: Cell<Option<u32>>,
    pds_allocated: Cell<u32>,
    failing_qpns: RefCell<HashSet<u32>>,
    nonblocking_failure: Option<Errno>,
    poll_failure: Cell<Option<Errno>>,
}

impl MockDevice {
    fn new(name: &str, nonblocking_failure: Option<Errno>) -> io::Result<Self> {
        let (rx, tx) = nix::unistd::pipe()?;
        let mut gid = [0u8; 16];
        gid[0] = 0xfe;
        gid[1] = 0x80;
        gid[15] = 0x01;
        Ok(Self {
            name: name.to_string(),
            port: PortGid {
                port_num: 1,
                gid_index: 0,
                lid: 1,
                gid,
                active_mtu: 5,
            },
            event_rx: File::from(rx),
            event_tx: File::from(tx),
            queue: RefCell::new(VecDeque::new()),
            next_event_id: Cell::new(0),
            events_read: Cell::new(0),
            acked: RefCell::new(Vec::new()),
            next_qpn: Cell::new(FIRST_QPN),
            qp_limit: Cell::new(None),
            qps_created: Cell::new(0),
            pd_limit: Cell::new(None),
            pds_allocated: Cell::new(0),
            failing_qpns: RefCell::new(HashSet::new()),
            nonblocking_failure,
            poll_failure: Cell::new(None),
        })
    }

    fn signal(&self) {
        (&self.event_tx)
            .write_all(&[1])
            .expect("mock async event pipe is full");
    }

    /// Queue an async event and make the fd readable.
    pub fn inject_event(&self, event_type: AsyncEventType) {
        let id = self.next_event_id.get();
        self.next_event_id.set(id + 1);
        self.queue
            .borrow_mut()
            .push_back(MockEvent { id, event_type });
        self.signal();
    }

    /// Make the fd readable without queueing an event.
    pub fn inject_spurious_wakeup(&self) {
        self.signal();
    }

    /// Events handed out by `get_async_event`.
    pub fn events_read(&self) -> usize {
        self.events_read.get()
    }

    /// Ids of acknowledged events, in acknowledgment order.
    pub fn acked_events(&self) -> Vec<u64> {
        self.acked.borrow().clone()
    }

    /// Events read but not yet acknowledged.
    pub fn unacked_events(&self) -> usize {
        self.events_read.get() - self.acked.borrow().len()
    }

    /// Events queued and not yet read.
    pub fn queued_events(&self) -> usize {
        self.queue.borrow().len()
    }

    /// QPN the next created QP will get.
    pub fn next_qpn(&self) -> u32 {
        self.next_qpn.get()
    }

    /// Fail QP creation once `limit` QPs exist on this device.
    pub fn set_qp_limit(&self, limit: u32) {
        self.qp_limit.set(Some(limit));
    }

    /// Fail PD allocation once `limit` PDs exist on this device.
    pub fn set_pd_limit(&self, limit: u32) {
        self.pd_limit.set(Some(limit));
    }

    pub fn pds_allocated(&self) -> u32 {
        self.pds_allocated.get()
    }

    /// Fail the next readiness poll with `errno`.
    pub fn fail_next_poll(&self, errno: Errno) {
        self.poll_failure.set(Some(errno));
    }

    /// Make the handshake fail at RTR whenever `qpn` is the local QP.
    pub fn fail_handshake_for(&self, qpn: u32) {
        self.failing_qpns.borrow_mut().insert(qpn);
    }
}

impl VerbsDevice for MockDevice {
    type Pd = MockPd;
    type Qp = MockQp;
    type Event = MockEvent;

    fn name(&self) -> &str {
        &self.name
    }

    fn async_fd(&self) -> BorrowedFd<'_> {
        self.event_rx.as_fd()
    }

    fn query_port_gid(&self, port_num: u8, gid_index: u8) -> io::Result<PortGid> {
        if port_num != self.port.port_num {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mock device has no port {port_num}"),
            ));
        }
        Ok(PortGid {
            gid_index,
            ..self.port
        })
    }

    fn set_async_fd_nonblocking(&self) -> nix::Result<()> {
        match self.nonblocking_failure {
            Some(errno) => Err(errno),
            None => set_nonblocking(self.async_fd()),
        }
    }

    fn poll_async_fd(&self) -> nix::Result<bool> {
        match self.poll_failure.take() {
            Some(errno) => Err(errno),
            None => poll_readable(self.async_fd()),
        }
    }

    fn get_async_event(&self) -> io::Result<MockEvent> {
        let mut byte = [0u8; 1];
        (&self.event_rx).read_exact(&mut byte)?;
        let event = self.queue.borrow_mut().pop_front().ok_or_else(|| {
            io::Error::new(io::ErrorKind::WouldBlock, "no async event queued")
        })?;
        self.events_read.set(self.events_read.get() + 1);
        Ok(event)
    }

    fn ack_async_event(&self, event: MockEvent) {
        let mut acked = self.acked.borrow_mut();
        assert!(!acked.contains(&event.id), "event {} acked twice", event.id);
        acked.push(event.id);
    }

    fn alloc_pd(&self) -> io::Result<MockPd> {
        let id = self.pds_allocated.get();
        if self.pd_limit.get().is_some_and(|limit| id >= limit) {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "mock PD limit reached",
            ));
        }
        self.pds_allocated.set(id + 1);
        Ok(MockPd { id })
    }

    fn create_rc_qp(&self, pd: &MockPd, config: &RcConnectConfig) -> io::Result<MockQp> {
        if config.max_send_wr == 0 || config.max_recv_wr == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "QP capabilities must be non-zero",
            ));
        }
        let created = self.qps_created.get();
        if self.qp_limit.get().is_some_and(|limit| created >= limit) {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "mock QP limit reached",
            ));
        }
        self.qps_created.set(created + 1);
        let qpn = self.next_qpn.get();
        self.next_qpn.set(qpn + 1);
        Ok(MockQp {
            qpn,
            pd_id: pd.id,
            state: Cell::new(QpTransportState::Reset),
            remote_qpn: Cell::new(None),
        })
    }

    fn set_up_rc_qp(
        &self,
        local: &MockQp,
        remote: &MockQp,
        port: &PortGid,
        _config: &StressConfig,
    ) -> io::Result<()> {
        if local.state.get() != QpTransportState::Reset {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "QP must be in RESET state",
            ));
        }
        if port.port_num != self.port.port_num {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "port does not belong to this device",
            ));
        }
        local.state.set(QpTransportState::Init);
        if self.failing_qpns.borrow().contains(&local.qpn) {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "mock RTR transition rejected",
            ));
        }
        local.remote_qpn.set(Some(remote.qpn));
        local.state.set(QpTransportState::Rtr);
        local.state.set(QpTransportState::Rts);
        Ok(())
    }
}

/// Latency measurement that records every forwarded call.
#[derive(Debug, Default)]
pub struct RecordingLatency {
    pub configured: Vec<OpType>,
    /// `(client_id, num_qps)` per collection.
    pub collected: Vec<(u32, u32)>,
    pub checks: usize,
}

impl LatencyMeasurement for RecordingLatency {
    fn configure_latency_measurements(&mut self, op_type: OpType) {
        self.configured.push(op_type);
    }

    fn collect_client_latency_stats<C: QpClient>(&mut self, client: &C) {
        self.collected.push((client.client_id(), client.num_qps()));
    }

    fn check_latencies(&mut self) {
        self.checks += 1;
    }
}
