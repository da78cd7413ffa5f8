//! Test clients and their per-QP state.
//!
//! A client owns an append-only list of [`QpState`] records indexed from 0.
//! Pairing links two records through [`QpRef`] keys rather than pointers, so
//! neither record owns its peer.

use tracing::{debug, info, warn};

use crate::device::DeviceContext;
use crate::error::{Result, StressError};
use crate::provider::{QpHandle, VerbsDevice};

/// Lookup key of a QP record: which client, which index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QpRef {
    pub client_id: u32,
    pub qp_id: u32,
}

impl std::fmt::Display for QpRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Client{}/QP{}", self.client_id, self.qp_id)
    }
}

/// Per-QP record held by a client.
pub struct QpState<Q> {
    id: QpRef,
    qp: Q,
    remote: Option<QpRef>,
    posted: u64,
    completed: u64,
}

impl<Q: QpHandle> QpState<Q> {
    pub fn new(id: QpRef, qp: Q) -> Self {
        Self {
            id,
            qp,
            remote: None,
            posted: 0,
            completed: 0,
        }
    }

    pub fn id(&self) -> QpRef {
        self.id
    }

    /// The underlying queue pair.
    pub fn qp(&self) -> &Q {
        &self.qp
    }

    /// The paired remote record, if pairing has been attempted.
    pub fn remote(&self) -> Option<QpRef> {
        self.remote
    }

    /// Overwrites any previous linkage.
    pub fn set_remote_qp_state(&mut self, remote: QpRef) {
        self.remote = Some(remote);
    }

    /// Record that an operation was posted on this QP.
    pub fn track_posted(&mut self) {
        self.posted += 1;
    }

    /// Record that a previously posted operation completed.
    ///
    /// A completion with nothing in flight is logged and ignored.
    pub fn track_completed(&mut self) {
        if self.completed >= self.posted {
            warn!(id = %self.id, "completion without a matching post");
            return;
        }
        self.completed += 1;
    }

    /// Operations posted but not yet completed.
    pub fn in_flight(&self) -> u64 {
        self.posted.saturating_sub(self.completed)
    }
}

impl<Q: QpHandle> std::fmt::Display for QpState<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} qpn=0x{:x} state={:?} remote=",
            self.id,
            self.qp.qpn(),
            self.qp.state()
        )?;
        match self.remote {
            Some(remote) => write!(f, "{remote}")?,
            None => f.write_str("none")?,
        }
        write!(
            f,
            " posted={} completed={} in_flight={}",
            self.posted,
            self.completed,
            self.in_flight()
        )
    }
}

/// Capabilities the harness needs from a test client.
pub trait QpClient {
    type Qp: QpHandle;

    fn client_id(&self) -> u32;

    fn num_qps(&self) -> u32;

    fn qp_state(&self, qp_id: u32) -> Option<&QpState<Self::Qp>>;

    fn qp_state_mut(&mut self, qp_id: u32) -> Option<&mut QpState<Self::Qp>>;

    /// Append `count` new QPs.
    fn create_qps(&mut self, count: u32, is_rc: bool) -> Result<()>;

    /// Log the operations currently in flight.
    fn dump_pending_ops(&self);
}

/// Client creating RC QPs on a shared device context.
///
/// Field order matters for drop order: QPs are destroyed before the PD
/// they were created in.
pub struct Client<'ctx, D: VerbsDevice> {
    qps: Vec<QpState<D::Qp>>,
    pd: D::Pd,
    client_id: u32,
    ctx: &'ctx DeviceContext<D>,
}

impl<'ctx, D: VerbsDevice> Client<'ctx, D> {
    /// Create a client with its own protection domain.
    pub fn new(ctx: &'ctx DeviceContext<D>, client_id: u32) -> Result<Self> {
        let pd = ctx
            .alloc_pd()
            .map_err(|e| StressError::provider("allocate PD", e))?;
        Ok(Self::with_pd(ctx, client_id, pd))
    }

    pub fn with_pd(ctx: &'ctx DeviceContext<D>, client_id: u32, pd: D::Pd) -> Self {
        Self {
            qps: Vec::new(),
            pd,
            client_id,
            ctx,
        }
    }

    pub fn pd(&self) -> &D::Pd {
        &self.pd
    }

    pub fn qps(&self) -> impl Iterator<Item = &QpState<D::Qp>> {
        self.qps.iter()
    }
}

impl<D: VerbsDevice> QpClient for Client<'_, D> {
    type Qp = D::Qp;

    fn client_id(&self) -> u32 {
        self.client_id
    }

    fn num_qps(&self) -> u32 {
        self.qps.len() as u32
    }

    fn qp_state(&self, qp_id: u32) -> Option<&QpState<D::Qp>> {
        self.qps.get(qp_id as usize)
    }

    fn qp_state_mut(&mut self, qp_id: u32) -> Option<&mut QpState<D::Qp>> {
        self.qps.get_mut(qp_id as usize)
    }

    fn create_qps(&mut self, count: u32, is_rc: bool) -> Result<()> {
        if !is_rc {
            return Err(StressError::InvalidArgument(
                "only RC queue pairs are supported".into(),
            ));
        }
        for _ in 0..count {
            let qp = self
                .ctx
                .device()
                .create_rc_qp(&self.pd, &self.ctx.config().rc)
                .map_err(|e| StressError::provider("create RC QP", e))?;
            let id = QpRef {
                client_id: self.client_id,
                qp_id: self.num_qps(),
            };
            debug!(%id, qpn = qp.qpn(), "created RC QP");
            self.qps.push(QpState::new(id, qp));
        }
        Ok(())
    }

    fn dump_pending_ops(&self) {
        let mut total = 0;
        for qp in self.qps.iter().filter(|qp| qp.in_flight() > 0) {
            total += qp.in_flight();
            info!(client_id = self.client_id, "pending: {qp}");
        }
        info!(
            client_id = self.client_id,
            qps = self.qps.len(),
            in_flight = total,
            "pending operations dump"
        );
    }
}
