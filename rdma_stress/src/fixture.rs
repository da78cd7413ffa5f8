//! Stress-test fixture.
//!
//! Bundles the device context, pairing, fault monitoring and halt sequencing
//! behind one value a test constructs once and keeps for its whole run.
//!
//! ```ignore
//! let fixture = StressFixture::new(&VerbsProvider, StressConfig::default());
//! let mut initiator = fixture.new_client(0);
//! let mut target = fixture.new_client(1);
//! let outcomes = fixture.create_and_connect_n(&mut initiator, &mut target, 16)?;
//! assert_eq!(connected_count(&outcomes), 16);
//! // ... run traffic ...
//! let report = fixture.halt(&initiator);
//! assert!(report.faults.is_empty());
//! ```

use std::cell::{Ref, RefCell};

use tracing::debug;

use crate::client::{Client, QpClient};
use crate::config::StressConfig;
use crate::device::DeviceContext;
use crate::error::Result;
use crate::halt::{halt, HaltReport};
use crate::latency::{LatencyMeasurement, NoLatency, OpType};
use crate::monitor::poll_and_ack_async_events;
use crate::pairing::{create_and_connect_n, pair_and_connect, PairOutcome};
use crate::provider::{PortGid, Provider, VerbsDevice};

pub struct StressFixture<D: VerbsDevice, L: LatencyMeasurement = NoLatency> {
    latency: RefCell<L>,
    ctx: DeviceContext<D>,
}

impl<D: VerbsDevice> StressFixture<D, NoLatency> {
    /// Open the device without latency measurement.
    ///
    /// # Panics
    /// Panics if no device can be opened.
    pub fn new<P>(provider: &P, config: StressConfig) -> Self
    where
        P: Provider<Device = D>,
    {
        Self::with_latency(provider, config, NoLatency)
    }
}

impl<D: VerbsDevice, L: LatencyMeasurement> StressFixture<D, L> {
    /// # Panics
    /// Panics if no device can be opened. A stress test cannot run without one.
    pub fn with_latency<P>(provider: &P, config: StressConfig, latency: L) -> Self
    where
        P: Provider<Device = D>,
    {
        match Self::try_with_latency(provider, config, latency) {
            Ok(fixture) => fixture,
            Err(e) => panic!("cannot set up RDMA stress fixture: {e}"),
        }
    }

    pub fn try_with_latency<P>(provider: &P, config: StressConfig, latency: L) -> Result<Self>
    where
        P: Provider<Device = D>,
    {
        let ctx = DeviceContext::open(provider, config)?;
        Ok(Self {
            latency: RefCell::new(latency),
            ctx,
        })
    }

    pub fn context(&self) -> &DeviceContext<D> {
        &self.ctx
    }

    pub fn port_gid(&self) -> &PortGid {
        self.ctx.port_gid()
    }

    /// # Panics
    /// Panics if the PD cannot be allocated.
    pub fn new_pd(&self) -> D::Pd {
        self.ctx.alloc_pd_or_abort()
    }

    /// A client with a fresh PD and no QPs.
    ///
    /// # Panics
    /// Panics if the PD cannot be allocated.
    pub fn new_client(&self, client_id: u32) -> Client<'_, D> {
        Client::with_pd(&self.ctx, client_id, self.new_pd())
    }

    /// See [`pair_and_connect`](crate::pairing::pair_and_connect).
    pub fn pair_and_connect<A, B>(
        &self,
        local: &mut A,
        local_qp_id: u32,
        remote: &mut B,
        remote_qp_id: u32,
    ) -> Result<()>
    where
        A: QpClient<Qp = D::Qp>,
        B: QpClient<Qp = D::Qp>,
    {
        pair_and_connect(&self.ctx, local, local_qp_id, remote, remote_qp_id)
    }

    /// See [`create_and_connect_n`](crate::pairing::create_and_connect_n).
    pub fn create_and_connect_n<A, B>(
        &self,
        initiator: &mut A,
        target: &mut B,
        qps_per_client: u32,
    ) -> Result<Vec<PairOutcome>>
    where
        A: QpClient<Qp = D::Qp>,
        B: QpClient<Qp = D::Qp>,
    {
        create_and_connect_n(&self.ctx, initiator, target, qps_per_client)
    }

    pub fn poll_and_ack_async_events(&self) -> Result<()> {
        poll_and_ack_async_events(&self.ctx)
    }

    /// Halt using the configured drain limits.
    pub fn halt<C: QpClient>(&self, client: &C) -> HaltReport {
        halt(&self.ctx, client, &self.ctx.config().drain)
    }

    /// Log every QP record of `client`.
    pub fn dump_state<C: QpClient>(&self, client: &C) {
        for qp_id in 0..client.num_qps() {
            if let Some(qp) = client.qp_state(qp_id) {
                debug!("{qp}");
            }
        }
    }

    pub fn configure_latency_measurements(&self, op_type: OpType) {
        self.latency
            .borrow_mut()
            .configure_latency_measurements(op_type);
    }

    pub fn collect_client_latency_stats<C: QpClient>(&self, client: &C) {
        self.latency
            .borrow_mut()
            .collect_client_latency_stats(client);
    }

    pub fn check_latencies(&self) {
        self.latency.borrow_mut().check_latencies();
    }

    pub fn latency(&self) -> Ref<'_, L> {
        self.latency.borrow()
    }
}
