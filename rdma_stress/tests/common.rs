//! Common test utilities for rdma_stress integration tests.
#![allow(dead_code)]

use std::cell::Cell;

use rdma_stress::mock::{MockDevice, MockProvider};
use rdma_stress::{
    Client, DeviceContext, QpClient, QpState, StressConfig, StressFixture, VerbsDevice,
};

pub fn init_test_logging() {
    rdma_stress::init_test_logging();
}

/// Config whose halt drain is unbounded, matching a plain drain-to-empty loop.
pub fn unbounded_config() -> StressConfig {
    StressConfig {
        drain: rdma_stress::DrainConfig::unbounded(),
        ..StressConfig::default()
    }
}

pub fn mock_fixture() -> StressFixture<MockDevice> {
    init_test_logging();
    StressFixture::new(&MockProvider::new(), unbounded_config())
}

pub fn mock_context() -> DeviceContext<MockDevice> {
    init_test_logging();
    DeviceContext::open(&MockProvider::new(), unbounded_config())
        .unwrap_or_else(|e| panic!("mock device open failed: {e}"))
}

/// Client wrapper counting how often its pending operations were dumped.
pub struct CountingClient<'ctx, D: VerbsDevice> {
    pub inner: Client<'ctx, D>,
    dumps: Cell<usize>,
}

impl<'ctx, D: VerbsDevice> CountingClient<'ctx, D> {
    pub fn new(inner: Client<'ctx, D>) -> Self {
        Self {
            inner,
            dumps: Cell::new(0),
        }
    }

    pub fn dumps(&self) -> usize {
        self.dumps.get()
    }
}

impl<D: VerbsDevice> QpClient for CountingClient<'_, D> {
    type Qp = D::Qp;

    fn client_id(&self) -> u32 {
        self.inner.client_id()
    }

    fn num_qps(&self) -> u32 {
        self.inner.num_qps()
    }

    fn qp_state(&self, qp_id: u32) -> Option<&QpState<D::Qp>> {
        self.inner.qp_state(qp_id)
    }

    fn qp_state_mut(&mut self, qp_id: u32) -> Option<&mut QpState<D::Qp>> {
        self.inner.qp_state_mut(qp_id)
    }

    fn create_qps(&mut self, count: u32, is_rc: bool) -> rdma_stress::Result<()> {
        self.inner.create_qps(count, is_rc)
    }

    fn dump_pending_ops(&self) {
        self.dumps.set(self.dumps.get() + 1);
        self.inner.dump_pending_ops();
    }
}

/// Skip test if no RDMA device is available.
#[cfg(feature = "verbs")]
#[macro_export]
macro_rules! require_device {
    () => {{
        match rdma_stress::DeviceContext::open(
            &rdma_stress::verbs::VerbsProvider,
            rdma_stress::StressConfig::default(),
        ) {
            Ok(ctx) => ctx,
            Err(e) => {
                eprintln!("Skipping test: no RDMA device available ({e})");
                return;
            }
        }
    }};
}
