//! Latency measurement collaborator.
//!
//! Statistic capture and validation live outside this crate; the fixture only
//! forwards to whatever [`LatencyMeasurement`] it was built with.

use crate::client::QpClient;

/// RDMA operation types a stress run can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Read,
    Write,
    Send,
    Recv,
    FetchAdd,
    CompSwap,
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpType::Read => write!(f, "READ"),
            OpType::Write => write!(f, "WRITE"),
            OpType::Send => write!(f, "SEND"),
            OpType::Recv => write!(f, "RECV"),
            OpType::FetchAdd => write!(f, "FETCH_ADD"),
            OpType::CompSwap => write!(f, "COMP_SWAP"),
        }
    }
}

pub trait LatencyMeasurement {
    /// Select which operation type subsequent collections apply to.
    fn configure_latency_measurements(&mut self, op_type: OpType);

    fn collect_client_latency_stats<C: QpClient>(&mut self, client: &C);

    /// Validate everything collected so far.
    fn check_latencies(&mut self);
}

/// Measurement that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLatency;

impl LatencyMeasurement for NoLatency {
    fn configure_latency_measurements(&mut self, _op_type: OpType) {}

    fn collect_client_latency_stats<C: QpClient>(&mut self, _client: &C) {}

    fn check_latencies(&mut self) {}
}
