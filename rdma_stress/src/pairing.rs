//! RC queue-pair pairing.
//!
//! Pairing a QP means two things: cross-linking the two [`QpState`] records
//! and bringing the local QP to RTS against its peer. A connection is usable
//! only once both directions have been paired successfully.
//!
//! [`QpState`]: crate::client::QpState

use tracing::{error, info};

use crate::client::{QpClient, QpRef, QpState};
use crate::device::DeviceContext;
use crate::error::{Result, StressError};
use crate::provider::{QpHandle, VerbsDevice};

/// Result of pairing one index in both directions.
#[derive(Debug)]
pub struct PairOutcome {
    /// QP index on both clients.
    pub index: u32,
    pub initiator_to_target: Result<()>,
    pub target_to_initiator: Result<()>,
}

impl PairOutcome {
    /// Both legs of the handshake succeeded.
    pub fn is_connected(&self) -> bool {
        self.initiator_to_target.is_ok() && self.target_to_initiator.is_ok()
    }
}

/// Number of fully connected pairs in a batch.
pub fn connected_count(outcomes: &[PairOutcome]) -> usize {
    outcomes.iter().filter(|o| o.is_connected()).count()
}

fn lookup<C: QpClient>(client: &C, qp_id: u32) -> Result<&QpState<C::Qp>> {
    client.qp_state(qp_id).ok_or_else(|| {
        StressError::InvalidArgument(format!(
            "QP {qp_id} does not exist on Client{}",
            client.client_id()
        ))
    })
}

fn abort_on_create_failure(client_id: u32, e: StressError) -> ! {
    error!(client_id, error = %e, "QP creation failed");
    panic!("failed to create RC QP on Client{client_id}: {e}");
}

/// Link `local[local_qp_id]` with `remote[remote_qp_id]` and bring the local
/// QP to RTS against the remote one.
///
/// The linkage is recorded on both records before the handshake runs and is
/// left in place if the handshake fails; the returned result is what decides
/// whether the QP is usable.
///
/// Records are keyed by [`QpRef`], so the two clients must carry distinct
/// client ids.
///
/// # Errors
/// `InvalidArgument` if both clients report the same client id or if either
/// QP id is not below its client's QP count (nothing is modified in either
/// case), `Handshake` if the provider rejects a transition.
pub fn pair_and_connect<D, L, R>(
    ctx: &DeviceContext<D>,
    local: &mut L,
    local_qp_id: u32,
    remote: &mut R,
    remote_qp_id: u32,
) -> Result<()>
where
    D: VerbsDevice,
    L: QpClient<Qp = D::Qp>,
    R: QpClient<Qp = D::Qp>,
{
    if local.client_id() == remote.client_id() {
        return Err(StressError::InvalidArgument(format!(
            "cannot pair two clients that share id {}; client ids must be unique",
            local.client_id()
        )));
    }
    if local_qp_id >= local.num_qps() || remote_qp_id >= remote.num_qps() {
        return Err(StressError::InvalidArgument(format!(
            "Please create qps before setting up the connection! \
             (local Client{} QP {local_qp_id} of {}, remote Client{} QP {remote_qp_id} of {})",
            local.client_id(),
            local.num_qps(),
            remote.client_id(),
            remote.num_qps()
        )));
    }

    let local_ref = QpRef {
        client_id: local.client_id(),
        qp_id: local_qp_id,
    };
    let remote_ref = QpRef {
        client_id: remote.client_id(),
        qp_id: remote_qp_id,
    };
    if let Some(state) = local.qp_state_mut(local_qp_id) {
        state.set_remote_qp_state(remote_ref);
    }
    if let Some(state) = remote.qp_state_mut(remote_qp_id) {
        state.set_remote_qp_state(local_ref);
    }

    let local_qp = lookup(&*local, local_qp_id)?.qp();
    let remote_qp = lookup(&*remote, remote_qp_id)?.qp();
    ctx.device()
        .set_up_rc_qp(local_qp, remote_qp, ctx.port_gid(), ctx.config())
        .map_err(|source| StressError::Handshake {
            local_qpn: local_qp.qpn(),
            remote_qpn: remote_qp.qpn(),
            source,
        })?;

    info!(
        "Connect local Client{}, QP (id): {}, to remote Client{} QP (id): {}",
        local_ref.client_id, local_qp_id, remote_ref.client_id, remote_qp_id
    );
    Ok(())
}

/// Create `qps_per_client` new QPs on each client and pair them index by
/// index, in both directions.
///
/// Individual pairing failures are logged and reported in the returned
/// outcomes; they do not stop the batch.
///
/// # Errors
/// `FailedPrecondition` if the clients do not start with the same QP count.
///
/// # Panics
/// Panics if the provider fails to create a QP.
pub fn create_and_connect_n<D, I, T>(
    ctx: &DeviceContext<D>,
    initiator: &mut I,
    target: &mut T,
    qps_per_client: u32,
) -> Result<Vec<PairOutcome>>
where
    D: VerbsDevice,
    I: QpClient<Qp = D::Qp>,
    T: QpClient<Qp = D::Qp>,
{
    if initiator.num_qps() != target.num_qps() {
        return Err(StressError::FailedPrecondition(format!(
            "Client{} has {} QPs but Client{} has {}",
            initiator.client_id(),
            initiator.num_qps(),
            target.client_id(),
            target.num_qps()
        )));
    }

    let start = initiator.num_qps();
    let mut outcomes = Vec::with_capacity(qps_per_client as usize);
    for qp_id in start..start + qps_per_client {
        if let Err(e) = initiator.create_qps(1, true) {
            abort_on_create_failure(initiator.client_id(), e);
        }
        if let Err(e) = target.create_qps(1, true) {
            abort_on_create_failure(target.client_id(), e);
        }

        let initiator_to_target = pair_and_connect(ctx, initiator, qp_id, target, qp_id);
        if let Err(e) = &initiator_to_target {
            error!(qp_id, direction = "initiator->target", error = %e, "pairing failed");
        }
        let target_to_initiator = pair_and_connect(ctx, target, qp_id, initiator, qp_id);
        if let Err(e) = &target_to_initiator {
            error!(qp_id, direction = "target->initiator", error = %e, "pairing failed");
        }
        outcomes.push(PairOutcome {
            index: qp_id,
            initiator_to_target,
            target_to_initiator,
        });
    }

    info!(
        "Successfully created {} new qps per client. Total qps: {}",
        initiator.num_qps() - start,
        initiator.num_qps() + target.num_qps()
    );
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::config::StressConfig;
    use crate::error::StatusCode;
    use crate::mock::{MockDevice, MockProvider};
    use crate::provider::QpTransportState;

    fn open() -> DeviceContext<MockDevice> {
        DeviceContext::open(&MockProvider::new(), StressConfig::default()).unwrap()
    }

    #[test]
    fn test_pair_links_both_records() {
        let ctx = open();
        let mut a = Client::new(&ctx, 0).unwrap();
        let mut b = Client::new(&ctx, 1).unwrap();
        a.create_qps(2, true).unwrap();
        b.create_qps(3, true).unwrap();

        pair_and_connect(&ctx, &mut a, 1, &mut b, 2).unwrap();

        let a1 = a.qp_state(1).unwrap();
        let b2 = b.qp_state(2).unwrap();
        assert_eq!(a1.remote(), Some(b2.id()));
        assert_eq!(b2.remote(), Some(a1.id()));
        assert_eq!(a1.qp().state(), QpTransportState::Rts);
        assert_eq!(a1.qp().remote_qpn(), Some(b2.qp().qpn()));
        // Only the local leg is brought up.
        assert_eq!(b2.qp().state(), QpTransportState::Reset);
    }

    #[test]
    fn test_out_of_bounds_mutates_nothing() {
        let ctx = open();
        let mut a = Client::new(&ctx, 0).unwrap();
        let mut b = Client::new(&ctx, 1).unwrap();
        a.create_qps(1, true).unwrap();
        b.create_qps(1, true).unwrap();

        for (local_id, remote_id) in [(1, 0), (0, 1), (5, 5)] {
            let err = pair_and_connect(&ctx, &mut a, local_id, &mut b, remote_id).unwrap_err();
            assert_eq!(err.code(), StatusCode::InvalidArgument);
        }
        assert!(a.qp_state(0).unwrap().remote().is_none());
        assert!(b.qp_state(0).unwrap().remote().is_none());
        assert_eq!(a.qp_state(0).unwrap().qp().state(), QpTransportState::Reset);
    }

    #[test]
    fn test_handshake_failure_keeps_linkage() {
        let ctx = open();
        let mut a = Client::new(&ctx, 0).unwrap();
        let mut b = Client::new(&ctx, 1).unwrap();
        a.create_qps(1, true).unwrap();
        b.create_qps(1, true).unwrap();
        ctx.device().fail_handshake_for(a.qp_state(0).unwrap().qp().qpn());

        let err = pair_and_connect(&ctx, &mut a, 0, &mut b, 0).unwrap_err();
        assert!(matches!(err, StressError::Handshake { .. }));
        assert_eq!(err.code(), StatusCode::Internal);
        assert_eq!(a.qp_state(0).unwrap().remote(), Some(b.qp_state(0).unwrap().id()));
        assert_ne!(a.qp_state(0).unwrap().qp().state(), QpTransportState::Rts);
    }

    #[test]
    fn test_repairing_a_connected_qp_fails() {
        let ctx = open();
        let mut a = Client::new(&ctx, 0).unwrap();
        let mut b = Client::new(&ctx, 1).unwrap();
        a.create_qps(1, true).unwrap();
        b.create_qps(1, true).unwrap();
        pair_and_connect(&ctx, &mut a, 0, &mut b, 0).unwrap();
        assert!(pair_and_connect(&ctx, &mut a, 0, &mut b, 0).is_err());
    }

    #[test]
    fn test_create_and_connect_n() {
        let ctx = open();
        let mut a = Client::new(&ctx, 0).unwrap();
        let mut b = Client::new(&ctx, 1).unwrap();
        let outcomes = create_and_connect_n(&ctx, &mut a, &mut b, 3).unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(connected_count(&outcomes), 3);
        assert_eq!(a.num_qps(), 3);
        assert_eq!(b.num_qps(), 3);

        // A second batch extends both clients from the same starting index.
        let outcomes = create_and_connect_n(&ctx, &mut a, &mut b, 2).unwrap();
        assert_eq!(outcomes.iter().map(|o| o.index).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(a.num_qps(), 5);
        for i in 0..5 {
            let qa = a.qp_state(i).unwrap();
            let qb = b.qp_state(i).unwrap();
            assert_eq!(qa.remote(), Some(qb.id()));
            assert_eq!(qb.remote(), Some(qa.id()));
            assert_eq!(qa.qp().state(), QpTransportState::Rts);
            assert_eq!(qb.qp().state(), QpTransportState::Rts);
        }
    }

    #[test]
    fn test_create_and_connect_n_requires_equal_counts() {
        let ctx = open();
        let mut a = Client::new(&ctx, 0).unwrap();
        let mut b = Client::new(&ctx, 1).unwrap();
        a.create_qps(1, true).unwrap();
        let err = create_and_connect_n(&ctx, &mut a, &mut b, 2).unwrap_err();
        assert_eq!(err.code(), StatusCode::FailedPrecondition);
        assert_eq!(a.num_qps(), 1);
        assert_eq!(b.num_qps(), 0);
    }

    #[test]
    fn test_create_and_connect_n_continues_past_failures() {
        let ctx = open();
        let mut a = Client::new(&ctx, 0).unwrap();
        let mut b = Client::new(&ctx, 1).unwrap();
        // Mock QPNs are handed out sequentially; index 1 of the target gets
        // the fourth QPN created by the device.
        let first_qpn = ctx.device().next_qpn();
        ctx.device().fail_handshake_for(first_qpn + 3);

        let outcomes = create_and_connect_n(&ctx, &mut a, &mut b, 3).unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(connected_count(&outcomes), 2);
        assert!(outcomes[1].initiator_to_target.is_ok());
        assert!(outcomes[1].target_to_initiator.is_err());
        assert!(!outcomes[1].is_connected());
        assert_eq!(a.num_qps(), 3);
        assert_eq!(b.num_qps(), 3);
    }

    #[test]
    fn test_shared_client_id_still_grows_both_clients() {
        let ctx = open();
        let mut a = Client::new(&ctx, 7).unwrap();
        let mut b = Client::new(&ctx, 7).unwrap();

        let outcomes = create_and_connect_n(&ctx, &mut a, &mut b, 2).unwrap();
        assert_eq!(a.num_qps(), 2);
        assert_eq!(b.num_qps(), 2);
        assert_eq!(connected_count(&outcomes), 0);
        for outcome in &outcomes {
            let err = outcome.initiator_to_target.as_ref().unwrap_err();
            assert_eq!(err.code(), StatusCode::InvalidArgument);
            assert!(err.to_string().contains("client ids must be unique"));
        }
        for i in 0..2 {
            assert!(a.qp_state(i).unwrap().remote().is_none());
            assert!(b.qp_state(i).unwrap().remote().is_none());
        }
    }

    #[test]
    #[should_panic(expected = "failed to create RC QP")]
    fn test_create_and_connect_n_aborts_on_qp_exhaustion() {
        let ctx = open();
        ctx.device().set_qp_limit(3);
        let mut a = Client::new(&ctx, 0).unwrap();
        let mut b = Client::new(&ctx, 1).unwrap();
        let _ = create_and_connect_n(&ctx, &mut a, &mut b, 2);
    }
}
