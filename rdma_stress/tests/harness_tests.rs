//! End-to-end harness behaviour against the mock transport.

mod common;

use common::{mock_context, mock_fixture, CountingClient};

use rdma_stress::mock::RecordingLatency;
use rdma_stress::{
    connected_count, create_and_connect_n, halt, pair_and_connect, poll_and_ack_async_events,
    AsyncEventType, Client, DrainConfig, DrainOutcome, OpType, QpClient, QpHandle,
    QpTransportState, StatusCode, StressConfig, StressFixture, VerbsDevice,
};

#[test]
fn test_pairing_is_symmetric_for_every_valid_pair() {
    let ctx = mock_context();
    for local_id in 0..3 {
        for remote_id in 0..2 {
            let mut local = Client::new(&ctx, 10).unwrap();
            let mut remote = Client::new(&ctx, 20).unwrap();
            local.create_qps(3, true).unwrap();
            remote.create_qps(2, true).unwrap();

            pair_and_connect(&ctx, &mut local, local_id, &mut remote, remote_id).unwrap();

            let l = local.qp_state(local_id).unwrap();
            let r = remote.qp_state(remote_id).unwrap();
            assert_eq!(l.remote(), Some(r.id()));
            assert_eq!(r.remote(), Some(l.id()));
            assert_eq!(l.qp().state(), QpTransportState::Rts);

            // No other record was touched.
            let linked = local.qps().filter(|q| q.remote().is_some()).count();
            assert_eq!(linked, 1);
        }
    }
}

#[test]
fn test_out_of_bounds_pairing_leaves_clients_untouched() {
    let ctx = mock_context();
    let mut local = Client::new(&ctx, 0).unwrap();
    let mut remote = Client::new(&ctx, 1).unwrap();
    local.create_qps(2, true).unwrap();
    remote.create_qps(2, true).unwrap();

    for (l, r) in [(2, 0), (0, 2), (u32::MAX, 0), (0, u32::MAX)] {
        let err = pair_and_connect(&ctx, &mut local, l, &mut remote, r).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
    }
    for client in [&local, &remote] {
        for qp in client.qps() {
            assert!(qp.remote().is_none());
            assert_eq!(qp.qp().state(), QpTransportState::Reset);
        }
    }
}

#[test]
fn test_empty_channel_issues_no_ack() {
    let ctx = mock_context();
    for _ in 0..10 {
        assert!(poll_and_ack_async_events(&ctx).is_ok());
    }
    assert_eq!(ctx.device().events_read(), 0);
    assert!(ctx.device().acked_events().is_empty());
}

#[test]
fn test_backlog_of_n_events_takes_n_calls() {
    for n in [1usize, 2, 7, 64] {
        let ctx = mock_context();
        for i in 0..n {
            let kind = if i % 2 == 0 {
                AsyncEventType::QpLastWqeReached
            } else {
                AsyncEventType::CommEst
            };
            ctx.device().inject_event(kind);
        }

        let mut calls = 0;
        while let Err(err) = poll_and_ack_async_events(&ctx) {
            assert!(err.async_event_type().is_some(), "unexpected fault: {err}");
            calls += 1;
            assert!(calls <= n, "drained more events than were queued");
        }
        assert_eq!(calls, n);

        let acked = ctx.device().acked_events();
        assert_eq!(acked, (0..n as u64).collect::<Vec<_>>());
        assert_eq!(ctx.device().unacked_events(), 0);
    }
}

#[test]
fn test_halt_dumps_once_and_terminates() {
    for backlog in [0usize, 1, 33, 500] {
        let ctx = mock_context();
        let client = CountingClient::new(Client::new(&ctx, 0).unwrap());
        for _ in 0..backlog {
            ctx.device().inject_event(AsyncEventType::PortActive);
        }

        let report = halt(&ctx, &client, &DrainConfig::unbounded());
        assert_eq!(client.dumps(), 1);
        assert_eq!(report.outcome, DrainOutcome::Empty);
        assert_eq!(report.faults.len(), backlog);
        assert_eq!(report.iterations, backlog + 1);
        assert_eq!(ctx.device().queued_events(), 0);
    }
}

#[test]
fn test_halt_with_default_bounds_stops_a_flood() {
    let ctx = mock_context();
    let client = CountingClient::new(Client::new(&ctx, 0).unwrap());
    for _ in 0..20 {
        ctx.device().inject_event(AsyncEventType::CqErr);
    }
    let limits = DrainConfig {
        max_events: Some(5),
        ..DrainConfig::default()
    };
    let report = halt(&ctx, &client, &limits);
    assert_eq!(client.dumps(), 1);
    assert_eq!(report.outcome, DrainOutcome::LimitReached);
    assert_eq!(report.faults.len(), 5);
    assert_eq!(ctx.device().queued_events(), 15);
    assert_eq!(ctx.device().unacked_events(), 0);
}

#[test]
fn test_create_and_connect_n_extends_from_existing_counts() {
    let ctx = mock_context();
    let mut initiator = Client::new(&ctx, 0).unwrap();
    let mut target = Client::new(&ctx, 1).unwrap();
    let n = 2;
    let k = 5;
    initiator.create_qps(n, true).unwrap();
    target.create_qps(n, true).unwrap();

    let outcomes = create_and_connect_n(&ctx, &mut initiator, &mut target, k).unwrap();
    assert_eq!(connected_count(&outcomes), k as usize);
    assert_eq!(initiator.num_qps(), n + k);
    assert_eq!(target.num_qps(), n + k);

    for i in 0..n {
        assert!(initiator.qp_state(i).unwrap().remote().is_none());
        assert!(target.qp_state(i).unwrap().remote().is_none());
    }
    for i in n..n + k {
        let a = initiator.qp_state(i).unwrap();
        let b = target.qp_state(i).unwrap();
        assert_eq!(a.remote(), Some(b.id()));
        assert_eq!(b.remote(), Some(a.id()));
        assert_eq!(a.qp().remote_qpn(), Some(b.qp().qpn()));
        assert_eq!(b.qp().remote_qpn(), Some(a.qp().qpn()));
    }
}

#[test]
fn test_fixture_run() {
    let fixture = mock_fixture();
    let mut initiator = CountingClient::new(fixture.new_client(0));
    let mut target = fixture.new_client(1);

    let outcomes = fixture
        .create_and_connect_n(&mut initiator, &mut target, 8)
        .unwrap();
    assert_eq!(connected_count(&outcomes), 8);

    initiator.inner.qp_state_mut(3).unwrap().track_posted();
    fixture
        .context()
        .device()
        .inject_event(AsyncEventType::QpFatal);

    let report = fixture.halt(&initiator);
    assert_eq!(initiator.dumps(), 1);
    assert!(report.is_drained());
    let events: Vec<_> = report.async_events().collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].async_event_type(), Some(AsyncEventType::QpFatal));
}

#[test]
fn test_fixture_from_toml_config() {
    common::init_test_logging();
    let config = StressConfig::from_toml_str(
        r#"
        device_name = "mock_1"

        [rc]
        max_send_wr = 32
        max_recv_wr = 32
        cq_depth = 64

        [drain]
        max_events = 2
        "#,
    )
    .unwrap();
    let fixture = StressFixture::with_latency(
        &rdma_stress::mock::MockProvider::new(),
        config,
        RecordingLatency::default(),
    );
    assert_eq!(fixture.context().device().name(), "mock_1");
    assert_eq!(fixture.port_gid().port_num, 1);

    let mut a = fixture.new_client(0);
    let mut b = fixture.new_client(1);
    fixture.create_and_connect_n(&mut a, &mut b, 1).unwrap();
    fixture.configure_latency_measurements(OpType::Read);
    fixture.collect_client_latency_stats(&a);
    fixture.check_latencies();
    assert_eq!(fixture.latency().collected, vec![(0, 1)]);

    for _ in 0..4 {
        fixture
            .context()
            .device()
            .inject_event(AsyncEventType::SrqLimitReached);
    }
    let report = fixture.halt(&a);
    assert_eq!(report.outcome, DrainOutcome::LimitReached);
    assert_eq!(report.faults.len(), 2);
}
