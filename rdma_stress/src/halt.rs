//! Halt/drain sequencing at the end of a stress run.

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::client::QpClient;
use crate::config::DrainConfig;
use crate::device::DeviceContext;
use crate::error::StressError;
use crate::monitor::poll_and_ack_async_events;
use crate::provider::VerbsDevice;

/// How a drain loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The monitor reported an empty event queue.
    Empty,
    /// `max_events` or `timeout_ms` was hit before the queue emptied.
    LimitReached,
}

#[derive(Debug)]
pub struct HaltReport {
    pub outcome: DrainOutcome,
    /// Every failure returned by the monitor, in drain order.
    pub faults: Vec<StressError>,
    /// Number of monitor calls made, including the final one.
    pub iterations: usize,
}

impl HaltReport {
    pub fn is_drained(&self) -> bool {
        self.outcome == DrainOutcome::Empty
    }

    /// Faults that carried a hardware event (as opposed to poll/read failures).
    pub fn async_events(&self) -> impl Iterator<Item = &StressError> {
        self.faults
            .iter()
            .filter(|f| f.async_event_type().is_some())
    }
}

/// Dump `client`'s in-flight operations, then drain the async event queue.
///
/// The dump happens exactly once, before the event channel is touched. Each
/// drained fault is logged. With [`DrainConfig::unbounded`] this only returns
/// once the queue is empty.
pub fn halt<D, C>(ctx: &DeviceContext<D>, client: &C, limits: &DrainConfig) -> HaltReport
where
    D: VerbsDevice,
    C: QpClient,
{
    client.dump_pending_ops();

    let deadline = limits
        .timeout_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));
    let mut faults = Vec::new();
    let mut iterations = 0;
    loop {
        iterations += 1;
        match poll_and_ack_async_events(ctx) {
            Ok(()) => {
                info!(
                    client_id = client.client_id(),
                    drained = faults.len(),
                    "async event queue drained"
                );
                return HaltReport {
                    outcome: DrainOutcome::Empty,
                    faults,
                    iterations,
                };
            }
            Err(fault) => {
                error!("{fault}");
                faults.push(fault);
            }
        }

        let over_count = limits.max_events.is_some_and(|max| faults.len() >= max);
        let over_time = deadline.is_some_and(|d| Instant::now() >= d);
        if over_count || over_time {
            warn!(
                client_id = client.client_id(),
                drained = faults.len(),
                over_count,
                over_time,
                "stopping async event drain before the queue emptied"
            );
            return HaltReport {
                outcome: DrainOutcome::LimitReached,
                faults,
                iterations,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::config::StressConfig;
    use crate::event::AsyncEventType;
    use crate::mock::{MockDevice, MockProvider};

    fn open() -> DeviceContext<MockDevice> {
        DeviceContext::open(&MockProvider::new(), StressConfig::default()).unwrap()
    }

    #[test]
    fn test_halt_on_empty_queue() {
        let ctx = open();
        let client = Client::new(&ctx, 0).unwrap();
        let report = halt(&ctx, &client, &DrainConfig::unbounded());
        assert!(report.is_drained());
        assert!(report.faults.is_empty());
        assert_eq!(report.iterations, 1);
    }

    #[test]
    fn test_halt_drains_backlog() {
        let ctx = open();
        let client = Client::new(&ctx, 0).unwrap();
        for _ in 0..5 {
            ctx.device().inject_event(AsyncEventType::CqErr);
        }
        ctx.device().inject_spurious_wakeup();

        let report = halt(&ctx, &client, &DrainConfig::unbounded());
        assert!(report.is_drained());
        assert_eq!(report.faults.len(), 6);
        assert_eq!(report.async_events().count(), 5);
        assert_eq!(report.iterations, 7);
        assert_eq!(ctx.device().acked_events().len(), 5);
        assert_eq!(ctx.device().unacked_events(), 0);
    }

    #[test]
    fn test_halt_stops_at_event_limit() {
        let ctx = open();
        let client = Client::new(&ctx, 0).unwrap();
        for _ in 0..10 {
            ctx.device().inject_event(AsyncEventType::SrqLimitReached);
        }
        let limits = DrainConfig {
            max_events: Some(4),
            timeout_ms: None,
        };

        let report = halt(&ctx, &client, &limits);
        assert_eq!(report.outcome, DrainOutcome::LimitReached);
        assert_eq!(report.faults.len(), 4);
        assert_eq!(ctx.device().acked_events().len(), 4);

        // The rest is still queued and drains on the next halt.
        let report = halt(&ctx, &client, &DrainConfig::unbounded());
        assert!(report.is_drained());
        assert_eq!(report.faults.len(), 6);
    }

    #[test]
    fn test_halt_stops_at_deadline() {
        let ctx = open();
        let client = Client::new(&ctx, 0).unwrap();
        for _ in 0..3 {
            ctx.device().inject_event(AsyncEventType::PortErr);
        }
        let limits = DrainConfig {
            max_events: None,
            timeout_ms: Some(0),
        };
        let report = halt(&ctx, &client, &limits);
        assert_eq!(report.outcome, DrainOutcome::LimitReached);
        assert_eq!(report.faults.len(), 1);
    }
}
