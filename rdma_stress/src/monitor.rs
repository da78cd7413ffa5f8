//! Async fault monitor.
//!
//! One call drains at most one event from the device's async event channel:
//!
//! - nothing ready: `Ok(())`
//! - poll failed: `Err(PollFailed)`, nothing is read
//! - ready but the read found nothing: `Err(EventUnavailable)`
//! - event read: `Err(AsyncEvent)` carrying its type, after the event has
//!   been acknowledged
//!
//! Resources an unacknowledged event refers to cannot be destroyed, so every
//! event read here is acknowledged before the call returns.

use tracing::debug;

use crate::device::DeviceContext;
use crate::error::{Result, StressError};
use crate::event::AsyncEventType;
use crate::provider::{AsyncEventInfo, VerbsDevice};

/// An event that has been read but not yet acknowledged.
///
/// Acknowledges on drop.
struct PendingEvent<'a, D: VerbsDevice> {
    device: &'a D,
    event_type: AsyncEventType,
    event: Option<D::Event>,
}

impl<'a, D: VerbsDevice> PendingEvent<'a, D> {
    fn new(device: &'a D, event: D::Event) -> Self {
        Self {
            device,
            event_type: event.event_type(),
            event: Some(event),
        }
    }
}

impl<D: VerbsDevice> Drop for PendingEvent<'_, D> {
    fn drop(&mut self) {
        if let Some(event) = self.event.take() {
            self.device.ack_async_event(event);
        }
    }
}

/// Poll the async event fd without waiting and drain at most one event.
///
/// Draining a backlog of N events takes N calls. If the fd could not be put
/// in non-blocking mode, reading a ready event may block the caller.
pub fn poll_and_ack_async_events<D: VerbsDevice>(ctx: &DeviceContext<D>) -> Result<()> {
    let device = ctx.device();
    let ready = device
        .poll_async_fd()
        .map_err(|errno| StressError::PollFailed {
            errno: errno as i32,
        })?;
    if !ready {
        return Ok(());
    }

    let event = match device.get_async_event() {
        Ok(event) => event,
        Err(e) => {
            debug!(device = device.name(), error = %e, "async fd ready but no event read");
            return Err(StressError::EventUnavailable);
        }
    };

    let pending = PendingEvent::new(device, event);
    let event_type = pending.event_type;
    debug!(
        device = device.name(),
        event = %event_type,
        category = ?event_type.category(),
        fatal = event_type.is_fatal(),
        "acknowledging async event"
    );
    drop(pending);
    Err(StressError::AsyncEvent { event_type })
}
