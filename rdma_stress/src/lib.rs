//! # rdma_stress - RDMA stress-test harness core
//!
//! Fault monitoring and RC queue-pair wiring for stress tests that run many
//! reliable-connected QPs on one device.
//!
//! ## Pieces
//!
//! - [`DeviceContext`]: the opened device, its port address, and the async
//!   event fd switched to non-blocking mode.
//! - [`poll_and_ack_async_events`]: drains at most one hardware async event per
//!   call and turns it into a [`StressError`].
//! - [`pair_and_connect`] / [`create_and_connect_n`]: link two clients' QP
//!   records and drive the RESET -> INIT -> RTR -> RTS handshake.
//! - [`halt`]: dump in-flight work once, then drain the event queue.
//! - [`StressFixture`]: all of the above behind one value.
//!
//! ## Transports
//!
//! The harness is generic over [`Provider`]. With the `verbs` feature,
//! [`verbs::VerbsProvider`] talks to libibverbs. With `test-utils` (always on
//! in this crate's tests), [`mock::MockProvider`] gives an in-process device
//! whose async fd is a real pipe.
//!
//! ```ignore
//! rdma_stress::init_logging("info")?;
//! let config = StressConfig::load("stress.toml")?;
//! let fixture = StressFixture::new(&VerbsProvider, config);
//! let mut initiator = fixture.new_client(0);
//! let mut target = fixture.new_client(1);
//! fixture.create_and_connect_n(&mut initiator, &mut target, 64)?;
//! ```

pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod fixture;
pub mod halt;
pub mod latency;
pub mod logging;
pub mod monitor;
pub mod pairing;
pub mod provider;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
#[cfg(feature = "verbs")]
pub mod verbs;

pub use client::{Client, QpClient, QpRef, QpState};
pub use config::{DrainConfig, RcConnectConfig, StressConfig};
pub use device::DeviceContext;
pub use error::{Result, StatusCode, StressError};
pub use event::{AsyncEventType, EventCategory};
pub use fixture::StressFixture;
pub use halt::{halt, DrainOutcome, HaltReport};
pub use latency::{LatencyMeasurement, NoLatency, OpType};
pub use logging::{init_logging, init_test_logging};
pub use monitor::poll_and_ack_async_events;
pub use pairing::{connected_count, create_and_connect_n, pair_and_connect, PairOutcome};
pub use provider::{AsyncEventInfo, PortGid, Provider, QpHandle, QpTransportState, VerbsDevice};
