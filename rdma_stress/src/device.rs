//! Device context initialization and resource allocation.
//!
//! A [`DeviceContext`] is the harness's single opened device. It is acquired
//! once, lives as long as the harness, and closes the device when dropped.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, info};

use crate::config::StressConfig;
use crate::error::{Result, StressError};
use crate::provider::{PortGid, Provider, VerbsDevice};

/// Opened device, its local port address, and the async fd blocking mode.
pub struct DeviceContext<D: VerbsDevice> {
    device: D,
    port: PortGid,
    nonblocking: bool,
    config: StressConfig,
}

/// Retry `f` while it fails with `EINTR`.
pub(crate) fn retry_eintr<T>(mut f: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Switch `fd` to non-blocking mode.
pub(crate) fn set_nonblocking(fd: BorrowedFd<'_>) -> nix::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = retry_eintr(|| fcntl(raw, FcntlArg::F_GETFL))?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    retry_eintr(|| fcntl(raw, FcntlArg::F_SETFL(flags)))?;
    Ok(())
}

/// Zero-timeout `POLLIN` check on `fd`.
pub(crate) fn poll_readable(fd: BorrowedFd<'_>) -> nix::Result<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    let ready = retry_eintr(|| poll(&mut fds, PollTimeout::ZERO))?;
    Ok(ready > 0)
}

impl<D: VerbsDevice> DeviceContext<D> {
    /// Open the configured device and prepare its async event channel.
    ///
    /// Failing to switch the async fd to non-blocking mode is not an error:
    /// the context is returned in blocking mode and the condition is logged.
    ///
    /// # Errors
    /// `StressError::NoDevice` if the provider has no matching device, or a
    /// provider error if the port address cannot be resolved.
    pub fn open<P>(provider: &P, config: StressConfig) -> Result<Self>
    where
        P: Provider<Device = D>,
    {
        let device = provider
            .open_device(config.device_name.as_deref())
            .map_err(StressError::NoDevice)?;
        let port = device
            .query_port_gid(config.port_num, config.gid_index)
            .map_err(|e| StressError::provider("query port gid", e))?;
        info!(device = device.name(), %port, "opened RDMA device");

        debug!("Allow getting asynchronous events in nonblocking mode.");
        let nonblocking = match device.set_async_fd_nonblocking() {
            Ok(()) => true,
            Err(errno) => {
                error!(
                    device = device.name(),
                    %errno,
                    "Failed switching the async event fd to nonblocking mode. \
                     Calls to poll_and_ack_async_events will remain blocking."
                );
                false
            }
        };

        Ok(Self {
            device,
            port,
            nonblocking,
            config,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn port_gid(&self) -> &PortGid {
        &self.port
    }

    pub fn config(&self) -> &StressConfig {
        &self.config
    }

    /// Whether the async event fd was switched to non-blocking mode.
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// Allocate a protection domain on this device.
    pub fn alloc_pd(&self) -> io::Result<D::Pd> {
        self.device.alloc_pd()
    }

    /// Allocate a protection domain, aborting the harness on failure.
    ///
    /// # Panics
    /// Panics if the provider cannot allocate a PD. PD exhaustion during a
    /// stress run is an environment fault, not a test outcome.
    pub fn alloc_pd_or_abort(&self) -> D::Pd {
        match self.device.alloc_pd() {
            Ok(pd) => pd,
            Err(e) => {
                error!(device = self.device.name(), error = %e, "PD allocation failed");
                panic!("failed to allocate PD on {}: {e}", self.device.name());
            }
        }
    }
}
