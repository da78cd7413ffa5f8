//! Transport-provider boundary.
//!
//! The harness never talks to libibverbs directly. It drives a [`Provider`]
//! that opens a [`VerbsDevice`], and the device exposes the handful of verbs
//! the harness needs: the async event fd, event read/acknowledge, PD and RC QP
//! allocation, and one leg of the RC handshake.
//!
//! Two implementations exist: `verbs` (feature `verbs`, backed by
//! `ibverbs-sys`) and `mock` (tests, feature `test-utils`).

use std::io;
use std::os::fd::BorrowedFd;

use crate::config::{RcConnectConfig, StressConfig};
use crate::event::AsyncEventType;

/// QP transport state as seen through the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpTransportState {
    Reset,
    Init,
    Rtr,
    Rts,
    Error,
}

/// Local port address resolved at device open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortGid {
    /// Port number (1-based).
    pub port_num: u8,
    /// GID table index the address was read from.
    pub gid_index: u8,
    /// Local Identifier (InfiniBand; 0 on RoCE).
    pub lid: u16,
    /// Global Identifier.
    pub gid: [u8; 16],
    /// Raw `ibv_mtu` value of the port's active MTU.
    pub active_mtu: u32,
}

impl std::fmt::Display for PortGid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, pair) in self.gid.chunks(2).enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        write!(f, " (port {}, lid 0x{:x})", self.port_num, self.lid)
    }
}

/// A queue pair handle owned by a client.
pub trait QpHandle {
    /// QP number.
    fn qpn(&self) -> u32;

    fn state(&self) -> QpTransportState;
}

/// An event read from the async event channel.
pub trait AsyncEventInfo {
    fn event_type(&self) -> AsyncEventType;
}

/// An opened device context.
pub trait VerbsDevice {
    type Pd;
    type Qp: QpHandle;
    type Event: AsyncEventInfo;

    /// Device name (e.g., "mlx5_0").
    fn name(&self) -> &str;

    /// The async event channel descriptor.
    fn async_fd(&self) -> BorrowedFd<'_>;

    fn query_port_gid(&self, port_num: u8, gid_index: u8) -> io::Result<PortGid>;

    /// Put the async event fd in non-blocking mode.
    fn set_async_fd_nonblocking(&self) -> nix::Result<()> {
        crate::device::set_nonblocking(self.async_fd())
    }

    /// Whether an async event is ready, without waiting.
    fn poll_async_fd(&self) -> nix::Result<bool> {
        crate::device::poll_readable(self.async_fd())
    }

    /// Read one async event. May block if the fd is in blocking mode.
    fn get_async_event(&self) -> io::Result<Self::Event>;

    /// Acknowledge an event previously returned by [`get_async_event`](Self::get_async_event).
    fn ack_async_event(&self, event: Self::Event);

    fn alloc_pd(&self) -> io::Result<Self::Pd>;

    fn create_rc_qp(&self, pd: &Self::Pd, config: &RcConnectConfig) -> io::Result<Self::Qp>;

    /// Drive `local` through RESET -> INIT -> RTR -> RTS targeting `remote`.
    ///
    /// Only `local` changes state. The handshake is complete for a pair once
    /// this has succeeded in both directions.
    fn set_up_rc_qp(
        &self,
        local: &Self::Qp,
        remote: &Self::Qp,
        port: &PortGid,
        config: &StressConfig,
    ) -> io::Result<()>;
}

/// Opens devices.
pub trait Provider {
    type Device: VerbsDevice;

    /// Open `name`, or the first available device when `name` is `None`.
    ///
    /// Returns `ErrorKind::NotFound` if no matching device exists.
    fn open_device(&self, name: Option<&str>) -> io::Result<Self::Device>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_gid_display() {
        let mut gid = [0u8; 16];
        gid[0] = 0xfe;
        gid[1] = 0x80;
        gid[15] = 0x01;
        let port = PortGid {
            port_num: 1,
            gid_index: 0,
            lid: 0x2a,
            gid,
            active_mtu: 5,
        };
        assert_eq!(
            port.to_string(),
            "fe80:0000:0000:0000:0000:0000:0000:0001 (port 1, lid 0x2a)"
        );
    }
}
