//! Asynchronous event classification.
//!
//! Providers report async events with the numeric `ibv_event_type` tag. The
//! harness keeps the raw code for messages and derives a kind, a category and
//! a fatality flag from it so drained faults can be triaged from the log.

/// Resource class an async event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Qp,
    Cq,
    Srq,
    Port,
    Device,
    Unknown,
}

/// Async event type, mirroring `enum ibv_event_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsyncEventType {
    CqErr,
    QpFatal,
    QpReqErr,
    QpAccessErr,
    CommEst,
    SqDrained,
    PathMig,
    PathMigErr,
    DeviceFatal,
    PortActive,
    PortErr,
    LidChange,
    PkeyChange,
    SmChange,
    SrqErr,
    SrqLimitReached,
    QpLastWqeReached,
    ClientReregister,
    GidChange,
    WqFatal,
    Unknown(u32),
}

impl From<u32> for AsyncEventType {
    fn from(v: u32) -> Self {
        match v {
            0 => AsyncEventType::CqErr,
            1 => AsyncEventType::QpFatal,
            2 => AsyncEventType::QpReqErr,
            3 => AsyncEventType::QpAccessErr,
            4 => AsyncEventType::CommEst,
            5 => AsyncEventType::SqDrained,
            6 => AsyncEventType::PathMig,
            7 => AsyncEventType::PathMigErr,
            8 => AsyncEventType::DeviceFatal,
            9 => AsyncEventType::PortActive,
            10 => AsyncEventType::PortErr,
            11 => AsyncEventType::LidChange,
            12 => AsyncEventType::PkeyChange,
            13 => AsyncEventType::SmChange,
            14 => AsyncEventType::SrqErr,
            15 => AsyncEventType::SrqLimitReached,
            16 => AsyncEventType::QpLastWqeReached,
            17 => AsyncEventType::ClientReregister,
            18 => AsyncEventType::GidChange,
            19 => AsyncEventType::WqFatal,
            other => AsyncEventType::Unknown(other),
        }
    }
}

impl AsyncEventType {
    /// The provider's numeric tag.
    pub fn code(&self) -> u32 {
        match self {
            AsyncEventType::CqErr => 0,
            AsyncEventType::QpFatal => 1,
            AsyncEventType::QpReqErr => 2,
            AsyncEventType::QpAccessErr => 3,
            AsyncEventType::CommEst => 4,
            AsyncEventType::SqDrained => 5,
            AsyncEventType::PathMig => 6,
            AsyncEventType::PathMigErr => 7,
            AsyncEventType::DeviceFatal => 8,
            AsyncEventType::PortActive => 9,
            AsyncEventType::PortErr => 10,
            AsyncEventType::LidChange => 11,
            AsyncEventType::PkeyChange => 12,
            AsyncEventType::SmChange => 13,
            AsyncEventType::SrqErr => 14,
            AsyncEventType::SrqLimitReached => 15,
            AsyncEventType::QpLastWqeReached => 16,
            AsyncEventType::ClientReregister => 17,
            AsyncEventType::GidChange => 18,
            AsyncEventType::WqFatal => 19,
            AsyncEventType::Unknown(v) => *v,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AsyncEventType::CqErr => "IBV_EVENT_CQ_ERR",
            AsyncEventType::QpFatal => "IBV_EVENT_QP_FATAL",
            AsyncEventType::QpReqErr => "IBV_EVENT_QP_REQ_ERR",
            AsyncEventType::QpAccessErr => "IBV_EVENT_QP_ACCESS_ERR",
            AsyncEventType::CommEst => "IBV_EVENT_COMM_EST",
            AsyncEventType::SqDrained => "IBV_EVENT_SQ_DRAINED",
            AsyncEventType::PathMig => "IBV_EVENT_PATH_MIG",
            AsyncEventType::PathMigErr => "IBV_EVENT_PATH_MIG_ERR",
            AsyncEventType::DeviceFatal => "IBV_EVENT_DEVICE_FATAL",
            AsyncEventType::PortActive => "IBV_EVENT_PORT_ACTIVE",
            AsyncEventType::PortErr => "IBV_EVENT_PORT_ERR",
            AsyncEventType::LidChange => "IBV_EVENT_LID_CHANGE",
            AsyncEventType::PkeyChange => "IBV_EVENT_PKEY_CHANGE",
            AsyncEventType::SmChange => "IBV_EVENT_SM_CHANGE",
            AsyncEventType::SrqErr => "IBV_EVENT_SRQ_ERR",
            AsyncEventType::SrqLimitReached => "IBV_EVENT_SRQ_LIMIT_REACHED",
            AsyncEventType::QpLastWqeReached => "IBV_EVENT_QP_LAST_WQE_REACHED",
            AsyncEventType::ClientReregister => "IBV_EVENT_CLIENT_REREGISTER",
            AsyncEventType::GidChange => "IBV_EVENT_GID_CHANGE",
            AsyncEventType::WqFatal => "IBV_EVENT_WQ_FATAL",
            AsyncEventType::Unknown(_) => "IBV_EVENT_UNKNOWN",
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            AsyncEventType::CqErr => EventCategory::Cq,
            AsyncEventType::QpFatal
            | AsyncEventType::QpReqErr
            | AsyncEventType::QpAccessErr
            | AsyncEventType::CommEst
            | AsyncEventType::SqDrained
            | AsyncEventType::PathMig
            | AsyncEventType::PathMigErr
            | AsyncEventType::QpLastWqeReached
            | AsyncEventType::WqFatal => EventCategory::Qp,
            AsyncEventType::SrqErr | AsyncEventType::SrqLimitReached => EventCategory::Srq,
            AsyncEventType::PortActive
            | AsyncEventType::PortErr
            | AsyncEventType::LidChange
            | AsyncEventType::PkeyChange
            | AsyncEventType::SmChange
            | AsyncEventType::ClientReregister
            | AsyncEventType::GidChange => EventCategory::Port,
            AsyncEventType::DeviceFatal => EventCategory::Device,
            AsyncEventType::Unknown(_) => EventCategory::Unknown,
        }
    }

    /// Whether the event leaves the affected resource in an error state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AsyncEventType::CqErr
                | AsyncEventType::QpFatal
                | AsyncEventType::QpReqErr
                | AsyncEventType::QpAccessErr
                | AsyncEventType::PathMigErr
                | AsyncEventType::DeviceFatal
                | AsyncEventType::SrqErr
                | AsyncEventType::WqFatal
        )
    }
}

impl std::fmt::Display for AsyncEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
