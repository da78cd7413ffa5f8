//! Harness configuration.
//!
//! All fields have defaults, so an empty TOML document is a valid config.

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, StressError};

/// Top-level harness configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressConfig {
    /// Open this device instead of the first one listed.
    #[serde(default)]
    pub device_name: Option<String>,

    /// Port number (1-based).
    #[serde(default = "default_port_num")]
    pub port_num: u8,

    /// GID table index used as the local port address.
    #[serde(default)]
    pub gid_index: u8,

    #[serde(default)]
    pub rc: RcConnectConfig,

    #[serde(default)]
    pub drain: DrainConfig,
}

/// RC QP capabilities and connection attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RcConnectConfig {
    /// Maximum number of outstanding send WRs.
    #[serde(default = "default_max_wr")]
    pub max_send_wr: u32,
    /// Maximum number of outstanding receive WRs.
    #[serde(default = "default_max_wr")]
    pub max_recv_wr: u32,
    /// Maximum number of SGEs per send WR.
    #[serde(default = "default_max_sge")]
    pub max_send_sge: u32,
    /// Maximum number of SGEs per receive WR.
    #[serde(default = "default_max_sge")]
    pub max_recv_sge: u32,
    /// Maximum inline data size.
    #[serde(default = "default_max_inline_data")]
    pub max_inline_data: u32,
    /// Depth of the CQ created alongside each QP.
    #[serde(default = "default_cq_depth")]
    pub cq_depth: u32,
    /// Starting packet sequence number for both directions.
    #[serde(default)]
    pub psn: u32,
    /// QP timeout exponent. The actual timeout is `4.096us * 2^timeout`.
    #[serde(default = "default_timeout")]
    pub timeout: u8,
    /// Number of transport-level retries.
    #[serde(default = "default_retry_cnt")]
    pub retry_cnt: u8,
    /// Number of RNR retries (7 = infinite).
    #[serde(default = "default_rnr_retry")]
    pub rnr_retry: u8,
    #[serde(default = "default_min_rnr_timer")]
    pub min_rnr_timer: u8,
    /// Outstanding RDMA read / atomic operations as initiator.
    #[serde(default = "default_rd_atomic")]
    pub max_rd_atomic: u8,
    /// Outstanding RDMA read / atomic operations as responder.
    #[serde(default = "default_rd_atomic")]
    pub max_dest_rd_atomic: u8,
    #[serde(default = "default_hop_limit")]
    pub hop_limit: u8,
}

/// Bounds for the halt drain loop. `None` removes the bound.
///
/// In TOML a bound of `0` means `None`, so `max_events = 0` together with
/// `timeout_ms = 0` drains until the queue is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrainConfig {
    /// Maximum number of monitor calls that may return a fault.
    #[serde(
        default = "default_max_events",
        deserialize_with = "deserialize_bound",
        serialize_with = "serialize_bound"
    )]
    pub max_events: Option<usize>,
    /// Wall-clock budget for the whole drain, in milliseconds.
    #[serde(
        default = "default_drain_timeout_ms",
        deserialize_with = "deserialize_bound",
        serialize_with = "serialize_bound"
    )]
    pub timeout_ms: Option<u64>,
}

fn deserialize_bound<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default + PartialEq,
{
    let bound = T::deserialize(deserializer)?;
    Ok((bound != T::default()).then_some(bound))
}

fn serialize_bound<S, T>(bound: &Option<T>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize + Default,
{
    match bound {
        Some(bound) => bound.serialize(serializer),
        None => T::default().serialize(serializer),
    }
}

fn default_port_num() -> u8 {
    1
}
fn default_max_wr() -> u32 {
    256
}
fn default_max_sge() -> u32 {
    4
}
fn default_max_inline_data() -> u32 {
    64
}
fn default_cq_depth() -> u32 {
    256
}
fn default_timeout() -> u8 {
    14
}
fn default_retry_cnt() -> u8 {
    7
}
fn default_rnr_retry() -> u8 {
    7
}
fn default_min_rnr_timer() -> u8 {
    12
}
fn default_rd_atomic() -> u8 {
    4
}
fn default_hop_limit() -> u8 {
    64
}
fn default_max_events() -> Option<usize> {
    Some(4096)
}
fn default_drain_timeout_ms() -> Option<u64> {
    Some(30_000)
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            port_num: default_port_num(),
            gid_index: 0,
            rc: RcConnectConfig::default(),
            drain: DrainConfig::default(),
        }
    }
}

impl Default for RcConnectConfig {
    fn default() -> Self {
        Self {
            max_send_wr: default_max_wr(),
            max_recv_wr: default_max_wr(),
            max_send_sge: default_max_sge(),
            max_recv_sge: default_max_sge(),
            max_inline_data: default_max_inline_data(),
            cq_depth: default_cq_depth(),
            psn: 0,
            timeout: default_timeout(),
            retry_cnt: default_retry_cnt(),
            rnr_retry: default_rnr_retry(),
            min_rnr_timer: default_min_rnr_timer(),
            max_rd_atomic: default_rd_atomic(),
            max_dest_rd_atomic: default_rd_atomic(),
            hop_limit: default_hop_limit(),
        }
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl DrainConfig {
    /// No bound at all: drain until the event queue reports empty.
    pub fn unbounded() -> Self {
        Self {
            max_events: None,
            timeout_ms: None,
        }
    }
}

impl StressConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: StressConfig =
            toml::from_str(s).map_err(|e| StressError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| StressError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Apply command-line overrides and check the result again.
    pub fn with_overrides(
        mut self,
        device_name: Option<String>,
        port_num: Option<u8>,
    ) -> Result<Self> {
        if device_name.is_some() {
            self.device_name = device_name;
        }
        if let Some(port_num) = port_num {
            self.port_num = port_num;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port_num == 0 {
            return Err(StressError::Config("port_num is 1-based".into()));
        }
        if self.rc.max_send_wr == 0 || self.rc.max_recv_wr == 0 {
            return Err(StressError::Config(
                "max_send_wr and max_recv_wr must be non-zero".into(),
            ));
        }
        if self.rc.cq_depth < self.rc.max_send_wr.max(self.rc.max_recv_wr) {
            return Err(StressError::Config(format!(
                "cq_depth {} is smaller than the work request depth",
                self.rc.cq_depth
            )));
        }
        if self.rc.retry_cnt > 7 || self.rc.rnr_retry > 7 {
            return Err(StressError::Config(
                "retry_cnt and rnr_retry are 3-bit fields".into(),
            ));
        }
        Ok(())
    }
}
