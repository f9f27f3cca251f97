//! Endpoint and completion-queue configuration.
//!
//! Both structs deserialize with every field optional; missing fields take
//! the `Default` values.

use serde::Deserialize;
use tracing::warn;

use crate::completion::CqFormat;
use crate::error::{Error, Result};
use crate::index_list::NULL_INDEX;
use crate::msg::IOV_LIMIT;
use crate::protocol::{PacketType, CQ_DATA_HDR_LEN};

/// Largest ring a completion queue may be created with.
pub const MAX_CQ_SIZE: usize = 1 << 20;

/// Ring size used when `CqAttr::size` is zero.
pub const DEFAULT_CQ_SIZE: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Send entry pool size
    pub tx_capacity: u32,
    /// Receive entry pool size (posted, unexpected and consumer entries)
    pub rx_capacity: u32,
    pub tx_iov_limit: usize,
    pub rx_iov_limit: usize,
    /// Largest payload accepted by `inject*`
    pub inject_size: usize,
    /// Largest packet the fabric carries, headers included
    pub mtu_size: usize,
    /// A multi-recv buffer is retired once less than this remains
    pub min_multi_recv_size: usize,
    /// Sends at least this long use the read-based protocol when possible
    pub min_read_msg_size: usize,
    pub max_medium_msg_size: usize,
    /// Local RDMA read capability
    pub rdma_read: bool,
    /// A memory-registration cache is available
    pub mr_cache: bool,
    /// Receives with an address only match that peer
    pub directed_recv: bool,
    /// Receive completions carry the source address
    pub source: bool,
    /// Only operations flagged `COMPLETION` generate success completions
    pub selective_completion: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            tx_capacity: 1024,
            rx_capacity: 1024,
            tx_iov_limit: IOV_LIMIT,
            rx_iov_limit: IOV_LIMIT,
            inject_size: 4096,
            mtu_size: 8192,
            min_multi_recv_size: 16384,
            min_read_msg_size: 1 << 20,
            max_medium_msg_size: 65536,
            rdma_read: false,
            mr_cache: true,
            directed_recv: false,
            source: false,
            selective_completion: false,
        }
    }
}

impl EndpointConfig {
    /// Check the configuration for values the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        let largest_hdr = PacketType::DcMediumTagRtm.header_len() + CQ_DATA_HDR_LEN;

        let problem = if self.tx_capacity == 0 || self.tx_capacity >= NULL_INDEX {
            Some("tx_capacity")
        } else if self.rx_capacity == 0 || self.rx_capacity >= NULL_INDEX {
            Some("rx_capacity")
        } else if self.tx_iov_limit == 0 || self.tx_iov_limit > IOV_LIMIT {
            Some("tx_iov_limit")
        } else if self.rx_iov_limit == 0 || self.rx_iov_limit > IOV_LIMIT {
            Some("rx_iov_limit")
        } else if self.mtu_size <= largest_hdr {
            Some("mtu_size")
        } else if self.min_multi_recv_size == 0 {
            Some("min_multi_recv_size")
        } else {
            None
        };

        match problem {
            Some(field) => {
                warn!(field, "invalid endpoint configuration");
                Err(Error::InvalidArgument)
            }
            None => Ok(()),
        }
    }
}

/// Wait object attached to a completion queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitObj {
    /// Poll only; blocking reads are unsupported.
    #[default]
    None,
    /// Blocking reads allowed.
    Unspec,
}

/// Completion-queue attributes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CqAttr {
    /// Ring slots; 0 selects `DEFAULT_CQ_SIZE`
    pub size: usize,
    pub format: CqFormat,
    pub wait_obj: WaitObj,
    /// Record the source address of each completion
    pub source: bool,
}

impl CqAttr {
    /// Validate and fill defaults.
    pub fn resolve(mut self) -> Result<Self> {
        if self.size == 0 {
            self.size = DEFAULT_CQ_SIZE;
        }
        if self.size > MAX_CQ_SIZE {
            warn!(size = self.size, max = MAX_CQ_SIZE, "cq size too large");
            return Err(Error::InvalidArgument);
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_valid() {
        assert!(EndpointConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_fields() {
        let mut cfg = EndpointConfig::default();
        cfg.tx_capacity = 0;
        assert_eq!(cfg.validate().unwrap_err(), Error::InvalidArgument);

        let mut cfg = EndpointConfig::default();
        cfg.rx_iov_limit = IOV_LIMIT + 1;
        assert_eq!(cfg.validate().unwrap_err(), Error::InvalidArgument);

        let mut cfg = EndpointConfig::default();
        cfg.mtu_size = 16;
        assert_eq!(cfg.validate().unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn test_partial_deserialize() {
        let cfg: EndpointConfig =
            serde_json::from_str(r#"{ "rx_capacity": 64, "directed_recv": true }"#).unwrap();
        assert_eq!(cfg.rx_capacity, 64);
        assert!(cfg.directed_recv);
        assert_eq!(cfg.tx_capacity, EndpointConfig::default().tx_capacity);
    }

    #[test]
    fn test_cq_attr_resolve() {
        let attr = CqAttr::default().resolve().unwrap();
        assert_eq!(attr.size, DEFAULT_CQ_SIZE);

        let attr: CqAttr =
            serde_json::from_str(r#"{ "size": 8, "format": "tagged", "wait_obj": "unspec" }"#)
                .unwrap();
        let attr = attr.resolve().unwrap();
        assert_eq!(attr.size, 8);
        assert_eq!(attr.format, CqFormat::Tagged);
        assert_eq!(attr.wait_obj, WaitObj::Unspec);

        let too_big = CqAttr {
            size: MAX_CQ_SIZE + 1,
            ..CqAttr::default()
        };
        assert_eq!(too_big.resolve().unwrap_err(), Error::InvalidArgument);
    }
}
