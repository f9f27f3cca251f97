//! Protocol Selection - picks the request-to-message (RTM) packet type for a
//! send.
//!
//! Four protocol families exist: eager (payload inline in one packet),
//! medium (payload spread over several packets), long-CTS (receiver-paced
//! clear-to-send) and long-read (receiver pulls via RDMA read). Every family
//! has an untagged and a tagged type, the tagged one always numbered one
//! above. Eager, medium and long-CTS also have a delivery-complete variant.

/// First packet type number that needs an extra, handshake-negotiated peer
/// feature.
pub const EXTRA_REQ_PKT_BEGIN: u8 = 128;

/// Size of the base RTM header: type, version, flags, message id.
pub const BASE_RTM_HDR_LEN: usize = 8;
/// Extra header bytes carrying the tag.
pub const TAG_HDR_LEN: usize = 8;
/// Extra header bytes carrying remote CQ data.
pub const CQ_DATA_HDR_LEN: usize = 8;

/// RTM packet types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    EagerMsgRtm = 64,
    EagerTagRtm = 65,
    MediumMsgRtm = 66,
    MediumTagRtm = 67,
    LongCtsMsgRtm = 68,
    LongCtsTagRtm = 69,
    LongReadMsgRtm = 128,
    LongReadTagRtm = 129,
    DcEagerMsgRtm = 133,
    DcEagerTagRtm = 134,
    DcMediumMsgRtm = 135,
    DcMediumTagRtm = 136,
    DcLongCtsMsgRtm = 137,
    DcLongCtsTagRtm = 138,
}

impl PacketType {
    /// Decode a wire packet type number.
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            64 => PacketType::EagerMsgRtm,
            65 => PacketType::EagerTagRtm,
            66 => PacketType::MediumMsgRtm,
            67 => PacketType::MediumTagRtm,
            68 => PacketType::LongCtsMsgRtm,
            69 => PacketType::LongCtsTagRtm,
            128 => PacketType::LongReadMsgRtm,
            129 => PacketType::LongReadTagRtm,
            133 => PacketType::DcEagerMsgRtm,
            134 => PacketType::DcEagerTagRtm,
            135 => PacketType::DcMediumMsgRtm,
            136 => PacketType::DcMediumTagRtm,
            137 => PacketType::DcLongCtsMsgRtm,
            138 => PacketType::DcLongCtsTagRtm,
            _ => return None,
        })
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Tagged counterpart of an untagged type (identity for tagged types).
    #[inline]
    pub const fn tagged(self) -> Self {
        if self.is_tagged() {
            return self;
        }
        match Self::from_u8(self as u8 + 1) {
            Some(t) => t,
            None => self,
        }
    }

    #[inline]
    pub const fn is_tagged(self) -> bool {
        matches!(
            self,
            PacketType::EagerTagRtm
                | PacketType::MediumTagRtm
                | PacketType::LongCtsTagRtm
                | PacketType::LongReadTagRtm
                | PacketType::DcEagerTagRtm
                | PacketType::DcMediumTagRtm
                | PacketType::DcLongCtsTagRtm
        )
    }

    /// Whether the peer must advertise support through the handshake.
    #[inline]
    pub const fn is_extra_feature(self) -> bool {
        self as u8 >= EXTRA_REQ_PKT_BEGIN
    }

    #[inline]
    pub const fn is_delivery_complete(self) -> bool {
        matches!(
            self,
            PacketType::DcEagerMsgRtm
                | PacketType::DcEagerTagRtm
                | PacketType::DcMediumMsgRtm
                | PacketType::DcMediumTagRtm
                | PacketType::DcLongCtsMsgRtm
                | PacketType::DcLongCtsTagRtm
        )
    }

    #[inline]
    pub const fn is_eager(self) -> bool {
        matches!(
            self,
            PacketType::EagerMsgRtm
                | PacketType::EagerTagRtm
                | PacketType::DcEagerMsgRtm
                | PacketType::DcEagerTagRtm
        )
    }

    /// Header bytes preceding the payload, without optional headers.
    pub const fn header_len(self) -> usize {
        let family = match self {
            PacketType::EagerMsgRtm | PacketType::EagerTagRtm => 0,
            // msg_length + seg_offset
            PacketType::MediumMsgRtm | PacketType::MediumTagRtm => 16,
            // msg_length + send_id + credit_request
            PacketType::LongCtsMsgRtm | PacketType::LongCtsTagRtm => 16,
            // msg_length + send_id + read_iov_count
            PacketType::LongReadMsgRtm | PacketType::LongReadTagRtm => 16,
            // send_id + padding
            PacketType::DcEagerMsgRtm | PacketType::DcEagerTagRtm => 8,
            PacketType::DcMediumMsgRtm | PacketType::DcMediumTagRtm => 24,
            PacketType::DcLongCtsMsgRtm | PacketType::DcLongCtsTagRtm => 24,
        };
        let tag = if self.is_tagged() { TAG_HDR_LEN } else { 0 };
        BASE_RTM_HDR_LEN + family + tag
    }
}

/// Thresholds and capabilities protocol selection depends on.
#[derive(Clone, Copy, Debug)]
pub struct SelectParams {
    pub mtu_size: usize,
    pub min_read_msg_size: usize,
    pub max_medium_msg_size: usize,
    /// The local endpoint can issue RDMA reads.
    pub rdma_read: bool,
    /// A memory-registration cache can register buffers on the fly.
    pub mr_cache: bool,
}

/// One send as seen by protocol selection.
#[derive(Clone, Copy, Debug)]
pub struct SendShape {
    pub total_len: usize,
    pub tagged: bool,
    pub delivery_complete: bool,
    pub inject: bool,
    pub cq_data: bool,
    pub desc_present: bool,
}

/// Payload bytes an eager packet of type `ty` can carry.
#[inline]
pub fn eager_capacity(ty: PacketType, mtu_size: usize, cq_data: bool) -> usize {
    let hdr = ty.header_len() + if cq_data { CQ_DATA_HDR_LEN } else { 0 };
    mtu_size.saturating_sub(hdr)
}

/// Select the RTM type for a send.
///
/// Order of preference: read-based for large messages when RDMA read is
/// usable, then eager if the payload fits one packet, then medium up to
/// `max_medium_msg_size`, then long-CTS.
pub fn select_rtm(shape: &SendShape, params: &SelectParams) -> PacketType {
    let dc = shape.delivery_complete && !shape.inject;

    let (eager, medium, longcts) = if dc {
        (
            PacketType::DcEagerMsgRtm,
            PacketType::DcMediumMsgRtm,
            PacketType::DcLongCtsMsgRtm,
        )
    } else {
        (
            PacketType::EagerMsgRtm,
            PacketType::MediumMsgRtm,
            PacketType::LongCtsMsgRtm,
        )
    };

    let pick = |ty: PacketType| if shape.tagged { ty.tagged() } else { ty };

    if shape.total_len >= params.min_read_msg_size
        && params.rdma_read
        && (shape.desc_present || params.mr_cache)
    {
        return pick(PacketType::LongReadMsgRtm);
    }

    let eager = pick(eager);
    if shape.total_len <= eager_capacity(eager, params.mtu_size, shape.cq_data) {
        return eager;
    }

    if shape.total_len <= params.max_medium_msg_size {
        return pick(medium);
    }

    pick(longcts)
}
