//! Message and flag types shared by the endpoint, the matching engine and the
//! completion queue.
//!
//! Send/receive calls describe their buffers with [`Msg`] / [`TaggedMsg`];
//! the engine stamps [`Flags`] onto operations and onto the completion
//! records they produce.

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::arena::ClaimTicket;
use crate::error::{Error, Result};

/// Hard upper bound on scatter-gather entries per operation. The configured
/// `tx_iov_limit` / `rx_iov_limit` may be lower.
pub const IOV_LIMIT: usize = 4;

/// Resolved peer address (index into the transport's address vector).
pub type PeerAddr = u64;

bitflags! {
    /// Operation and completion flags.
    ///
    /// The same set is used for the flags a caller passes to `*msg` calls
    /// and the flags reported on completion records.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u64 {
        /// Message (untagged or tagged) operation.
        const MSG = 1 << 1;
        /// Remote read operation.
        const READ = 1 << 8;
        /// Remote write operation.
        const WRITE = 1 << 9;
        /// Receive side of an operation.
        const RECV = 1 << 10;
        /// Send side of an operation.
        const SEND = 1 << 11;
        /// Tagged operation.
        const TAGGED = 1 << 3;
        /// Buffer is a multi-receive buffer; on a completion, the buffer has
        /// been released.
        const MULTI_RECV = 1 << 16;
        /// Remote CQ data is carried (send) or present (completion).
        const REMOTE_CQ_DATA = 1 << 17;
        /// Generate a completion even under selective completion.
        const COMPLETION = 1 << 24;
        /// Buffer may be reused once the call returns; no completion.
        const INJECT = 1 << 25;
        /// Complete only once the data is placed in the target buffer.
        const DELIVERY_COMPLETE = 1 << 28;
        /// Only look for a matching unexpected message.
        const PEEK = 1 << 19;
        /// Claim (or, with PEEK, reserve) a matched unexpected message.
        const CLAIM = 1 << 59;
        /// Drop the matched unexpected message.
        const DISCARD = 1 << 58;
    }
}

/// One scatter-gather element.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct IoVec {
    pub addr: usize,
    pub len: usize,
}

impl IoVec {
    #[inline]
    pub const fn new(addr: usize, len: usize) -> Self {
        Self { addr, len }
    }
}

/// Scatter-gather list of an operation.
pub type IoVecs = ArrayVec<IoVec, IOV_LIMIT>;

/// Opaque memory-registration descriptor attached to a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemDesc(pub u64);

/// Descriptors matching an [`IoVecs`] element by element.
pub type MemDescs = ArrayVec<MemDesc, IOV_LIMIT>;

/// Copy `iov` into a bounded list, failing if it exceeds `limit`.
pub fn bounded_iov(iov: &[IoVec], limit: usize) -> Result<IoVecs> {
    if iov.len() > limit.min(IOV_LIMIT) {
        return Err(Error::InvalidArgument);
    }
    Ok(iov.iter().copied().collect())
}

/// Copy `desc` into a bounded list, failing if it exceeds `limit`.
pub fn bounded_desc(desc: &[MemDesc], limit: usize) -> Result<MemDescs> {
    if desc.len() > limit.min(IOV_LIMIT) {
        return Err(Error::InvalidArgument);
    }
    Ok(desc.iter().copied().collect())
}

/// Total byte length of a scatter-gather list.
#[inline]
pub fn iov_total(iov: &[IoVec]) -> usize {
    iov.iter().map(|v| v.len).sum()
}

/// Drop `n` bytes from the front of `iov`.
///
/// Fully consumed elements are removed; a partially consumed element is
/// advanced in place.
pub fn consume_iov(iov: &mut IoVecs, mut n: usize) {
    while n > 0 {
        let Some(first) = iov.first_mut() else {
            return;
        };
        if first.len > n {
            first.addr += n;
            first.len -= n;
            return;
        }
        n -= first.len;
        iov.remove(0);
    }
}

/// First `n` bytes of `iov` as a new list.
pub fn iov_prefix(iov: &[IoVec], mut n: usize) -> IoVecs {
    let mut out = IoVecs::new();
    for v in iov {
        if n == 0 {
            break;
        }
        let take = v.len.min(n);
        out.push(IoVec::new(v.addr, take));
        n -= take;
    }
    out
}

// ============================================================================
// Operation Descriptors
// ============================================================================

/// Untagged message descriptor, as passed to `sendmsg` / `recvmsg`.
#[derive(Clone, Debug, Default)]
pub struct Msg {
    pub iov: IoVecs,
    pub desc: MemDescs,
    /// Destination for sends; source filter for directed receives.
    pub addr: Option<PeerAddr>,
    /// Caller context, returned on the completion.
    pub context: u64,
    /// Remote CQ data (sends with `REMOTE_CQ_DATA`).
    pub data: u64,
}

impl Msg {
    /// Single-buffer message.
    pub fn new(buf: IoVec, addr: Option<PeerAddr>, context: u64) -> Self {
        let mut iov = IoVecs::new();
        iov.push(buf);
        Self {
            iov,
            desc: MemDescs::new(),
            addr,
            context,
            data: 0,
        }
    }
}

/// Tagged message descriptor, as passed to `tsendmsg` / `trecvmsg`.
#[derive(Clone, Debug, Default)]
pub struct TaggedMsg {
    pub iov: IoVecs,
    pub desc: MemDescs,
    pub addr: Option<PeerAddr>,
    pub tag: u64,
    /// Bits of `tag` ignored when matching (receives only).
    pub ignore: u64,
    pub context: u64,
    pub data: u64,
    /// Ticket from an earlier `PEEK | CLAIM`, consumed by a `CLAIM` receive.
    pub claim: Option<ClaimTicket>,
}

impl TaggedMsg {
    /// Single-buffer tagged message.
    pub fn new(buf: IoVec, addr: Option<PeerAddr>, tag: u64, ignore: u64, context: u64) -> Self {
        let mut iov = IoVecs::new();
        iov.push(buf);
        Self {
            iov,
            desc: MemDescs::new(),
            addr,
            tag,
            ignore,
            context,
            data: 0,
            claim: None,
        }
    }
}

/// True if an incoming `tag` satisfies a posted `tag` under `ignore`.
#[inline]
pub const fn tag_matches(posted: u64, ignore: u64, incoming: u64) -> bool {
    (posted | ignore) == (incoming | ignore)
}
