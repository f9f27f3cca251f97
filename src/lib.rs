//! # Flash-RDM
//!
//! Reliable-datagram messaging core: a binary buddy allocator, a send/receive
//! matching engine and a completion queue.
//!
//! ## Design Principles
//!
//! - **Arena Allocation**: operation entries live in fixed pools sized at
//!   endpoint creation, linked by 32-bit indices
//! - **Lock Then Defer**: the endpoint lock is never held across transport
//!   hooks that may re-enter the endpoint
//! - **Lock Elision by Type**: a single-threaded completion queue is `!Sync`,
//!   so the compiler enforces the contract that makes skipping locks legal
//!
//! ## Architecture
//!
//! ```text
//!  app ──send/recv──> [Endpoint] ──post_packet──> [Transport]
//!                        │   ^                        │
//!                        │   └──on_incoming/complete──┘
//!                        v
//!              [CompletionQueue] <──read/sread── app
//! ```

pub mod arena;
pub mod bitmap;
pub mod buddy;
pub mod completion;
pub mod config;
pub mod cq;
pub mod endpoint;
pub mod entry;
pub mod error;
pub mod index_list;
pub mod matching;
pub mod msg;
pub mod protocol;
pub mod sync;
pub mod transport;
pub mod unexpected;
pub mod wait;

// Re-exports for convenience
pub use arena::{ClaimTicket, EntryId};
pub use buddy::{BuddyAllocator, ExtractPolicy, MIN_BLOCK_SIZE};
pub use completion::{CompletionEntry, CqFormat, CqRecord, ErrorEntry};
pub use config::{CqAttr, EndpointConfig, WaitObj};
pub use cq::{BindProgress, CompletionQueue, CqLock, Progress};
pub use endpoint::Endpoint;
pub use entry::{EntryState, OpEntry, OpKind};
pub use error::{Error, Result};
pub use matching::Arrival;
pub use msg::{Flags, IoVec, MemDesc, Msg, PeerAddr, TaggedMsg};
pub use protocol::PacketType;
pub use sync::SingleThreadRawMutex;
pub use transport::{IncomingRtm, MatchedRecv, PacketId, Transport};
