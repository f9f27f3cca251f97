//! Completion records and their caller-facing projections.

use serde::Deserialize;

use crate::error::Error;
use crate::msg::Flags;

/// Full completion record as stored by the queue and used as the per-entry
/// completion template.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompletionEntry {
    pub context: u64,
    pub flags: Flags,
    pub len: usize,
    /// Start of the data in the receive buffer, if any.
    pub buf: Option<usize>,
    pub data: u64,
    pub tag: u64,
}

/// Error record, delivered out of band through `read_err`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorEntry {
    pub context: u64,
    pub flags: Flags,
    pub len: usize,
    pub buf: Option<usize>,
    pub data: u64,
    pub tag: u64,
    /// Bytes that did not fit the posted buffer.
    pub olen: usize,
    pub err: Error,
    pub prov_errno: i32,
    pub err_data: Vec<u8>,
}

impl ErrorEntry {
    /// Error record carrying the fields of `template`.
    pub fn from_template(template: &CompletionEntry, err: Error) -> Self {
        Self {
            context: template.context,
            flags: template.flags,
            len: template.len,
            buf: template.buf,
            data: template.data,
            tag: template.tag,
            olen: 0,
            err,
            prov_errno: err.errno(),
            err_data: Vec::new(),
        }
    }
}

/// Record layout a queue reports, fixed at creation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CqFormat {
    #[default]
    Context,
    Msg,
    Data,
    Tagged,
}

/// A completion projected to the queue's [`CqFormat`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CqRecord {
    Context {
        context: u64,
    },
    Msg {
        context: u64,
        flags: Flags,
        len: usize,
    },
    Data {
        context: u64,
        flags: Flags,
        len: usize,
        buf: Option<usize>,
        data: u64,
    },
    Tagged {
        context: u64,
        flags: Flags,
        len: usize,
        buf: Option<usize>,
        data: u64,
        tag: u64,
    },
}

impl CqRecord {
    #[inline]
    pub fn context(&self) -> u64 {
        match *self {
            CqRecord::Context { context }
            | CqRecord::Msg { context, .. }
            | CqRecord::Data { context, .. }
            | CqRecord::Tagged { context, .. } => context,
        }
    }

    /// Flags, or empty for the context-only format.
    #[inline]
    pub fn flags(&self) -> Flags {
        match *self {
            CqRecord::Context { .. } => Flags::empty(),
            CqRecord::Msg { flags, .. }
            | CqRecord::Data { flags, .. }
            | CqRecord::Tagged { flags, .. } => flags,
        }
    }

    /// Length, or zero for the context-only format.
    #[inline]
    pub fn len(&self) -> usize {
        match *self {
            CqRecord::Context { .. } => 0,
            CqRecord::Msg { len, .. } | CqRecord::Data { len, .. } | CqRecord::Tagged { len, .. } => {
                len
            }
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CompletionEntry {
    /// Project the record onto `format`.
    pub fn project(&self, format: CqFormat) -> CqRecord {
        match format {
            CqFormat::Context => CqRecord::Context {
                context: self.context,
            },
            CqFormat::Msg => CqRecord::Msg {
                context: self.context,
                flags: self.flags,
                len: self.len,
            },
            CqFormat::Data => CqRecord::Data {
                context: self.context,
                flags: self.flags,
                len: self.len,
                buf: self.buf,
                data: self.data,
            },
            CqFormat::Tagged => CqRecord::Tagged {
                context: self.context,
                flags: self.flags,
                len: self.len,
                buf: self.buf,
                data: self.data,
                tag: self.tag,
            },
        }
    }
}
