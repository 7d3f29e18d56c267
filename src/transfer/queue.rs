//! # Completion Queue Contract
//!
//! A transport exposes one FIFO completion queue per open device. Every
//! request block submitted to the device ends up on that queue exactly once,
//! whether it completed, failed or was discarded. [`CompletionQueue`] is the
//! whole contract the transfer core needs from a transport.

use std::{fmt, io, time::Duration};

use super::urb::RequestBlock;

/// Identity of one submitted request block.
///
/// Tags are unique among the blocks outstanding on one
/// [`DeviceSession`](super::session::DeviceSession). The value `0` is never
/// handed out, so transports can use it as a null marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u64);

impl Tag {
    /// Wrap a raw tag value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw tag value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "URB#{}", self.0)
    }
}

/// A reaped completion as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// The block this completion belongs to.
    pub tag: Tag,
    /// Bytes actually moved.
    pub actual_length: usize,
    /// `0` on success, a negative errno otherwise.
    pub status: i32,
}

impl Completion {
    /// Whether the kernel reported success.
    pub const fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// The submit / reap / discard primitive of a transport.
///
/// Implementations must be callable from several threads at once. They do
/// not need to serialize anything beyond what the kernel already does per
/// call; the [`DeviceSession`](super::session::DeviceSession) sorts out which
/// caller a completion belongs to.
pub trait CompletionQueue: fmt::Debug + Send + Sync {
    /// Hand `block` to the kernel under `tag`.
    ///
    /// On success the block is outstanding and exactly one completion with
    /// `tag` will eventually be reapable.
    ///
    /// # Safety
    ///
    /// The memory described by `block` must stay valid, and must not be
    /// moved, freed or accessed in a conflicting way, until a completion
    /// carrying `tag` was reaped from this queue (or the queue itself is
    /// gone).
    unsafe fn submit(&self, tag: Tag, block: &RequestBlock<'_>) -> io::Result<()>;

    /// Pop one completion if one is available right now.
    ///
    /// An error means the queue cannot hand out completions anymore, e.g.
    /// because the device is gone and the kernel has given up all of its
    /// blocks. Transient conditions are retried or reported as `Ok(None)`.
    fn reap_nonblocking(&self) -> io::Result<Option<Completion>>;

    /// Ask the kernel to cancel the outstanding block `tag`.
    ///
    /// The block's completion still lands on the queue and has to be
    /// reaped.
    fn discard(&self, tag: Tag) -> io::Result<()>;

    /// Wait at most `timeout` for the queue to become reapable.
    ///
    /// Returning early without a completion being available is fine.
    fn wait_ready(&self, timeout: Duration) -> io::Result<()>;
}
