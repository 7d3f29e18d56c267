//! # Asynchronous Contexts
//!
//! An [`AsyncContext`] is a caller-managed handle around one request block.
//! The caller decides when to submit, when to reap and whether to cancel.
//! Reaping and cancelling follow the same rules as the blocking engine: a
//! completion reaped by another caller is picked up without a kernel call,
//! and a cancelled block is always drained before the call returns.
//!
//! The context owns its buffer while the block is outstanding. The kernel
//! can never write into memory that was already handed back to the caller;
//! a buffer whose block could not be drained is leaked instead.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{
    deadline::{wait_for, Deadline},
    error::{Error, Result},
    queue::{CompletionQueue, Tag},
    session::DeviceSession,
    urb::{Endpoint, RequestBlock, TransferKind},
};
use crate::capture;

/// Lifecycle of an [`AsyncContext`].
///
/// `Created → Submitted → {Completed | Cancelled} → Freed`. Completed and
/// Cancelled contexts may be submitted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// Allocated, nothing submitted yet.
    Created,
    /// A block is outstanding.
    Submitted,
    /// The block's completion was reaped.
    Completed,
    /// The block was discarded and drained.
    Cancelled,
    /// Released. Every further operation fails.
    Freed,
}

/// One explicitly managed transfer on a [`DeviceSession`].
#[derive(Debug)]
pub struct AsyncContext<Q: CompletionQueue> {
    session: Arc<DeviceSession<Q>>,
    kind: TransferKind,
    endpoint: Endpoint,
    state: ContextState,
    tag: Option<Tag>,
    buffer: Vec<u8>,
    actual_length: usize,
    status: i32,
}

impl<Q: CompletionQueue> AsyncContext<Q> {
    /// Allocate a context for `endpoint`. The direction is taken from the
    /// endpoint address as given.
    pub fn create(session: Arc<DeviceSession<Q>>, endpoint: u8, kind: TransferKind) -> Self {
        Self {
            session,
            kind,
            endpoint: Endpoint::new(endpoint),
            state: ContextState::Created,
            tag: None,
            buffer: Vec::new(),
            actual_length: 0,
            status: 0,
        }
    }

    /// Where the context is in its lifecycle.
    pub const fn state(&self) -> ContextState {
        self.state
    }

    /// The tag of the most recent submission.
    pub const fn tag(&self) -> Option<Tag> {
        self.tag
    }

    /// The endpoint, direction bit included.
    pub const fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// The transfer type.
    pub const fn kind(&self) -> TransferKind {
        self.kind
    }

    /// Bytes moved by the last completed or cancelled block.
    pub const fn actual_length(&self) -> usize {
        self.actual_length
    }

    /// The buffer of the last submission.
    ///
    /// Not available while the kernel may still access it, nor after the
    /// context was freed.
    pub fn buffer(&self) -> Option<&[u8]> {
        match self.state {
            ContextState::Submitted | ContextState::Freed => None,
            _ => Some(&self.buffer),
        }
    }

    /// Take the buffer of the last submission out of the context.
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        match self.state {
            ContextState::Submitted | ContextState::Freed => None,
            _ => Some(std::mem::take(&mut self.buffer)),
        }
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            state: self.state,
        }
    }

    fn block(&mut self) -> RequestBlock<'_> {
        RequestBlock::new(self.kind, self.endpoint, &mut self.buffer)
    }

    /// Submit a block over `buffer`.
    ///
    /// IN transfers receive into `buffer`, OUT transfers send it. Its length
    /// is the requested length.
    pub fn submit(&mut self, buffer: Vec<u8>) -> Result<()> {
        match self.state {
            ContextState::Created | ContextState::Completed | ContextState::Cancelled => {}
            _ => return Err(self.invalid("submit")),
        }

        self.buffer = buffer;
        self.actual_length = 0;
        self.status = 0;

        let session = Arc::clone(&self.session);
        let block = self.block();
        // SAFETY: The context owns the buffer and does not touch, resize or
        // release it while Submitted. Leaving Submitted always goes through
        // a reap or a drain of this tag, including on drop, and a buffer
        // whose drain failed is leaked.
        let tag = unsafe { session.submit(&block) }?;
        capture::record_submit(session.config(), tag, &block);

        self.tag = Some(tag);
        self.state = ContextState::Submitted;
        Ok(())
    }

    /// Wait up to `timeout_ms` (`0` waits forever) for the block to complete
    /// and return the number of bytes moved.
    ///
    /// On timeout the block is cancelled and [`Error::Timeout`] returned.
    pub fn reap(&mut self, timeout_ms: u32) -> Result<usize> {
        self.reap_with(timeout_ms, true)
    }

    /// Like [`AsyncContext::reap`], but on timeout the block stays
    /// outstanding and can be reaped again later.
    pub fn reap_nodiscard(&mut self, timeout_ms: u32) -> Result<usize> {
        self.reap_with(timeout_ms, false)
    }

    /// The outcome of the last completion.
    fn completed(&self) -> Result<usize> {
        match self.status {
            0 => Ok(self.actual_length),
            status => Err(Error::Status(status)),
        }
    }

    fn reap_with(&mut self, timeout_ms: u32, cancel_on_timeout: bool) -> Result<usize> {
        let tag = match (self.state, self.tag) {
            (ContextState::Completed, _) => return self.completed(),
            (ContextState::Submitted, Some(tag)) => tag,
            _ => return Err(self.invalid("reap")),
        };

        let session = Arc::clone(&self.session);
        match wait_for(&session, tag, Deadline::after_millis(timeout_ms)) {
            Ok(completion) => {
                self.state = ContextState::Completed;
                self.actual_length = completion.actual_length.min(self.buffer.len());
                self.status = completion.status;
                capture::record_complete(session.config(), &self.block(), &completion);

                self.completed()
            }
            Err(Error::Timeout) if cancel_on_timeout => {
                debug!("Cancelling {tag} after timeout");
                self.cancel()?;
                Err(Error::Timeout)
            }
            Err(error) => Err(error),
        }
    }

    /// Discard the outstanding block and drain its completion.
    ///
    /// Bytes moved before the discard took effect are still reported by
    /// [`AsyncContext::actual_length`].
    ///
    /// If the completion cannot be drained, the kernel may still own the
    /// buffer. It is leaked and the context is left Cancelled and empty.
    pub fn cancel(&mut self) -> Result<()> {
        let tag = match (self.state, self.tag) {
            (ContextState::Submitted, Some(tag)) => tag,
            _ => return Err(self.invalid("cancel")),
        };

        let session = Arc::clone(&self.session);
        self.state = ContextState::Cancelled;

        let completion = match session.cancel(tag) {
            Ok(completion) => completion,
            Err(error) => {
                warn!(
                    "Leaking {} byte buffer of undrained {tag}",
                    self.buffer.len()
                );
                std::mem::forget(std::mem::take(&mut self.buffer));
                self.actual_length = 0;
                return Err(error);
            }
        };

        self.actual_length = completion.actual_length.min(self.buffer.len());
        self.status = completion.status;
        capture::record_complete(session.config(), &self.block(), &completion);
        Ok(())
    }

    /// Release the context. Fails while a block is outstanding and on a
    /// context that was already freed.
    pub fn free(&mut self) -> Result<()> {
        if matches!(self.state, ContextState::Submitted | ContextState::Freed) {
            return Err(self.invalid("free"));
        }

        self.state = ContextState::Freed;
        self.tag = None;
        self.buffer = Vec::new();
        Ok(())
    }
}

impl<Q: CompletionQueue> Drop for AsyncContext<Q> {
    fn drop(&mut self) {
        if self.state == ContextState::Submitted {
            if let Err(error) = self.cancel() {
                warn!("Failed to cancel dropped transfer context: {error}");
            }
        }
    }
}
