//! # Deadlines and the Poll Loop
//!
//! Blocking operations turn their relative timeout into an absolute
//! [`Deadline`] once, at the start. [`wait_for`] then alternates between
//! looking for a completion and short readiness waits until the completion
//! shows up or the deadline passes.
//!
//! Timeouts are given in milliseconds. A timeout of `0` means "wait
//! forever".

use std::time::{Duration, Instant};

use tracing::debug;

use super::{
    error::{Error, Result},
    queue::{Completion, CompletionQueue, Tag},
    session::DeviceSession,
};

/// The point in time at which a blocking operation gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Never give up.
    Never,
    /// Give up once this instant has passed.
    At(Instant),
}

impl Deadline {
    /// A deadline `timeout_ms` milliseconds from now, or [`Deadline::Never`]
    /// for `0`.
    pub fn after_millis(timeout_ms: u32) -> Self {
        match timeout_ms {
            0 => Self::Never,
            ms => Self::At(Instant::now() + Duration::from_millis(ms.into())),
        }
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        match self {
            Self::Never => false,
            Self::At(deadline) => Instant::now() >= *deadline,
        }
    }

    /// How long the next wait may take: `interval`, but never past the
    /// deadline.
    pub fn slice(&self, interval: Duration) -> Duration {
        match self {
            Self::Never => interval,
            Self::At(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(interval),
        }
    }
}

/// Poll `session` until the completion for `tag` arrives or `deadline`
/// passes.
///
/// Completions of other callers popped along the way are parked in the
/// session for their owners. On [`Error::Timeout`] and [`Error::Reap`] the
/// block is still outstanding; the caller has to cancel it.
pub fn wait_for<Q: CompletionQueue>(
    session: &DeviceSession<Q>,
    tag: Tag,
    deadline: Deadline,
) -> Result<Completion> {
    let interval = session.config().poll_interval;

    loop {
        if let Some(completion) = session.try_complete(tag)? {
            return Ok(completion);
        }

        if deadline.is_expired() {
            debug!("Deadline passed while waiting for {tag}");
            return Err(Error::Timeout);
        }

        session.wait_ready(deadline.slice(interval))?;
    }
}
