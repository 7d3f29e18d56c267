//! # Device Session
//!
//! A [`DeviceSession`] wraps the single completion queue of an open device.
//! All transfers on the device, synchronous or asynchronous and from any
//! thread, go through it.
//!
//! Because the queue is shared, a caller looking for its own completion can
//! pop somebody else's. The session keeps a registry of outstanding tags.
//! Completions reaped by the "wrong" caller are parked there, and the owner
//! picks them up on its next look without another kernel call.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use tracing::{debug, trace, warn};

use super::{
    error::{Error, Result},
    queue::{Completion, CompletionQueue, Tag},
    urb::RequestBlock,
};

/// Largest chunk handed to the kernel in one request block. usbfs caps a
/// single URB at 16 KiB.
pub const MAX_CHUNK: usize = 16 * 1024;

/// Length of one readiness wait inside the poll loop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Tunables of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Upper bound for the size of one request block.
    pub max_chunk: usize,
    /// Upper bound for one readiness wait.
    pub poll_interval: Duration,
    /// Bus number of the device. Only used for capture metadata.
    pub bus_number: u16,
    /// Address of the device on its bus. Only used for capture metadata.
    pub device_address: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_chunk: MAX_CHUNK,
            poll_interval: POLL_INTERVAL,
            bus_number: 0,
            device_address: 0,
        }
    }
}

/// Which tags are outstanding and which completions wait for their owner.
#[derive(Debug, Default)]
struct CompletionRegistry {
    outstanding: HashSet<Tag>,
    parked: HashMap<Tag, Completion>,
}

impl CompletionRegistry {
    fn register(&mut self, tag: Tag) {
        let fresh = self.outstanding.insert(tag);
        debug_assert!(fresh, "{tag} submitted twice");
    }

    fn retire(&mut self, tag: Tag) {
        self.outstanding.remove(&tag);
    }

    /// Hand a completion that was parked for `tag` to its owner.
    fn take(&mut self, tag: Tag) -> Option<Completion> {
        let completion = self.parked.remove(&tag)?;
        self.retire(tag);
        Some(completion)
    }

    /// Keep a completion that belongs to another caller.
    fn park(&mut self, completion: Completion) {
        if !self.outstanding.contains(&completion.tag) {
            warn!("Dropping completion for unknown {}", completion.tag);
            return;
        }

        debug!("Parking foreign completion for {}", completion.tag);
        self.parked.insert(completion.tag, completion);
    }
}

/// One open device and its shared completion queue.
#[derive(Debug)]
pub struct DeviceSession<Q> {
    queue: Q,
    config: SessionConfig,
    next_tag: AtomicU64,
    /// Every reap happens with this lock held, so taking a parked completion
    /// and reaping a new one cannot race.
    registry: Mutex<CompletionRegistry>,
}

impl<Q: CompletionQueue> DeviceSession<Q> {
    /// Create a session with the default configuration.
    pub fn new(queue: Q) -> Self {
        Self::with_config(queue, SessionConfig::default())
    }

    /// Create a session with an explicit configuration.
    pub fn with_config(queue: Q, config: SessionConfig) -> Self {
        Self {
            queue,
            config,
            next_tag: AtomicU64::new(1),
            registry: Mutex::default(),
        }
    }

    /// The configuration this session was created with.
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The underlying transport.
    pub const fn queue(&self) -> &Q {
        &self.queue
    }

    /// Number of blocks submitted through this session that were not yet
    /// handed back to their owner.
    pub fn outstanding(&self) -> usize {
        self.registry().outstanding.len()
    }

    /// Number of completions that were reaped by another caller and wait for
    /// their owner.
    pub fn parked(&self) -> usize {
        self.registry().parked.len()
    }

    fn registry(&self) -> MutexGuard<'_, CompletionRegistry> {
        self.registry.lock().unwrap()
    }

    fn next_tag(&self) -> Tag {
        Tag::new(self.next_tag.fetch_add(1, Ordering::Relaxed))
    }

    /// Submit `block` and return the tag its completion will carry.
    ///
    /// # Safety
    ///
    /// Same contract as [`CompletionQueue::submit`]: the block's memory has
    /// to stay valid until the completion for the returned tag was obtained
    /// from this session.
    pub unsafe fn submit(&self, block: &RequestBlock<'_>) -> Result<Tag> {
        let tag = self.next_tag();

        // Register first. Another thread may reap the completion before the
        // submit call even returns.
        self.registry().register(tag);

        // SAFETY: The caller upholds the buffer contract.
        if let Err(source) = unsafe { self.queue.submit(tag, block) } {
            self.registry().retire(tag);
            warn!(
                "Failed to submit {} URB to {}: {}",
                block.kind(),
                block.endpoint(),
                source
            );
            return Err(Error::Submit {
                endpoint: block.endpoint(),
                source,
            });
        }

        trace!(
            "Submitted {tag}: {} {} {} bytes",
            block.kind(),
            block.endpoint(),
            block.requested_length()
        );
        Ok(tag)
    }

    /// Return the completion for `tag` if it is available without waiting.
    ///
    /// A completion that another caller already reaped is returned without
    /// touching the queue. Otherwise the queue is drained until either `tag`
    /// shows up or it runs empty; foreign completions are parked on the way.
    pub fn try_complete(&self, tag: Tag) -> Result<Option<Completion>> {
        let mut registry = self.registry();

        if let Some(completion) = registry.take(tag) {
            trace!("{tag} was reaped by another caller");
            return Ok(Some(completion));
        }

        loop {
            match self.queue.reap_nonblocking().map_err(Error::Reap)? {
                Some(completion) if completion.tag == tag => {
                    registry.retire(tag);
                    trace!(
                        "Reaped {tag}: {} bytes, status {}",
                        completion.actual_length,
                        completion.status
                    );
                    return Ok(Some(completion));
                }
                Some(foreign) => registry.park(foreign),
                None => return Ok(None),
            }
        }
    }

    /// Wait at most `timeout` for the queue to have something to reap.
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        match self.queue.wait_ready(timeout) {
            Err(error) if error.kind() != std::io::ErrorKind::Interrupted => {
                Err(Error::Reap(error))
            }
            _ => Ok(()),
        }
    }

    /// Cancel the outstanding block `tag` and drain its completion.
    ///
    /// When this returns `Ok`, `tag` is no longer outstanding and its entry
    /// is gone from the queue. The returned completion tells how many bytes
    /// moved before the cancellation took effect.
    pub fn cancel(&self, tag: Tag) -> Result<Completion> {
        debug!("Discarding {tag}");

        if let Err(error) = self.queue.discard(tag) {
            // The block may have completed in the meantime. Its completion is
            // then already queued or parked, and the drain below finds it.
            if error.raw_os_error() == Some(nix::errno::Errno::EINVAL as i32) {
                debug!("{tag} was no longer cancellable: {error}");
            } else {
                warn!("Failed to discard {tag}: {error}");
            }
        }

        self.drain(tag)
    }

    /// Poll until the completion for `tag` was removed from the queue.
    ///
    /// The registry is only locked for each look at the queue. Other callers
    /// keep submitting and reaping meanwhile; if one of them pops the
    /// completion, it is parked and picked up here on the next look.
    fn drain(&self, tag: Tag) -> Result<Completion> {
        loop {
            if let Some(completion) = self.try_complete(tag)? {
                trace!(
                    "Drained {tag}: {} bytes, status {}",
                    completion.actual_length,
                    completion.status
                );
                return Ok(completion);
            }

            // Only a failing reap ends the drain. The block is ours until then.
            if let Err(error) = self.wait_ready(self.config.poll_interval) {
                debug!("Readiness wait failed while draining {tag}: {error}");
                std::thread::sleep(self.config.poll_interval);
            }
        }
    }
}
