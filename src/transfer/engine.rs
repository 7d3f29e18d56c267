//! # Chunked Synchronous Transfers
//!
//! The blocking call surface: "move up to N bytes within T milliseconds,
//! return how many moved". A transfer is split into request blocks of at most
//! [`SessionConfig::max_chunk`](super::session::SessionConfig::max_chunk)
//! bytes that are submitted one after another. A short completion ends the
//! transfer early; it is the device's way of saying "no more data".
//!
//! Whatever happens, no block submitted here is left outstanding when the
//! call returns. A block that times out or whose wait fails is discarded and
//! its completion drained first.

use std::ops::Range;

use tracing::{debug, warn};

use super::{
    deadline::{wait_for, Deadline},
    error::{Error, Result},
    queue::CompletionQueue,
    session::DeviceSession,
    urb::{Direction, RequestBlock, TransferKind},
};
use crate::capture;

/// The caller's buffer together with the transfer direction.
#[derive(Debug)]
pub enum TransferBuffer<'a> {
    /// Receive into this buffer.
    In(&'a mut [u8]),
    /// Send this buffer.
    Out(&'a [u8]),
}

impl TransferBuffer<'_> {
    /// Total number of bytes to transfer.
    pub fn len(&self) -> usize {
        match self {
            Self::In(buffer) => buffer.len(),
            Self::Out(buffer) => buffer.len(),
        }
    }

    /// Whether there is nothing to transfer.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The transfer direction.
    pub const fn direction(&self) -> Direction {
        match self {
            Self::In(_) => Direction::In,
            Self::Out(_) => Direction::Out,
        }
    }

    fn block(&mut self, kind: TransferKind, endpoint: u8, range: Range<usize>) -> RequestBlock<'_> {
        match self {
            Self::In(buffer) => RequestBlock::read(kind, endpoint, &mut buffer[range]),
            Self::Out(buffer) => RequestBlock::write(kind, endpoint, &buffer[range]),
        }
    }
}

/// The full outcome of a transfer: how much moved and what stopped it.
#[derive(Debug)]
pub struct TransferReport {
    /// Bytes moved by blocks that were reaped as completed.
    pub transferred: usize,
    /// Bytes the drained completion of a cancelled block still reported.
    ///
    /// They are in the caller's buffer right behind `transferred`, but the
    /// block failed, so they are not counted as progress.
    pub unlinked: usize,
    /// The error that ended the transfer early, if any.
    pub error: Option<Error>,
}

impl TransferReport {
    /// Collapse the report into the blocking-call convention.
    ///
    /// An error is only returned if no block completed before it. After
    /// partial progress the byte count wins and the error is logged.
    pub fn into_result(self) -> Result<usize> {
        match self.error {
            None => Ok(self.transferred),
            Some(error) if self.transferred == 0 => Err(error),
            Some(error) => {
                warn!(
                    "Reporting {} transferred bytes, dropping error: {error}",
                    self.transferred
                );
                Ok(self.transferred)
            }
        }
    }
}

/// Why a single block did not complete in full.
struct BlockFailure {
    /// Bytes reported by a completion that carried an error status.
    transferred: usize,
    /// Bytes reported by the drained completion of a cancelled block.
    unlinked: usize,
    error: Error,
}

impl From<Error> for BlockFailure {
    fn from(error: Error) -> Self {
        Self {
            transferred: 0,
            unlinked: 0,
            error,
        }
    }
}

/// Transfer `buffer` and report both the byte count and the error, if any.
pub fn transfer_report<Q: CompletionQueue>(
    session: &DeviceSession<Q>,
    kind: TransferKind,
    endpoint: u8,
    mut buffer: TransferBuffer<'_>,
    timeout_ms: u32,
) -> TransferReport {
    let deadline = Deadline::after_millis(timeout_ms);
    let size = buffer.len();
    let max_chunk = session.config().max_chunk.max(1);
    let mut transferred = 0;

    // An empty buffer still goes out as one zero-length block.
    loop {
        let requested = (size - transferred).min(max_chunk);
        let block = buffer.block(kind, endpoint, transferred..transferred + requested);

        match run_block(session, &block, deadline) {
            Ok(actual) => {
                transferred += actual;

                if actual < requested {
                    debug!(
                        "Short {kind} transfer on {}: {actual} of {requested} bytes",
                        block.endpoint()
                    );
                    break;
                }
            }
            Err(failure) => {
                return TransferReport {
                    transferred: transferred + failure.transferred,
                    unlinked: failure.unlinked,
                    error: Some(failure.error),
                };
            }
        }

        if transferred >= size {
            break;
        }
    }

    TransferReport {
        transferred,
        unlinked: 0,
        error: None,
    }
}

/// Submit one block and wait for it.
fn run_block<Q: CompletionQueue>(
    session: &DeviceSession<Q>,
    block: &RequestBlock<'_>,
    deadline: Deadline,
) -> std::result::Result<usize, BlockFailure> {
    // SAFETY: `block` borrows the caller's buffer for this whole function.
    // Every path below obtains the completion for `tag` before returning.
    // The one exception is a failing reap during the drain, and reaps only
    // fail once the transport has given up all of its blocks.
    let tag = unsafe { session.submit(block) }?;
    capture::record_submit(session.config(), tag, block);

    let completion = match wait_for(session, tag, deadline) {
        Ok(completion) => completion,
        Err(error) => {
            let unlinked = match session.cancel(tag) {
                Ok(completion) => {
                    capture::record_complete(session.config(), block, &completion);
                    completion.actual_length.min(block.requested_length())
                }
                Err(drain_error) => {
                    warn!("Failed to drain cancelled {tag}: {drain_error}");
                    0
                }
            };
            return Err(BlockFailure {
                transferred: 0,
                unlinked,
                error,
            });
        }
    };

    capture::record_complete(session.config(), block, &completion);

    let actual = completion.actual_length.min(block.requested_length());
    if !completion.is_success() {
        return Err(BlockFailure {
            transferred: actual,
            unlinked: 0,
            error: Error::Status(completion.status),
        });
    }

    Ok(actual)
}

/// Transfer `buffer` with request blocks of type `kind`.
///
/// Returns the number of bytes moved. See [`TransferReport::into_result`]
/// for how errors after partial progress are reported.
pub fn transfer<Q: CompletionQueue>(
    session: &DeviceSession<Q>,
    kind: TransferKind,
    endpoint: u8,
    buffer: TransferBuffer<'_>,
    timeout_ms: u32,
) -> Result<usize> {
    transfer_report(session, kind, endpoint, buffer, timeout_ms).into_result()
}

/// A blocking bulk transfer in the direction of `buffer`.
pub fn bulk_transfer<Q: CompletionQueue>(
    session: &DeviceSession<Q>,
    endpoint: u8,
    buffer: TransferBuffer<'_>,
    timeout_ms: u32,
) -> Result<usize> {
    transfer(session, TransferKind::Bulk, endpoint, buffer, timeout_ms)
}

/// A blocking interrupt transfer in the direction of `buffer`.
pub fn interrupt_transfer<Q: CompletionQueue>(
    session: &DeviceSession<Q>,
    endpoint: u8,
    buffer: TransferBuffer<'_>,
    timeout_ms: u32,
) -> Result<usize> {
    transfer(session, TransferKind::Interrupt, endpoint, buffer, timeout_ms)
}

/// Read from a bulk IN endpoint.
pub fn bulk_read<Q: CompletionQueue>(
    session: &DeviceSession<Q>,
    endpoint: u8,
    buffer: &mut [u8],
    timeout_ms: u32,
) -> Result<usize> {
    bulk_transfer(session, endpoint, TransferBuffer::In(buffer), timeout_ms)
}

/// Write to a bulk OUT endpoint.
pub fn bulk_write<Q: CompletionQueue>(
    session: &DeviceSession<Q>,
    endpoint: u8,
    buffer: &[u8],
    timeout_ms: u32,
) -> Result<usize> {
    bulk_transfer(session, endpoint, TransferBuffer::Out(buffer), timeout_ms)
}

/// Read from an interrupt IN endpoint.
pub fn interrupt_read<Q: CompletionQueue>(
    session: &DeviceSession<Q>,
    endpoint: u8,
    buffer: &mut [u8],
    timeout_ms: u32,
) -> Result<usize> {
    interrupt_transfer(session, endpoint, TransferBuffer::In(buffer), timeout_ms)
}

/// Write to an interrupt OUT endpoint.
pub fn interrupt_write<Q: CompletionQueue>(
    session: &DeviceSession<Q>,
    endpoint: u8,
    buffer: &[u8],
    timeout_ms: u32,
) -> Result<usize> {
    interrupt_transfer(session, endpoint, TransferBuffer::Out(buffer), timeout_ms)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    use proptest::prelude::*;

    use super::*;
    use crate::transfer::{
        mock::{Behavior, Call, MockQueue},
        queue::Tag,
        session::{SessionConfig, MAX_CHUNK},
    };

    fn session_with(behaviors: impl IntoIterator<Item = Behavior>) -> DeviceSession<MockQueue> {
        let queue = MockQueue::default();
        queue.script(behaviors);
        DeviceSession::new(queue)
    }

    fn discards(session: &DeviceSession<MockQueue>) -> usize {
        session
            .queue()
            .count(|call| matches!(call, Call::Discard(_)))
    }

    #[test]
    fn single_chunk_completes_without_discard() {
        let session = session_with([]);
        let data = vec![0xaa; 512];

        assert_eq!(bulk_write(&session, 0x01, &data, 1000).unwrap(), 512);
        let tag = session.queue().submitted()[0].0;
        assert_eq!(discards(&session), 0);
        assert_eq!(session.queue().reaped(tag), 1);
        assert_eq!(session.outstanding(), 0);
    }

    #[test]
    fn large_transfer_is_chunked() {
        let session = session_with([]);
        let data = vec![0; 2 * MAX_CHUNK + 100];

        assert_eq!(bulk_write(&session, 0x01, &data, 0).unwrap(), data.len());

        let lengths: Vec<usize> = session
            .queue()
            .submitted()
            .into_iter()
            .map(|(_, _, length)| length)
            .collect();
        assert_eq!(lengths, [MAX_CHUNK, MAX_CHUNK, 100]);
    }

    #[test]
    fn short_completion_stops_the_transfer() {
        let session = session_with([Behavior::Full, Behavior::Short(100)]);
        let mut buffer = vec![0; 3 * MAX_CHUNK];

        let read = bulk_read(&session, 0x81, &mut buffer, 1000).unwrap();

        assert_eq!(read, MAX_CHUNK + 100);
        assert_eq!(session.queue().submitted().len(), 2);
    }

    #[test]
    fn chunks_land_at_their_offsets() {
        let session = session_with([Behavior::Full, Behavior::Short(10)]);
        let mut buffer = vec![0; 2 * MAX_CHUNK];

        bulk_read(&session, 0x81, &mut buffer, 1000).unwrap();

        let submitted = session.queue().submitted();
        let first = submitted[0].0.get() as u8;
        let second = submitted[1].0.get() as u8;
        assert!(buffer[..MAX_CHUNK].iter().all(|&byte| byte == first));
        assert!(buffer[MAX_CHUNK..MAX_CHUNK + 10]
            .iter()
            .all(|&byte| byte == second));
        assert!(buffer[MAX_CHUNK + 10..].iter().all(|&byte| byte == 0));
    }

    /// Calls made after the discard of `tag`.
    fn after_discard(session: &DeviceSession<MockQueue>, tag: Tag) -> Vec<Call> {
        let calls = session.queue().calls();
        let discard = calls
            .iter()
            .position(|call| *call == Call::Discard(tag))
            .expect("block was not discarded");
        calls[discard + 1..].to_vec()
    }

    #[test]
    fn timeout_discards_and_drains_once() {
        let session = session_with([Behavior::Hang]);
        let mut buffer = vec![0; 64];

        let result = bulk_read(&session, 0x81, &mut buffer, 20);

        assert!(matches!(result, Err(Error::Timeout)));
        let tag = session.queue().submitted()[0].0;
        assert_eq!(discards(&session), 1);
        assert_eq!(after_discard(&session, tag), [Call::Reap(Some(tag))]);
        assert_eq!(session.queue().reaped(tag), 1);
        assert_eq!(session.outstanding(), 0);
    }

    #[test]
    fn bytes_of_a_cancelled_block_do_not_mask_the_timeout() {
        let session = session_with([Behavior::Hang]);
        session.queue().unlink_with(5, -libc::ECONNRESET);
        let mut buffer = vec![0; 64];

        let report = transfer_report(
            &session,
            TransferKind::Bulk,
            0x81,
            TransferBuffer::In(&mut buffer),
            10,
        );

        assert_eq!(report.transferred, 0);
        assert_eq!(report.unlinked, 5);
        assert!(matches!(report.into_result(), Err(Error::Timeout)));
        assert_eq!(discards(&session), 1);
    }

    #[test]
    fn bulk_read_times_out_despite_unlinked_bytes() {
        let session = session_with([Behavior::Hang]);
        session.queue().unlink_with(5, -libc::ECONNRESET);
        let mut buffer = vec![0; 64];

        let result = bulk_read(&session, 0x81, &mut buffer, 10);

        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(result.unwrap_err().errno(), -116);
    }

    #[test]
    fn reap_failure_discards_and_drains() {
        let session = session_with([Behavior::Hang]);
        session.queue().fail_next_reap(libc::EIO);
        let mut buffer = vec![0; 64];

        let result = bulk_read(&session, 0x81, &mut buffer, 1000);

        assert!(matches!(result, Err(Error::Reap(_))));
        let tag = session.queue().submitted()[0].0;
        assert_eq!(discards(&session), 1);
        assert_eq!(after_discard(&session, tag), [Call::Reap(Some(tag))]);
        assert_eq!(session.outstanding(), 0);
    }

    #[test]
    fn draining_one_transfer_does_not_stall_another() {
        let queue = MockQueue::default();
        queue.script([Behavior::Stuck]);
        let session = Arc::new(DeviceSession::new(queue));

        let stuck = {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                let mut buffer = vec![0; 8];
                bulk_read(&session, 0x81, &mut buffer, 10)
            })
        };
        // Let the first transfer time out and start draining.
        thread::sleep(Duration::from_millis(40));
        let stuck_tag = session.queue().submitted()[0].0;
        assert_eq!(discards(&session), 1);

        let started = Instant::now();
        let mut buffer = vec![0; 8];
        assert_eq!(bulk_read(&session, 0x82, &mut buffer, 10).unwrap(), 8);
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!stuck.is_finished());

        session.queue().finish(stuck_tag, 0);
        assert!(matches!(stuck.join().unwrap(), Err(Error::Timeout)));
        assert_eq!(session.outstanding(), 0);
    }

    #[test]
    fn timeout_after_progress_reports_bytes() {
        let session = session_with([Behavior::Full, Behavior::Hang]);
        let data = vec![0; 2 * MAX_CHUNK];

        let report = transfer_report(
            &session,
            TransferKind::Bulk,
            0x01,
            TransferBuffer::Out(&data),
            20,
        );

        assert_eq!(report.transferred, MAX_CHUNK);
        assert!(matches!(report.error, Some(Error::Timeout)));
        assert_eq!(report.into_result().unwrap(), MAX_CHUNK);
        assert_eq!(discards(&session), 1);
    }

    #[test]
    fn rejected_submission_is_not_discarded() {
        let session = session_with([Behavior::Reject(libc::ENODEV)]);

        let result = bulk_write(&session, 0x01, &[1, 2, 3], 1000);

        assert!(matches!(result, Err(Error::Submit { .. })));
        assert_eq!(discards(&session), 0);
        assert_eq!(result.unwrap_err().errno(), -libc::ENODEV);
    }

    #[test]
    fn rejection_after_progress_is_partial_success() {
        let session = session_with([Behavior::Full, Behavior::Reject(libc::EPIPE)]);
        let data = vec![0; MAX_CHUNK + 1];

        assert_eq!(bulk_write(&session, 0x01, &data, 1000).unwrap(), MAX_CHUNK);
    }

    #[test]
    fn error_status_surfaces_without_progress() {
        let session = session_with([Behavior::Status {
            actual: 0,
            status: -libc::EPIPE,
        }]);
        let mut buffer = [0; 8];

        let result = interrupt_read(&session, 0x81, &mut buffer, 1000);

        assert!(matches!(result, Err(Error::Status(status)) if status == -libc::EPIPE));
        assert_eq!(discards(&session), 0);
    }

    #[test]
    fn direction_bit_is_normalized() {
        let session = session_with([]);
        let mut buffer = [0; 4];

        interrupt_read(&session, 0x02, &mut buffer, 1000).unwrap();
        interrupt_write(&session, 0x83, &buffer, 1000).unwrap();

        let endpoints: Vec<u8> = session
            .queue()
            .submitted()
            .into_iter()
            .map(|(_, endpoint, _)| endpoint)
            .collect();
        assert_eq!(endpoints, [0x82, 0x03]);
    }

    #[test]
    fn empty_write_sends_one_zero_length_block() {
        let session = session_with([]);

        assert_eq!(bulk_write(&session, 0x01, &[], 1000).unwrap(), 0);
        assert_eq!(session.queue().submitted().len(), 1);
        assert_eq!(session.queue().submitted()[0].2, 0);
    }

    #[test]
    fn custom_chunk_size_is_honored() {
        let config = SessionConfig {
            max_chunk: 64,
            ..Default::default()
        };
        let session = DeviceSession::with_config(MockQueue::default(), config);

        assert_eq!(bulk_write(&session, 0x01, &[0; 200], 1000).unwrap(), 200);
        assert_eq!(session.queue().submitted().len(), 4);
    }

    #[test]
    fn concurrent_transfers_share_one_session() {
        let session = Arc::new(DeviceSession::new(MockQueue::default()));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let session = Arc::clone(&session);
                thread::spawn(move || {
                    let mut buffer = vec![0; 3 * MAX_CHUNK];
                    for _ in 0..8 {
                        assert_eq!(
                            bulk_read(&session, 0x81, &mut buffer, 1000).unwrap(),
                            buffer.len()
                        );
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(session.outstanding(), 0);
        assert_eq!(session.parked(), 0);
    }

    proptest! {
        #[test]
        fn short_chunk_ends_transfer(chunks in 1usize..5, short_at in 0usize..5, short_len in 0usize..64) {
            let config = SessionConfig { max_chunk: 64, ..Default::default() };
            let queue = MockQueue::default();
            queue.script((0..chunks).map(|i| if i == short_at {
                Behavior::Short(short_len)
            } else {
                Behavior::Full
            }));
            let session = DeviceSession::with_config(queue, config);
            let mut buffer = vec![0; chunks * 64];

            let read = bulk_read(&session, 0x81, &mut buffer, 1000).unwrap();

            let expected = if short_at < chunks { short_at * 64 + short_len } else { chunks * 64 };
            let expected_blocks = if short_at < chunks { short_at + 1 } else { chunks };
            prop_assert_eq!(read, expected);
            prop_assert_eq!(session.queue().submitted().len(), expected_blocks);
        }
    }
}
