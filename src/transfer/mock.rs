//! A scripted in-memory [`CompletionQueue`] for tests.

#![allow(missing_docs)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    io,
    sync::Mutex,
    time::Duration,
};

use super::{
    queue::{Completion, CompletionQueue, Tag},
    urb::{Direction, RequestBlock},
};

/// What the mock does with the next submitted block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Complete immediately with the full requested length.
    Full,
    /// Complete immediately with at most this many bytes.
    Short(usize),
    /// Complete immediately with an error status.
    Status { actual: usize, status: i32 },
    /// Stay in flight until discarded or finished by the test.
    Hang,
    /// Like [`Behavior::Hang`], but a discard only takes effect once the
    /// test calls [`MockQueue::finish`].
    Stuck,
    /// Refuse the submission with this errno.
    Reject(i32),
}

/// A call the core made into the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Submit {
        tag: Tag,
        endpoint: u8,
        length: usize,
    },
    /// A reap and the tag it popped, if any.
    Reap(Option<Tag>),
    Discard(Tag),
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<Behavior>,
    completed: VecDeque<Completion>,
    in_flight: HashMap<Tag, usize>,
    stuck: HashSet<Tag>,
    /// Completions handed out by `discard` instead of the usual empty one.
    unlinked: VecDeque<(usize, i32)>,
    calls: Vec<Call>,
    reap_error: Option<i32>,
    next_reap_errors: VecDeque<i32>,
}

#[derive(Debug, Default)]
pub struct MockQueue {
    state: Mutex<MockState>,
}

impl MockQueue {
    /// Queue behaviors for the next submissions. Unscripted submissions
    /// behave like [`Behavior::Full`].
    pub fn script(&self, behaviors: impl IntoIterator<Item = Behavior>) {
        self.state.lock().unwrap().script.extend(behaviors);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, filter: impl Fn(&Call) -> bool) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| filter(call))
            .count()
    }

    /// How often a reap returned the completion of `tag`.
    pub fn reaped(&self, tag: Tag) -> usize {
        self.count(|call| *call == Call::Reap(Some(tag)))
    }

    pub fn submitted(&self) -> Vec<(Tag, u8, usize)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Submit {
                    tag,
                    endpoint,
                    length,
                } => Some((tag, endpoint, length)),
                _ => None,
            })
            .collect()
    }

    /// Put an arbitrary completion on the queue.
    pub fn push_completion(&self, completion: Completion) {
        self.state.lock().unwrap().completed.push_back(completion);
    }

    /// Complete a hanging or stuck block with `actual` bytes.
    pub fn finish(&self, tag: Tag, actual: usize) {
        let mut state = self.state.lock().unwrap();
        let requested = state.in_flight.remove(&tag).expect("block is not in flight");
        state.stuck.remove(&tag);

        state.completed.push_back(Completion {
            tag,
            actual_length: actual.min(requested),
            status: 0,
        });
    }

    /// Let the next discard report `actual` bytes moved with `status`.
    pub fn unlink_with(&self, actual: usize, status: i32) {
        self.state.lock().unwrap().unlinked.push_back((actual, status));
    }

    /// Make every following reap fail with `errno`.
    pub fn fail_reaps(&self, errno: i32) {
        self.state.lock().unwrap().reap_error = Some(errno);
    }

    /// Make only the next reap fail with `errno`.
    pub fn fail_next_reap(&self, errno: i32) {
        self.state.lock().unwrap().next_reap_errors.push_back(errno);
    }
}

impl CompletionQueue for MockQueue {
    unsafe fn submit(&self, tag: Tag, block: &RequestBlock<'_>) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let requested = block.requested_length();

        state.calls.push(Call::Submit {
            tag,
            endpoint: block.endpoint().address(),
            length: requested,
        });

        let behavior = state.script.pop_front().unwrap_or(Behavior::Full);
        let actual = match behavior {
            Behavior::Reject(errno) => return Err(io::Error::from_raw_os_error(errno)),
            Behavior::Hang => {
                state.in_flight.insert(tag, requested);
                return Ok(());
            }
            Behavior::Stuck => {
                state.in_flight.insert(tag, requested);
                state.stuck.insert(tag);
                return Ok(());
            }
            Behavior::Full => requested,
            Behavior::Short(actual) | Behavior::Status { actual, .. } => actual.min(requested),
        };

        if block.direction() == Direction::In {
            // "Receive" a recognizable pattern: the low byte of the tag.
            //
            // SAFETY: The caller guarantees the block's memory is valid and
            // ours to write until the completion is reaped.
            unsafe { std::ptr::write_bytes(block.as_mut_ptr(), tag.get() as u8, actual) };
        }

        let status = match behavior {
            Behavior::Status { status, .. } => status,
            _ => 0,
        };
        state.completed.push_back(Completion {
            tag,
            actual_length: actual,
            status,
        });

        Ok(())
    }

    fn reap_nonblocking(&self) -> io::Result<Option<Completion>> {
        let mut state = self.state.lock().unwrap();

        if let Some(errno) = state.next_reap_errors.pop_front().or(state.reap_error) {
            state.calls.push(Call::Reap(None));
            return Err(io::Error::from_raw_os_error(errno));
        }

        let completion = state.completed.pop_front();
        state.calls.push(Call::Reap(completion.map(|completion| completion.tag)));
        Ok(completion)
    }

    fn discard(&self, tag: Tag) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();

        state.calls.push(Call::Discard(tag));
        if state.stuck.contains(&tag) {
            return Ok(());
        }
        let Some(requested) = state.in_flight.remove(&tag) else {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        };

        let (actual, status) = state.unlinked.pop_front().unwrap_or((0, -libc::ENOENT));
        state.completed.push_back(Completion {
            tag,
            actual_length: actual.min(requested),
            status,
        });
        Ok(())
    }

    fn wait_ready(&self, timeout: Duration) -> io::Result<()> {
        std::thread::sleep(timeout);
        Ok(())
    }
}
