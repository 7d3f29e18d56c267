//! # Request Blocks
//!
//! A [`RequestBlock`] describes one unit of transfer work: which endpoint,
//! which kind of transfer and which piece of memory the kernel may read from
//! or write into. Building a block has no side effects. It only becomes
//! "outstanding" once it is submitted through a
//! [`DeviceSession`](super::session::DeviceSession).

use std::{fmt, marker::PhantomData};

/// Bit 7 of an endpoint address selects the IN (device to host) direction.
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// The transfer types the core supports.
///
/// Isochronous transfers are not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// Periodic, latency-bounded transfers.
    Interrupt,
    /// Bulk transfers without timing guarantees.
    Bulk,
}

impl TransferKind {
    /// The transfer type number used by usbfs and usbmon.
    pub const fn linux_type(self) -> u8 {
        match self {
            Self::Interrupt => 1,
            Self::Bulk => 3,
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Interrupt => "interrupt",
            Self::Bulk => "bulk",
        };
        write!(f, "{name}")
    }
}

/// Direction of a transfer as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host.
    In,
    /// Host to device.
    Out,
}

/// An endpoint address including its direction bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(u8);

impl Endpoint {
    /// Wrap a raw endpoint address.
    pub const fn new(address: u8) -> Self {
        Self(address)
    }

    /// The raw address, direction bit included.
    pub const fn address(self) -> u8 {
        self.0
    }

    /// The endpoint number without the direction bit.
    pub const fn number(self) -> u8 {
        self.0 & 0x0f
    }

    /// The direction encoded in bit 7.
    pub const fn direction(self) -> Direction {
        if self.0 & ENDPOINT_DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Force the direction bit to match `direction`.
    pub const fn with_direction(self, direction: Direction) -> Self {
        match direction {
            Direction::In => Self(self.0 | ENDPOINT_DIR_IN),
            Direction::Out => Self(self.0 & !ENDPOINT_DIR_IN),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction() {
            Direction::In => "IN",
            Direction::Out => "OUT",
        };
        write!(f, "EP{} {direction}", self.number())
    }
}

/// One request block over a borrowed buffer.
///
/// The block keeps the buffer borrowed for `'a`, but it hands the kernel a
/// raw pointer. Whoever submits the block is responsible for reaping its
/// completion before the borrow ends (see
/// [`CompletionQueue::submit`](super::queue::CompletionQueue::submit)).
#[derive(Debug)]
pub struct RequestBlock<'a> {
    kind: TransferKind,
    endpoint: Endpoint,
    data: *mut u8,
    len: usize,
    _buffer: PhantomData<&'a mut [u8]>,
}

impl<'a> RequestBlock<'a> {
    /// Create a block whose direction is taken from `endpoint` as given.
    pub fn new(kind: TransferKind, endpoint: Endpoint, buffer: &'a mut [u8]) -> Self {
        Self {
            kind,
            endpoint,
            data: buffer.as_mut_ptr(),
            len: buffer.len(),
            _buffer: PhantomData,
        }
    }

    /// Create a block that reads into `buffer`. The IN bit of `endpoint` is
    /// forced on.
    pub fn read(kind: TransferKind, endpoint: u8, buffer: &'a mut [u8]) -> Self {
        Self::new(
            kind,
            Endpoint::new(endpoint).with_direction(Direction::In),
            buffer,
        )
    }

    /// Create a block that sends `buffer`. The IN bit of `endpoint` is
    /// cleared.
    pub fn write(kind: TransferKind, endpoint: u8, buffer: &'a [u8]) -> Self {
        Self {
            kind,
            endpoint: Endpoint::new(endpoint).with_direction(Direction::Out),
            // The kernel only reads from OUT buffers.
            data: buffer.as_ptr().cast_mut(),
            len: buffer.len(),
            _buffer: PhantomData,
        }
    }

    /// The transfer type.
    pub const fn kind(&self) -> TransferKind {
        self.kind
    }

    /// The endpoint, with its direction bit normalized.
    pub const fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// The direction of this block.
    pub const fn direction(&self) -> Direction {
        self.endpoint.direction()
    }

    /// The number of bytes the block asks the kernel to move.
    pub const fn requested_length(&self) -> usize {
        self.len
    }

    /// The start of the buffer region as handed to the kernel.
    pub const fn as_mut_ptr(&self) -> *mut u8 {
        self.data
    }

    /// The first `len` bytes of the buffer.
    ///
    /// Only call this while the kernel cannot write to the buffer, i.e. for
    /// OUT blocks or after the completion of an IN block was reaped.
    pub(crate) fn payload(&self, len: usize) -> &[u8] {
        // SAFETY: `data..data + self.len` is borrowed for `'a` by this block.
        // Callers guarantee that no kernel write is in flight.
        unsafe { std::slice::from_raw_parts(self.data, len.min(self.len)) }
    }
}
