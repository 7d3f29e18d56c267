//! # URB Transfer Core
//!
//! This module adapts an asynchronous request-block primitive to synchronous
//! and explicitly asynchronous transfers. It never talks to a kernel
//! directly; everything goes through a [`queue::CompletionQueue`], so the
//! same code runs against usbfs, a mock or another OS's equivalent.
//!
//! The pieces, leaf-first:
//!
//! - [`urb`]: the inert description of one request block.
//! - [`queue`]: the submit / reap / discard contract of a transport.
//! - [`session`]: one shared completion queue plus the bookkeeping that lets
//!   unrelated callers share it.
//! - [`deadline`]: absolute deadlines and the poll loop.
//! - [`engine`]: chunked blocking transfers.
//! - [`context`]: caller-managed asynchronous transfers.

#![deny(missing_debug_implementations)]
#![warn(missing_docs)]

pub mod context;
pub mod deadline;
pub mod engine;
pub mod error;
pub mod queue;
pub mod session;
pub mod urb;

#[cfg(test)]
pub(crate) mod mock;

pub use context::{AsyncContext, ContextState};
pub use engine::{TransferBuffer, TransferReport};
pub use error::{Error, Result};
pub use queue::{Completion, CompletionQueue, Tag};
pub use session::{DeviceSession, SessionConfig};
pub use urb::{Direction, Endpoint, RequestBlock, TransferKind};
