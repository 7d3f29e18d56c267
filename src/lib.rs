//! # usbxfer
//!
//! Bulk and interrupt transfers for USB devices whose host interface only
//! offers asynchronous request blocks (URBs): submit now, reap later.
//!
//! The [`transfer`] module contains the transport-independent core. It turns
//! the submit/reap/discard primitive of a [`CompletionQueue`] into blocking
//! calls ([`transfer::engine`]) and explicit asynchronous handles
//! ([`transfer::context`]). [`usbfs`] provides the Linux implementation of
//! the queue, and [`capture`] can record all URB traffic as a pcap file.
//!
//! [`CompletionQueue`]: transfer::queue::CompletionQueue

pub mod capture;
pub mod transfer;
pub mod usbfs;
