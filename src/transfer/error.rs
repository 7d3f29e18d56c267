//! Error kinds of the transfer core.

use std::io;

use nix::errno::Errno;
use thiserror::Error;

use super::{context::ContextState, urb::Endpoint};

/// Errno value the libusb-0.1 API family reports for timeouts.
pub const ETRANSFER_TIMEDOUT: i32 = 116;

/// Everything that can go wrong in a transfer.
///
/// Every error is scoped to a single transfer or context. None of them leave
/// the completion queue with a stale entry behind.
#[derive(Debug, Error)]
pub enum Error {
    /// The kernel refused the request block. Nothing is outstanding.
    #[error("failed to submit URB to {endpoint}: {source}")]
    Submit {
        /// The endpoint the block was addressed to.
        endpoint: Endpoint,
        /// The error the transport reported.
        #[source]
        source: io::Error,
    },

    /// Accessing the completion queue failed.
    #[error("failed to reap URB: {0}")]
    Reap(#[source] io::Error),

    /// The deadline passed before the expected completion arrived. The block
    /// was discarded and its completion drained before this was returned.
    #[error("transfer timed out")]
    Timeout,

    /// The block completed with a negative errno status, e.g. `-EPIPE` for a
    /// stalled endpoint.
    #[error("URB completed with status {0}")]
    Status(i32),

    /// The asynchronous API was used out of order.
    #[error("cannot {operation} a transfer context that is {state:?}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state the context was in.
        state: ContextState,
    },
}

/// Result alias for the transfer core.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this is a [`Error::Timeout`].
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// The negative errno convention of the libusb-0.1 API family.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Submit { source, .. } | Self::Reap(source) => {
                -source.raw_os_error().unwrap_or(Errno::EIO as i32)
            }
            Self::Timeout => -ETRANSFER_TIMEDOUT,
            Self::Status(status) => *status,
            Self::InvalidState { .. } => -(Errno::EINVAL as i32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        let submit = Error::Submit {
            endpoint: Endpoint::new(0x01),
            source: io::Error::from_raw_os_error(libc::ENODEV),
        };
        let state = Error::InvalidState {
            operation: "free",
            state: ContextState::Submitted,
        };

        assert_eq!(submit.errno(), -libc::ENODEV);
        assert_eq!(Error::Timeout.errno(), -116);
        assert_eq!(Error::Status(-libc::EPIPE).errno(), -libc::EPIPE);
        assert_eq!(state.errno(), -libc::EINVAL);
    }

    #[test]
    fn errors_without_os_code_map_to_eio() {
        let reap = Error::Reap(io::Error::new(io::ErrorKind::Other, "queue gone"));

        assert_eq!(reap.errno(), -libc::EIO);
    }

    #[test]
    fn submit_error_names_the_endpoint() {
        let error = Error::Submit {
            endpoint: Endpoint::new(0x81),
            source: io::Error::from_raw_os_error(libc::ENOENT),
        };

        assert!(error.to_string().starts_with("failed to submit URB to EP1 IN"));
    }
}
