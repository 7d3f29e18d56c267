//! # Linux usbfs Transport
//!
//! [`UsbfsQueue`] implements [`CompletionQueue`] on top of a usbfs device
//! node (`/dev/bus/usb/BBB/DDD`). Request blocks become `usbdevfs_urb`
//! structures, the tag travels in their `usercontext` field, and the
//! device's completion queue is read with `REAPURBNDELAY`.

use std::{
    collections::HashMap,
    ffi::c_void,
    fmt,
    fs::{File, OpenOptions},
    io,
    os::fd::{AsFd, AsRawFd},
    path::{Path, PathBuf},
    ptr,
    sync::Mutex,
    time::Duration,
};

use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};
use tracing::{debug, trace, warn};

use crate::transfer::{
    queue::{Completion, CompletionQueue, Tag},
    urb::RequestBlock,
};

/// Where usbfs device nodes live unless [`DEVFS_PATH_ENV`] says otherwise.
pub const DEFAULT_DEVFS_PATH: &str = "/dev/bus/usb";

/// Environment variable overriding the usbfs root directory.
pub const DEVFS_PATH_ENV: &str = "USB_DEVFS_PATH";

mod sys {
    use std::ffi::{c_int, c_uint, c_void};

    /// `struct usbdevfs_urb` without the trailing isochronous descriptors.
    #[repr(C)]
    #[derive(Debug)]
    pub struct UsbdevfsUrb {
        pub urb_type: u8,
        pub endpoint: u8,
        pub status: c_int,
        pub flags: c_uint,
        pub buffer: *mut c_void,
        pub buffer_length: c_int,
        pub actual_length: c_int,
        pub start_frame: c_int,
        pub stream_id: c_int,
        pub error_count: c_int,
        pub signr: c_uint,
        pub usercontext: *mut c_void,
    }

    nix::ioctl_read!(submit_urb, b'U', 10, UsbdevfsUrb);
    nix::ioctl_write_ptr_bad!(discard_urb, nix::request_code_none!(b'U', 11), UsbdevfsUrb);
    nix::ioctl_read_bad!(
        reap_urb_ndelay,
        nix::request_code_write!(b'U', 13, std::mem::size_of::<*mut c_void>()),
        *mut c_void
    );
    nix::ioctl_read!(claim_interface, b'U', 15, c_uint);
    nix::ioctl_read!(release_interface, b'U', 16, c_uint);
}

/// A URB the kernel may currently access.
///
/// Boxed so its address stays put while the map it lives in changes.
struct KernelUrb(Box<sys::UsbdevfsUrb>);

// SAFETY: The raw pointers inside only point into caller buffers whose
// validity the submitter guarantees. They are never dereferenced by us.
unsafe impl Send for KernelUrb {}

/// An open usbfs device node and its URB completion queue.
pub struct UsbfsQueue {
    // Declared before `urbs`: closing the file makes the kernel kill and
    // forget all outstanding URBs before their memory goes away.
    file: File,
    path: PathBuf,
    urbs: Mutex<HashMap<Tag, KernelUrb>>,
}

impl fmt::Debug for UsbfsQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbfsQueue")
            .field("path", &self.path)
            .field("fd", &self.file.as_raw_fd())
            .field("in_flight", &self.urbs.lock().unwrap().len())
            .finish()
    }
}

impl UsbfsQueue {
    /// Open the device node at `path`, read-write if permitted and
    /// read-only otherwise.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();

        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(error) => {
                debug!(
                    "Opening {} read-write failed ({error}), retrying read-only",
                    path.display()
                );
                OpenOptions::new().read(true).open(path)?
            }
        };

        Ok(Self::from_file(file, path))
    }

    /// Wrap an already open device node.
    pub fn from_file(file: File, path: impl Into<PathBuf>) -> Self {
        Self {
            file,
            path: path.into(),
            urbs: Mutex::default(),
        }
    }

    /// The path the device node was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Claim `interface` for this process.
    pub fn claim_interface(&self, interface: u32) -> io::Result<()> {
        let mut interface = interface;
        // SAFETY: CLAIMINTERFACE reads one unsigned int.
        unsafe { sys::claim_interface(self.file.as_raw_fd(), &mut interface) }?;
        Ok(())
    }

    /// Hand `interface` back to the kernel.
    pub fn release_interface(&self, interface: u32) -> io::Result<()> {
        let mut interface = interface;
        // SAFETY: RELEASEINTERFACE reads one unsigned int.
        unsafe { sys::release_interface(self.file.as_raw_fd(), &mut interface) }?;
        Ok(())
    }

    /// Turn a URB pointer returned by REAPURBNDELAY into a completion and
    /// free our copy of the URB.
    ///
    /// Every URB we submit is in `urbs` before the kernel can hand it back,
    /// so an unknown pointer was not submitted through this queue.
    fn complete(&self, urb: *mut c_void) -> Option<Completion> {
        // SAFETY: The kernel only returns pointers submitted on this fd, and
        // ours stay allocated until they are removed from `urbs` below.
        let tag = Tag::new(unsafe { (*urb.cast::<sys::UsbdevfsUrb>()).usercontext } as u64);

        let Some(KernelUrb(urb)) = self.urbs.lock().unwrap().remove(&tag) else {
            warn!("Ignoring reaped URB with unknown {tag}");
            return None;
        };

        Some(Completion {
            tag,
            actual_length: urb.actual_length.max(0) as usize,
            status: urb.status,
        })
    }
}

impl CompletionQueue for UsbfsQueue {
    unsafe fn submit(&self, tag: Tag, block: &RequestBlock<'_>) -> io::Result<()> {
        let buffer_length =
            i32::try_from(block.requested_length()).map_err(|_| io::Error::from(Errno::EINVAL))?;

        let mut urb = Box::new(sys::UsbdevfsUrb {
            urb_type: block.kind().linux_type(),
            endpoint: block.endpoint().address(),
            status: 0,
            flags: 0,
            buffer: block.as_mut_ptr().cast(),
            buffer_length,
            actual_length: 0,
            start_frame: 0,
            stream_id: 0,
            error_count: 0,
            signr: 0,
            usercontext: tag.get() as *mut c_void,
        });

        // Hold the lock across the ioctl. A concurrent reap of this URB has
        // to wait until it is in the map.
        let mut urbs = self.urbs.lock().unwrap();

        // SAFETY: `urb` is a valid URB. It stays allocated until reaped,
        // and the caller keeps the buffer alive just as long.
        unsafe { sys::submit_urb(self.file.as_raw_fd(), &mut *urb) }?;

        urbs.insert(tag, KernelUrb(urb));
        Ok(())
    }

    fn reap_nonblocking(&self) -> io::Result<Option<Completion>> {
        loop {
            let mut urb: *mut c_void = ptr::null_mut();

            // SAFETY: REAPURBNDELAY writes one pointer.
            match unsafe { sys::reap_urb_ndelay(self.file.as_raw_fd(), &mut urb) } {
                Ok(_) => {
                    if let Some(completion) = self.complete(urb) {
                        return Ok(Some(completion));
                    }
                }
                Err(Errno::EAGAIN) => return Ok(None),
                Err(Errno::EINTR) => trace!("Reap interrupted, retrying"),
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    fn discard(&self, tag: Tag) -> io::Result<()> {
        // Keep the lock so the URB cannot be reaped and freed under us.
        let urbs = self.urbs.lock().unwrap();
        let KernelUrb(urb) = urbs.get(&tag).ok_or(io::Error::from(Errno::EINVAL))?;

        // SAFETY: `urb` is the URB we submitted under `tag`.
        unsafe { sys::discard_urb(self.file.as_raw_fd(), &**urb) }?;
        Ok(())
    }

    fn wait_ready(&self, timeout: Duration) -> io::Result<()> {
        let millis = u16::try_from(timeout.as_micros().div_ceil(1000)).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLOUT)];

        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(_) | Err(Errno::EINTR) => Ok(()),
            Err(errno) => Err(errno.into()),
        }
    }
}

/// The usbfs root directory: `$USB_DEVFS_PATH` if it names a directory,
/// `/dev/bus/usb` otherwise.
pub fn devfs_root() -> PathBuf {
    std::env::var_os(DEVFS_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| path.is_dir())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DEVFS_PATH))
}

/// The device node of the device with `address` on `bus`.
pub fn device_path(root: &Path, bus: u16, address: u8) -> PathBuf {
    root.join(format!("{bus:03}")).join(format!("{address:03}"))
}

/// Extract bus number and device address from a device node path.
pub fn parse_device_path(path: &Path) -> Option<(u16, u8)> {
    let address = path.file_name()?.to_str()?.parse().ok()?;
    let bus = path.parent()?.file_name()?.to_str()?.parse().ok()?;
    Some((bus, address))
}
