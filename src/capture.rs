//! # Traffic Capture
//!
//! Optionally records every submitted and completed request block into a
//! PCAP file with the `LINKTYPE_USB_LINUX` link type, so transfers can be
//! inspected with Wireshark like a usbmon trace.
//!
//! Capturing is process-wide and off until [`enable`] is called with a
//! directory. The file is created lazily on the first record. Failing to
//! create or write it only switches capturing off, it never fails a
//! transfer.

use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::{debug, warn};

use crate::transfer::{
    urb::{Direction, RequestBlock},
    Completion, SessionConfig, Tag,
};

/// Name of the capture file inside the capture directory.
pub const CAPTURE_FILE_NAME: &str = "usbxfer.pcap";

const LINKTYPE_USB_LINUX: u32 = 189;

/// Size of the usbmon header preceding each record's data.
const USBMON_HEADER_LEN: usize = 48;

/// usbmon's status of a block that is still in flight (`-EINPROGRESS`).
const STATUS_IN_PROGRESS: i32 = -115;

/// The PCAP file header: version 2.4, no timezone offset, 64 KiB snapshots.
fn file_header() -> Vec<u8> {
    let mut header = Vec::with_capacity(24);
    header.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    header.extend_from_slice(&2u16.to_le_bytes());
    header.extend_from_slice(&4u16.to_le_bytes());
    header.extend_from_slice(&[0; 8]);
    header.extend_from_slice(&u32::from(u16::MAX).to_le_bytes());
    header.extend_from_slice(&LINKTYPE_USB_LINUX.to_le_bytes());
    header
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Submit,
    Complete,
}

/// One usbmon event about a request block, borrowing the bytes it shows.
#[derive(Debug)]
struct Record<'a> {
    tag: Tag,
    event: Event,
    transfer_type: u8,
    endpoint: u8,
    bus: u16,
    device: u8,
    status: i32,
    length: usize,
    data: &'a [u8],
}

impl<'a> Record<'a> {
    /// OUT blocks show their payload on submission, IN blocks nothing yet.
    fn submit(config: &SessionConfig, tag: Tag, block: &'a RequestBlock<'_>) -> Self {
        let shown = match block.direction() {
            Direction::Out => block.requested_length(),
            Direction::In => 0,
        };

        Self {
            tag,
            event: Event::Submit,
            transfer_type: block.kind().linux_type(),
            endpoint: block.endpoint().address(),
            bus: config.bus_number,
            device: config.device_address,
            status: STATUS_IN_PROGRESS,
            length: block.requested_length(),
            data: block.payload(shown),
        }
    }

    /// IN blocks show the received bytes on completion, OUT blocks only a
    /// length.
    fn complete(
        config: &SessionConfig,
        block: &'a RequestBlock<'_>,
        completion: &Completion,
    ) -> Self {
        let actual = completion.actual_length.min(block.requested_length());
        let shown = match block.direction() {
            Direction::In => actual,
            Direction::Out => 0,
        };

        Self {
            tag: completion.tag,
            event: Event::Complete,
            transfer_type: block.kind().linux_type(),
            endpoint: block.endpoint().address(),
            bus: config.bus_number,
            device: config.device_address,
            status: completion.status,
            length: actual,
            data: block.payload(shown),
        }
    }

    /// usbmon's "no data" flag: `<` for a submission, `>` for a completion.
    fn data_flag(&self) -> u8 {
        match (self.data.is_empty(), self.event) {
            (false, _) => 0,
            (true, Event::Submit) => b'<',
            (true, Event::Complete) => b'>',
        }
    }

    /// Append the PCAP record of this event, taken `at` after the epoch.
    fn encode(&self, at: Duration, out: &mut Vec<u8>) {
        let captured = (USBMON_HEADER_LEN + self.data.len()) as u32;

        out.extend_from_slice(&(at.as_secs() as u32).to_le_bytes());
        out.extend_from_slice(&at.subsec_micros().to_le_bytes());
        out.extend_from_slice(&captured.to_le_bytes());
        out.extend_from_slice(&captured.to_le_bytes());

        out.extend_from_slice(&self.tag.get().to_le_bytes());
        out.push(match self.event {
            Event::Submit => b'S',
            Event::Complete => b'C',
        });
        out.push(self.transfer_type);
        out.push(self.endpoint);
        out.push(self.device);
        out.extend_from_slice(&self.bus.to_le_bytes());
        // Bulk and interrupt blocks never carry a setup packet.
        out.push(b'-');
        out.push(self.data_flag());
        out.extend_from_slice(&(at.as_secs() as i64).to_le_bytes());
        out.extend_from_slice(&(at.subsec_micros() as i32).to_le_bytes());
        out.extend_from_slice(&self.status.to_le_bytes());
        out.extend_from_slice(&(self.length as u32).to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&[0; 8]);

        out.extend_from_slice(self.data);
    }
}

/// The capture file, opened on its first record.
#[derive(Debug)]
struct CaptureFile {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    failed: bool,
}

impl CaptureFile {
    fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(CAPTURE_FILE_NAME),
            out: None,
            failed: false,
        }
    }

    fn create(&self) -> io::Result<BufWriter<File>> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut out = BufWriter::new(File::create(&self.path)?);
        out.write_all(&file_header())?;
        debug!("Capturing USB traffic into {}", self.path.display());
        Ok(out)
    }

    fn append(&mut self, record: &Record<'_>) {
        if self.failed {
            return;
        }

        let at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut bytes = Vec::with_capacity(16 + USBMON_HEADER_LEN + record.data.len());
        record.encode(at, &mut bytes);

        let written = match self.out.take() {
            Some(out) => Ok(out),
            None => self.create(),
        }
        .and_then(|mut out| {
            out.write_all(&bytes)?;
            out.flush()?;
            Ok(out)
        });

        match written {
            Ok(out) => self.out = Some(out),
            Err(error) => {
                warn!(
                    "Stopping USB capture after failing to write {}: {error}",
                    self.path.display()
                );
                self.failed = true;
            }
        }
    }
}

static CAPTURE: Mutex<Option<CaptureFile>> = Mutex::new(None);

/// Capture into `dir`, or stop capturing for `None`.
pub fn enable(dir: Option<PathBuf>) {
    *CAPTURE.lock().unwrap() = dir.as_deref().map(CaptureFile::new);
}

/// Record the submission of `block` under `tag`.
pub fn record_submit(config: &SessionConfig, tag: Tag, block: &RequestBlock<'_>) {
    if let Some(capture) = CAPTURE.lock().unwrap().as_mut() {
        capture.append(&Record::submit(config, tag, block));
    }
}

/// Record the completion of `block`.
///
/// Only call this after the completion was reaped, so the kernel is done
/// with the block's buffer.
pub fn record_complete(config: &SessionConfig, block: &RequestBlock<'_>, completion: &Completion) {
    if let Some(capture) = CAPTURE.lock().unwrap().as_mut() {
        capture.append(&Record::complete(config, block, completion));
    }
}
