//! This module implements the CLI interface.
//!
//! Transfer data goes to stdout and comes from stdin, so the tool can sit
//! in a pipeline. Logs always go to stderr.
use std::{
    num::ParseIntError,
    path::PathBuf,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use usbxfer::{
    transfer::{session::MAX_CHUNK, SessionConfig},
    usbfs,
};

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write all URB traffic into a PCAP file inside this directory. The
    /// file will be created when the first packet is logged. Omit this
    /// option to disable PCAP logging.
    #[arg(long = "pcap-dir", value_name = "DIR", global = true)]
    pub pcap_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the USB devices and their usbfs device nodes.
    List,

    /// Read from an IN endpoint and write the data to stdout.
    Read {
        #[command(flatten)]
        target: TransferTarget,

        /// Number of bytes to read.
        #[arg(long, value_name = "BYTES")]
        length: usize,
    },

    /// Read data from stdin and send it to an OUT endpoint.
    Write {
        #[command(flatten)]
        target: TransferTarget,

        /// Send the contents of this file instead of stdin.
        #[arg(long, value_name = "PATH")]
        input: Option<PathBuf>,
    },
}

/// Which device and endpoint to talk to, and how.
#[derive(Args, Debug)]
pub struct TransferTarget {
    /// Path to the usbfs device node, e.g. /dev/bus/usb/001/004.
    ///
    /// This option is mutually exclusive with --bus and --address.
    #[arg(long, value_name = "PATH", conflicts_with_all = ["bus", "address"])]
    device: Option<PathBuf>,

    /// Bus number of the device.
    #[arg(long, requires = "address", required_unless_present = "device")]
    bus: Option<u16>,

    /// Address of the device on its bus.
    #[arg(long, requires = "bus")]
    address: Option<u8>,

    /// Root of the usbfs device nodes. Defaults to $USB_DEVFS_PATH if that
    /// names a directory, /dev/bus/usb otherwise.
    #[arg(long, value_name = "DIR")]
    devfs_path: Option<PathBuf>,

    /// Endpoint address, decimal or 0x-prefixed hex. The direction bit is
    /// set according to the subcommand.
    #[arg(long, value_parser = parse_endpoint)]
    pub endpoint: u8,

    /// Claim this interface before transferring.
    #[arg(long)]
    pub interface: Option<u32>,

    /// Use interrupt instead of bulk transfers.
    #[arg(long)]
    pub interrupt: bool,

    /// Timeout in milliseconds. 0 waits forever.
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    pub timeout: u32,

    /// Largest request block handed to the kernel at once.
    #[arg(long, value_name = "BYTES", default_value_t = MAX_CHUNK)]
    max_chunk: usize,

    /// Upper bound for one readiness wait in microseconds.
    #[arg(long, value_name = "US", default_value_t = 1000)]
    poll_interval_us: u64,
}

impl TransferTarget {
    /// The device node to open.
    pub fn device_path(&self) -> PathBuf {
        match (&self.device, self.bus, self.address) {
            (Some(device), _, _) => device.clone(),
            (None, Some(bus), Some(address)) => {
                let root = self.devfs_path.clone().unwrap_or_else(usbfs::devfs_root);
                usbfs::device_path(&root, bus, address)
            }
            // clap enforces one of the two forms.
            _ => unreachable!(),
        }
    }

    /// The session configuration for this target.
    pub fn session_config(&self) -> SessionConfig {
        let (bus_number, device_address) = match (self.bus, self.address) {
            (Some(bus), Some(address)) => (bus, address),
            _ => usbfs::parse_device_path(&self.device_path()).unwrap_or_default(),
        };

        SessionConfig {
            max_chunk: self.max_chunk,
            poll_interval: Duration::from_micros(self.poll_interval_us),
            bus_number,
            device_address,
        }
    }
}

fn parse_endpoint(value: &str) -> Result<u8, ParseIntError> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_parse_as_hex_or_decimal() {
        assert_eq!(parse_endpoint("0x81").unwrap(), 0x81);
        assert_eq!(parse_endpoint("2").unwrap(), 2);
        assert!(parse_endpoint("0x1ff").is_err());
    }

    #[test]
    fn bus_and_address_resolve_below_devfs_root() {
        let cli = Cli::parse_from([
            "usbxfer",
            "read",
            "--bus",
            "1",
            "--address",
            "4",
            "--devfs-path",
            "/tmp/usb",
            "--endpoint",
            "0x81",
            "--length",
            "64",
        ]);

        let Command::Read { target, length } = cli.command else {
            panic!("expected read");
        };
        assert_eq!(length, 64);
        assert_eq!(target.device_path(), PathBuf::from("/tmp/usb/001/004"));
        assert_eq!(target.session_config().bus_number, 1);
        assert_eq!(target.session_config().device_address, 4);
    }

    #[test]
    fn device_path_supplies_capture_metadata() {
        let cli = Cli::parse_from([
            "usbxfer",
            "-v",
            "write",
            "--device",
            "/dev/bus/usb/002/017",
            "--endpoint",
            "1",
            "--max-chunk",
            "512",
        ]);

        let Command::Write { target, .. } = cli.command else {
            panic!("expected write");
        };
        let config = target.session_config();
        assert_eq!(cli.verbose, 1);
        assert_eq!((config.bus_number, config.device_address), (2, 17));
        assert_eq!(config.max_chunk, 512);
        assert_eq!(target.timeout, 1000);
    }

    #[test]
    fn device_and_bus_conflict() {
        let result = Cli::try_parse_from([
            "usbxfer",
            "read",
            "--device",
            "/dev/bus/usb/001/001",
            "--bus",
            "1",
            "--address",
            "1",
            "--endpoint",
            "1",
            "--length",
            "1",
        ]);

        assert!(result.is_err());
    }
}
