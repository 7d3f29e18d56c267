mod cli;

use std::{
    fs,
    io::{self, Read, Write},
};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command, TransferTarget};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use usbxfer::{
    capture,
    transfer::{engine, DeviceSession},
    usbfs::{self, UsbfsQueue},
};

fn main() -> Result<()> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;
    tracing_log::LogTracer::init().context("Failed to forward log records to tracing")?;

    capture::enable(args.pcap_dir);

    match args.command {
        Command::List => list_devices(),
        Command::Read { target, length } => read(&target, length),
        Command::Write { target, input } => {
            let data = match input {
                Some(path) => fs::read(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => {
                    let mut data = Vec::new();
                    io::stdin()
                        .read_to_end(&mut data)
                        .context("Failed to read stdin")?;
                    data
                }
            };
            write(&target, &data)
        }
    }
}

fn list_devices() -> Result<()> {
    let root = usbfs::devfs_root();

    for device in nusb::list_devices().context("Failed to enumerate USB devices")? {
        println!(
            "{}  {:04x}:{:04x}  {}",
            usbfs::device_path(
                &root,
                device.bus_number().into(),
                device.device_address()
            )
            .display(),
            device.vendor_id(),
            device.product_id(),
            device.product_string().unwrap_or("")
        );
    }

    Ok(())
}

/// Run `f` on a session for `target` with its interface claimed.
fn with_session<T>(
    target: &TransferTarget,
    f: impl FnOnce(&DeviceSession<UsbfsQueue>) -> Result<T>,
) -> Result<T> {
    let path = target.device_path();
    let queue =
        UsbfsQueue::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;

    if let Some(interface) = target.interface {
        queue
            .claim_interface(interface)
            .with_context(|| format!("Failed to claim interface {interface}"))?;
    }

    let session = DeviceSession::with_config(queue, target.session_config());
    let result = f(&session);

    if let Some(interface) = target.interface {
        if let Err(error) = session.queue().release_interface(interface) {
            warn!("Failed to release interface {interface}: {error}");
        }
    }

    result
}

fn read(target: &TransferTarget, length: usize) -> Result<()> {
    let mut buffer = vec![0; length];

    let read = with_session(target, |session| {
        let read = if target.interrupt {
            engine::interrupt_read(session, target.endpoint, &mut buffer, target.timeout)
        } else {
            engine::bulk_read(session, target.endpoint, &mut buffer, target.timeout)
        };
        read.context("Read failed")
    })?;

    info!("Read {read} of {length} bytes");

    let mut stdout = io::stdout().lock();
    stdout
        .write_all(&buffer[..read])
        .and_then(|()| stdout.flush())
        .context("Failed to write to stdout")
}

fn write(target: &TransferTarget, data: &[u8]) -> Result<()> {
    let written = with_session(target, |session| {
        let written = if target.interrupt {
            engine::interrupt_write(session, target.endpoint, data, target.timeout)
        } else {
            engine::bulk_write(session, target.endpoint, data, target.timeout)
        };
        written.context("Write failed")
    })?;

    info!("Wrote {written} of {} bytes", data.len());
    Ok(())
}
