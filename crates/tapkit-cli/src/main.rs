//! tapkit - read, inspect and store NFC cards
//!
//! The binary plays the part of the application on top of the worker: it
//! starts a job, renders the events the job reports and stores the result.
//! Cards come from the simulated front-end, described on the command line.

mod card;
mod cli;

use anyhow::{Context, Result, bail};
use clap::Parser;
use cli::{Cli, Commands, ReadArgs};
use std::path::Path;
use tapkit_core::format_hex;
use tapkit_hardware::mock::MockTransceiver;
use tapkit_hardware::{AnyTransceiver, HardwareContext};
use tapkit_protocol::MfClassicDict;
use tapkit_worker::{NfcDevice, Worker, WorkerConfig, WorkerEvent, WorkerMode};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => WorkerConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => WorkerConfig::default(),
    };

    match cli.command {
        Commands::Read(args) => run_read(config, args).await,
        Commands::Show { path } => run_show(&path).await,
        Commands::Dict { path, with_builtin } => run_dict(&path, with_builtin).await,
    }
}

async fn run_read(mut config: WorkerConfig, args: ReadArgs) -> Result<()> {
    if let Some(path) = &args.dict {
        config = config.with_dictionary(path);
    }

    let (transceiver, handle) = MockTransceiver::new();
    handle.add_card(card::build(&args.card)?);
    let context = HardwareContext::new(AnyTransceiver::from(transceiver));

    let mut worker = Worker::new(context, config);
    let mut events = worker.start(
        WorkerMode::Read {
            expected: args.expect,
        },
        NfcDevice::new(),
    );

    let mut outcome = None;
    tokio::select! {
        _ = events.dispatch(|event| {
            match &event {
                WorkerEvent::ReadProgress { .. } | WorkerEvent::KeyFound { .. } => {
                    tracing::debug!("{event}");
                }
                _ => println!("{event}"),
            }
            let more = !event.is_terminal();
            outcome = Some(event);
            more
        }) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    let Some(mut device) = worker.stop().await else {
        bail!("Worker was not running");
    };
    match outcome {
        Some(WorkerEvent::Success { partial }) => {
            if partial {
                println!("Some sectors could not be read");
            }
        }
        Some(WorkerEvent::Fail { reason }) => bail!("Read failed: {reason}"),
        _ => {
            if device.data().is_none() {
                bail!("Read aborted before a card was found");
            }
            println!("Read aborted, keeping what was read so far");
        }
    }

    print_device(&device);
    if let Some(path) = &args.output {
        device
            .save(path)
            .await
            .with_context(|| format!("Failed to save {}", path.display()))?;
        println!("Saved to {}", path.display());
    }
    Ok(())
}

async fn run_show(path: &Path) -> Result<()> {
    let device = NfcDevice::load(path)
        .await
        .with_context(|| format!("Failed to load {}", path.display()))?;
    print_device(&device);
    Ok(())
}

async fn run_dict(path: &Path, with_builtin: bool) -> Result<()> {
    let loaded = MfClassicDict::load(path)
        .await
        .with_context(|| format!("Failed to load dictionary {}", path.display()))?;
    info!(keys = loaded.total_keys(), "Dictionary loaded");

    if !with_builtin {
        println!("{} keys", loaded.total_keys());
        return Ok(());
    }
    let mut merged = MfClassicDict::builtin();
    let builtin = merged.total_keys();
    let added = loaded.iter().filter(|key| merged.add_key(**key)).count();
    println!(
        "{} keys ({builtin} built-in, {added} from {})",
        merged.total_keys(),
        path.display()
    );
    Ok(())
}

fn print_device(device: &NfcDevice) {
    let Some(data) = device.data() else {
        println!("Empty device record");
        return;
    };
    let identity = data.iso14443_3a();
    println!("Device type: {}", data.protocol());
    println!("UID: {}", data.uid());
    println!("ATQA: {}", format_hex(&identity.atqa));
    println!("SAK: {:02X}", identity.sak);
    if let Some((read, total)) = data.read_progress() {
        println!("Blocks read: {read}/{total}");
    }
    if let Some(read_at) = device.read_at() {
        println!("Read time: {}", read_at.to_rfc3339());
    }
}
