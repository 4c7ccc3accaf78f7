//! invctl
//!
//! A command-line interface (CLI) for reading and configuring solar inverters,
//! battery banks and MID controllers through the vendor cloud or a local
//! Modbus-TCP gateway.
//!
//! This tool allows users to:
//! - Print the register catalog of a device family.
//! - Refresh runtime, energy, battery or parameter records as JSON.
//! - Read arbitrary register ranges.
//! - Write parameters and switch function flags.
//!
//! Transports and devices come from a YAML configuration file.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use inverter_link::{
    assembler::DeviceDataAssembler,
    cache::Cache,
    cloud::{CloudTransport, HttpCloudApi},
    codec::PhysicalValue,
    config::Config,
    families,
    local::LocalTransport,
    register_map::DeviceFamily,
    transport::Transport,
};
use log::*;
use std::{panic, sync::Arc, time::Duration};

mod commandline;

use commandline::{CliCommands, TransportKind};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

fn print_catalog(family: DeviceFamily) {
    println!(
        "{:<44} {:<7} {:>5} {:>2} {:<10} {:<4} {:<3} {:<11} DESCRIPTION",
        "NAME", "KIND", "ADDR", "N", "CATEGORY", "UNIT", "RW", "CONFIDENCE"
    );
    for entry in families::register_map(family).catalog() {
        println!(
            "{:<44} {:<7} {:>5} {:>2} {:<10} {:<4} {:<3} {:<11} {}",
            entry.name,
            entry.kind,
            entry.address,
            entry.registers,
            entry.category,
            entry.unit,
            if entry.writable { "rw" } else { "r" },
            format!("{:?}", entry.confidence),
            entry.description
        );
    }
}

/// Opens the selected transport, preferring the local link when none is selected.
async fn open_transport(
    config: &Config,
    selected: Option<TransportKind>,
) -> Result<Arc<dyn Transport>> {
    let kind = match selected {
        Some(kind) => kind,
        None if config.local.is_some() => TransportKind::Local,
        None => TransportKind::Cloud,
    };
    match kind {
        TransportKind::Local => {
            let local = config
                .local
                .as_ref()
                .context("No `local` section in the configuration")?;
            info!("Attempting to connect via Modbus-TCP to {}...", local.address);
            let transport =
                LocalTransport::connect(local.address, local.timeout, local.timeout_retries)
                    .await
                    .with_context(|| {
                        format!("Failed to connect to Modbus-TCP gateway at {}", local.address)
                    })?;
            Ok(Arc::new(transport))
        }
        TransportKind::Cloud => {
            let cloud = config
                .cloud
                .as_ref()
                .context("No `cloud` section in the configuration")?;
            info!("Using cloud portal {}", cloud.base_url);
            let api = HttpCloudApi::new(
                &cloud.base_url,
                &cloud.username,
                &cloud.password,
                cloud.timeout,
            )?;
            Ok(Arc::new(CloudTransport::new(api, cloud.retry)))
        }
    }
}

/// Prompts the user before anything is written to a device.
fn confirm_write(serial: &str, what: &str) -> Result<bool> {
    println!("About to write {what} on device {serial}.");
    println!("Writes change the device configuration and are not repeated on failure.");
    Confirm::new()
        .with_prompt("Do you want to continue?")
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")
}

fn print_words(start: u16, words: &[u16]) {
    for (offset, word) in words.iter().enumerate() {
        let address = usize::from(start) + offset;
        println!("{address:>5} (0x{address:04X}): {word:>5}  0x{word:04X}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!("invctl started. Log level: {}", args.verbose.log_level_filter());

    // The catalog is static and needs neither configuration nor transport
    if let CliCommands::Catalog { family } = &args.command {
        print_catalog(*family);
        return Ok(());
    }

    let config = Config::load(&args.config)
        .with_context(|| format!("Cannot load configuration {}", args.config.display()))?;
    let transport = open_transport(&config, args.transport).await?;
    let assembler =
        DeviceDataAssembler::new(config.device_arena()?, transport, Cache::new(config.cache));

    match &args.command {
        CliCommands::Catalog { .. } => unreachable!("Catalog is handled earlier."),
        CliCommands::Read { serial, category } => {
            info!("Executing: Read {category} of {serial}");
            let id = assembler.devices().id_of(serial)?;
            let refresh = assembler
                .refresh(id, *category)
                .await
                .with_context(|| format!("Cannot read {category} of {serial}"))?;
            let age = (Utc::now() - refresh.record.captured_at())
                .to_std()
                .unwrap_or_default();
            eprintln!(
                "{serial}: {category} ({}, captured {} ago)",
                refresh.freshness,
                humantime::format_duration(Duration::from_secs(age.as_secs()))
            );
            println!("{}", serde_json::to_string_pretty(&*refresh.record)?);
        }
        CliCommands::Raw {
            serial,
            kind,
            start,
            count,
        } => {
            info!("Executing: Read {count} {kind} register(s) from {start} of {serial}");
            let device = assembler.devices().by_serial(serial)?;
            let words = assembler
                .transport()
                .read_range(&device.address, *kind, *start, *count)
                .await
                .with_context(|| {
                    format!("Cannot read {kind} registers {start}+{count} of {serial}")
                })?;
            print_words(*start, &words);
        }
        CliCommands::Write {
            serial,
            name,
            value,
            yes,
        } => {
            let id = assembler.devices().id_of(serial)?;
            if !*yes && !confirm_write(serial, &format!("`{name}` = {value}"))? {
                info!("Write aborted by user.");
                return Ok(());
            }
            info!("Executing: Write {name} = {value} on {serial}");
            assembler
                .write_parameter(id, name, value.clone())
                .await
                .with_context(|| format!("Failed to write {name} = {value} on {serial}"))?;
            println!("{name} set to {value} on {serial} successfully.");
        }
        CliCommands::Flag {
            serial,
            flag,
            state,
            yes,
        } => {
            let id = assembler.devices().id_of(serial)?;
            let switch = PhysicalValue::Bool(*state);
            if !*yes && !confirm_write(serial, &format!("flag `{flag}` = {switch}"))? {
                info!("Write aborted by user.");
                return Ok(());
            }
            info!("Executing: Switch {flag} {switch} on {serial}");
            assembler
                .set_flag(id, flag, *state)
                .await
                .with_context(|| format!("Failed to switch {flag} on {serial}"))?;
            let state = if *state { "on" } else { "off" };
            println!("{flag} switched {state} on {serial} successfully.");
        }
    }

    Ok(())
}
