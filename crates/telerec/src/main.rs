// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! telerec CLI
//!
//! # Usage
//!
//! ```bash
//! # Run the service
//! telerec --config telerec.toml
//!
//! # Register devices, then list them
//! telerec register 101 102 103
//! telerec devices
//!
//! # Try it out without a database
//! telerec --memory --device 101
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use telerec::{Config, MemoryStore, RecordStore, SqliteStore, StoreSchema};

#[derive(Parser, Debug)]
#[command(name = "telerec")]
#[command(about = "telerec - sequenced device record ingestion", long_about = None)]
struct Args {
    /// Configuration file (TOML); defaults apply when it does not exist
    #[arg(short, long, default_value = "telerec.toml")]
    config: PathBuf,

    /// Use the in-memory store instead of SQLite
    #[arg(long)]
    memory: bool,

    /// Device ids to register in the in-memory store
    #[arg(long = "device", requires = "memory")]
    devices: Vec<u32>,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl Args {
    fn validate(&self) -> Result<()> {
        if self.memory && self.command.is_some() {
            bail!("--memory cannot be combined with a subcommand; subcommands act on the database");
        }
        Ok(())
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered devices with their last stored counter
    Devices,
    /// Register device ids
    Register {
        /// Device ids
        #[arg(required = true)]
        ids: Vec<u32>,
    },
    /// Show database statistics
    Stats,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    args.validate()?;
    let config = load_config(&args.config)?;

    if args.memory {
        let store = MemoryStore::new(config.record_layout());
        for id in &args.devices {
            store.register_device(*id);
        }
        tracing::info!(devices = args.devices.len(), "Running with in-memory store");
        return serve(&config, store);
    }

    let schema = StoreSchema::from_config(&config)?;
    let store = SqliteStore::open(&config.storage.database, schema)?;

    if let Some(cmd) = args.command {
        return handle_command(cmd, store);
    }

    tracing::info!("  Database: {}", config.storage.database.display());
    serve(&config, store)
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        tracing::info!("Loading configuration from {}", path.display());
        Ok(Config::from_file(path)?)
    } else {
        tracing::info!("{} not found, using defaults", path.display());
        Ok(Config::default())
    }
}

fn serve<S: RecordStore>(config: &Config, store: S) -> Result<()> {
    tracing::info!("telerec starting...");
    tracing::info!("  Listen: {}", config.listen_addr());
    if let Some(forward) = config.network.forward_address {
        tracing::info!("  Forward: {}", forward);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })?;

    telerec::run(config, store, Some(shutdown))
}

fn handle_command(cmd: Commands, mut store: SqliteStore) -> Result<()> {
    match cmd {
        Commands::Devices => {
            let devices = store.load_device_registry()?;
            if devices.is_empty() {
                println!("No devices registered");
            } else {
                println!("Registered devices:");
                for device in devices {
                    println!("  {} (last counter {})", device.device_id, device.last_counter);
                }
            }
        }
        Commands::Register { ids } => {
            for id in ids {
                if store.register_device(id)? {
                    println!("Registered device {}", id);
                } else {
                    println!("Device {} already registered", id);
                }
            }
        }
        Commands::Stats => {
            let devices = store.load_device_registry()?;
            println!("Database Statistics:");
            println!("  Devices: {}", devices.len());
            println!("  Rows: {}", store.record_count()?);
            println!("  Placeholders: {}", store.placeholder_count()?);
        }
    }
    Ok(())
}
