use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

use hass_frame::config::Configuration;
use hass_frame::ledger::{self, ContentLedger};
use hass_frame::logging;
use hass_frame::platform::capture::{Capture, CommandCapture};
use hass_frame::platform::device::{CommandDevice, DisplayDevice};
use hass_frame::platform::hass::HassConnector;
use hass_frame::platform::hub::HubConnector;
use hass_frame::state::StateBus;
use hass_frame::tasks::{art::ArtScheduler, listener, snapshot::SnapshotScheduler};

#[derive(Debug, Parser)]
#[command(
    name = "hass-frame",
    version,
    about = "Keep a picture display in sync with Home Assistant: dashboard snapshots or rotating art."
)]
struct Cli {
    /// Path to YAML config.
    #[arg(short, long, global = true, value_name = "FILE", default_value = "/etc/hass-frame/config.yaml")]
    config: PathBuf,

    /// Increase log verbosity (repeatable).
    #[arg(short = 'v', long = "verbose", global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Follow the hub and drive the display (default).
    Run,
    /// Direct display device operations.
    Device {
        #[command(subcommand)]
        command: DeviceCommand,
    },
    /// Inspect or prune the uploaded-snapshot ledger.
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
}

#[derive(Subcommand, Debug)]
enum DeviceCommand {
    /// Print the identifiers stored on the device.
    List,
    /// Show a stored image.
    Select { id: String },
    /// Upload an image file and print its identifier.
    Upload {
        file: PathBuf,
        /// Keep showing the current image.
        #[arg(long)]
        no_switch: bool,
    },
    /// Delete stored images, comma separated.
    Delete { ids: String },
}

#[derive(Subcommand, Debug)]
enum LedgerCommand {
    /// Print recorded uploads, oldest first.
    List,
    /// Run one pruning pass against the device.
    Prune,
}

#[tokio::main]
async fn main() {
    if let Err(err) = try_main().await {
        error!(error = ?err, "hass-frame exited with error");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn try_main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = Configuration::from_yaml_file(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let cfg = cfg.validated().context("invalid configuration values")?;
            info!(config = %cli.config.display(), "starting hass-frame");
            run(cfg).await
        }
        Commands::Device { command } => {
            cfg.device.validate().context("invalid device configuration")?;
            device_command(&cfg, command).await
        }
        Commands::Ledger { command } => ledger_command(&cfg, command).await,
    }
}

async fn run(cfg: Configuration) -> Result<()> {
    let bus = Arc::new(StateBus::default());
    let ledger = Arc::new(
        ContentLedger::open(&cfg.ledger.path)
            .with_context(|| format!("failed to open ledger {}", cfg.ledger.path.display()))?,
    );
    let device: Arc<dyn DisplayDevice> = Arc::new(CommandDevice::new(&cfg.device));
    let capture: Arc<dyn Capture> = Arc::new(CommandCapture::new(&cfg.capture));
    let connector = HassConnector::new(&cfg.hub);
    info!(url = connector.url(), "hub endpoint");
    let connector: Arc<dyn HubConnector> = Arc::new(connector);

    let cancel = CancellationToken::new();
    spawn_shutdown_watchers(&cancel);

    let mut tasks = JoinSet::new();

    // EventListener
    tasks.spawn({
        let bus = bus.clone();
        let entities = cfg.entities.tracked();
        let backoff = cfg.hub.reconnect_backoff;
        let cancel = cancel.clone();
        async move {
            listener::run(connector, bus, entities, backoff, cancel)
                .await
                .context("listener task failed")
        }
    });

    // SnapshotScheduler
    tasks.spawn({
        let scheduler = SnapshotScheduler::new(
            bus.clone(),
            capture,
            device.clone(),
            ledger,
            cfg.snapshot.clone(),
            cfg.device.delete_batch_size,
        );
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await.context("snapshot task failed") }
    });

    // ArtRotationScheduler
    tasks.spawn({
        let scheduler = ArtScheduler::new(bus.clone(), device, cfg.art.clone());
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await.context("art task failed") }
    });

    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("task error: {e:?}"),
            Err(e) => error!("join error: {e}"),
        }
        // Tasks only return on shutdown; make sure the rest follow.
        cancel.cancel();
    }

    info!("hass-frame stopped");
    Ok(())
}

fn spawn_shutdown_watchers(cancel: &CancellationToken) {
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {err}");
                return;
            }
            info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = sigterm.recv() => {
                            info!("SIGTERM received; initiating shutdown");
                            cancel.cancel();
                        }
                    }
                }
                Err(err) => warn!("failed to register SIGTERM handler: {err}"),
            }
        });
    }
}

async fn device_command(cfg: &Configuration, command: DeviceCommand) -> Result<()> {
    let device = CommandDevice::new(&cfg.device);
    match command {
        DeviceCommand::List => {
            for id in device.list().await? {
                println!("{id}");
            }
        }
        DeviceCommand::Select { id } => device.select(&id).await?,
        DeviceCommand::Upload { file, no_switch } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let id = device.upload(&bytes).await?;
            if !no_switch {
                device.select(&id).await?;
            }
            println!("{id}");
        }
        DeviceCommand::Delete { ids } => {
            let ids = split_ids(&ids);
            if ids.is_empty() {
                bail!("no identifiers given");
            }
            for batch in ids.chunks(cfg.device.delete_batch_size.max(1)) {
                device.delete(batch).await?;
                info!(batch = ?batch, "deleted");
            }
        }
    }
    Ok(())
}

async fn ledger_command(cfg: &Configuration, command: LedgerCommand) -> Result<()> {
    let ledger = ContentLedger::open(&cfg.ledger.path)
        .with_context(|| format!("failed to open ledger {}", cfg.ledger.path.display()))?;
    match command {
        LedgerCommand::List => {
            for entry in ledger.entries()? {
                println!("{}\t{}", entry.uploaded_at.to_rfc3339(), entry.identifier);
            }
        }
        LedgerCommand::Prune => {
            cfg.device.validate().context("invalid device configuration")?;
            cfg.snapshot
                .validate()
                .context("invalid snapshot configuration")?;
            let device = CommandDevice::new(&cfg.device);
            let report = ledger::prune(
                &ledger,
                &device,
                cfg.snapshot.retain,
                cfg.device.delete_batch_size,
            )
            .await?;
            for id in &report.deleted {
                println!("deleted\t{id}");
            }
            for id in &report.retained {
                println!("kept\t{id}");
            }
        }
    }
    Ok(())
}

fn split_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
