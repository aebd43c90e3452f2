use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose};
use clap::{Parser, Subcommand};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use savesync::common::paths;
use savesync::config::SyncConfig;
use savesync::quota::QuotaLevel;
use savesync::recovery::{ConnectivityProbe, ManualProbe, ServiceMode, StoreProbe};
use savesync::save::{ConflictResolution, OperationJournal, SyncAction};
use savesync::store::{SaveStore, SqliteStore};
use savesync::ui::{self, prelude::*};
use savesync::{SaveSync, UserId};

/// Cloud save synchronization with retries, recovery and quota monitoring
#[derive(Parser, Debug)]
#[command(name = "savesync", author, version, about, long_about = None)]
struct Cli {
    /// Activate debug mode (debug events and the operation journal)
    #[arg(short, long, global = true)]
    debug: bool,

    /// Output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    output: OutputFormat,

    /// Config file (defaults to the savesync.toml in the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the stores and logs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Start without cloud access; writes stay local as pending
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a save from a file (or stdin with `-`)
    Save {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        slot: u32,
        /// Display name of the save
        #[arg(short, long)]
        name: Option<String>,
        file: PathBuf,
    },
    /// Read a save back, verifying its checksum
    Load {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        slot: u32,
        /// Write the payload here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List a user's saves, newest first
    List {
        #[arg(short, long)]
        user: String,
    },
    /// Delete a save
    Delete {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        slot: u32,
    },
    /// Reconcile local and cloud copies
    Sync {
        #[arg(short, long)]
        user: String,
        /// Only this slot
        #[arg(short, long)]
        slot: Option<u32>,
    },
    /// Settle a conflicted slot
    Resolve {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        slot: u32,
        #[arg(long, value_enum)]
        keep: ConflictResolution,
    },
    /// Show storage usage
    Quota {
        #[arg(short, long)]
        user: String,
    },
    /// Show service mode and registered recovery strategies
    Status,
    /// Show recent operations from the journal
    Log {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// Delete the journal instead
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    ui::set_debug_mode(cli.debug);
    ui::init(cli.output, io::IsTerminal::is_terminal(&io::stdout()));

    if let Err(e) = run(cli).await {
        emit(Level::Error, "cli.failed", &format!("Error: {e:#}"), None);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => SyncConfig::load_from_path(path)?,
        None => SyncConfig::load()?,
    };
    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => paths::savesync_data_dir()?,
    };

    if let Commands::Log { limit, clear } = &cli.command {
        let journal = OperationJournal::always(paths::logs_dir(&data_dir)?);
        if *clear {
            journal.clear_logs()?;
            emit(Level::Success, "log.cleared", "Operation log cleared", None);
            return Ok(());
        }
        return journal.print_recent_logs(*limit);
    }

    let stores = paths::stores_dir(&data_dir)?;
    let local: Arc<dyn SaveStore> = Arc::new(
        SqliteStore::open("local", &stores.join("local.db")).context("opening local store")?,
    );
    let remote: Arc<dyn SaveStore> = Arc::new(
        SqliteStore::open("remote", &stores.join("remote.db")).context("opening remote store")?,
    );
    let probe: Arc<dyn ConnectivityProbe> = if cli.offline {
        Arc::new(ManualProbe::new(false, true))
    } else {
        Arc::new(StoreProbe::new(Arc::clone(&remote)))
    };

    let sync = SaveSync::builder(remote, local, probe)
        .config(config)
        .journal(Arc::new(OperationJournal::new(paths::logs_dir(&data_dir)?)))
        .build();
    if cli.offline {
        sync.modes.set_mode(ServiceMode::Offline, "started with --offline");
    }

    let result = dispatch(&sync, cli.command).await;
    sync.shutdown();
    result
}

async fn dispatch(sync: &SaveSync, command: Commands) -> Result<()> {
    let coordinator = &sync.coordinator;
    match command {
        Commands::Save {
            user,
            slot,
            name,
            file,
        } => {
            let data = read_input(&file)?;
            let user = UserId::from(user);
            let name = name.unwrap_or_else(|| format!("Slot {slot}"));
            let meta = coordinator
                .save(&user, slot, &name, &data)
                .await
                .into_result()?;
            emit(
                Level::Success,
                "save.saved",
                &format!(
                    "Saved '{}' to slot {} ({} bytes, {})",
                    meta.name, meta.slot, meta.payload.original_size, meta.sync_status
                ),
                Some(serde_json::to_value(&meta)?),
            );
        }
        Commands::Load { user, slot, out } => {
            let user = UserId::from(user);
            let loaded = coordinator.load(&user, slot).await.into_result()?;
            match out {
                Some(path) => {
                    std::fs::write(&path, &loaded.data)
                        .with_context(|| format!("writing save to {}", path.display()))?;
                    emit(
                        Level::Success,
                        "save.loaded",
                        &format!("Wrote slot {slot} to {}", path.display()),
                        Some(serde_json::to_value(&loaded.metadata)?),
                    );
                }
                // Payloads are arbitrary bytes; JSON consumers get them base64-encoded
                None if get_output_format() == OutputFormat::Json => emit(
                    Level::Info,
                    "save.loaded",
                    &format!("Loaded slot {slot}"),
                    Some(serde_json::json!({
                        "metadata": loaded.metadata,
                        "data": general_purpose::STANDARD.encode(&loaded.data),
                    })),
                ),
                None => {
                    io::stdout()
                        .write_all(&loaded.data)
                        .context("writing save to stdout")?;
                }
            }
        }
        Commands::List { user } => {
            let user = UserId::from(user);
            let saves = coordinator.list(&user).await.into_result()?;
            if saves.is_empty() {
                emit(Level::Info, "save.list.empty", "No saves found", None);
                return Ok(());
            }
            emit(
                Level::Info,
                "save.list.start",
                &format!("{} save(s) for {user}:", saves.len()),
                None,
            );
            separator();
            for meta in &saves {
                emit(
                    Level::Info,
                    "save.list.entry",
                    &format!(
                        "  [{}] {:<24} {:>8} bytes  {}  {}",
                        meta.slot,
                        meta.name,
                        meta.payload.compressed_size,
                        meta.updated_at.format("%Y-%m-%d %H:%M:%S"),
                        meta.sync_status
                    ),
                    Some(serde_json::to_value(meta)?),
                );
            }
        }
        Commands::Delete { user, slot } => {
            let user = UserId::from(user);
            coordinator.delete(&user, slot).await.into_result()?;
            emit(
                Level::Success,
                "save.deleted",
                &format!("Deleted slot {slot}"),
                None,
            );
        }
        Commands::Sync { user, slot } => {
            let user = UserId::from(user);
            match slot {
                Some(slot) => {
                    let result = coordinator.sync_slot(&user, slot, None).await;
                    if let Some(decision) = &result.data {
                        emit(
                            Level::Info,
                            "sync.slot",
                            &format!(
                                "Slot {slot}: {} ({})",
                                decision.action.as_str(),
                                decision.rule.as_str()
                            ),
                            Some(serde_json::to_value(decision)?),
                        );
                    }
                    result.into_result()?;
                }
                None => {
                    let report = coordinator.sync_all(&user).await.into_result()?;
                    for entry in &report.slots {
                        let (level, message) = match (&entry.decision, &entry.error) {
                            (Some(d), None) => (
                                Level::Info,
                                format!("Slot {}: {} ({})", entry.slot, d.action.as_str(), d.rule.as_str()),
                            ),
                            (_, Some(e)) => (
                                Level::Warn,
                                format!("Slot {}: {}", entry.slot, e.message),
                            ),
                            (None, None) => continue,
                        };
                        emit(level, "sync.slot", &message, Some(serde_json::to_value(entry)?));
                    }
                    emit(
                        Level::Success,
                        "sync.completed",
                        &format!(
                            "Uploaded {}, downloaded {}, unchanged {}, conflicts {}",
                            report.count(SyncAction::Upload),
                            report.count(SyncAction::Download),
                            report.count(SyncAction::Skip),
                            report.count(SyncAction::Conflict)
                        ),
                        None,
                    );
                }
            }
        }
        Commands::Resolve { user, slot, keep } => {
            // The coordinator reports the outcome itself
            coordinator
                .resolve_conflict(&UserId::from(user), slot, keep)
                .await
                .into_result()?;
        }
        Commands::Quota { user } => {
            let status = sync.quota.check_quota(&UserId::from(user)).await;
            let level = match status.level {
                QuotaLevel::Normal => Level::Info,
                QuotaLevel::Warning => Level::Warn,
                _ => Level::Error,
            };
            emit(
                level,
                "quota.status",
                &format!(
                    "{} ({} of {} bytes, {} save(s))",
                    status.message, status.used_bytes, status.max_bytes, status.total_saves
                ),
                Some(serde_json::to_value(&status)?),
            );
        }
        Commands::Status => {
            let status = sync.system_status();
            emit(
                Level::Info,
                "status.mode",
                &format!("Service mode: {}", status.mode),
                Some(serde_json::to_value(&status)?),
            );
            if get_output_format() == OutputFormat::Text {
                for (code, count) in &status.registered_strategies {
                    println!("  {code}: {count} strategy(ies)");
                }
            }
        }
        Commands::Log { .. } => {}
    }
    Ok(())
}

fn read_input(file: &PathBuf) -> Result<Vec<u8>> {
    if file.as_os_str() == "-" {
        let mut data = Vec::new();
        io::stdin()
            .read_to_end(&mut data)
            .context("reading save from stdin")?;
        return Ok(data);
    }
    std::fs::read(file).with_context(|| format!("reading save file {}", file.display()))
}
