use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use tracksync::cache::SqliteStorage;
use tracksync::config::Config;
use tracksync::queue::{EntityType, Operation};
use tracksync::remote::HttpRemote;
use tracksync::sync::DrainOutcome;
use tracksync::Engine;

#[derive(Parser, Debug)]
#[command(name = "tracksync")]
#[command(about = "Offline-first sync engine for personal tracking data")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tracksync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Treat the host as offline: nothing is sent to the remote
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Queue a mutation and apply it to the local cache
  Submit {
    /// create, update or delete
    operation: Operation,
    /// task, meal_log, inventory_item or habit
    entity: EntityType,
    /// Record data as a JSON object
    payload: String,
  },
  /// Print cached records
  Read { entity: EntityType, id: Option<String> },
  /// Print queue health
  Health,
  /// List pending queue entries
  Pending,
  /// List entries dropped after exhausting retries
  Dropped,
  /// Drain the queue once
  Sync,
  /// Pull all records of a type from the remote into the cache
  Refresh { entity: EntityType },
  /// Drop every cached record (the queue is kept)
  ClearCache,
  /// Keep syncing in the background until interrupted
  Run,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let _guard = init_tracing(&config, matches!(args.command, Command::Run))?;

  let storage = SqliteStorage::open_at(&config.store_path()?)?;
  let remote = HttpRemote::new(&config.remote)?;
  let engine = Engine::new(storage, remote, config.sync.policy(), !args.offline);

  match args.command {
    Command::Submit {
      operation,
      entity,
      payload,
    } => {
      let payload =
        serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      let entry = engine.submit(operation, entity, payload)?;
      print_json(&entry)?;
    }
    Command::Read { entity, id } => print_json(&engine.read(entity, id.as_deref())?)?,
    Command::Health => print_json(&engine.queue_health()?)?,
    Command::Pending => print_json(&engine.pending_entries()?)?,
    Command::Dropped => print_json(&engine.dropped_entries()?)?,
    Command::Sync => {
      if args.offline {
        return Err(eyre!("Refusing to sync while --offline is set"));
      }
      match engine.drain_now().await? {
        DrainOutcome::Completed(report) => println!(
          "attempted {}, succeeded {}, retrying {}, dropped {}",
          report.attempted, report.succeeded, report.retried, report.dropped
        ),
        DrainOutcome::Busy => println!("a drain is already running"),
      }
    }
    Command::Refresh { entity } => {
      let result = engine.refresh(entity).await?;
      if result.is_offline() {
        eprintln!("remote unreachable, showing cached records");
      }
      print_json(&result.data)?;
    }
    Command::ClearCache => engine.clear_cache()?,
    Command::Run => {
      let handle = engine.start()?;
      tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for ctrl-c: {}", e))?;
      tracing::info!("Interrupted, finishing current drain");
      handle.shutdown().await?;
    }
  }

  Ok(())
}

/// Set up logging. Long-running sessions log to a daily file next to the
/// store; one-shot commands log to stderr.
fn init_tracing(config: &Config, to_file: bool) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
    if to_file {
      EnvFilter::new("info")
    } else {
      EnvFilter::new("warn")
    }
  });

  if to_file {
    let appender = tracing_appender::rolling::daily(config.log_dir()?, "tracksync.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(writer)
      .with_ansi(false)
      .init();
    Ok(Some(guard))
  } else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    Ok(None)
  }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let out =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to render output: {}", e))?;
  println!("{}", out);
  Ok(())
}
