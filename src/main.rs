use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use precache::cache::{Destination, Request};
use precache::{
  CacheStorage, Config, HttpNetwork, InstallOutcome, OfflineCacheManager, SqliteStorage,
  SyncOutcome,
};

#[derive(Parser, Debug)]
#[command(name = "precache")]
#[command(about = "Manifest-driven offline cache for static sites")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./precache.yaml or $XDG_CONFIG_HOME/precache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Path to the cache database (default: $XDG_DATA_HOME/precache/cache.db)
  #[arg(long)]
  db: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the bucket name derived from the manifest
  Name,
  /// Fetch the manifest into the current bucket
  Install,
  /// Delete every bucket except the current one
  Activate,
  /// Install, then activate if install completed
  Deploy,
  /// Run one request through fetch interception
  Fetch {
    /// URL or path relative to the configured origin
    url: String,
    /// Request destination (document, style, script, image, font, manifest, other)
    #[arg(short, long, default_value = "other")]
    destination: Destination,
    #[arg(short, long, default_value = "GET")]
    method: String,
  },
  /// List buckets and their entry counts
  Buckets,
  /// Deliver a background-sync event
  Sync { tag: String },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  match log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;

      let appender = tracing_appender::rolling::never(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
      Ok(None)
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.log_file.as_deref())?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  if let Command::Name = args.command {
    println!("{}", config.build_manifest()?.bucket_name());
    return Ok(());
  }

  let storage = match &args.db {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  };
  let network = HttpNetwork::new(&config.network)?;
  let worker = OfflineCacheManager::from_config(&config, storage, network)?;
  info!(bucket = worker.bucket_name(), "precache starting");

  match args.command {
    // Printed above without opening storage
    Command::Name => {}
    Command::Install => report_install(&worker.install().await),
    Command::Activate => report_activate(&worker.activate().await?),
    Command::Deploy => {
      let outcome = worker.install().await;
      report_install(&outcome);
      if outcome.is_complete() {
        report_activate(&worker.activate().await?);
      } else {
        return Err(eyre!(
          "Install incomplete, activation skipped: cache {} is empty and older caches are not served",
          worker.bucket_name()
        ));
      }
    }
    Command::Fetch {
      url,
      destination,
      method,
    } => {
      let url = worker.manifest().resolve(&url)?;
      let request = Request::get(url)
        .with_method(&method)
        .with_destination(destination);
      let fetched = worker.handle_fetch(&request).await?;
      println!(
        "{} {} ({}, {} bytes)",
        fetched.response.status,
        fetched.response.status_text,
        fetched.source,
        fetched.response.body.len()
      );
      if let Some(cached_at) = fetched.cached_at {
        println!("cached at {}", cached_at.to_rfc3339());
      }
    }
    Command::Buckets => {
      let storage = worker.storage();
      for name in storage.bucket_names()? {
        let marker = if name == worker.bucket_name() { "*" } else { " " };
        println!("{} {} ({} entries)", marker, name, storage.keys(&name)?.len());
      }
    }
    Command::Sync { tag } => match worker.sync(&tag) {
      SyncOutcome::Handled => println!("sync '{}' handled", tag),
      SyncOutcome::Ignored => println!("sync '{}' ignored", tag),
    },
  }

  Ok(())
}

fn report_install(outcome: &InstallOutcome) {
  match outcome {
    InstallOutcome::Complete { bucket, entries } => {
      println!("installed {} ({} entries)", bucket, entries)
    }
    InstallOutcome::Incomplete {
      bucket,
      url: Some(url),
      reason,
    } => println!("install of {} incomplete: {}: {}", bucket, url, reason),
    InstallOutcome::Incomplete {
      bucket,
      url: None,
      reason,
    } => println!("install of {} incomplete: {}", bucket, reason),
  }
}

fn report_activate(deleted: &[String]) {
  if deleted.is_empty() {
    println!("no stale buckets");
  }
  for name in deleted {
    println!("deleted {}", name);
  }
}
