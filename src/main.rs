use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use offline_cache::cache::SqliteStorage;
use offline_cache::config::Config;
use offline_cache::logging;
use offline_cache::worker::{
  Destination, FetchOutcome, Fetcher, HttpFetcher, OfflineWorker, Request,
};
use reqwest::Method;
use std::path::PathBuf;
use tracing::{info, warn};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "offline-cache")]
#[command(about = "Offline request cache for the transport portal")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offline-cache.yaml, then $XDG_CONFIG_HOME/offline-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Keep stores in memory for this run only
  #[arg(long)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-populate the shell for the current generation
  Install,
  /// Activate an installed generation and evict older stores
  Activate,
  /// Resolve one request through the worker
  Fetch {
    url: Url,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Request destination (image, script, style, font, document, manifest)
    #[arg(short, long)]
    destination: Option<String>,
  },
  /// List stores with their entry counts
  Stores,
  /// Delete one store
  Purge { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(config.log_dir.as_deref())?;

  let storage = if args.ephemeral {
    SqliteStorage::in_memory()?
  } else {
    SqliteStorage::open(&config.storage_path()?)?
  };
  let storage = match config.storage.quota_bytes {
    Some(quota) => storage.with_quota(quota),
    None => storage,
  };

  let fetcher = HttpFetcher::new()?;
  let mut worker = OfflineWorker::new(&config, storage, fetcher.clone())?;

  match args.command {
    Command::Install => {
      let evicted = worker.install().await?;
      println!("Installed generation {} ({})", worker.generation().version, worker.state());
      print_evicted(&evicted);
    }
    Command::Activate => {
      worker.restore_waiting()?;
      let evicted = worker.activate()?;
      println!("Activated generation {}", worker.generation().version);
      print_evicted(&evicted);
    }
    Command::Fetch {
      url,
      method,
      navigate,
      destination,
    } => {
      let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };
      let mut request = request.with_method(method);
      if let Some(destination) = destination {
        request = request.with_destination(destination.parse::<Destination>()?);
      }

      // Only an activated generation intercepts; otherwise the request passes through
      if let Err(e) = worker.resume() {
        warn!("Not intercepting: {}", e);
      }
      match worker.handle(&request).await? {
        FetchOutcome::PassThrough => {
          info!(url = %request.url, "Not intercepted, fetching directly");
          let response = fetcher.fetch(&request).await?;
          println!("{} passthrough {} bytes", response.status, response.body.len());
        }
        FetchOutcome::Responded(handled) => {
          println!(
            "{} {} {} bytes",
            handled.response.status,
            handled.source,
            handled.response.body.len()
          );
        }
      }
      worker.flush_revalidations().await;
    }
    Command::Stores => {
      let generation = worker.generation().clone();
      for name in worker.stores().list_store_names()? {
        let count = worker.stores().entry_count(&name)?;
        let marker = if generation.is_known(&name) { " " } else { "*" };
        println!("{} {:<32} {:>6}", marker, name, count);
      }
    }
    Command::Purge { name } => {
      if worker.stores().delete_store(&name)? {
        println!("Deleted {}", name);
      } else {
        return Err(eyre!("No store named {}", name));
      }
    }
  }

  Ok(())
}

fn print_evicted(evicted: &[String]) {
  for name in evicted {
    println!("Evicted {}", name);
  }
}
