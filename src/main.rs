use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use posync::catalog::ItemQuery;
use posync::{Config, Engine, HttpRpc, QueueClass, MAX_QUEUE_ITEMS};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "posync")]
#[command(about = "Inspect and maintain a register's offline cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/posync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show the estimated cache footprint
  Usage,
  /// Wipe the whole cache, offline queues included
  Clear {
    /// Empty tables in place instead of recreating the database
    #[arg(long)]
    fast: bool,
  },
  /// Drop derived caches that can be fetched again
  Reduce,
  /// Search cached items
  Search {
    term: String,
    #[arg(short, long)]
    group: Option<String>,
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long, default_value_t = 0)]
    offset: usize,
  },
  /// Import items from a file holding a JSON array
  ImportItems { file: PathBuf },
  /// Import customers from a file holding a JSON array
  ImportCustomers { file: PathBuf },
  /// List cached customers
  Customers {
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long, default_value_t = 0)]
    offset: usize,
  },
  /// Show cached rates for a price list
  Prices { price_list: String },
  /// Inspect or trim the offline queues
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Replay queued calls against the backend
  Sync,
  /// Switch manual offline mode
  Offline {
    #[arg(value_enum)]
    mode: Toggle,
  },
  /// Show counters for dropped or trimmed data
  Losses,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Print the entries of one queue
  List { class: QueueClass },
  /// Trim every queue to its newest entries
  Purge {
    #[arg(long, default_value_t = MAX_QUEUE_ITEMS)]
    limit: usize,
  },
  /// Report whether any queue is over the limit
  Health {
    #[arg(long, default_value_t = MAX_QUEUE_ITEMS)]
    limit: usize,
  },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Toggle {
  On,
  Off,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_logging(&config.data_dir()?)?;

  let engine = Engine::open(config)?;
  let init = engine.initialize().await;
  if !init.healthy {
    eprintln!("warning: cache database unavailable, results come from memory only");
  }

  let result = run(&engine, args.command).await;
  engine.flush().await;
  result
}

async fn run(engine: &Engine, command: Command) -> Result<()> {
  match command {
    Command::Usage => print_json(&engine.cache_usage_estimate().await)?,
    Command::Clear { fast } => {
      if fast {
        engine.force_clear_all_cache().await;
      } else {
        engine.clear_all_cache().await;
      }
      println!("Cache cleared");
    }
    Command::Reduce => {
      engine.reduce_cache_usage().await;
      print_json(&engine.cache_usage_estimate().await)?;
    }
    Command::Search {
      term,
      group,
      limit,
      offset,
    } => {
      let query = ItemQuery {
        search: term,
        item_group: group,
        limit,
        offset,
      };
      print_json(&engine.search_items(&query).await)?;
    }
    Command::ImportItems { file } => {
      let stored = engine.save_items(read_array(&file)?).await;
      println!("Stored {} items", stored);
    }
    Command::ImportCustomers { file } => {
      let stored = engine.save_customers(read_array(&file)?).await;
      println!("Stored {} customers", stored);
    }
    Command::Customers { limit, offset } => {
      print_json(&engine.customers(offset, limit).await)?;
    }
    Command::Prices { price_list } => match engine.cached_price_list_items(&price_list).await {
      Some(items) => print_json(&items)?,
      None => println!("No fresh rates cached for {}", price_list),
    },
    Command::Queue(QueueCommand::List { class }) => print_json(&engine.queue(class))?,
    Command::Queue(QueueCommand::Purge { limit }) => {
      let removed = engine.purge_old_queue_entries(limit);
      println!("Removed {} entries", removed);
    }
    Command::Queue(QueueCommand::Health { limit }) => {
      for class in QueueClass::ALL {
        println!("{:<10} {}", class.as_str(), engine.queue_len(class));
      }
      if engine.queue_health_check(limit) {
        println!("Over limit ({}), consider purging", limit);
      }
    }
    Command::Sync => {
      let rpc = HttpRpc::new(engine.config())?;
      let report = engine.sync_offline_queues(&rpc).await;
      print_json(&report)?;
    }
    Command::Offline { mode } => {
      engine.set_manual_offline(matches!(mode, Toggle::On));
      println!(
        "Manual offline {}",
        if engine.is_manual_offline() { "on" } else { "off" }
      );
    }
    Command::Losses => print_json(&engine.losses())?,
  }
  Ok(())
}

/// Log to a daily file under the data directory; stdout carries command output.
fn init_logging(data_dir: &Path) -> Result<WorkerGuard> {
  let log_dir = data_dir.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
    log_dir,
    "posync.log",
  ));

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "posync=info".into()))
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn read_array(path: &Path) -> Result<Vec<Value>> {
  let contents = std::fs::read_to_string(path)
    .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
  serde_json::from_str(&contents)
    .map_err(|e| eyre!("Expected a JSON array in {}: {}", path.display(), e))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
