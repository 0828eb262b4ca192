use chrono::DateTime;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shigure_cache::cache::{CacheStorage, NoopStorage, SqliteStorage};
use shigure_cache::config::{self, Config, LoggingConfig};
use shigure_cache::db::Database;
use shigure_cache::models::{Message, Notice};
use shigure_cache::{ApiClient, CacheService};

#[derive(Parser, Debug)]
#[command(name = "shigure-cache")]
#[command(about = "Inspect and drive the Shigure Cafe client cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shigure-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Server API root, overrides the config file
  #[arg(long)]
  base_url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Resolve a binary resource through the cache
  Avatar {
    /// Resource URL, absolute or relative to the server
    url: String,
    /// Skip cached copies and refetch
    #[arg(long)]
    force: bool,
    /// Write the bytes to this file
    #[arg(long)]
    out: Option<PathBuf>,
  },
  /// Chat history replica
  #[command(subcommand)]
  Chat(ChatCommand),
  /// Notice board replica
  #[command(subcommand)]
  Notices(NoticeCommand),
  /// Empty every cache tier
  Purge,
}

#[derive(Subcommand, Debug)]
enum ChatCommand {
  List,
  Append {
    #[arg(long)]
    id: i64,
    #[arg(long)]
    sender: String,
    #[arg(long)]
    content: String,
    /// Milliseconds since the epoch (default: now)
    #[arg(long)]
    timestamp: Option<i64>,
  },
  Clear,
}

#[derive(Subcommand, Debug)]
enum NoticeCommand {
  Sync {
    #[arg(long)]
    force: bool,
  },
  List,
  Show {
    id: i64,
  },
  Clear,
}

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes the log file and must live until exit.
fn init_tracing(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  let (file_layer, guard) = if logging.file {
    let dir = config::data_dir()?;
    std::fs::create_dir_all(&dir)
      .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
    let appender = tracing_appender::rolling::daily(&dir, "shigure-cache.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    (
      Some(fmt::layer().with_ansi(false).with_writer(writer)),
      Some(guard),
    )
  } else {
    (None, None)
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(io::stderr))
    .with(file_layer)
    .with(filter)
    .init();

  Ok(guard)
}

fn format_millis(millis: i64) -> String {
  DateTime::from_timestamp_millis(millis)
    .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
    .unwrap_or_else(|| millis.to_string())
}

fn print_message(message: &Message) {
  println!(
    "{:>6}  {}  {}: {}",
    message.id,
    format_millis(message.timestamp),
    message.sender,
    message.content
  );
}

fn print_notice(notice: &Notice) {
  let pin = if notice.pinned { "*" } else { " " };
  println!(
    "{}{:>5}  {}  {}  ({})",
    pin,
    notice.id,
    format_millis(notice.created_at),
    notice.title,
    notice.author_username
  );
}

async fn execute<S: CacheStorage>(
  service: CacheService<S, ApiClient>,
  command: Command,
) -> Result<()> {
  match command {
    Command::Avatar { url, force, out } => {
      let Some(result) = service.avatars().lookup(&url, force).await? else {
        println!("{} is not cacheable", url);
        return Ok(());
      };
      let handle = &result.data;
      println!(
        "{}  {} bytes  from {}  sha256:{}",
        handle.url(),
        handle.len(),
        result.source,
        handle.digest()
      );
      if let Some(path) = out {
        std::fs::write(&path, handle.bytes())
          .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
      }
    }

    Command::Chat(ChatCommand::List) => {
      service.chat().load().await;
      for message in service.chat().snapshot() {
        print_message(&message);
      }
    }
    Command::Chat(ChatCommand::Append {
      id,
      sender,
      content,
      timestamp,
    }) => {
      service.chat().load().await;
      let message = Message {
        id,
        sender,
        content,
        timestamp: timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
      };
      if service.chat().append(message).await? {
        println!("appended message {}", id);
      } else {
        println!("message {} already cached", id);
      }
    }
    Command::Chat(ChatCommand::Clear) => service.chat().clear().await?,

    Command::Notices(NoticeCommand::Sync { force }) => {
      let result = service.notices().sync(force).await?;
      println!("{} notices from {}", result.data.len(), result.source);
      for notice in &result.data {
        print_notice(notice);
      }
    }
    Command::Notices(NoticeCommand::List) => {
      for notice in service.notices().sorted().await {
        print_notice(&notice);
      }
    }
    Command::Notices(NoticeCommand::Show { id }) => {
      let notice = match service.notices().get(id).await {
        Some(notice) => Some(notice),
        None => service.notices().fetch_one(id).await?,
      };
      let notice = notice.ok_or_else(|| eyre!("Notice {} not found", id))?;
      print_notice(&notice);
      println!("\n{}", notice.content);
    }
    Command::Notices(NoticeCommand::Clear) => service.notices().clear().await?,

    Command::Purge => service.purge().await?,
  }

  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration, the command line URL wins over the file
  let config = Config::load_or_default(args.config.as_deref(), args.base_url.as_deref())?;

  let _guard = init_tracing(&config.logging)?;
  info!(base_url = %config.server.base_url, persist = config.cache.persist, "starting");

  let client = Arc::new(ApiClient::new(&config.server.base_url, Config::get_api_token())?);

  if config.cache.persist {
    let path = config.cache.database_path()?;
    let storage = Arc::new(SqliteStorage::new(Database::open(&path)));
    execute(CacheService::new(storage, client, &config.cache), args.command).await
  } else {
    let storage = Arc::new(NoopStorage);
    execute(CacheService::new(storage, client, &config.cache), args.command).await
  }
}
