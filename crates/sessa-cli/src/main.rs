mod cmd_config;
mod cmd_ingest;
mod cmd_insights;
mod cmd_migrate;
mod cmd_push;
mod cmd_serve;
mod cmd_sessions;
mod cmd_status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sessa_store::SessaConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cmd_config::ConfigCmd;

#[derive(Parser)]
#[command(name = "sessa", version, about = "Agent session-log analytics with push sync")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show store statistics, schema version and sync state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Ingest session logs into the store
    Ingest {
        /// Only files modified in the last N days
        #[arg(long, conflicts_with_all = ["since", "session"])]
        days: Option<u32>,
        /// Only files modified at or after this timestamp (RFC 3339)
        #[arg(long, conflicts_with = "session")]
        since: Option<String>,
        /// Only these sessions (repeatable)
        #[arg(long = "session")]
        session: Vec<String>,
        /// Rescan from the start and re-derive events from stored entries
        #[arg(long)]
        force: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Push local log entries the remote has not seen yet
    Push {
        /// Sync server base URL (defaults to SESSA_REMOTE_URL)
        #[arg(long, conflicts_with = "target_db")]
        remote: Option<String>,
        /// Push into another store file instead of a server
        #[arg(long)]
        target_db: Option<PathBuf>,
        /// Entries per upload request
        #[arg(long)]
        batch_size: Option<usize>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the sync server
    Serve {
        /// Bind address (defaults to SESSA_BIND)
        #[arg(long)]
        bind: Option<String>,
        /// Port (defaults to SESSA_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Apply pending schema migrations and list the ledger
    Migrate {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List sessions, refreshing stale data first
    Sessions {
        /// Maximum number of sessions to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show cached tool and command patterns
    Insights {
        /// Recompute the cache before reading it
        #[arg(long)]
        refresh: bool,
        /// Window for --refresh, in days
        #[arg(long, requires = "refresh")]
        days: Option<u32>,
        /// Only one pattern type (tool_frequency, command_frequency, tool_sequence)
        #[arg(long = "type")]
        pattern_type: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the resolved configuration, or edit config.json
    Config {
        #[command(subcommand)]
        cmd: Option<ConfigCmd>,
    },
}

fn init_tracing() {
    // stdout carries command output; diagnostics go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("SESSA_LOG")
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let config = SessaConfig::load()?;

    match cli.cmd {
        Command::Status { json } => cmd_status::execute(&config, json),
        Command::Ingest {
            days,
            since,
            session,
            force,
            json,
        } => {
            let scope = cmd_ingest::scope(days, since.as_deref(), session)?;
            cmd_ingest::execute(&config, scope, force, json)
        }
        Command::Push {
            remote,
            target_db,
            batch_size,
            json,
        } => cmd_push::execute(&cmd_push::PushParams {
            config: &config,
            remote: remote.as_deref(),
            target_db: target_db.as_deref(),
            batch_size,
            json,
        }),
        Command::Serve { bind, port } => cmd_serve::execute(&config, bind, port),
        Command::Migrate { json } => cmd_migrate::execute(&config, json),
        Command::Sessions { limit, json } => cmd_sessions::execute(&config, limit, json),
        Command::Insights {
            refresh,
            days,
            pattern_type,
            json,
        } => cmd_insights::execute(&config, refresh, days, pattern_type.as_deref(), json),
        Command::Config { cmd } => match cmd {
            None => cmd_config::show(&config),
            Some(cmd) => cmd_config::run(cmd, &config.data_dir),
        },
    }
}
