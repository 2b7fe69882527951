use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use vaultdump::{Config, Orchestrator};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const EXIT_INSTANCE_FAILED: u8 = 1;
const EXIT_FATAL: u8 = 2;

/// Database backup and restore with broker-issued short-lived credentials.
#[derive(Parser)]
#[command(name = "vaultdump")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Back up every configured database instance
    Backup {
        /// Path to the TOML configuration file
        #[arg(short, long, env = "VAULTDUMP_CONFIG")]
        config: PathBuf,
    },

    /// Restore every configured instance from its latest backup
    Restore {
        /// Path to the TOML configuration file
        #[arg(short, long, env = "VAULTDUMP_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let (config_path, restore) = match &cli.command {
        Command::Backup { config } => (config, false),
        Command::Restore { config } => (config, true),
    };

    let cfg = match Config::load(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("vaultdump: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        config = %config_path.display(),
        output_directory = %cfg.backup.output_directory.display(),
        postgres_instances = cfg.postgres.instances.len(),
        mongodb_instances = cfg.mongodb.instances.len(),
        loglevel = %cfg.log_level
    );
    debug!(
        keep_last = ?cfg.retention.keep_last,
        cleanup_interval_secs = ?cfg.retention.cleanup_interval_secs,
        "retention settings are not enforced"
    );

    let orchestrator = match Orchestrator::connect(cfg).await {
        Ok(o) => o,
        Err(e) => {
            error!(error = %e, "broker authentication failed");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let run = async {
        if restore {
            orchestrator.run_restore().await
        } else {
            orchestrator.run_backup().await
        }
    };
    // In-flight tools are killed when their tasks drop at runtime shutdown.
    let report = tokio::select! {
        report = run => report,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; abandoning run");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_INSTANCE_FAILED)
    }
}
