//! dirgit CLI - serve local directories as git repositories
//!
//! Each directory is snapshotted and exposed over git smart HTTP until the
//! process receives Ctrl-C or SIGTERM.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dirgit_core::Config;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::ServeArgs;

/// dirgit: hand out git URLs for local directories
#[derive(Parser, Debug)]
#[command(name = "dirgit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Staging directory for snapshots (overrides config and env)
    #[arg(long, global = true, env = "DIRGIT_STAGING_DIR")]
    staging_dir: Option<PathBuf>,

    /// Host the git servers bind to (overrides config and env)
    #[arg(long, global = true, env = "DIRGIT_BIND_HOST")]
    bind_host: Option<String>,

    /// Path to the git executable (overrides config and env)
    #[arg(long, global = true, env = "DIRGIT_GIT_PATH")]
    git_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show version information
    Version,

    /// Serve directories as git repositories until interrupted
    #[command(visible_alias = "s")]
    Serve(ServeArgs),

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "dirgit=debug,dirgit_core=debug,tower_http=debug"
    } else {
        "dirgit=info,dirgit_core=info"
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .init();

    // Load configuration with overrides
    let config = Config::load_with_overrides(
        cli.staging_dir.clone(),
        cli.bind_host.clone(),
        cli.git_path.clone(),
    )?;

    if cli.verbose {
        tracing::info!(
            staging_dir = %config.snapshot.staging_dir.display(),
            bind_host = %config.server.bind_host,
            git_path = %config.server.git_path,
            "Configuration loaded"
        );
    }

    match cli.command {
        Some(Commands::Version) => {
            println!("dirgit {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Serve(args)) => {
            args.execute(config).await?;
        }
        Some(Commands::Config) => {
            println!("dirgit Configuration");
            println!("====================");
            println!();
            println!("Snapshot Settings:");
            println!("  staging_dir: {}", config.snapshot.staging_dir.display());
            println!("  staging_mode: {:?}", config.snapshot.staging_mode);
            println!("  default_branch: {}", config.snapshot.default_branch);
            println!(
                "  fallback author: {} <{}>",
                config.snapshot.author_name, config.snapshot.author_email
            );
            println!();
            println!("Server Settings:");
            println!("  bind_host: {}", config.server.bind_host);
            println!("  shutdown_timeout: {:?}", config.server.shutdown_timeout);
            println!("  git_path: {}", config.server.git_path);
            println!();
            if let Some(path) = Config::default_config_path() {
                println!("Config file: {}", path.display());
                if path.exists() {
                    println!("  (exists)");
                } else {
                    println!("  (not found - using defaults)");
                }
            }
        }
        None => {
            println!("dirgit - serve local directories as git repositories");
            println!();
            println!("Use --help for usage information");
        }
    }

    Ok(())
}
