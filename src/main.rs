use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod config;
mod sync;
mod util;

#[derive(Parser)]
#[command(
    name = "treemirror",
    version,
    about = "Mirror directory trees into target directories as they change"
)]
struct Cli {
    /// Path to config file [default: ./sync-config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch all source roots and mirror changes until stopped
    Start,
    /// Mirror the current state of every source root once and exit
    SyncNow,
    /// Validate the config file and print the resolved mapping
    Check,
}

fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "treemirror=info",
        1 => "treemirror=debug",
        2 => "treemirror=trace",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

/// Recursive watches use one inotify watch per directory; warn early if the
/// per-user limit is small.
fn check_inotify_limits() {
    let path = "/proc/sys/fs/inotify/max_user_watches";
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    match content.trim().parse::<u64>() {
        Ok(limit) if limit < 65536 => tracing::warn!(
            max_user_watches = limit,
            "inotify watch limit is low, large source trees may not be fully watched. \
             Raise it with: echo 524288 | sudo tee {path}"
        ),
        Ok(limit) => tracing::debug!(max_user_watches = limit, "inotify watch limit OK"),
        Err(_) => {}
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli.config.unwrap_or_else(config::default_config_path);

    match cli.command {
        Command::Start => {
            check_inotify_limits();
            let (service, watch_rx) = sync::SyncService::load(&config_path)?;
            service.run(watch_rx).await?;
        }
        Command::SyncNow => {
            let loaded = config::load_config(&config_path)?;
            sync::report_skipped(&loaded.skipped);
            match sync::sync_once(&loaded.config).await {
                Some(report) => println!(
                    "sync complete: {} added, {} changed, {} deleted",
                    report.added, report.changed, report.deleted
                ),
                None => println!("sync complete: nothing to do"),
            }
        }
        Command::Check => {
            let loaded = config::load_config(&config_path)?;
            let cfg = &loaded.config;

            println!("treemirror config: {}", config_path.display());
            println!("=================");
            for root in &cfg.roots {
                let state = if root.source.is_dir() { "" } else { " (missing)" };
                println!(
                    "{}{} -> {}",
                    root.source.display(),
                    state,
                    root.target.display()
                );
            }
            if !cfg.ignore.fragments().is_empty() {
                println!();
                println!("Ignored: dotfiles, {}", cfg.ignore.fragments().join(", "));
            }
            if !loaded.skipped.is_empty() {
                println!();
                println!("Skipped entries:");
                for e in &loaded.skipped {
                    println!("  {e}");
                }
            }
        }
    }

    Ok(())
}
