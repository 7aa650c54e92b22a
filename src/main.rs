//! Main entry point for keychain.

use clap::Parser;
use keychain::cli::Cli;
use keychain::utils::{error_exit, warning};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Set up colored output for Windows
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    for warn in keychain::utils::check_privileges() {
        warning(&warn);
    }

    if let Err(e) = run(cli).await {
        error_exit(&format!("{e:#}"), 1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    cli.execute().await?;
    Ok(())
}

/// Log to stderr. `RUST_LOG` wins over the `-v` flags.
fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .try_init();
}
