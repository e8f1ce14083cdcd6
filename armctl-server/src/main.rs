use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::time::Duration;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

use armctl_server::{commands, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .format_timestamp_millis()
        .init();

    Toplevel::new(|s| async move {
        s.start(SubsystemBuilder::new("armctl", |subsys| {
            commands::run(cli, subsys)
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(2))
    .await
    .into_diagnostic()
}
