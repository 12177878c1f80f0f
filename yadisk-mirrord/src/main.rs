use std::process::ExitCode;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use yadisk_mirrord::daemon::{DaemonRuntime, MirrorConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: yadisk-mirrord [--once]");
        println!("  --once   Run a single pass now, ignoring the active hours, and exit");
        return Ok(ExitCode::SUCCESS);
    }

    init_tracing();
    let config = MirrorConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Once => match daemon.run_once().await {
            Ok(_) => Ok(ExitCode::SUCCESS),
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "single pass failed");
                Ok(ExitCode::FAILURE)
            }
        },
        _ => {
            daemon.run().await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
