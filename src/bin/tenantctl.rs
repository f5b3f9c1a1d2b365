use clap::Parser;
use tenant_router::cli::Cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    // Keep stdout clean for --json; logs go to stderr and default to warnings
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let config = tenant_router::config::config();

    if let Err(e) = tenant_router::cli::run(cli, config).await {
        if let Ok("true") | Ok("1") = std::env::var("CLI_VERBOSE").as_deref() {
            eprintln!("Error: {e:?}");
        }
        std::process::exit(1);
    }

    Ok(())
}
