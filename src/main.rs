use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "gen-gateway",
    version,
    about = "Streaming inference gateway with model cascade and recitation fallback"
)]
struct Cli {
    /// Settings file (created with defaults when missing).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Listen host, overrides the settings file.
    #[arg(long)]
    host: Option<String>,
    /// Listen port, overrides the settings file.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let options = gen_gateway_lib::RunOptions {
        config_path: cli.config,
        host: cli.host,
        port: cli.port,
    };

    // The subscriber may not exist yet if settings failed to load.
    if let Err(err) = gen_gateway_lib::run(options).await {
        eprintln!("gen-gateway: {err}");
        std::process::exit(1);
    }
}
