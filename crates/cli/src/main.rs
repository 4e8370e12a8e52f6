use clap::Parser;

#[derive(Parser)]
#[command(name = "standin")]
#[command(about = "Telegram Business stand-in bot", long_about = None)]
struct Cli {
    /// Config file path (default: STANDIN_CONFIG_PATH or ~/.standin/config.json)
    #[arg(long, short, value_name = "PATH")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() {
    // .env is a local-run convenience; production uses real env vars.
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Err(e) = run(cli.config).await {
        log::error!("standin failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, path) = lib::config::load_config(config_path)?;
    log::info!("using config {}", path.display());
    lib::server::run(config).await
}
