use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "meshtund", about = "overlay mesh VPN data plane daemon")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "meshtun.toml")]
    config: String,
}

#[tokio::main]
async fn main() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_line_number(true)
            .with_file(true)
            .finish(),
    )
    .unwrap();

    let args = Args::parse();
    let cfg = match meshtun::daemon::config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("failed to load config {}: {:?}", args.config, e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "starting meshtund on {} as {}",
        cfg.interface.listen_addr,
        cfg.interface.vpn_addr
    );

    if let Err(e) = meshtun::daemon::run(cfg).await {
        tracing::error!("daemon error: {}", e);
        std::process::exit(1);
    }
}
