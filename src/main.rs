use anyhow::Context;
use clap::{Parser, Subcommand};
use extremum_bot::api::{
    AlertSink, BinanceClient, BinanceKlineFeed, CoinMarketCapClient, LogSink, TelegramNotifier,
};
use extremum_bot::config::{Credentials, Settings};
use extremum_bot::discovery::UniverseDiscovery;
use extremum_bot::engine::Engine;
use extremum_bot::persistence::{JsonStateStore, MemoryStore, StateStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "extremum_bot")]
#[command(about = "Extremum breakout/reversal signal bot", long_about = None)]
struct Cli {
    /// Settings file (TOML); missing file means defaults plus environment
    #[arg(short, long, default_value = "bot.toml")]
    config: PathBuf,

    /// Override the directory holding persisted state
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Log alerts instead of sending them; credentials not required
    #[arg(long)]
    dry_run: bool,

    /// Keep state in memory only
    #[arg(long)]
    no_persist: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a universe from exchange listings and CoinMarketCap ranks
    Discover {
        /// Write the `universe = [...]` line here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();

    if let Some(Command::Discover { output }) = &cli.command {
        return discover(&cli.config, output.as_deref()).await;
    }

    tracing::info!("🚀 Extremum bot starting");

    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;

    let alerts: Arc<dyn AlertSink> = if cli.dry_run {
        tracing::info!("Dry run: alerts are logged only");
        Arc::new(LogSink)
    } else {
        let credentials = Credentials::from_env().context("alert credentials")?;
        Arc::new(TelegramNotifier::new(
            credentials.telegram_token,
            credentials.telegram_chat_id,
        ))
    };

    let store: Arc<dyn StateStore> = if cli.no_persist {
        Arc::new(MemoryStore::new())
    } else {
        let dir = cli
            .state_dir
            .unwrap_or_else(|| PathBuf::from(&settings.state_dir));
        Arc::new(JsonStateStore::open(&dir).await?)
    };

    let market = Arc::new(BinanceClient::new(
        settings.exchange.rest_base_url.clone(),
        settings.exchange.requests_per_minute,
    )?);
    let feed = Arc::new(BinanceKlineFeed::new(
        settings.exchange.ws_base_url.clone(),
        settings.exchange.final_bars_only,
    ));

    let engine = Engine::bootstrap(settings, market, feed, alerts, store).await?;

    tracing::info!("\nPress Ctrl+C to stop...\n");

    engine
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}

async fn discover(config: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let settings = Settings::read(config)
        .with_context(|| format!("loading settings from {}", config.display()))?;
    let discovery = &settings.discovery;
    discovery.validate()?;

    let spot = BinanceClient::new(
        discovery.spot_base_url.clone(),
        settings.exchange.requests_per_minute,
    )?;
    let futures = BinanceClient::new(
        settings.exchange.rest_base_url.clone(),
        settings.exchange.requests_per_minute,
    )?;
    let cmc = CoinMarketCapClient::new(discovery.cmc_base_url.clone(), discovery.api_key()?)?;

    let universe = UniverseDiscovery::new(spot, futures, cmc, discovery.clone())
        .discover()
        .await?;
    for candidate in &universe {
        tracing::info!(
            "  #{:<4} {:<14} ${}",
            candidate.rank,
            candidate.symbol,
            candidate.price
        );
    }

    let symbols: Vec<&str> = universe.iter().map(|c| c.symbol.as_str()).collect();
    let line = format!("universe = {:?}\n", symbols);
    match output {
        Some(path) => {
            tokio::fs::write(path, line)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            tracing::info!("💾 Universe written to {}", path.display());
        }
        None => print!("{}", line),
    }
    Ok(())
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("extremum_bot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
