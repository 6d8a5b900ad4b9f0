use anyhow::{anyhow, Result};
use dohtoll::config::LedgerConfig;
use dohtoll::dns::race::Racer;
use dohtoll::dns::{HttpTransport, Resolver};
use dohtoll::{Config, Gate, SharedConfig};
use is_terminal::IsTerminal;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    let mut first_args = std::env::args().take(2);
    let (program_name, config_file) = (
        first_args.next().unwrap_or("dohtoll".to_string()),
        first_args.next(),
    );

    let config = config_init(&program_name, config_file)?;
    let ledger = config.ledger().await?;

    let client = reqwest::Client::builder()
        .timeout(config.upstream_timeout)
        .build()?;
    let racer = Racer::new(
        Arc::new(HttpTransport::new(client)),
        config.upstream_timeout,
    );
    let resolver = Resolver::new(config.upstreams.clone(), racer);
    let gate = Gate::new(ledger.clone(), resolver);

    if config.ledger != LedgerConfig::Free {
        tracing::warn!("no payment provider configured, top-ups are disabled");
    }

    for upstream in &config.upstreams {
        tracing::info!("racing upstream {upstream}");
    }
    tracing::info!("API listening on {}", &config.bind_addr);
    let api_server = dohtoll::api::new(config.clone(), gate, ledger, None);
    let api_handle = tokio::spawn(api_server);

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("quitting from signal");
        },
        Ok(api_res) = api_handle => {
            if let Err(err) = api_res {
                return Err(err.into())
            }
        }
    }
    tracing::info!("goodbye");
    Ok(())
}

fn tracing_init() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_ansi(std::io::stdout().is_terminal()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dohtoll=info".into()),
        )
        .init();
}

fn config_init(program_name: &str, config_file: Option<String>) -> Result<SharedConfig> {
    match config_file {
        None => Err(anyhow!("usage: {program_name} /path/to/config.json")),
        Some(config_file) => {
            tracing::debug!("loaded config from {config_file}");
            let config = Config::try_from_file(&config_file)?;
            Ok(Arc::new(config))
        }
    }
}
