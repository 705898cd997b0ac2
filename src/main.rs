use clap::Parser;
use lodestone::dispatch::Dispatcher;
use lodestone::geoip::GeoIp;
use lodestone::resolver::Resolver;
use lodestone::session::{self, CredentialStore, ProbeRegistry};
use lodestone::{api, Config, Controller};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lodestone=info")),
        )
        .init();

    let config = Config::parse();
    info!(
        "starting lodestone v{} (geoip: {}, credentials: {})",
        env!("CARGO_PKG_VERSION"),
        config.geoip_dir.display(),
        config.probes_file.display(),
    );

    let controller = Arc::new(Controller {
        resolver: Resolver::from_system(),
        geoip: GeoIp::open(&config.geoip_dir),
        registry: ProbeRegistry::new(),
        dispatcher: Dispatcher::new(),
        credentials: CredentialStore::new(),
    });

    tokio::spawn(session::watch_credentials(
        controller.credentials.clone(),
        config.probes_file.clone(),
    ));

    api::serve(controller, &config.host, config.port).await?;
    Ok(())
}
