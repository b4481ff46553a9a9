use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use switchyard::{
    GatewayService, GracefulShutdown, HealthChecker, HttpClientAdapter, HttpHandler,
    adapters::{ConfiguredDiscovery, StaticTokenValidator},
    config::{ServerConfig, ServerConfigValidator, load_config},
    metrics,
    ports::{auth::TokenValidator, http_client::HttpClient},
    tracing_setup,
};
use tracing::Instrument;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "switchyard.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "switchyard.yaml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "switchyard.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        eprintln!("CryptoProvider::install_default reported an error: {e:?}; continuing");
    }

    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    tracing_setup::init_tracing(&config.logging)?;
    metrics::init_metrics()?;

    ServerConfigValidator::validate(&config)
        .map_err(|e| eyre!("{e}"))
        .context("Invalid configuration")?;
    tracing::info!("Loaded configuration from {config_path}");

    let discovery = ConfiguredDiscovery::from_config(&config.discovery)
        .context("Failed to create discovery backend")?;
    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client")?);
    let validator = token_validator(&config);

    let gateway = Arc::new(
        GatewayService::new(&config, discovery.backend(), http_client.clone(), validator)
            .context("Failed to build gateway")?,
    );

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let mut background = gateway.start_background_tasks(graceful_shutdown.token());

    if config.health_check.enabled {
        match discovery.static_catalogue() {
            Some(catalogue) => {
                let checker = HealthChecker::new(catalogue, http_client, &config.health_check)
                    .context("Failed to create health checker")?;
                let token = graceful_shutdown.token();
                background.push(tokio::spawn(
                    async move { checker.run(token).await }
                        .instrument(tracing_setup::component_span("health_checker", None)),
                ));
            }
            None => tracing::info!("Active health checks skipped; Consul reports health itself"),
        }
    }

    {
        let signals = graceful_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = signals.run_signal_handler().await {
                tracing::error!("Signal handler failed: {:?}", e);
            }
        });
    }

    for route in gateway.router().routes() {
        tracing::info!(
            prefix = %route.prefix,
            service = %route.service,
            auth_required = route.auth_required,
            "Configured route"
        );
    }

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!("Switchyard gateway listening on {}", addr);

    let app = HttpHandler::new(gateway).into_router();
    let shutdown_signal = {
        let shutdown = graceful_shutdown.clone();
        async move {
            let reason = shutdown.wait_for_shutdown_signal().await;
            tracing::info!("Shutdown signal received: {:?}", reason);
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error")?;

    let outcome = graceful_shutdown.drain(background).await;
    tracing::info!("Graceful shutdown completed ({:?})", outcome);
    Ok(())
}

fn token_validator(config: &ServerConfig) -> Option<Arc<dyn TokenValidator>> {
    if config.auth.tokens.is_empty() {
        None
    } else {
        Some(Arc::new(StaticTokenValidator::new(config.auth.tokens.clone())))
    }
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("Configuration validation: OK");
            println!();
            println!("Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Routes: {}", config.routes.len());
            println!("   • Services: {}", config.routed_services().join(", "));
            println!("   • Health Checks: {}", config.health_check.enabled);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("Common fixes:");
            println!("   • Verify listen address format (e.g., '127.0.0.1:3000')");
            println!("   • Use humantime durations such as '250ms', '5s' or '1m'");
            println!("   • Give every path_prefix a leading '/' and keep prefixes unique");
            std::process::exit(1);
        }
    }
}
