//! querymesh-proxy binary

use clap::{Arg, Command};
use querymesh_proto::{StoreServer, StoreType};
use querymesh_proxy::{
    config, GrpcStoreClient, ProxyConfig, ProxyConfigBuilder, ProxyMetrics, ProxyStore,
    RetrievalStrategy, StaticRegistry, StoreClient, StoreEndpointConfig,
};
use std::process;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "querymesh_proxy=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let matches = Command::new("querymesh-proxy")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Query fan-out proxy for querymesh")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (YAML)"),
        )
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .value_name("ADDRESS")
                .help("gRPC listen address"),
        )
        .arg(
            Arg::new("store")
                .long("store")
                .value_name("ADDRESS")
                .help("Backend store address, repeatable")
                .action(clap::ArgAction::Append),
        )
        .arg(
            Arg::new("selector-label")
                .long("selector-label")
                .value_name("NAME=VALUE")
                .help("External label announced by this proxy, repeatable")
                .action(clap::ArgAction::Append),
        )
        .arg(
            Arg::new("response-timeout")
                .long("response-timeout")
                .value_name("SECONDS")
                .help("Per-stream silence timeout for backend responses")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("retrieval")
                .long("retrieval")
                .value_name("STRATEGY")
                .help("Backend stream retrieval strategy")
                .value_parser(["lazy", "eager"])
                .default_value("lazy"),
        )
        .arg(
            Arg::new("debug-requests")
                .long("debug-requests")
                .help("Log per-store filter decisions")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let config = match build_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            process::exit(1);
        }
    };

    info!("Starting querymesh-proxy:");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Backends: {}", config.stores.len());
    info!("  Selector labels: {}", config.selector_label_set());
    info!("  Retrieval strategy: {:?}", config.retrieval_strategy);
    info!("  Response timeout: {:?}", config.response_timeout);

    if let Err(e) = serve(config).await {
        error!("Proxy error: {}", e);
        process::exit(1);
    }

    info!("querymesh-proxy shutdown complete");
}

/// Build configuration from the config file and command line overrides
fn build_config(matches: &clap::ArgMatches) -> Result<ProxyConfig, String> {
    let mut builder = match matches.get_one::<String>("config") {
        Some(path) => {
            let config = ProxyConfig::from_yaml_file(path)
                .map_err(|e| format!("load config file {}: {}", path, e))?;
            ProxyConfigBuilder::from_config(config)
        }
        None => ProxyConfigBuilder::new(),
    };

    if let Some(listen) = matches.get_one::<String>("listen") {
        let addr = listen
            .parse()
            .map_err(|e| format!("Invalid listen address '{}': {}", listen, e))?;
        builder = builder.listen_addr(addr);
    }

    if let Some(stores) = matches.get_many::<String>("store") {
        for address in stores {
            builder = builder.store(StoreEndpointConfig::new(address));
        }
    }

    if let Some(labels) = matches.get_many::<String>("selector-label") {
        for label in labels {
            let (name, value) = label
                .split_once('=')
                .ok_or_else(|| format!("Invalid selector label '{}': expected NAME=VALUE", label))?;
            builder = builder.selector_label(name, value);
        }
    }

    if let Some(&timeout_secs) = matches.get_one::<u64>("response-timeout") {
        builder = builder.response_timeout(Some(std::time::Duration::from_secs(timeout_secs)));
    }

    if let Some(strategy) = matches.get_one::<String>("retrieval") {
        let strategy = match strategy.as_str() {
            "lazy" => RetrievalStrategy::Lazy,
            "eager" => RetrievalStrategy::Eager,
            _ => return Err(format!("Invalid retrieval strategy: {}", strategy)),
        };
        builder = builder.retrieval_strategy(strategy);
    }

    if matches.get_flag("debug-requests") {
        builder = builder.debug_logging(true);
    }

    let config = builder.build();
    config::validate_config(&config)
        .map_err(|e| format!("Configuration validation failed: {}", e))?;
    Ok(config)
}

async fn serve(config: ProxyConfig) -> anyhow::Result<()> {
    let mut stores: Vec<Arc<dyn StoreClient>> = Vec::with_capacity(config.stores.len());
    for endpoint in &config.stores {
        let client = GrpcStoreClient::connect_lazy(endpoint.to_spec())?;
        info!(addr = %endpoint.address, "registered backend store");
        stores.push(Arc::new(client));
    }

    let prometheus = prometheus::Registry::new();
    let metrics = ProxyMetrics::new(&prometheus)?;

    let proxy = ProxyStore::new(
        Arc::new(StaticRegistry::new(stores)),
        StoreType::Query,
        config.selector_label_set(),
        config.response_timeout,
        config.retrieval_strategy,
        metrics,
    )
    .with_debug_logging(config.debug_logging);

    info!(addr = %config.listen_addr, "serving Store API");
    tonic::transport::Server::builder()
        .add_service(StoreServer::new(proxy))
        .serve_with_shutdown(config.listen_addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
