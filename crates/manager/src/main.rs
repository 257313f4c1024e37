//! Convoy controller manager.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use kube::Client;
use tracing::{info, warn};

use convoy_apis::{ClusterObjectTemplate, ObjectTemplate};
use convoy_cache::DynamicCache;

mod controller;
mod queue;

#[derive(Parser, Debug)]
#[command(name = "convoy-manager", version, about = "Convoy reconciliation engine")]
struct Cli {
    /// Reconcile workers per controller.
    #[arg(long = "workers", default_value_t = 2)]
    workers: usize,

    /// Package image deployed into hosted clusters as remote phase manager.
    /// The hosted-cluster controller only runs when this is set.
    #[arg(long = "remote-phase-package-image")]
    remote_phase_package_image: Option<String>,
}

fn init_tracing() {
    let env = std::env::var("CONVOY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CONVOY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CONVOY_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let client = Client::try_default().await?;
    info!("connected to cluster");
    let cache = Arc::new(DynamicCache::new(client.clone()));

    let templates = controller::run_template_controller::<ObjectTemplate>(
        "objecttemplates",
        client.clone(),
        cache.clone(),
        cli.workers,
    );
    let cluster_templates = controller::run_template_controller::<ClusterObjectTemplate>(
        "clusterobjecttemplates",
        client.clone(),
        cache.clone(),
        cli.workers,
    );

    let hosted = async {
        match cli.remote_phase_package_image {
            Some(image) => controller::run_hosted_controller(client.clone(), image, cli.workers).await,
            None => futures::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = templates => warn!("objecttemplates controller stopped"),
        _ = cluster_templates => warn!("clusterobjecttemplates controller stopped"),
        _ = hosted => warn!("hostedclusters controller stopped"),
    }

    Ok(())
}
