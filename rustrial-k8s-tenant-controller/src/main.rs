#[macro_use]
extern crate log;

use anyhow::anyhow;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client};
use kube_runtime::{
    reflector::{reflector, store::Writer},
    watcher::{self},
    WatchStreamExt,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use prometheus_exporter::{start_prometheus_metrics_server, HealthMetrics};
use std::{net::SocketAddr, path::PathBuf};

mod config;
mod delegation;
mod errors;
#[cfg(test)]
mod fake_store;
mod index;
mod managed_fields;
mod migration;
mod namespaces;
mod project;
mod prometheus_exporter;
mod rbac;
mod sharding;
mod store;
mod template;
mod tenant_controller;
mod tenant_modifications;
mod utils;

use config::{Config, DEFAULT_CONFIG_FILE};
use tenant_controller::TenantController;

/// The K8s field manager name.
///
/// Note, changing the field manager name is a breaking change, fields owned by
/// the old name are neither compared nor released anymore.
const MANAGER: &'static str = "rustrial-tenant-controller";

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn ok<T, E>(_: T) -> Result<(), E> {
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install the rustls crypto provider"))?;
    env_logger::init();
    let config_file: PathBuf = env_var("CONFIG_FILE")
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string())
        .into();
    let config = Config::load(config_file.as_path())?;
    config.validate()?;
    info!("loaded configuration from {}", config_file.display());

    let metrics_addr = env_var("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
    let metrics_port = env_var("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
    let metrics_addr: SocketAddr = format!("{}:{}", metrics_addr, metrics_port).parse()?;
    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
    opentelemetry::global::set_meter_provider(provider);
    let health = HealthMetrics::new(&registry)?;
    let prometheus_metrics_exporter = start_prometheus_metrics_server(metrics_addr, registry);

    let client = Client::try_default().await?;
    let namespace_watcher = watcher::watcher(
        Api::<Namespace>::all(client.clone()),
        watcher::Config::default(),
    );
    let writer: Writer<Namespace> = Default::default();
    let namespace_cache = writer.as_reader();
    let namespace_reflector = reflector(writer, namespace_watcher)
        .applied_objects()
        .try_for_each(ok);
    let controller = TenantController::new(client, config, health, namespace_cache).start();
    info!("start controllers ...");
    tokio::select! {
       _ = controller => (),
       r = namespace_reflector => r?,
       r = prometheus_metrics_exporter => r?,
    };
    Ok(())
}
