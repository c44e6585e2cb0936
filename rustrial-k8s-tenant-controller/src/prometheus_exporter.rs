use std::{convert::Infallible, net::SocketAddr};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    body::Incoming, header::CONTENT_TYPE, server::conn::http1, service::service_fn, Request,
    Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use rustrial_k8s_tenant_controller_apis::TenantHealth;
use tokio::net::TcpListener;

use crate::utils::metric_name;

/// Per tenant health gauges, one time series per tenant and state.
#[derive(Clone)]
pub(crate) struct HealthMetrics {
    healthy: IntGaugeVec,
    unhealthy: IntGaugeVec,
}

impl HealthMetrics {
    pub(crate) fn new(registry: &Registry) -> prometheus::Result<Self> {
        let healthy = IntGaugeVec::new(
            Opts::new(
                metric_name("tenant_healthy"),
                "The tenant status about healthy condition",
            ),
            &["name"],
        )?;
        let unhealthy = IntGaugeVec::new(
            Opts::new(
                metric_name("tenant_unhealthy"),
                "The tenant status about unhealthy condition",
            ),
            &["name"],
        )?;
        registry.register(Box::new(healthy.clone()))?;
        registry.register(Box::new(unhealthy.clone()))?;
        Ok(Self { healthy, unhealthy })
    }

    pub(crate) fn set(&self, tenant: &str, health: Option<TenantHealth>) {
        let (healthy, unhealthy) = match health {
            Some(TenantHealth::Healthy) => (1, 0),
            Some(TenantHealth::Unhealthy) => (0, 1),
            None => return,
        };
        self.healthy.with_label_values(&[tenant]).set(healthy);
        self.unhealthy.with_label_values(&[tenant]).set(unhealthy);
    }

    pub(crate) fn remove(&self, tenant: &str) {
        // missing series are fine
        let _ = self.healthy.remove_label_values(&[tenant]);
        let _ = self.unhealthy.remove_label_values(&[tenant]);
    }
}

fn encode(registry: &Registry) -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut result = Vec::new();
    let response = match encoder.encode(&metric_families, &mut result) {
        Ok(_) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, encoder.format_type())
            .body(Full::new(Bytes::from(result))),
        Err(e) => {
            error!("{}", e);
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::new()))
        }
    };
    response.unwrap_or_else(|e| {
        error!("{}", e);
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

async fn serve_req(
    _req: Request<Incoming>,
    registry: Registry,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(encode(&registry))
}

/// Serve the metrics of `registry` on `addr`, every path returns all metrics.
pub(crate) async fn start_prometheus_metrics_server(
    addr: SocketAddr,
    registry: Registry,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Serving metrics on http://{}/metrics", addr);
    loop {
        let (stream, peer) = listener.accept().await?;
        let registry = registry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| serve_req(req, registry.clone()));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("metrics connection from {} failed: {}", peer, e);
            }
        });
    }
}
