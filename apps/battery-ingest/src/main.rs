mod ack;
mod arbitration;
mod config;
mod error;
mod http;
mod mqtt;
mod report;
mod stats;
mod store;

use crate::arbitration::Arbiter;
use crate::config::{Config, StorageBackend};
use crate::http::HttpState;
use crate::stats::IngestStats;
use crate::store::{MemoryReadingStore, PgReadingStore, ReadingStore};
use anyhow::{Context, Result};
use futures::future;
use std::sync::Arc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,battery_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "battery-ingest"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn build_store(config: &Config) -> Result<Arc<dyn ReadingStore>> {
    match config.storage_backend {
        StorageBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("database url missing for postgres backend")?;
            let store = PgReadingStore::connect(url, config.db_pool_size)
                .await
                .context("failed to connect to postgres")?;
            store
                .ensure_schema()
                .await
                .context("failed to bootstrap readings schema")?;
            Ok(Arc::new(store))
        }
        StorageBackend::Memory => {
            tracing::warn!("using in-memory reading store; data is lost on restart");
            Ok(Arc::new(MemoryReadingStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let store = build_store(&config).await?;
    let stats = Arc::new(IngestStats::new());

    let (ack_tx, ack_rx) = ack::channel();
    let ack_tx = if config.enable_mqtt_listener {
        Some(ack_tx)
    } else {
        None
    };

    let ack_handle = if config.enable_mqtt_listener {
        let ack_config = config.clone();
        let ack_stats = stats.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = ack::run_ack_manager(ack_config, ack_stats, ack_rx).await {
                tracing::error!(error=%err, "ack manager exited");
            }
        }))
    } else {
        None
    };

    let arbiter = Arbiter::new(
        store,
        config.arbitration_policy,
        config.reopen_window(),
        ack_tx,
        stats,
    );
    tracing::info!(
        policy = config.arbitration_policy.as_str(),
        reopen_window_secs = config.reopen_window_secs,
        backend = ?config.storage_backend,
        "battery ingest starting"
    );

    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    tracing::info!(bind = %config.http_bind, "HTTP surface listening");
    let app = http::router(HttpState {
        arbiter: arbiter.clone(),
    });
    let http_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    let mqtt_handle = if config.enable_mqtt_listener {
        let config_clone = config.clone();
        let arbiter_clone = arbiter.clone();
        Some(tokio::spawn(async move {
            mqtt::run_listener(config_clone, arbiter_clone).await
        }))
    } else {
        None
    };

    tokio::select! {
        res = http_handle => {
            match res {
                Ok(Err(err)) => tracing::error!(error=%err, "HTTP server failed"),
                Err(err) => tracing::error!(error=%err, "HTTP task failed"),
                Ok(Ok(())) => {}
            }
        }
        _ = async {
            if let Some(handle) = mqtt_handle {
                match handle.await {
                    Ok(Err(err)) => tracing::warn!(error=%err, "MQTT listener exited"),
                    Err(err) => tracing::warn!(error=%err, "MQTT task failed"),
                    Ok(Ok(())) => {}
                }
            } else {
                future::pending::<()>().await;
            }
        } => {}
        _ = async {
            if let Some(handle) = ack_handle {
                let _ = handle.await;
            } else {
                future::pending::<()>().await;
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::normalize_otlp_http_endpoint;

    #[test]
    fn otlp_endpoint_gets_traces_path() {
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/v1/traces"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(normalize_otlp_http_endpoint("  "), "");
    }
}
