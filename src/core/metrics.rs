use metrics_exporter_prometheus::PrometheusBuilder;

use crate::core::config::Settings;

/// Installs the Prometheus recorder with its own scrape listener. The worker
/// has no other HTTP surface, so the exporter serves /metrics itself.
pub fn init(settings: &Settings) -> anyhow::Result<()> {
    let telemetry = settings.telemetry();
    if !telemetry.prometheus_enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], telemetry.prometheus_port))
        .install()?;
    tracing::info!(port = telemetry.prometheus_port, "Prometheus scrape endpoint listening");
    Ok(())
}
