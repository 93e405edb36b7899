use crate::config::OtlpConfig;
use crate::stats::Outcome;
use opentelemetry::metrics::{Counter, Histogram, MeterProvider as _};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::reader::{DefaultAggregationSelector, DefaultTemporalitySelector};
use opentelemetry_sdk::metrics::{MeterProvider, PeriodicReader};
use opentelemetry_sdk::runtime::Tokio;
use std::time::Duration;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

const METER: &str = "uservault-bot";

/// Pushes backend request counts and latencies to an OTLP collector.
pub struct RequestExporter {
    requests: Counter<u64>,
    latency: Histogram<f64>,
}

impl RequestExporter {
    /// `Ok(None)` when export is switched off or has nowhere to go.
    pub fn from_config(config: &OtlpConfig) -> Result<Option<Self>, AnyError> {
        let endpoint = match config.endpoint.as_deref().map(str::trim) {
            Some(endpoint) if config.enabled && !endpoint.is_empty() => endpoint,
            _ => return Ok(None),
        };

        let provider = otlp_provider(endpoint, config)?;
        let meter = provider.meter(METER);
        global::set_meter_provider(provider);

        Ok(Some(Self {
            requests: meter.u64_counter("uservault.backend.requests").init(),
            latency: meter.f64_histogram("uservault.backend.latency_ms").init(),
        }))
    }

    pub fn record(&self, outcome: Outcome, action: &str, latency: Duration) {
        let labels = [
            KeyValue::new("action", action.to_string()),
            KeyValue::new("outcome", outcome.as_str()),
        ];
        self.requests.add(1, &labels);
        self.latency.record(latency.as_secs_f64() * 1000.0, &labels);
    }
}

fn otlp_provider(endpoint: &str, config: &OtlpConfig) -> Result<MeterProvider, AnyError> {
    let headers = config
        .auth_value
        .clone()
        .map(|value| (config.auth_header.clone(), value))
        .into_iter()
        .collect();

    let exporter = opentelemetry_otlp::new_exporter()
        .http()
        .with_endpoint(endpoint)
        .with_headers(headers)
        .build_metrics_exporter(
            Box::new(DefaultAggregationSelector::new()),
            Box::new(DefaultTemporalitySelector::new()),
        )?;
    let reader = PeriodicReader::builder(exporter, Tokio)
        .with_interval(Duration::from_millis(config.push_interval_ms))
        .build();
    Ok(MeterProvider::builder().with_reader(reader).build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_or_endpointless_config_builds_nothing() {
        let disabled = OtlpConfig {
            endpoint: Some("https://otlp.example/v1/metrics".to_string()),
            ..OtlpConfig::default()
        };
        assert!(RequestExporter::from_config(&disabled).unwrap().is_none());

        let blank = OtlpConfig {
            enabled: true,
            endpoint: Some("  ".to_string()),
            ..OtlpConfig::default()
        };
        assert!(RequestExporter::from_config(&blank).unwrap().is_none());
    }
}
