//! Step metrics and tracing spans.
//!
//! With the `metrics` feature, [`METRICS`] records every step outcome and
//! duration plus the time spent waiting for the migration gate, exported in
//! Prometheus text format through [`TidelineMetrics::encode_text`]. With the
//! `tracing` feature, [`tracing_helpers`] provides the spans used around
//! steps, transactions and statements.

#[cfg(feature = "metrics")]
pub use self::otel::{TidelineMetrics, METRICS};

#[cfg(feature = "metrics")]
mod otel {
    use once_cell::sync::Lazy;
    use opentelemetry::metrics::{Counter, Histogram, MeterProvider as _};
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use std::time::Duration;

    pub static METRICS: Lazy<TidelineMetrics> = Lazy::new(TidelineMetrics::init);

    pub struct TidelineMetrics {
        pub registry: prometheus::Registry,
        // Owns the reader; dropping it shuts the exporter down.
        _provider: SdkMeterProvider,
        steps_total: Counter<u64>,
        step_duration: Histogram<f64>,
        lock_wait: Histogram<f64>,
    }

    impl TidelineMetrics {
        pub fn init() -> Self {
            let registry = prometheus::Registry::new();
            let builder = SdkMeterProvider::builder();
            let provider = match opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
            {
                Ok(exporter) => builder.with_reader(exporter).build(),
                Err(e) => {
                    log::warn!("prometheus exporter unavailable, metrics are not exported: {e}");
                    builder.build()
                }
            };
            let meter = provider.meter("tideline");

            let steps_total = meter
                .u64_counter("tideline_steps_total")
                .with_description("Migration steps executed, by direction and outcome")
                .build();
            let step_duration = meter
                .f64_histogram("tideline_step_duration_seconds")
                .with_description("Wall-clock duration of migration step bodies")
                .build();
            let lock_wait = meter
                .f64_histogram("tideline_lock_wait_seconds")
                .with_description("Time spent waiting for the migration gate")
                .build();

            Self {
                registry,
                _provider: provider,
                steps_total,
                step_duration,
                lock_wait,
            }
        }

        pub fn record_step(&self, direction: &'static str, outcome: &'static str, elapsed: Duration) {
            self.steps_total.add(
                1,
                &[
                    KeyValue::new("direction", direction),
                    KeyValue::new("outcome", outcome),
                ],
            );
            self.step_duration
                .record(elapsed.as_secs_f64(), &[KeyValue::new("direction", direction)]);
        }

        pub fn observe_lock_wait(&self, elapsed: Duration) {
            self.lock_wait.record(elapsed.as_secs_f64(), &[]);
        }

        /// Render all collected metrics in the Prometheus text exposition format
        pub fn encode_text(&self) -> Result<String, prometheus::Error> {
            prometheus::TextEncoder::new().encode_to_string(&self.registry.gather())
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{debug_span, info_span, Span};

    pub fn step_span(version: i64, direction: &'static str) -> Span {
        info_span!("tideline.step", version, direction)
    }

    pub fn lock_span(key: i64) -> Span {
        info_span!("tideline.lock", key)
    }

    pub fn transaction_span(operation: &str) -> Span {
        debug_span!("tideline.transaction", operation)
    }

    pub fn statement_span(statement: &str) -> Span {
        let head: String = statement.trim_start().chars().take(64).collect();
        debug_span!("tideline.statement", statement = %head)
    }

    pub fn connect_span() -> Span {
        debug_span!("tideline.connect")
    }
}
