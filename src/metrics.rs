//! Per-subsystem sync metrics.
//!
//! Counters are OpenTelemetry instruments labelled by `subsystem`, exported
//! through a Prometheus registry that the metrics endpoint encodes on each
//! scrape.  Readiness is tracked separately.

use std::sync::atomic::{AtomicBool, Ordering};

use opentelemetry::metrics::{Counter, Meter, MeterProvider as _};
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};

use crate::reconcile::PassSummary;
use crate::types::Subsystem;

pub struct Metrics {
    registry: Registry,
    // Dropping the provider shuts the exporter down.
    _provider: SdkMeterProvider,
    passes: Counter<u64>,
    abandoned: Counter<u64>,
    operations_applied: Counter<u64>,
    operations_failed: Counter<u64>,
    finished: [AtomicBool; 3],
}

fn counter(meter: &Meter, name: &'static str, description: &'static str) -> Counter<u64> {
    meter.u64_counter(name).with_description(description).build()
}

fn labels(subsystem: Subsystem) -> [KeyValue; 1] {
    [KeyValue::new("subsystem", subsystem.as_str())]
}

fn slot(subsystem: Subsystem) -> usize {
    match subsystem {
        Subsystem::Mesh => 0,
        Subsystem::Routes => 1,
        Subsystem::Firewall => 2,
    }
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .without_scope_info()
            .without_target_info()
            .build()?;
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        let meter = provider.meter("meshsync");

        Ok(Self {
            passes: counter(&meter, "meshsync_sync_passes", "Reconciliation passes started."),
            abandoned: counter(
                &meter,
                "meshsync_sync_passes_abandoned",
                "Reconciliation passes abandoned after a collaborator failure.",
            ),
            operations_applied: counter(
                &meter,
                "meshsync_sync_operations_applied",
                "Individual changes applied to a subsystem.",
            ),
            operations_failed: counter(
                &meter,
                "meshsync_sync_operations_failed",
                "Individual changes that failed.",
            ),
            finished: Default::default(),
            registry,
            _provider: provider,
        })
    }

    pub fn pass_started(&self, subsystem: Subsystem) {
        self.passes.add(1, &labels(subsystem));
    }

    pub fn pass_completed(&self, subsystem: Subsystem, summary: &PassSummary) {
        let labels = labels(subsystem);
        self.operations_applied.add(summary.applied, &labels);
        self.operations_failed.add(summary.failed, &labels);
        self.finished[slot(subsystem)].store(true, Ordering::Release);
    }

    pub fn pass_abandoned(&self, subsystem: Subsystem) {
        self.abandoned.add(1, &labels(subsystem));
        self.finished[slot(subsystem)].store(true, Ordering::Release);
    }

    /// True once every subsystem has finished at least one pass, whether it
    /// converged or was abandoned.
    pub fn ready(&self) -> bool {
        self.finished.iter().all(|f| f.load(Ordering::Acquire))
    }

    /// Prometheus text exposition of every counter.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Current value of an exported counter family for one subsystem.
    #[cfg(test)]
    pub fn counter_value(&self, family: &str, subsystem: Subsystem) -> u64 {
        self.registry
            .gather()
            .iter()
            .filter(|f| f.get_name() == family)
            .flat_map(|f| f.get_metric().iter())
            .filter(|m| {
                m.get_label()
                    .iter()
                    .any(|l| l.get_name() == "subsystem" && l.get_value() == subsystem.as_str())
            })
            .map(|m| m.get_counter().get_value() as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_after_every_subsystem_finishes_a_pass() {
        let metrics = Metrics::new().unwrap();
        assert!(!metrics.ready());

        metrics.pass_started(Subsystem::Mesh);
        metrics.pass_completed(Subsystem::Mesh, &PassSummary::default());
        metrics.pass_started(Subsystem::Routes);
        metrics.pass_abandoned(Subsystem::Routes);
        assert!(!metrics.ready());

        metrics.pass_started(Subsystem::Firewall);
        assert!(!metrics.ready());
        metrics.pass_completed(Subsystem::Firewall, &PassSummary { applied: 3, failed: 0 });
        assert!(metrics.ready());
    }

    #[test]
    fn counters_are_labelled_by_subsystem() {
        let metrics = Metrics::new().unwrap();
        metrics.pass_started(Subsystem::Routes);
        metrics.pass_completed(Subsystem::Routes, &PassSummary { applied: 2, failed: 1 });
        metrics.pass_started(Subsystem::Mesh);
        metrics.pass_abandoned(Subsystem::Mesh);

        assert_eq!(metrics.counter_value("meshsync_sync_passes_total", Subsystem::Routes), 1);
        assert_eq!(
            metrics.counter_value("meshsync_sync_operations_applied_total", Subsystem::Routes),
            2
        );
        assert_eq!(
            metrics.counter_value("meshsync_sync_operations_failed_total", Subsystem::Routes),
            1
        );
        assert_eq!(
            metrics.counter_value("meshsync_sync_passes_abandoned_total", Subsystem::Mesh),
            1
        );
        assert_eq!(
            metrics.counter_value("meshsync_sync_passes_abandoned_total", Subsystem::Routes),
            0
        );
    }

    #[test]
    fn renders_prometheus_text() {
        let metrics = Metrics::new().unwrap();
        metrics.pass_started(Subsystem::Firewall);

        let text = metrics.render().unwrap();
        assert!(text.contains("# TYPE meshsync_sync_passes_total counter"));
        assert!(text
            .lines()
            .any(|l| l.starts_with("meshsync_sync_passes_total")
                && l.contains("subsystem=\"firewall\"")
                && l.ends_with(" 1")));
    }
}
