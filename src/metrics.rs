//! Prometheus metrics: a collector over the dispatcher's atomic counters
//! plus a minimal exposition endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tracing::info;

use crate::ldap::stats::Stats;

const NAMESPACE: &str = "idmd";

pub struct StatsCollector {
    stats: Arc<Stats>,
    descs: Vec<Desc>,
}

struct MetricSpec {
    name: &'static str,
    help: &'static str,
    gauge: bool,
}

const METRICS: &[MetricSpec] = &[
    MetricSpec {
        name: "ldap_connections_total",
        help: "Total number of accepted LDAP connections",
        gauge: false,
    },
    MetricSpec {
        name: "ldap_connections_current",
        help: "Number of currently open LDAP connections",
        gauge: true,
    },
    MetricSpec {
        name: "ldap_connections_max",
        help: "Maximum number of concurrently open LDAP connections observed",
        gauge: true,
    },
    MetricSpec {
        name: "ldap_binds_total",
        help: "Total number of LDAP bind requests",
        gauge: false,
    },
    MetricSpec {
        name: "ldap_unbinds_total",
        help: "Total number of LDAP unbind requests",
        gauge: false,
    },
    MetricSpec {
        name: "ldap_searches_total",
        help: "Total number of LDAP search requests",
        gauge: false,
    },
];

impl StatsCollector {
    pub fn new(stats: Arc<Stats>) -> Self {
        let descs = METRICS
            .iter()
            .map(|spec| {
                Desc::new(
                    format!("{NAMESPACE}_{}", spec.name),
                    spec.help.to_string(),
                    Vec::new(),
                    Default::default(),
                )
                .expect("static metric descriptor")
            })
            .collect();
        StatsCollector { stats, descs }
    }
}

impl Collector for StatsCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let snapshot = self.stats.snapshot();
        let values = [
            snapshot.conns,
            snapshot.conns_current,
            snapshot.conns_max,
            snapshot.binds,
            snapshot.unbinds,
            snapshot.searches,
        ];

        let mut families = Vec::with_capacity(METRICS.len());
        for (spec, value) in METRICS.iter().zip(values) {
            let opts = Opts::new(format!("{NAMESPACE}_{}", spec.name), spec.help);
            if spec.gauge {
                let gauge = IntGauge::with_opts(opts).expect("static metric");
                gauge.set(value as i64);
                families.extend(gauge.collect());
            } else {
                let counter = IntCounter::with_opts(opts).expect("static metric");
                counter.inc_by(value);
                families.extend(counter.collect());
            }
        }
        families
    }
}

/// Build the registry with the LDAP stats collector registered.
pub fn registry(stats: Arc<Stats>) -> Registry {
    let registry = Registry::new();
    registry
        .register(Box::new(StatsCollector::new(stats)))
        .expect("register stats collector");
    registry
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> String {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .unwrap_or_default()
}

/// Serve /metrics on the given address until the process exits.
pub async fn serve_metrics(addr: SocketAddr, registry: Arc<Registry>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(listen_addr = %addr, "metrics enabled, starting listener");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_reports_counter_values() {
        let stats = Arc::new(Stats::new());
        stats.count_conn();
        stats.count_bind();
        stats.count_bind();

        let registry = registry(stats);
        let rendered = TextEncoder::new()
            .encode_to_string(&registry.gather())
            .unwrap();
        assert!(rendered.contains("idmd_ldap_connections_total 1"));
        assert!(rendered.contains("idmd_ldap_binds_total 2"));
        assert!(rendered.contains("idmd_ldap_connections_current 1"));
    }
}
