/// Metrics collection and reporting module
///
/// Installs the Prometheus recorder behind the `metrics` facade and renders
/// the exposition text for `GET /metrics`. Counters are emitted where things
/// happen (worker, listener, authorizer); this module only names them.

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{RelayError, RelayResult};

/// Prometheus handle, set once by [`init`]
static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder; a no-op when disabled or already installed
pub fn init(metrics_enabled: bool) -> RelayResult<()> {
    if !metrics_enabled {
        debug!("Metrics disabled");
        return Ok(());
    }
    let mut installed = false;
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| RelayError::Config(format!("Failed to install metrics recorder: {}", e)))?;
        installed = true;
        Ok::<_, RelayError>(handle)
    })?;
    if !installed {
        return Ok(());
    }

    describe_metrics();
    info!("Prometheus metrics recorder installed");
    Ok(())
}

/// Prometheus text for the current values, None when metrics are off
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

fn describe_metrics() {
    describe_counter!("relay_events_received_total", "Vendor events decoded and queued, by kind");
    describe_counter!("relay_events_rejected_total", "Vendor logs skipped at decode time, by reason");
    describe_counter!("relay_events_total", "Queued events handled, by kind and outcome");
    describe_counter!(
        "relay_orphaned_payments_total",
        "Purchases whose tokens were pulled but got no locker"
    );
    describe_counter!("relay_mail_failures_total", "Emails the SMTP relay did not accept");
    describe_counter!("relay_locker_open_total", "Locker-open requests, by outcome");
    describe_gauge!("relay_queue_depth", "Events waiting in the relay queue");
}
