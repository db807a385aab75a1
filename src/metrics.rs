use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with an HTTP scrape listener on `addr`
/// and register the engine's metrics at zero.
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;

    // Pre-register counters so they appear even before the first increment.
    counter!("api_requests_total").absolute(0);
    counter!("api_retries_total").absolute(0);
    counter!("signals_emitted_total").absolute(0);
    counter!("entries_blocked_total").absolute(0);
    counter!("engine_step_errors_total").absolute(0);
    counter!("profit_withdrawals_total").absolute(0);

    gauge!("open_positions").set(0.0);
    gauge!("account_balance").set(0.0);
    gauge!("last_price").set(0.0);
    gauge!("profit_reserved").set(0.0);

    // Histogram is lazily created on first record; force creation.
    histogram!("slow_cycle_seconds").record(0.0);

    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}
