// Prometheus metrics for the gateway
//
// Exposes metrics on /metrics HTTP endpoint:
// - Command outcomes and latencies (counter, histogram)
// - Validation rejections (counter)
// - Login attempts by mode and outcome (counter)
// - Current auth status and in-flight commands (gauge)

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Gauge, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use std::sync::{Arc, Mutex, PoisonError};

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Command metrics
    pub static ref COMMANDS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("cli_commands_total", "Total number of CLI commands handled"),
        &["outcome"]
    ).expect("Failed to create commands total metric");

    pub static ref COMMAND_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new("cli_command_duration_seconds", "CLI command duration in seconds")
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
        &["outcome"]
    ).expect("Failed to create command duration metric");

    pub static ref COMMANDS_IN_FLIGHT: IntGauge = IntGauge::new(
        "cli_commands_in_flight",
        "Number of CLI processes currently running"
    ).expect("Failed to create in-flight commands metric");

    pub static ref VALIDATION_REJECTIONS_TOTAL: IntCounter = IntCounter::new(
        "validation_rejections_total",
        "Total number of commands rejected by validation"
    ).expect("Failed to create validation rejections metric");

    // Auth metrics
    pub static ref LOGIN_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("login_attempts_total", "Total number of login attempts"),
        &["mode", "outcome"]
    ).expect("Failed to create login attempts metric");

    pub static ref AUTH_STATUS: IntGauge = IntGauge::new(
        "auth_status",
        "Session status (0=unauthenticated, 1=authenticating, 2=authenticated, 3=expired)"
    ).expect("Failed to create auth status metric");

    pub static ref SERVER_UPTIME_SECONDS: Gauge = Gauge::new(
        "server_uptime_seconds",
        "Server uptime in seconds"
    ).expect("Failed to create server uptime metric");
}

/// Initialize metrics registry
///
/// Later calls are no-ops.
pub fn init() -> prometheus::Result<()> {
    static REGISTERED: Mutex<bool> = Mutex::new(false);
    let mut registered = REGISTERED.lock().unwrap_or_else(PoisonError::into_inner);
    if *registered {
        return Ok(());
    }

    REGISTRY.register(Box::new(COMMANDS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMAND_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(COMMANDS_IN_FLIGHT.clone()))?;
    REGISTRY.register(Box::new(VALIDATION_REJECTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LOGIN_ATTEMPTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(AUTH_STATUS.clone()))?;
    REGISTRY.register(Box::new(SERVER_UPTIME_SECONDS.clone()))?;
    *registered = true;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
