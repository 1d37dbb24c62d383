use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iot_alerting_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref MESSAGES_PROCESSED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "iot_alerting_messages_processed_total",
            "Messages fully processed, by message type"
        ),
        &["type"]
    )
    .unwrap();
    pub static ref MESSAGES_DROPPED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "iot_alerting_messages_dropped_total",
            "Messages dropped without processing, by reason"
        ),
        &["reason"]
    )
    .unwrap();
    pub static ref MESSAGES_FAILED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iot_alerting_messages_failed_total",
        "Messages whose handling failed part way"
    ))
    .unwrap();
    pub static ref TELEMETRY_RECORDED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iot_alerting_telemetry_recorded_total",
        "Telemetry records persisted"
    ))
    .unwrap();
    pub static ref ALERTS_CREATED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("iot_alerting_alerts_created_total", "Alerts created, by type"),
        &["type"]
    )
    .unwrap();
    pub static ref ALERTS_SUPPRESSED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iot_alerting_alerts_suppressed_total",
        "Alert creations suppressed because an open alert already exists"
    ))
    .unwrap();
    pub static ref ALERTS_RESOLVED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "iot_alerting_alerts_resolved_total",
            "Alerts resolved, by resolver kind"
        ),
        &["by"]
    )
    .unwrap();
    pub static ref COMMANDS_PUBLISHED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iot_alerting_commands_published_total",
        "Commands published to devices"
    ))
    .unwrap();
    pub static ref DB_RETRIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iot_alerting_db_retries_total",
        "Database statements retried after a transient failure"
    ))
    .unwrap();
    pub static ref HANDLE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "iot_alerting_handle_latency_seconds",
            "Time taken to handle one inbound message"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iot_alerting_channel_full_total",
        "Total number of times channel was full (backpressure events)"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MESSAGES_PROCESSED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MESSAGES_DROPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MESSAGES_FAILED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TELEMETRY_RECORDED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ALERTS_CREATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ALERTS_SUPPRESSED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ALERTS_RESOLVED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMANDS_PUBLISHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(HANDLE_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(CHANNEL_FULL_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
