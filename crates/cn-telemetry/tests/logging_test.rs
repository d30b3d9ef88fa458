use cn_telemetry::logging::{self, LogFormat};

#[test]
fn init_is_idempotent() {
    // The second call finds a global subscriber and silently no-ops.
    logging::init_logging("test-service", "debug");
    logging::init_logging("test-service", "info");

    tracing::info!(key = "value", "human-readable log line");
}

#[test]
fn json_after_text_is_a_no_op() {
    logging::init_logging_json("test-service-json", "info");
    tracing::info!(key = "value", "json log line");
}

#[test]
fn log_format_parses_config_values() {
    assert_eq!("text".parse::<LogFormat>(), Ok(LogFormat::Text));
    assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
    assert!("xml".parse::<LogFormat>().is_err());
}

#[test]
fn init_dispatches_on_format() {
    logging::init("dispatch-test", "warn", LogFormat::Json);
    logging::init("dispatch-test", "warn", LogFormat::Text);
}
