#![allow(missing_docs, clippy::unwrap_used, clippy::indexing_slicing)]

//! Exercises the process-wide setup. Kept in a single test, since the global subscriber
//! can only be installed once per test binary.

use json_log_formatter::{setup_logger, update_context, LoggerConfig, LoggerError, Severity};

#[test]
fn setup_installs_and_reconfigures_global_logging() {
    assert!(matches!(
        update_context([("request_id", "abc")]),
        Err(LoggerError::Configuration(_))
    ));
    assert!(matches!(
        setup_logger(LoggerConfig::default()),
        Err(LoggerError::Configuration(_))
    ));

    let service = setup_logger(LoggerConfig {
        app: Some("svc".to_string()),
        ..LoggerConfig::new("1.0.0")
    })
    .unwrap();
    tracing::info!("hello");

    update_context([("request_id", "abc")]).unwrap();
    let snapshot = service.shared_context().load();
    assert_eq!(snapshot.context["request_id"], "abc");
    assert_eq!(snapshot.context["app"], "svc");

    // A second call reconfigures the installed pipeline, replacing its context.
    let reconfigured = setup_logger(LoggerConfig {
        app: Some("svc-v2".to_string()),
        logging_level: Severity::Warning,
        ..LoggerConfig::new("2.0.0")
    })
    .unwrap();
    let snapshot = service.shared_context().load();
    assert_eq!(snapshot.context["app"], "svc-v2");
    assert_eq!(snapshot.context["version"], "2.0.0");
    assert!(!snapshot.context.contains_key("request_id"));
    assert_eq!(snapshot.min_severity, Severity::Warning);

    reconfigured.update_context([("stage", "load")]);
    assert_eq!(service.shared_context().load().context["stage"], "load");
}
