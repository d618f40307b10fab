use prometheus::{IntCounter, IntCounterVec, IntGauge};
use std::sync::LazyLock;

pub static CONNECTIONS_ACCEPTED: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "smtpd_connections_accepted_total",
        "total number of connections accepted"
    )
    .expect("failed to register smtpd_connections_accepted_total")
});

pub static CONNECTIONS_REFUSED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "smtpd_connections_refused_total",
        "total number of connections closed without any protocol interaction",
        &["reason"]
    )
    .expect("failed to register smtpd_connections_refused_total")
});

pub static CONNECTIONS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    prometheus::register_int_gauge!(
        "smtpd_connections_active",
        "number of currently open connections"
    )
    .expect("failed to register smtpd_connections_active")
});

pub static WATCHDOG_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "smtpd_watchdog_expired_total",
        "total number of connections closed by the idle watchdog"
    )
    .expect("failed to register smtpd_watchdog_expired_total")
});

pub static HANDLER_POOL_IDLE: LazyLock<IntGauge> = LazyLock::new(|| {
    prometheus::register_int_gauge!(
        "smtpd_handler_pool_idle",
        "number of idle connection handlers held in pools"
    )
    .expect("failed to register smtpd_handler_pool_idle")
});

pub static COMMANDS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "smtpd_command_total",
        "total number of commands processed, by verb",
        &["verb"]
    )
    .expect("failed to register smtpd_command_total")
});

pub static HOOK_VERDICTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "smtpd_hook_verdict_total",
        "total number of hook results, by capability and verdict",
        &["capability", "verdict"]
    )
    .expect("failed to register smtpd_hook_verdict_total")
});
