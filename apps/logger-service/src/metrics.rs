use once_cell::sync::Lazy;
use prometheus::{IntCounterVec, Opts};
use topic_bus::metrics::REGISTRY;

pub static ENTRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("logger_entries_total", "log entries received by outcome"),
        &["result"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn gather() -> Vec<u8> {
    Lazy::force(&ENTRIES);
    topic_bus::metrics::gather()
}
